//! Wires a Batcher, an IPv4 LPM compute stage and a batched transmit stage
//! together against the in-process simulators, exercising the public API
//! end to end (mirrors the teacher's own thin example binaries under
//! `zenoh/examples/zenoh-net/`).

use std::sync::Arc;
use std::time::Duration;

use accelbatch::accel::{AccelProvider, SimAccelProvider};
use accelbatch::batch::Packet;
use accelbatch::batcher::BatcherBuilder;
use accelbatch::compute::{LpmComputeStage, IPV4_DST_OFFSET};
use accelbatch::config::BatcherConfig;
use accelbatch::ring::{SimTxRingProvider, TxRingProvider};
use accelbatch::tx::TxStage;

fn ip(a: u8, b: u8, c: u8, d: u8) -> u32 {
    u32::from_be_bytes([a, b, c, d])
}

fn eth_ipv4_packet(dst: [u8; 4]) -> Packet {
    let mut data = vec![0u8; 14 + 20 + 32];
    data[IPV4_DST_OFFSET..IPV4_DST_OFFSET + 4].copy_from_slice(&dst);
    Packet::new(data)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let provider: Arc<dyn AccelProvider> = Arc::new(SimAccelProvider::new());
    let mut builder = BatcherBuilder::new(BatcherConfig {
        capacity: 8,
        timeout_ms: 50,
        ..Default::default()
    })
    .expect("valid config");

    let routes = [
        (ip(10, 0, 0, 0), 8, 1u8),
        (ip(172, 16, 0, 0), 12, 2),
        (ip(0, 0, 0, 0), 0, 3),
    ];
    let stage = LpmComputeStage::configure(&mut builder, provider.clone(), 4, &routes)
        .expect("lpm tree builds and uploads");

    let (batcher, batch_rx) = builder.build(provider.clone(), 1, 4, 4).expect("batcher builds");

    let destinations = [
        [10, 1, 2, 3],
        [172, 16, 5, 5],
        [8, 8, 8, 8],
        [10, 9, 9, 9],
        [1, 1, 1, 1],
    ];
    for dst in destinations {
        batcher.push(0, 0, eth_ipv4_packet(dst));
    }

    let mut batch = batch_rx
        .recv_timeout(Duration::from_millis(100))
        .expect("batch emitted on timeout since fewer than capacity were pushed");
    stage.bpush(&mut batch);

    let sim_rings = Arc::new(SimTxRingProvider::new(16));
    let rings: Arc<dyn TxRingProvider> = sim_rings.clone();
    let (_unused_tx, unused_rx) = flume::unbounded();
    let mut tx_stage = TxStage::new(batcher.clone(), 0, unused_rx, provider, rings, None, 4);

    let mut q = Some((batch, 0));
    tx_stage.run_task(&mut q).await;

    println!(
        "transmitted {} packets ({} filtered out)",
        tx_stage.transmitted_count(),
        tx_stage.dropped_ineligible_count()
    );
    for pkt in sim_rings.sent_packets() {
        println!("sent {} bytes", pkt.len());
    }
}
