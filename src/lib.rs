//! `accelbatch`: a user-space packet-batching, accelerator-dispatch and
//! netmap-style egress pipeline.
//!
//! Four cooperating pieces, in dependency order: a per-thread [`pool`] of
//! reusable [`batch::PBatch`] objects, the [`batcher::Batcher`] that fills
//! and emits them, a [`compute`] stage that dispatches a data-parallel
//! operation (IPv4 longest-prefix-match, by example) against a batch's
//! device-mirrored memory, and a [`tx`] stage that drains eligible packets
//! into a netmap-style TX ring.
//!
//! The accelerator runtime and the NIC driver are both out of scope; they
//! are represented as the [`accel::AccelProvider`] and [`ring::TxRingProvider`]
//! trait boundaries. This crate does not install a `tracing` subscriber —
//! that is a decision for the binary embedding it (see `demos/ipv4_lpm_pipeline.rs`).

pub mod accel;
pub mod batch;
pub mod batcher;
pub mod compute;
pub mod config;
pub mod error;
pub mod pool;
pub mod ring;
pub mod tx;

pub use batch::{PBatch, Packet};
pub use batcher::{Batcher, BatcherBuilder};
pub use config::BatcherConfig;
pub use error::{ConfigError, Error, Result};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::accel::SimAccelProvider;
    use crate::batch::Packet;
    use crate::batcher::BatcherBuilder;
    use crate::compute::{LpmComputeStage, IPV4_DST_OFFSET};
    use crate::config::BatcherConfig;
    use crate::ring::{SimTxRingProvider, TxRingProvider};
    use crate::tx::TxStage;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> u32 {
        u32::from_be_bytes([a, b, c, d])
    }

    fn eth_ipv4_packet(dst: [u8; 4]) -> Packet {
        let mut data = vec![0u8; 14 + 20];
        data[IPV4_DST_OFFSET..IPV4_DST_OFFSET + 4].copy_from_slice(&dst);
        Packet::new(data)
    }

    // Scenario 3: end-to-end Batcher -> LPM compute -> TX filter, in ingress order.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn scenario3_lpm_routes_then_tx_filters_by_port() {
        let provider: Arc<dyn crate::accel::AccelProvider> = Arc::new(SimAccelProvider::new());
        let mut builder = BatcherBuilder::new(BatcherConfig {
            capacity: 4,
            timeout_ms: 0,
            ..Default::default()
        })
        .unwrap();
        let stage = LpmComputeStage::configure(
            &mut builder,
            provider.clone(),
            4,
            &[(ip(10, 0, 0, 0), 8, 1), (ip(0, 0, 0, 0), 0, 2)],
        )
        .unwrap();
        let port_handle = TxStage::configure_port_filter(&mut builder).unwrap();
        let (batcher, rx) = builder.build(provider.clone(), 1, 4, 4).unwrap();

        let dsts = [[10, 1, 2, 3], [10, 4, 5, 6], [8, 8, 8, 8], [9, 9, 9, 9]];
        for dst in dsts {
            batcher.push(0, 0, eth_ipv4_packet(dst));
        }

        let mut batch = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        stage.bpush(&mut batch);

        let rings: Arc<dyn TxRingProvider> = Arc::new(SimTxRingProvider::new(4));
        let (_tx_batcher_link, tx_rx) = flume::unbounded();
        let mut tx_stage = TxStage::new(
            batcher.clone(),
            0,
            tx_rx,
            provider.clone(),
            rings.clone(),
            Some((port_handle, 1)),
            4,
        );

        let mut q = Some((batch, 0));
        tx_stage.run_task(&mut q).await;

        assert_eq!(tx_stage.transmitted_count(), 2);
        assert_eq!(tx_stage.dropped_ineligible_count(), 2);
    }

    // Scenario 6: four producer threads, distinct Batchers, one shared TX stage.
    // `PER_THREAD` is a multiple of `capacity` so every packet lands in a
    // capacity-emitted batch and no timer is needed to flush a tail batch.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn scenario6_concurrent_producers_share_one_tx_stage() {
        const THREADS: usize = 4;
        const CAPACITY: usize = 16;
        const BATCHES_PER_THREAD: usize = 10;
        const PER_THREAD: usize = CAPACITY * BATCHES_PER_THREAD;

        let rings: Arc<dyn TxRingProvider> =
            Arc::new(SimTxRingProvider::new(THREADS * PER_THREAD));

        let mut handles = Vec::new();

        for t in 0..THREADS {
            let provider: Arc<dyn crate::accel::AccelProvider> = Arc::new(SimAccelProvider::new());
            let builder = BatcherBuilder::new(BatcherConfig {
                capacity: CAPACITY,
                timeout_ms: 0,
                ..Default::default()
            })
            .unwrap();
            let (batcher, rx) = builder.build(provider.clone(), 1, 4, 4).unwrap();
            let rings = rings.clone();

            let handle = tokio::spawn(async move {
                for i in 0..PER_THREAD {
                    batcher.push(0, 0, Packet::new(vec![t as u8, i as u8]));
                }

                let mut tx_stage = TxStage::new(
                    batcher.clone(),
                    0,
                    rx,
                    provider,
                    rings,
                    None,
                    BATCHES_PER_THREAD,
                );
                let mut q = None;
                tx_stage.run_task(&mut q).await;
                assert!(q.is_none(), "single burst should drain every emitted batch");
                (batcher.dropped_count(), tx_stage.transmitted_count())
            });
            handles.push(handle);
        }

        let mut total_dropped = 0u64;
        let mut total_transmitted = 0u64;
        for h in handles {
            let (dropped, transmitted) = h.await.unwrap();
            total_dropped += dropped;
            total_transmitted += transmitted;
        }

        assert_eq!(
            total_transmitted + total_dropped,
            (THREADS * PER_THREAD) as u64
        );
    }
}
