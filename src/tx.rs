//! The batched transmit stage (`spec.md` §4.5).
//!
//! Walks a batch's packets, filters by a per-packet destination-port
//! annotation, and drains each eligible packet into a TX ring, either by
//! zero-copy buffer swap or `memcpy`. Backpressure from a full ring is
//! handled with the same doubling/reset backoff shape as the teacher's own
//! `Backoff` in `pipeline.rs`, re-capped to microseconds per `spec.md` §4.5.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::accel::AccelProvider;
use crate::batch::{AnnoAccess, AnnoHandle, PBatch, PacketBuffer};
use crate::batcher::{Batcher, BatcherBuilder};
use crate::error::Result;
use crate::ring::TxRingProvider;

/// Exponential backoff capped at 256 µs, doubling on each consecutive stall
/// and resetting to zero on a successful drain (`spec.md` §4.5
/// "Backpressure", §9 "Backoff implementation"; ported from the teacher's
/// `Backoff` in `pipeline.rs`).
#[derive(Debug, Default)]
pub struct Backoff {
    micros: u64,
}

const BACKOFF_CAP_MICROS: u64 = 256;

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current backoff, doubling it for next time, capped at
    /// [`BACKOFF_CAP_MICROS`]. `spec.md` P8: after `k` consecutive stalls,
    /// the scheduled backoff equals `min(2^k, 256)` µs, so the first call
    /// (`k = 1`) yields 2 µs.
    pub fn next(&mut self) -> Duration {
        self.micros = if self.micros == 0 {
            2
        } else {
            (self.micros * 2).min(BACKOFF_CAP_MICROS)
        };
        Duration::from_micros(self.micros)
    }

    pub fn reset(&mut self) {
        self.micros = 0;
    }

    pub fn current_micros(&self) -> u64 {
        self.micros
    }
}

/// Where a transmit attempt against the open batch landed.
enum SendOutcome {
    /// The whole batch was consumed; carries the count of packets actually
    /// transmitted (as opposed to filtered out or dropped).
    Drained,
    /// Rings were full; `cur` records how far the walk got.
    Stalled { cur: usize },
}

/// Consumes batches from a [`Batcher`] (via its downstream channel) and
/// drains eligible packets into a [`TxRingProvider`] (`spec.md` §4.5).
pub struct TxStage {
    batcher: Arc<Batcher>,
    thread_id: usize,
    receiver: flume::Receiver<PBatch>,
    provider: Arc<dyn AccelProvider>,
    rings: Arc<dyn TxRingProvider>,
    /// If set, only packets whose `anno_region[i][0] == my_port` are
    /// transmitted (`spec.md` §4.5 "Per-packet eligibility"). The handle must
    /// have been registered with [`AnnoAccess::READ`].
    port_filter: Option<(AnnoHandle, u8)>,
    burst_budget: usize,
    backoff: Backoff,
    processed: AtomicU64,
    transmitted: AtomicU64,
    dropped_ineligible: AtomicU64,
}

impl TxStage {
    /// Registers the `req_anno(0, 1, read)` the port filter reads from
    /// (`spec.md` §4.5 "Per-packet eligibility"). Call before
    /// [`BatcherBuilder::build`], then pass the returned handle to
    /// [`TxStage::new`] alongside the port to filter on.
    pub fn configure_port_filter(builder: &mut BatcherBuilder) -> Result<AnnoHandle> {
        builder.req_anno(0, 1, AnnoAccess::READ)
    }

    pub fn new(
        batcher: Arc<Batcher>,
        thread_id: usize,
        receiver: flume::Receiver<PBatch>,
        provider: Arc<dyn AccelProvider>,
        rings: Arc<dyn TxRingProvider>,
        port_filter: Option<(AnnoHandle, u8)>,
        burst_budget: usize,
    ) -> Self {
        Self {
            batcher,
            thread_id,
            receiver,
            provider,
            rings,
            port_filter,
            burst_budget,
            backoff: Backoff::new(),
            processed: AtomicU64::new(0),
            transmitted: AtomicU64::new(0),
            dropped_ineligible: AtomicU64::new(0),
        }
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn transmitted_count(&self) -> u64 {
        self.transmitted.load(Ordering::Relaxed)
    }

    pub fn dropped_ineligible_count(&self) -> u64 {
        self.dropped_ineligible.load(Ordering::Relaxed)
    }

    /// `run_task()`: drain up to `burst_budget` fully-sent batches, then
    /// return. A stalled batch is stored and retried on the next call
    /// (`spec.md` §4.5 "Transmit loop").
    pub async fn run_task(&mut self, q: &mut Option<(PBatch, usize)>) {
        let mut drained_this_burst = 0;

        loop {
            if q.is_none() {
                *q = match self.receiver.try_recv() {
                    Ok(batch) => Some((batch, 0)),
                    Err(_) => return,
                };
            }

            let (batch, cur) = q.as_mut().expect("populated above");
            if *cur == 0 {
                batch.sync_from_device(self.provider.as_ref());
            }
            match self.send_batch(batch, *cur) {
                SendOutcome::Drained => {
                    let (batch, _) = q.take().expect("populated above");
                    self.batcher.recycle(self.thread_id, batch);
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    self.backoff.reset();
                    drained_this_burst += 1;
                    if drained_this_burst >= self.burst_budget {
                        return;
                    }
                }
                SendOutcome::Stalled { cur: stalled_at } => {
                    *cur = stalled_at;
                    let delay = self.backoff.next();
                    trace!(?delay, "tx: rings full, backing off");
                    tokio::time::sleep(delay).await;
                    return;
                }
            }
        }
    }

    /// `send_batch`: walk eligible packets from `cur` forward, stopping early
    /// if no TX ring has a free slot.
    fn send_batch(&self, batch: &mut PBatch, mut cur: usize) -> SendOutcome {
        while cur < batch.npkts {
            let eligible = match self.port_filter {
                Some((handle, port)) => batch.host_anno_for(handle, cur).first().copied() == Some(port),
                None => true,
            };

            if !eligible {
                self.dropped_ineligible.fetch_add(1, Ordering::Relaxed);
                cur += 1;
                continue;
            }

            let Some(packet) = batch.pptrs[cur].as_mut() else {
                cur += 1;
                continue;
            };

            let mut sent = false;
            for idx in 0..self.rings.ring_count() {
                self.rings.with_ring(idx, &mut |ring| {
                    if sent {
                        return;
                    }
                    let Some(mut slot) = ring.try_reserve_slot() else {
                        return;
                    };
                    match &mut packet.buffer {
                        PacketBuffer::Nic { idx: buf_idx, unique, .. } if *unique => {
                            slot.swap_buffer(*buf_idx);
                            *unique = false;
                        }
                        _ => slot.write(packet.data()),
                    }
                    sent = true;
                });
                if sent {
                    break;
                }
            }

            if !sent {
                return SendOutcome::Stalled { cur };
            }
            self.transmitted.fetch_add(1, Ordering::Relaxed);
            cur += 1;
        }
        SendOutcome::Drained
    }
}
