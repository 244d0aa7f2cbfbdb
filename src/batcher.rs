//! The Batcher producer stage (`spec.md` §4.3).
//!
//! Accepts individual packets, fills the currently open [`PBatch`], arms a
//! one-shot timer on the first packet of an otherwise-empty batch, and emits
//! the batch downstream on capacity or timeout. Downstream delivery is a
//! `flume` unbounded channel — fire-and-forget, matching the teacher's own
//! `TransmissionPipelineProducer` → `TransmissionPipelineConsumer` handoff in
//! `pipeline.rs`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::accel::AccelProvider;
use crate::batch::{AnnoAccess, AnnoHandle, Layout, LayoutBuilder, PBatch, PSliceRange, Packet};
use crate::config::BatcherConfig;
use crate::error::Result;
use crate::pool::BatchPool;

/// Accumulates `req_anno`/`req_slice_range` calls from downstream stages
/// before a [`Batcher`] is built (`spec.md` §6, "Upward API from Batcher to
/// producers"). Registration is only valid before [`BatcherBuilder::build`].
pub struct BatcherBuilder {
    config: BatcherConfig,
    layout: LayoutBuilder,
}

impl BatcherBuilder {
    pub fn new(config: BatcherConfig) -> Result<Self> {
        config.validate()?;
        let mut layout = LayoutBuilder::new();
        if config.force_pktlens {
            layout.force_lengths();
        }
        let mut builder = Self { config, layout };
        if builder.config.has_default_anno_window() {
            let (begin, end) = (builder.config.ann_begin, builder.config.ann_end);
            builder.layout.req_anno(begin, end, AnnoAccess::READ)?;
        }
        if builder.config.has_default_slice_range() {
            let (begin, end) = (builder.config.slice_begin, builder.config.slice_end);
            builder
                .layout
                .req_slice_range(PSliceRange::new(begin, 0, end - begin))?;
        }
        Ok(builder)
    }

    pub fn req_anno(&mut self, begin: usize, end: usize, mode: AnnoAccess) -> Result<AnnoHandle> {
        self.layout.req_anno(begin, end, mode)
    }

    pub fn req_slice_range(&mut self, psr: PSliceRange) -> Result<()> {
        self.layout.req_slice_range(psr)
    }

    /// Finalize layout, pre-fill the batch pool, and return a live
    /// [`Batcher`] plus the downstream [`flume::Receiver`] batches are
    /// emitted on.
    pub fn build(
        self,
        provider: Arc<dyn AccelProvider>,
        nthreads: usize,
        per_thread_cap: usize,
        overflow_cap: usize,
    ) -> Result<(Arc<Batcher>, flume::Receiver<PBatch>)> {
        let layout = Arc::new(self.layout.finalize(self.config.capacity));
        let pool = BatchPool::new(
            layout.clone(),
            provider.clone(),
            nthreads,
            per_thread_cap,
            overflow_cap,
            self.config.batch_prealloc,
            self.config.mt_pushers,
        )?;
        let (sender, receiver) = flume::unbounded();

        let batcher = Arc::new(Batcher {
            config: self.config,
            layout,
            pool,
            open: Mutex::new(OpenSlot {
                batch: None,
                generation: 0,
            }),
            sender,
            dropped: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
        });
        Ok((batcher, receiver))
    }
}

struct OpenSlot {
    batch: Option<PBatch>,
    generation: u64,
}

/// The Batcher producer (`spec.md` §4.3). Cheaply `Clone`-able (an `Arc`
/// wrapper) so the per-batch timer task can hold its own handle.
pub struct Batcher {
    config: BatcherConfig,
    layout: Arc<Layout>,
    /// No lock on the hot path: each `thread_id` only ever touches its own
    /// ring inside `pool` (`spec.md` §4.1, §5 "Per-thread pools are mutated
    /// only by their owning thread").
    pool: BatchPool,
    open: Mutex<OpenSlot>,
    sender: flume::Sender<PBatch>,
    dropped: AtomicU64,
    emitted: AtomicU64,
}

impl Batcher {
    pub fn get_anno_stride(&self) -> usize {
        self.layout.anno_stride
    }

    pub fn get_slice_stride(&self) -> usize {
        self.layout.slice_stride
    }

    pub fn get_anno_offset(&self, handle: AnnoHandle) -> Option<usize> {
        self.layout.anno_offset(handle)
    }

    pub fn get_slice_offset(&self, psr: PSliceRange) -> Option<usize> {
        self.layout.slice_offset(psr)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Ingress operation (`spec.md` §4.3 "push"). `_port` identifies the
    /// ingress port an upstream multi-output element delivered this packet
    /// on; single-input pipelines may pass `0`.
    pub fn push(self: &Arc<Self>, thread_id: usize, _port: u32, packet: Packet) {
        if self.config.test {
            trace!(thread_id, _port, plen = packet.len(), "batcher: push");
        }

        let mut open = self.open.lock().unwrap();

        if open.batch.is_none() {
            match self.pool.alloc(thread_id) {
                Ok(batch) => open.batch = Some(batch),
                Err(err) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(?err, "batcher: pool exhausted, dropping packet");
                    return;
                }
            }
        }

        let was_empty = open.batch.as_ref().map(|b| b.npkts == 0).unwrap_or(false);
        {
            let batch = open.batch.as_mut().expect("checked out above");
            batch.append(packet);
        }

        if was_empty && self.config.timeout_ms > 0 {
            open.generation = open.generation.wrapping_add(1);
            self.arm_timer(thread_id, open.generation);
        }

        let full = open
            .batch
            .as_ref()
            .map(|b| b.npkts >= b.capacity())
            .unwrap_or(false);
        if full {
            self.emit_locked(&mut open, thread_id);
        }
    }

    /// `timer_fire`: emits the open batch iff it is still the one observed
    /// at arm time and is non-empty (`spec.md` §4.3, §9 "Timer vs.
    /// capacity-emission race").
    fn timer_fire(self: &Arc<Self>, thread_id: usize, arm_generation: u64) {
        let mut open = self.open.lock().unwrap();
        if open.generation != arm_generation {
            trace!("batcher: timer fired for a stale batch generation, ignoring");
            return;
        }
        let non_empty = open.batch.as_ref().map(|b| b.npkts > 0).unwrap_or(false);
        if non_empty {
            self.emit_locked(&mut open, thread_id);
        }
    }

    fn arm_timer(self: &Arc<Self>, thread_id: usize, generation: u64) {
        let this = Arc::clone(self);
        let timeout = Duration::from_millis(self.config.timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.timer_fire(thread_id, generation);
        });
    }

    /// Detach the open batch, check out its replacement, and send the
    /// detached batch downstream. Caller holds `open`'s lock.
    fn emit_locked(self: &Arc<Self>, open: &mut OpenSlot, thread_id: usize) {
        let Some(batch) = open.batch.take() else {
            return;
        };
        open.generation = open.generation.wrapping_add(1);

        match self.pool.alloc(thread_id) {
            Ok(fresh) => open.batch = Some(fresh),
            Err(err) => {
                debug!(?err, "batcher: could not check out replacement batch");
            }
        }

        self.emitted.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(batch).is_err() {
            warn!("batcher: downstream receiver dropped, batch discarded");
        }
    }

    /// `kill_batch`/`recycle_batch`: return a fully-drained batch to the
    /// pool. Downstream stages call this once they've released their share.
    pub fn recycle(&self, thread_id: usize, batch: PBatch) {
        self.pool.recycle(thread_id, batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::SimAccelProvider;

    fn provider() -> Arc<dyn AccelProvider> {
        Arc::new(SimAccelProvider::new())
    }

    fn pkt(len: usize) -> Packet {
        Packet::new(vec![0u8; len])
    }

    // P3: capacity emission, no timer.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn capacity_emission_emits_exactly_one_full_batch() {
        let config = BatcherConfig {
            capacity: 4,
            timeout_ms: 100,
            ..Default::default()
        };
        let (batcher, rx) = BatcherBuilder::new(config)
            .unwrap()
            .build(provider(), 1, 4, 4)
            .unwrap();

        for _ in 0..4 {
            batcher.push(0, 0, pkt(64));
        }

        let emitted = rx.recv_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(emitted.npkts, 4);
        assert!(rx.try_recv().is_err());
        assert_eq!(batcher.emitted_count(), 1);
    }

    // P4: timer emission for a partially-filled batch.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_emission_emits_partial_batch() {
        let config = BatcherConfig {
            capacity: 8,
            timeout_ms: 30,
            ..Default::default()
        };
        let (batcher, rx) = BatcherBuilder::new(config)
            .unwrap()
            .build(provider(), 1, 4, 4)
            .unwrap();

        for _ in 0..3 {
            batcher.push(0, 0, pkt(64));
        }

        let emitted = rx.recv_timeout(Duration::from_millis(200)).unwrap();
        assert_eq!(emitted.npkts, 3);
    }

    // P5: a capacity emission must not leave a stale timer that double-emits.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn capacity_emission_suppresses_stale_timer() {
        let config = BatcherConfig {
            capacity: 2,
            timeout_ms: 20,
            ..Default::default()
        };
        let (batcher, rx) = BatcherBuilder::new(config)
            .unwrap()
            .build(provider(), 1, 4, 4)
            .unwrap();

        batcher.push(0, 0, pkt(64));
        batcher.push(0, 0, pkt(64)); // capacity emission, bumps generation

        let first = rx.recv_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(first.npkts, 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err(), "stale timer must not re-emit");
        assert_eq!(batcher.emitted_count(), 1);
    }

    // scenario 4: pre-allocated pool batches satisfy pushes with no fresh alloc.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn prealloc_pool_absorbs_two_full_batches() {
        let config = BatcherConfig {
            capacity: 4,
            timeout_ms: 0,
            batch_prealloc: 2,
            ..Default::default()
        };
        let (batcher, rx) = BatcherBuilder::new(config)
            .unwrap()
            .build(provider(), 1, 4, 4)
            .unwrap();

        for _ in 0..8 {
            batcher.push(0, 0, pkt(64));
        }
        let _ = rx.recv_timeout(Duration::from_millis(50)).unwrap();
        let _ = rx.recv_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(batcher.dropped_count(), 0);
    }
}
