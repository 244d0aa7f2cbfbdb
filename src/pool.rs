//! Per-thread batch pools (`spec.md` §4.1, "Batch pool").
//!
//! Each worker thread gets its own single-producer/single-consumer ring of
//! pre-allocated [`PBatch`]es so the hot path never takes a lock. A batch
//! that cannot be returned to its home ring (because the thread that will
//! eventually recycle it differs from the one that allocated it) falls back
//! to a single shared overflow pool guarded by a hand-rolled atomic-CAS
//! spinlock, mirroring Click's `init_pb_pool` thread-indexed allocation with
//! a shared fallback. Per `spec.md` §4.1 "Concurrency policy", that spinlock
//! is only actually taken when `mt_pushers` declares more than one producer
//! thread; a single-threaded pipeline elides it entirely.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ringbuffer_spsc::{ringbuffer, RingBufferReader, RingBufferWriter};

use crate::accel::AccelProvider;
use crate::batch::{Layout, PBatch};
use crate::error::Result;

struct Spinlock {
    locked: AtomicBool,
}

impl Spinlock {
    fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> SpinlockGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinlockGuard { lock: self }
    }
}

struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// One thread's private batch ring, sized at construction and never resized
/// (`spec.md` §4.1, "fixed per-thread pool").
struct ThreadPool {
    writer: RingBufferWriter<PBatch>,
    reader: RingBufferReader<PBatch>,
}

/// The full batch pool for a [`Batcher`](crate::batcher::Batcher): one
/// lock-free ring per worker thread plus a shared overflow ring for batches
/// that don't fit their home thread's ring on recycle.
///
/// `alloc`/`recycle` take `&self`, not `&mut self`: each per-thread ring is
/// wrapped in an [`UnsafeCell`] and accessed without any lock, relying on the
/// caller's contract (mirrored from `spec.md` §5, "Per-thread pools are
/// mutated only by their owning thread") that a given `thread_id` is only
/// ever driven by the one thread that owns it — the same single-writer/
/// single-reader invariant `ringbuffer_spsc` itself relies on internally.
pub struct BatchPool {
    layout: Arc<Layout>,
    provider: Arc<dyn AccelProvider>,
    threads: Vec<UnsafeCell<ThreadPool>>,
    mt_pushers: bool,
    overflow_lock: Spinlock,
    overflow: UnsafeCell<Vec<PBatch>>,
    overflow_cap: usize,
    allocs: AtomicU64,
    recycles: AtomicU64,
    overflow_hits: AtomicU64,
}

// SAFETY: `threads[i]` is touched only by the single thread that owns
// thread-id `i` (caller contract). `overflow` is guarded by `overflow_lock`
// whenever `mt_pushers` is set; when it isn't, the pipeline is declared
// single-threaded so no concurrent access to it can occur either.
unsafe impl Sync for BatchPool {}

impl BatchPool {
    /// `nthreads` private rings, each `per_thread_cap` deep, plus one shared
    /// overflow ring `overflow_cap` deep. `prealloc` batches are eagerly
    /// built and pushed into *every* per-thread ring and into the overflow
    /// ring (Click's `init_pb_pool`, which loops over all `N+1` pools,
    /// `spec.md` §4.1 "Initialization").
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: Arc<Layout>,
        provider: Arc<dyn AccelProvider>,
        nthreads: usize,
        per_thread_cap: usize,
        overflow_cap: usize,
        prealloc: usize,
        mt_pushers: bool,
    ) -> Result<Self> {
        let mut threads = Vec::with_capacity(nthreads);
        for _ in 0..nthreads {
            let (writer, reader) = ringbuffer::<PBatch>(per_thread_cap);
            threads.push(UnsafeCell::new(ThreadPool { writer, reader }));
        }

        let pool = Self {
            layout: layout.clone(),
            provider: provider.clone(),
            threads,
            mt_pushers,
            overflow_lock: Spinlock::new(),
            overflow: UnsafeCell::new(Vec::with_capacity(overflow_cap)),
            overflow_cap,
            allocs: Default::default(),
            recycles: Default::default(),
            overflow_hits: Default::default(),
        };

        for cell in &pool.threads {
            // SAFETY: construction is single-threaded; `pool` is not shared yet.
            let home = unsafe { &mut *cell.get() };
            for _ in 0..prealloc.min(per_thread_cap) {
                let batch = PBatch::fresh(layout.clone(), provider.as_ref())?;
                let _ = home.writer.push(batch); // Some(_) back means the ring is already full
            }
        }

        {
            // SAFETY: construction is single-threaded; `pool` is not shared yet.
            let overflow = unsafe { &mut *pool.overflow.get() };
            for _ in 0..prealloc.min(overflow_cap) {
                overflow.push(PBatch::fresh(layout.clone(), provider.as_ref())?);
            }
        }

        Ok(pool)
    }

    /// Run `f` against the overflow ring, taking the spinlock only if
    /// `mt_pushers` says more than one thread can reach it concurrently
    /// (`spec.md` §4.1 "If `nr_pools ≤ 2` or ... `mt_pushers = false`,
    /// locking is elided entirely").
    fn with_overflow<R>(&self, f: impl FnOnce(&mut Vec<PBatch>) -> R) -> R {
        if self.mt_pushers {
            let _guard = self.overflow_lock.lock();
            // SAFETY: guarded by `overflow_lock`.
            f(unsafe { &mut *self.overflow.get() })
        } else {
            // SAFETY: caller declared a single-threaded pipeline, so no
            // concurrent access to `overflow` can occur.
            f(unsafe { &mut *self.overflow.get() })
        }
    }

    /// Pop a ready batch from `thread_id`'s ring; fall back to the overflow
    /// ring; finally build a fresh batch if both are empty (`spec.md` §4.1,
    /// "alloc_batch"). No lock is taken on the per-thread path.
    pub fn alloc(&self, thread_id: usize) -> Result<PBatch> {
        self.allocs.fetch_add(1, Ordering::Relaxed);

        if let Some(cell) = self.threads.get(thread_id) {
            // SAFETY: `thread_id` is driven only by its owning thread.
            let home = unsafe { &mut *cell.get() };
            if let Some(batch) = home.reader.pull() {
                return Ok(batch);
            }
        }

        if let Some(batch) = self.with_overflow(|overflow| overflow.pop()) {
            self.overflow_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(batch);
        }

        PBatch::fresh(self.layout.clone(), self.provider.as_ref())
    }

    /// Return a finalized batch to its home ring; if full, to the overflow
    /// ring; if that is also full, the batch is dropped and its memory freed
    /// (`spec.md` §4.1, "recycle_batch"). No lock is taken on the per-thread
    /// path.
    pub fn recycle(&self, thread_id: usize, mut batch: PBatch) {
        self.recycles.fetch_add(1, Ordering::Relaxed);
        let killed = batch.finit_for_recycle(self.provider.as_ref());
        drop(killed);

        if let Some(cell) = self.threads.get(thread_id) {
            // SAFETY: `thread_id` is driven only by its owning thread.
            let home = unsafe { &mut *cell.get() };
            match home.writer.push(batch) {
                None => return,
                Some(returned) => {
                    batch = returned;
                }
            }
        }

        let cap = self.overflow_cap;
        self.with_overflow(|overflow| {
            if overflow.len() < cap {
                overflow.push(batch);
            }
            // else: pool exhausted, batch and its device/host memory are dropped.
        });
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocs: self.allocs.load(Ordering::Relaxed),
            recycles: self.recycles.load(Ordering::Relaxed),
            overflow_hits: self.overflow_hits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub allocs: u64,
    pub recycles: u64,
    pub overflow_hits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::SimAccelProvider;
    use crate::batch::LayoutBuilder;

    fn layout() -> Arc<Layout> {
        let mut b = LayoutBuilder::new();
        b.force_lengths();
        Arc::new(b.finalize(8))
    }

    #[test]
    fn alloc_without_prealloc_builds_fresh_batch() {
        let provider: Arc<dyn AccelProvider> = Arc::new(SimAccelProvider::new());
        let pool = BatchPool::new(layout(), provider, 1, 4, 4, 0, false).unwrap();
        let batch = pool.alloc(0).unwrap();
        assert_eq!(batch.npkts, 0);
        assert_eq!(pool.stats().allocs, 1);
    }

    // scenario 4/5: recycle then alloc returns the same batch without a fresh build.
    #[test]
    fn recycle_then_alloc_reuses_batch_from_home_ring() {
        let provider: Arc<dyn AccelProvider> = Arc::new(SimAccelProvider::new());
        let pool = BatchPool::new(layout(), provider, 1, 4, 4, 1, false).unwrap();
        let batch = pool.alloc(0).unwrap();
        pool.recycle(0, batch);
        assert_eq!(pool.stats().recycles, 1);

        let reused = pool.alloc(0).unwrap();
        assert_eq!(reused.npkts, 0);
        assert_eq!(pool.stats().overflow_hits, 0);
    }

    #[test]
    fn overflow_ring_absorbs_batch_when_home_ring_full() {
        let provider: Arc<dyn AccelProvider> = Arc::new(SimAccelProvider::new());
        let pool = BatchPool::new(layout(), provider, 1, 1, 2, 0, false).unwrap();
        let b1 = pool.alloc(0).unwrap();
        let b2 = pool.alloc(0).unwrap();
        pool.recycle(0, b1); // fills the 1-deep home ring
        pool.recycle(0, b2); // home ring full, spills to overflow

        let _r1 = pool.alloc(0).unwrap(); // from home ring
        assert_eq!(pool.stats().overflow_hits, 0);
        let _r2 = pool.alloc(0).unwrap(); // from overflow
        assert_eq!(pool.stats().overflow_hits, 1);
    }

    // spec.md §4.1 "Initialization": every per-thread ring and the overflow
    // ring are pre-filled, not just thread 0's.
    #[test]
    fn prealloc_fills_every_thread_ring_and_overflow() {
        let provider: Arc<dyn AccelProvider> = Arc::new(SimAccelProvider::new());
        let pool = BatchPool::new(layout(), provider, 3, 4, 4, 2, false).unwrap();

        for t in 0..3 {
            let _ = pool.alloc(t).unwrap();
            let _ = pool.alloc(t).unwrap();
            assert_eq!(
                pool.stats().overflow_hits,
                0,
                "thread {t} should be served from its own pre-filled ring"
            );
        }
    }
}
