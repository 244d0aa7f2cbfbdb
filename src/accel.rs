//! The accelerator provider boundary (`spec.md` §6, "Accelerator provider interface").
//!
//! The accelerator runtime itself — kernel launch, host/device allocators,
//! async streams — is out of scope (`spec.md` §1). This module only defines
//! the seam: an object-safe trait a real CUDA/ROCm/whatever backend would
//! implement, plus [`SimAccelProvider`], an in-process stand-in used by tests
//! and the demo binary so the rest of the crate is exercisable without any
//! real device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::compute::lpm::LpmTree;
use crate::error::{Error, Result};

/// Pinned-host memory region. A real backend would back this with
/// `cudaHostAlloc`-style memory; the simulator uses a plain heap buffer.
#[derive(Debug)]
pub struct HostMem(pub(crate) Vec<u8>);

impl HostMem {
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Device-resident memory region, opaque outside this module's simulator.
#[derive(Debug)]
pub struct DevMem(pub(crate) Vec<u8>);

impl DevMem {
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Handle to an asynchronous accelerator stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub(crate) u64);

/// The device-resident counterpart of an [`LpmTree`](crate::compute::lpm::LpmTree),
/// built once and never mutated (`spec.md` §4.4, "Ancillary LPM build").
#[derive(Debug)]
pub struct DevLpmTree(pub(crate) DevMem);

/// Object-safe boundary to the accelerator runtime (`spec.md` §6).
///
/// Mirrors, one for one, the external function list in `spec.md`:
/// `alloc_page_lock_mem`, `alloc_dev_mem`, `free_page_lock_mem`, `free_dev_mem`,
/// `alloc_stream`, `free_stream`, `stream_sync`, `h2d_async`, `d2h_async`,
/// `launch_lpm_kernel`.
pub trait AccelProvider: Send + Sync {
    fn alloc_pinned_host(&self, size: usize) -> Result<HostMem>;
    fn alloc_device(&self, size: usize) -> Result<DevMem>;
    fn free_pinned_host(&self, mem: HostMem);
    fn free_device(&self, mem: DevMem);

    fn alloc_stream(&self) -> Result<StreamHandle>;
    fn free_stream(&self, stream: StreamHandle);
    fn stream_sync(&self, stream: StreamHandle);

    fn h2d_async(&self, host: &HostMem, dev: &mut DevMem, size: usize, stream: StreamHandle);
    fn d2h_async(&self, dev: &DevMem, host: &mut HostMem, size: usize, stream: StreamHandle);

    /// Upload a host-built LPM tree once, synchronously (`spec.md` §4.4).
    fn upload_lpm_tree(&self, tree: &LpmTree) -> Result<DevLpmTree>;

    /// Enqueue the data-parallel LPM lookup against a batch's device memory.
    ///
    /// `mem` holds `npkts` fixed-stride dest-address records starting at
    /// `slice_offset` (slice region) and the per-packet output byte at
    /// `anno_offset`, stride `anno_stride` (annotation region) — both are
    /// sub-ranges of the same batch device buffer, per `spec.md` §3.
    #[allow(clippy::too_many_arguments)]
    fn launch_lpm_kernel(
        &self,
        tree: &DevLpmTree,
        mem: &mut DevMem,
        slice_offset: usize,
        slice_stride: usize,
        anno_offset: usize,
        anno_stride: usize,
        nbits: u8,
        npkts: usize,
        stream: StreamHandle,
    );
}

/// A synchronous, in-process [`AccelProvider`] used by tests and the demo
/// binary. "Device" memory is just another heap buffer; `h2d_async` /
/// `d2h_async` are synchronous `memcpy`s and `launch_lpm_kernel` runs the CPU
/// lookup immediately — there is no real stream overlap, but the contract
/// (offsets, strides, write-then-advance-cursor) is identical to what a real
/// backend must honor.
#[derive(Debug, Default)]
pub struct SimAccelProvider {
    next_stream: AtomicU64,
    live_streams: Mutex<Vec<u64>>,
}

impl SimAccelProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccelProvider for SimAccelProvider {
    fn alloc_pinned_host(&self, size: usize) -> Result<HostMem> {
        Ok(HostMem(vec![0u8; size]))
    }

    fn alloc_device(&self, size: usize) -> Result<DevMem> {
        Ok(DevMem(vec![0u8; size]))
    }

    fn free_pinned_host(&self, _mem: HostMem) {}

    fn free_device(&self, _mem: DevMem) {}

    fn alloc_stream(&self) -> Result<StreamHandle> {
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        self.live_streams.lock().unwrap().push(id);
        Ok(StreamHandle(id))
    }

    fn free_stream(&self, stream: StreamHandle) {
        self.live_streams.lock().unwrap().retain(|&id| id != stream.0);
    }

    fn stream_sync(&self, _stream: StreamHandle) {}

    fn h2d_async(&self, host: &HostMem, dev: &mut DevMem, size: usize, _stream: StreamHandle) {
        dev.0[..size].copy_from_slice(&host.0[..size]);
    }

    fn d2h_async(&self, dev: &DevMem, host: &mut HostMem, size: usize, _stream: StreamHandle) {
        host.0[..size].copy_from_slice(&dev.0[..size]);
    }

    fn upload_lpm_tree(&self, tree: &LpmTree) -> Result<DevLpmTree> {
        let bytes = tree.to_device_bytes();
        if bytes.is_empty() {
            return Err(Error::ResourceExhausted {
                what: "lpm tree upload",
            });
        }
        Ok(DevLpmTree(DevMem(bytes)))
    }

    fn launch_lpm_kernel(
        &self,
        tree: &DevLpmTree,
        mem: &mut DevMem,
        slice_offset: usize,
        slice_stride: usize,
        anno_offset: usize,
        anno_stride: usize,
        nbits: u8,
        npkts: usize,
        _stream: StreamHandle,
    ) {
        let tree = LpmTree::from_device_bytes(&tree.0 .0, nbits);
        for i in 0..npkts {
            let s = slice_offset + i * slice_stride;
            let addr = u32::from_be_bytes(mem.0[s..s + 4].try_into().unwrap());
            let port = tree.lookup(addr);
            mem.0[anno_offset + i * anno_stride] = port;
        }
    }
}
