//! `PBatch`: the batch data structure (`spec.md` §3, §4.2).
//!
//! A batch is a fixed-capacity vector of packet handles plus three parallel,
//! contiguous regions (lengths, annotations, slices) mirrored in host-pinned
//! and device memory, plus a work cursor describing the bytes currently
//! staged for transfer. The region layout is computed once, by the Batcher,
//! at configuration time (`spec.md` §4.2) and shared read-only by every
//! `PBatch` the Batcher produces — modeled here as an `Arc<Layout>` rather
//! than a raw back-pointer to the whole producer, per the "back-reference
//! `PBatch → producer`" design note.

use std::sync::Arc;

use bitflags::bitflags;

use crate::accel::{AccelProvider, DevMem, HostMem, StreamHandle};
use crate::error::{ConfigError, Result};

/// A contiguous range within a packet that must be gathered into the slice
/// region (`spec.md` §3, "Slice descriptor").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PSliceRange {
    pub start: usize,
    pub start_offset: usize,
    pub len: usize,
    pub end: usize,
}

impl PSliceRange {
    pub fn new(start: usize, start_offset: usize, len: usize) -> Self {
        Self {
            start,
            start_offset,
            len,
            end: start + start_offset + len,
        }
    }
}

bitflags! {
    /// Access mode of an annotation request (`spec.md` §6, `req_anno`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AnnoAccess: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// Opaque handle returned by [`LayoutBuilder::req_anno`], resolved back to a
/// byte offset by [`Layout::anno_offset`] once layout is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnnoHandle(usize);

#[derive(Debug, Clone, Copy)]
struct AnnoRequest {
    begin: usize,
    end: usize,
    mode: AnnoAccess,
}

/// Accumulates annotation and slice requests from downstream stages and
/// finalizes them into a fixed [`Layout`] (`spec.md` §4.2).
#[derive(Debug, Default)]
pub struct LayoutBuilder {
    need_lens: bool,
    anno_requests: Vec<AnnoRequest>,
    slice_requests: Vec<PSliceRange>,
}

/// Byte-distance alignment applied to the annotation and slice strides.
const WORD_ALIGN: usize = std::mem::size_of::<usize>();

fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

impl LayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_lengths(&mut self) {
        self.need_lens = true;
    }

    /// Request that each batch carry per-packet annotation bytes `[begin, end)`.
    pub fn req_anno(&mut self, begin: usize, end: usize, mode: AnnoAccess) -> Result<AnnoHandle> {
        if end < begin {
            return Err(ConfigError::InvalidAnnoRange { begin, end }.into());
        }
        self.anno_requests.push(AnnoRequest { begin, end, mode });
        Ok(AnnoHandle(self.anno_requests.len() - 1))
    }

    /// Request that a slice range be gathered into each batch.
    pub fn req_slice_range(&mut self, psr: PSliceRange) -> Result<()> {
        if psr.end < psr.start + psr.start_offset {
            return Err(ConfigError::InvalidSliceRange {
                begin: psr.start + psr.start_offset,
                end: psr.end,
            }
            .into());
        }
        self.slice_requests.push(psr);
        Ok(())
    }

    pub fn finalize(self, capacity: usize) -> Layout {
        let length_stride = if self.need_lens { 2 } else { 0 };

        let anno_stride = self
            .anno_requests
            .iter()
            .map(|r| r.end - r.begin)
            .max()
            .map(|w| align_up(w, WORD_ALIGN))
            .unwrap_or(0);

        let mut slice_offsets = Vec::with_capacity(self.slice_requests.len());
        let mut running = 0usize;
        for req in &self.slice_requests {
            slice_offsets.push((*req, running));
            running += align_up(req.len, WORD_ALIGN);
        }
        let slice_stride = running;

        let length_offset = 0;
        let anno_offset = length_offset + capacity * length_stride;
        let slice_offset = anno_offset + capacity * anno_stride;

        let anno_handles = self
            .anno_requests
            .iter()
            .map(|r| anno_offset + r.begin)
            .collect();
        let anno_modes = self.anno_requests.iter().map(|r| r.mode).collect();

        Layout {
            capacity,
            length_stride,
            anno_stride,
            slice_stride,
            length_offset,
            anno_offset,
            slice_offset,
            anno_handles,
            anno_modes,
            slice_offsets,
        }
    }
}

/// The finalized, immutable memory layout shared by every `PBatch` a Batcher
/// produces (`spec.md` §4.2). `mem_size = capacity * (length_stride +
/// anno_stride + slice_stride)`.
#[derive(Debug)]
pub struct Layout {
    pub capacity: usize,
    pub length_stride: usize,
    pub anno_stride: usize,
    pub slice_stride: usize,
    length_offset: usize,
    anno_offset: usize,
    slice_offset: usize,
    anno_handles: Vec<usize>,
    anno_modes: Vec<AnnoAccess>,
    slice_offsets: Vec<(PSliceRange, usize)>,
}

impl Layout {
    pub fn mem_size(&self) -> usize {
        self.capacity * (self.length_stride + self.anno_stride + self.slice_stride)
    }

    pub fn has_lens(&self) -> bool {
        self.length_stride > 0
    }

    pub fn has_annos(&self) -> bool {
        self.anno_stride > 0
    }

    pub fn has_slices(&self) -> bool {
        self.slice_stride > 0
    }

    pub fn anno_region_offset(&self) -> usize {
        self.anno_offset
    }

    pub fn slice_region_offset(&self) -> usize {
        self.slice_offset
    }

    pub fn anno_offset(&self, handle: AnnoHandle) -> Option<usize> {
        self.anno_handles.get(handle.0).copied()
    }

    /// The access mode `handle` was registered under (`spec.md` §6,
    /// `req_anno(begin, end, mode)`).
    pub fn anno_mode(&self, handle: AnnoHandle) -> Option<AnnoAccess> {
        self.anno_modes.get(handle.0).copied()
    }

    pub fn slice_offset(&self, psr: PSliceRange) -> Option<usize> {
        self.slice_offsets
            .iter()
            .find(|(r, _)| *r == psr)
            .map(|(_, off)| self.slice_offset + off)
    }

    pub fn slice_requests(&self) -> impl Iterator<Item = PSliceRange> + '_ {
        self.slice_offsets.iter().map(|(r, _)| *r)
    }

    fn length_record(&self, i: usize) -> usize {
        self.length_offset + i * self.length_stride
    }

    fn anno_record(&self, i: usize) -> usize {
        self.anno_offset + i * self.anno_stride
    }

    fn slice_record(&self, i: usize) -> usize {
        self.slice_offset + i * self.slice_stride
    }
}

/// Where a packet's bytes live.
#[derive(Debug)]
pub enum PacketBuffer {
    /// A heap-owned byte buffer.
    Owned(Vec<u8>),
    /// A buffer backed by a slot in a NIC's buffer pool. `unique` tracks
    /// whether any other packet handle aliases the same slot; only a unique
    /// NIC buffer may be swapped (rather than copied) into a TX ring
    /// (`spec.md` §9, "Zero-copy TX via buffer swap").
    Nic { idx: u32, bytes: Vec<u8>, unique: bool },
}

impl PacketBuffer {
    pub fn bytes(&self) -> &[u8] {
        match self {
            PacketBuffer::Owned(b) => b,
            PacketBuffer::Nic { bytes, .. } => bytes,
        }
    }
}

/// Fixed-size per-packet annotation scratch space a packet carries from
/// ingress, independent of any batch annotation region (the batch's
/// `anno_region` is populated *from* this at append time).
pub const PACKET_ANNO_LEN: usize = 16;

/// A single in-flight packet.
#[derive(Debug)]
pub struct Packet {
    pub buffer: PacketBuffer,
    pub anno: [u8; PACKET_ANNO_LEN],
}

impl Packet {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            buffer: PacketBuffer::Owned(data),
            anno: [0u8; PACKET_ANNO_LEN],
        }
    }

    pub fn from_nic_buffer(idx: u32, data: Vec<u8>) -> Self {
        Self {
            buffer: PacketBuffer::Nic {
                idx,
                bytes: data,
                unique: true,
            },
            anno: [0u8; PACKET_ANNO_LEN],
        }
    }

    pub fn data(&self) -> &[u8] {
        self.buffer.bytes()
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }
}

/// The sliding cursor identifying which sub-region is the "current work"
/// about to be, or just, transferred to/from the device (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCursor {
    pub host_offset: usize,
    pub dev_offset: usize,
    pub size: usize,
}

/// One in-flight group of packets (`spec.md` §3).
pub struct PBatch {
    pub layout: Arc<Layout>,
    pub npkts: usize,
    pub pptrs: Vec<Option<Packet>>,
    pub host_mem: HostMem,
    pub dev_mem: DevMem,
    pub work: WorkCursor,
    pub dev_stream: Option<StreamHandle>,
    shared: u32,
}

impl PBatch {
    /// `create_new_batch` + `init_batch_after_create` combined: Click always
    /// called them back to back, so there is no useful intermediate state to
    /// expose.
    pub fn fresh(layout: Arc<Layout>, provider: &dyn AccelProvider) -> Result<Self> {
        let mem_size = layout.mem_size();
        let host_mem = provider.alloc_pinned_host(mem_size)?;
        let dev_mem = provider.alloc_device(mem_size)?;
        let capacity = layout.capacity;
        Ok(Self {
            layout,
            npkts: 0,
            pptrs: (0..capacity).map(|_| None).collect(),
            host_mem,
            dev_mem,
            work: WorkCursor {
                host_offset: 0,
                dev_offset: 0,
                size: mem_size,
            },
            dev_stream: None,
            shared: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    pub fn is_full(&self) -> bool {
        self.npkts >= self.capacity()
    }

    /// Append a packet: length, annotation and slice-range copies, per
    /// `spec.md` §4.3 "Per-packet append". Precondition: not full.
    pub fn append(&mut self, mut packet: Packet) {
        debug_assert!(!self.is_full());
        let idx = self.npkts;
        let plen = packet.len();

        if self.layout.has_lens() {
            let off = self.layout.length_record(idx);
            let len16 = plen.min(i16::MAX as usize) as i16;
            self.host_mem.as_mut_slice()[off..off + 2].copy_from_slice(&len16.to_le_bytes());
        }

        if self.layout.has_annos() {
            let off = self.layout.anno_record(idx);
            let n = self.layout.anno_stride.min(packet.anno.len());
            self.host_mem.as_mut_slice()[off..off + n].copy_from_slice(&packet.anno[..n]);
        }

        if self.layout.has_slices() {
            let record_base = self.layout.slice_record(idx);
            for req in self.layout.slice_requests() {
                if req.start >= plen {
                    // Packet shorter than expected for this range: skip, no error.
                    continue;
                }
                let src_start = req.start + req.start_offset;
                if src_start >= plen {
                    continue;
                }
                let avail = plen - src_start;
                let n = req.len.min(avail);
                let slice_off = self.layout.slice_offset(req).expect("registered slice range");
                let dst = record_base + (slice_off - self.layout.slice_region_offset());
                self.host_mem.as_mut_slice()[dst..dst + n]
                    .copy_from_slice(&packet.buffer.bytes()[src_start..src_start + n]);
            }
        }

        packet.buffer = match packet.buffer {
            PacketBuffer::Nic { idx, bytes, .. } => PacketBuffer::Nic {
                idx,
                bytes,
                unique: true,
            },
            owned => owned,
        };
        self.pptrs[idx] = Some(packet);
        self.npkts += 1;
    }

    /// Read-only view of the host annotation region for all `npkts` packets.
    pub fn host_annos(&self) -> &[u8] {
        let base = self.layout.anno_region_offset();
        &self.host_mem.as_slice()[base..base + self.npkts * self.layout.anno_stride]
    }

    pub fn host_anno(&self, i: usize) -> &[u8] {
        let off = self.layout.anno_record(i);
        &self.host_mem.as_slice()[off..off + self.layout.anno_stride]
    }

    /// Like [`PBatch::host_anno`], but enforces that `handle` was registered
    /// with [`AnnoAccess::READ`] (`spec.md` §6, `req_anno` access mode). Use
    /// this from any downstream stage consuming annotations through a handle
    /// it registered; `host_anno` remains the raw accessor for internal
    /// plumbing and tests.
    pub fn host_anno_for(&self, handle: AnnoHandle, i: usize) -> &[u8] {
        let mode = self
            .layout
            .anno_mode(handle)
            .expect("handle registered at layout build time");
        debug_assert!(
            mode.contains(AnnoAccess::READ),
            "reading an annotation handle that was never registered for READ access"
        );
        self.host_anno(i)
    }

    /// Pull the region a compute stage staged under `work` back to host
    /// memory, synchronizing its stream first (`spec.md` §4.4 "Forwards the
    /// batch ... without synchronizing the stream; synchronization is the
    /// downstream stage's responsibility"). A no-op if no compute stage ever
    /// ran against this batch.
    pub fn sync_from_device(&mut self, provider: &dyn AccelProvider) {
        let Some(stream) = self.dev_stream else {
            return;
        };
        provider.stream_sync(stream);
        let copy_len = self.work.host_offset + self.work.size;
        provider.d2h_async(&self.dev_mem, &mut self.host_mem, copy_len, stream);
    }

    /// `shared == 0` and this is the last (or only) consumer: returns `true`
    /// and the caller must recycle. Otherwise decrements and returns `false`.
    /// (`spec.md` §9, "shared reference count" design note.)
    pub fn release(&mut self) -> bool {
        if self.shared == 0 {
            true
        } else {
            self.shared -= 1;
            false
        }
    }

    /// Fan the batch out to one additional consumer.
    pub fn acquire_additional_share(&mut self) {
        self.shared += 1;
    }

    pub fn shared_count(&self) -> u32 {
        self.shared
    }

    /// `finit_batch_for_recycle`: kill held packets, release the stream,
    /// reset the work cursor to point at the whole region (`spec.md` §3,
    /// lifecycle step 7).
    pub fn finit_for_recycle(&mut self, provider: &dyn AccelProvider) -> Vec<Packet> {
        self.shared = 0;
        if let Some(stream) = self.dev_stream.take() {
            provider.free_stream(stream);
        }
        let killed: Vec<Packet> = self.pptrs.iter_mut().filter_map(|p| p.take()).collect();
        self.npkts = 0;
        self.work = WorkCursor {
            host_offset: 0,
            dev_offset: 0,
            size: self.layout.mem_size(),
        };
        killed
    }

    /// `host_ptr == host_mem && dev_ptr == dev_mem`, used by property P2.
    pub fn cursor_at_region_start(&self) -> bool {
        self.work.host_offset == 0 && self.work.dev_offset == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::SimAccelProvider;

    fn layout_with_anno_and_slice(capacity: usize) -> Arc<Layout> {
        let mut b = LayoutBuilder::new();
        b.req_anno(0, 1, AnnoAccess::WRITE).unwrap();
        b.req_slice_range(PSliceRange::new(14 + 16, 0, 4)).unwrap();
        Arc::new(b.finalize(capacity))
    }

    #[test]
    fn layout_strides_and_mem_size() {
        let layout = layout_with_anno_and_slice(4);
        assert_eq!(layout.anno_stride, WORD_ALIGN.max(1));
        assert_eq!(layout.slice_stride, align_up(4, WORD_ALIGN));
        assert_eq!(
            layout.mem_size(),
            4 * (layout.length_stride + layout.anno_stride + layout.slice_stride)
        );
    }

    fn eth_ipv4_packet(dst: [u8; 4]) -> Packet {
        let mut data = vec![0u8; 14 + 20];
        data[14 + 16..14 + 20].copy_from_slice(&dst);
        Packet::new(data)
    }

    // P6: layout correctness for annotations and slice ranges.
    #[test]
    fn append_populates_slice_region_from_packet_bytes() {
        let layout = layout_with_anno_and_slice(4);
        let provider = SimAccelProvider::new();
        let mut batch = PBatch::fresh(layout.clone(), &provider).unwrap();

        batch.append(eth_ipv4_packet([10, 1, 2, 3]));
        batch.append(eth_ipv4_packet([8, 8, 8, 8]));

        let slice_off = layout
            .slice_offset(PSliceRange::new(14 + 16, 0, 4))
            .unwrap();
        let rec0 = slice_off; // packet 0, record 0
        assert_eq!(&batch.host_mem.as_slice()[rec0..rec0 + 4], &[10, 1, 2, 3]);

        let rec1 = slice_off + layout.slice_stride;
        assert_eq!(&batch.host_mem.as_slice()[rec1..rec1 + 4], &[8, 8, 8, 8]);
    }

    #[test]
    fn append_short_packet_skips_slice_without_error() {
        let layout = layout_with_anno_and_slice(2);
        let provider = SimAccelProvider::new();
        let mut batch = PBatch::fresh(layout, &provider).unwrap();
        batch.append(Packet::new(vec![0u8; 10])); // shorter than slice start
        assert_eq!(batch.npkts, 1);
    }

    // P2: batch roundtrip resets to a fresh-for-use state.
    #[test]
    fn finit_for_recycle_resets_cursor_and_shared() {
        let layout = layout_with_anno_and_slice(4);
        let provider = SimAccelProvider::new();
        let mut batch = PBatch::fresh(layout, &provider).unwrap();
        batch.append(eth_ipv4_packet([1, 2, 3, 4]));
        batch.acquire_additional_share();
        assert!(!batch.release());
        assert!(batch.release());

        let killed = batch.finit_for_recycle(&provider);
        assert_eq!(killed.len(), 1);
        assert_eq!(batch.npkts, 0);
        assert_eq!(batch.shared_count(), 0);
        assert!(batch.cursor_at_region_start());
    }
}
