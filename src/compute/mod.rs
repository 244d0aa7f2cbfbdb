//! The batched compute stage (`spec.md` §4.4), exemplified by IPv4 LPM
//! routing.

pub mod lpm;

use std::sync::Arc;

use tracing::trace;

use crate::accel::{AccelProvider, DevLpmTree};
use crate::batch::{AnnoAccess, AnnoHandle, PBatch, PSliceRange};
use crate::batcher::BatcherBuilder;
use crate::error::Result;
use lpm::LpmTree;

/// Ethernet + IPv4 header offset of the destination address (`spec.md`
/// §4.4, "Preconditions").
pub const IPV4_DST_OFFSET: usize = 14 + 16;

/// A data-parallel LPM lookup stage: registers its annotation/slice needs
/// against a [`BatcherBuilder`] at configuration time, then drives the
/// accelerator once per batch (`spec.md` §4.4 "bpush contract").
pub struct LpmComputeStage {
    provider: Arc<dyn AccelProvider>,
    dev_tree: DevLpmTree,
    nbits: u8,
    anno_handle: AnnoHandle,
    slice_range: PSliceRange,
}

impl LpmComputeStage {
    /// Registers `req_anno(0, 1, write)` and a `req_slice_range` covering the
    /// IPv4 destination address, builds the LPM tree from `routes`, and
    /// uploads it once (`spec.md` §4.4 "Ancillary LPM build").
    pub fn configure(
        builder: &mut BatcherBuilder,
        provider: Arc<dyn AccelProvider>,
        nbits: u8,
        routes: &[(u32, u8, u8)],
    ) -> Result<Self> {
        let anno_handle = builder.req_anno(0, 1, AnnoAccess::WRITE)?;
        let slice_range = PSliceRange::new(IPV4_DST_OFFSET, 0, 4);
        builder.req_slice_range(slice_range)?;

        let mut tree = LpmTree::new(nbits)?;
        for &(addr, mask_len, port) in routes {
            tree.insert(addr, mask_len, port);
        }
        let dev_tree = provider.upload_lpm_tree(&tree)?;

        Ok(Self {
            provider,
            dev_tree,
            nbits,
            anno_handle,
            slice_range,
        })
    }

    /// `bpush(batch)`: launch the LPM kernel, then advance the work cursor to
    /// the annotation region so a downstream copy-back stage knows exactly
    /// what to transfer (`spec.md` §4.4).
    pub fn bpush(&self, batch: &mut PBatch) {
        debug_assert!(
            batch
                .layout
                .anno_mode(self.anno_handle)
                .is_some_and(|mode| mode.contains(AnnoAccess::WRITE)),
            "lpm compute stage writes its annotation handle but it wasn't registered for WRITE"
        );
        let anno_offset = batch
            .layout
            .anno_offset(self.anno_handle)
            .expect("anno handle registered at configure time");
        let slice_offset = batch
            .layout
            .slice_offset(self.slice_range)
            .expect("slice range registered at configure time");
        let anno_stride = batch.layout.anno_stride;
        let slice_stride = batch.layout.slice_stride;
        let npkts = batch.npkts;

        let stream = match batch.dev_stream {
            Some(s) => s,
            None => {
                let s = self
                    .provider
                    .alloc_stream()
                    .expect("stream allocation during steady state");
                batch.dev_stream = Some(s);
                s
            }
        };

        // Mirror the slice region the Batcher just filled host-side before
        // the kernel reads it.
        self.provider.h2d_async(
            &batch.host_mem,
            &mut batch.dev_mem,
            slice_offset + npkts * slice_stride,
            stream,
        );

        self.provider.launch_lpm_kernel(
            &self.dev_tree,
            &mut batch.dev_mem,
            slice_offset,
            slice_stride,
            anno_offset,
            anno_stride,
            self.nbits,
            npkts,
            stream,
        );

        batch.work = crate::batch::WorkCursor {
            host_offset: anno_offset,
            dev_offset: anno_offset,
            size: npkts * anno_stride,
        };
        trace!(npkts, anno_offset, "compute: lpm kernel launched");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::SimAccelProvider;
    use crate::batcher::BatcherBuilder;
    use crate::config::BatcherConfig;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> u32 {
        u32::from_be_bytes([a, b, c, d])
    }

    fn eth_ipv4_packet(dst: [u8; 4]) -> crate::batch::Packet {
        let mut data = vec![0u8; 14 + 20];
        data[IPV4_DST_OFFSET..IPV4_DST_OFFSET + 4].copy_from_slice(&dst);
        crate::batch::Packet::new(data)
    }

    // Scenario 3 groundwork: the kernel actually computes correct routes.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bpush_writes_correct_port_per_packet() {
        let provider: Arc<dyn AccelProvider> = Arc::new(SimAccelProvider::new());
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
        let (batcher, rx) = builder.build(provider.clone(), 1, 4, 4).unwrap();

        for dst in [[10, 1, 2, 3], [10, 4, 5, 6], [8, 8, 8, 8], [9, 9, 9, 9]] {
            batcher.push(0, 0, eth_ipv4_packet(dst));
        }

        let mut batch = rx.recv_timeout(std::time::Duration::from_millis(50)).unwrap();
        stage.bpush(&mut batch);
        batch.sync_from_device(provider.as_ref());

        let ports: Vec<u8> = (0..4).map(|i| batch.host_anno(i)[0]).collect();
        assert_eq!(ports, vec![1, 1, 2, 2]);
    }
}
