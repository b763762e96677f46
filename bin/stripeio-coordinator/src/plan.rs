//! Read and repair plan selection.
//!
//! These functions translate a blob read or a failed chunk into task plans
//! parametrized by the stripe's EC type and blob layout. Unsupported
//! combinations (RS or Clay with a vertical layout, reading plain RS
//! stripes without degradation) are fatal for the action.

use anyhow::{anyhow, bail, Result};
use std::path::Path;
use stripeio_common::{BlobLayout, BlobMeta, ChunkIndex, DiskId, EcType, Ip, RepairManner,
    StripeMeta};
use stripeio_erasure::clay_sub_chunk_count;
use stripeio_task::{
    clay_centralized_read, clay_centralized_repair, load_clay_pipeline_plan,
    nsys_centralized_read, nsys_centralized_repair, nsys_pipelined_repair, rs_centralized_repair,
    rs_pipelined_repair, BlockPlan, PipelinePlan,
};
use stripeio_transport::{READ_ACK_LIST, REPAIR_ACK_LIST};

/// A blob byte range restricted to one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    pub chunk_index: ChunkIndex,
    /// Offset within the chunk.
    pub offset: usize,
    pub size: usize,
}

/// Split a blob's byte range `[offset, offset + size)` of a horizontal
/// stripe into per-chunk sub-ranges.
pub fn carve_chunk_ranges(offset: usize, size: usize, chunk_size: usize) -> Vec<ChunkRange> {
    let mut ranges = Vec::new();
    let mut remaining = size;
    let mut cursor = offset;
    while remaining > 0 {
        let chunk_index = (cursor / chunk_size) as ChunkIndex;
        let in_chunk = cursor % chunk_size;
        let len = remaining.min(chunk_size - in_chunk);
        ranges.push(ChunkRange {
            chunk_index,
            offset: in_chunk,
            size: len,
        });
        cursor += len;
        remaining -= len;
    }
    ranges
}

/// One sub-plan of a read, tagged with the ACK list its sink reports on.
pub struct ReadPlan {
    pub plan: BlockPlan,
    pub ack_list: &'static str,
}

/// Build the sub-plans serving one blob read.
///
/// `degraded` selects the degraded-read behavior: RS ranges fall back to
/// the centralized repair plan (and ACK on the repair list); NSYS and Clay
/// use their read plans.
pub fn build_read_plans(
    blob: &BlobMeta,
    stripe: &StripeMeta,
    disks: &[DiskId],
    ips: &[Ip],
    degraded: bool,
) -> Result<Vec<ReadPlan>> {
    let mut plans = Vec::new();
    match stripe.blob_layout {
        BlobLayout::Horizontal => match stripe.ec_type {
            EcType::Rs => {
                if !degraded {
                    bail!("plain reads of RS stripes are not served through task plans");
                }
                for range in carve_chunk_ranges(blob.offset, blob.size, stripe.chunk_size) {
                    plans.push(ReadPlan {
                        plan: rs_centralized_repair(
                            stripe.stripe_id,
                            range.chunk_index,
                            stripe.k,
                            stripe.m,
                            range.offset,
                            range.size,
                            disks,
                            ips,
                        )?,
                        ack_list: REPAIR_ACK_LIST,
                    });
                }
            }
            EcType::Nsys => {
                for range in carve_chunk_ranges(blob.offset, blob.size, stripe.chunk_size) {
                    plans.push(ReadPlan {
                        plan: nsys_centralized_read(
                            stripe.stripe_id,
                            range.chunk_index,
                            stripe.k,
                            stripe.m,
                            range.offset,
                            range.size,
                            disks,
                            ips,
                        )?,
                        ack_list: READ_ACK_LIST,
                    });
                }
            }
            EcType::Clay => {
                // Clay has no partial reads: every overlapped chunk is read
                // whole through the minimum sub-chunk plan.
                let w = clay_sub_chunk_count(stripe.k, stripe.m)?;
                let first = blob.offset / stripe.chunk_size;
                let last = (blob.offset + blob.size).div_ceil(stripe.chunk_size);
                for chunk_index in first..last {
                    plans.push(ReadPlan {
                        plan: clay_centralized_read(
                            stripe.stripe_id,
                            chunk_index as ChunkIndex,
                            stripe.k,
                            stripe.m,
                            stripe.chunk_size / w,
                            disks,
                            ips,
                        )?,
                        ack_list: READ_ACK_LIST,
                    });
                }
            }
        },
        BlobLayout::Vertical => match stripe.ec_type {
            EcType::Nsys => {
                // The blob's bytes span every chunk: translate the byte
                // range into the sub-chunk range and read it everywhere.
                let k = stripe.k as usize;
                let sub_start = blob.offset / k;
                let sub_end = (blob.offset + blob.size) / k;
                let n = (stripe.k + stripe.m) as usize;
                for chunk_index in 0..n {
                    plans.push(ReadPlan {
                        plan: nsys_centralized_read(
                            stripe.stripe_id,
                            chunk_index as ChunkIndex,
                            stripe.k,
                            stripe.m,
                            sub_start,
                            sub_end - sub_start,
                            disks,
                            ips,
                        )?,
                        ack_list: READ_ACK_LIST,
                    });
                }
            }
            EcType::Rs | EcType::Clay => {
                bail!(
                    "unsupported combination: {} with a vertical blob layout",
                    stripe.ec_type
                )
            }
        },
    }
    Ok(plans)
}

/// A repair plan in either shape.
pub enum RepairPlan {
    Centralized(BlockPlan),
    Pipelined(PipelinePlan),
}

impl RepairPlan {
    pub fn ack_sink(&self) -> &Ip {
        match self {
            Self::Centralized(plan) => plan.ack_sink(),
            Self::Pipelined(plan) => plan
                .recipients
                .last()
                .expect("pipelined plans are never empty"),
        }
    }
}

/// Directory holding the precomputed Clay pipeline plans.
pub const CLAY_PLAN_DIR: &str = "clay-config";

/// Build the plan repairing `failed` in `stripe`.
pub fn build_repair_plan(
    stripe: &StripeMeta,
    failed: ChunkIndex,
    manner: RepairManner,
    disks: &[DiskId],
    ips: &[Ip],
) -> Result<RepairPlan> {
    match (stripe.blob_layout, manner) {
        (BlobLayout::Horizontal, RepairManner::Centralized) => {
            let plan = match stripe.ec_type {
                EcType::Rs => rs_centralized_repair(
                    stripe.stripe_id,
                    failed,
                    stripe.k,
                    stripe.m,
                    0,
                    stripe.chunk_size,
                    disks,
                    ips,
                )?,
                EcType::Nsys => nsys_centralized_repair(
                    stripe.stripe_id,
                    failed,
                    stripe.k,
                    stripe.m,
                    0,
                    stripe.chunk_size / stripe.m as usize,
                    disks,
                    ips,
                )?,
                EcType::Clay => {
                    let w = clay_sub_chunk_count(stripe.k, stripe.m)?;
                    if stripe.chunk_size % w != 0 {
                        bail!(
                            "chunk size {} is not divisible by the clay sub-chunk count {w}",
                            stripe.chunk_size
                        );
                    }
                    clay_centralized_repair(
                        stripe.stripe_id,
                        failed,
                        stripe.k,
                        stripe.m,
                        stripe.chunk_size / w,
                        disks,
                        ips,
                    )?
                }
            };
            Ok(RepairPlan::Centralized(plan))
        }
        (BlobLayout::Vertical, RepairManner::Centralized) => match stripe.ec_type {
            EcType::Nsys => {
                let sub_chunk = stripe.chunk_size / stripe.m as usize;
                Ok(RepairPlan::Centralized(nsys_centralized_repair(
                    stripe.stripe_id,
                    failed,
                    stripe.k,
                    stripe.m,
                    0,
                    sub_chunk,
                    disks,
                    ips,
                )?))
            }
            EcType::Rs | EcType::Clay => bail!(
                "unsupported combination: {} repair with a vertical blob layout",
                stripe.ec_type
            ),
        },
        (_, RepairManner::Pipelined) => {
            let plan = match stripe.ec_type {
                EcType::Rs => rs_pipelined_repair(
                    stripe.stripe_id,
                    failed,
                    stripe.k,
                    stripe.m,
                    disks,
                    ips,
                )?,
                EcType::Nsys => nsys_pipelined_repair(
                    stripe.stripe_id,
                    failed,
                    stripe.k,
                    stripe.m,
                    disks,
                    ips,
                )?,
                EcType::Clay => load_clay_pipeline_plan(
                    Path::new(CLAY_PLAN_DIR),
                    failed,
                    stripe.k,
                    stripe.m,
                    disks,
                    ips,
                )
                .map_err(|e| anyhow!("clay pipeline plan unavailable: {e}"))?,
            };
            Ok(RepairPlan::Pipelined(plan))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stripeio_common::ChunkMeta;

    fn stripe(ec_type: EcType, layout: BlobLayout, chunk_size: usize) -> StripeMeta {
        StripeMeta {
            stripe_id: 8,
            k: 4,
            m: 2,
            ec_type,
            blob_layout: layout,
            chunk_size,
            blobs: vec![],
            chunks: (0..6)
                .map(|i| ChunkMeta {
                    stripe_id: 8,
                    chunk_index: i,
                    size: chunk_size,
                })
                .collect(),
        }
    }

    fn cluster() -> (Vec<DiskId>, Vec<Ip>) {
        ((0..6).collect(), (0..6).map(|i| format!("10.1.0.{i}")).collect())
    }

    #[test]
    fn carving_splits_across_chunk_boundaries() {
        let ranges = carve_chunk_ranges(1000, 100, 1024);
        assert_eq!(
            ranges,
            vec![
                ChunkRange { chunk_index: 0, offset: 1000, size: 24 },
                ChunkRange { chunk_index: 1, offset: 0, size: 76 },
            ]
        );
    }

    #[test]
    fn carving_within_one_chunk() {
        let ranges = carve_chunk_ranges(100, 50, 1024);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].size, 50);
    }

    #[test]
    fn vertical_nsys_read_fans_out_to_every_chunk() {
        let stripe = stripe(EcType::Nsys, BlobLayout::Vertical, 1 << 20);
        let blob = BlobMeta {
            blob_id: 1,
            stripe_id: 8,
            blob_index: 0,
            size: 1 << 20,
            offset: 0,
        };
        let (disks, ips) = cluster();
        let plans = build_read_plans(&blob, &stripe, &disks, &ips, false).unwrap();
        assert_eq!(plans.len(), 6);
        for plan in &plans {
            assert_eq!(plan.ack_list, READ_ACK_LIST);
            // Sub-chunk range [0, 256 KiB) on every chunk.
            let read = &plan.plan.commands[0];
            assert_eq!(read.offset, 0);
            assert_eq!(read.size, 1 << 18);
        }
    }

    #[test]
    fn degraded_rs_read_uses_repair_plans() {
        let stripe = stripe(EcType::Rs, BlobLayout::Horizontal, 1024);
        let blob = BlobMeta {
            blob_id: 1,
            stripe_id: 8,
            blob_index: 0,
            size: 1500,
            offset: 512,
        };
        let (disks, ips) = cluster();
        let plans = build_read_plans(&blob, &stripe, &disks, &ips, true).unwrap();
        assert_eq!(plans.len(), 2);
        assert!(plans.iter().all(|p| p.ack_list == REPAIR_ACK_LIST));

        // Plain (non-degraded) RS reads are not plan-served.
        assert!(build_read_plans(&blob, &stripe, &disks, &ips, false).is_err());
    }

    #[test]
    fn clay_read_covers_whole_overlapped_chunks() {
        let stripe = stripe(EcType::Clay, BlobLayout::Horizontal, 4096);
        let blob = BlobMeta {
            blob_id: 1,
            stripe_id: 8,
            blob_index: 0,
            size: 5000,
            offset: 100,
        };
        let (disks, ips) = cluster();
        let plans = build_read_plans(&blob, &stripe, &disks, &ips, false).unwrap();
        // Bytes 100..5100 overlap chunks 0 and 1.
        assert_eq!(plans.len(), 2);
        for plan in &plans {
            let read = &plan.plan.commands[0];
            // Sub-chunk size for (4, 2): 4096 / 8.
            assert_eq!(read.size, 512);
            assert_eq!(read.clay_offsets.len(), 4);
        }
    }

    #[test]
    fn vertical_rs_is_unsupported() {
        let stripe = stripe(EcType::Rs, BlobLayout::Vertical, 1024);
        let blob = BlobMeta {
            blob_id: 1,
            stripe_id: 8,
            blob_index: 0,
            size: 100,
            offset: 0,
        };
        let (disks, ips) = cluster();
        assert!(build_read_plans(&blob, &stripe, &disks, &ips, false).is_err());
        assert!(build_repair_plan(&stripe, 0, RepairManner::Centralized, &disks, &ips).is_err());
    }

    #[test]
    fn centralized_repair_plan_sizes_follow_ec_type() {
        let (disks, ips) = cluster();

        let rs = stripe(EcType::Rs, BlobLayout::Horizontal, 2048);
        match build_repair_plan(&rs, 1, RepairManner::Centralized, &disks, &ips).unwrap() {
            RepairPlan::Centralized(plan) => {
                assert_eq!(plan.commands[0].size, 2048);
                assert_eq!(plan.commands.len(), 5);
            }
            RepairPlan::Pipelined(_) => panic!("expected centralized plan"),
        }

        let nsys = stripe(EcType::Nsys, BlobLayout::Horizontal, 2048);
        match build_repair_plan(&nsys, 1, RepairManner::Centralized, &disks, &ips).unwrap() {
            RepairPlan::Centralized(plan) => {
                assert_eq!(plan.commands[0].size, 1024);
                assert_eq!(plan.commands.len(), 6);
            }
            RepairPlan::Pipelined(_) => panic!("expected centralized plan"),
        }

        let clay = stripe(EcType::Clay, BlobLayout::Horizontal, 4096);
        match build_repair_plan(&clay, 3, RepairManner::Centralized, &disks, &ips).unwrap() {
            RepairPlan::Centralized(plan) => {
                assert_eq!(plan.commands[0].size, 512);
            }
            RepairPlan::Pipelined(_) => panic!("expected centralized plan"),
        }
    }

    #[test]
    fn clay_chunk_size_must_divide_by_w() {
        let (disks, ips) = cluster();
        let clay = stripe(EcType::Clay, BlobLayout::Horizontal, 4100);
        assert!(build_repair_plan(&clay, 0, RepairManner::Centralized, &disks, &ips).is_err());
    }

    #[test]
    fn pipelined_rs_plan_is_selected() {
        let (disks, ips) = cluster();
        let rs = stripe(EcType::Rs, BlobLayout::Horizontal, 2048);
        match build_repair_plan(&rs, 2, RepairManner::Pipelined, &disks, &ips).unwrap() {
            RepairPlan::Pipelined(plan) => {
                assert_eq!(plan.recipients.last().unwrap(), "10.1.0.2");
            }
            RepairPlan::Centralized(_) => panic!("expected pipelined plan"),
        }
    }
}
