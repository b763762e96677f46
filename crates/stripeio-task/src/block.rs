//! Centralized plan builders.
//!
//! A centralized plan stages the survivors' bytes on their own nodes
//! (read-and-cache), then has the target node fetch, compute, and write.
//! Commands and recipients are index-aligned; the final pair is the
//! compute command at the ACK sink.

use crate::command::{compute_type, BlockCommand};
use crate::{Result, TaskError};
use rand::seq::SliceRandom;
use stripeio_common::{ChunkIndex, DiskId, EcParam, Ip, StripeId};
use stripeio_erasure::repair_sub_chunk_ranges;

/// An ordered command list and the workers that receive it.
#[derive(Clone, Debug)]
pub struct BlockPlan {
    pub commands: Vec<BlockCommand>,
    pub recipients: Vec<Ip>,
}

impl BlockPlan {
    /// The worker whose ACK completes this plan.
    #[must_use]
    pub fn ack_sink(&self) -> &Ip {
        self.recipients.last().expect("plans are never empty")
    }
}

fn check_cluster_lists(n: usize, disks: &[DiskId], ips: &[Ip]) -> Result<()> {
    if disks.len() != n || ips.len() != n {
        return Err(TaskError::InvalidParams(format!(
            "expected {n} disks and ips, got {} and {}",
            disks.len(),
            ips.len()
        )));
    }
    Ok(())
}

/// `count` distinct indices from `0..n` excluding `exclude`, sorted.
fn random_survivors(n: usize, count: usize, exclude: ChunkIndex) -> Vec<ChunkIndex> {
    let mut candidates: Vec<ChunkIndex> = (0..n as ChunkIndex).filter(|&i| i != exclude).collect();
    candidates.shuffle(&mut rand::thread_rng());
    candidates.truncate(count);
    candidates.sort_unstable();
    candidates
}

fn gather_plan(
    stripe_id: StripeId,
    target: ChunkIndex,
    k: EcParam,
    m: EcParam,
    offset: usize,
    size: usize,
    compute: i32,
    block_num: usize,
    sources: &[ChunkIndex],
    disks: &[DiskId],
    ips: &[Ip],
) -> BlockPlan {
    let mut commands = Vec::with_capacity(sources.len() + 1);
    let mut recipients = Vec::with_capacity(sources.len() + 1);
    let mut src_ips = Vec::with_capacity(sources.len());
    for &src in sources {
        commands.push(BlockCommand::read_and_cache(
            src,
            offset,
            size,
            stripe_id,
            disks[src as usize],
            k,
            m,
        ));
        recipients.push(ips[src as usize].clone());
        src_ips.push(ips[src as usize].clone());
    }
    let mut compute_cmd = BlockCommand::fetch_compute_write(
        target,
        compute,
        src_ips,
        sources.to_vec(),
        target,
        block_num,
        stripe_id,
        disks[target as usize],
        k,
        m,
    );
    compute_cmd.size = size;
    commands.push(compute_cmd);
    recipients.push(ips[target as usize].clone());
    BlockPlan {
        commands,
        recipients,
    }
}

/// RS repair: `k` random survivors feed the repair target.
#[allow(clippy::too_many_arguments)]
pub fn rs_centralized_repair(
    stripe_id: StripeId,
    failed: ChunkIndex,
    k: EcParam,
    m: EcParam,
    offset: usize,
    size: usize,
    disks: &[DiskId],
    ips: &[Ip],
) -> Result<BlockPlan> {
    let n = (k + m) as usize;
    check_cluster_lists(n, disks, ips)?;
    let sources = random_survivors(n, k as usize, failed);
    Ok(gather_plan(
        stripe_id,
        failed,
        k,
        m,
        offset,
        size,
        compute_type::RS_REPAIR,
        k as usize,
        &sources,
        disks,
        ips,
    ))
}

/// NSYS repair: all `k + m - 1` survivors feed the repair target.
#[allow(clippy::too_many_arguments)]
pub fn nsys_centralized_repair(
    stripe_id: StripeId,
    failed: ChunkIndex,
    k: EcParam,
    m: EcParam,
    offset: usize,
    size: usize,
    disks: &[DiskId],
    ips: &[Ip],
) -> Result<BlockPlan> {
    let n = (k + m) as usize;
    check_cluster_lists(n, disks, ips)?;
    let sources: Vec<ChunkIndex> = (0..n as ChunkIndex).filter(|&i| i != failed).collect();
    Ok(gather_plan(
        stripe_id,
        failed,
        k,
        m,
        offset,
        size,
        compute_type::NSYS_REPAIR,
        n - 1,
        &sources,
        disks,
        ips,
    ))
}

/// NSYS degraded read of one chunk sub-range: `k` random survivors feed
/// the reader.
#[allow(clippy::too_many_arguments)]
pub fn nsys_centralized_read(
    stripe_id: StripeId,
    target: ChunkIndex,
    k: EcParam,
    m: EcParam,
    offset: usize,
    size: usize,
    disks: &[DiskId],
    ips: &[Ip],
) -> Result<BlockPlan> {
    let n = (k + m) as usize;
    check_cluster_lists(n, disks, ips)?;
    let sources = random_survivors(n, k as usize, target);
    Ok(gather_plan(
        stripe_id,
        target,
        k,
        m,
        offset,
        size,
        compute_type::NSYS_READ,
        k as usize,
        &sources,
        disks,
        ips,
    ))
}

/// Expand the Clay minimum-decode plan into per-sub-chunk byte offsets.
fn clay_offsets(k: EcParam, m: EcParam, failed: ChunkIndex, sub_size: usize) -> Result<Vec<usize>> {
    let ranges = repair_sub_chunk_ranges(k, m, failed as usize)?;
    let w: usize = {
        let total: usize = ranges.iter().map(|(_, c)| c).sum();
        total * m as usize
    };
    let mut offsets = Vec::new();
    for (start, count) in ranges {
        // One offset per sub-chunk, even where runs are contiguous.
        for i in 0..count {
            offsets.push((start + i) * sub_size);
        }
    }
    for &offset in &offsets {
        if offset + sub_size > sub_size * w {
            return Err(TaskError::InvalidParams(format!(
                "clay offset {offset} outside chunk of {w} sub-chunks"
            )));
        }
    }
    Ok(offsets)
}

fn clay_gather_plan(
    stripe_id: StripeId,
    failed: ChunkIndex,
    k: EcParam,
    m: EcParam,
    sub_size: usize,
    compute: i32,
    disks: &[DiskId],
    ips: &[Ip],
) -> Result<BlockPlan> {
    let n = (k + m) as usize;
    check_cluster_lists(n, disks, ips)?;
    let offsets = clay_offsets(k, m, failed, sub_size)?;
    let sources: Vec<ChunkIndex> = (0..n as ChunkIndex).filter(|&i| i != failed).collect();

    let mut commands = Vec::with_capacity(n);
    let mut recipients = Vec::with_capacity(n);
    let mut src_ips = Vec::with_capacity(n - 1);
    for &src in &sources {
        commands.push(BlockCommand::read_and_cache_clay(
            src,
            offsets.clone(),
            sub_size,
            stripe_id,
            disks[src as usize],
            k,
            m,
        ));
        recipients.push(ips[src as usize].clone());
        src_ips.push(ips[src as usize].clone());
    }
    let mut compute_cmd = BlockCommand::fetch_compute_write(
        failed,
        compute,
        src_ips,
        sources,
        failed,
        n - 1,
        stripe_id,
        disks[failed as usize],
        k,
        m,
    );
    compute_cmd.size = sub_size;
    commands.push(compute_cmd);
    recipients.push(ips[failed as usize].clone());
    Ok(BlockPlan {
        commands,
        recipients,
    })
}

/// Clay repair over the minimum sub-chunk set. `sub_size` is the
/// sub-chunk size (`chunk_size / w`).
pub fn clay_centralized_repair(
    stripe_id: StripeId,
    failed: ChunkIndex,
    k: EcParam,
    m: EcParam,
    sub_size: usize,
    disks: &[DiskId],
    ips: &[Ip],
) -> Result<BlockPlan> {
    clay_gather_plan(
        stripe_id,
        failed,
        k,
        m,
        sub_size,
        compute_type::CLAY_REPAIR,
        disks,
        ips,
    )
}

/// Clay degraded read; same shape as the repair, but the sink ACKs on the
/// read list and nothing is written.
pub fn clay_centralized_read(
    stripe_id: StripeId,
    target: ChunkIndex,
    k: EcParam,
    m: EcParam,
    sub_size: usize,
    disks: &[DiskId],
    ips: &[Ip],
) -> Result<BlockPlan> {
    clay_gather_plan(
        stripe_id,
        target,
        k,
        m,
        sub_size,
        compute_type::CLAY_READ,
        disks,
        ips,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::command_type;

    fn cluster(n: usize) -> (Vec<DiskId>, Vec<Ip>) {
        let disks = (0..n as DiskId).collect();
        let ips = (0..n).map(|i| format!("10.0.0.{i}")).collect();
        (disks, ips)
    }

    #[test]
    fn rs_repair_uses_k_survivors() {
        let (disks, ips) = cluster(6);
        let plan = rs_centralized_repair(9, 2, 4, 2, 0, 1024, &disks, &ips).unwrap();
        assert_eq!(plan.commands.len(), 5);
        assert_eq!(plan.recipients.len(), 5);

        for cmd in &plan.commands[..4] {
            assert_eq!(cmd.command_type, command_type::READ_AND_CACHE_BLOCK);
            assert_ne!(cmd.block_id, 2);
            assert_eq!(cmd.size, 1024);
        }
        let last = plan.commands.last().unwrap();
        assert_eq!(last.command_type, command_type::FETCH_COMPUTE_WRITE_BLOCK);
        assert_eq!(last.compute_type, compute_type::RS_REPAIR);
        assert_eq!(last.block_num, 4);
        assert_eq!(last.dest_block_id, 2);
        assert_eq!(plan.ack_sink(), "10.0.0.2");

        // Source ids arrive sorted and match the command order.
        let ids = &last.src_block_ids;
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids.len(), last.src_ips.len());
    }

    #[test]
    fn nsys_repair_uses_all_survivors() {
        let (disks, ips) = cluster(6);
        let plan = nsys_centralized_repair(9, 0, 4, 2, 0, 512, &disks, &ips).unwrap();
        assert_eq!(plan.commands.len(), 6);
        let last = plan.commands.last().unwrap();
        assert_eq!(last.compute_type, compute_type::NSYS_REPAIR);
        assert_eq!(last.block_num, 5);
        assert_eq!(plan.ack_sink(), "10.0.0.0");
    }

    #[test]
    fn nsys_read_requests_k_sources() {
        let (disks, ips) = cluster(6);
        let plan = nsys_centralized_read(3, 1, 4, 2, 256, 512, &disks, &ips).unwrap();
        assert_eq!(plan.commands.len(), 5);
        let last = plan.commands.last().unwrap();
        assert_eq!(last.compute_type, compute_type::NSYS_READ);
        assert_eq!(last.block_num, 4);
        assert_eq!(last.offset, 0);
        assert_eq!(plan.commands[0].offset, 256);
    }

    #[test]
    fn clay_repair_expands_minimum_sub_chunks() {
        // (4, 2): w = 8, q = 2; every survivor reads w / q = 4 sub-chunks.
        let (disks, ips) = cluster(6);
        let sub_size = 4096;
        let plan = clay_centralized_repair(5, 3, 4, 2, sub_size, &disks, &ips).unwrap();
        assert_eq!(plan.commands.len(), 6);

        for cmd in &plan.commands[..5] {
            assert_eq!(cmd.command_type, command_type::READ_AND_CACHE_BLOCK_CLAY);
            assert_eq!(cmd.clay_offsets.len(), 4);
            assert_eq!(cmd.size, sub_size);
            for &off in &cmd.clay_offsets {
                assert_eq!(off % sub_size, 0);
                assert!(off + sub_size <= 8 * sub_size);
            }
        }
        let last = plan.commands.last().unwrap();
        assert_eq!(last.compute_type, compute_type::CLAY_REPAIR);
        assert_eq!(last.block_num, 5);
        assert_eq!(plan.ack_sink(), "10.0.0.3");
    }

    #[test]
    fn clay_read_mirrors_repair_shape() {
        let (disks, ips) = cluster(6);
        let plan = clay_centralized_read(5, 1, 4, 2, 1024, &disks, &ips).unwrap();
        let last = plan.commands.last().unwrap();
        assert_eq!(last.compute_type, compute_type::CLAY_READ);
    }

    #[test]
    fn mismatched_cluster_lists_are_rejected() {
        let (disks, _) = cluster(6);
        let ips = vec!["10.0.0.0".to_string()];
        assert!(rs_centralized_repair(1, 0, 4, 2, 0, 64, &disks, &ips).is_err());
    }
}
