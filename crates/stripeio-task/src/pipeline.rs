//! Pipelined plan builders.
//!
//! A pipelined repair stages every survivor's chunk, then forwards a
//! partial parity hop by hop through the parity-region slot `m`, ending in
//! a concatenate that writes the repaired chunk. The Clay variant is
//! precomputed offline per `(n, shard)` and loaded from a plan file; that
//! file is the only precomputed input the engine accepts.

use crate::{Result, TaskError};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::Path;
use stripeio_common::{ChunkIndex, DiskId, EcParam, Ip, StripeId};

/// Command types of the sliced (sub-chunk) worker loop.
pub mod command_type {
    pub const READ_AND_CACHE: i64 = 0;
    pub const READ_AND_COMPUTE: i64 = 1;
    pub const FETCH_AND_COMPUTE: i64 = 2;
    pub const CONCATENATE: i64 = 3;
}

/// Compute tags of `FETCH_AND_COMPUTE`.
pub mod compute_tag {
    pub const CLAY: i64 = 0;
    pub const RS: i64 = 1;
    pub const NSYS: i64 = 2;
}

/// Sub-chunk compute step shipped inside Clay pipeline plans.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClayComputeTask {
    pub src_list: Vec<i64>,
    pub dst_list: Vec<i64>,
    pub matrix: Vec<Vec<i32>>,
}

/// One sliced-worker command. Field order is the wire contract.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command_type: i64,
    pub stripe_name: String,
    pub stripe_id: StripeId,
    pub shard_id: i64,
    pub src_sub_shard_ids: Vec<i64>,
    pub compute_type: i64,
    pub src_ips: Vec<Ip>,
    pub dist_sub_shard_ids: Vec<i64>,
    pub shard_ids: Vec<i64>,
    pub clay_compute_tasks: Vec<ClayComputeTask>,
    pub k: EcParam,
    pub m: EcParam,
    pub disk_id: DiskId,
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Pipelined command list with its recipients; the last recipient is the
/// ACK sink.
#[derive(Clone, Debug)]
pub struct PipelinePlan {
    pub commands: Vec<Command>,
    pub recipients: Vec<Ip>,
}

fn read_and_cache(stripe_id: StripeId, shard: i64, disk: DiskId, k: EcParam, m: EcParam) -> Command {
    Command {
        command_type: command_type::READ_AND_CACHE,
        stripe_id,
        shard_id: shard,
        src_sub_shard_ids: vec![0],
        dist_sub_shard_ids: vec![0],
        disk_id: disk,
        k,
        m,
        ..Command::default()
    }
}

fn forward_hop(
    stripe_id: StripeId,
    shard: i64,
    shard_ids: Vec<i64>,
    src_sub_shards: Vec<i64>,
    tag: i64,
    src_ips: Vec<Ip>,
    m: EcParam,
    k: EcParam,
) -> Command {
    Command {
        command_type: command_type::FETCH_AND_COMPUTE,
        stripe_id,
        shard_id: shard,
        shard_ids,
        src_sub_shard_ids: src_sub_shards,
        compute_type: tag,
        src_ips,
        dist_sub_shard_ids: vec![i64::from(m as i32)],
        k,
        m,
        ..Command::default()
    }
}

/// Chain `sources` through the parity-region slot and terminate at
/// `target` with a concatenate.
fn chain_plan(
    stripe_id: StripeId,
    target: ChunkIndex,
    k: EcParam,
    m: EcParam,
    tag: i64,
    sources: &[i64],
    disks: &[DiskId],
    ips: &[Ip],
) -> PipelinePlan {
    const LOCAL: &str = "127.0.0.1";
    let target_id = i64::from(target);
    let mut commands = Vec::new();
    let mut recipients = Vec::new();

    for &src in sources {
        commands.push(read_and_cache(stripe_id, src, disks[src as usize], k, m));
        recipients.push(ips[src as usize].clone());
    }

    // First hop combines the first two staged shards on the second node.
    commands.push(forward_hop(
        stripe_id,
        target_id,
        vec![sources[0], sources[1]],
        vec![0, 0],
        tag,
        vec![ips[sources[0] as usize].clone(), LOCAL.to_string()],
        m,
        k,
    ));
    recipients.push(ips[sources[1] as usize].clone());

    // Every later hop folds in its local shard and the running parity.
    for i in 2..sources.len() {
        commands.push(forward_hop(
            stripe_id,
            target_id,
            vec![target_id, sources[i]],
            vec![i64::from(m as i32), 0],
            tag,
            vec![ips[sources[i - 1] as usize].clone(), LOCAL.to_string()],
            m,
            k,
        ));
        recipients.push(ips[sources[i] as usize].clone());
    }

    commands.push(Command {
        command_type: command_type::CONCATENATE,
        stripe_id,
        shard_id: target_id,
        shard_ids: vec![target_id],
        src_sub_shard_ids: vec![i64::from(m as i32)],
        src_ips: vec![ips[*sources.last().unwrap() as usize].clone()],
        dist_sub_shard_ids: vec![0],
        disk_id: disks[target as usize],
        k,
        m,
        ..Command::default()
    });
    recipients.push(ips[target as usize].clone());

    PipelinePlan {
        commands,
        recipients,
    }
}

/// RS pipelined repair over `k` random survivors.
pub fn rs_pipelined_repair(
    stripe_id: StripeId,
    failed: ChunkIndex,
    k: EcParam,
    m: EcParam,
    disks: &[DiskId],
    ips: &[Ip],
) -> Result<PipelinePlan> {
    let n = (k + m) as usize;
    if disks.len() != n || ips.len() != n {
        return Err(TaskError::InvalidParams("cluster list length mismatch".into()));
    }
    if k < 2 {
        return Err(TaskError::InvalidParams(
            "pipelined repair needs at least two sources".into(),
        ));
    }
    let mut sources: Vec<i64> = (0..n as i64).filter(|&i| i != i64::from(failed)).collect();
    sources.shuffle(&mut rand::thread_rng());
    sources.truncate(k as usize);
    sources.sort_unstable();
    Ok(chain_plan(
        stripe_id,
        failed,
        k,
        m,
        compute_tag::RS,
        &sources,
        disks,
        ips,
    ))
}

/// NSYS pipelined repair over all survivors.
pub fn nsys_pipelined_repair(
    stripe_id: StripeId,
    failed: ChunkIndex,
    k: EcParam,
    m: EcParam,
    disks: &[DiskId],
    ips: &[Ip],
) -> Result<PipelinePlan> {
    let n = (k + m) as usize;
    if disks.len() != n || ips.len() != n {
        return Err(TaskError::InvalidParams("cluster list length mismatch".into()));
    }
    if n < 3 {
        return Err(TaskError::InvalidParams(
            "pipelined repair needs at least two sources".into(),
        ));
    }
    let sources: Vec<i64> = (0..n as i64).filter(|&i| i != i64::from(failed)).collect();
    Ok(chain_plan(
        stripe_id,
        failed,
        k,
        m,
        compute_tag::NSYS,
        &sources,
        disks,
        ips,
    ))
}

/// On-disk Clay pipeline plan: the command list and the node index each
/// command is addressed to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClayPipelinePlan {
    pub commands: Vec<Command>,
    pub nodes: Vec<u32>,
}

impl ClayPipelinePlan {
    /// Conventional plan-file path for `(n, shard)`.
    #[must_use]
    pub fn file_path(dir: &Path, n: usize, shard: ChunkIndex) -> std::path::PathBuf {
        dir.join(format!("Clay_{n}_{shard}.bin"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

/// Load a Clay pipelined repair plan and resolve its node indices against
/// the PG's disk and address lists.
///
/// Inside the stored commands, `src_ips` holds node indices as decimal
/// strings; they are rewritten to real addresses here. Disk ids are filled
/// in for the read and concatenate stages, which touch local disks.
pub fn load_clay_pipeline_plan(
    plan_dir: &Path,
    failed: ChunkIndex,
    k: EcParam,
    m: EcParam,
    disks: &[DiskId],
    ips: &[Ip],
) -> Result<PipelinePlan> {
    let n = (k + m) as usize;
    if disks.len() != n || ips.len() != n {
        return Err(TaskError::InvalidParams("cluster list length mismatch".into()));
    }
    let path = ClayPipelinePlan::file_path(plan_dir, n, failed);
    let plan = ClayPipelinePlan::load(&path)?;
    if plan.commands.len() != plan.nodes.len() {
        return Err(TaskError::InvalidParams(format!(
            "plan {} has {} commands for {} nodes",
            path.display(),
            plan.commands.len(),
            plan.nodes.len()
        )));
    }

    let mut commands = plan.commands;
    let mut recipients = Vec::with_capacity(commands.len());
    for (command, &node) in commands.iter_mut().zip(&plan.nodes) {
        let node = node as usize;
        if node >= n {
            return Err(TaskError::InvalidParams(format!(
                "plan node index {node} out of range"
            )));
        }
        recipients.push(ips[node].clone());
        let resolved: Vec<Ip> = command
            .src_ips
            .iter()
            .map(|idx| {
                idx.parse::<usize>()
                    .ok()
                    .and_then(|i| ips.get(i).cloned())
                    .ok_or_else(|| {
                        TaskError::InvalidParams(format!("bad plan source index {idx}"))
                    })
            })
            .collect::<Result<_>>()?;
        command.src_ips = resolved;
        if command.command_type == command_type::READ_AND_CACHE
            || command.command_type == command_type::CONCATENATE
        {
            command.disk_id = disks[node];
        }
    }
    Ok(PipelinePlan {
        commands,
        recipients,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(n: usize) -> (Vec<DiskId>, Vec<Ip>) {
        let disks = (0..n as DiskId).collect();
        let ips = (0..n).map(|i| format!("10.0.1.{i}")).collect();
        (disks, ips)
    }

    #[test]
    fn rs_pipeline_has_chain_shape() {
        let (disks, ips) = cluster(6);
        let plan = rs_pipelined_repair(4, 5, 4, 2, &disks, &ips).unwrap();
        // k reads + (k - 1) hops + 1 concatenate.
        assert_eq!(plan.commands.len(), 2 * 4);
        assert_eq!(plan.recipients.len(), plan.commands.len());

        let reads = plan
            .commands
            .iter()
            .filter(|c| c.command_type == command_type::READ_AND_CACHE)
            .count();
        assert_eq!(reads, 4);
        let last = plan.commands.last().unwrap();
        assert_eq!(last.command_type, command_type::CONCATENATE);
        assert_eq!(last.shard_id, 5);
        assert_eq!(plan.recipients.last().unwrap(), "10.0.1.5");

        // Hops forward through the parity-region slot m.
        for hop in plan
            .commands
            .iter()
            .filter(|c| c.command_type == command_type::FETCH_AND_COMPUTE)
        {
            assert_eq!(hop.dist_sub_shard_ids, vec![2]);
            assert_eq!(hop.compute_type, compute_tag::RS);
        }
    }

    #[test]
    fn nsys_pipeline_uses_every_survivor() {
        let (disks, ips) = cluster(6);
        let plan = nsys_pipelined_repair(4, 0, 4, 2, &disks, &ips).unwrap();
        let reads = plan
            .commands
            .iter()
            .filter(|c| c.command_type == command_type::READ_AND_CACHE)
            .count();
        assert_eq!(reads, 5);
        assert_eq!(plan.commands.len(), 5 + 4 + 1);
    }

    #[test]
    fn clay_plan_round_trips_and_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let (disks, ips) = cluster(6);

        let stored = ClayPipelinePlan {
            commands: vec![
                Command {
                    command_type: command_type::READ_AND_CACHE,
                    shard_id: 0,
                    src_ips: vec![],
                    ..Command::default()
                },
                Command {
                    command_type: command_type::CONCATENATE,
                    shard_id: 3,
                    src_ips: vec!["0".into()],
                    ..Command::default()
                },
            ],
            nodes: vec![0, 3],
        };
        let path = ClayPipelinePlan::file_path(dir.path(), 6, 3);
        stored.save(&path).unwrap();

        let plan = load_clay_pipeline_plan(dir.path(), 3, 4, 2, &disks, &ips).unwrap();
        assert_eq!(plan.recipients, vec!["10.0.1.0", "10.0.1.3"]);
        assert_eq!(plan.commands[1].src_ips, vec!["10.0.1.0"]);
        assert_eq!(plan.commands[1].disk_id, 3);
    }

    #[test]
    fn missing_clay_plan_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (disks, ips) = cluster(6);
        assert!(load_clay_pipeline_plan(dir.path(), 0, 4, 2, &disks, &ips).is_err());
    }

    #[test]
    fn sliced_command_round_trips() {
        let cmd = Command {
            command_type: command_type::FETCH_AND_COMPUTE,
            stripe_name: "s".into(),
            stripe_id: 12,
            shard_id: 3,
            src_sub_shard_ids: vec![2, 0],
            compute_type: compute_tag::NSYS,
            src_ips: vec!["10.0.1.2".into()],
            dist_sub_shard_ids: vec![2],
            shard_ids: vec![3, 4],
            clay_compute_tasks: vec![ClayComputeTask {
                src_list: vec![1],
                dst_list: vec![2],
                matrix: vec![vec![1, 0], vec![0, 1]],
            }],
            k: 4,
            m: 2,
            disk_id: 9,
        };
        assert_eq!(Command::decode(&cmd.encode().unwrap()).unwrap(), cmd);
    }
}
