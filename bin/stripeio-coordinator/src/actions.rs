//! Coordinator actions.
//!
//! Each action drives the cluster through the transport: BuildData streams
//! encoded stripes out to the workers, the read actions replay the blob
//! access log, and the repair actions regenerate lost chunks. Outstanding
//! work is bounded by draining the task queue at a threshold.

use crate::plan::{build_read_plans, build_repair_plan, RepairPlan};
use crate::pool::{drain_all_at, drain_to, TaskPool};
use crate::profile::Profile;
use anyhow::{anyhow, Context, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stripeio_common::{
    ActionType, BlobLayout, ChunkId, ChunkIndex, ChunkMeta, DiskMeta, EcType, Ip, MergeScheme,
    RepairManner, StripeId,
};
use stripeio_erasure::make_encoder;
use stripeio_meta::{MetaCore, MetaError, StripeRecord};
use stripeio_task::pipeline::command_type as sliced_type;
use stripeio_task::BlockCommand;
use stripeio_trace::{
    make_trace_reader, BaselineStream, BasicMergeStream, FixedSizeMergeStream,
    InterDegradeReadStream, InterLocalityStream, IntraDegradeReadStream, PartitionStream,
    SplitBeforeMergeStream, StripeStream,
};
use stripeio_transport::{
    chunk_queue_name, QueueManager, ACK_PAYLOAD, BLK_CMD_LIST, BUILD_ACK_LIST, CMD_LIST,
    REPAIR_ACK_LIST,
};
use tracing::{error, info, warn};

/// Records consumed from the raw trace per emitted record.
const TRACE_STEP_BY: usize = 256;
/// BuildData drains its task queue completely at this depth.
const BUILD_QUEUE_THRESHOLD: usize = 64;
/// Read and repair actions keep at most this many tasks in flight.
const ACTION_QUEUE_THRESHOLD: usize = 32;

/// Per-(EC type, layout) stripe statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StripeStat {
    pub count: usize,
    pub size: usize,
}

pub struct BuildDataResult {
    pub stripe_stat: HashMap<(EcType, BlobLayout), StripeStat>,
    pub stripe_range: (StripeId, StripeId),
    pub total_size: usize,
}

pub struct ReadResult {
    pub total_size: usize,
}

pub struct RepairResult {
    pub total_size: usize,
}

/// Owns the metadata core and the transport; runs one configured action.
pub struct Coordinator {
    profile: Arc<Profile>,
    meta: Arc<MetaCore>,
    queues: Arc<QueueManager>,
}

impl Coordinator {
    pub fn new(profile: Arc<Profile>) -> Result<Self> {
        let create_new = profile.action == ActionType::BuildData;
        let mut meta = MetaCore::launch(
            profile.workspace_name.as_str(),
            &profile.working_dir,
            create_new,
        )
        .context("failed to launch metadata core")?;
        meta.set_stripe_counter(profile.start_at);

        for (node_id, disks) in profile.disk_list.iter().enumerate() {
            let node_id = node_id as u64;
            for &disk in disks {
                meta.register_disk(DiskMeta {
                    id: disk,
                    node_id,
                });
            }
            meta.register_worker(node_id, profile.worker_ip[node_id as usize].clone());
        }
        meta.register_pg(profile.pg_num, profile.ec_k, profile.ec_m);

        match profile.action {
            ActionType::RepairChunk | ActionType::RepairFailureDomain | ActionType::Read => {
                meta.load_meta().context("failed to load metadata")?;
            }
            // BuildData starts fresh; DegradeRead exercises a freshly
            // built store and loads nothing up front.
            ActionType::BuildData | ActionType::DegradeRead => {}
        }

        let queues =
            QueueManager::new(profile.workspace_name.clone(), profile.password.clone());
        Ok(Self {
            profile,
            meta: Arc::new(meta),
            queues: Arc::new(queues),
        })
    }

    pub fn persist(&self) -> Result<()> {
        self.meta.persist().context("failed to persist metadata")
    }

    fn make_stripe_stream(&self) -> Result<Box<dyn StripeStream>> {
        let p = &self.profile;
        let reader = || make_trace_reader(&p.trace, TRACE_STEP_BY);
        let stream: Box<dyn StripeStream> = match p.merge_scheme {
            MergeScheme::Fixed => Box::new(BaselineStream::new(
                Box::new(FixedSizeMergeStream::new(reader()?, p.merge_size)),
                make_encoder(p.ec_type, p.ec_k, p.ec_m)?,
            )),
            MergeScheme::Baseline => Box::new(BaselineStream::new(
                Box::new(BasicMergeStream::new(reader()?, p.merge_size)),
                make_encoder(p.ec_type, p.ec_k, p.ec_m)?,
            )),
            MergeScheme::Partition => Box::new(PartitionStream::new(
                Box::new(BasicMergeStream::new(reader()?, p.merge_size)),
                make_encoder(EcType::Clay, p.ec_k, p.ec_m)?,
                make_encoder(EcType::Rs, p.ec_k, p.ec_m)?,
                p.partition_size,
            )),
            MergeScheme::IntraLocality => Box::new(SplitBeforeMergeStream::new(
                reader()?,
                p.merge_size,
                make_encoder(EcType::Clay, p.ec_k, p.ec_m)?,
                make_encoder(EcType::Nsys, p.ec_k, p.ec_m)?,
            )),
            MergeScheme::InterLocality => Box::new(InterLocalityStream::new(
                reader()?,
                p.merge_size,
                make_encoder(EcType::Clay, p.ec_k, p.ec_m)?,
                make_encoder(EcType::Nsys, p.ec_k, p.ec_m)?,
                p.merge_size,
            )),
            MergeScheme::IntraForDegradeRead => Box::new(IntraDegradeReadStream::new(
                make_encoder(p.ec_type, p.ec_k, p.ec_m)?,
                p.chunk_size * p.ec_k as usize,
            )?),
            MergeScheme::InterForDegradeRead => Box::new(InterDegradeReadStream::new(
                make_encoder(p.ec_type, p.ec_k, p.ec_m)?,
                p.chunk_size * p.ec_k as usize,
                p.blob_size,
            )?),
        };
        Ok(stream)
    }

    /// Synthesize, encode, register, and distribute stripes until the
    /// configured load is reached or the trace runs out.
    pub fn build_data(&self) -> Result<BuildDataResult> {
        self.meta.clear_blobs()?;
        let mut stream = self.make_stripe_stream()?;

        let pool = TaskPool::new()?;
        let mut queue = VecDeque::new();
        let total_size = Arc::new(AtomicUsize::new(0));
        let mut stripe_stat: HashMap<(EcType, BlobLayout), StripeStat> = HashMap::new();
        let mut load_count: usize = 0;
        let mut stripes_built: u64 = 0;

        while load_count < self.profile.test_load {
            let item = match stream.next_stripe() {
                Ok(item) => item,
                Err(e) if e.is_exhaust() => {
                    info!(load_count, "trace exhausted");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            let stripe_id = self.meta.next_stripe_id();
            stripes_built += 1;
            let stripe_size: usize = item.chunks.iter().map(Vec::len).sum();
            let stat = stripe_stat
                .entry((item.ec_type, item.blob_layout))
                .or_default();
            stat.count += 1;
            stat.size += stripe_size;

            let meta = Arc::clone(&self.meta);
            let queues = Arc::clone(&self.queues);
            let profile = Arc::clone(&self.profile);
            queue.push_back(pool.submit(move || {
                if let Err(e) = build_one_stripe(&meta, &queues, &profile, stripe_id, item) {
                    error!(stripe_id, error = %e, "stripe build failed");
                }
            }));

            match self.profile.load_type {
                stripeio_common::LoadType::ByStripe => load_count += 1,
                stripeio_common::LoadType::BySize => load_count += stripe_size,
            }
            total_size.fetch_add(stripe_size, Ordering::Relaxed);
            drain_all_at(&mut queue, BUILD_QUEUE_THRESHOLD);

            if stripes_built % 100 == 0 {
                info!(
                    stripes = stripes_built,
                    gib = total_size.load(Ordering::Relaxed) >> 30,
                    "build progress"
                );
            }
        }
        drain_to(&mut queue, 0);
        info!(stripes = stripes_built, "all build acks received");

        let start = self.profile.start_at;
        Ok(BuildDataResult {
            stripe_stat,
            stripe_range: (start, start + stripes_built),
            total_size: total_size.load(Ordering::Relaxed),
        })
    }

    /// Replay the blob access log through normal read plans.
    pub fn read(&self) -> Result<ReadResult> {
        self.replay_blobs(false)
    }

    /// Replay the blob access log with one chunk treated as failed.
    pub fn degrade_read(&self) -> Result<ReadResult> {
        self.replay_blobs(true)
    }

    fn replay_blobs(&self, degraded: bool) -> Result<ReadResult> {
        let pool = TaskPool::new()?;
        let mut queue = VecDeque::new();
        let total_size = Arc::new(AtomicUsize::new(0));
        // The log clusters blobs of one stripe together; reuse the last
        // stripe record instead of re-reading it per blob.
        let mut cached_stripe: Option<Arc<stripeio_common::StripeMeta>> = None;

        while let Some(blob_id) = self.meta.next_blob_record()? {
            info!(blob_id, "reading blob");
            let blob = match self.meta.blob_meta(blob_id) {
                Ok(blob) => blob,
                Err(MetaError::NotFound) => {
                    warn!(blob_id, "blob not found, stopping replay");
                    break;
                }
                Err(e) => {
                    error!(blob_id, error = %e, "blob lookup failed");
                    break;
                }
            };
            let stripe = match &cached_stripe {
                Some(stripe) if stripe.stripe_id == blob.stripe_id => Arc::clone(stripe),
                _ => {
                    let fresh = Arc::new(self.meta.stripe_meta(blob.stripe_id)?);
                    cached_stripe = Some(Arc::clone(&fresh));
                    fresh
                }
            };

            let meta = Arc::clone(&self.meta);
            let queues = Arc::clone(&self.queues);
            let total = Arc::clone(&total_size);
            queue.push_back(pool.submit(move || {
                match serve_blob_read(&meta, &queues, &blob, &stripe, degraded) {
                    Ok(()) => {
                        total.fetch_add(blob.size, Ordering::Relaxed);
                    }
                    Err(e) => error!(blob_id = blob.blob_id, error = %e, "blob read failed"),
                }
            }));
            drain_to(&mut queue, ACTION_QUEUE_THRESHOLD);
        }
        drain_to(&mut queue, 0);
        Ok(ReadResult {
            total_size: total_size.load(Ordering::Relaxed),
        })
    }

    /// Repair one chunk index across the configured stripe range.
    pub fn repair_chunk(&self) -> Result<()> {
        let repair = self
            .profile
            .chunk_repair
            .ok_or_else(|| anyhow!("chunk repair profile missing"))?;

        // Dedicated ACK receiver: the main loop stays on plan dispatch
        // while acks drain concurrently. Closing the channel stops it.
        let (ack_tx, ack_rx) = crossbeam_channel::bounded::<Ip>(ACTION_QUEUE_THRESHOLD);
        let queues = Arc::clone(&self.queues);
        let receiver = std::thread::spawn(move || {
            while let Ok(ip) = ack_rx.recv() {
                match queues.pop_from(&ip, REPAIR_ACK_LIST) {
                    Ok(ack) if ack.as_ref() == ACK_PAYLOAD => {}
                    Ok(ack) => error!(?ack, "unexpected ack payload"),
                    Err(e) => error!(%ip, error = %e, "ack pop failed"),
                }
            }
        });

        let start = self.profile.start_at;
        let end = start.saturating_add(self.profile.test_load as u64);
        for stripe_id in start..end {
            let failed = ChunkId {
                stripe_id,
                chunk_index: repair.chunk_index,
            };
            let stripe = match self.meta.chunk_repair(failed) {
                Ok(stripe) => stripe,
                Err(MetaError::NotFound) => {
                    info!(stripe_id, "stripe range ends before configured load");
                    break;
                }
                Err(e) => {
                    drop(ack_tx);
                    let _ = receiver.join();
                    return Err(e.into());
                }
            };
            let sink = self.dispatch_repair(&stripe, repair.chunk_index, repair.manner)?;
            ack_tx
                .send(sink)
                .map_err(|_| anyhow!("ack receiver terminated early"))?;
        }
        drop(ack_tx);
        receiver
            .join()
            .map_err(|_| anyhow!("ack receiver panicked"))?;
        Ok(())
    }

    /// Repair every chunk placed on the failed disk.
    pub fn repair_failure_domain(&self) -> Result<RepairResult> {
        let failed_disk = self
            .profile
            .failure_domain_repair
            .ok_or_else(|| anyhow!("failure domain repair profile missing"))?
            .failed_disk;
        let repairs = self.meta.disk_repair(failed_disk);
        info!(
            failed_disk,
            pgs = repairs.len(),
            "repairing failure domain"
        );

        let pool = TaskPool::new()?;
        let mut queue = VecDeque::new();
        let total_size = Arc::new(AtomicUsize::new(0));
        for repair in repairs {
            let chunk_index = repair.chunk_index;
            for stripe_id in repair.stripe_list {
                let meta = Arc::clone(&self.meta);
                let queues = Arc::clone(&self.queues);
                let total = Arc::clone(&total_size);
                queue.push_back(pool.submit(move || {
                    if let Err(e) =
                        repair_one_stripe(&meta, &queues, stripe_id, chunk_index, &total)
                    {
                        error!(stripe_id, error = %e, "stripe repair failed");
                    }
                }));
                drain_to(&mut queue, ACTION_QUEUE_THRESHOLD);
            }
        }
        drain_to(&mut queue, 0);
        Ok(RepairResult {
            total_size: total_size.load(Ordering::Relaxed),
        })
    }

    /// Push one repair plan and return its ACK sink.
    fn dispatch_repair(
        &self,
        stripe: &stripeio_common::StripeMeta,
        chunk_index: ChunkIndex,
        manner: RepairManner,
    ) -> Result<Ip> {
        let pg = self.meta.select_pg(stripe.stripe_id);
        let disks = self.meta.pg_to_disks(pg)?.to_vec();
        let ips = self.meta.pg_to_worker_ips(pg)?;
        let plan = build_repair_plan(stripe, chunk_index, manner, &disks, &ips)?;
        push_repair_plan(&self.queues, &plan)?;
        Ok(plan.ack_sink().clone())
    }
}

/// Register one stripe's metadata, ship its chunks and build commands, and
/// wait for the `k + m` build ACKs.
fn build_one_stripe(
    meta: &MetaCore,
    queues: &QueueManager,
    profile: &Profile,
    stripe_id: StripeId,
    item: stripeio_trace::StripeItem,
) -> Result<()> {
    let chunk_size = item
        .chunks
        .first()
        .map(Vec::len)
        .ok_or_else(|| anyhow!("stripe {stripe_id} has no chunks"))?;
    let pg = meta.select_pg(stripe_id);

    let n = (profile.ec_k + profile.ec_m) as usize;
    let chunk_meta: Vec<ChunkMeta> = (0..n)
        .map(|i| ChunkMeta {
            stripe_id,
            chunk_index: i as ChunkIndex,
            size: chunk_size,
        })
        .collect();
    let record = StripeRecord::new()
        .stripe_id(stripe_id)
        .blobs(item.blobs)
        .chunks(chunk_meta)
        .chunk_size(chunk_size)
        .ec_km(profile.ec_k, profile.ec_m)
        .pg(pg)
        .blob_layout(item.blob_layout)
        .ec_type(item.ec_type);
    meta.register_stripe(record)?;

    let nodes = meta.pg_to_worker_nodes(pg)?;
    let ips: Vec<Ip> = nodes
        .iter()
        .map(|&node| meta.worker_ip(node).cloned())
        .collect::<std::result::Result<_, _>>()?;
    let disks = meta.pg_to_disks(pg)?.to_vec();

    for (i, chunk) in item.chunks.iter().enumerate() {
        let index = i as ChunkIndex;
        let queue = chunk_queue_name(stripe_id, index, chunk.len());
        queues.push_to(&ips[i], &queue, chunk)?;
        let cmd = BlockCommand::fetch_write(
            index,
            stripe_id,
            disks[i],
            vec![ips[i].clone()],
            vec![index],
            0,
            chunk.len(),
            profile.ec_k,
            profile.ec_m,
        );
        queues.push_to(&ips[i], BLK_CMD_LIST, &cmd.encode()?)?;
    }
    for ip in ips.iter().take(n) {
        let ack = queues.pop_from(ip, BUILD_ACK_LIST)?;
        if ack.as_ref() != ACK_PAYLOAD {
            error!(stripe_id, %ip, ?ack, "unexpected build ack payload");
        }
    }
    Ok(())
}

/// Push one blob's read plans and pop one ACK per sub-plan.
fn serve_blob_read(
    meta: &MetaCore,
    queues: &QueueManager,
    blob: &stripeio_common::BlobMeta,
    stripe: &stripeio_common::StripeMeta,
    degraded: bool,
) -> Result<()> {
    let pg = meta.select_pg(blob.stripe_id);
    let disks = meta.pg_to_disks(pg)?.to_vec();
    let ips = meta.pg_to_worker_ips(pg)?;
    let plans = build_read_plans(blob, stripe, &disks, &ips, degraded)?;

    for plan in &plans {
        for (cmd, ip) in plan.plan.commands.iter().zip(&plan.plan.recipients) {
            queues.push_to(ip, BLK_CMD_LIST, &cmd.encode()?)?;
        }
    }
    for plan in &plans {
        let ack = queues.pop_from(plan.plan.ack_sink(), plan.ack_list)?;
        if ack.as_ref() != ACK_PAYLOAD {
            error!(blob_id = blob.blob_id, ?ack, "unexpected read ack payload");
        }
    }
    Ok(())
}

fn push_repair_plan(queues: &QueueManager, plan: &RepairPlan) -> Result<()> {
    match plan {
        RepairPlan::Centralized(plan) => {
            for (cmd, ip) in plan.commands.iter().zip(&plan.recipients) {
                queues.push_to(ip, BLK_CMD_LIST, &cmd.encode()?)?;
            }
        }
        RepairPlan::Pipelined(plan) => {
            for (cmd, ip) in plan.commands.iter().zip(&plan.recipients) {
                debug_assert!(cmd.command_type <= sliced_type::CONCATENATE);
                queues.push_to(ip, CMD_LIST, &cmd.encode()?)?;
            }
        }
    }
    Ok(())
}

/// Centralized repair of one stripe's chunk, waiting for its ACK.
fn repair_one_stripe(
    meta: &MetaCore,
    queues: &QueueManager,
    stripe_id: StripeId,
    chunk_index: ChunkIndex,
    total: &AtomicUsize,
) -> Result<()> {
    let failed = ChunkId {
        stripe_id,
        chunk_index,
    };
    let stripe = meta.chunk_repair(failed)?;
    let pg = meta.select_pg(stripe_id);
    let disks = meta.pg_to_disks(pg)?.to_vec();
    let ips = meta.pg_to_worker_ips(pg)?;
    let plan = build_repair_plan(&stripe, chunk_index, RepairManner::Centralized, &disks, &ips)?;
    push_repair_plan(queues, &plan)?;

    let ack = queues.pop_from(plan.ack_sink(), REPAIR_ACK_LIST)?;
    if ack.as_ref() != ACK_PAYLOAD {
        error!(stripe_id, ?ack, "unexpected repair ack payload");
    }
    total.fetch_add(stripe.chunk_size, Ordering::Relaxed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripe_stats_accumulate_by_type() {
        let mut stats: HashMap<(EcType, BlobLayout), StripeStat> = HashMap::new();
        for _ in 0..3 {
            let stat = stats
                .entry((EcType::Rs, BlobLayout::Horizontal))
                .or_default();
            stat.count += 1;
            stat.size += 1024;
        }
        let stat = stats[&(EcType::Rs, BlobLayout::Horizontal)];
        assert_eq!(stat.count, 3);
        assert_eq!(stat.size, 3072);
    }
}
