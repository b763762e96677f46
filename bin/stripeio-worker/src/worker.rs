//! Block-command execution core.
//!
//! The worker loops on its local `_LIST_BLK_CMD` queue and launches one
//! pipeline per command. Pipelines are chains of stages running as
//! detached pool tasks, wired by bounded byte channels; a full channel
//! blocks the producer, which is the only backpressure in the core.
//!
//! Stage errors are logged and the stage abandoned; the coordinator only
//! notices through missing ACKs. An unknown command type kills the loop.

use crate::profile::Profile;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::sync::Arc;
use stripeio_common::EcType;
use stripeio_erasure::{reconstruct_chunk, reconstruct_data};
use stripeio_store::{AsKey, BlobStore, CachedStore, Key, LocalFsStore};
use stripeio_task::command::{command_type, compute_type};
use stripeio_task::BlockCommand;
use stripeio_transport::{
    chunk_queue_name, QueueManager, ACK_PAYLOAD, BLK_CMD_LIST, BUILD_ACK_LIST, LOCAL_HOST,
    READ_ACK_LIST, REPAIR_ACK_LIST,
};
use tracing::{error, info};
use xxhash_rust::xxh64::xxh64;

/// Capacity of the inter-stage byte channels.
const STAGE_CHANNEL_CAP: usize = 64;

/// Store key of a stripe's local block.
fn block_key(stripe_id: u64) -> Key {
    let name = format!("block_{stripe_id}");
    xxh64(name.as_bytes(), 0).as_key()
}

/// Read the command's byte range from the local block and hand it on.
fn read_stage(store: &dyn BlobStore, cmd: &BlockCommand, sink: &Sender<Bytes>) -> Result<()> {
    let key = block_key(cmd.stripe_id);
    // Size probe first: a missing block fails here, before the buffer.
    store.blob_size(key)?;
    let mut buf = vec![0_u8; cmd.size];
    store.get_at(key, &mut buf, cmd.offset)?;
    sink.send(Bytes::from(buf))?;
    Ok(())
}

/// Read each Clay sub-chunk offset and hand on the concatenation.
fn read_clay_stage(store: &dyn BlobStore, cmd: &BlockCommand, sink: &Sender<Bytes>) -> Result<()> {
    let key = block_key(cmd.stripe_id);
    store.blob_size(key)?;
    let mut buf = vec![0_u8; cmd.clay_offsets.len() * cmd.size];
    for (slot, &offset) in cmd.clay_offsets.iter().enumerate() {
        let dst = &mut buf[slot * cmd.size..(slot + 1) * cmd.size];
        store.get_at(key, dst, offset)?;
    }
    sink.send(Bytes::from(buf))?;
    Ok(())
}

/// Publish the staged bytes on this node's chunk queue.
fn cache_stage(queues: &QueueManager, cmd: &BlockCommand, stream: &Receiver<Bytes>) -> Result<()> {
    let queue = chunk_queue_name(cmd.stripe_id, cmd.block_id, cmd.size);
    let payload = stream.recv()?;
    queues.push_to(LOCAL_HOST, &queue, &payload)?;
    Ok(())
}

/// Pop each source's staged chunk, in source order.
fn fetch_stage(queues: &QueueManager, cmd: &BlockCommand, sink: &Sender<Bytes>) -> Result<()> {
    for (ip, &src_id) in cmd.src_ips.iter().zip(&cmd.src_block_ids) {
        let queue = chunk_queue_name(cmd.stripe_id, src_id, cmd.size);
        let payload = queues.pop_from(ip, &queue)?;
        sink.send(payload)?;
    }
    Ok(())
}

/// Write the received bytes as this stripe's local block.
fn write_stage(store: &dyn BlobStore, cmd: &BlockCommand, stream: &Receiver<Bytes>) -> Result<()> {
    let payload = stream.recv()?;
    store.put_or_create(block_key(cmd.stripe_id), &payload)?;
    Ok(())
}

fn ec_type_of_compute(compute: i32) -> Result<EcType> {
    match compute {
        compute_type::RS_REPAIR | compute_type::RS_READ => Ok(EcType::Rs),
        compute_type::NSYS_REPAIR | compute_type::NSYS_READ => Ok(EcType::Nsys),
        compute_type::CLAY_REPAIR | compute_type::CLAY_READ => Ok(EcType::Clay),
        other => Err(anyhow!("unknown compute type {other}")),
    }
}

/// Decode the fetched chunks. Repairs emit the reconstructed block
/// downstream; reads only decode (their result is the measurement).
pub(crate) fn compute_stage(
    cmd: &BlockCommand,
    stream: &Receiver<Bytes>,
    sink: &Sender<Bytes>,
) -> Result<()> {
    let mut chunks = BTreeMap::new();
    for &src_id in cmd.src_block_ids.iter().take(cmd.block_num) {
        let payload = stream.recv()?;
        chunks.insert(src_id, payload.to_vec());
    }
    let ec_type = ec_type_of_compute(cmd.compute_type)?;
    if compute_type::is_read(cmd.compute_type) {
        reconstruct_data(ec_type, cmd.k, cmd.m, &chunks)?;
    } else {
        let repaired = reconstruct_chunk(ec_type, cmd.k, cmd.m, &chunks, cmd.dest_block_id)?;
        sink.send(Bytes::from(repaired))?;
    }
    Ok(())
}

/// The canonical worker: executes block commands against the local store.
pub struct BlockWorker {
    queues: Arc<QueueManager>,
    store: Arc<dyn BlobStore>,
    pool: rayon::ThreadPool,
}

impl BlockWorker {
    pub fn new(profile: &Profile) -> Result<Self> {
        let local = LocalFsStore::open(&profile.working_dir)?;
        let store: Arc<dyn BlobStore> = if profile.cache_size > 0 {
            let mut cached = CachedStore::new(local, profile.cache_size);
            if profile.large_chunk_size > 0 {
                cached = cached.with_bypass_threshold(profile.large_chunk_size);
            }
            Arc::new(cached)
        } else {
            Arc::new(local)
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(profile.num_threads)
            .build()?;
        Ok(Self {
            queues: Arc::new(QueueManager::new(
                profile.workspace_name.clone(),
                profile.password.clone(),
            )),
            store,
            pool,
        })
    }

    /// Pop and dispatch block commands forever.
    pub fn run(&self) -> Result<()> {
        info!("block worker listening on {BLK_CMD_LIST}");
        loop {
            let payload = self.queues.pop_from(LOCAL_HOST, BLK_CMD_LIST)?;
            let cmd = Arc::new(BlockCommand::decode(&payload)?);
            match cmd.command_type {
                command_type::READ_AND_CACHE_BLOCK => self.pipe_read_cache(cmd),
                command_type::READ_AND_CACHE_BLOCK_CLAY => self.pipe_read_cache_clay(cmd),
                command_type::FETCH_COMPUTE_WRITE_BLOCK => self.pipe_fetch_compute_write(cmd),
                command_type::FETCH_WRITE_BLOCK => self.pipe_fetch_write(cmd),
                other => return Err(anyhow!("unknown block command type {other}")),
            }
        }
    }

    fn ack(queues: &QueueManager, list: &str) {
        if let Err(e) = queues.push_to(LOCAL_HOST, list, ACK_PAYLOAD) {
            error!(list, error = %e, "failed to push ack");
        }
    }

    fn pipe_read_cache(&self, cmd: Arc<BlockCommand>) {
        let (sink, stream) = bounded::<Bytes>(STAGE_CHANNEL_CAP);
        let store = Arc::clone(&self.store);
        let queues = Arc::clone(&self.queues);
        let read_cmd = Arc::clone(&cmd);
        self.pool.spawn(move || {
            if let Err(e) = read_stage(store.as_ref(), &read_cmd, &sink) {
                error!(stripe = read_cmd.stripe_id, block = read_cmd.block_id, error = %e,
                    "read stage failed");
            }
        });
        self.pool.spawn(move || {
            if let Err(e) = cache_stage(&queues, &cmd, &stream) {
                error!(stripe = cmd.stripe_id, block = cmd.block_id, error = %e,
                    "cache stage failed");
            }
        });
    }

    fn pipe_read_cache_clay(&self, cmd: Arc<BlockCommand>) {
        let (sink, stream) = bounded::<Bytes>(STAGE_CHANNEL_CAP);
        let store = Arc::clone(&self.store);
        let queues = Arc::clone(&self.queues);
        let read_cmd = Arc::clone(&cmd);
        self.pool.spawn(move || {
            if let Err(e) = read_clay_stage(store.as_ref(), &read_cmd, &sink) {
                error!(stripe = read_cmd.stripe_id, block = read_cmd.block_id, error = %e,
                    "clay read stage failed");
            }
        });
        self.pool.spawn(move || {
            if let Err(e) = cache_stage(&queues, &cmd, &stream) {
                error!(stripe = cmd.stripe_id, block = cmd.block_id, error = %e,
                    "cache stage failed");
            }
        });
    }

    fn pipe_fetch_write(&self, cmd: Arc<BlockCommand>) {
        let (sink, stream) = bounded::<Bytes>(STAGE_CHANNEL_CAP);
        let queues = Arc::clone(&self.queues);
        let store = Arc::clone(&self.store);
        let fetch_cmd = Arc::clone(&cmd);
        let fetch_queues = Arc::clone(&self.queues);
        self.pool.spawn(move || {
            if let Err(e) = fetch_stage(&fetch_queues, &fetch_cmd, &sink) {
                error!(stripe = fetch_cmd.stripe_id, block = fetch_cmd.block_id, error = %e,
                    "fetch stage failed");
            }
        });
        self.pool.spawn(move || {
            match write_stage(store.as_ref(), &cmd, &stream) {
                Ok(()) => Self::ack(&queues, BUILD_ACK_LIST),
                Err(e) => error!(stripe = cmd.stripe_id, block = cmd.block_id, error = %e,
                    "write stage failed"),
            }
        });
    }

    fn pipe_fetch_compute_write(&self, cmd: Arc<BlockCommand>) {
        let (fetch_sink, fetch_stream) = bounded::<Bytes>(STAGE_CHANNEL_CAP);
        let (compute_sink, compute_stream) = bounded::<Bytes>(STAGE_CHANNEL_CAP);
        let is_read = compute_type::is_read(cmd.compute_type);

        let fetch_cmd = Arc::clone(&cmd);
        let fetch_queues = Arc::clone(&self.queues);
        self.pool.spawn(move || {
            if let Err(e) = fetch_stage(&fetch_queues, &fetch_cmd, &fetch_sink) {
                error!(stripe = fetch_cmd.stripe_id, block = fetch_cmd.block_id, error = %e,
                    "fetch stage failed");
            }
        });

        let compute_cmd = Arc::clone(&cmd);
        let compute_queues = Arc::clone(&self.queues);
        self.pool.spawn(move || {
            match compute_stage(&compute_cmd, &fetch_stream, &compute_sink) {
                Ok(()) if is_read => Self::ack(&compute_queues, READ_ACK_LIST),
                Ok(()) => {}
                Err(e) => error!(stripe = compute_cmd.stripe_id, error = %e,
                    "compute stage failed"),
            }
        });

        if !is_read {
            let store = Arc::clone(&self.store);
            let queues = Arc::clone(&self.queues);
            self.pool.spawn(move || {
                match write_stage(store.as_ref(), &cmd, &compute_stream) {
                    Ok(()) => Self::ack(&queues, REPAIR_ACK_LIST),
                    Err(e) => error!(stripe = cmd.stripe_id, error = %e,
                        "repair write stage failed"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stripeio_erasure::make_encoder;

    #[test]
    fn block_keys_are_stable_and_distinct() {
        assert_eq!(block_key(42), block_key(42));
        assert_ne!(block_key(42), block_key(43));
    }

    #[test]
    fn read_stage_extracts_the_requested_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::open(dir.path()).unwrap();
        let content: Vec<u8> = (0..128_u8).collect();
        store.put_or_create(block_key(7), &content).unwrap();

        let cmd = BlockCommand::read_and_cache(0, 32, 16, 7, 0, 4, 2);
        let (sink, stream) = bounded::<Bytes>(4);
        read_stage(&store, &cmd, &sink).unwrap();
        let out = stream.recv().unwrap();
        assert_eq!(&out[..], &content[32..48]);
    }

    #[test]
    fn clay_read_stage_concatenates_sub_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::open(dir.path()).unwrap();
        let content: Vec<u8> = (0..64).map(|i| i as u8).collect();
        store.put_or_create(block_key(9), &content).unwrap();

        let cmd = BlockCommand::read_and_cache_clay(0, vec![0, 32], 8, 9, 0, 4, 2);
        let (sink, stream) = bounded::<Bytes>(4);
        read_clay_stage(&store, &cmd, &sink).unwrap();
        let out = stream.recv().unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..8], &content[0..8]);
        assert_eq!(&out[8..], &content[32..40]);
    }

    #[test]
    fn compute_stage_repairs_a_missing_rs_chunk() {
        let encoder = make_encoder(EcType::Rs, 4, 2).unwrap();
        let raw: Vec<u8> = (0..4096_usize).map(|i| (i % 251) as u8).collect();
        let chunks = encoder.encode(&raw).unwrap();

        // Chunk 1 failed; survivors 0, 2, 3, 4 feed the compute.
        let sources = [0_u8, 2, 3, 4];
        let mut cmd = BlockCommand::fetch_compute_write(
            1,
            compute_type::RS_REPAIR,
            sources.iter().map(|i| format!("10.0.0.{i}")).collect(),
            sources.to_vec(),
            1,
            4,
            77,
            0,
            4,
            2,
        );
        cmd.size = chunks[0].len();

        let (fetch_sink, fetch_stream) = bounded::<Bytes>(8);
        let (compute_sink, compute_stream) = bounded::<Bytes>(8);
        for &src in &sources {
            fetch_sink
                .send(Bytes::from(chunks[src as usize].clone()))
                .unwrap();
        }
        compute_stage(&cmd, &fetch_stream, &compute_sink).unwrap();
        let repaired = compute_stream.recv().unwrap();
        assert_eq!(&repaired[..], &chunks[1][..]);
    }

    #[test]
    fn compute_stage_read_emits_nothing_downstream() {
        let encoder = make_encoder(EcType::Nsys, 4, 2).unwrap();
        let raw: Vec<u8> = (0..2048_usize).map(|i| (i % 127) as u8).collect();
        let chunks = encoder.encode(&raw).unwrap();

        let sources = [0_u8, 1, 2, 3];
        let mut cmd = BlockCommand::fetch_compute_write(
            1,
            compute_type::NSYS_READ,
            sources.iter().map(|i| format!("10.0.0.{i}")).collect(),
            sources.to_vec(),
            1,
            4,
            78,
            0,
            4,
            2,
        );
        cmd.size = chunks[0].len();

        let (fetch_sink, fetch_stream) = bounded::<Bytes>(8);
        let (compute_sink, compute_stream) = bounded::<Bytes>(8);
        for &src in &sources {
            fetch_sink
                .send(Bytes::from(chunks[src as usize].clone()))
                .unwrap();
        }
        compute_stage(&cmd, &fetch_stream, &compute_sink).unwrap();
        drop(compute_sink);
        assert!(compute_stream.try_recv().is_err());
    }

    #[test]
    fn unknown_compute_type_is_rejected() {
        let cmd = BlockCommand {
            compute_type: 42,
            block_num: 0,
            ..BlockCommand::default()
        };
        let (_sink, stream) = bounded::<Bytes>(1);
        let (sink2, _stream2) = bounded::<Bytes>(1);
        assert!(compute_stage(&cmd, &stream, &sink2).is_err());
    }
}
