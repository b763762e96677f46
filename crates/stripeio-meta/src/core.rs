//! Metadata core: registration maps, PG construction, stripe allocation,
//! and repair queries.

use crate::placement;
use crate::recorder::BlobRecorder;
use crate::store::{MetaKey, MetaStore};
use crate::{MetaError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use stripeio_common::{
    BlobId, BlobLayout, BlobMeta, ChunkId, ChunkIndex, ChunkMeta, DiskId, DiskMeta, EcParam,
    EcType, Ip, MetaType, NodeId, PgId, PgMeta, StripeId, StripeMeta,
};
use tracing::debug;

/// Seed for the PG node shuffle. Fixed so that every coordinator run over
/// the same registration order builds identical PGs.
const PG_SHUFFLE_SEED: u64 = 0x1234;

/// Pending stripe registration. Build with the setters, hand to
/// [`MetaCore::register_stripe`].
#[derive(Default)]
pub struct StripeRecord {
    stripe_id: Option<StripeId>,
    ec_type: Option<EcType>,
    blob_layout: Option<BlobLayout>,
    ec_km: Option<(EcParam, EcParam)>,
    chunk_size: Option<usize>,
    chunks: Vec<ChunkMeta>,
    blobs: Vec<BlobMeta>,
    pg_id: Option<PgId>,
}

impl StripeRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit stripe id; allocated from the counter when unset.
    #[must_use]
    pub fn stripe_id(mut self, stripe_id: StripeId) -> Self {
        self.stripe_id = Some(stripe_id);
        self
    }

    #[must_use]
    pub fn ec_type(mut self, ec_type: EcType) -> Self {
        self.ec_type = Some(ec_type);
        self
    }

    #[must_use]
    pub fn blob_layout(mut self, layout: BlobLayout) -> Self {
        self.blob_layout = Some(layout);
        self
    }

    #[must_use]
    pub fn ec_km(mut self, k: EcParam, m: EcParam) -> Self {
        self.ec_km = Some((k, m));
        self
    }

    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    #[must_use]
    pub fn chunks(mut self, chunks: Vec<ChunkMeta>) -> Self {
        self.chunks = chunks;
        self
    }

    #[must_use]
    pub fn blobs(mut self, blobs: Vec<BlobMeta>) -> Self {
        self.blobs = blobs;
        self
    }

    #[must_use]
    pub fn pg(mut self, pg_id: PgId) -> Self {
        self.pg_id = Some(pg_id);
        self
    }
}

/// Work item produced by a failed-disk scan: one PG slot plus every stripe
/// with a chunk on the failed disk.
#[derive(Clone, Debug)]
pub struct DiskRepairMeta {
    pub pg: PgMeta,
    pub chunk_index: ChunkIndex,
    pub stripe_list: Vec<StripeId>,
}

/// Owns the metadata store, the placement maps, and the stripe-id counter.
pub struct MetaCore {
    store: MetaStore,
    recorder: BlobRecorder,
    workspace: String,
    start_at: StripeId,
    stripe_counter: AtomicU64,
    pg_num: usize,
    pgs: BTreeMap<PgId, PgMeta>,
    worker_to_ip: BTreeMap<NodeId, Ip>,
    node_to_disks: BTreeMap<NodeId, Vec<DiskId>>,
    disk_to_node: BTreeMap<DiskId, NodeId>,
}

impl MetaCore {
    /// Open the metadata store under `working_dir`. With `create_new` the
    /// directory content is removed first.
    pub fn launch(workspace: impl Into<String>, working_dir: &Path, create_new: bool) -> Result<Self> {
        if create_new {
            if working_dir.exists() {
                for entry in std::fs::read_dir(working_dir)? {
                    let path = entry?.path();
                    if path.is_dir() {
                        std::fs::remove_dir_all(&path)?;
                    } else {
                        std::fs::remove_file(&path)?;
                    }
                }
            } else {
                std::fs::create_dir_all(working_dir)?;
            }
        }
        let store = MetaStore::open(working_dir)?;
        let recorder = BlobRecorder::open(working_dir, create_new)?;
        Ok(Self {
            store,
            recorder,
            workspace: workspace.into(),
            start_at: 0,
            stripe_counter: AtomicU64::new(0),
            pg_num: 0,
            pgs: BTreeMap::new(),
            worker_to_ip: BTreeMap::new(),
            node_to_disks: BTreeMap::new(),
            disk_to_node: BTreeMap::new(),
        })
    }

    /// Initialize the stripe-id counter (and the range start) to `start`.
    pub fn set_stripe_counter(&mut self, start: StripeId) {
        self.start_at = start;
        self.stripe_counter.store(start, Ordering::SeqCst);
    }

    pub fn next_stripe_id(&self) -> StripeId {
        self.stripe_counter.fetch_add(1, Ordering::SeqCst)
    }

    #[must_use]
    pub fn current_stripe_id(&self) -> StripeId {
        self.stripe_counter.load(Ordering::SeqCst)
    }

    pub fn register_disk(&mut self, disk: DiskMeta) {
        self.node_to_disks.entry(disk.node_id).or_default().push(disk.id);
        self.disk_to_node.insert(disk.id, disk.node_id);
    }

    pub fn register_worker(&mut self, node_id: NodeId, ip: Ip) {
        self.worker_to_ip.insert(node_id, ip);
    }

    /// Build `pg_num` placement groups from the registered nodes.
    ///
    /// A seeded shuffle picks `k + m` nodes per PG and one disk per chosen
    /// node, so two chunks of a stripe never share a node.
    pub fn register_pg(&mut self, pg_num: usize, k: EcParam, m: EcParam) {
        self.pg_num = pg_num;
        let nodes: Vec<NodeId> = self.node_to_disks.keys().copied().collect();
        let mut order: Vec<usize> = (0..nodes.len()).collect();
        let mut rng = StdRng::seed_from_u64(PG_SHUFFLE_SEED);

        for i in 0..pg_num {
            let pg_id = i as PgId;
            order.shuffle(&mut rng);
            let mut disk_list = Vec::with_capacity((k + m) as usize);
            for &slot in order.iter().take((k + m) as usize) {
                let node = nodes[slot];
                let disks = &self.node_to_disks[&node];
                let disk = disks[rng.gen_range(0..disks.len())];
                disk_list.push(disk);
            }
            self.pgs.insert(
                pg_id,
                PgMeta {
                    pg_id,
                    k,
                    m,
                    disk_list,
                },
            );
        }
        debug!(pg_num, k, m, "placement groups registered");
    }

    /// PG for a stripe id.
    #[must_use]
    pub fn select_pg(&self, stripe_id: StripeId) -> PgId {
        placement::select_pg(stripe_id, self.pg_num)
    }

    pub fn pg_to_disks(&self, pg_id: PgId) -> Result<&[DiskId]> {
        self.pgs
            .get(&pg_id)
            .map(|pg| pg.disk_list.as_slice())
            .ok_or(MetaError::PgNotFound(pg_id))
    }

    pub fn pg_to_worker_nodes(&self, pg_id: PgId) -> Result<Vec<NodeId>> {
        let disks = self.pg_to_disks(pg_id)?;
        Ok(disks.iter().map(|d| self.disk_to_node[d]).collect())
    }

    pub fn pg_to_worker_ips(&self, pg_id: PgId) -> Result<Vec<Ip>> {
        let disks = self.pg_to_disks(pg_id)?;
        Ok(disks
            .iter()
            .map(|d| self.worker_to_ip[&self.disk_to_node[d]].clone())
            .collect())
    }

    pub fn worker_ip(&self, node_id: NodeId) -> Result<&Ip> {
        self.worker_to_ip
            .get(&node_id)
            .ok_or(MetaError::WorkerNotFound(node_id))
    }

    /// Register a stripe with its blobs and chunks.
    ///
    /// Assigns a stripe id if the record has none, stamps it into every
    /// blob and chunk, and commits the stripe record, blob records, chunk
    /// records, and the `(pg, stripe)` reverse-index entry in one batch.
    /// Blob ids are appended to the access log.
    pub fn register_stripe(&self, record: StripeRecord) -> Result<StripeId> {
        let stripe_id = record
            .stripe_id
            .unwrap_or_else(|| self.stripe_counter.fetch_add(1, Ordering::SeqCst));
        let (k, m) = record.ec_km.ok_or(MetaError::MissingField("ec_km"))?;
        let ec_type = record.ec_type.ok_or(MetaError::MissingField("ec_type"))?;
        let blob_layout = record
            .blob_layout
            .ok_or(MetaError::MissingField("blob_layout"))?;
        let chunk_size = record
            .chunk_size
            .ok_or(MetaError::MissingField("chunk_size"))?;
        if record.blobs.is_empty() {
            return Err(MetaError::MissingField("blobs"));
        }
        if record.chunks.is_empty() {
            return Err(MetaError::MissingField("chunks"));
        }
        let pg_id = record.pg_id.ok_or(MetaError::MissingField("pg_id"))?;

        let mut blobs = record.blobs;
        for blob in &mut blobs {
            blob.stripe_id = stripe_id;
        }
        let mut chunks = record.chunks;
        for chunk in &mut chunks {
            chunk.stripe_id = stripe_id;
        }

        let stripe = StripeMeta {
            stripe_id,
            k,
            m,
            ec_type,
            blob_layout,
            chunk_size,
            blobs,
            chunks,
        };

        let mut batch = self.store.batch();
        batch.put_stripe_to_pg(stripe_id, pg_id);
        batch.put(MetaKey::for_id(MetaType::Stripe, stripe_id), &stripe)?;
        for blob in &stripe.blobs {
            batch.put(MetaKey::for_id(MetaType::Blob, blob.blob_id), blob)?;
            self.recorder.put_record(blob.blob_id)?;
        }
        for chunk in &stripe.chunks {
            let chunk_id = ChunkId {
                stripe_id,
                chunk_index: chunk.chunk_index,
            };
            batch.put(MetaKey::for_chunk(chunk_id), chunk)?;
        }
        batch.flush()?;
        Ok(stripe_id)
    }

    /// Stripe record needed to repair a failed chunk.
    pub fn chunk_repair(&self, chunk_id: ChunkId) -> Result<StripeMeta> {
        self.stripe_meta(chunk_id.stripe_id)
    }

    /// PGs touching a failed disk joined with their stripe lists; PGs with
    /// no stripes are dropped.
    pub fn disk_repair(&self, disk_id: DiskId) -> Vec<DiskRepairMeta> {
        let mut out = Vec::new();
        for pg in self.pgs.values() {
            if let Some(slot) = pg.disk_list.iter().position(|&d| d == disk_id) {
                let stripe_list = self.store.pg_stripes(pg.pg_id).unwrap_or_default();
                if !stripe_list.is_empty() {
                    out.push(DiskRepairMeta {
                        pg: pg.clone(),
                        chunk_index: slot as ChunkIndex,
                        stripe_list,
                    });
                }
            }
        }
        out
    }

    pub fn blob_meta(&self, blob_id: BlobId) -> Result<BlobMeta> {
        self.store.get(MetaKey::for_id(MetaType::Blob, blob_id))
    }

    pub fn stripe_meta(&self, stripe_id: StripeId) -> Result<StripeMeta> {
        self.store.get(MetaKey::for_id(MetaType::Stripe, stripe_id))
    }

    /// Write the reverse map and the stripe-id range durably.
    pub fn persist(&self) -> Result<()> {
        self.store
            .persist_pg_map_as(MetaKey::for_workspace(MetaType::PgMap, &self.workspace))?;
        let range = [self.start_at, self.current_stripe_id()];
        self.store.put(
            MetaKey::for_workspace(MetaType::StripeRange, &self.workspace),
            &range,
        )
    }

    /// Restore the reverse map and the stripe-id range.
    pub fn load_meta(&mut self) -> Result<()> {
        self.store
            .load_pg_map_from(MetaKey::for_workspace(MetaType::PgMap, &self.workspace))?;
        let range: [StripeId; 2] = self
            .store
            .get(MetaKey::for_workspace(MetaType::StripeRange, &self.workspace))?;
        self.start_at = range[0];
        self.stripe_counter.store(range[1], Ordering::SeqCst);
        Ok(())
    }

    /// Truncate the blob access log.
    pub fn clear_blobs(&self) -> Result<()> {
        self.recorder.clear()
    }

    /// Next blob id from the access log replay.
    pub fn next_blob_record(&self) -> Result<Option<BlobId>> {
        self.recorder.next_record()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_with_cluster(dir: &Path, pg_num: usize) -> MetaCore {
        let mut core = MetaCore::launch("test-ws", dir, true).unwrap();
        for node in 0_u64..6 {
            core.register_disk(DiskMeta {
                id: (node * 2) as DiskId,
                node_id: node,
            });
            core.register_disk(DiskMeta {
                id: (node * 2 + 1) as DiskId,
                node_id: node,
            });
            core.register_worker(node, format!("10.0.0.{node}"));
        }
        core.register_pg(pg_num, 4, 2);
        core
    }

    fn sample_record(pg: PgId) -> StripeRecord {
        let blobs = vec![BlobMeta {
            blob_id: 71,
            stripe_id: 0,
            blob_index: 0,
            size: 4096,
            offset: 0,
        }];
        let chunks = (0..6)
            .map(|i| ChunkMeta {
                stripe_id: 0,
                chunk_index: i,
                size: 1024,
            })
            .collect();
        StripeRecord::new()
            .ec_km(4, 2)
            .ec_type(EcType::Rs)
            .blob_layout(BlobLayout::Horizontal)
            .chunk_size(1024)
            .blobs(blobs)
            .chunks(chunks)
            .pg(pg)
    }

    #[test]
    fn pg_construction_is_deterministic_and_node_unique() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let core_a = core_with_cluster(dir_a.path(), 8);
        let core_b = core_with_cluster(dir_b.path(), 8);

        for pg in 0..8 {
            let disks_a = core_a.pg_to_disks(pg).unwrap();
            let disks_b = core_b.pg_to_disks(pg).unwrap();
            assert_eq!(disks_a, disks_b);
            assert_eq!(disks_a.len(), 6);
            // One disk per node.
            let nodes = core_a.pg_to_worker_nodes(pg).unwrap();
            let distinct: std::collections::BTreeSet<_> = nodes.iter().collect();
            assert_eq!(distinct.len(), nodes.len());
        }
    }

    #[test]
    fn register_stripe_assigns_and_stamps_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = core_with_cluster(dir.path(), 8);
        core.set_stripe_counter(10);

        let id = core.register_stripe(sample_record(3)).unwrap();
        assert_eq!(id, 10);

        let stripe = core.stripe_meta(10).unwrap();
        assert_eq!(stripe.chunks.len(), 6);
        assert!(stripe.blobs.iter().all(|b| b.stripe_id == 10));
        assert!(stripe.chunks.iter().all(|c| c.stripe_id == 10));

        let blob = core.blob_meta(71).unwrap();
        assert_eq!(blob.stripe_id, 10);
    }

    #[test]
    fn register_stripe_requires_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with_cluster(dir.path(), 8);
        let record = StripeRecord::new().ec_km(4, 2);
        assert!(matches!(
            core.register_stripe(record),
            Err(MetaError::MissingField(_))
        ));
    }

    #[test]
    fn persist_then_load_restores_counter_and_map() {
        let dir = tempfile::tempdir().unwrap();
        let pg;
        {
            let mut core = core_with_cluster(dir.path(), 8);
            core.set_stripe_counter(0);
            pg = core.select_pg(0);
            core.register_stripe(sample_record(pg).stripe_id(0)).unwrap();
            core.next_stripe_id();
            core.persist().unwrap();
        }
        // Reopen without truncation, as the repair actions do.
        let mut core = MetaCore::launch("test-ws", dir.path(), false).unwrap();
        core.load_meta().unwrap();
        assert_eq!(core.current_stripe_id(), 1);
        assert_eq!(core.store.pg_stripes(pg), Some(vec![0]));
    }

    #[test]
    fn disk_repair_joins_reverse_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = core_with_cluster(dir.path(), 4);
        core.set_stripe_counter(0);
        let stripe_id = core.next_stripe_id();
        let pg = core.select_pg(stripe_id);
        core.register_stripe(sample_record(pg).stripe_id(stripe_id))
            .unwrap();

        let failed_disk = core.pg_to_disks(pg).unwrap()[2];
        let repairs = core.disk_repair(failed_disk);
        let hit = repairs.iter().find(|r| r.pg.pg_id == pg).unwrap();
        assert_eq!(hit.chunk_index, 2);
        assert_eq!(hit.stripe_list, vec![stripe_id]);

        // PGs without stripes are filtered out entirely.
        assert!(repairs.iter().all(|r| !r.stripe_list.is_empty()));
    }

    #[test]
    fn blob_log_replays_registrations() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with_cluster(dir.path(), 8);
        core.clear_blobs().unwrap();
        core.register_stripe(sample_record(0).stripe_id(5)).unwrap();
        assert_eq!(core.next_blob_record().unwrap(), Some(71));
        assert_eq!(core.next_blob_record().unwrap(), None);
    }
}
