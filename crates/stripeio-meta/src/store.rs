//! Durable metadata records on redb.
//!
//! Every record lives in one table keyed by a type tag byte followed by
//! the 8-byte xxh64 of the entity id. Values are bincode. Stripe
//! registration goes through `WriteBatch`, which commits the stripe, its
//! blobs and chunks, and the `(pg, stripe)` reverse-index entries in a
//! single transaction; the in-memory reverse map is merged only after the
//! commit succeeds.

use crate::{MetaError, Result};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use stripeio_common::{ChunkId, MetaType, PgId, StripeId};
use xxhash_rust::xxh64::xxh64;

const META_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("meta");
const DB_FILE: &str = "meta.redb";

/// Key for a metadata record: type tag plus id hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaKey([u8; 9]);

impl MetaKey {
    #[must_use]
    pub fn new(meta_type: MetaType, id_hash: u64) -> Self {
        let mut key = [0_u8; 9];
        key[0] = meta_type as u8;
        key[1..].copy_from_slice(&id_hash.to_le_bytes());
        Self(key)
    }

    /// Key for a scalar-id entity.
    #[must_use]
    pub fn for_id(meta_type: MetaType, id: u64) -> Self {
        Self::new(meta_type, xxh64(&id.to_le_bytes(), 0))
    }

    /// Key for a chunk, identified by `(stripe, index)`.
    #[must_use]
    pub fn for_chunk(chunk_id: ChunkId) -> Self {
        let mut bytes = [0_u8; 9];
        bytes[..8].copy_from_slice(&chunk_id.stripe_id.to_le_bytes());
        bytes[8] = chunk_id.chunk_index;
        Self::new(MetaType::Chunk, xxh64(&bytes, 0))
    }

    /// Key for a workspace-scoped singleton (PG map, stripe range).
    #[must_use]
    pub fn for_workspace(meta_type: MetaType, workspace: &str) -> Self {
        Self::new(meta_type, xxh64(workspace.as_bytes(), 0))
    }

    fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

type PgStripeSets = BTreeMap<PgId, BTreeSet<StripeId>>;

/// In-memory `pg -> sorted stripe set` reverse index.
#[derive(Default)]
struct PgStripeMap {
    inner: Mutex<PgStripeSets>,
}

impl PgStripeMap {
    fn merge(&self, entries: &[(PgId, StripeId)]) {
        let mut map = self.inner.lock();
        for &(pg_id, stripe_id) in entries {
            map.entry(pg_id).or_default().insert(stripe_id);
        }
    }

    fn stripes(&self, pg_id: PgId) -> Option<Vec<StripeId>> {
        let map = self.inner.lock();
        map.get(&pg_id).map(|set| set.iter().copied().collect())
    }

    fn snapshot(&self) -> PgStripeSets {
        self.inner.lock().clone()
    }

    fn replace(&self, map: PgStripeSets) {
        *self.inner.lock() = map;
    }
}

/// redb-backed metadata store. Shareable across threads; batched writes
/// are atomic.
pub struct MetaStore {
    db: Database,
    pg_map: PgStripeMap,
}

impl MetaStore {
    /// Open (or create) the database under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let db = Database::create(dir.join(DB_FILE)).map_err(redb::Error::from)?;
        // Make sure the table exists so first reads do not fail.
        let txn = db.begin_write().map_err(redb::Error::from)?;
        txn.open_table(META_TABLE).map_err(redb::Error::from)?;
        txn.commit().map_err(redb::Error::from)?;
        Ok(Self {
            db,
            pg_map: PgStripeMap::default(),
        })
    }

    /// Write one record outside a batch.
    pub fn put<T: Serialize>(&self, key: MetaKey, value: &T) -> Result<()> {
        let encoded = bincode::serialize(value)?;
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        {
            let mut table = txn.open_table(META_TABLE).map_err(redb::Error::from)?;
            table
                .insert(key.as_slice(), encoded.as_slice())
                .map_err(redb::Error::from)?;
        }
        txn.commit().map_err(redb::Error::from)?;
        Ok(())
    }

    /// Read one record; `MetaError::NotFound` if the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: MetaKey) -> Result<T> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(META_TABLE).map_err(redb::Error::from)?;
        let guard = table
            .get(key.as_slice())
            .map_err(redb::Error::from)?
            .ok_or(MetaError::NotFound)?;
        Ok(bincode::deserialize(guard.value())?)
    }

    /// Start a write batch.
    #[must_use]
    pub fn batch(&self) -> WriteBatch<'_> {
        WriteBatch {
            store: self,
            records: Vec::new(),
            stripe_to_pg: Vec::new(),
        }
    }

    /// Stripes currently indexed under a PG, sorted ascending.
    #[must_use]
    pub fn pg_stripes(&self, pg_id: PgId) -> Option<Vec<StripeId>> {
        self.pg_map.stripes(pg_id)
    }

    /// Persist the reverse map under `key`.
    pub fn persist_pg_map_as(&self, key: MetaKey) -> Result<()> {
        self.put(key, &self.pg_map.snapshot())
    }

    /// Restore the reverse map from `key`.
    pub fn load_pg_map_from(&self, key: MetaKey) -> Result<()> {
        let map: PgStripeSets = self.get(key)?;
        self.pg_map.replace(map);
        Ok(())
    }
}

/// Buffered writes committed in one transaction.
pub struct WriteBatch<'a> {
    store: &'a MetaStore,
    records: Vec<([u8; 9], Vec<u8>)>,
    stripe_to_pg: Vec<(PgId, StripeId)>,
}

impl WriteBatch<'_> {
    pub fn put<T: Serialize>(&mut self, key: MetaKey, value: &T) -> Result<()> {
        self.records.push((key.0, bincode::serialize(value)?));
        Ok(())
    }

    pub fn put_stripe_to_pg(&mut self, stripe_id: StripeId, pg_id: PgId) {
        self.stripe_to_pg.push((pg_id, stripe_id));
    }

    /// Commit everything atomically, then merge the reverse-index entries
    /// into the in-memory map.
    pub fn flush(self) -> Result<()> {
        let txn = self.store.db.begin_write().map_err(redb::Error::from)?;
        {
            let mut table = txn.open_table(META_TABLE).map_err(redb::Error::from)?;
            for (key, value) in &self.records {
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(redb::Error::from)?;
            }
        }
        txn.commit().map_err(redb::Error::from)?;
        self.store.pg_map.merge(&self.stripe_to_pg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stripeio_common::BlobMeta;

    #[test]
    fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        let blob = BlobMeta {
            blob_id: 11,
            stripe_id: 3,
            blob_index: 0,
            size: 4096,
            offset: 0,
        };
        let key = MetaKey::for_id(MetaType::Blob, blob.blob_id);
        store.put(key, &blob).unwrap();
        let loaded: BlobMeta = store.get(key).unwrap();
        assert_eq!(loaded, blob);
    }

    #[test]
    fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        let key = MetaKey::for_id(MetaType::Stripe, 999);
        assert!(matches!(
            store.get::<BlobMeta>(key),
            Err(MetaError::NotFound)
        ));
    }

    #[test]
    fn batch_merges_reverse_index_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        let mut batch = store.batch();
        batch.put_stripe_to_pg(5, 2);
        batch.put_stripe_to_pg(3, 2);
        batch.put_stripe_to_pg(9, 7);
        batch.flush().unwrap();

        assert_eq!(store.pg_stripes(2), Some(vec![3, 5]));
        assert_eq!(store.pg_stripes(7), Some(vec![9]));
        assert_eq!(store.pg_stripes(1), None);
    }

    #[test]
    fn pg_map_survives_persist_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let key = MetaKey::for_workspace(MetaType::PgMap, "ws");
        {
            let store = MetaStore::open(dir.path()).unwrap();
            let mut batch = store.batch();
            batch.put_stripe_to_pg(1, 0);
            batch.put_stripe_to_pg(2, 0);
            batch.flush().unwrap();
            store.persist_pg_map_as(key).unwrap();
        }
        let store = MetaStore::open(dir.path()).unwrap();
        assert_eq!(store.pg_stripes(0), None);
        store.load_pg_map_from(key).unwrap();
        assert_eq!(store.pg_stripes(0), Some(vec![1, 2]));
    }

    #[test]
    fn chunk_keys_distinguish_indices() {
        let a = MetaKey::for_chunk(ChunkId {
            stripe_id: 4,
            chunk_index: 0,
        });
        let b = MetaKey::for_chunk(ChunkId {
            stripe_id: 4,
            chunk_index: 1,
        });
        assert_ne!(a, b);
    }
}
