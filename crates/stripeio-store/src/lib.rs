//! Key-addressed blob storage for worker nodes.
//!
//! A blob store maps an 8-byte key to a byte blob with positional reads
//! and writes. `LocalFsStore` keeps one file per key under a two-level
//! directory; `CachedStore` layers a byte-budgeted LRU with write-back
//! eviction and a size threshold above which operations bypass the cache.
//!
//! Concurrent reads are safe; concurrent writes to the same key are
//! serialized by the caller (the worker pipelines never write one key from
//! two stages).

pub mod cache;
pub mod local;

use thiserror::Error;

pub use cache::CachedStore;
pub use local::LocalFsStore;

/// Blob key: a `u64` in little-endian bytes.
pub type Key = [u8; 8];

/// Helper for the common `u64 -> Key` conversion.
pub trait AsKey {
    fn as_key(&self) -> Key;
}

impl AsKey for u64 {
    fn as_key(&self) -> Key {
        self.to_le_bytes()
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Blob store failure modes.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob not found")]
    NotFound,

    #[error("blob already exists")]
    AlreadyExists,

    #[error("range out of bounds or length mismatch")]
    Range,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The store contract the worker execution core runs against.
pub trait BlobStore: Send + Sync {
    fn contains(&self, key: Key) -> Result<bool>;

    /// Size of the stored blob in bytes.
    fn blob_size(&self, key: Key) -> Result<usize>;

    /// Atomically create a new blob. Fails if the key exists.
    fn create(&self, key: Key, value: &[u8]) -> Result<()>;

    /// Overwrite `value.len()` bytes at `offset` in place. The range must
    /// lie within the existing blob.
    fn put_at(&self, key: Key, value: &[u8], offset: usize) -> Result<()>;

    /// Replace the blob content, creating it if absent.
    fn put_or_create(&self, key: Key, value: &[u8]) -> Result<()>;

    /// Read the whole blob; `buf.len()` must equal the blob size.
    fn get_all(&self, key: Key, buf: &mut [u8]) -> Result<()>;

    /// Read `buf.len()` bytes starting at `offset`.
    fn get_at(&self, key: Key, buf: &mut [u8], offset: usize) -> Result<()>;

    fn remove(&self, key: Key) -> Result<()>;
}
