//! Metadata store and placement core.
//!
//! The metadata core owns every map the coordinator places and repairs
//! with: node/disk registrations, placement groups, the stripe-id counter,
//! and the durable records behind them. Durability is a redb database with
//! atomic write batches; stripe registration additionally maintains a
//! `pg -> stripes` reverse index and appends blob ids to a replayable
//! access log.

pub mod core;
pub mod placement;
pub mod recorder;
pub mod store;

use thiserror::Error;

pub use crate::core::{DiskRepairMeta, MetaCore, StripeRecord};
pub use placement::rjenkins_hash;
pub use recorder::BlobRecorder;
pub use store::{MetaKey, MetaStore, WriteBatch};

pub type Result<T> = std::result::Result<T, MetaError>;

/// Metadata-layer failures.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("metadata key not found")]
    NotFound,

    #[error("{0} is required to register a stripe")]
    MissingField(&'static str),

    #[error("pg {0} not found")]
    PgNotFound(u32),

    #[error("worker {0} not found")]
    WorkerNotFound(u64),

    #[error("database error: {0}")]
    Db(#[from] redb::Error),

    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
