//! Identifiers, metadata records, and configuration-visible enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Stripe identifier, allocated monotonically by the metadata core.
pub type StripeId = u64;
/// Blob identifier carried over from the access trace. 0 is reserved.
pub type BlobId = u64;
/// Index of a blob within its stripe's merged buffer.
pub type BlobIndex = u32;
/// Worker node identifier.
pub type NodeId = u64;
/// Disk identifier; every disk belongs to exactly one node.
pub type DiskId = u32;
/// Placement-group identifier.
pub type PgId = u32;
/// Index of a chunk within its stripe (`< k + m`).
pub type ChunkIndex = u8;
/// Erasure-code parameter (k or m).
pub type EcParam = i32;
/// Worker address, host or host:port.
pub type Ip = String;

/// Erasure code families supported by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EcType {
    /// Systematic Reed-Solomon.
    #[serde(rename = "RS")]
    Rs = 0,
    /// Non-systematic code with `m` sub-chunks per chunk.
    #[serde(rename = "NSYS")]
    Nsys = 1,
    /// Clay code; sub-chunk count depends on `(k, m)`.
    #[serde(rename = "CLAY")]
    Clay = 2,
}

impl fmt::Display for EcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rs => write!(f, "RS"),
            Self::Nsys => write!(f, "NSYS"),
            Self::Clay => write!(f, "CLAY"),
        }
    }
}

impl FromStr for EcType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RS" => Ok(Self::Rs),
            "NSYS" => Ok(Self::Nsys),
            "CLAY" => Ok(Self::Clay),
            other => Err(Error::invalid_enum("ec_type", other)),
        }
    }
}

/// How a blob's bytes span the chunks of its stripe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlobLayout {
    /// Merge before split: a blob occupies a contiguous byte range of the
    /// pre-encode buffer.
    Horizontal = 0,
    /// Split before merge: each blob contributes one slice to every data
    /// chunk.
    Vertical = 1,
}

impl fmt::Display for BlobLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Horizontal => write!(f, "Horizontal"),
            Self::Vertical => write!(f, "Vertical"),
        }
    }
}

/// Disk registration record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskMeta {
    pub id: DiskId,
    pub node_id: NodeId,
}

/// Worker node registration record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub ip: Ip,
    pub disks: Vec<DiskId>,
}

/// A blob as registered within a stripe.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    /// Trace-derived blob id. 0 is reserved.
    pub blob_id: BlobId,
    /// Filled in at stripe registration.
    pub stripe_id: StripeId,
    pub blob_index: BlobIndex,
    pub size: usize,
    /// Byte offset in the stripe's merged buffer.
    pub offset: usize,
}

/// One chunk of an encoded stripe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub stripe_id: StripeId,
    pub chunk_index: ChunkIndex,
    pub size: usize,
}

/// Identity of a chunk: `(stripe, index)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    pub stripe_id: StripeId,
    pub chunk_index: ChunkIndex,
}

/// Registered stripe record. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeMeta {
    pub stripe_id: StripeId,
    pub k: EcParam,
    pub m: EcParam,
    pub ec_type: EcType,
    pub blob_layout: BlobLayout,
    pub chunk_size: usize,
    pub blobs: Vec<BlobMeta>,
    /// Always `k + m` entries, all of size `chunk_size`.
    pub chunks: Vec<ChunkMeta>,
}

/// Placement group: one disk per selected node, `k + m` in total.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgMeta {
    pub pg_id: PgId,
    pub k: EcParam,
    pub m: EcParam,
    pub disk_list: Vec<DiskId>,
}

/// Type tag prefixed to every metadata-store key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MetaType {
    Blob = 0,
    Stripe = 1,
    Disk = 2,
    Node = 3,
    Pg = 4,
    Chunk = 5,
    PgMap = 6,
    StripeRange = 7,
}

/// Coordinator action selected by configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    BuildData,
    RepairChunk,
    RepairFailureDomain,
    Read,
    DegradeRead,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildData => write!(f, "BuildData"),
            Self::RepairChunk => write!(f, "RepairChunk"),
            Self::RepairFailureDomain => write!(f, "RepairFailureDomain"),
            Self::Read => write!(f, "Read"),
            Self::DegradeRead => write!(f, "DegradeRead"),
        }
    }
}

impl FromStr for ActionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BuildData" => Ok(Self::BuildData),
            "RepairChunk" => Ok(Self::RepairChunk),
            "RepairFailureDomain" => Ok(Self::RepairFailureDomain),
            "Read" => Ok(Self::Read),
            "DegradeRead" => Ok(Self::DegradeRead),
            other => Err(Error::invalid_enum("action", other)),
        }
    }
}

/// Blob-merge scheme selected by configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeScheme {
    Fixed,
    Partition,
    Baseline,
    IntraLocality,
    InterLocality,
    IntraForDegradeRead,
    InterForDegradeRead,
}

impl fmt::Display for MergeScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => write!(f, "Fixed"),
            Self::Partition => write!(f, "Partition"),
            Self::Baseline => write!(f, "Baseline"),
            Self::IntraLocality => write!(f, "IntraLocality"),
            Self::InterLocality => write!(f, "InterLocality"),
            Self::IntraForDegradeRead => write!(f, "IntraForDegradeRead"),
            Self::InterForDegradeRead => write!(f, "InterForDegradeRead"),
        }
    }
}

impl FromStr for MergeScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Fixed" => Ok(Self::Fixed),
            "Partition" => Ok(Self::Partition),
            "Baseline" => Ok(Self::Baseline),
            "IntraLocality" => Ok(Self::IntraLocality),
            "InterLocality" => Ok(Self::InterLocality),
            "IntraForDegradeRead" => Ok(Self::IntraForDegradeRead),
            "InterForDegradeRead" => Ok(Self::InterForDegradeRead),
            other => Err(Error::invalid_enum("merge_scheme", other)),
        }
    }
}

/// Shape of a repair plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairManner {
    /// Gather all survivors at the repair target.
    Centralized,
    /// Forward partial parities hop by hop.
    Pipelined,
}

impl fmt::Display for RepairManner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Centralized => write!(f, "Centralized"),
            Self::Pipelined => write!(f, "Pipelined"),
        }
    }
}

impl FromStr for RepairManner {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Centralized" => Ok(Self::Centralized),
            "Pipelined" => Ok(Self::Pipelined),
            other => Err(Error::invalid_enum("manner", other)),
        }
    }
}

/// How `test_load` is counted during BuildData.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadType {
    /// One unit per stripe.
    ByStripe,
    /// One unit per stripe byte; config value is in GiB.
    BySize,
}

impl fmt::Display for LoadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByStripe => write!(f, "ByStripe"),
            Self::BySize => write!(f, "BySize"),
        }
    }
}

impl FromStr for LoadType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ByStripe" => Ok(Self::ByStripe),
            "BySize" => Ok(Self::BySize),
            other => Err(Error::invalid_enum("load_type", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ec_type_round_trips_through_strings() {
        for (s, t) in [("RS", EcType::Rs), ("NSYS", EcType::Nsys), ("CLAY", EcType::Clay)] {
            assert_eq!(s.parse::<EcType>().unwrap(), t);
            assert_eq!(t.to_string(), s);
        }
        assert!("rs".parse::<EcType>().is_err());
    }

    #[test]
    fn merge_scheme_parses_all_variants() {
        for s in [
            "Fixed",
            "Partition",
            "Baseline",
            "IntraLocality",
            "InterLocality",
            "IntraForDegradeRead",
            "InterForDegradeRead",
        ] {
            assert_eq!(s.parse::<MergeScheme>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn action_rejects_unknown() {
        assert!("Rebuild".parse::<ActionType>().is_err());
        assert_eq!(
            "RepairFailureDomain".parse::<ActionType>().unwrap(),
            ActionType::RepairFailureDomain
        );
    }
}
