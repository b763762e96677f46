//! Block-worker command wire type.
//!
//! The field order is part of the wire contract; rearranging it breaks
//! mixed-version clusters. Encoding is bincode with its default fixed-width
//! integer layout.

use crate::Result;
use serde::{Deserialize, Serialize};
use stripeio_common::{ChunkIndex, DiskId, EcParam, Ip, StripeId};

/// Command types dispatched by the block worker loop.
pub mod command_type {
    pub const READ_AND_CACHE_BLOCK: i32 = 0;
    pub const FETCH_COMPUTE_WRITE_BLOCK: i32 = 1;
    pub const READ_AND_CACHE_BLOCK_CLAY: i32 = 2;
    pub const FETCH_WRITE_BLOCK: i32 = 3;
}

/// Compute subtypes of `FETCH_COMPUTE_WRITE_BLOCK`.
pub mod compute_type {
    pub const CLAY_REPAIR: i32 = 0;
    pub const RS_REPAIR: i32 = 1;
    pub const NSYS_REPAIR: i32 = 2;
    pub const NSYS_READ: i32 = 3;
    pub const CLAY_READ: i32 = 4;
    pub const RS_READ: i32 = 5;

    /// Reads ACK on the read list; repairs write and ACK on the repair
    /// list.
    #[must_use]
    pub fn is_read(compute: i32) -> bool {
        matches!(compute, NSYS_READ | CLAY_READ | RS_READ)
    }
}

/// One block-worker command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCommand {
    pub command_type: i32,
    /// Index of the block within its stripe.
    pub block_id: ChunkIndex,
    pub offset: usize,
    pub size: usize,
    pub compute_type: i32,
    pub src_ips: Vec<Ip>,
    pub src_block_ids: Vec<ChunkIndex>,
    pub dest_block_id: ChunkIndex,
    pub block_num: usize,
    pub k: EcParam,
    pub m: EcParam,
    /// Byte offsets of the Clay sub-chunks to read.
    pub clay_offsets: Vec<usize>,
    pub stripe_id: StripeId,
    pub disk_id: DiskId,
}

impl BlockCommand {
    /// Read `size` bytes at `offset` of a local block and cache them for
    /// fetching.
    #[must_use]
    pub fn read_and_cache(
        block_id: ChunkIndex,
        offset: usize,
        size: usize,
        stripe_id: StripeId,
        disk_id: DiskId,
        k: EcParam,
        m: EcParam,
    ) -> Self {
        Self {
            command_type: command_type::READ_AND_CACHE_BLOCK,
            block_id,
            offset,
            size,
            stripe_id,
            disk_id,
            k,
            m,
            ..Self::default()
        }
    }

    /// Read `size` bytes at each Clay offset of a local block and cache
    /// the concatenation.
    #[must_use]
    pub fn read_and_cache_clay(
        block_id: ChunkIndex,
        clay_offsets: Vec<usize>,
        size: usize,
        stripe_id: StripeId,
        disk_id: DiskId,
        k: EcParam,
        m: EcParam,
    ) -> Self {
        Self {
            command_type: command_type::READ_AND_CACHE_BLOCK_CLAY,
            block_id,
            size,
            stripe_id,
            disk_id,
            k,
            m,
            clay_offsets,
            ..Self::default()
        }
    }

    /// Fetch from the sources, run the compute, then write (repair) or
    /// just ACK (read).
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn fetch_compute_write(
        block_id: ChunkIndex,
        compute: i32,
        src_ips: Vec<Ip>,
        src_block_ids: Vec<ChunkIndex>,
        dest_block_id: ChunkIndex,
        block_num: usize,
        stripe_id: StripeId,
        disk_id: DiskId,
        k: EcParam,
        m: EcParam,
    ) -> Self {
        Self {
            command_type: command_type::FETCH_COMPUTE_WRITE_BLOCK,
            block_id,
            compute_type: compute,
            src_ips,
            src_block_ids,
            dest_block_id,
            block_num,
            stripe_id,
            disk_id,
            k,
            m,
            ..Self::default()
        }
    }

    /// Fetch a chunk payload and write it to the local store (build path).
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn fetch_write(
        block_id: ChunkIndex,
        stripe_id: StripeId,
        disk_id: DiskId,
        src_ips: Vec<Ip>,
        src_block_ids: Vec<ChunkIndex>,
        offset: usize,
        size: usize,
        k: EcParam,
        m: EcParam,
    ) -> Self {
        Self {
            command_type: command_type::FETCH_WRITE_BLOCK,
            block_id,
            offset,
            size,
            src_ips,
            src_block_ids,
            stripe_id,
            disk_id,
            k,
            m,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let cmd = BlockCommand::fetch_compute_write(
            3,
            compute_type::RS_REPAIR,
            vec!["10.0.0.1".into(), "10.0.0.2".into()],
            vec![0, 1],
            3,
            4,
            99,
            12,
            4,
            2,
        );
        let bytes = cmd.encode().unwrap();
        let decoded = BlockCommand::decode(&bytes).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn clay_offsets_survive_the_wire() {
        let cmd = BlockCommand::read_and_cache_clay(1, vec![0, 4096, 12288], 4096, 7, 3, 4, 2);
        let decoded = BlockCommand::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded.clay_offsets, vec![0, 4096, 12288]);
        assert_eq!(decoded.command_type, command_type::READ_AND_CACHE_BLOCK_CLAY);
    }

    #[test]
    fn compute_type_read_classification() {
        assert!(compute_type::is_read(compute_type::NSYS_READ));
        assert!(compute_type::is_read(compute_type::CLAY_READ));
        assert!(compute_type::is_read(compute_type::RS_READ));
        assert!(!compute_type::is_read(compute_type::RS_REPAIR));
        assert!(!compute_type::is_read(compute_type::CLAY_REPAIR));
    }
}
