//! Task plans: the commands a coordinator pushes to workers.
//!
//! A builder turns one failed chunk or one blob sub-range into an ordered
//! list of per-worker commands plus the matching recipient addresses. The
//! last recipient of every plan is the ACK sink the coordinator pops to
//! learn completion.

pub mod block;
pub mod command;
pub mod pipeline;

use thiserror::Error;

pub use block::{
    clay_centralized_read, clay_centralized_repair, nsys_centralized_read,
    nsys_centralized_repair, rs_centralized_repair, BlockPlan,
};
pub use command::{compute_type, BlockCommand};
pub use pipeline::{
    load_clay_pipeline_plan, nsys_pipelined_repair, rs_pipelined_repair, ClayPipelinePlan,
    Command, PipelinePlan,
};

pub type Result<T> = std::result::Result<T, TaskError>;

/// Plan construction failures.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid plan parameters: {0}")]
    InvalidParams(String),

    #[error("erasure plan failed: {0}")]
    Erasure(#[from] stripeio_erasure::ErasureError),

    #[error("command codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("plan file error: {0}")]
    PlanFile(#[from] std::io::Error),
}
