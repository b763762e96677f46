//! Trace ingestion and stripe synthesis.
//!
//! A trace reader chain (csv base, dedup filter, step-by skipper) feeds
//! blob merge streams, which feed stripe streams that encode merged
//! buffers into `k + m` chunks. Blob bytes are synthesized; only sizes and
//! ids come from the trace.

pub mod blob_stream;
pub mod merge;
pub mod reader;
pub mod stripe_stream;

use stripeio_erasure::ErasureError;
use thiserror::Error;

pub use blob_stream::{
    BasicMergeStream, FixedSizeMergeStream, InterLocalityMergeStream, MergeStream,
    NoneMergeStream, PaddingMergeStream,
};
pub use merge::{synth_data, ChunkMerger};
pub use reader::{make_trace_reader, CsvTraceReader, DedupReader, StepByReader, TraceReader,
    TraceRecord};
pub use stripe_stream::{
    BaselineStream, InterDegradeReadStream, InterLocalityStream, IntraDegradeReadStream,
    PartitionStream, SplitBeforeMergeStream, StripeItem, StripeStream,
};

pub type Result<T> = std::result::Result<T, TraceError>;

/// Failures along the trace -> merge -> stripe pipeline.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The trace has no more records. Not an error for BuildData.
    #[error("trace exhausted")]
    Exhaust,

    #[error("bad trace record: {0}")]
    BadRecord(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding failed: {0}")]
    Encode(#[from] ErasureError),

    #[error("blob layout violation: {0}")]
    Layout(String),
}

impl TraceError {
    /// True when the stream ended normally.
    #[must_use]
    pub fn is_exhaust(&self) -> bool {
        matches!(self, Self::Exhaust)
    }
}
