//! Erasure codecs for stripeio
//!
//! Provides the `Encoder` trait the stripe streams encode through, the
//! worker-side reconstruction paths, and the Clay sub-chunk plan math the
//! task builders consume. The numeric kernel underneath is
//! `reed-solomon-simd`; NSYS and Clay wrap it while keeping their own
//! sub-chunk geometry, so a specialized kernel can be swapped in behind
//! the same trait.

pub mod clay;
pub mod codec;

pub use clay::{clay_sub_chunk_count, repair_sub_chunk_ranges};
pub use codec::{
    make_encoder, reconstruct_chunk, reconstruct_data, Encoder, EncoderPtr, ErasureError, Result,
};
