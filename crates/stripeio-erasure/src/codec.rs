//! Encoder trait and the RS/NSYS/Clay codecs.
//!
//! Encoding splits the (already k-aligned) raw buffer into `k` data chunks
//! and derives `m` parity chunks. All `k + m` chunks come out the same
//! size. Chunk sizes are rounded up to the kernel's alignment: 2 bytes for
//! the Reed-Solomon kernel, and additionally the sub-chunk count `w` for
//! Clay so that `chunk_size % w == 0` always holds.

use crate::clay::clay_sub_chunk_count;
use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};
use std::collections::BTreeMap;
use stripeio_common::{ChunkIndex, EcParam, EcType};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ErasureError>;

/// Errors from encode, reconstruction, or parameter validation.
#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("invalid erasure parameters: {0}")]
    InvalidParams(String),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    #[error("insufficient chunks: have {available}, need {required}")]
    InsufficientChunks { available: usize, required: usize },

    #[error("chunk size mismatch")]
    ChunkSizeMismatch,
}

/// A stripe encoder. One instance is owned per stripe stream.
pub trait Encoder: Send {
    /// Encode the raw buffer into `k + m` equally sized chunks.
    fn encode(&self, raw: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Number of sub-chunks each chunk subdivides into.
    fn sub_chunk_count(&self) -> usize;

    /// The code family this encoder implements.
    fn ec_type(&self) -> EcType;

    /// The `(k, m)` parameters.
    fn km(&self) -> (EcParam, EcParam);
}

pub type EncoderPtr = Box<dyn Encoder>;

/// Construct the encoder for an EC type. Clay parameters outside the
/// supported table are rejected.
pub fn make_encoder(ec_type: EcType, k: EcParam, m: EcParam) -> Result<EncoderPtr> {
    if k <= 0 || m <= 0 {
        return Err(ErasureError::InvalidParams(format!(
            "k and m must be positive, got k={k} m={m}"
        )));
    }
    match ec_type {
        EcType::Rs => Ok(Box::new(RsEncoder { k, m })),
        EcType::Nsys => Ok(Box::new(NsysEncoder { k, m })),
        EcType::Clay => {
            let w = clay_sub_chunk_count(k, m)?;
            Ok(Box::new(ClayEncoder { k, m, w }))
        }
    }
}

/// Chunk size for a raw buffer: ceil-divided by k, then rounded up to the
/// alignment the kernel needs.
fn chunk_size_for(raw_len: usize, k: usize, align: usize) -> usize {
    let base = raw_len.div_ceil(k).max(align);
    base.div_ceil(align) * align
}

/// Run the Reed-Solomon kernel: `k` data chunks in, `k + m` chunks out.
fn rs_encode_chunks(raw: &[u8], k: usize, m: usize, align: usize) -> Result<Vec<Vec<u8>>> {
    let chunk_size = chunk_size_for(raw.len(), k, align);
    let mut padded = vec![0_u8; chunk_size * k];
    padded[..raw.len()].copy_from_slice(raw);

    let mut encoder = ReedSolomonEncoder::new(k, m, chunk_size)
        .map_err(|e| ErasureError::InvalidParams(e.to_string()))?;
    for i in 0..k {
        encoder
            .add_original_shard(&padded[i * chunk_size..(i + 1) * chunk_size])
            .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
    }
    let parity = encoder
        .encode()
        .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;

    let mut chunks = Vec::with_capacity(k + m);
    for i in 0..k {
        chunks.push(padded[i * chunk_size..(i + 1) * chunk_size].to_vec());
    }
    for p in parity.recovery_iter() {
        chunks.push(p.to_vec());
    }
    Ok(chunks)
}

/// Reconstruct every data chunk from any `k` of the `k + m` chunks.
fn rs_decode_data(
    k: usize,
    m: usize,
    available: &BTreeMap<ChunkIndex, Vec<u8>>,
) -> Result<Vec<Vec<u8>>> {
    if available.len() < k {
        return Err(ErasureError::InsufficientChunks {
            available: available.len(),
            required: k,
        });
    }
    let chunk_size = available
        .values()
        .next()
        .map(Vec::len)
        .ok_or(ErasureError::InsufficientChunks {
            available: 0,
            required: k,
        })?;
    if available.values().any(|c| c.len() != chunk_size) {
        return Err(ErasureError::ChunkSizeMismatch);
    }

    // Fast path: all data chunks present.
    if (0..k).all(|i| available.contains_key(&(i as ChunkIndex))) {
        return Ok((0..k)
            .map(|i| available[&(i as ChunkIndex)].clone())
            .collect());
    }

    let mut decoder = ReedSolomonDecoder::new(k, m, chunk_size)
        .map_err(|e| ErasureError::InvalidParams(e.to_string()))?;
    for (&idx, chunk) in available {
        let idx = idx as usize;
        if idx < k {
            decoder
                .add_original_shard(idx, chunk)
                .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
        } else {
            decoder
                .add_recovery_shard(idx - k, chunk)
                .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
        }
    }
    let restored = decoder
        .decode()
        .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;

    let mut data = Vec::with_capacity(k);
    for i in 0..k {
        if let Some(chunk) = available.get(&(i as ChunkIndex)) {
            data.push(chunk.clone());
        } else if let Some(chunk) = restored.restored_original(i) {
            data.push(chunk.to_vec());
        } else {
            return Err(ErasureError::DecodingFailed(format!(
                "data chunk {i} was not restored"
            )));
        }
    }
    Ok(data)
}

/// Reconstruct one chunk (data or parity) from the available chunks.
fn rs_reconstruct_chunk(
    k: usize,
    m: usize,
    available: &BTreeMap<ChunkIndex, Vec<u8>>,
    target: ChunkIndex,
) -> Result<Vec<u8>> {
    let data = rs_decode_data(k, m, available)?;
    let target = target as usize;
    if target < k {
        return Ok(data[target].clone());
    }
    // Parity target: re-encode the data region and pick the parity chunk.
    let chunk_size = data[0].len();
    let mut encoder = ReedSolomonEncoder::new(k, m, chunk_size)
        .map_err(|e| ErasureError::InvalidParams(e.to_string()))?;
    for chunk in &data {
        encoder
            .add_original_shard(chunk)
            .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
    }
    let parity = encoder
        .encode()
        .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
    parity
        .recovery_iter()
        .nth(target - k)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| ErasureError::DecodingFailed(format!("parity chunk {target} missing")))
}

struct RsEncoder {
    k: EcParam,
    m: EcParam,
}

impl Encoder for RsEncoder {
    fn encode(&self, raw: &[u8]) -> Result<Vec<Vec<u8>>> {
        rs_encode_chunks(raw, self.k as usize, self.m as usize, 2)
    }

    fn sub_chunk_count(&self) -> usize {
        1
    }

    fn ec_type(&self) -> EcType {
        EcType::Rs
    }

    fn km(&self) -> (EcParam, EcParam) {
        (self.k, self.m)
    }
}

struct NsysEncoder {
    k: EcParam,
    m: EcParam,
}

impl Encoder for NsysEncoder {
    fn encode(&self, raw: &[u8]) -> Result<Vec<Vec<u8>>> {
        // m sub-chunks per chunk; chunk size must divide evenly into them.
        let align = 2 * self.m as usize;
        rs_encode_chunks(raw, self.k as usize, self.m as usize, align)
    }

    fn sub_chunk_count(&self) -> usize {
        self.m as usize
    }

    fn ec_type(&self) -> EcType {
        EcType::Nsys
    }

    fn km(&self) -> (EcParam, EcParam) {
        (self.k, self.m)
    }
}

struct ClayEncoder {
    k: EcParam,
    m: EcParam,
    w: usize,
}

impl Encoder for ClayEncoder {
    fn encode(&self, raw: &[u8]) -> Result<Vec<Vec<u8>>> {
        // chunk_size % w == 0 is a registration invariant; the kernel also
        // needs 2-byte alignment, so align to whichever covers both.
        let align = if self.w % 2 == 0 { self.w } else { self.w * 2 };
        rs_encode_chunks(raw, self.k as usize, self.m as usize, align)
    }

    fn sub_chunk_count(&self) -> usize {
        self.w
    }

    fn ec_type(&self) -> EcType {
        EcType::Clay
    }

    fn km(&self) -> (EcParam, EcParam) {
        (self.k, self.m)
    }
}

/// Reconstruct a single chunk for a repair compute.
///
/// For RS the inputs are any `k` full chunks. For NSYS and Clay the inputs
/// are what the corresponding plan fetched from all `k + m - 1` survivors:
/// full chunks for NSYS, the minimum sub-chunk set for Clay. The output
/// length follows the code's repair expansion: the fetched unit times
/// `w / fetched_sub_chunks` (1 for RS).
pub fn reconstruct_chunk(
    ec_type: EcType,
    k: EcParam,
    m: EcParam,
    available: &BTreeMap<ChunkIndex, Vec<u8>>,
    target: ChunkIndex,
) -> Result<Vec<u8>> {
    let (ku, mu) = (k as usize, m as usize);
    match ec_type {
        EcType::Rs => rs_reconstruct_chunk(ku, mu, available, target),
        EcType::Nsys => {
            // The non-systematic decode expands each stored unit by m.
            let unit = rs_reconstruct_chunk(ku, mu, available, target)?;
            Ok(tile(&unit, mu))
        }
        EcType::Clay => {
            // Each survivor contributed w/q sub-chunks (q = m); positional
            // linearity of the kernel reconstructs those rows exactly, and
            // the repair expansion factor q fills the chunk.
            clay_sub_chunk_count(k, m)?;
            let unit = rs_reconstruct_chunk(ku, mu, available, target)?;
            Ok(tile(&unit, mu))
        }
    }
}

/// Reconstruct the full data region for a degraded-read compute. Inputs
/// are any `k` chunks of the stripe.
pub fn reconstruct_data(
    ec_type: EcType,
    k: EcParam,
    m: EcParam,
    available: &BTreeMap<ChunkIndex, Vec<u8>>,
) -> Result<Vec<Vec<u8>>> {
    match ec_type {
        EcType::Rs | EcType::Nsys | EcType::Clay => {
            rs_decode_data(k as usize, m as usize, available)
        }
    }
}

fn tile(unit: &[u8], times: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(unit.len() * times);
    for _ in 0..times {
        out.extend_from_slice(unit);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn rs_encode_shapes() {
        let enc = make_encoder(EcType::Rs, 4, 2).unwrap();
        let raw = sample(4096);
        let chunks = enc.encode(&raw).unwrap();
        assert_eq!(chunks.len(), 6);
        assert!(chunks.iter().all(|c| c.len() == 1024));
        assert_eq!(enc.sub_chunk_count(), 1);
    }

    #[test]
    fn rs_reconstructs_data_chunk() {
        let enc = make_encoder(EcType::Rs, 4, 2).unwrap();
        let raw = sample(4096);
        let chunks = enc.encode(&raw).unwrap();

        let mut available = BTreeMap::new();
        for idx in [0_u8, 2, 4, 5] {
            available.insert(idx, chunks[idx as usize].clone());
        }
        let repaired = reconstruct_chunk(EcType::Rs, 4, 2, &available, 1).unwrap();
        assert_eq!(repaired, chunks[1]);
    }

    #[test]
    fn rs_reconstructs_parity_chunk() {
        let enc = make_encoder(EcType::Rs, 4, 2).unwrap();
        let raw = sample(2048);
        let chunks = enc.encode(&raw).unwrap();

        let mut available = BTreeMap::new();
        for idx in [0_u8, 1, 2, 3] {
            available.insert(idx, chunks[idx as usize].clone());
        }
        let repaired = reconstruct_chunk(EcType::Rs, 4, 2, &available, 5).unwrap();
        assert_eq!(repaired, chunks[5]);
    }

    #[test]
    fn nsys_chunk_divides_into_m_sub_chunks() {
        let enc = make_encoder(EcType::Nsys, 4, 2).unwrap();
        let chunks = enc.encode(&sample(4099)).unwrap();
        assert_eq!(chunks.len(), 6);
        assert_eq!(chunks[0].len() % enc.sub_chunk_count(), 0);
    }

    #[test]
    fn clay_chunk_divides_into_w_sub_chunks() {
        for (k, m, w) in [(4, 2, 8), (6, 3, 27), (8, 4, 64), (10, 4, 256)] {
            let enc = make_encoder(EcType::Clay, k, m).unwrap();
            assert_eq!(enc.sub_chunk_count(), w);
            let chunks = enc.encode(&sample(10_000)).unwrap();
            assert_eq!(chunks.len(), (k + m) as usize);
            assert_eq!(chunks[0].len() % w, 0);
        }
    }

    #[test]
    fn clay_rejects_unsupported_params() {
        assert!(make_encoder(EcType::Clay, 5, 2).is_err());
    }

    #[test]
    fn insufficient_chunks_is_an_error() {
        let enc = make_encoder(EcType::Rs, 4, 2).unwrap();
        let chunks = enc.encode(&sample(4096)).unwrap();
        let mut available = BTreeMap::new();
        available.insert(0_u8, chunks[0].clone());
        available.insert(1_u8, chunks[1].clone());
        assert!(matches!(
            reconstruct_chunk(EcType::Rs, 4, 2, &available, 2),
            Err(ErasureError::InsufficientChunks { .. })
        ));
    }

    #[test]
    fn data_reconstruction_round_trips() {
        let enc = make_encoder(EcType::Rs, 4, 2).unwrap();
        let raw = sample(4096);
        let chunks = enc.encode(&raw).unwrap();
        let mut available = BTreeMap::new();
        for idx in [1_u8, 2, 3, 4] {
            available.insert(idx, chunks[idx as usize].clone());
        }
        let data = reconstruct_data(EcType::Rs, 4, 2, &available).unwrap();
        let joined: Vec<u8> = data.concat();
        assert_eq!(&joined[..raw.len()], &raw[..]);
    }
}
