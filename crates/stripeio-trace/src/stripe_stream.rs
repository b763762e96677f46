//! Stripe streams: merge output -> encoded chunks.
//!
//! Every stream pads the raw buffer to a multiple of `k` and delegates to
//! an `Encoder`. The hybrid streams pick between a large-blob and a
//! small-blob encoder and set the blob layout accordingly.

use crate::blob_stream::{
    rearrange_split, InterLocalityMergeStream, MergeStream, PaddingMergeStream,
};
use crate::merge::synth_data;
use crate::reader::TraceReader;
use crate::{Result, TraceError};
use std::collections::VecDeque;
use stripeio_common::{BlobId, BlobIndex, BlobLayout, BlobMeta, EcType};
use stripeio_erasure::{Encoder, EncoderPtr};

/// One encoded stripe ready for registration and distribution.
#[derive(Debug)]
pub struct StripeItem {
    pub blobs: Vec<BlobMeta>,
    /// `k + m` chunks, all the same size.
    pub chunks: Vec<Vec<u8>>,
    pub ec_type: EcType,
    pub blob_layout: BlobLayout,
}

/// A stream of encoded stripes.
pub trait StripeStream: Send {
    fn next_stripe(&mut self) -> Result<StripeItem>;
}

fn pad_to_k(raw: &mut Vec<u8>, encoder: &dyn Encoder) {
    let k = encoder.km().0 as usize;
    let target = raw.len().div_ceil(k) * k;
    raw.resize(target, 0);
}

/// One encoder for every stripe; always horizontal.
pub struct BaselineStream {
    merge_stream: Box<dyn MergeStream>,
    encoder: EncoderPtr,
}

impl BaselineStream {
    pub fn new(merge_stream: Box<dyn MergeStream>, encoder: EncoderPtr) -> Self {
        Self {
            merge_stream,
            encoder,
        }
    }
}

impl StripeStream for BaselineStream {
    fn next_stripe(&mut self) -> Result<StripeItem> {
        let (blobs, mut raw) = self.merge_stream.next_merge()?;
        pad_to_k(&mut raw, self.encoder.as_ref());
        let chunks = self.encoder.encode(&raw)?;
        Ok(StripeItem {
            blobs,
            chunks,
            ec_type: self.encoder.ec_type(),
            blob_layout: BlobLayout::Horizontal,
        })
    }
}

/// Splits large merges into descending powers of two of the partition
/// size, encoding the slices with the large-blob encoder and the residual
/// tail with the small-blob encoder. Emitted items drain through a FIFO.
pub struct PartitionStream {
    merge_stream: Box<dyn MergeStream>,
    large_encoder: EncoderPtr,
    small_encoder: EncoderPtr,
    partition_size: usize,
    blob_count: BlobId,
    pending: VecDeque<StripeItem>,
}

impl PartitionStream {
    pub fn new(
        merge_stream: Box<dyn MergeStream>,
        large_encoder: EncoderPtr,
        small_encoder: EncoderPtr,
        partition_size: usize,
    ) -> Self {
        Self {
            merge_stream,
            large_encoder,
            small_encoder,
            partition_size,
            blob_count: 0,
            pending: VecDeque::new(),
        }
    }

    fn push_slice(&mut self, slice: &[u8], large: bool) -> Result<()> {
        let (chunks, ec_type) = {
            let encoder = if large {
                self.large_encoder.as_ref()
            } else {
                self.small_encoder.as_ref()
            };
            (encoder.encode(slice)?, encoder.ec_type())
        };
        let blob_id = self.blob_count;
        self.blob_count += 1;
        self.pending.push_back(StripeItem {
            blobs: vec![BlobMeta {
                blob_id,
                stripe_id: 0,
                blob_index: 0,
                size: slice.len(),
                offset: 0,
            }],
            chunks,
            ec_type,
            blob_layout: BlobLayout::Horizontal,
        });
        Ok(())
    }

    /// Carve `[begin, end)` into descending power-of-two multiples of
    /// `part`, deepest (largest) first.
    fn partition(&mut self, data: &[u8], begin: &mut usize, end: usize, part: usize) -> Result<()> {
        if end - *begin < part {
            return Ok(());
        }
        self.partition(data, begin, end, part * 2)?;
        while end - *begin >= part {
            self.push_slice(&data[*begin..*begin + part], true)?;
            *begin += part;
        }
        Ok(())
    }
}

impl StripeStream for PartitionStream {
    fn next_stripe(&mut self) -> Result<StripeItem> {
        if let Some(item) = self.pending.pop_front() {
            return Ok(item);
        }
        let (blobs, mut raw) = self.merge_stream.next_merge()?;
        if raw.len() >= self.partition_size {
            pad_to_k(&mut raw, self.large_encoder.as_ref());
            let mut begin = 0;
            let end = raw.len();
            let part = self.partition_size;
            self.partition(&raw, &mut begin, end, part)?;
            if begin < raw.len() {
                let tail = raw[begin..].to_vec();
                self.push_slice(&tail, false)?;
            }
            Ok(self.pending.pop_front().expect("partition emitted no item"))
        } else {
            pad_to_k(&mut raw, self.small_encoder.as_ref());
            let chunks = self.small_encoder.encode(&raw)?;
            Ok(StripeItem {
                blobs,
                chunks,
                ec_type: self.small_encoder.ec_type(),
                blob_layout: BlobLayout::Horizontal,
            })
        }
    }
}

/// Split-before-merge: padded merge, rearranged into `k` slices, encoded
/// vertically; oversized blobs take the large encoder horizontally.
pub struct SplitBeforeMergeStream {
    merge_stream: PaddingMergeStream,
    large_encoder: EncoderPtr,
    small_encoder: EncoderPtr,
}

impl SplitBeforeMergeStream {
    pub fn new(
        reader: Box<dyn TraceReader>,
        merge_size: usize,
        large_encoder: EncoderPtr,
        small_encoder: EncoderPtr,
    ) -> Self {
        let atomic = small_encoder.km().0 as usize;
        Self {
            merge_stream: PaddingMergeStream::new(reader, merge_size, atomic),
            large_encoder,
            small_encoder,
        }
    }
}

impl StripeStream for SplitBeforeMergeStream {
    fn next_stripe(&mut self) -> Result<StripeItem> {
        let (blobs, raw) = self.merge_stream.next_merge()?;
        if blobs.len() == 1 && raw.len() > self.merge_stream.merge_size() {
            let chunks = self.large_encoder.encode(&raw)?;
            return Ok(StripeItem {
                blobs,
                chunks,
                ec_type: self.large_encoder.ec_type(),
                blob_layout: BlobLayout::Horizontal,
            });
        }
        let k = self.small_encoder.km().0 as usize;
        let rearranged = rearrange_split(&raw, &blobs, k)?;
        let chunks = self.small_encoder.encode(&rearranged)?;
        Ok(StripeItem {
            blobs,
            chunks,
            ec_type: self.small_encoder.ec_type(),
            blob_layout: BlobLayout::Vertical,
        })
    }
}

/// Locality-routed hybrid: layout follows whether the last merge was a
/// locality hit.
pub struct InterLocalityStream {
    merge_stream: InterLocalityMergeStream,
    large_encoder: EncoderPtr,
    small_encoder: EncoderPtr,
}

impl InterLocalityStream {
    pub fn new(
        reader: Box<dyn TraceReader>,
        merge_size: usize,
        large_encoder: EncoderPtr,
        small_encoder: EncoderPtr,
        lru_capacity: usize,
    ) -> Self {
        let atomic = small_encoder.km().0 as usize;
        Self {
            merge_stream: InterLocalityMergeStream::new(reader, merge_size, lru_capacity, atomic),
            large_encoder,
            small_encoder,
        }
    }

    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        self.merge_stream.hit_rate()
    }
}

impl StripeStream for InterLocalityStream {
    fn next_stripe(&mut self) -> Result<StripeItem> {
        let (blobs, raw) = self.merge_stream.next_merge()?;
        if blobs.len() == 1 && raw.len() > self.merge_stream.merge_size() {
            let chunks = self.large_encoder.encode(&raw)?;
            return Ok(StripeItem {
                blobs,
                chunks,
                ec_type: self.large_encoder.ec_type(),
                blob_layout: BlobLayout::Horizontal,
            });
        }
        let chunks = self.small_encoder.encode(&raw)?;
        let blob_layout = if self.merge_stream.last_merge_locality() {
            BlobLayout::Horizontal
        } else {
            BlobLayout::Vertical
        };
        Ok(StripeItem {
            blobs,
            chunks,
            ec_type: self.small_encoder.ec_type(),
            blob_layout,
        })
    }
}

/// Synthetic single-blob stripes of a fixed block size. Clay only.
pub struct IntraDegradeReadStream {
    encoder: EncoderPtr,
    block_size: usize,
    next_blob_id: BlobId,
}

impl IntraDegradeReadStream {
    pub fn new(encoder: EncoderPtr, block_size: usize) -> Result<Self> {
        if encoder.ec_type() != EcType::Clay {
            return Err(TraceError::Layout(
                "intra-locality degraded-read stream requires CLAY".into(),
            ));
        }
        Ok(Self {
            encoder,
            block_size,
            next_blob_id: 0,
        })
    }
}

impl StripeStream for IntraDegradeReadStream {
    fn next_stripe(&mut self) -> Result<StripeItem> {
        let raw = synth_data(self.block_size);
        let chunks = self.encoder.encode(&raw)?;
        let blob_id = self.next_blob_id;
        self.next_blob_id += 1;
        Ok(StripeItem {
            blobs: vec![BlobMeta {
                blob_id,
                stripe_id: 0,
                blob_index: 0,
                size: self.block_size,
                offset: 0,
            }],
            chunks,
            ec_type: self.encoder.ec_type(),
            blob_layout: BlobLayout::Horizontal,
        })
    }
}

/// Synthetic stripes of `block_size / blob_size` equal blobs, laid out
/// vertically. Non-systematic code only.
pub struct InterDegradeReadStream {
    encoder: EncoderPtr,
    block_size: usize,
    blob_size: usize,
    next_blob_id: BlobId,
}

impl InterDegradeReadStream {
    pub fn new(encoder: EncoderPtr, block_size: usize, blob_size: usize) -> Result<Self> {
        if encoder.ec_type() != EcType::Nsys {
            return Err(TraceError::Layout(
                "inter-locality degraded-read stream requires NSYS".into(),
            ));
        }
        if blob_size == 0 || block_size % blob_size != 0 {
            return Err(TraceError::Layout(format!(
                "block size {block_size} not divisible by blob size {blob_size}"
            )));
        }
        Ok(Self {
            encoder,
            block_size,
            blob_size,
            next_blob_id: 0,
        })
    }
}

impl StripeStream for InterDegradeReadStream {
    fn next_stripe(&mut self) -> Result<StripeItem> {
        let raw = synth_data(self.block_size);
        let chunks = self.encoder.encode(&raw)?;
        let blob_count = self.block_size / self.blob_size;
        let mut blobs = Vec::with_capacity(blob_count);
        for i in 0..blob_count {
            let blob_id = self.next_blob_id;
            self.next_blob_id += 1;
            blobs.push(BlobMeta {
                blob_id,
                stripe_id: 0,
                blob_index: i as BlobIndex,
                size: self.blob_size,
                offset: i * self.blob_size,
            });
        }
        Ok(StripeItem {
            blobs,
            chunks,
            ec_type: self.encoder.ec_type(),
            blob_layout: BlobLayout::Vertical,
        })
    }
}
