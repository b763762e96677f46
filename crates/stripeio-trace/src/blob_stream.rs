//! Blob merge streams.
//!
//! Every stream pulls eligible records from a trace reader, synthesizes
//! the blob bytes, and groups them into merge buffers. A record smaller
//! than 32 bytes is always skipped; a record larger than the merge size is
//! emitted on its own.

use crate::merge::{synth_data, ChunkMerger};
use crate::reader::TraceReader;
use crate::{Result, TraceError};
use lru::LruCache;
use std::collections::BTreeMap;
use stripeio_common::{BlobIndex, BlobMeta};
use tracing::debug;

/// Records below this size are dropped on the floor.
pub const EXTRA_SMALL_SIZE: usize = 32;

/// A stream of merged blob groups.
pub trait MergeStream: Send {
    /// Next group: the blob metadata (offsets into the returned buffer)
    /// and the merged bytes.
    fn next_merge(&mut self) -> Result<(Vec<BlobMeta>, Vec<u8>)>;

    fn merge_size(&self) -> usize;
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

fn single_blob(blob_id: u64, data: Vec<u8>) -> (Vec<BlobMeta>, Vec<u8>) {
    let meta = BlobMeta {
        blob_id,
        stripe_id: 0,
        blob_index: 0,
        size: data.len(),
        offset: 0,
    };
    (vec![meta], data)
}

/// Reshape a merged buffer so that, for each of `k` slices, the `i`-th
/// `1/k` of every blob is concatenated in blob order. Blob sizes must
/// divide by `k`.
pub(crate) fn rearrange_split(raw: &[u8], blobs: &[BlobMeta], k: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    for i in 0..k {
        for blob in blobs {
            if blob.size % k != 0 {
                return Err(TraceError::Layout(format!(
                    "blob {} size {} not divisible by {k}",
                    blob.blob_id, blob.size
                )));
            }
            let slice = blob.size / k;
            let offset = blob.offset + i * slice;
            if offset + slice > raw.len() {
                return Err(TraceError::Layout(format!(
                    "blob {} slice {offset}..{} outside merged buffer of {}",
                    blob.blob_id,
                    offset + slice,
                    raw.len()
                )));
            }
            out.extend_from_slice(&raw[offset..offset + slice]);
        }
    }
    Ok(out)
}

/// Emits every eligible record immediately as a one-blob group.
pub struct NoneMergeStream {
    reader: Box<dyn TraceReader>,
}

impl NoneMergeStream {
    pub fn new(reader: Box<dyn TraceReader>) -> Self {
        Self { reader }
    }
}

impl MergeStream for NoneMergeStream {
    fn next_merge(&mut self) -> Result<(Vec<BlobMeta>, Vec<u8>)> {
        loop {
            let trace = self.reader.next_trace()?;
            if trace.size < EXTRA_SMALL_SIZE {
                continue;
            }
            return Ok(single_blob(trace.blob_id, synth_data(trace.size)));
        }
    }

    fn merge_size(&self) -> usize {
        0
    }
}

/// Merges to exactly `merge_size`, truncating the blob that crosses the
/// boundary.
pub struct FixedSizeMergeStream {
    reader: Box<dyn TraceReader>,
    merge_size: usize,
    buf: Vec<u8>,
    blobs: Vec<BlobMeta>,
}

impl FixedSizeMergeStream {
    pub fn new(reader: Box<dyn TraceReader>, merge_size: usize) -> Self {
        Self {
            reader,
            merge_size,
            buf: Vec::new(),
            blobs: Vec::new(),
        }
    }
}

impl MergeStream for FixedSizeMergeStream {
    fn next_merge(&mut self) -> Result<(Vec<BlobMeta>, Vec<u8>)> {
        loop {
            let mut trace = self.reader.next_trace()?;
            if trace.size < EXTRA_SMALL_SIZE {
                continue;
            }
            if trace.size > self.merge_size {
                // Oversized blobs are clamped to one full merge.
                trace.size = self.merge_size;
                return Ok(single_blob(trace.blob_id, synth_data(trace.size)));
            }
            if self.buf.len() + trace.size >= self.merge_size {
                let fill = self.merge_size - self.buf.len();
                let offset = self.buf.len();
                self.blobs.push(BlobMeta {
                    blob_id: trace.blob_id,
                    stripe_id: 0,
                    blob_index: self.blobs.len() as BlobIndex,
                    size: fill,
                    offset,
                });
                self.buf.extend_from_slice(&synth_data(fill));
                let buf = std::mem::take(&mut self.buf);
                self.buf.reserve(self.merge_size);
                return Ok((std::mem::take(&mut self.blobs), buf));
            }
            let offset = self.buf.len();
            self.blobs.push(BlobMeta {
                blob_id: trace.blob_id,
                stripe_id: 0,
                blob_index: self.blobs.len() as BlobIndex,
                size: trace.size,
                offset,
            });
            self.buf.extend_from_slice(&synth_data(trace.size));
        }
    }

    fn merge_size(&self) -> usize {
        self.merge_size
    }
}

/// Merges until the buffer fills; flushes the partial buffer on exhaust.
pub struct BasicMergeStream {
    reader: Box<dyn TraceReader>,
    merger: ChunkMerger,
    blobs: Vec<BlobMeta>,
}

impl BasicMergeStream {
    pub fn new(reader: Box<dyn TraceReader>, merge_size: usize) -> Self {
        Self {
            reader,
            merger: ChunkMerger::new(merge_size),
            blobs: Vec::new(),
        }
    }
}

impl MergeStream for BasicMergeStream {
    fn next_merge(&mut self) -> Result<(Vec<BlobMeta>, Vec<u8>)> {
        loop {
            let trace = match self.reader.next_trace() {
                Ok(trace) => trace,
                Err(TraceError::Exhaust) if !self.blobs.is_empty() => {
                    return Ok((std::mem::take(&mut self.blobs), self.merger.flush()));
                }
                Err(e) => return Err(e),
            };
            if trace.size < EXTRA_SMALL_SIZE {
                continue;
            }
            let data = synth_data(trace.size);
            if trace.size > self.merger.merge_size() {
                return Ok(single_blob(trace.blob_id, data));
            }
            let (offset, merged) = self.merger.merge(&data);
            self.blobs.push(BlobMeta {
                blob_id: trace.blob_id,
                stripe_id: 0,
                blob_index: self.blobs.len() as BlobIndex,
                size: trace.size,
                offset,
            });
            if let Some(buf) = merged {
                return Ok((std::mem::take(&mut self.blobs), buf));
            }
        }
    }

    fn merge_size(&self) -> usize {
        self.merger.merge_size()
    }
}

/// Like `BasicMergeStream`, but each blob is padded up to the next
/// multiple of `atomic_size` before merging. The padding is opaque and
/// counted in the blob's registered size.
pub struct PaddingMergeStream {
    reader: Box<dyn TraceReader>,
    merger: ChunkMerger,
    blobs: Vec<BlobMeta>,
    atomic_size: usize,
}

impl PaddingMergeStream {
    pub fn new(reader: Box<dyn TraceReader>, merge_size: usize, atomic_size: usize) -> Self {
        Self {
            reader,
            merger: ChunkMerger::new(merge_size),
            blobs: Vec::new(),
            atomic_size,
        }
    }
}

impl MergeStream for PaddingMergeStream {
    fn next_merge(&mut self) -> Result<(Vec<BlobMeta>, Vec<u8>)> {
        loop {
            let trace = match self.reader.next_trace() {
                Ok(trace) => trace,
                Err(TraceError::Exhaust) if !self.blobs.is_empty() => {
                    return Ok((std::mem::take(&mut self.blobs), self.merger.flush()));
                }
                Err(e) => return Err(e),
            };
            if trace.size < EXTRA_SMALL_SIZE {
                continue;
            }
            let mut data = synth_data(trace.size);
            if trace.size > self.merger.merge_size() {
                return Ok(single_blob(trace.blob_id, data));
            }
            data.resize(round_up(data.len(), self.atomic_size), 0);
            let (offset, merged) = self.merger.merge(&data);
            self.blobs.push(BlobMeta {
                blob_id: trace.blob_id,
                stripe_id: 0,
                blob_index: self.blobs.len() as BlobIndex,
                size: data.len(),
                offset,
            });
            if let Some(buf) = merged {
                return Ok((std::mem::take(&mut self.blobs), buf));
            }
        }
    }

    fn merge_size(&self) -> usize {
        self.merger.merge_size()
    }
}

/// User-id membership bounded by a byte budget.
struct SizedLru {
    entries: LruCache<u64, usize>,
    used: usize,
    capacity: usize,
}

impl SizedLru {
    fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            used: 0,
            capacity,
        }
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn contains(&mut self, user_id: u64) -> bool {
        self.entries.get(&user_id).is_some()
    }

    fn insert(&mut self, user_id: u64, size: usize) {
        if let Some(old) = self.entries.pop(&user_id) {
            self.used -= old;
        }
        while self.used + size > self.capacity {
            match self.entries.pop_lru() {
                Some((_, victim)) => self.used -= victim,
                None => break,
            }
        }
        self.entries.push(user_id, size);
        self.used += size;
    }
}

/// Routes blobs by user locality.
///
/// Users currently in the LRU merge into a per-user buffer
/// (merge-before-split); everyone else is padded and merged into a shared
/// split-before-merge buffer whose emission is rearranged into `k` slices.
/// `last_merge_locality` reports which path produced the latest emission.
pub struct InterLocalityMergeStream {
    reader: Box<dyn TraceReader>,
    merge_size: usize,
    merge_map: BTreeMap<u64, (Vec<BlobMeta>, ChunkMerger)>,
    lru: SizedLru,
    sbm_merger: ChunkMerger,
    sbm_blobs: Vec<BlobMeta>,
    atomic_size: usize,
    hit_count: u64,
    miss_count: u64,
    last_locality: bool,
}

impl InterLocalityMergeStream {
    pub fn new(
        reader: Box<dyn TraceReader>,
        merge_size: usize,
        lru_capacity: usize,
        atomic_size: usize,
    ) -> Self {
        Self {
            reader,
            merge_size,
            merge_map: BTreeMap::new(),
            lru: SizedLru::new(lru_capacity),
            sbm_merger: ChunkMerger::new(merge_size),
            sbm_blobs: Vec::new(),
            atomic_size,
            hit_count: 0,
            miss_count: 0,
            last_locality: false,
        }
    }

    /// Whether the latest emission came from a locality hit.
    #[must_use]
    pub fn last_merge_locality(&self) -> bool {
        self.last_locality
    }

    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        self.hit_count as f64 / (self.hit_count + self.miss_count) as f64
    }

    fn flush_one(&mut self) -> Result<(Vec<BlobMeta>, Vec<u8>)> {
        match self.merge_map.pop_first() {
            Some((_, (blobs, mut merger))) => Ok((blobs, merger.flush())),
            None => Err(TraceError::Exhaust),
        }
    }
}

impl MergeStream for InterLocalityMergeStream {
    fn next_merge(&mut self) -> Result<(Vec<BlobMeta>, Vec<u8>)> {
        loop {
            let trace = match self.reader.next_trace() {
                Ok(trace) => trace,
                Err(TraceError::Exhaust) => return self.flush_one(),
                Err(e) => return Err(e),
            };

            // Admission happens before the size filters so small accesses
            // still refresh their user's locality window.
            let has_locality = self.lru.contains(trace.user_id);
            if trace.size <= self.lru.capacity() {
                let mut admitted = trace.size;
                if admitted <= self.merge_size && !has_locality {
                    admitted = round_up(admitted, self.atomic_size);
                }
                self.lru.insert(trace.user_id, admitted);
            }

            if trace.size < EXTRA_SMALL_SIZE {
                continue;
            }
            let mut data = synth_data(trace.size);
            if trace.size > self.merge_size {
                return Ok(single_blob(trace.blob_id, data));
            }

            if has_locality {
                self.hit_count += 1;
                let (blobs, merger) = self
                    .merge_map
                    .entry(trace.user_id)
                    .or_insert_with(|| (Vec::new(), ChunkMerger::new(self.merge_size)));
                let (offset, merged) = merger.merge(&data);
                blobs.push(BlobMeta {
                    blob_id: trace.blob_id,
                    stripe_id: 0,
                    blob_index: blobs.len() as BlobIndex,
                    size: trace.size,
                    offset,
                });
                if let Some(buf) = merged {
                    let emitted = std::mem::take(blobs);
                    self.last_locality = true;
                    debug!(hit_rate = self.hit_rate(), "locality merge emitted");
                    return Ok((emitted, buf));
                }
            } else {
                self.miss_count += 1;
                data.resize(round_up(data.len(), self.atomic_size), 0);
                let (offset, merged) = self.sbm_merger.merge(&data);
                self.sbm_blobs.push(BlobMeta {
                    blob_id: trace.blob_id,
                    stripe_id: 0,
                    blob_index: self.sbm_blobs.len() as BlobIndex,
                    size: data.len(),
                    offset,
                });
                if let Some(raw) = merged {
                    let rearranged =
                        rearrange_split(&raw, &self.sbm_blobs, self.atomic_size)?;
                    self.last_locality = false;
                    return Ok((std::mem::take(&mut self.sbm_blobs), rearranged));
                }
            }
        }
    }

    fn merge_size(&self) -> usize {
        self.merge_size
    }
}
