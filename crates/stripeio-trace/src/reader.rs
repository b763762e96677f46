//! Access-trace readers.
//!
//! The base reader parses the eleven-column anonymized blob-access CSV
//! (timestamp, region, user, app, function, blob name, blob type, etag,
//! bytes, read, write). String columns become stable 64-bit ids by
//! hashing. Composition order is base -> dedup -> optional step-by.

use crate::{Result, TraceError};
use std::collections::HashSet;
use std::path::Path;
use stripeio_common::BlobId;
use xxhash_rust::xxh64::xxh64;

/// Rough content class parsed from the blob-type column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobKind {
    Application,
    Image,
    Text,
    None,
    Other,
}

impl BlobKind {
    fn from_column(column: &str) -> Self {
        match column.split('/').nth(1) {
            Some("application") => Self::Application,
            Some("image") => Self::Image,
            Some("text") => Self::Text,
            Some("none") => Self::None,
            _ => Self::Other,
        }
    }
}

/// One access-trace record.
#[derive(Clone, Debug)]
pub struct TraceRecord {
    pub time_stamp: u64,
    pub region_id: u64,
    pub user_id: u64,
    pub app_id: u64,
    pub func_id: u64,
    pub blob_id: BlobId,
    pub blob_kind: BlobKind,
    pub version_tag: u64,
    pub size: usize,
    pub read: bool,
    pub write: bool,
}

/// Source of trace records. Exhaustion is `TraceError::Exhaust`.
pub trait TraceReader: Send {
    fn next_trace(&mut self) -> Result<TraceRecord>;
}

fn hash_column(column: &str) -> u64 {
    xxh64(column.as_bytes(), 0)
}

/// CSV-backed base reader. Malformed rows and zero-size records are
/// skipped.
pub struct CsvTraceReader {
    records: csv::StringRecordsIntoIter<std::io::BufReader<std::fs::File>>,
}

impl CsvTraceReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = csv::Reader::from_reader(std::io::BufReader::new(file));
        Ok(Self {
            records: reader.into_records(),
        })
    }

    fn parse(record: &csv::StringRecord) -> Option<TraceRecord> {
        let time_stamp = record.get(0)?.parse::<u64>().ok()?;
        let region = record.get(1)?;
        let user = record.get(2)?;
        let app = record.get(3)?;
        let func = record.get(4)?;
        let blob_name = record.get(5)?;
        let blob_kind = BlobKind::from_column(record.get(6)?);
        let etag = record.get(7)?;
        let size = record.get(8)?.parse::<f64>().unwrap_or_default().round() as usize;
        let read = record.get(9)?.to_lowercase().parse::<bool>().ok()?;
        let write = record.get(10)?.to_lowercase().parse::<bool>().ok()?;
        Some(TraceRecord {
            time_stamp,
            region_id: hash_column(region),
            user_id: hash_column(user),
            app_id: hash_column(app),
            func_id: hash_column(func),
            blob_id: hash_column(blob_name),
            blob_kind,
            version_tag: hash_column(etag),
            size,
            read,
            write,
        })
    }
}

impl TraceReader for CsvTraceReader {
    fn next_trace(&mut self) -> Result<TraceRecord> {
        for record in self.records.by_ref() {
            let Ok(record) = record else { continue };
            let Some(parsed) = Self::parse(&record) else {
                continue;
            };
            if parsed.size == 0 {
                continue;
            }
            return Ok(parsed);
        }
        Err(TraceError::Exhaust)
    }
}

/// Emits each blob id at most once.
pub struct DedupReader {
    inner: Box<dyn TraceReader>,
    seen: HashSet<BlobId>,
}

impl DedupReader {
    pub fn new(inner: Box<dyn TraceReader>) -> Self {
        Self {
            inner,
            seen: HashSet::new(),
        }
    }
}

impl TraceReader for DedupReader {
    fn next_trace(&mut self) -> Result<TraceRecord> {
        loop {
            let record = self.inner.next_trace()?;
            if self.seen.insert(record.blob_id) {
                return Ok(record);
            }
        }
    }
}

/// Consumes `step` records, then yields the next.
pub struct StepByReader {
    inner: Box<dyn TraceReader>,
    step: usize,
}

impl StepByReader {
    pub fn new(inner: Box<dyn TraceReader>, step: usize) -> Self {
        Self { inner, step }
    }
}

impl TraceReader for StepByReader {
    fn next_trace(&mut self) -> Result<TraceRecord> {
        for _ in 0..self.step {
            self.inner.next_trace()?;
        }
        self.inner.next_trace()
    }
}

/// Standard composition: base csv reader, dedup, then step-by when
/// `step_by > 1`.
pub fn make_trace_reader(path: &Path, step_by: usize) -> Result<Box<dyn TraceReader>> {
    let base = Box::new(CsvTraceReader::open(path)?);
    let dedup = Box::new(DedupReader::new(base));
    if step_by > 1 {
        Ok(Box::new(StepByReader::new(dedup, step_by)))
    } else {
        Ok(dedup)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory reader used across the crate's tests.
    pub struct VecReader {
        records: std::vec::IntoIter<TraceRecord>,
    }

    impl VecReader {
        pub fn new(records: Vec<TraceRecord>) -> Self {
            Self {
                records: records.into_iter(),
            }
        }
    }

    impl TraceReader for VecReader {
        fn next_trace(&mut self) -> Result<TraceRecord> {
            self.records.next().ok_or(TraceError::Exhaust)
        }
    }

    pub fn record(blob_id: BlobId, user_id: u64, size: usize) -> TraceRecord {
        TraceRecord {
            time_stamp: 0,
            region_id: 0,
            user_id,
            app_id: 0,
            func_id: 0,
            blob_id,
            blob_kind: BlobKind::Other,
            version_tag: 0,
            size,
            read: true,
            write: false,
        }
    }

    fn write_csv(rows: &[String]) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "Timestamp,AnonRegion,AnonUserId,AnonAppName,AnonFunctionInvocationId,\
             AnonBlobName,BlobType,AnonBlobETag,BlobBytes,Read,Write"
        )
        .unwrap();
        for row in rows {
            writeln!(file, "{row}").unwrap();
        }
        file
    }

    #[test]
    fn csv_reader_parses_and_skips_zero_size() {
        let file = write_csv(&[
            "1,r1,u1,a1,f1,blob-a,x/image,e1,100.4,True,False".to_string(),
            "2,r1,u1,a1,f1,blob-b,x/text,e2,0,True,False".to_string(),
            "3,r1,u2,a1,f1,blob-c,x/application,e3,64,False,True".to_string(),
        ]);
        let mut reader = CsvTraceReader::open(file.path()).unwrap();
        let a = reader.next_trace().unwrap();
        assert_eq!(a.size, 100);
        assert_eq!(a.blob_kind, BlobKind::Image);
        let c = reader.next_trace().unwrap();
        assert_eq!(c.size, 64);
        assert!(c.write);
        assert!(reader.next_trace().unwrap_err().is_exhaust());
    }

    #[test]
    fn dedup_emits_each_blob_once() {
        let records = vec![record(1, 0, 10), record(2, 0, 10), record(1, 0, 10)];
        let mut reader = DedupReader::new(Box::new(VecReader::new(records)));
        assert_eq!(reader.next_trace().unwrap().blob_id, 1);
        assert_eq!(reader.next_trace().unwrap().blob_id, 2);
        assert!(reader.next_trace().unwrap_err().is_exhaust());
    }

    #[test]
    fn step_by_skips_then_yields() {
        let records = (0_u64..10).map(|i| record(i, 0, 10)).collect();
        let mut reader = StepByReader::new(Box::new(VecReader::new(records)), 2);
        assert_eq!(reader.next_trace().unwrap().blob_id, 2);
        assert_eq!(reader.next_trace().unwrap().blob_id, 5);
        assert_eq!(reader.next_trace().unwrap().blob_id, 8);
        assert!(reader.next_trace().unwrap_err().is_exhaust());
    }
}
