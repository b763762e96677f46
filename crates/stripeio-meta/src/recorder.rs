//! Blob access log.
//!
//! One decimal blob id per line, appended at stripe registration and
//! replayed in insertion order by the Read and DegradeRead actions.

use crate::Result;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use stripeio_common::BlobId;

pub const BLOB_RECORD_FILE: &str = "blob_record";

/// Append/replay log of blob ids.
pub struct BlobRecorder {
    path: PathBuf,
    writer: Mutex<File>,
    reader: Mutex<Option<BufReader<File>>>,
}

impl BlobRecorder {
    /// Open the log under `dir`, truncating when `create_new` is set.
    pub fn open(dir: &Path, create_new: bool) -> Result<Self> {
        let path = dir.join(BLOB_RECORD_FILE);
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .truncate(false)
            .open(&path)?;
        if create_new {
            writer.set_len(0)?;
        }
        Ok(Self {
            path,
            writer: Mutex::new(writer),
            reader: Mutex::new(None),
        })
    }

    /// Truncate the log and reset the replay cursor.
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.set_len(0)?;
        writer.seek(SeekFrom::Start(0))?;
        *self.reader.lock() = None;
        Ok(())
    }

    /// Append one id.
    pub fn put_record(&self, blob_id: BlobId) -> Result<()> {
        let mut writer = self.writer.lock();
        writeln!(writer, "{blob_id}")?;
        Ok(())
    }

    /// Next id in insertion order; `None` once exhausted.
    pub fn next_record(&self) -> Result<Option<BlobId>> {
        let mut guard = self.reader.lock();
        if guard.is_none() {
            self.writer.lock().flush()?;
            *guard = Some(BufReader::new(File::open(&self.path)?));
        }
        let reader = guard.as_mut().unwrap();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            if let Ok(id) = line.trim().parse::<BlobId>() {
                return Ok(Some(id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = BlobRecorder::open(dir.path(), true).unwrap();
        for id in [4_u64, 1, 9, 1] {
            recorder.put_record(id).unwrap();
        }
        let mut replayed = Vec::new();
        while let Some(id) = recorder.next_record().unwrap() {
            replayed.push(id);
        }
        assert_eq!(replayed, vec![4, 1, 9, 1]);
    }

    #[test]
    fn clear_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = BlobRecorder::open(dir.path(), true).unwrap();
        recorder.put_record(8).unwrap();
        recorder.clear().unwrap();
        assert_eq!(recorder.next_record().unwrap(), None);
    }

    #[test]
    fn reopen_without_truncate_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let recorder = BlobRecorder::open(dir.path(), true).unwrap();
            recorder.put_record(3).unwrap();
        }
        let recorder = BlobRecorder::open(dir.path(), false).unwrap();
        assert_eq!(recorder.next_record().unwrap(), Some(3));
    }
}
