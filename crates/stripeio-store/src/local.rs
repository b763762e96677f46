//! File-backed blob store.

use crate::{BlobStore, Key, Result, StoreError};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// One file per key under `root`, addressed by the hex form of the key
/// split into two path segments to keep directory fan-out bounded.
pub struct LocalFsStore {
    root: PathBuf,
}

impl LocalFsStore {
    /// Open a store rooted at an existing directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("store root {} not found", root.display()),
            )));
        }
        Ok(Self { root })
    }

    fn key_path(&self, key: &Key) -> PathBuf {
        let hexed = hex::encode(key);
        let (dir, file) = hexed.split_at(hexed.len() / 2);
        self.root.join(dir).join(file)
    }

    fn open_existing(path: &Path) -> Result<fs::File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StoreError::NotFound,
                _ => StoreError::Io(e),
            })
    }
}

impl BlobStore for LocalFsStore {
    fn contains(&self, key: Key) -> Result<bool> {
        Ok(self.key_path(&key).try_exists()?)
    }

    fn blob_size(&self, key: Key) -> Result<usize> {
        let meta = self.key_path(&key).metadata().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound
            } else {
                StoreError::Io(e)
            }
        })?;
        Ok(meta.len() as usize)
    }

    fn create(&self, key: Key, value: &[u8]) -> Result<()> {
        let path = self.key_path(&key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => StoreError::AlreadyExists,
                _ => StoreError::Io(e),
            })?;
        file.write_all(value)?;
        Ok(())
    }

    fn put_at(&self, key: Key, value: &[u8], offset: usize) -> Result<()> {
        let path = self.key_path(&key);
        let mut file = Self::open_existing(&path)?;
        let len = file.metadata()?.len() as usize;
        if offset + value.len() > len {
            return Err(StoreError::Range);
        }
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(value)?;
        Ok(())
    }

    fn put_or_create(&self, key: Key, value: &[u8]) -> Result<()> {
        let path = self.key_path(&key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(value.len() as u64)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(value)?;
        Ok(())
    }

    fn get_all(&self, key: Key, buf: &mut [u8]) -> Result<()> {
        let path = self.key_path(&key);
        let mut file = Self::open_existing(&path)?;
        let len = file.metadata()?.len() as usize;
        if len != buf.len() {
            return Err(StoreError::Range);
        }
        file.read_exact(buf)?;
        Ok(())
    }

    fn get_at(&self, key: Key, buf: &mut [u8], offset: usize) -> Result<()> {
        let path = self.key_path(&key);
        let mut file = Self::open_existing(&path)?;
        let len = file.metadata()?.len() as usize;
        if offset + buf.len() > len {
            return Err(StoreError::Range);
        }
        file.seek(SeekFrom::Start(offset as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn remove(&self, key: Key) -> Result<()> {
        fs::remove_file(self.key_path(&key)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound
            } else {
                StoreError::Io(e)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AsKey;

    fn store() -> (tempfile::TempDir, LocalFsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_then_read_back() {
        let (_dir, store) = store();
        let key = 42_u64.as_key();
        store.create(key, b"hello blob").unwrap();
        assert!(store.contains(key).unwrap());
        assert_eq!(store.blob_size(key).unwrap(), 10);

        let mut buf = vec![0_u8; 10];
        store.get_all(key, &mut buf).unwrap();
        assert_eq!(&buf, b"hello blob");
    }

    #[test]
    fn create_twice_fails() {
        let (_dir, store) = store();
        let key = 1_u64.as_key();
        store.create(key, b"x").unwrap();
        assert!(matches!(
            store.create(key, b"y"),
            Err(StoreError::AlreadyExists)
        ));
    }

    #[test]
    fn positional_read_and_write() {
        let (_dir, store) = store();
        let key = 7_u64.as_key();
        store.create(key, b"0123456789").unwrap();
        store.put_at(key, b"ab", 4).unwrap();

        let mut buf = vec![0_u8; 4];
        store.get_at(key, &mut buf, 3).unwrap();
        assert_eq!(&buf, b"3ab6");
    }

    #[test]
    fn out_of_range_is_rejected() {
        let (_dir, store) = store();
        let key = 9_u64.as_key();
        store.create(key, b"short").unwrap();
        assert!(matches!(
            store.put_at(key, b"xxxx", 3),
            Err(StoreError::Range)
        ));
        let mut buf = vec![0_u8; 8];
        assert!(matches!(
            store.get_at(key, &mut buf, 0),
            Err(StoreError::Range)
        ));
    }

    #[test]
    fn put_or_create_replaces() {
        let (_dir, store) = store();
        let key = 3_u64.as_key();
        store.put_or_create(key, b"first").unwrap();
        store.put_or_create(key, b"second!").unwrap();
        assert_eq!(store.blob_size(key).unwrap(), 7);
    }

    #[test]
    fn remove_missing_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.remove(100_u64.as_key()),
            Err(StoreError::NotFound)
        ));
    }
}
