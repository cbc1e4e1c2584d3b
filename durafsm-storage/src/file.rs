//! File-backed record store.
//!
//! One file per identity, named by the hex-encoded identity (or by its
//! SHA-256 digest when the hex form would not fit in a file name). Each
//! file holds a checksum line followed by the record as JSON:
//!
//! ```text
//! crc32c:1a2b3c4d
//! {"id":"...","state":"Final",...}
//! ```
//!
//! Writes go to a uniquely named temporary file that is synced and renamed
//! over the old one. Holds are taken on a `.lock` file next to the record,
//! so separate handles and processes sharing a directory exclude each other.

use crate::error::StorageError;
use crate::lock::{LockTable, RowLock};
use crate::store::RecordStore;
use durafsm_core::InstanceRecord;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

const CHECKSUM_PREFIX: &str = "crc32c:";
const RECORD_EXT: &str = "json";
const LOCK_EXT: &str = "lock";
const DIGEST_PREFIX: &str = "sha256-";

/// Longest hex stem used as a file name; longer identities use a digest.
const MAX_HEX_STEM: usize = 200;

/// Pause between attempts on a lock file held elsewhere.
const LOCK_POLL: Duration = Duration::from_millis(5);

/// Durable store keeping each record in its own file.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    locks: LockTable,
    lock_timeout: Option<Duration>,
}

impl FileStore {
    /// Opens or creates a store at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            locks: LockTable::new(),
            lock_timeout: None,
        };

        tracing::info!(
            "Opened file store at {} ({} records)",
            store.dir.display(),
            store.ids()?.len()
        );

        Ok(store)
    }

    /// Sets how long `load_for_update` waits for a held identity.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lists the identities of all stored records.
    pub fn ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");

            let decoded = if stem.starts_with(DIGEST_PREFIX) {
                Self::read_path(&path)
                    .map_err(|e| tracing::warn!("Skipping {}: {}", path.display(), e))
                    .ok()
                    .map(|record| record.id)
            } else {
                hex::decode(stem)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            };

            match decoded {
                Some(id) => ids.push(id),
                None => tracing::warn!("Skipping unrecognised file {}", path.display()),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn file_stem(id: &str) -> String {
        let stem = hex::encode(id.as_bytes());
        if stem.len() <= MAX_HEX_STEM {
            stem
        } else {
            format!("{}{}", DIGEST_PREFIX, hex::encode(Sha256::digest(id.as_bytes())))
        }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", Self::file_stem(id), RECORD_EXT))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", Self::file_stem(id), LOCK_EXT))
    }

    /// Holds `id` against this handle's other callers, then against every
    /// other handle on the directory.
    fn hold(&self, id: &str) -> Result<RowLock<'_>, StorageError> {
        let started = Instant::now();
        let lock = self.locks.acquire(id, self.lock_timeout)?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path(id))?;

        match self.lock_timeout {
            None => file.lock_exclusive()?,
            Some(timeout) => loop {
                match file.try_lock_exclusive() {
                    Ok(()) => break,
                    Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                        if started.elapsed() >= timeout {
                            return Err(StorageError::LockTimeout {
                                id: id.to_string(),
                                waited_ms: started.elapsed().as_millis() as u64,
                            });
                        }
                        std::thread::sleep(LOCK_POLL);
                    }
                    Err(e) => return Err(e.into()),
                }
            },
        }

        Ok(lock.with_file(file))
    }

    fn read(&self, id: &str) -> Result<Option<InstanceRecord>, StorageError> {
        let path = self.record_path(id);
        let record = match Self::read_path(&path) {
            Ok(record) => record,
            Err(StorageError::Io(e)) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        if record.id != id {
            return Err(StorageError::Corruption(format!(
                "file for {} holds record {}",
                id, record.id
            )));
        }
        Ok(Some(record))
    }

    fn read_path(path: &Path) -> Result<InstanceRecord, StorageError> {
        let data = fs::read(path)?;
        let name = path.display();

        let newline = data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| StorageError::Corruption(format!("{} has no header", name)))?;
        let (header, body) = (&data[..newline], &data[newline + 1..]);

        let expected = std::str::from_utf8(header)
            .ok()
            .and_then(|h| h.strip_prefix(CHECKSUM_PREFIX))
            .and_then(|h| u32::from_str_radix(h.trim(), 16).ok())
            .ok_or_else(|| StorageError::Corruption(format!("{} has a bad header", name)))?;

        let actual = crc32c::crc32c(body);
        if actual != expected {
            tracing::warn!("Checksum mismatch in {}", name);
            return Err(StorageError::Corruption(format!(
                "{} checksum mismatch",
                name
            )));
        }

        Ok(serde_json::from_slice(body)?)
    }

    /// Writes `record` to a fresh temporary file in the store directory.
    fn stage(&self, record: &InstanceRecord) -> Result<NamedTempFile, StorageError> {
        let body = serde_json::to_vec(record)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        writeln!(tmp, "{}{:08x}", CHECKSUM_PREFIX, crc32c::crc32c(&body))?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    /// Makes a completed rename durable.
    fn sync_dir(&self) -> Result<(), StorageError> {
        #[cfg(unix)]
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

impl RecordStore for FileStore {
    fn load_for_update(
        &self,
        id: &str,
    ) -> Result<(Option<InstanceRecord>, RowLock<'_>), StorageError> {
        let lock = self.hold(id)?;
        let record = self.read(id)?;
        Ok((record, lock))
    }

    fn insert(&self, record: &InstanceRecord) -> Result<(), StorageError> {
        let path = self.record_path(&record.id);
        let tmp = self.stage(record)?;

        tmp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == ErrorKind::AlreadyExists {
                StorageError::DuplicateIdentity(record.id.clone())
            } else {
                StorageError::Io(e.error)
            }
        })?;
        self.sync_dir()
    }

    /// Callers hold `record.id` through `load_for_update`, which keeps the
    /// version check and the rename from interleaving with other writers.
    fn update(&self, record: &InstanceRecord, expected_version: u64) -> Result<(), StorageError> {
        let stored = self
            .read(&record.id)?
            .ok_or_else(|| StorageError::NotFound(record.id.clone()))?;

        if stored.version != expected_version {
            return Err(StorageError::StaleRecord {
                id: record.id.clone(),
                expected: expected_version,
                actual: stored.version,
            });
        }

        let tmp = self.stage(record)?;
        tmp.persist(self.record_path(&record.id))
            .map_err(|e| StorageError::Io(e.error))?;
        self.sync_dir()
    }

    fn get(&self, id: &str) -> Result<Option<InstanceRecord>, StorageError> {
        self.read(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut record = InstanceRecord::with_ctx("i-1", json!({"screwed": true}));
        record.state = "Final".to_string();
        record.accumulators.insert("everything".to_string(), 3);
        record.version = 1;

        {
            let store = FileStore::open(dir.path()).unwrap();
            store.insert(&record).unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        let loaded = store.get("i-1").unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(store.ids().unwrap(), vec!["i-1".to_string()]);
    }

    #[test]
    fn test_opaque_identities() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let id = "../weird/id with spaces";
        store.insert(&InstanceRecord::new(id)).unwrap();
        assert!(store.get(id).unwrap().is_some());
        assert_eq!(store.ids().unwrap(), vec![id.to_string()]);
    }

    #[test]
    fn test_long_identities() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let long = "k".repeat(200);
        let longer = "k".repeat(201);
        let (_, lock) = store.load_for_update(&long).unwrap();
        store.insert(&InstanceRecord::new(long.as_str())).unwrap();
        drop(lock);
        store.insert(&InstanceRecord::new(longer.as_str())).unwrap();

        assert_eq!(store.get(&long).unwrap().unwrap().id, long);
        assert_eq!(store.get(&longer).unwrap().unwrap().id, longer);
        assert!(store.get(&"k".repeat(202)).unwrap().is_none());
        assert_eq!(store.ids().unwrap(), vec![long.clone(), longer]);

        for entry in fs::read_dir(dir.path()).unwrap() {
            assert!(entry.unwrap().file_name().len() < 255);
        }
    }

    #[test]
    fn test_duplicate_and_stale() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let mut record = InstanceRecord::new("i-1");
        record.version = 1;
        store.insert(&record).unwrap();
        assert!(matches!(
            store.insert(&record),
            Err(StorageError::DuplicateIdentity(_))
        ));

        record.version = 2;
        store.update(&record, 1).unwrap();
        assert!(matches!(
            store.update(&record, 1),
            Err(StorageError::StaleRecord { actual: 2, .. })
        ));
        assert!(matches!(
            store.update(&InstanceRecord::new("i-2"), 0),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_across_handles() {
        let dir = TempDir::new().unwrap();
        let a = FileStore::open(dir.path()).unwrap();
        let b = FileStore::open(dir.path()).unwrap();

        a.insert(&InstanceRecord::new("i-1")).unwrap();
        assert!(matches!(
            b.insert(&InstanceRecord::new("i-1")),
            Err(StorageError::DuplicateIdentity(_))
        ));
    }

    #[test]
    fn test_hold_excludes_other_handles() {
        let dir = TempDir::new().unwrap();
        let a = FileStore::open(dir.path()).unwrap();
        let b = FileStore::open(dir.path())
            .unwrap()
            .with_lock_timeout(Duration::from_millis(20));

        let (_, held) = a.load_for_update("x").unwrap();
        assert!(matches!(
            b.load_for_update("x"),
            Err(StorageError::LockTimeout { .. })
        ));
        // Other identities are not affected
        assert!(b.load_for_update("y").is_ok());

        drop(held);
        assert!(b.load_for_update("x").is_ok());
    }

    #[test]
    fn test_writers_on_separate_handles() {
        let dir = TempDir::new().unwrap();
        let path = Arc::new(dir.path().to_path_buf());
        let threads = 4;
        let per_thread = 20;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let path = Arc::clone(&path);
                thread::spawn(move || {
                    let store = FileStore::open(path.as_path()).unwrap();
                    for _ in 0..per_thread {
                        let (stored, _lock) = store.load_for_update("shared").unwrap();
                        match stored {
                            Some(mut record) => {
                                let expected = record.version;
                                record.version += 1;
                                store.update(&record, expected).unwrap();
                            }
                            None => {
                                let mut record = InstanceRecord::new("shared");
                                record.version = 1;
                                store.insert(&record).unwrap();
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        let record = store.get("shared").unwrap().unwrap();
        assert_eq!(record.version, (threads * per_thread) as u64);
        // Only the record and its lock file remain
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.insert(&InstanceRecord::new("i-1")).unwrap();

        let path = store.record_path("i-1");
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("Initial", "Hacked!")).unwrap();

        assert!(matches!(
            store.get("i-1"),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_missing_record() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        assert!(store.get("nope").unwrap().is_none());
        let (record, _lock) = store.load_for_update("nope").unwrap();
        assert!(record.is_none());
    }
}
