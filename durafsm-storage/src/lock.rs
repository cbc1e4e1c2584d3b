//! Per-identity exclusive holds.

use crate::error::StorageError;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fs::File;
use std::time::{Duration, Instant};

/// Table of identities currently held for update.
#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `id` is free, then holds it until the returned guard drops.
    /// With a timeout, gives up with [`StorageError::LockTimeout`].
    pub fn acquire(&self, id: &str, timeout: Option<Duration>) -> Result<RowLock<'_>, StorageError> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let mut held = self.held.lock();

        if held.contains(id) {
            tracing::debug!(instance = id, "waiting for row lock");
        }

        while held.contains(id) {
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut held, deadline).timed_out()
                        && held.contains(id)
                    {
                        return Err(StorageError::LockTimeout {
                            id: id.to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                }
                None => self.released.wait(&mut held),
            }
        }

        held.insert(id.to_string());
        Ok(RowLock {
            table: self,
            id: id.to_string(),
            file: None,
        })
    }

    /// Returns true if `id` is currently held.
    pub fn is_held(&self, id: &str) -> bool {
        self.held.lock().contains(id)
    }

    fn release(&self, id: &str) {
        self.held.lock().remove(id);
        self.released.notify_all();
    }
}

/// Exclusive hold on one identity; released on drop.
#[derive(Debug)]
pub struct RowLock<'a> {
    table: &'a LockTable,
    id: String,
    /// Locked file backing a hold shared with other processes.
    file: Option<File>,
}

impl RowLock<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Keeps `file` open, and so its OS lock held, for as long as this hold.
    pub(crate) fn with_file(mut self, file: File) -> Self {
        self.file = Some(file);
        self
    }
}

impl Drop for RowLock<'_> {
    fn drop(&mut self) {
        // Closing the file drops the OS lock before in-process waiters wake
        self.file.take();
        self.table.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_hold_and_release() {
        let table = LockTable::new();
        {
            let lock = table.acquire("i-1", None).unwrap();
            assert_eq!(lock.id(), "i-1");
            assert!(table.is_held("i-1"));
            assert!(!table.is_held("i-2"));
        }
        assert!(!table.is_held("i-1"));
    }

    #[test]
    fn test_distinct_ids_do_not_block() {
        let table = LockTable::new();
        let _a = table.acquire("i-1", None).unwrap();
        let _b = table
            .acquire("i-2", Some(Duration::from_millis(10)))
            .unwrap();
    }

    #[test]
    fn test_timeout() {
        let table = LockTable::new();
        let _held = table.acquire("i-1", None).unwrap();

        let err = table
            .acquire("i-1", Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_second_holder_waits_for_release() {
        let table = Arc::new(LockTable::new());
        let released = Arc::new(AtomicBool::new(false));

        let guard = table.acquire("i-1", None).unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let _lock = table.acquire("i-1", None).unwrap();
                // Must only get here after the first holder let go
                released.load(Ordering::SeqCst)
            })
        };

        thread::sleep(Duration::from_millis(50));
        released.store(true, Ordering::SeqCst);
        drop(guard);

        assert!(waiter.join().unwrap());
    }
}
