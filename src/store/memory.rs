use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{check_version, RecordFilter, RecordKind, RecordStore, StoredRecord};
use crate::{Error, Result};

/// In-process record store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<(RecordKind, String), StoredRecord>>,
    /// Operations left to fail with a transient error.
    failures: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail with a transient `Store` error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn injected_failure(&self) -> Result<()> {
        let pending = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match pending {
            Ok(_) => Err(Error::Store("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<(RecordKind, String), StoredRecord>>> {
        self.records
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>> {
        self.injected_failure()?;
        Ok(self.lock()?.get(&(kind, id.to_string())).cloned())
    }

    fn put(
        &self,
        kind: RecordKind,
        id: &str,
        value: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        self.injected_failure()?;
        let mut records = self.lock()?;
        let key = (kind, id.to_string());
        let current = records.get(&key).map(|r| r.version).unwrap_or(0);
        check_version(kind, id, current, expected_version)?;
        let version = current + 1;
        records.insert(
            key,
            StoredRecord {
                kind,
                id: id.to_string(),
                version,
                value,
            },
        );
        Ok(version)
    }

    fn delete(&self, kind: RecordKind, id: &str) -> Result<bool> {
        self.injected_failure()?;
        Ok(self.lock()?.remove(&(kind, id.to_string())).is_some())
    }

    fn list(&self, kind: RecordKind, filter: &RecordFilter) -> Result<Vec<StoredRecord>> {
        self.injected_failure()?;
        Ok(self
            .lock()?
            .values()
            .filter(|r| r.kind == kind && filter.matches(&r.value))
            .cloned()
            .collect())
    }
}
