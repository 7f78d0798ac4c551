use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs2::FileExt;
use tempfile::NamedTempFile;

use super::{check_version, RecordFilter, RecordKind, RecordStore, StoredRecord};
use crate::{clog_debug, Error, Result};

/// Name of the advisory lock file under the store root.
const LOCK_FILE: &str = ".lock";

/// Record store keeping one JSON file per record under
/// `<root>/<kind>/<id>.json`.
///
/// Each write goes to a fresh temporary file in the record's directory,
/// is fsynced, then persisted over the record, so a crash never leaves a
/// torn record behind. Version check and write run under an exclusive
/// advisory lock on `<root>/.lock`, which makes `put` atomic across every
/// process sharing the directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    lock_file: File,
    /// `flock` is per open file description, so threads of this process
    /// still need serializing among themselves.
    write_lock: Mutex<()>,
}

/// Holds the in-process mutex and the directory lock; unlocks on drop.
struct DirLock<'a> {
    file: &'a File,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for DirLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(self.file) {
            clog_debug!("FileStore unlock failed: {}", e);
        }
    }
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        clog_debug!("FileStore::open root={}", root.display());
        fs::create_dir_all(&root)?;
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        Ok(Self {
            root,
            lock_file,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, kind: RecordKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    fn record_path(&self, kind: RecordKind, id: &str) -> PathBuf {
        self.kind_dir(kind).join(format!("{}.json", file_stem(id)))
    }

    fn lock(&self) -> Result<DirLock<'_>> {
        let guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Store("file store lock poisoned".to_string()))?;
        FileExt::lock_exclusive(&self.lock_file)?;
        Ok(DirLock {
            file: &self.lock_file,
            _guard: guard,
        })
    }

    fn read(path: &Path) -> Result<Option<StoredRecord>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace `path` with `contents` via a synced temporary sibling.
    fn write_atomic(dir: &Path, path: &Path, contents: &[u8]) -> Result<()> {
        fs::create_dir_all(dir)?;
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(contents)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Ids may contain characters that are unsafe in file names (`->` in edge
/// ids); everything outside `[A-Za-z0-9_.-]` is hex-escaped.
fn file_stem(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for c in id.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
            stem.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                stem.push_str(&format!("%{:02x}", byte));
            }
        }
    }
    stem
}

impl RecordStore for FileStore {
    fn get(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>> {
        Self::read(&self.record_path(kind, id))
    }

    fn put(
        &self,
        kind: RecordKind,
        id: &str,
        value: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let _lock = self.lock()?;

        let path = self.record_path(kind, id);
        let current = Self::read(&path)?.map(|r| r.version).unwrap_or(0);
        check_version(kind, id, current, expected_version)?;

        let record = StoredRecord {
            kind,
            id: id.to_string(),
            version: current + 1,
            value,
        };
        let contents = serde_json::to_vec_pretty(&record)?;
        Self::write_atomic(&self.kind_dir(kind), &path, &contents)?;
        Ok(record.version)
    }

    fn delete(&self, kind: RecordKind, id: &str) -> Result<bool> {
        let _lock = self.lock()?;
        match fs::remove_file(self.record_path(kind, id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, kind: RecordKind, filter: &RecordFilter) -> Result<Vec<StoredRecord>> {
        let dir = self.kind_dir(kind);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read(&path)? {
                if filter.matches(&record.value) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}
