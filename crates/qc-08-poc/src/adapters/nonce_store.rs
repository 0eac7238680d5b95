//! Nonce pool persistence
//!
//! The file store writes the whole record set to a temp file, syncs it and
//! renames it over `pool.dat`, so a crash leaves either the old or the new
//! set. An exclusive advisory lock on a sibling `.lock` file keeps a second
//! process off the same pool file for the lifetime of the store.

use crate::domain::{NonceRecord, PocError, PocResult};
use crate::ports::NonceStore;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

const FILE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct NonceFile {
    version: u32,
    records: Vec<NonceRecord>,
}

fn io_error(context: &str, path: &Path, err: impl std::fmt::Display) -> PocError {
    PocError::NoncePersistence(format!("{context} {}: {err}", path.display()))
}

/// `pool.dat` backed store
pub struct FileNonceStore {
    path: PathBuf,
    lock: File,
    /// Serialises writers inside this process
    write_guard: Mutex<()>,
}

impl FileNonceStore {
    /// Open the store, taking the exclusive lock.
    pub fn open<P: AsRef<Path>>(path: P) -> PocResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| io_error("create dir for", &path, e))?;
            }
        }
        let lock_path = path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| io_error("open lock", &lock_path, e))?;
        lock.try_lock_exclusive()
            .map_err(|_| io_error("already locked:", &lock_path, "another process holds it"))?;
        tracing::info!("[qc-08] 🔒 nonce pool file {}", path.display());
        Ok(Self {
            path,
            lock,
            write_guard: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NonceStore for FileNonceStore {
    fn read(&self) -> PocResult<Vec<NonceRecord>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("read", &self.path, e)),
        };
        let file: NonceFile =
            bincode::deserialize(&bytes).map_err(|e| io_error("decode", &self.path, e))?;
        if file.version != FILE_VERSION {
            return Err(io_error(
                "unsupported version in",
                &self.path,
                file.version,
            ));
        }
        Ok(file.records)
    }

    fn write(&self, records: &[NonceRecord]) -> PocResult<()> {
        let _guard = self.write_guard.lock();
        let bytes = bincode::serialize(&NonceFile {
            version: FILE_VERSION,
            records: records.to_vec(),
        })
        .map_err(|e| io_error("encode", &self.path, e))?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path).map_err(|e| io_error("create", &temp_path, e))?;
        file.write_all(&bytes)
            .map_err(|e| io_error("write", &temp_path, e))?;
        file.sync_all()
            .map_err(|e| io_error("sync", &temp_path, e))?;
        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| io_error("rename onto", &self.path, e))?;
        tracing::debug!("[qc-08] persisted {} nonce records", records.len());
        Ok(())
    }
}

impl Drop for FileNonceStore {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock);
    }
}

/// In-memory store with an injectable write failure
#[derive(Default)]
pub struct MemoryNonceStore {
    records: RwLock<Vec<NonceRecord>>,
    fail_writes: AtomicBool,
    writes: std::sync::atomic::AtomicUsize,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<NonceRecord>) -> Self {
        let store = Self::default();
        *store.records.write() = records;
        store
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<NonceRecord> {
        self.records.read().clone()
    }
}

impl NonceStore for MemoryNonceStore {
    fn read(&self) -> PocResult<Vec<NonceRecord>> {
        Ok(self.records.read().clone())
    }

    fn write(&self, records: &[NonceRecord]) -> PocResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PocError::NoncePersistence("injected write failure".into()));
        }
        *self.records.write() = records.to_vec();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
