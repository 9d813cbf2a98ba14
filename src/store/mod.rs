//! Locked document store.
//!
//! Every access to the on-disk document goes through this module. A call
//! acquires an advisory lock on `<doc>.lock`, hands the freshly read document
//! to a closure and, for writers, persists the result with a
//! write-to-temp-then-rename before the lock guard drops. Nothing here keeps
//! a copy of the document between calls.
//!
//! After every successful write the same bytes are also written to
//! `<doc>.journal`, the last-known-good copy used by corruption recovery.

mod lock;

pub use lock::{FileLock, LockMode};

use crate::errors::{Result, TaskerError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default bound on lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Decision returned by a raw write closure.
pub enum WriteDecision<R> {
    /// Persist these bytes, then return the value.
    Persist(Vec<u8>, R),
    /// Leave the file untouched and return the value.
    Skip(R),
}

#[derive(Debug, Clone)]
pub struct DocumentStore {
    path: PathBuf,
    lock_path: PathBuf,
    journal_path: PathBuf,
    timeout: Duration,
}

impl DocumentStore {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        let path = path.into();
        let lock_path = sibling(&path, "lock");
        let journal_path = sibling(&path, "journal");
        Self {
            path,
            lock_path,
            journal_path,
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Run `f` over the raw document bytes under a shared lock.
    ///
    /// `None` means the document does not exist.
    pub fn read_raw<R>(&self, f: impl FnOnce(Option<&[u8]>) -> Result<R>) -> Result<R> {
        let _guard = FileLock::acquire(&self.lock_path, LockMode::Shared, self.timeout)?;
        let bytes = read_optional(&self.path)?;
        f(bytes.as_deref())
    }

    /// Run `f` over the raw document bytes under an exclusive lock and persist
    /// whatever it commits before releasing the lock.
    pub fn write_raw<R>(&self, f: impl FnOnce(Option<&[u8]>) -> Result<WriteDecision<R>>) -> Result<R> {
        let _guard = FileLock::acquire(&self.lock_path, LockMode::Exclusive, self.timeout)?;
        let bytes = read_optional(&self.path)?;
        match f(bytes.as_deref())? {
            WriteDecision::Persist(data, value) => {
                atomic_write(&self.path, &data)?;
                atomic_write(&self.journal_path, &data)?;
                Ok(value)
            }
            WriteDecision::Skip(value) => Ok(value),
        }
    }

    /// Typed read under a shared lock. A parse failure is reported as corruption.
    pub fn with_read_lock<T, R>(&self, f: impl FnOnce(Option<T>) -> Result<R>) -> Result<R>
    where
        T: DeserializeOwned,
    {
        self.read_raw(|bytes| {
            let doc = bytes.map(|b| parse(&self.path, b)).transpose()?;
            f(doc)
        })
    }

    /// Typed read-modify-write under an exclusive lock.
    ///
    /// The closure sees the current document (`None` if absent) and may
    /// replace or mutate it. If the closure succeeds and the slot holds a
    /// document afterwards, it is serialized and persisted. If the closure
    /// fails nothing is written.
    pub fn with_write_lock<T, R>(&self, f: impl FnOnce(&mut Option<T>) -> Result<R>) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
    {
        self.write_raw(|bytes| {
            let mut slot = bytes.map(|b| parse(&self.path, b)).transpose()?;
            let value = f(&mut slot)?;
            match slot {
                Some(doc) => Ok(WriteDecision::Persist(encode(&doc)?, value)),
                None => Ok(WriteDecision::Skip(value)),
            }
        })
    }
}

/// Serialize a document the way the store persists it.
pub fn encode<T: Serialize>(doc: &T) -> Result<Vec<u8>> {
    let mut data = serde_json::to_vec_pretty(doc)?;
    data.push(b'\n');
    Ok(data)
}

fn parse<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| TaskerError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TaskerError::io(path, e)),
    }
}

/// Write `data` to a temp file next to `path`, fsync it, then rename over `path`.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| TaskerError::io(parent, e))?;
    }

    let tmp = sibling(path, &format!("tmp.{}", std::process::id()));
    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(TaskerError::io(path, e));
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
