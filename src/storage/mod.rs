//! Key-value storage abstraction.
//!
//! The chains hand out an opaque [`Database`] handle; the election engine
//! is its only writer for committee state. Two backends: [`MemDb`] for
//! tests and ephemeral runs, [`SledDb`] for persistence.

pub mod rawdb;

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Minimal key-value interface required by this core.
pub trait Database: Send + Sync {
    /// Gets the value for the given key, `None` when absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Sets the value for the given key.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Deletes the value for the given key.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Returns whether the key exists.
    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// In-memory key-value store.
#[derive(Default)]
pub struct MemDb {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for MemDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries
            .write()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.entries.write().unwrap().remove(key);
        Ok(())
    }
}

/// Disk-backed key-value store.
pub struct SledDb {
    inner: sled::Db,
}

impl SledDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let inner = sled::open(path).map_err(|e| DatabaseError::Backend(e.to_string()))?;
        Ok(SledDb { inner })
    }
}

impl Database for SledDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner
            .get(key)
            .map(|v| v.map(|ivec| ivec.to_vec()))
            .map_err(|e| DatabaseError::Backend(e.to_string()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner
            .insert(key, value)
            .map(|_| ())
            .map_err(|e| DatabaseError::Backend(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner
            .remove(key)
            .map(|_| ())
            .map_err(|e| DatabaseError::Backend(e.to_string()))
    }
}
