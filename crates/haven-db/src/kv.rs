/// Versioned key-value contract used by the channel subsystem.
///
/// Every value is stored with the schema version it was written with. Reads
/// name the version they expect so that a record written by an incompatible
/// build is reported instead of being misread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::models::VersionedObject;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("version mismatch for {key}: expected {expected}, found {found}")]
    VersionMismatch {
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("store lock poisoned")]
    LockPoisoned,
}

impl KvError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub trait Kv: Send + Sync {
    fn get(&self, key: &str, version: u64) -> Result<VersionedObject, KvError>;

    fn set(&self, key: &str, object: &VersionedObject) -> Result<(), KvError>;

    /// Deleting a key that does not exist is not an error.
    fn delete(&self, key: &str, version: u64) -> Result<(), KvError>;

    /// True when `err` is a real failure rather than a missing key.
    fn exists(&self, err: &KvError) -> bool {
        !err.is_not_found()
    }
}

impl<K: Kv + ?Sized> Kv for Arc<K> {
    fn get(&self, key: &str, version: u64) -> Result<VersionedObject, KvError> {
        (**self).get(key, version)
    }

    fn set(&self, key: &str, object: &VersionedObject) -> Result<(), KvError> {
        (**self).set(key, object)
    }

    fn delete(&self, key: &str, version: u64) -> Result<(), KvError> {
        (**self).delete(key, version)
    }

    fn exists(&self, err: &KvError) -> bool {
        (**self).exists(err)
    }
}

/// A view of a store in which every key is namespaced under `prefix`.
#[derive(Clone)]
pub struct PrefixedKv {
    inner: Arc<dyn Kv>,
    prefix: String,
}

impl PrefixedKv {
    pub fn new(inner: Arc<dyn Kv>, prefix: &str) -> Self {
        Self {
            inner,
            prefix: prefix.to_string(),
        }
    }

    /// Nest a further prefix below this one.
    pub fn prefix(&self, prefix: &str) -> Self {
        Self {
            inner: self.inner.clone(),
            prefix: format!("{}/{}", self.prefix, prefix),
        }
    }

    pub fn full_key(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }
}

impl Kv for PrefixedKv {
    fn get(&self, key: &str, version: u64) -> Result<VersionedObject, KvError> {
        self.inner.get(&self.full_key(key), version)
    }

    fn set(&self, key: &str, object: &VersionedObject) -> Result<(), KvError> {
        self.inner.set(&self.full_key(key), object)
    }

    fn delete(&self, key: &str, version: u64) -> Result<(), KvError> {
        self.inner.delete(&self.full_key(key), version)
    }

    fn exists(&self, err: &KvError) -> bool {
        self.inner.exists(err)
    }
}

/// In-memory store for tests and clients that keep no state on disk.
#[derive(Default)]
pub struct MemKv {
    entries: Mutex<HashMap<String, VersionedObject>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sorted list of every key currently stored.
    pub fn keys(&self) -> Vec<String> {
        let entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }
}

impl Kv for MemKv {
    fn get(&self, key: &str, version: u64) -> Result<VersionedObject, KvError> {
        let entries = self.entries.lock().map_err(|_| KvError::LockPoisoned)?;
        let obj = entries.get(key).ok_or_else(|| KvError::NotFound {
            key: key.to_string(),
        })?;
        if obj.version != version {
            return Err(KvError::VersionMismatch {
                key: key.to_string(),
                expected: version,
                found: obj.version,
            });
        }
        Ok(obj.clone())
    }

    fn set(&self, key: &str, object: &VersionedObject) -> Result<(), KvError> {
        self.entries
            .lock()
            .map_err(|_| KvError::LockPoisoned)?
            .insert(key.to_string(), object.clone());
        Ok(())
    }

    fn delete(&self, key: &str, _version: u64) -> Result<(), KvError> {
        self.entries
            .lock()
            .map_err(|_| KvError::LockPoisoned)?
            .remove(key);
        Ok(())
    }
}
