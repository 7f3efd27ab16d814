/*!
Storage adapters for Warden's persisted state.

Backups, snapshots and the timeline all live behind one [`StorageAdapter`],
addressed by `/`-separated logical keys such as
`backups/launch_items/<key>/<stamp>.payload`. The core never touches the
filesystem directly, so tests run against [`MemoryStorage`].
*/

pub mod local;

use crate::{Result, WardenError};
use std::collections::BTreeMap;
use std::sync::Mutex;

pub use local::LocalFileStorage;

/// Storage abstraction for persisted payloads, records and logs
pub trait StorageAdapter: Send + Sync {
    /// Write `data` at `key`, replacing any previous content atomically
    fn save(&self, data: &[u8], key: &str) -> Result<()>;

    /// Append `data` to the object at `key`, creating it if needed
    fn append(&self, data: &[u8], key: &str) -> Result<()>;

    /// Load the object at `key`
    fn load(&self, key: &str) -> Result<Vec<u8>>;

    /// Check if an object exists at `key`
    fn exists(&self, key: &str) -> bool;

    /// Delete the object at `key`; deleting a missing key is not an error
    fn delete(&self, key: &str) -> Result<()>;

    /// List every object key under `prefix`, sorted
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Memory-based storage adapter
///
/// Stores objects in a sorted map. Used by tests and by dry runs that must not
/// touch the filesystem.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.data
            .lock()
            .map_err(|_| WardenError::storage("memory storage lock poisoned"))
    }

    /// Overwrite stored bytes without any checks (used to simulate tampering)
    pub fn corrupt(&self, key: &str, data: &[u8]) -> Result<()> {
        self.lock()?.insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

impl StorageAdapter for MemoryStorage {
    fn save(&self, data: &[u8], key: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn append(&self, data: &[u8], key: &str) -> Result<()> {
        self.lock()?
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        self.lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| WardenError::storage(format!("Object not found: {key}")))
    }

    fn exists(&self, key: &str) -> bool {
        self.lock().map(|d| d.contains_key(key)).unwrap_or(false)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
