/*!
Local filesystem storage adapter implementation.
*/

use super::StorageAdapter;
use crate::{Result, WardenError};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Local filesystem storage adapter
///
/// Keys are resolved relative to a base directory (the Warden state dir).
/// Saves are atomic: data goes to a temporary file in the destination
/// directory which is then renamed into place, so a crash never leaves a
/// half-written backup or snapshot behind.
///
/// # Example
/// ```rust
/// use warden_core::storage::{LocalFileStorage, StorageAdapter};
///
/// let dir = tempfile::tempdir()?;
/// let storage = LocalFileStorage::with_base_dir(dir.path());
/// storage.save(b"payload", "backups/ports/abc/1.payload")?;
/// assert!(storage.exists("backups/ports/abc/1.payload"));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    base_dir: PathBuf,
}

impl LocalFileStorage {
    /// Create a storage adapter rooted at `base_dir`
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve the full path for a given storage key
    fn resolve_path(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.base_dir.clone(), |path, part| path.join(part))
    }

    /// Ensure the parent directory exists, creating it if necessary
    fn ensure_parent_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    WardenError::storage(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn walk(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(WardenError::storage(format!(
                    "Failed to list {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.walk(&path, keys)?;
            } else if !entry.file_name().to_string_lossy().starts_with(".tmp") {
                if let Ok(relative) = path.strip_prefix(&self.base_dir) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

impl StorageAdapter for LocalFileStorage {
    fn save(&self, data: &[u8], key: &str) -> Result<()> {
        let full_path = self.resolve_path(key);
        self.ensure_parent_dir(&full_path)?;

        let parent = full_path.parent().unwrap_or(&self.base_dir);
        let mut staged = NamedTempFile::new_in(parent).map_err(|e| {
            WardenError::storage(format!(
                "Failed to stage write in {}: {}",
                parent.display(),
                e
            ))
        })?;
        staged
            .write_all(data)
            .and_then(|_| staged.as_file().sync_all())
            .map_err(|e| {
                WardenError::storage(format!("Failed to write {}: {}", full_path.display(), e))
            })?;
        staged.persist(&full_path).map_err(|e| {
            WardenError::storage(format!(
                "Failed to move staged file to {}: {}",
                full_path.display(),
                e.error
            ))
        })?;

        debug!("Saved {} bytes to {}", data.len(), full_path.display());
        Ok(())
    }

    fn append(&self, data: &[u8], key: &str) -> Result<()> {
        let full_path = self.resolve_path(key);
        self.ensure_parent_dir(&full_path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full_path)
            .map_err(|e| {
                WardenError::storage(format!("Failed to open {}: {}", full_path.display(), e))
            })?;
        file.write_all(data)
            .and_then(|_| file.sync_data())
            .map_err(|e| {
                WardenError::storage(format!(
                    "Failed to append to {}: {}",
                    full_path.display(),
                    e
                ))
            })
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve_path(key);

        fs::read(&full_path).map_err(|e| {
            WardenError::storage(format!("Failed to read {}: {}", full_path.display(), e))
        })
    }

    fn exists(&self, key: &str) -> bool {
        self.resolve_path(key).is_file()
    }

    fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.resolve_path(key);

        if full_path.exists() {
            fs::remove_file(&full_path).map_err(|e| {
                WardenError::storage(format!(
                    "Failed to delete {}: {}",
                    full_path.display(),
                    e
                ))
            })?;

            // Drop now-empty partition directories; a non-empty one stays.
            if let Some(parent) = full_path.parent() {
                if parent != self.base_dir {
                    let _ = fs::remove_dir(parent);
                }
            }
        }

        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let mut keys = Vec::new();
        self.walk(&self.resolve_path(dir_part), &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}
