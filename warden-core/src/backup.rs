/*!
Backup store for managed artifacts.

Every mutating lifecycle transition is preceded by a backup written here. A
backup is two objects on the storage adapter: the compressed payload and a JSON
[`BackupRecord`] describing it. The payload is always written first, so a record
never points at a payload this store did not finish writing.

Layout:

```text
backups/<category>/<identity-key>/<created>_<backup-id>.payload
backups/<category>/<identity-key>/<created>_<backup-id>.record.json
```
*/

use crate::compression::CompressionAdapter;
use crate::model::{ArtifactDescriptor, ArtifactIdentity, Category, LifecycleState, OriginalLocation};
use crate::observability;
use crate::storage::StorageAdapter;
use crate::{Result, WardenError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Root prefix of every backup object
pub const BACKUP_PREFIX: &str = "backups/";
/// Current record format version
pub const RECORD_FORMAT_VERSION: u32 = 1;

const PAYLOAD_SUFFIX: &str = ".payload";
const RECORD_SUFFIX: &str = ".record.json";

/// What a strategy captured from the live artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedState {
    pub location: OriginalLocation,
    pub payload: Vec<u8>,
}

/// Metadata of one stored backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: Uuid,
    pub artifact_identity: ArtifactIdentity,
    pub category: Category,
    pub created_at: DateTime<Utc>,
    pub original_location: OriginalLocation,
    /// Storage key of the compressed payload
    pub payload_location: String,
    /// SHA-256 (hex) of the uncompressed payload
    pub checksum: String,
    pub payload_size: u64,
    /// Compression algorithm applied to the stored payload
    pub compression: String,
    /// Descriptor as observed before the mutation
    pub descriptor: ArtifactDescriptor,
    /// Lifecycle state this record vouches for
    pub artifact_state: LifecycleState,
    #[serde(default)]
    pub restore_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restored_at: Option<DateTime<Utc>>,
    pub format_version: u32,
}

impl BackupRecord {
    pub fn record_location(&self) -> String {
        record_key_for(&self.payload_location)
    }

    /// Restored at least once; the record is retained regardless
    pub fn is_consumed(&self) -> bool {
        self.restore_count > 0
    }
}

fn record_key_for(payload_key: &str) -> String {
    match payload_key.strip_suffix(PAYLOAD_SUFFIX) {
        Some(stem) => format!("{stem}{RECORD_SUFFIX}"),
        None => format!("{payload_key}{RECORD_SUFFIX}"),
    }
}

/// SHA-256 hex digest
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Identity that could not be purged and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeFailure {
    pub identity: ArtifactIdentity,
    pub reason: String,
}

/// Result of a best-effort bulk purge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub purged: Vec<ArtifactIdentity>,
    pub failures: Vec<PurgeFailure>,
}

impl PurgeReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Records per artifact, oldest first. Keyed by category as well so two
/// categories can never see each other's backups of the same identity.
type Index = BTreeMap<(Category, ArtifactIdentity), Vec<BackupRecord>>;

/// Persistent backup store
pub struct BackupStore {
    storage: Arc<dyn StorageAdapter>,
    compression: Arc<dyn CompressionAdapter>,
    index: RwLock<Index>,
}

impl BackupStore {
    /// Open the store, indexing every readable record under `backups/`
    pub fn open(
        storage: Arc<dyn StorageAdapter>,
        compression: Arc<dyn CompressionAdapter>,
    ) -> Result<Self> {
        let mut index = Index::new();

        for key in storage.list(BACKUP_PREFIX)? {
            if !key.ends_with(RECORD_SUFFIX) {
                continue;
            }
            let record = storage
                .load(&key)
                .and_then(|raw| serde_json::from_slice::<BackupRecord>(&raw).map_err(Into::into));
            match record {
                Ok(record) if record.format_version <= RECORD_FORMAT_VERSION => {
                    index
                        .entry((record.category, record.artifact_identity.clone()))
                        .or_default()
                        .push(record);
                }
                Ok(record) => warn!(
                    "Skipping backup record {} with unsupported format version {}",
                    key, record.format_version
                ),
                Err(e) => warn!("Skipping unreadable backup record {}: {}", key, e),
            }
        }

        for records in index.values_mut() {
            records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        }

        debug!("Backup store opened with {} identities", index.len());
        Ok(Self {
            storage,
            compression,
            index: RwLock::new(index),
        })
    }

    fn read_index(&self) -> Result<std::sync::RwLockReadGuard<'_, Index>> {
        self.index
            .read()
            .map_err(|_| WardenError::storage("backup index lock poisoned"))
    }

    fn write_index(&self) -> Result<std::sync::RwLockWriteGuard<'_, Index>> {
        self.index
            .write()
            .map_err(|_| WardenError::storage("backup index lock poisoned"))
    }

    fn save_record(&self, record: &BackupRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        self.storage.save(&json, &record.record_location())
    }

    /// Persist `captured` as a new backup of `descriptor`.
    ///
    /// The new record vouches for an Active artifact until the caller marks it
    /// otherwise. Any failure is reported as [`WardenError::BackupFailure`].
    pub fn create_backup(
        &self,
        descriptor: &ArtifactDescriptor,
        captured: CapturedState,
    ) -> Result<BackupRecord> {
        let identity = &descriptor.identity;
        let created_at = Utc::now();
        let backup_id = Uuid::new_v4();
        let payload_location = format!(
            "{BACKUP_PREFIX}{}/{}/{}_{}{PAYLOAD_SUFFIX}",
            descriptor.category.storage_dir(),
            identity.storage_key(),
            created_at.format("%Y%m%dT%H%M%S%6fZ"),
            backup_id.simple()
        );

        let compressed = self
            .compression
            .compress(&captured.payload)
            .map_err(|e| WardenError::backup_failure(identity, e.to_string()))?;

        let record = BackupRecord {
            backup_id,
            artifact_identity: identity.clone(),
            category: descriptor.category,
            created_at,
            original_location: captured.location,
            payload_location,
            checksum: checksum(&captured.payload),
            payload_size: captured.payload.len() as u64,
            compression: self.compression.algorithm_name().to_string(),
            descriptor: descriptor.clone(),
            artifact_state: LifecycleState::Active,
            restore_count: 0,
            last_restored_at: None,
            format_version: RECORD_FORMAT_VERSION,
        };

        self.storage
            .save(&compressed, &record.payload_location)
            .map_err(|e| WardenError::backup_failure(identity, e.to_string()))?;
        if let Err(e) = self.save_record(&record) {
            let _ = self.storage.delete(&record.payload_location);
            return Err(WardenError::backup_failure(identity, e.to_string()));
        }

        self.write_index()?
            .entry((descriptor.category, identity.clone()))
            .or_default()
            .push(record.clone());

        observability::record_backup_created();
        info!(
            "Backed up {} ({} bytes, sha256 {})",
            identity,
            record.payload_size,
            &record.checksum[..12]
        );
        Ok(record)
    }

    /// Most recent backup of `identity` within `category`
    pub fn latest(&self, identity: &ArtifactIdentity, category: Category) -> Result<Option<BackupRecord>> {
        Ok(self
            .read_index()?
            .get(&(category, identity.clone()))
            .and_then(|records| records.last())
            .cloned())
    }

    /// Every stored record, optionally restricted to one category, oldest first
    pub fn records(&self, category: Option<Category>) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self
            .read_index()?
            .iter()
            .filter(|((c, _), _)| category.map_or(true, |wanted| *c == wanted))
            .flat_map(|(_, records)| records.iter().cloned())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Load and check the latest payload of `identity` against its checksum
    fn load_verified(&self, identity: &ArtifactIdentity, category: Category) -> Result<(BackupRecord, Vec<u8>)> {
        let record = self
            .latest(identity, category)?
            .ok_or_else(|| WardenError::BackupNotFound {
                identity: identity.clone(),
            })?;

        let integrity = |actual: String| WardenError::IntegrityFailure {
            identity: identity.clone(),
            expected: record.checksum.clone(),
            actual,
        };

        if !self.storage.exists(&record.payload_location) {
            return Err(integrity("payload missing".to_string()));
        }
        let stored = self.storage.load(&record.payload_location)?;
        let payload = self
            .compression
            .decompress(&stored)
            .map_err(|e| integrity(format!("undecodable payload ({e})")))?;
        let actual = checksum(&payload);
        if actual != record.checksum {
            return Err(integrity(actual));
        }
        Ok((record, payload))
    }

    /// Check the latest backup of `identity` without restoring it
    pub fn verify(&self, identity: &ArtifactIdentity, category: Category) -> Result<BackupRecord> {
        self.load_verified(identity, category).map(|(record, _)| record)
    }

    /// Hand the latest verified payload of `identity` to `writer`.
    ///
    /// `writer` performs the actual write-back to the original location and is
    /// never called on a payload that fails its checksum. On success the
    /// record is marked consumed but retained, so restore can be repeated.
    /// Once `writer` has succeeded, failing to save the record is a
    /// [`WardenError::BackupStoreInconsistent`].
    pub fn restore<F>(&self, identity: &ArtifactIdentity, category: Category, writer: F) -> Result<BackupRecord>
    where
        F: FnOnce(&BackupRecord, &[u8]) -> Result<()>,
    {
        let (mut record, payload) = self.load_verified(identity, category)?;
        writer(&record, &payload)?;

        record.restore_count += 1;
        record.last_restored_at = Some(Utc::now());
        self.replace_latest(record.clone())
            .map_err(|e| WardenError::BackupStoreInconsistent {
                identity: identity.clone(),
                action: "restore",
                reason: e.to_string(),
            })?;

        info!("Restored {} to {}", identity, record.original_location);
        Ok(record)
    }

    /// Update the lifecycle state the latest record of `identity` vouches for
    pub fn mark_state(
        &self,
        identity: &ArtifactIdentity,
        category: Category,
        state: LifecycleState,
    ) -> Result<BackupRecord> {
        let mut record = self
            .latest(identity, category)?
            .ok_or_else(|| WardenError::BackupNotFound {
                identity: identity.clone(),
            })?;
        record.artifact_state = state;
        self.replace_latest(record.clone())?;
        Ok(record)
    }

    fn replace_latest(&self, record: BackupRecord) -> Result<()> {
        self.save_record(&record)?;
        let mut index = self.write_index()?;
        if let Some(last) = index
            .get_mut(&(record.category, record.artifact_identity.clone()))
            .and_then(|records| records.iter_mut().rev().find(|r| r.backup_id == record.backup_id))
        {
            *last = record;
        }
        Ok(())
    }

    /// Drop one record from the index, and the key once it has none left
    fn unindex(&self, record: &BackupRecord) -> Result<()> {
        let key = (record.category, record.artifact_identity.clone());
        let mut index = self.write_index()?;
        if let Some(entries) = index.get_mut(&key) {
            entries.retain(|r| r.backup_id != record.backup_id);
            if entries.is_empty() {
                index.remove(&key);
            }
        }
        Ok(())
    }

    /// Delete every backup of `identity` within `category`, returning the
    /// deleted records.
    ///
    /// Each record leaves the index as soon as its record object is gone, so a
    /// failure part way leaves the index describing exactly what is still on
    /// storage and is reported as [`WardenError::PurgeIncomplete`].
    pub(crate) fn purge(&self, identity: &ArtifactIdentity, category: Category) -> Result<Vec<BackupRecord>> {
        let records = self
            .read_index()?
            .get(&(category, identity.clone()))
            .cloned()
            .unwrap_or_default();
        if records.is_empty() {
            return Err(WardenError::BackupNotFound {
                identity: identity.clone(),
            });
        }

        let total = records.len();
        let mut purged = Vec::with_capacity(total);
        for record in records {
            // Record first: a payload without a record is unreachable, the
            // reverse would be a dangling pointer.
            if let Err(e) = self.storage.delete(&record.record_location()) {
                warn!("Purge of {} stopped at {}: {}", identity, record.backup_id, e);
                return Err(WardenError::PurgeIncomplete {
                    identity: identity.clone(),
                    purged: purged.len(),
                    total,
                    reason: e.to_string(),
                });
            }
            self.unindex(&record)?;
            if let Err(e) = self.storage.delete(&record.payload_location) {
                warn!("Orphaned payload {}: {}", record.payload_location, e);
            }
            purged.push(record);
        }

        info!("Purged {} backup(s) of {}", total, identity);
        Ok(purged)
    }

    /// Identities with at least one backup
    pub fn identities(&self, category: Option<Category>) -> Result<Vec<ArtifactIdentity>> {
        let mut identities: Vec<ArtifactIdentity> = self
            .read_index()?
            .keys()
            .filter(|(c, _)| category.map_or(true, |wanted| *c == wanted))
            .map(|(_, identity)| identity.clone())
            .collect();
        identities.sort();
        identities.dedup();
        Ok(identities)
    }
}
