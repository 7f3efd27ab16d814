/*!
Error types for the Warden core engine.
*/

use crate::model::{ArtifactIdentity, Category};
use thiserror::Error;
use warden_retry::RetryableError;

/// Result type used throughout the Warden core.
pub type Result<T> = std::result::Result<T, WardenError>;

/// Errors that can occur during lifecycle, snapshot and timeline operations.
///
/// Artifact-level variants always carry the identity and the action that was
/// being attempted so the operator can attribute the failure.
#[derive(Error, Debug)]
pub enum WardenError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Insufficient privilege to read or mutate an OS object
    #[error("Permission denied while trying to {action} {identity}: {reason}")]
    PermissionDenied {
        identity: ArtifactIdentity,
        action: &'static str,
        reason: String,
    },

    /// Backup source unreadable or destination unwritable
    #[error("Backup of {identity} failed: {reason}")]
    BackupFailure {
        identity: ArtifactIdentity,
        reason: String,
    },

    /// No backup record matches the identity
    #[error("No backup found for {identity}")]
    BackupNotFound { identity: ArtifactIdentity },

    /// Backup payload no longer matches its recorded checksum
    #[error("Integrity check failed for {identity}: expected hash {expected}, got {actual}")]
    IntegrityFailure {
        identity: ArtifactIdentity,
        expected: String,
        actual: String,
    },

    /// One category's collector failed
    #[error("Collector for {category} failed: {reason}")]
    CollectorFailure { category: Category, reason: String },

    /// Another transition holds the identity lock
    #[error("{identity} is being modified by another operation ({action} not started)")]
    ConcurrentModification {
        identity: ArtifactIdentity,
        action: &'static str,
    },

    /// The transition is not legal from the artifact's current state
    #[error("Cannot {action} {identity} while it is {state}")]
    InvalidTransition {
        identity: ArtifactIdentity,
        action: &'static str,
        state: String,
    },

    /// The category has no such transition at all
    #[error("{action} is not supported for {category}")]
    UnsupportedOperation {
        category: Category,
        action: &'static str,
    },

    /// The mutation primitive itself failed after a successful backup
    #[error("Failed to {action} {identity}: {reason}")]
    MutationFailed {
        identity: ArtifactIdentity,
        action: &'static str,
        reason: String,
    },

    /// The artifact was mutated but its backup record could not be updated
    #[error("Backup store out of step with {identity} after {action}: {reason}")]
    BackupStoreInconsistent {
        identity: ArtifactIdentity,
        action: &'static str,
        reason: String,
    },

    /// Some, but not all, backups of an identity were deleted
    #[error("Purge of {identity} stopped after {purged} of {total} backup(s): {reason}")]
    PurgeIncomplete {
        identity: ArtifactIdentity,
        purged: usize,
        total: usize,
        reason: String,
    },

    /// Requested snapshot does not exist
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Integrity check failure on a stored snapshot
    #[error("Snapshot {id} failed integrity check: expected hash {expected}, got {actual}")]
    SnapshotIntegrity {
        id: String,
        expected: String,
        actual: String,
    },

    /// Recording to the timeline failed; forensic integrity is lost
    #[error("Timeline write failed: {0}")]
    TimelineWrite(String),

    /// Invalid stored format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Storage adapter errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl WardenError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a new timeline write error
    pub fn timeline<S: Into<String>>(msg: S) -> Self {
        Self::TimelineWrite(msg.into())
    }

    /// Create a backup failure for `identity`
    pub fn backup_failure<S: Into<String>>(identity: &ArtifactIdentity, reason: S) -> Self {
        Self::BackupFailure {
            identity: identity.clone(),
            reason: reason.into(),
        }
    }

    /// Attribute an I/O error to an artifact and action.
    ///
    /// `PermissionDenied` I/O errors become [`WardenError::PermissionDenied`];
    /// everything else becomes a [`WardenError::MutationFailed`].
    pub fn from_io(identity: &ArtifactIdentity, action: &'static str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied {
                identity: identity.clone(),
                action,
                reason: err.to_string(),
            }
        } else {
            Self::MutationFailed {
                identity: identity.clone(),
                action,
                reason: err.to_string(),
            }
        }
    }

    /// Errors that leave the backup store or timeline unable to vouch for the
    /// forensic record. These propagate out of batch operations.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::TimelineWrite(_) | Self::BackupStoreInconsistent { .. }
        )
    }
}

impl RetryableError for WardenError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}
