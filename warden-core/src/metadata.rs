/*!
Metadata stored alongside every snapshot.

The metadata travels inside the snapshot container and carries what is needed
to list snapshots and to verify one on load: the per-category counts, the
collectors that failed, and a SHA-256 hash of the serialized snapshot body.
*/

use crate::backup::checksum;
use crate::model::Category;
use crate::{Result, WardenError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current snapshot container format version
pub const METADATA_FORMAT_VERSION: u8 = 1;

/// Descriptive and integrity metadata of one stored snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub snapshot_id: String,
    pub captured_at: DateTime<Utc>,
    /// Number of descriptors per category
    pub counts: BTreeMap<Category, usize>,
    /// Categories whose collector failed
    #[serde(default)]
    pub failed_categories: Vec<Category>,
    #[serde(default)]
    pub profile_count: usize,
    /// SHA-256 of the serialized snapshot body
    pub content_hash: String,
    pub uncompressed_size: usize,
    pub compressed_size: Option<usize>,
    pub compression_algorithm: String,
    pub format_version: u8,
}

impl SnapshotMetadata {
    pub fn new<S: Into<String>>(snapshot_id: S, captured_at: DateTime<Utc>) -> Self {
        Self {
            snapshot_id: snapshot_id.into(),
            captured_at,
            counts: BTreeMap::new(),
            failed_categories: Vec::new(),
            profile_count: 0,
            content_hash: String::new(),
            uncompressed_size: 0,
            compressed_size: None,
            compression_algorithm: "gzip".to_string(),
            format_version: METADATA_FORMAT_VERSION,
        }
    }

    /// Set the content hash and size from the serialized body
    pub fn with_content_hash(mut self, body: &[u8]) -> Self {
        self.content_hash = checksum(body);
        self.uncompressed_size = body.len();
        self
    }

    pub fn with_compressed_size(mut self, compressed_size: usize) -> Self {
        self.compressed_size = Some(compressed_size);
        self
    }

    pub fn with_compression_algorithm<S: Into<String>>(mut self, algorithm: S) -> Self {
        self.compression_algorithm = algorithm.into();
        self
    }

    /// Total descriptors across categories
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn verify_integrity(&self, body: &[u8]) -> Result<()> {
        let actual = checksum(body);
        if actual == self.content_hash {
            Ok(())
        } else {
            Err(WardenError::SnapshotIntegrity {
                id: self.snapshot_id.clone(),
                expected: self.content_hash.clone(),
                actual,
            })
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.snapshot_id.is_empty() {
            return Err(WardenError::validation("snapshot_id cannot be empty"));
        }
        if self.content_hash.is_empty() {
            return Err(WardenError::validation("content_hash cannot be empty"));
        }
        Ok(())
    }

    pub fn is_compatible(&self) -> bool {
        self.format_version <= METADATA_FORMAT_VERSION
    }
}
