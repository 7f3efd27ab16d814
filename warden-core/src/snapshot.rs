/*!
Snapshot engine: point-in-time capture of every managed artifact.

The engine runs the configured collectors on a bounded thread pool, normalizes
their output into a category-ordered [`Snapshot`], and stores it write-once as
a compressed container with integrity metadata. Stored snapshots are never
modified.
*/

use crate::compression::CompressionAdapter;
use crate::diff::{self, DiffResult};
use crate::metadata::{SnapshotMetadata, METADATA_FORMAT_VERSION};
use crate::model::{ArtifactDescriptor, ArtifactIdentity, Category};
use crate::observability;
use crate::profile::ProfileDescriptor;
use crate::storage::StorageAdapter;
use crate::timeline::{Outcome, Timeline, TimelineAction, TimelineEvent};
use crate::{Result, WardenError};
use chrono::{DateTime, TimeZone, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Prefix of every stored snapshot key
pub const SNAPSHOT_PREFIX: &str = "snapshots/snapshot_";
const SNAPSHOT_SUFFIX: &str = ".json.gz";

/// Produces the live artifacts of one category
pub trait ArtifactCollector: Send + Sync {
    fn category(&self) -> Category;
    fn collect(&self) -> Result<Vec<ArtifactDescriptor>>;
}

/// Produces the installed configuration profiles
pub trait ProfileCollector: Send + Sync {
    fn collect(&self) -> Result<Vec<ProfileDescriptor>>;
}

/// Immutable capture of all categories at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub captured_at: DateTime<Utc>,
    /// Descriptors per category, in collection order
    pub entries: BTreeMap<Category, Vec<ArtifactDescriptor>>,
    /// Categories whose collector failed, with the reason
    #[serde(default)]
    pub failures: BTreeMap<Category, String>,
    #[serde(default)]
    pub profiles: Vec<ProfileDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_failure: Option<String>,
}

impl Snapshot {
    /// Build a snapshot from already-collected descriptors, grouped by their
    /// category in the given order
    pub fn from_descriptors<S: Into<String>>(
        id: S,
        captured_at: DateTime<Utc>,
        descriptors: Vec<ArtifactDescriptor>,
    ) -> Self {
        let mut snapshot = Self {
            id: id.into(),
            captured_at,
            entries: Category::ALL.iter().map(|c| (*c, Vec::new())).collect(),
            failures: BTreeMap::new(),
            profiles: Vec::new(),
            profile_failure: None,
        };
        snapshot.extend(descriptors);
        snapshot
    }

    fn extend(&mut self, descriptors: Vec<ArtifactDescriptor>) {
        let mut seen: HashSet<(Category, ArtifactIdentity)> = self
            .entries
            .iter()
            .flat_map(|(c, list)| list.iter().map(move |d| (*c, d.identity.clone())))
            .collect();

        for descriptor in descriptors {
            if !seen.insert((descriptor.category, descriptor.identity.clone())) {
                warn!(
                    "Dropping duplicate {} {} from collector output",
                    descriptor.category, descriptor.identity
                );
                continue;
            }
            self.entries
                .entry(descriptor.category)
                .or_default()
                .push(descriptor);
        }
    }

    /// Descriptors of `category`; empty when none were collected
    pub fn entries(&self, category: Category) -> &[ArtifactDescriptor] {
        self.entries
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn find(&self, category: Category, identity: &ArtifactIdentity) -> Option<&ArtifactDescriptor> {
        self.entries(category).iter().find(|d| &d.identity == identity)
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.profile_failure.is_none()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Container written to storage: metadata + snapshot body
#[derive(Serialize, Deserialize, Debug)]
struct SnapshotContainer {
    metadata: SnapshotMetadata,
    snapshot: Snapshot,
}

/// Issues monotonic, timestamp-derived snapshot ids
#[derive(Debug, Default)]
struct IdClock {
    last_millis: i64,
    sequence: u32,
}

impl IdClock {
    fn next(&mut self, now: DateTime<Utc>) -> (String, DateTime<Utc>) {
        let millis = now.timestamp_millis();
        if millis > self.last_millis {
            self.last_millis = millis;
            self.sequence = 0;
        } else {
            self.sequence += 1;
        }
        let at = Utc
            .timestamp_millis_opt(self.last_millis)
            .single()
            .unwrap_or(now);
        let id = format!(
            "{}-{:03}-{:04}",
            at.format("%Y%m%d-%H%M%S"),
            self.last_millis.rem_euclid(1000),
            self.sequence
        );
        (id, at)
    }
}

fn snapshot_key(id: &str) -> String {
    format!("{SNAPSHOT_PREFIX}{id}{SNAPSHOT_SUFFIX}")
}

/// Captures, stores, loads and compares snapshots
pub struct SnapshotEngine {
    storage: Arc<dyn StorageAdapter>,
    compressor: Arc<dyn CompressionAdapter>,
    timeline: Arc<Timeline>,
    collectors: Vec<Arc<dyn ArtifactCollector>>,
    profiles: Option<Arc<dyn ProfileCollector>>,
    pool: rayon::ThreadPool,
    clock: Mutex<IdClock>,
}

impl SnapshotEngine {
    /// Create an engine running at most `max_threads` collectors at once
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        compressor: Arc<dyn CompressionAdapter>,
        timeline: Arc<Timeline>,
        max_threads: usize,
    ) -> Result<Self> {
        let threads = max_threads.clamp(1, num_cpus::get().max(1));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("warden-collector-{i}"))
            .build()
            .map_err(|e| WardenError::validation(format!("Failed to build collector pool: {e}")))?;

        Ok(Self {
            storage,
            compressor,
            timeline,
            collectors: Vec::new(),
            profiles: None,
            pool,
            clock: Mutex::new(IdClock::default()),
        })
    }

    /// Add a category collector; collectors of one category run in insertion order
    pub fn with_collector(mut self, collector: Arc<dyn ArtifactCollector>) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn with_profile_collector(mut self, collector: Arc<dyn ProfileCollector>) -> Self {
        self.profiles = Some(collector);
        self
    }

    fn next_id(&self) -> Result<(String, DateTime<Utc>)> {
        let mut clock = self
            .clock
            .lock()
            .map_err(|_| WardenError::storage("snapshot id clock poisoned"))?;
        loop {
            let (id, at) = clock.next(Utc::now());
            if !self.storage.exists(&snapshot_key(&id)) {
                return Ok((id, at));
            }
        }
    }

    /// Run every collector and assemble the results without storing them
    pub fn collect(&self) -> Result<Snapshot> {
        let (id, captured_at) = self.next_id()?;
        let collectors = &self.collectors;
        let profile_collector = self.profiles.as_ref();

        let (results, profiles) = self.pool.install(|| {
            rayon::join(
                || {
                    collectors
                        .par_iter()
                        .map(|c| (c.category(), c.collect()))
                        .collect::<Vec<_>>()
                },
                || profile_collector.map(|c| c.collect()),
            )
        });

        let mut snapshot = Snapshot::from_descriptors(id, captured_at, Vec::new());
        for (category, result) in results {
            match result {
                Ok(descriptors) => {
                    debug!("Collected {} {}(s)", descriptors.len(), category);
                    snapshot.extend(descriptors);
                }
                Err(e) => {
                    let err = WardenError::CollectorFailure {
                        category,
                        reason: e.to_string(),
                    };
                    warn!("{}", err);
                    snapshot.failures.insert(category, err.to_string());
                }
            }
        }

        match profiles {
            Some(Ok(profiles)) => snapshot.profiles = profiles,
            Some(Err(e)) => {
                warn!("Profile collector failed: {}", e);
                snapshot.profile_failure = Some(e.to_string());
            }
            None => {}
        }

        Ok(snapshot)
    }

    /// Capture and persist a new snapshot
    pub fn capture(&self) -> Result<Snapshot> {
        let started = Instant::now();
        let snapshot = self.collect()?;
        let saved = self.save(&snapshot);
        observability::record_capture_duration(started.elapsed());

        let outcome = match &saved {
            Ok(_) => Outcome::Success,
            Err(e) => Outcome::failure(e.to_string()),
        };
        self.timeline.record(
            TimelineEvent::system(TimelineAction::SnapshotCaptured, outcome)
                .with_detail(format!("snapshot {}", snapshot.id)),
        )?;

        let metadata = saved?;
        info!(
            "Captured snapshot {} ({} artifacts, {} profiles, {} failed collectors)",
            snapshot.id,
            metadata.total(),
            metadata.profile_count,
            metadata.failed_categories.len()
        );
        Ok(snapshot)
    }

    /// Store `snapshot`. Refuses to overwrite an existing id.
    pub fn save(&self, snapshot: &Snapshot) -> Result<SnapshotMetadata> {
        let key = snapshot_key(&snapshot.id);
        if self.storage.exists(&key) {
            return Err(WardenError::validation(format!(
                "Snapshot {} already exists",
                snapshot.id
            )));
        }

        let body = serde_json::to_vec(snapshot)?;
        let mut metadata = SnapshotMetadata::new(snapshot.id.clone(), snapshot.captured_at)
            .with_content_hash(&body)
            .with_compression_algorithm(self.compressor.algorithm_name());
        metadata.counts = snapshot
            .entries
            .iter()
            .map(|(c, list)| (*c, list.len()))
            .collect();
        metadata.failed_categories = snapshot.failures.keys().copied().collect();
        metadata.profile_count = snapshot.profiles.len();
        metadata.validate()?;

        let container = SnapshotContainer {
            metadata: metadata.clone(),
            snapshot: snapshot.clone(),
        };
        let compressed = self.compressor.compress(&serde_json::to_vec(&container)?)?;
        let metadata = metadata.with_compressed_size(compressed.len());

        self.storage
            .save(&compressed, &key)
            .map_err(|e| WardenError::storage(format!("Failed to save snapshot {}: {e}", snapshot.id)))?;
        Ok(metadata)
    }

    fn read_container(&self, id: &str) -> Result<SnapshotContainer> {
        let key = snapshot_key(id);
        if !self.storage.exists(&key) {
            return Err(WardenError::SnapshotNotFound(id.to_string()));
        }
        let compressed = self.storage.load(&key)?;
        let raw = self.compressor.decompress(&compressed)?;
        let container: SnapshotContainer = serde_json::from_slice(&raw)?;

        if !container.metadata.is_compatible() {
            return Err(WardenError::invalid_format(format!(
                "Incompatible snapshot format version: {} (current: {})",
                container.metadata.format_version, METADATA_FORMAT_VERSION
            )));
        }
        Ok(container)
    }

    /// Load and verify a stored snapshot
    pub fn load(&self, id: &str) -> Result<Snapshot> {
        let container = self.read_container(id)?;
        let body = serde_json::to_vec(&container.snapshot)?;
        container.metadata.verify_integrity(&body)?;
        Ok(container.snapshot)
    }

    /// Metadata of every stored snapshot, oldest first. Unreadable snapshots
    /// are skipped.
    pub fn list(&self) -> Result<Vec<SnapshotMetadata>> {
        let mut listed = Vec::new();
        for key in self.storage.list(SNAPSHOT_PREFIX)? {
            let Some(id) = key
                .strip_prefix(SNAPSHOT_PREFIX)
                .and_then(|rest| rest.strip_suffix(SNAPSHOT_SUFFIX))
            else {
                continue;
            };
            match self.read_container(id) {
                Ok(container) => listed.push(container.metadata),
                Err(e) => warn!("Skipping unreadable snapshot {}: {}", key, e),
            }
        }
        listed.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        Ok(listed)
    }

    /// Id of the most recent stored snapshot
    pub fn latest_id(&self) -> Result<Option<String>> {
        Ok(self.list()?.pop().map(|m| m.snapshot_id))
    }

    /// Load two snapshots and diff them; `to_id` is the later one
    pub fn compare(&self, from_id: &str, to_id: &str) -> Result<DiffResult> {
        let result = self
            .load(from_id)
            .and_then(|a| self.load(to_id).map(|b| diff::compare(&a, &b)));

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) => Outcome::failure(e.to_string()),
        };
        self.timeline.record(
            TimelineEvent::system(TimelineAction::SnapshotCompared, outcome)
                .with_detail(format!("{from_id} -> {to_id}")),
        )?;
        result
    }

    /// Delete every stored snapshot, returning how many were removed
    pub fn clear_all(&self) -> Result<usize> {
        let keys = self.storage.list(SNAPSHOT_PREFIX)?;
        let mut removed = 0;
        let mut result = Ok(());
        for key in &keys {
            match self.storage.delete(key) {
                Ok(()) => removed += 1,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        let outcome = match &result {
            Ok(()) => Outcome::Success,
            Err(e) => Outcome::failure(e.to_string()),
        };
        self.timeline.record(
            TimelineEvent::system(TimelineAction::SnapshotsCleared, outcome)
                .with_detail(format!("{removed} snapshot(s) deleted")),
        )?;
        result?;

        info!("Cleared {} snapshot(s)", removed);
        Ok(removed)
    }
}
