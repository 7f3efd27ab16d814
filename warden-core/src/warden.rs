/*!
The `Warden` facade: one storage root, one backup store, one timeline, one
snapshot engine and a lifecycle per category.
*/

use crate::backup::{BackupStore, PurgeReport};
use crate::config::WardenConfig;
use crate::lifecycle::Lifecycle;
use crate::model::Category;
use crate::search::{SearchIndex, SearchMatch};
use crate::snapshot::{ArtifactCollector, ProfileCollector, Snapshot, SnapshotEngine};
use crate::storage::{LocalFileStorage, StorageAdapter};
use crate::strategy::ArtifactStrategy;
use crate::timeline::Timeline;
use crate::{Result, WardenError};
use std::sync::Arc;
use tracing::info;

/// The per-category strategies a `Warden` drives
pub struct Strategies {
    pub launch_items: Box<dyn ArtifactStrategy>,
    pub login_items: Box<dyn ArtifactStrategy>,
    pub ports: Box<dyn ArtifactStrategy>,
}

impl Strategies {
    pub fn new<L, I, P>(launch_items: L, login_items: I, ports: P) -> Self
    where
        L: ArtifactStrategy + 'static,
        I: ArtifactStrategy + 'static,
        P: ArtifactStrategy + 'static,
    {
        Self {
            launch_items: Box::new(launch_items),
            login_items: Box::new(login_items),
            ports: Box::new(ports),
        }
    }

    fn validate(&self) -> Result<()> {
        for (expected, strategy) in [
            (Category::LaunchItem, &self.launch_items),
            (Category::LoginItem, &self.login_items),
            (Category::Port, &self.ports),
        ] {
            if strategy.category() != expected {
                return Err(WardenError::validation(format!(
                    "{expected} slot was given a {} strategy",
                    strategy.category()
                )));
            }
        }
        Ok(())
    }
}

/// Entry point to the lifecycle and forensics engines
pub struct Warden {
    config: WardenConfig,
    store: Arc<BackupStore>,
    timeline: Arc<Timeline>,
    snapshots: SnapshotEngine,
    launch_items: Lifecycle,
    login_items: Lifecycle,
    ports: Lifecycle,
}

impl Warden {
    /// Open the state directory named by `config`
    pub fn open(config: WardenConfig, strategies: Strategies) -> Result<Self> {
        let storage = Arc::new(LocalFileStorage::with_base_dir(&config.state_dir));
        Self::with_storage(config, storage, strategies)
    }

    /// Open on an explicit storage adapter
    pub fn with_storage(
        config: WardenConfig,
        storage: Arc<dyn StorageAdapter>,
        strategies: Strategies,
    ) -> Result<Self> {
        config.validate()?;
        strategies.validate()?;

        let compression = config.compression.build();
        let store = Arc::new(BackupStore::open(storage.clone(), compression.clone())?);
        let timeline = Arc::new(Timeline::open(storage.clone())?);
        let snapshots = SnapshotEngine::new(
            storage,
            compression,
            timeline.clone(),
            config.max_collector_threads,
        )?;

        let policy = config.lock_retry.policy();
        let lifecycle = |strategy: Box<dyn ArtifactStrategy>| {
            Lifecycle::new(strategy, store.clone(), timeline.clone(), policy.clone())
        };
        let launch_items = lifecycle(strategies.launch_items);
        let login_items = lifecycle(strategies.login_items);
        let ports = lifecycle(strategies.ports);

        info!("Warden opened at {}", config.state_dir.display());
        Ok(Self {
            config,
            store,
            timeline,
            snapshots,
            launch_items,
            login_items,
            ports,
        })
    }

    pub fn with_collector(mut self, collector: Arc<dyn ArtifactCollector>) -> Self {
        self.snapshots = self.snapshots.with_collector(collector);
        self
    }

    pub fn with_profile_collector(mut self, collector: Arc<dyn ProfileCollector>) -> Self {
        self.snapshots = self.snapshots.with_profile_collector(collector);
        self
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn backups(&self) -> &BackupStore {
        &self.store
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn snapshots(&self) -> &SnapshotEngine {
        &self.snapshots
    }

    pub fn launch_items(&self) -> &Lifecycle {
        &self.launch_items
    }

    pub fn login_items(&self) -> &Lifecycle {
        &self.login_items
    }

    pub fn ports(&self) -> &Lifecycle {
        &self.ports
    }

    pub fn lifecycle(&self, category: Category) -> &Lifecycle {
        match category {
            Category::LaunchItem => &self.launch_items,
            Category::LoginItem => &self.login_items,
            Category::Port => &self.ports,
        }
    }

    /// Index `snapshot`'s live artifacts and profiles together with every
    /// stored backup
    pub fn search_index(&self, snapshot: &Snapshot) -> Result<SearchIndex> {
        let mut index = SearchIndex::new()
            .with_live(snapshot.entries.values().flatten().cloned())
            .with_profiles(snapshot.profiles.iter().cloned())
            .with_backups(self.store.records(None)?);
        for category in Category::ALL {
            index = index.with_restorable(category, self.lifecycle(category).strategy().restorable());
        }
        for descriptor in snapshot.entries.values().flatten() {
            let state = self.lifecycle(descriptor.category).state(&descriptor.identity)?;
            index = index.with_state(descriptor.category, descriptor.identity.clone(), state);
        }
        Ok(index)
    }

    /// Purge every backup, optionally within one category.
    ///
    /// Each identity goes through its category's lifecycle, so every purge is
    /// locked, reflected in lifecycle state and recorded on the timeline.
    /// Best effort; fatal errors abort.
    pub fn purge_all(&self, category: Option<Category>) -> Result<PurgeReport> {
        let categories: Vec<Category> = match category {
            Some(category) => vec![category],
            None => Category::ALL.to_vec(),
        };
        let mut report = PurgeReport::default();
        for category in categories {
            let purged = self.lifecycle(category).purge_all()?;
            report.purged.extend(purged.purged);
            report.failures.extend(purged.failures);
        }
        info!(
            "Purged {} identities, {} failed",
            report.purged.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Collect live state (without storing a snapshot) and search it
    pub fn search(&self, keyword: &str) -> Result<Vec<SearchMatch>> {
        let live = self.snapshots.collect()?;
        Ok(self.search_index(&live)?.search(keyword))
    }
}
