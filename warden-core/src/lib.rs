/*!
# Warden Core

Lifecycle and forensics engine behind the `warden` security audit tool.

The crate covers two subsystems:

- the **managed-artifact lifecycle**: a backup-before-mutate state machine
  applied uniformly to launch agents/daemons, login items and listening ports,
  on top of a checksummed [`BackupStore`];
- **snapshot forensics**: point-in-time capture of every managed artifact
  ([`SnapshotEngine`]), structural diffing ([`diff::compare`]) and an
  append-only audit [`Timeline`].

## Architecture

Persistence goes through two adapters, [`StorageAdapter`] and
[`CompressionAdapter`]; OS access goes through per-category
[`ArtifactStrategy`] implementations and [`ArtifactCollector`]s supplied by the
caller. The core itself never enumerates or mutates the system directly, which
keeps it fully testable against [`MemoryStorage`].

## Usage

```rust
use std::sync::Arc;
use warden_core::{
    ArtifactDescriptor, LaunchItemStrategy, LifecycleState, Lifecycle, BackupStore,
    GzipCompressor, MemoryStorage, Timeline,
};
use warden_retry::RetryPolicy;

let dir = tempfile::tempdir()?;
let plist = dir.path().join("com.example.agent.plist");
std::fs::write(&plist, b"<plist/>")?;

let storage = Arc::new(MemoryStorage::new());
let store = Arc::new(BackupStore::open(storage.clone(), Arc::new(GzipCompressor::new()))?);
let timeline = Arc::new(Timeline::open(storage)?);
let launch_items = Lifecycle::new(LaunchItemStrategy::new(), store, timeline, RetryPolicy::default());

let agent = ArtifactDescriptor::launch_item(&plist);
assert_eq!(launch_items.quarantine(&agent)?, LifecycleState::Quarantined);
assert!(!plist.exists());

launch_items.restore(&agent.identity)?;
assert!(plist.exists());
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/

pub mod backup;
pub mod compression;
pub mod config;
pub mod diff;
pub mod error;
pub mod lifecycle;
pub mod metadata;
pub mod model;
pub mod observability;
pub mod profile;
pub mod search;
pub mod snapshot;
pub mod storage;
pub mod strategy;
pub mod timeline;
pub mod warden;

pub use backup::{BackupRecord, BackupStore, CapturedState, PurgeFailure, PurgeReport};
pub use compression::{CompressionAdapter, GzipCompressor, NoCompression};
pub use config::{CompressionSetting, LockRetryConfig, WardenConfig};
pub use diff::{CategoryDiff, DiffResult, ModifiedArtifact, ProfileDiff};
pub use error::{Result, WardenError};
pub use lifecycle::{ArtifactOutcome, IdentityLocks, Lifecycle};
pub use metadata::SnapshotMetadata;
pub use model::{
    ArtifactDescriptor, ArtifactIdentity, Attributes, Category, LifecycleState,
    LoginItemRegistration, OriginalLocation, PortBinding, Protocol,
};
pub use profile::{ProfileDescriptor, ProfileRisk};
pub use search::{LegalAction, MatchSource, SearchIndex, SearchMatch};
pub use snapshot::{ArtifactCollector, ProfileCollector, Snapshot, SnapshotEngine};
pub use storage::{LocalFileStorage, MemoryStorage, StorageAdapter};
pub use strategy::{
    ArtifactStrategy, LaunchItemStrategy, LoginItemRegistry, LoginItemStrategy, PortCloser,
    PortStrategy,
};
pub use timeline::{Outcome, Timeline, TimelineAction, TimelineEvent, TimelineFilter};
pub use warden::{Strategies, Warden};

#[cfg(test)]
mod error_tests;
