/*!
Backup-before-mutate lifecycle for managed artifacts.

One [`Lifecycle`] exists per category. It drives the category's
[`ArtifactStrategy`] through the state machine:

```text
launch items   Active --quarantine--> Quarantined --restore--> Restored
                                      Quarantined --purge----> Purged
login items    Active --remove------> Removed     --restore--> Restored
                                      Removed     --purge----> Purged
ports          Active --close-------> Closed (terminal)
any category   Active --backup------> Active
```

No mutation runs unless its backup was written first. Every transition, failed
or not, is recorded as exactly one timeline event, and a timeline write
failure is returned in place of the transition's own result.
*/

use crate::backup::{BackupRecord, BackupStore, PurgeFailure, PurgeReport};
use crate::model::{ArtifactDescriptor, ArtifactIdentity, Category, LifecycleState};
use crate::observability;
use crate::strategy::ArtifactStrategy;
use crate::timeline::{Outcome, Timeline, TimelineAction, TimelineEvent};
use crate::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use warden_retry::{retry_with_policy, RetryPolicy};

/// Set of identities currently undergoing a transition
#[derive(Debug)]
pub struct IdentityLocks {
    held: Mutex<HashSet<ArtifactIdentity>>,
    policy: RetryPolicy,
}

/// Releases its identity on drop
#[derive(Debug)]
pub struct IdentityGuard<'a> {
    locks: &'a IdentityLocks,
    identity: ArtifactIdentity,
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.held.lock() {
            held.remove(&self.identity);
        }
    }
}

impl IdentityLocks {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            policy,
        }
    }

    fn try_acquire(&self, identity: &ArtifactIdentity, action: &'static str) -> Result<IdentityGuard<'_>> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| WardenError::storage("identity lock set poisoned"))?;
        if held.insert(identity.clone()) {
            Ok(IdentityGuard {
                locks: self,
                identity: identity.clone(),
            })
        } else {
            Err(WardenError::ConcurrentModification {
                identity: identity.clone(),
                action,
            })
        }
    }

    /// Take the lock for `identity`, retrying with backoff while it is held
    pub fn acquire(&self, identity: &ArtifactIdentity, action: &'static str) -> Result<IdentityGuard<'_>> {
        retry_with_policy("identity lock", &self.policy, |attempt| {
            if attempt > 1 {
                observability::record_lock_contention();
            }
            self.try_acquire(identity, action)
        })
    }

    pub fn is_held(&self, identity: &ArtifactIdentity) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(identity))
            .unwrap_or(false)
    }
}

impl Default for IdentityLocks {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

/// Per-artifact result of a batch operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactOutcome {
    pub identity: ArtifactIdentity,
    pub action: TimelineAction,
    pub outcome: Outcome,
    /// State after the attempt, when known
    pub state: Option<LifecycleState>,
}

impl ArtifactOutcome {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Lifecycle state machine for one category
pub struct Lifecycle<S: ArtifactStrategy = Box<dyn ArtifactStrategy>> {
    strategy: S,
    store: Arc<BackupStore>,
    timeline: Arc<Timeline>,
    locks: IdentityLocks,
    states: RwLock<HashMap<ArtifactIdentity, LifecycleState>>,
}

impl<S: ArtifactStrategy> Lifecycle<S> {
    pub fn new(strategy: S, store: Arc<BackupStore>, timeline: Arc<Timeline>, lock_policy: RetryPolicy) -> Self {
        Self {
            strategy,
            store,
            timeline,
            locks: IdentityLocks::new(lock_policy),
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn category(&self) -> Category {
        self.strategy.category()
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn locks(&self) -> &IdentityLocks {
        &self.locks
    }

    /// Current state of `identity`.
    ///
    /// Falls back to the state mirrored in the latest backup record, then to
    /// Active for artifacts Warden has never touched.
    pub fn state(&self, identity: &ArtifactIdentity) -> Result<LifecycleState> {
        if let Some(state) = self
            .states
            .read()
            .map_err(|_| WardenError::storage("lifecycle state map poisoned"))?
            .get(identity)
        {
            return Ok(*state);
        }
        Ok(self
            .store
            .latest(identity, self.category())?
            .map(|record| record.artifact_state)
            .unwrap_or(LifecycleState::Active))
    }

    fn set_state(&self, identity: &ArtifactIdentity, state: LifecycleState) -> Result<()> {
        self.states
            .write()
            .map_err(|_| WardenError::storage("lifecycle state map poisoned"))?
            .insert(identity.clone(), state);
        Ok(())
    }

    /// Settle state after the OS object has already changed.
    ///
    /// The in-memory state always moves to `next`. If the backup record
    /// cannot follow, the store no longer vouches for the artifact and the
    /// error is fatal.
    fn settle(&self, identity: &ArtifactIdentity, action: &'static str, next: LifecycleState) -> Result<()> {
        let persisted = self.store.mark_state(identity, self.category(), next).map(|_| ());
        let cached = self.set_state(identity, next);
        persisted.and(cached).map_err(|e| {
            error!("{} of {} applied but not recorded: {}", action, identity, e);
            WardenError::BackupStoreInconsistent {
                identity: identity.clone(),
                action,
                reason: e.to_string(),
            }
        })
    }

    /// Record the single timeline event for a finished transition.
    ///
    /// A transition that reached the OS but not the backup store is logged as
    /// a success with the inconsistency as detail.
    fn finish<T>(&self, action: TimelineAction, identity: &ArtifactIdentity, result: Result<T>) -> Result<T> {
        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(WardenError::BackupStoreInconsistent { .. }) => Outcome::Success,
            Err(e) => Outcome::failure(e.to_string()),
        };
        observability::record_transition(&action.to_string(), result.is_ok());
        if let Err(e) = &result {
            warn!("{} of {} failed: {}", action, identity, e);
        }

        let mut event = TimelineEvent::artifact(action, self.category(), identity, outcome);
        if let Err(e @ WardenError::BackupStoreInconsistent { .. }) = &result {
            event = event.with_detail(e.to_string());
        }
        self.timeline.record(event)?;
        result
    }

    fn check_category(&self, descriptor: &ArtifactDescriptor, action: &'static str) -> Result<()> {
        if descriptor.category != self.category() {
            return Err(WardenError::UnsupportedOperation {
                category: descriptor.category,
                action,
            });
        }
        Ok(())
    }

    /// Backup then apply the category's mutation (quarantine, remove or close)
    pub fn apply(&self, descriptor: &ArtifactDescriptor) -> Result<LifecycleState> {
        let category = self.category();
        let action = category.mutation_verb();
        let identity = &descriptor.identity;

        let result = self.check_category(descriptor, action).and_then(|_| {
            let _guard = self.locks.acquire(identity, action)?;

            let current = self.state(identity)?;
            if !current.is_active() {
                return Err(WardenError::InvalidTransition {
                    identity: identity.clone(),
                    action,
                    state: current.to_string(),
                });
            }

            let captured = self.strategy.capture_state(descriptor)?;
            let record = self.store.create_backup(descriptor, captured)?;
            debug!("Backup {} durable, applying {}", record.backup_id, action);

            self.strategy.mutate(descriptor, &record)?;

            let next = LifecycleState::after_mutation(category);
            self.settle(identity, action, next)?;
            info!("{} {} -> {}", action, identity, next);
            Ok(next)
        });

        self.finish(TimelineAction::for_mutation(category), identity, result)
    }

    fn apply_as(&self, descriptor: &ArtifactDescriptor, expected: Category, action: &'static str) -> Result<LifecycleState> {
        if self.category() != expected {
            let result = Err(WardenError::UnsupportedOperation {
                category: self.category(),
                action,
            });
            return self.finish(TimelineAction::for_mutation(self.category()), &descriptor.identity, result);
        }
        self.apply(descriptor)
    }

    /// Launch items: Active -> Quarantined
    pub fn quarantine(&self, descriptor: &ArtifactDescriptor) -> Result<LifecycleState> {
        self.apply_as(descriptor, Category::LaunchItem, "quarantine")
    }

    /// Login items: Active -> Removed
    pub fn remove(&self, descriptor: &ArtifactDescriptor) -> Result<LifecycleState> {
        self.apply_as(descriptor, Category::LoginItem, "remove")
    }

    /// Ports: Active -> Closed
    pub fn close(&self, descriptor: &ArtifactDescriptor) -> Result<LifecycleState> {
        self.apply_as(descriptor, Category::Port, "close")
    }

    /// Standalone backup; the artifact stays Active
    pub fn backup(&self, descriptor: &ArtifactDescriptor) -> Result<BackupRecord> {
        let identity = &descriptor.identity;
        let result = self.check_category(descriptor, "back up").and_then(|_| {
            let _guard = self.locks.acquire(identity, "back up")?;

            let current = self.state(identity)?;
            if !current.is_active() {
                return Err(WardenError::InvalidTransition {
                    identity: identity.clone(),
                    action: "back up",
                    state: current.to_string(),
                });
            }

            let captured = self.strategy.capture_state(descriptor)?;
            let record = self.store.create_backup(descriptor, captured)?;
            self.set_state(identity, LifecycleState::Active)?;
            Ok(record)
        });

        self.finish(TimelineAction::BackupCreated, identity, result)
    }

    /// Write the latest backup back to its original location.
    ///
    /// Returns the descriptor captured before the mutation. Repeatable while
    /// the backup exists.
    pub fn restore(&self, identity: &ArtifactIdentity) -> Result<ArtifactDescriptor> {
        let result = if !self.strategy.restorable() {
            Err(WardenError::UnsupportedOperation {
                category: self.category(),
                action: "restore",
            })
        } else {
            self.restore_locked(identity)
        };

        self.finish(TimelineAction::Restore, identity, result)
    }

    fn restore_locked(&self, identity: &ArtifactIdentity) -> Result<ArtifactDescriptor> {
        let _guard = self.locks.acquire(identity, "restore")?;

        let current = self.state(identity)?;
        if current.is_terminal() {
            return Err(WardenError::InvalidTransition {
                identity: identity.clone(),
                action: "restore",
                state: current.to_string(),
            });
        }

        let restored = self.store.restore(identity, self.category(), |record, payload| {
            self.strategy.reinstate(record, payload)
        });
        let record = match restored {
            Ok(record) => record,
            Err(e @ WardenError::BackupStoreInconsistent { .. }) => {
                self.set_state(identity, LifecycleState::Restored)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.settle(identity, "restore", LifecycleState::Restored)?;
        info!("restore {} -> {}", identity, LifecycleState::Restored);
        Ok(record.descriptor)
    }

    /// Delete every backup of `identity` held by this category.
    ///
    /// A backup-only artifact stays Active and a closed port stays Closed;
    /// anything held in backup becomes Purged. Backups other categories hold
    /// for the same identity are untouched.
    pub fn purge(&self, identity: &ArtifactIdentity) -> Result<LifecycleState> {
        let result = self.locks.acquire(identity, "purge").and_then(|_guard| {
            let current = self.state(identity)?;
            self.store.purge(identity, self.category())?;

            let next = if current.is_active() || current == LifecycleState::Closed {
                current
            } else {
                LifecycleState::Purged
            };
            self.set_state(identity, next)?;
            info!("purge {} -> {}", identity, next);
            Ok(next)
        });

        self.finish(TimelineAction::Purge, identity, result)
    }

    /// Purge every backup of this category. Best effort; fatal errors abort.
    pub fn purge_all(&self) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        for identity in self.store.identities(Some(self.category()))? {
            match self.purge(&identity) {
                Ok(_) => report.purged.push(identity),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => report.failures.push(PurgeFailure {
                    identity,
                    reason: e.to_string(),
                }),
            }
        }
        Ok(report)
    }

    /// Apply the mutation to each descriptor independently
    pub fn apply_all(&self, descriptors: &[ArtifactDescriptor]) -> Result<Vec<ArtifactOutcome>> {
        let action = TimelineAction::for_mutation(self.category());
        let mut outcomes = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let outcome = match self.apply(descriptor) {
                Ok(state) => ArtifactOutcome {
                    identity: descriptor.identity.clone(),
                    action,
                    outcome: Outcome::Success,
                    state: Some(state),
                },
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => ArtifactOutcome {
                    identity: descriptor.identity.clone(),
                    action,
                    outcome: Outcome::failure(e.to_string()),
                    state: self.state(&descriptor.identity).ok(),
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Apply the mutation to every descriptor a collector classified unsigned
    pub fn quarantine_unsigned(&self, descriptors: &[ArtifactDescriptor]) -> Result<Vec<ArtifactOutcome>> {
        let unsigned: Vec<ArtifactDescriptor> = descriptors
            .iter()
            .filter(|d| d.is_signed() == Some(false))
            .cloned()
            .collect();
        info!(
            "{} of {} {}s are unsigned",
            unsigned.len(),
            descriptors.len(),
            self.category()
        );
        self.apply_all(&unsigned)
    }
}
