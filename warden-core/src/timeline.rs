/*!
Append-only forensic timeline.

Every lifecycle transition and every snapshot event is recorded here as one
JSON line. The log is independent of the backup store: it is the record of
what Warden did, not of what it kept. Recording failures are fatal to the
calling operation.
*/

use crate::model::{ArtifactIdentity, Category};
use crate::storage::StorageAdapter;
use crate::{Result, WardenError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Storage key of the live log
pub const TIMELINE_KEY: &str = "timeline/timeline.jsonl";
/// Prefix of rotated archives written by [`Timeline::clear`]
pub const ARCHIVE_PREFIX: &str = "timeline/archive/";

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineAction {
    Quarantine,
    Restore,
    Purge,
    BackupCreated,
    LoginItemRemoved,
    PortClosed,
    SnapshotCaptured,
    SnapshotCompared,
    SnapshotsCleared,
    LogCleared,
}

impl TimelineAction {
    /// Action recorded for `category`'s mutating transition
    pub fn for_mutation(category: Category) -> Self {
        match category {
            Category::LaunchItem => TimelineAction::Quarantine,
            Category::LoginItem => TimelineAction::LoginItemRemoved,
            Category::Port => TimelineAction::PortClosed,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(
            value.trim().to_ascii_lowercase().replace('-', "_"),
        ))
        .ok()
    }
}

impl fmt::Display for TimelineAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimelineAction::Quarantine => "quarantine",
            TimelineAction::Restore => "restore",
            TimelineAction::Purge => "purge",
            TimelineAction::BackupCreated => "backup_created",
            TimelineAction::LoginItemRemoved => "login_item_removed",
            TimelineAction::PortClosed => "port_closed",
            TimelineAction::SnapshotCaptured => "snapshot_captured",
            TimelineAction::SnapshotCompared => "snapshot_compared",
            TimelineAction::SnapshotsCleared => "snapshots_cleared",
            TimelineAction::LogCleared => "log_cleared",
        };
        f.write_str(name)
    }
}

/// Result of the recorded action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure { reason: String },
}

impl Outcome {
    pub fn failure<S: Into<String>>(reason: S) -> Self {
        Outcome::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Failure { reason } => write!(f, "failure: {reason}"),
        }
    }
}

/// One timeline entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Position in the log; assigned when recorded
    pub sequence: u64,
    /// Assigned when recorded; never decreases along the log
    pub timestamp: DateTime<Utc>,
    pub action: TimelineAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_identity: Option<ArtifactIdentity>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TimelineEvent {
    /// Event about one artifact
    pub fn artifact(
        action: TimelineAction,
        category: Category,
        identity: &ArtifactIdentity,
        outcome: Outcome,
    ) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            action,
            category: Some(category),
            artifact_identity: Some(identity.clone()),
            outcome,
            detail: None,
        }
    }

    /// Snapshot-level or log-level event with no artifact
    pub fn system(action: TimelineAction, outcome: Outcome) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            action,
            category: None,
            artifact_identity: None,
            outcome,
            detail: None,
        }
    }

    pub fn with_detail<S: Into<String>>(mut self, detail: S) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Query filter; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct TimelineFilter {
    pub category: Option<Category>,
    pub identity: Option<ArtifactIdentity>,
    pub action: Option<TimelineAction>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimelineFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn identity(mut self, identity: ArtifactIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn action(mut self, action: TimelineAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Inclusive time range
    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn matches(&self, event: &TimelineEvent) -> bool {
        if let Some(category) = self.category {
            if event.category != Some(category) {
                return false;
            }
        }
        if let Some(identity) = &self.identity {
            if event.artifact_identity.as_ref() != Some(identity) {
                return false;
            }
        }
        if let Some(action) = self.action {
            if event.action != action {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Lazily parsed, filtered view over the log, oldest first
pub struct TimelineIter {
    data: Vec<u8>,
    position: usize,
    filter: TimelineFilter,
}

impl Iterator for TimelineIter {
    type Item = Result<TimelineEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.position < self.data.len() {
            let rest = &self.data[self.position..];
            let end = rest.iter().position(|b| *b == b'\n').unwrap_or(rest.len());
            let line = &rest[..end];
            self.position += end + 1;

            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            match serde_json::from_slice::<TimelineEvent>(line) {
                Ok(event) if self.filter.matches(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(e) => {
                    return Some(Err(WardenError::invalid_format(format!(
                        "Malformed timeline entry: {e}"
                    ))))
                }
            }
        }
        None
    }
}

#[derive(Debug)]
struct Cursor {
    next_sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

/// The append-only log
pub struct Timeline {
    storage: Arc<dyn StorageAdapter>,
    cursor: Mutex<Cursor>,
}

impl Timeline {
    /// Open the log, resuming the sequence after its last entry
    pub fn open(storage: Arc<dyn StorageAdapter>) -> Result<Self> {
        let mut cursor = Cursor {
            next_sequence: 1,
            last_timestamp: None,
        };

        if storage.exists(TIMELINE_KEY) {
            let data = storage.load(TIMELINE_KEY)?;
            let last = data
                .split(|b| *b == b'\n')
                .filter(|line| !line.iter().all(|b| b.is_ascii_whitespace()))
                .filter_map(|line| serde_json::from_slice::<TimelineEvent>(line).ok())
                .last();
            if let Some(last) = last {
                cursor.next_sequence = last.sequence + 1;
                cursor.last_timestamp = Some(last.timestamp);
            }
        }

        debug!("Timeline opened at sequence {}", cursor.next_sequence);
        Ok(Self {
            storage,
            cursor: Mutex::new(cursor),
        })
    }

    fn lock_cursor(&self) -> Result<std::sync::MutexGuard<'_, Cursor>> {
        self.cursor
            .lock()
            .map_err(|_| WardenError::timeline("timeline cursor lock poisoned"))
    }

    fn stamp(cursor: &Cursor, mut event: TimelineEvent) -> TimelineEvent {
        event.sequence = cursor.next_sequence;
        let now = Utc::now();
        event.timestamp = match cursor.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        event
    }

    fn encode(event: &TimelineEvent) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(event)
            .map_err(|e| WardenError::timeline(format!("Failed to encode event: {e}")))?;
        line.push(b'\n');
        Ok(line)
    }

    /// Append an event, returning it with its sequence and timestamp assigned
    pub fn record(&self, event: TimelineEvent) -> Result<TimelineEvent> {
        let mut cursor = self.lock_cursor()?;
        let event = Self::stamp(&cursor, event);
        let line = Self::encode(&event)?;

        self.storage
            .append(&line, TIMELINE_KEY)
            .map_err(|e| WardenError::timeline(format!("Failed to append {}: {e}", event.action)))?;

        cursor.next_sequence += 1;
        cursor.last_timestamp = Some(event.timestamp);
        debug!(
            "Timeline #{} {} {}",
            event.sequence,
            event.action,
            event.outcome
        );
        Ok(event)
    }

    /// Events matching `filter`, oldest first
    pub fn query(&self, filter: TimelineFilter) -> Result<TimelineIter> {
        let data = if self.storage.exists(TIMELINE_KEY) {
            self.storage.load(TIMELINE_KEY)?
        } else {
            Vec::new()
        };
        Ok(TimelineIter {
            data,
            position: 0,
            filter,
        })
    }

    /// Every event, oldest first
    pub fn all(&self) -> Result<Vec<TimelineEvent>> {
        self.query(TimelineFilter::default())?.collect()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.query(TimelineFilter::default())?.count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncate the log. Irreversible.
    ///
    /// The full history plus a terminal `LogCleared` event is first written to
    /// an archive; the live log is then replaced by that same `LogCleared`
    /// event, naming the archive. Returns the archive key.
    pub fn clear(&self) -> Result<String> {
        let mut cursor = self.lock_cursor()?;

        let history = if self.storage.exists(TIMELINE_KEY) {
            self.storage.load(TIMELINE_KEY)?
        } else {
            Vec::new()
        };

        let archive_key = format!(
            "{ARCHIVE_PREFIX}timeline_{}_{}.jsonl",
            Utc::now().format("%Y%m%d-%H%M%S"),
            cursor.next_sequence
        );
        let event = Self::stamp(
            &cursor,
            TimelineEvent::system(TimelineAction::LogCleared, Outcome::Success)
                .with_detail(format!("archived to {archive_key}")),
        );
        let line = Self::encode(&event)?;

        let mut archive = history;
        if archive.last().is_some_and(|b| *b != b'\n') {
            archive.push(b'\n');
        }
        archive.extend_from_slice(&line);

        self.storage
            .save(&archive, &archive_key)
            .map_err(|e| WardenError::timeline(format!("Failed to archive timeline: {e}")))?;
        self.storage
            .save(&line, TIMELINE_KEY)
            .map_err(|e| WardenError::timeline(format!("Failed to truncate timeline: {e}")))?;

        cursor.next_sequence += 1;
        cursor.last_timestamp = Some(event.timestamp);
        info!("Timeline cleared; history archived to {}", archive_key);
        Ok(archive_key)
    }

    /// Keys of archived logs, oldest first
    pub fn archives(&self) -> Result<Vec<String>> {
        self.storage.list(ARCHIVE_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn timeline() -> (Arc<MemoryStorage>, Timeline) {
        let storage = Arc::new(MemoryStorage::new());
        let timeline = Timeline::open(storage.clone()).unwrap();
        (storage, timeline)
    }

    fn agent() -> ArtifactIdentity {
        ArtifactIdentity::for_path("/Library/LaunchAgents/com.example.agent.plist")
    }

    #[test]
    fn test_events_are_returned_in_record_order() {
        let (_, timeline) = timeline();
        for action in [
            TimelineAction::Quarantine,
            TimelineAction::Restore,
            TimelineAction::Purge,
        ] {
            timeline
                .record(TimelineEvent::artifact(
                    action,
                    Category::LaunchItem,
                    &agent(),
                    Outcome::Success,
                ))
                .unwrap();
        }

        let events = timeline.all().unwrap();
        let actions: Vec<_> = events.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                TimelineAction::Quarantine,
                TimelineAction::Restore,
                TimelineAction::Purge
            ]
        );
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_query_filters() {
        let (_, timeline) = timeline();
        timeline
            .record(TimelineEvent::artifact(
                TimelineAction::Quarantine,
                Category::LaunchItem,
                &agent(),
                Outcome::Success,
            ))
            .unwrap();
        timeline
            .record(TimelineEvent::artifact(
                TimelineAction::PortClosed,
                Category::Port,
                &ArtifactIdentity::new("8080/tcp"),
                Outcome::failure("permission denied"),
            ))
            .unwrap();
        timeline
            .record(
                TimelineEvent::system(TimelineAction::SnapshotCaptured, Outcome::Success)
                    .with_detail("snapshot 1"),
            )
            .unwrap();

        let ports: Vec<_> = timeline
            .query(TimelineFilter::new().category(Category::Port))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(ports.len(), 1);
        assert!(!ports[0].outcome.is_success());

        let by_identity = timeline
            .query(TimelineFilter::new().identity(agent()))
            .unwrap()
            .count();
        assert_eq!(by_identity, 1);

        let snapshots = timeline
            .query(TimelineFilter::new().action(TimelineAction::SnapshotCaptured))
            .unwrap()
            .count();
        assert_eq!(snapshots, 1);

        let future = Utc::now() + chrono::Duration::hours(1);
        let none = timeline
            .query(TimelineFilter::new().between(Some(future), None))
            .unwrap()
            .count();
        assert_eq!(none, 0);
    }

    #[test]
    fn test_sequence_resumes_after_reopen() {
        let (storage, timeline) = timeline();
        timeline
            .record(TimelineEvent::system(TimelineAction::SnapshotCaptured, Outcome::Success))
            .unwrap();
        timeline
            .record(TimelineEvent::system(TimelineAction::SnapshotCaptured, Outcome::Success))
            .unwrap();

        let reopened = Timeline::open(storage).unwrap();
        let event = reopened
            .record(TimelineEvent::system(TimelineAction::SnapshotCompared, Outcome::Success))
            .unwrap();
        assert_eq!(event.sequence, 3);
    }

    #[test]
    fn test_clear_archives_history_and_leaves_trace() {
        let (storage, timeline) = timeline();
        timeline
            .record(TimelineEvent::artifact(
                TimelineAction::Quarantine,
                Category::LaunchItem,
                &agent(),
                Outcome::Success,
            ))
            .unwrap();

        let archive_key = timeline.clear().unwrap();

        let live = timeline.all().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].action, TimelineAction::LogCleared);
        assert!(live[0].detail.as_deref().unwrap().contains(&archive_key));

        let archived = String::from_utf8(storage.load(&archive_key).unwrap()).unwrap();
        let archived: Vec<TimelineEvent> = archived
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(archived.len(), 2);
        assert_eq!(archived[0].action, TimelineAction::Quarantine);
        assert_eq!(archived[1].action, TimelineAction::LogCleared);
        assert_eq!(timeline.archives().unwrap(), vec![archive_key]);
    }

    #[test]
    fn test_clear_on_empty_log() {
        let (_, timeline) = timeline();
        assert!(timeline.is_empty().unwrap());
        timeline.clear().unwrap();
        let live = timeline.all().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].sequence, 1);
    }

    #[test]
    fn test_malformed_line_surfaces_as_error() {
        let (storage, timeline) = timeline();
        timeline
            .record(TimelineEvent::system(TimelineAction::SnapshotCaptured, Outcome::Success))
            .unwrap();
        storage.append(b"{not json}\n", TIMELINE_KEY).unwrap();

        let results: Vec<_> = timeline.query(TimelineFilter::default()).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn test_action_parse() {
        assert_eq!(TimelineAction::parse("port-closed"), Some(TimelineAction::PortClosed));
        assert_eq!(TimelineAction::parse("Quarantine"), Some(TimelineAction::Quarantine));
        assert_eq!(TimelineAction::parse("bogus"), None);
    }
}
