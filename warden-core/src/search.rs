/*!
Keyword search across live artifacts, backups and configuration profiles.

Each match reports where it was found and which actions are currently legal
for it, so the operator can go straight from a hit to a transition.
*/

use crate::backup::BackupRecord;
use crate::model::{attr, ArtifactDescriptor, ArtifactIdentity, Category, LifecycleState};
use crate::profile::ProfileDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Where a match was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "category", rename_all = "snake_case")]
pub enum MatchSource {
    Live(Category),
    Backup(Category),
    Profile,
}

impl fmt::Display for MatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchSource::Live(category) => write!(f, "live {category}"),
            MatchSource::Backup(category) => write!(f, "backed-up {category}"),
            MatchSource::Profile => f.write_str("profile"),
        }
    }
}

/// Action the operator may take on a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegalAction {
    Quarantine,
    Remove,
    Close,
    Backup,
    Restore,
    Purge,
    /// Advisory only; profiles are outside the lifecycle
    ManualRemoval,
}

impl fmt::Display for LegalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LegalAction::Quarantine => "quarantine",
            LegalAction::Remove => "remove",
            LegalAction::Close => "close",
            LegalAction::Backup => "backup",
            LegalAction::Restore => "restore",
            LegalAction::Purge => "purge",
            LegalAction::ManualRemoval => "manual removal",
        };
        f.write_str(name)
    }
}

/// One search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub source: MatchSource,
    pub identity: String,
    /// Short human label (file name, login item name, process, profile name)
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,
    pub actions: Vec<LegalAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<String>,
}

/// In-memory keyword index
#[derive(Debug, Clone)]
pub struct SearchIndex {
    live: Vec<ArtifactDescriptor>,
    backups: Vec<BackupRecord>,
    profiles: Vec<ProfileDescriptor>,
    restorable: HashSet<Category>,
    /// Lifecycle state of live artifacts; unknown ones count as Active
    states: HashMap<(Category, ArtifactIdentity), LifecycleState>,
}

impl Default for SearchIndex {
    fn default() -> Self {
        Self {
            live: Vec::new(),
            backups: Vec::new(),
            profiles: Vec::new(),
            restorable: [Category::LaunchItem, Category::LoginItem].into_iter().collect(),
            states: HashMap::new(),
        }
    }
}

fn descriptor_text(descriptor: &ArtifactDescriptor) -> String {
    let mut text = descriptor.identity.as_str().to_string();
    for value in descriptor.attributes.values() {
        text.push(' ');
        match value {
            serde_json::Value::String(s) => text.push_str(s),
            other => text.push_str(&other.to_string()),
        }
    }
    text.to_lowercase()
}

fn label(descriptor: &ArtifactDescriptor) -> Option<String> {
    descriptor
        .attribute_str(attr::NAME)
        .or_else(|| descriptor.attribute_str(attr::LABEL))
        .or_else(|| descriptor.attribute_str(attr::PROCESS))
        .map(str::to_string)
}

/// Only an active artifact can be mutated or backed up
fn live_actions(category: Category, state: LifecycleState) -> Vec<LegalAction> {
    if !state.is_active() {
        return Vec::new();
    }
    let mutation = match category {
        Category::LaunchItem => LegalAction::Quarantine,
        Category::LoginItem => LegalAction::Remove,
        Category::Port => LegalAction::Close,
    };
    vec![mutation, LegalAction::Backup]
}

impl SearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_live<I: IntoIterator<Item = ArtifactDescriptor>>(mut self, descriptors: I) -> Self {
        self.live.extend(descriptors);
        self
    }

    pub fn with_backups<I: IntoIterator<Item = BackupRecord>>(mut self, records: I) -> Self {
        self.backups.extend(records);
        self
    }

    pub fn with_profiles<I: IntoIterator<Item = ProfileDescriptor>>(mut self, profiles: I) -> Self {
        self.profiles.extend(profiles);
        self
    }

    /// Record the lifecycle state of a live artifact
    pub fn with_state(mut self, category: Category, identity: ArtifactIdentity, state: LifecycleState) -> Self {
        self.states.insert((category, identity), state);
        self
    }

    /// Declare whether `category`'s mutation can be undone
    pub fn with_restorable(mut self, category: Category, restorable: bool) -> Self {
        if restorable {
            self.restorable.insert(category);
        } else {
            self.restorable.remove(&category);
        }
        self
    }

    fn backup_actions(&self, record: &BackupRecord) -> Vec<LegalAction> {
        let restorable = self.restorable.contains(&record.category);
        if record.artifact_state.is_held_in_backup() || (restorable && !record.artifact_state.is_terminal()) {
            vec![LegalAction::Restore, LegalAction::Purge]
        } else {
            vec![LegalAction::Purge]
        }
    }

    /// Case-insensitive substring search. An empty keyword matches nothing.
    pub fn search(&self, keyword: &str) -> Vec<SearchMatch> {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let mut matches = Vec::new();

        for descriptor in &self.live {
            if descriptor_text(descriptor).contains(&needle) {
                let state = self
                    .states
                    .get(&(descriptor.category, descriptor.identity.clone()))
                    .copied();
                matches.push(SearchMatch {
                    source: MatchSource::Live(descriptor.category),
                    identity: descriptor.identity.to_string(),
                    label: label(descriptor),
                    state,
                    actions: live_actions(descriptor.category, state.unwrap_or(LifecycleState::Active)),
                    advice: None,
                });
            }
        }

        // One hit per identity and category, from its latest record
        let mut latest: BTreeMap<(Category, &str), &BackupRecord> = BTreeMap::new();
        for record in &self.backups {
            let entry = latest
                .entry((record.category, record.artifact_identity.as_str()))
                .or_insert(record);
            if record.created_at >= entry.created_at {
                *entry = record;
            }
        }
        for record in latest.values() {
            let text = format!(
                "{} {}",
                descriptor_text(&record.descriptor),
                record.original_location.to_string().to_lowercase()
            );
            if text.contains(&needle) {
                matches.push(SearchMatch {
                    source: MatchSource::Backup(record.category),
                    identity: record.artifact_identity.to_string(),
                    label: label(&record.descriptor),
                    state: Some(record.artifact_state),
                    actions: self.backup_actions(record),
                    advice: None,
                });
            }
        }

        for profile in &self.profiles {
            if profile.search_text().to_lowercase().contains(&needle) {
                matches.push(SearchMatch {
                    source: MatchSource::Profile,
                    identity: profile.identifier.clone(),
                    label: profile.display_name.clone(),
                    state: None,
                    actions: vec![LegalAction::ManualRemoval],
                    advice: Some(profile.removal_advice()),
                });
            }
        }

        matches
    }
}
