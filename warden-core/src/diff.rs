/*!
Snapshot comparison.

[`compare`] is pure: it classifies every artifact of two snapshots as added,
removed or modified by identity, per category. Attribute maps are compared
structurally; the observation timestamp is not part of the comparison.
*/

use crate::model::{ArtifactDescriptor, ArtifactIdentity, Attributes, Category};
use crate::profile::ProfileDescriptor;
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// An artifact present in both snapshots with different attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifiedArtifact {
    pub identity: ArtifactIdentity,
    pub before: Attributes,
    pub after: Attributes,
}

impl ModifiedArtifact {
    /// Attribute keys that were added, removed or changed
    pub fn changed_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .before
            .keys()
            .chain(self.after.keys())
            .map(String::as_str)
            .filter(|k| self.before.get(*k) != self.after.get(*k))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }
}

/// Changes within one category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryDiff {
    /// In the later snapshot only, in its order
    pub added: Vec<ArtifactDescriptor>,
    /// In the earlier snapshot only, in its order
    pub removed: Vec<ArtifactDescriptor>,
    /// In both with different attributes, in the later snapshot's order
    pub modified: Vec<ModifiedArtifact>,
}

impl CategoryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Configuration profiles that appeared or disappeared, by identifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDiff {
    pub added: Vec<ProfileDescriptor>,
    pub removed: Vec<ProfileDescriptor>,
}

impl ProfileDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Change counts for one category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub category: Category,
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}

impl fmt::Display for CategorySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: +{} -{} ~{}",
            self.category, self.added, self.removed, self.modified
        )
    }
}

/// Result of comparing an earlier snapshot with a later one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub from_id: String,
    pub to_id: String,
    pub categories: BTreeMap<Category, CategoryDiff>,
    #[serde(default)]
    pub profiles: ProfileDiff,
    /// Categories whose collector failed in either snapshot; their changes
    /// may reflect the failure rather than the system
    #[serde(default)]
    pub incomplete: Vec<Category>,
}

impl DiffResult {
    pub fn category(&self, category: Category) -> Option<&CategoryDiff> {
        self.categories.get(&category)
    }

    pub fn is_empty(&self) -> bool {
        self.categories.values().all(CategoryDiff::is_empty) && self.profiles.is_empty()
    }

    pub fn summary(&self) -> Vec<CategorySummary> {
        self.categories
            .iter()
            .map(|(category, diff)| CategorySummary {
                category: *category,
                added: diff.added.len(),
                removed: diff.removed.len(),
                modified: diff.modified.len(),
            })
            .collect()
    }
}

fn diff_category(before: &[ArtifactDescriptor], after: &[ArtifactDescriptor]) -> CategoryDiff {
    let earlier: HashMap<&ArtifactIdentity, &ArtifactDescriptor> =
        before.iter().map(|d| (&d.identity, d)).collect();
    let later: HashSet<&ArtifactIdentity> = after.iter().map(|d| &d.identity).collect();

    let mut diff = CategoryDiff::default();
    for descriptor in after {
        match earlier.get(&descriptor.identity) {
            None => diff.added.push(descriptor.clone()),
            Some(previous) if previous.attributes != descriptor.attributes => {
                diff.modified.push(ModifiedArtifact {
                    identity: descriptor.identity.clone(),
                    before: previous.attributes.clone(),
                    after: descriptor.attributes.clone(),
                })
            }
            Some(_) => {}
        }
    }
    diff.removed = before
        .iter()
        .filter(|d| !later.contains(&d.identity))
        .cloned()
        .collect();
    diff
}

fn diff_profiles(before: &[ProfileDescriptor], after: &[ProfileDescriptor]) -> ProfileDiff {
    let earlier: HashSet<&str> = before.iter().map(|p| p.identifier.as_str()).collect();
    let later: HashSet<&str> = after.iter().map(|p| p.identifier.as_str()).collect();
    ProfileDiff {
        added: after
            .iter()
            .filter(|p| !earlier.contains(p.identifier.as_str()))
            .cloned()
            .collect(),
        removed: before
            .iter()
            .filter(|p| !later.contains(p.identifier.as_str()))
            .cloned()
            .collect(),
    }
}

/// Compare snapshot `a` (earlier) with snapshot `b` (later)
pub fn compare(a: &Snapshot, b: &Snapshot) -> DiffResult {
    let categories = Category::ALL
        .iter()
        .map(|category| {
            (
                *category,
                diff_category(a.entries(*category), b.entries(*category)),
            )
        })
        .collect();

    let incomplete = Category::ALL
        .iter()
        .copied()
        .filter(|c| a.failures.contains_key(c) || b.failures.contains_key(c))
        .collect();

    DiffResult {
        from_id: a.id.clone(),
        to_id: b.id.clone(),
        categories,
        profiles: diff_profiles(&a.profiles, &b.profiles),
        incomplete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{attr, PortBinding, Protocol};
    use chrono::Utc;

    fn snapshot(id: &str, descriptors: Vec<ArtifactDescriptor>) -> Snapshot {
        Snapshot::from_descriptors(id, Utc::now(), descriptors)
    }

    fn login(name: &str) -> ArtifactDescriptor {
        ArtifactDescriptor::login_item(name, Some(&format!("/Applications/{name}.app")))
    }

    #[test]
    fn test_compare_same_snapshot_is_empty() {
        let s = snapshot(
            "s",
            vec![
                login("X"),
                ArtifactDescriptor::launch_item("/Library/LaunchAgents/a.plist"),
            ],
        );
        let diff = compare(&s, &s);
        assert!(diff.is_empty());
        assert_eq!(diff.categories.len(), 3);
    }

    #[test]
    fn test_added_login_item() {
        let s1 = snapshot("s1", vec![login("X")]);
        let s2 = snapshot("s2", vec![login("X"), login("Y")]);

        let diff = compare(&s1, &s2);
        let logins = diff.category(Category::LoginItem).unwrap();
        assert_eq!(logins.added.len(), 1);
        assert_eq!(logins.added[0].identity.as_str(), "/Applications/Y.app");
        assert!(logins.removed.is_empty());
        assert!(logins.modified.is_empty());
        assert!(diff.category(Category::LaunchItem).unwrap().is_empty());
        assert!(diff.category(Category::Port).unwrap().is_empty());
    }

    #[test]
    fn test_observation_time_is_ignored() {
        let earlier = login("X").with_observed_at(Utc::now() - chrono::Duration::days(1));
        let s1 = snapshot("s1", vec![earlier]);
        let s2 = snapshot("s2", vec![login("X")]);
        assert!(compare(&s1, &s2).is_empty());
    }

    #[test]
    fn test_modified_reports_changed_keys() {
        let agent = ArtifactDescriptor::launch_item("/Library/LaunchAgents/a.plist");
        let s1 = snapshot("s1", vec![agent.clone().with_attribute(attr::SIGNED, true)]);
        let s2 = snapshot(
            "s2",
            vec![agent
                .with_attribute(attr::SIGNED, false)
                .with_attribute(attr::PROGRAM, "/tmp/payload")],
        );

        let diff = compare(&s1, &s2);
        let modified = &diff.category(Category::LaunchItem).unwrap().modified;
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].changed_keys(), vec![attr::PROGRAM, attr::SIGNED]);
    }

    #[test]
    fn test_compare_is_antisymmetric() {
        let p1 = ArtifactDescriptor::port(&PortBinding::new(22, Protocol::Tcp));
        let p2 = ArtifactDescriptor::port(&PortBinding::new(8080, Protocol::Tcp));
        let p3 = ArtifactDescriptor::port(&PortBinding::new(5353, Protocol::Udp));
        let changed = ArtifactDescriptor::port(&PortBinding {
            process: Some("sshd".to_string()),
            ..PortBinding::new(22, Protocol::Tcp)
        });

        let a = snapshot("a", vec![p1, p2.clone()]);
        let b = snapshot("b", vec![changed, p3.clone()]);

        let forward = compare(&a, &b);
        let backward = compare(&b, &a);
        let fwd = forward.category(Category::Port).unwrap();
        let bwd = backward.category(Category::Port).unwrap();

        assert_eq!(fwd.added, bwd.removed);
        assert_eq!(fwd.removed, bwd.added);
        assert_eq!(fwd.added, vec![p3]);
        assert_eq!(fwd.removed, vec![p2]);

        let ids = |d: &CategoryDiff| d.modified.iter().map(|m| m.identity.clone()).collect::<Vec<_>>();
        assert_eq!(ids(fwd), ids(bwd));
        assert_eq!(fwd.modified[0].before, bwd.modified[0].after);
    }

    #[test]
    fn test_ordering_follows_snapshots() {
        let a = snapshot("a", vec![login("A"), login("B"), login("C")]);
        let b = snapshot("b", vec![login("E"), login("D")]);

        let diff = compare(&a, &b);
        let logins = diff.category(Category::LoginItem).unwrap();
        let names = |v: &[ArtifactDescriptor]| {
            v.iter()
                .map(|d| d.attribute_str(attr::NAME).unwrap().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&logins.added), vec!["E", "D"]);
        assert_eq!(names(&logins.removed), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_summary_counts() {
        let s1 = snapshot("s1", vec![]);
        let s2 = snapshot("s2", vec![login("X")]);
        let summary = compare(&s1, &s2).summary();
        let logins = summary
            .iter()
            .find(|s| s.category == Category::LoginItem)
            .unwrap();
        assert_eq!(logins.added, 1);
        assert_eq!(logins.to_string(), "login item: +1 -0 ~0");
    }
}
