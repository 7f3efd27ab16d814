/*!
Integration tests driving the `Warden` facade against a real state directory.

OS access is replaced by small in-process fakes: a launch directory inside a
temp dir, an in-memory login item registry and a port table.
*/

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};

use tempfile::TempDir;
use warden_core::model::attr;
use warden_core::observability::init_with_directive;
use warden_core::{
    ArtifactCollector, ArtifactDescriptor, Category, LaunchItemStrategy, LegalAction,
    LifecycleState, LoginItemRegistration, LoginItemRegistry, LoginItemStrategy, MatchSource,
    PortBinding, PortCloser, PortStrategy, Protocol, Strategies, TimelineAction, TimelineFilter,
    Warden, WardenConfig, WardenError,
};

static INIT: Once = Once::new();

fn init_test_observability() {
    INIT.call_once(|| {
        // Another test binary may already own the global subscriber
        let _ = init_with_directive(false, "warden=debug");
    });
}

/// Scans a directory of plists; every file is reported unsigned unless its
/// name contains "apple"
struct LaunchDirCollector {
    dir: PathBuf,
}

impl ArtifactCollector for LaunchDirCollector {
    fn category(&self) -> Category {
        Category::LaunchItem
    }

    fn collect(&self) -> warden_core::Result<Vec<ArtifactDescriptor>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "plist"))
            .collect();
        paths.sort();
        Ok(paths
            .into_iter()
            .map(|path| {
                let signed = path.to_string_lossy().contains("apple");
                ArtifactDescriptor::launch_item(&path).with_attribute(attr::SIGNED, signed)
            })
            .collect())
    }
}

#[derive(Clone, Default)]
struct SharedRegistry {
    items: Arc<Mutex<Vec<LoginItemRegistration>>>,
}

impl SharedRegistry {
    fn add(&self, name: &str, path: &str) {
        self.items.lock().unwrap().push(LoginItemRegistration {
            name: name.to_string(),
            path: Some(path.to_string()),
            kind: None,
            hidden: false,
        });
    }

    fn names(&self) -> Vec<String> {
        self.items.lock().unwrap().iter().map(|r| r.name.clone()).collect()
    }
}

impl LoginItemRegistry for SharedRegistry {
    fn unregister(&self, registration: &LoginItemRegistration) -> io::Result<()> {
        let mut items = self.items.lock().unwrap();
        let before = items.len();
        items.retain(|r| r.name != registration.name);
        if items.len() == before {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such login item"));
        }
        Ok(())
    }

    fn register(&self, registration: &LoginItemRegistration) -> io::Result<()> {
        self.items.lock().unwrap().push(registration.clone());
        Ok(())
    }
}

impl ArtifactCollector for SharedRegistry {
    fn category(&self) -> Category {
        Category::LoginItem
    }

    fn collect(&self) -> warden_core::Result<Vec<ArtifactDescriptor>> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .map(|r| ArtifactDescriptor::login_item(r.name.clone(), r.path.as_deref()))
            .collect())
    }
}

#[derive(Clone, Default)]
struct PortTable {
    open: Arc<Mutex<Vec<PortBinding>>>,
}

impl PortTable {
    fn listen(&self, port: u16, process: &str) {
        self.open.lock().unwrap().push(PortBinding {
            process: Some(process.to_string()),
            pid: Some(4242),
            ..PortBinding::new(port, Protocol::Tcp)
        });
    }
}

impl PortCloser for PortTable {
    fn close(&self, binding: &PortBinding) -> io::Result<()> {
        let mut open = self.open.lock().unwrap();
        let before = open.len();
        open.retain(|b| b.port != binding.port);
        if open.len() == before {
            return Err(io::Error::new(io::ErrorKind::NotFound, "port not listening"));
        }
        Ok(())
    }
}

impl ArtifactCollector for PortTable {
    fn category(&self) -> Category {
        Category::Port
    }

    fn collect(&self) -> warden_core::Result<Vec<ArtifactDescriptor>> {
        Ok(self.open.lock().unwrap().iter().map(ArtifactDescriptor::port).collect())
    }
}

struct Host {
    _state: TempDir,
    launch_dir: TempDir,
    registry: SharedRegistry,
    ports: PortTable,
    warden: Warden,
}

impl Host {
    fn new() -> Self {
        init_test_observability();
        let state = TempDir::new().unwrap();
        let launch_dir = TempDir::new().unwrap();
        let registry = SharedRegistry::default();
        let ports = PortTable::default();
        let warden = Self::open(state.path(), launch_dir.path(), &registry, &ports);
        Self {
            _state: state,
            launch_dir,
            registry,
            ports,
            warden,
        }
    }

    fn open(state: &Path, launch_dir: &Path, registry: &SharedRegistry, ports: &PortTable) -> Warden {
        let strategies = Strategies::new(
            LaunchItemStrategy::new(),
            LoginItemStrategy::new(registry.clone()),
            PortStrategy::new(ports.clone()),
        );
        Warden::open(WardenConfig::with_state_dir(state), strategies)
            .unwrap()
            .with_collector(Arc::new(LaunchDirCollector {
                dir: launch_dir.to_path_buf(),
            }))
            .with_collector(Arc::new(registry.clone()))
            .with_collector(Arc::new(ports.clone()))
    }

    fn reopen(self) -> Self {
        let warden = Self::open(self._state.path(), self.launch_dir.path(), &self.registry, &self.ports);
        Self { warden, ..self }
    }

    fn plist(&self, name: &str) -> PathBuf {
        let path = self.launch_dir.path().join(name);
        fs::write(&path, format!("<plist><dict><key>Label</key><string>{name}</string></dict></plist>")).unwrap();
        path
    }
}

#[test]
fn test_unsigned_agent_quarantine_and_restore() {
    let host = Host::new();
    let agent = host.plist("com.example.agent.plist");
    host.plist("com.apple.trustd.plist");
    let original = fs::read(&agent).unwrap();

    let before = host.warden.snapshots().capture().unwrap();
    let launch = before.entries(Category::LaunchItem).to_vec();
    assert_eq!(launch.len(), 2);

    let outcomes = host.warden.launch_items().quarantine_unsigned(&launch).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_success());
    assert!(!agent.exists());

    let record = host
        .warden
        .backups()
        .verify(&outcomes[0].identity, Category::LaunchItem)
        .unwrap();
    assert_eq!(record.artifact_state, LifecycleState::Quarantined);

    let after = host.warden.snapshots().capture().unwrap();
    let diff = host.warden.snapshots().compare(&before.id, &after.id).unwrap();
    let launch_diff = diff.category(Category::LaunchItem).unwrap();
    assert_eq!(launch_diff.removed.len(), 1);
    assert_eq!(launch_diff.removed[0].identity, outcomes[0].identity);

    host.warden.launch_items().restore(&outcomes[0].identity).unwrap();
    assert_eq!(fs::read(&agent).unwrap(), original);
    assert_eq!(
        host.warden.launch_items().state(&outcomes[0].identity).unwrap(),
        LifecycleState::Restored
    );

    let actions: Vec<TimelineAction> = host
        .warden
        .timeline()
        .query(TimelineFilter::new().category(Category::LaunchItem))
        .unwrap()
        .map(|e| e.unwrap().action)
        .collect();
    assert_eq!(actions, vec![TimelineAction::Quarantine, TimelineAction::Restore]);
}

#[test]
fn test_new_login_item_shows_up_in_diff() {
    let host = Host::new();
    host.registry.add("Dropbox", "/Applications/Dropbox.app");

    let s1 = host.warden.snapshots().capture().unwrap();
    host.registry.add("Updater", "/Users/me/Library/Updater.app");
    let s2 = host.warden.snapshots().capture().unwrap();

    let diff = host.warden.snapshots().compare(&s1.id, &s2.id).unwrap();
    let logins = diff.category(Category::LoginItem).unwrap();
    assert_eq!(logins.added.len(), 1);
    assert_eq!(logins.added[0].attribute_str(attr::NAME), Some("Updater"));
    assert!(logins.removed.is_empty());
    assert!(logins.modified.is_empty());

    let reverse = host.warden.snapshots().compare(&s2.id, &s1.id).unwrap();
    assert_eq!(reverse.category(Category::LoginItem).unwrap().removed, logins.added);

    let ids: Vec<String> = host
        .warden
        .snapshots()
        .list()
        .unwrap()
        .into_iter()
        .map(|m| m.snapshot_id)
        .collect();
    assert_eq!(ids, vec![s1.id.clone(), s2.id.clone()]);
}

#[test]
fn test_login_item_remove_and_restore_through_registry() {
    let host = Host::new();
    host.registry.add("Updater", "/Users/me/Library/Updater.app");
    let snapshot = host.warden.snapshots().collect().unwrap();
    let item = snapshot.entries(Category::LoginItem)[0].clone();

    assert_eq!(host.warden.login_items().remove(&item).unwrap(), LifecycleState::Removed);
    assert!(host.registry.names().is_empty());

    let restored = host.warden.login_items().restore(&item.identity).unwrap();
    assert_eq!(restored.identity, item.identity);
    assert_eq!(host.registry.names(), vec!["Updater".to_string()]);
}

#[test]
fn test_closed_port_cannot_be_restored() {
    let host = Host::new();
    host.ports.listen(8080, "node");
    let port = host.warden.snapshots().collect().unwrap().entries(Category::Port)[0].clone();

    assert_eq!(host.warden.ports().close(&port).unwrap(), LifecycleState::Closed);
    assert!(host.ports.open.lock().unwrap().is_empty());

    let err = host.warden.ports().restore(&port.identity).unwrap_err();
    assert!(matches!(
        err,
        WardenError::UnsupportedOperation {
            category: Category::Port,
            ..
        }
    ));
    assert_eq!(host.warden.ports().state(&port.identity).unwrap(), LifecycleState::Closed);

    // The backup remains searchable but only purge is offered
    let hits = host.warden.search("node").unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source, MatchSource::Backup(Category::Port));
    assert_eq!(hits[0].actions, vec![LegalAction::Purge]);
}

#[test]
fn test_search_spans_live_and_backed_up_artifacts() {
    let host = Host::new();
    let agent = host.plist("com.example.agent.plist");
    host.plist("com.example.helper.plist");

    host.warden
        .launch_items()
        .quarantine(&ArtifactDescriptor::launch_item(&agent))
        .unwrap();

    let hits = host.warden.search("COM.EXAMPLE").unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].source, MatchSource::Live(Category::LaunchItem));
    assert_eq!(hits[0].actions, vec![LegalAction::Quarantine, LegalAction::Backup]);
    assert_eq!(hits[1].source, MatchSource::Backup(Category::LaunchItem));
    assert_eq!(hits[1].state, Some(LifecycleState::Quarantined));
    assert_eq!(hits[1].actions, vec![LegalAction::Restore, LegalAction::Purge]);

    assert!(host.warden.search("").unwrap().is_empty());
}

#[test]
fn test_redropped_agent_offers_no_live_actions_while_quarantined() {
    let host = Host::new();
    let agent = host.plist("com.example.agent.plist");
    host.warden
        .launch_items()
        .quarantine(&ArtifactDescriptor::launch_item(&agent))
        .unwrap();
    host.plist("com.example.agent.plist");

    let hits = host.warden.search("com.example.agent").unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].source, MatchSource::Live(Category::LaunchItem));
    assert_eq!(hits[0].state, Some(LifecycleState::Quarantined));
    assert!(hits[0].actions.is_empty());
    assert_eq!(hits[1].actions, vec![LegalAction::Restore, LegalAction::Purge]);
}

#[test]
fn test_purge_all_goes_through_each_lifecycle() {
    let host = Host::new();
    let first = ArtifactDescriptor::launch_item(host.plist("com.example.one.plist"));
    let second = ArtifactDescriptor::launch_item(host.plist("com.example.two.plist"));
    host.warden.launch_items().quarantine(&first).unwrap();
    host.warden.launch_items().quarantine(&second).unwrap();
    host.registry.add("Updater", "/Users/me/Library/Updater.app");
    let item = host.warden.snapshots().collect().unwrap().entries(Category::LoginItem)[0].clone();
    host.warden.login_items().remove(&item).unwrap();

    let report = host.warden.purge_all(Some(Category::LaunchItem)).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.purged.len(), 2);
    assert_eq!(
        host.warden.launch_items().state(&first.identity).unwrap(),
        LifecycleState::Purged
    );
    assert_eq!(host.warden.backups().records(Some(Category::LoginItem)).unwrap().len(), 1);

    let report = host.warden.purge_all(None).unwrap();
    assert_eq!(report.purged, vec![item.identity.clone()]);
    assert_eq!(
        host.warden.login_items().state(&item.identity).unwrap(),
        LifecycleState::Purged
    );
    assert!(host.warden.backups().records(None).unwrap().is_empty());

    let purges = host
        .warden
        .timeline()
        .query(TimelineFilter::new().action(TimelineAction::Purge))
        .unwrap()
        .count();
    assert_eq!(purges, 3);
}

#[test]
fn test_state_and_timeline_survive_reopen() {
    let host = Host::new();
    let agent = host.plist("com.example.agent.plist");
    let descriptor = ArtifactDescriptor::launch_item(&agent);
    host.warden.launch_items().quarantine(&descriptor).unwrap();
    host.warden.snapshots().capture().unwrap();
    let events_before = host.warden.timeline().len().unwrap();

    let host = host.reopen();
    assert_eq!(
        host.warden.launch_items().state(&descriptor.identity).unwrap(),
        LifecycleState::Quarantined
    );
    assert_eq!(host.warden.snapshots().list().unwrap().len(), 1);

    host.warden.launch_items().restore(&descriptor.identity).unwrap();
    let events = host.warden.timeline().all().unwrap();
    assert_eq!(events.len(), events_before + 1);
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[test]
fn test_purge_then_clear_timeline() {
    let host = Host::new();
    let agent = host.plist("com.example.agent.plist");
    let descriptor = ArtifactDescriptor::launch_item(&agent);
    host.warden.launch_items().quarantine(&descriptor).unwrap();

    assert_eq!(
        host.warden.launch_items().purge(&descriptor.identity).unwrap(),
        LifecycleState::Purged
    );
    assert!(host
        .warden
        .backups()
        .latest(&descriptor.identity, Category::LaunchItem)
        .unwrap()
        .is_none());
    assert!(matches!(
        host.warden.launch_items().restore(&descriptor.identity),
        Err(WardenError::InvalidTransition { .. })
    ));

    let archive = host.warden.timeline().clear().unwrap();
    let events = host.warden.timeline().all().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, TimelineAction::LogCleared);
    assert!(events[0].detail.as_deref().unwrap().contains(&archive));
    assert_eq!(host.warden.timeline().archives().unwrap(), vec![archive]);
}

#[test]
fn test_failing_collector_leaves_other_categories_intact() {
    struct Broken;
    impl ArtifactCollector for Broken {
        fn category(&self) -> Category {
            Category::Port
        }
        fn collect(&self) -> warden_core::Result<Vec<ArtifactDescriptor>> {
            Err(WardenError::validation("lsof unavailable"))
        }
    }

    init_test_observability();
    let state = TempDir::new().unwrap();
    let registry = SharedRegistry::default();
    registry.add("Dropbox", "/Applications/Dropbox.app");
    let warden = Warden::open(
        WardenConfig::with_state_dir(state.path()),
        Strategies::new(
            LaunchItemStrategy::new(),
            LoginItemStrategy::new(registry.clone()),
            PortStrategy::new(PortTable::default()),
        ),
    )
    .unwrap()
    .with_collector(Arc::new(registry))
    .with_collector(Arc::new(Broken));

    let snapshot = warden.snapshots().capture().unwrap();
    assert!(!snapshot.is_complete());
    assert!(snapshot.failures.contains_key(&Category::Port));
    assert_eq!(snapshot.entries(Category::LoginItem).len(), 1);
}
