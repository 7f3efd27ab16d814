/*!
Artifact descriptor model shared by every Warden subsystem.

An artifact is a managed OS object (launch agent/daemon, login item, or
listening port) tracked by a stable identity. Collectors hand the core ordered
lists of [`ArtifactDescriptor`]s; the core never queries the OS for them.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Category-specific attribute map. Ordered so equality and serialization are
/// deterministic.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Well-known attribute keys written by collectors.
pub mod attr {
    pub const SIGNED: &str = "signed";
    pub const LABEL: &str = "label";
    pub const PROGRAM: &str = "program";
    pub const WORLD_WRITABLE: &str = "world_writable";
    pub const NAME: &str = "name";
    pub const PATH: &str = "path";
    pub const KIND: &str = "kind";
    pub const HIDDEN: &str = "hidden";
    pub const PROCESS: &str = "process";
    pub const PID: &str = "pid";
    pub const ADDRESS: &str = "address";
    pub const PORT: &str = "port";
    pub const PROTOCOL: &str = "protocol";
}

/// The three managed artifact categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Launch agents and daemons (plist files)
    LaunchItem,
    /// Login items registered with the session
    LoginItem,
    /// Listening network ports
    Port,
}

impl Category {
    /// All categories in canonical order
    pub const ALL: [Category; 3] = [Category::LaunchItem, Category::LoginItem, Category::Port];

    /// Directory name used to partition persisted state
    pub fn storage_dir(&self) -> &'static str {
        match self {
            Category::LaunchItem => "launch_items",
            Category::LoginItem => "login_items",
            Category::Port => "ports",
        }
    }

    /// Verb for this category's mutating transition
    pub fn mutation_verb(&self) -> &'static str {
        match self {
            Category::LaunchItem => "quarantine",
            Category::LoginItem => "remove",
            Category::Port => "close",
        }
    }

    /// Parse the snake_case name used on the command line and on disk
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "launch_item" | "launch_items" | "launch" => Some(Category::LaunchItem),
            "login_item" | "login_items" | "login" => Some(Category::LoginItem),
            "port" | "ports" => Some(Category::Port),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::LaunchItem => "launch item",
            Category::LoginItem => "login item",
            Category::Port => "port",
        };
        f.write_str(name)
    }
}

/// Transport protocol of a listening port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable key of an artifact across snapshots
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactIdentity(String);

impl ArtifactIdentity {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    /// Identity of a file-backed artifact
    pub fn for_path<P: AsRef<Path>>(path: P) -> Self {
        Self(path.as_ref().to_string_lossy().into_owned())
    }

    /// Identity of a listening port: `<port>/<protocol>`
    pub fn for_port(port: u16, protocol: Protocol) -> Self {
        Self(format!("{port}/{protocol}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe key used to partition persisted backups
    pub fn storage_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }
}

impl fmt::Display for ArtifactIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One managed object as observed by a collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub category: Category,
    pub identity: ArtifactIdentity,
    #[serde(default)]
    pub attributes: Attributes,
    pub observed_at: DateTime<Utc>,
}

impl ArtifactDescriptor {
    pub fn new(category: Category, identity: ArtifactIdentity) -> Self {
        Self {
            category,
            identity,
            attributes: Attributes::new(),
            observed_at: Utc::now(),
        }
    }

    /// Descriptor for a launch agent/daemon plist at `path`
    pub fn launch_item<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let mut descriptor = Self::new(Category::LaunchItem, ArtifactIdentity::for_path(path));
        if let Some(name) = path.file_name() {
            descriptor
                .attributes
                .insert(attr::NAME.to_string(), name.to_string_lossy().into_owned().into());
        }
        descriptor
    }

    /// Descriptor for a login item; the path is its identity when known
    pub fn login_item<S: Into<String>>(name: S, path: Option<&str>) -> Self {
        let name = name.into();
        let identity = match path {
            Some(path) => ArtifactIdentity::for_path(path),
            None => ArtifactIdentity::new(format!("login-item:{name}")),
        };
        let mut descriptor = Self::new(Category::LoginItem, identity);
        descriptor
            .attributes
            .insert(attr::NAME.to_string(), name.into());
        if let Some(path) = path {
            descriptor
                .attributes
                .insert(attr::PATH.to_string(), path.into());
        }
        descriptor
    }

    /// Descriptor for a listening port
    pub fn port(binding: &PortBinding) -> Self {
        let mut descriptor = Self::new(Category::Port, binding.identity());
        descriptor.attributes = binding.to_attributes();
        descriptor
    }

    /// Set an attribute
    pub fn with_attribute<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Override the observation time
    pub fn with_observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    /// Signature classification supplied by the collector, if any
    pub fn is_signed(&self) -> Option<bool> {
        self.attributes.get(attr::SIGNED).and_then(|v| v.as_bool())
    }

    /// File path of a file-backed artifact
    pub fn path(&self) -> Option<PathBuf> {
        match self.category {
            Category::LaunchItem => Some(PathBuf::from(self.identity.as_str())),
            Category::LoginItem => self.attribute_str(attr::PATH).map(PathBuf::from),
            Category::Port => None,
        }
    }
}

/// Lifecycle state of a managed artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    /// Launch items only
    Quarantined,
    /// Login items only
    Removed,
    /// Ports only; terminal
    Closed,
    /// Backup deleted; terminal
    Purged,
    /// Equivalent to Active, reached via restore
    Restored,
}

impl LifecycleState {
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Active | LifecycleState::Restored)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Closed | LifecycleState::Purged)
    }

    /// States in which the artifact exists only as a backup
    pub fn is_held_in_backup(&self) -> bool {
        matches!(self, LifecycleState::Quarantined | LifecycleState::Removed)
    }

    /// State reached by `category`'s mutating transition
    pub fn after_mutation(category: Category) -> Self {
        match category {
            Category::LaunchItem => LifecycleState::Quarantined,
            Category::LoginItem => LifecycleState::Removed,
            Category::Port => LifecycleState::Closed,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Active => "active",
            LifecycleState::Quarantined => "quarantined",
            LifecycleState::Removed => "removed",
            LifecycleState::Closed => "closed",
            LifecycleState::Purged => "purged",
            LifecycleState::Restored => "restored",
        };
        f.write_str(name)
    }
}

/// Structured descriptor of a listening socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub port: u16,
    pub protocol: Protocol,
    pub address: Option<String>,
    pub process: Option<String>,
    pub pid: Option<u32>,
}

impl PortBinding {
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self {
            port,
            protocol,
            address: None,
            process: None,
            pid: None,
        }
    }

    pub fn identity(&self) -> ArtifactIdentity {
        ArtifactIdentity::for_port(self.port, self.protocol)
    }

    pub fn to_attributes(&self) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert(attr::PORT.to_string(), self.port.into());
        attributes.insert(attr::PROTOCOL.to_string(), self.protocol.as_str().into());
        if let Some(address) = &self.address {
            attributes.insert(attr::ADDRESS.to_string(), address.clone().into());
        }
        if let Some(process) = &self.process {
            attributes.insert(attr::PROCESS.to_string(), process.clone().into());
        }
        if let Some(pid) = self.pid {
            attributes.insert(attr::PID.to_string(), pid.into());
        }
        attributes
    }

    /// Rebuild a binding from a port descriptor's attributes
    pub fn from_descriptor(descriptor: &ArtifactDescriptor) -> Option<Self> {
        if descriptor.category != Category::Port {
            return None;
        }
        let port = descriptor.attribute(attr::PORT)?.as_u64()?;
        let protocol = match descriptor.attribute_str(attr::PROTOCOL) {
            Some("udp") => Protocol::Udp,
            _ => Protocol::Tcp,
        };
        Some(Self {
            port: u16::try_from(port).ok()?,
            protocol,
            address: descriptor.attribute_str(attr::ADDRESS).map(str::to_string),
            process: descriptor.attribute_str(attr::PROCESS).map(str::to_string),
            pid: descriptor
                .attribute(attr::PID)
                .and_then(|v| v.as_u64())
                .and_then(|pid| u32::try_from(pid).ok()),
        })
    }
}

/// What a login-item registration needs in order to be re-created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginItemRegistration {
    pub name: String,
    pub path: Option<String>,
    pub kind: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

impl LoginItemRegistration {
    pub fn from_descriptor(descriptor: &ArtifactDescriptor) -> Option<Self> {
        if descriptor.category != Category::LoginItem {
            return None;
        }
        Some(Self {
            name: descriptor.attribute_str(attr::NAME)?.to_string(),
            path: descriptor.attribute_str(attr::PATH).map(str::to_string),
            kind: descriptor.attribute_str(attr::KIND).map(str::to_string),
            hidden: descriptor
                .attribute(attr::HIDDEN)
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }
}

/// Where an artifact lived before it was backed up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OriginalLocation {
    /// Absolute path of a file-backed artifact
    Path { path: PathBuf },
    /// Login-item registration
    LoginItem { registration: LoginItemRegistration },
    /// Listening socket and owning process
    Port { binding: PortBinding },
}

impl fmt::Display for OriginalLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OriginalLocation::Path { path } => write!(f, "{}", path.display()),
            OriginalLocation::LoginItem { registration } => match &registration.path {
                Some(path) => write!(f, "login item {} ({path})", registration.name),
                None => write!(f, "login item {}", registration.name),
            },
            OriginalLocation::Port { binding } => {
                write!(f, "{}/{}", binding.port, binding.protocol)?;
                if let Some(process) = &binding.process {
                    write!(f, " ({process})")?;
                }
                Ok(())
            }
        }
    }
}
