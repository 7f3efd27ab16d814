/*!
Per-category lifecycle strategies.

The [`Lifecycle`](crate::lifecycle::Lifecycle) owns the backup-before-mutate
invariant; a strategy only knows how to capture, mutate and reinstate one
category of artifact. The OS primitives behind login items and ports are
injected through [`LoginItemRegistry`] and [`PortCloser`].
*/

use crate::backup::{BackupRecord, CapturedState};
use crate::model::{
    ArtifactDescriptor, Category, LoginItemRegistration, OriginalLocation, PortBinding,
};
use crate::{Result, WardenError};
use std::fs;
use std::io;
use tracing::debug;

/// Category-specific half of a lifecycle
pub trait ArtifactStrategy: Send + Sync {
    fn category(&self) -> Category;

    /// Read the artifact's current representation for backup
    fn capture_state(&self, descriptor: &ArtifactDescriptor) -> Result<CapturedState>;

    /// Apply the category's mutating transition. Only called once `record` is
    /// durable.
    fn mutate(&self, descriptor: &ArtifactDescriptor, record: &BackupRecord) -> Result<()>;

    /// Write a verified backup payload back to its original location
    fn reinstate(&self, record: &BackupRecord, payload: &[u8]) -> Result<()>;

    /// Whether the mutating transition can be undone
    fn restorable(&self) -> bool {
        true
    }
}

impl<S: ArtifactStrategy + ?Sized> ArtifactStrategy for Box<S> {
    fn category(&self) -> Category {
        (**self).category()
    }

    fn capture_state(&self, descriptor: &ArtifactDescriptor) -> Result<CapturedState> {
        (**self).capture_state(descriptor)
    }

    fn mutate(&self, descriptor: &ArtifactDescriptor, record: &BackupRecord) -> Result<()> {
        (**self).mutate(descriptor, record)
    }

    fn reinstate(&self, record: &BackupRecord, payload: &[u8]) -> Result<()> {
        (**self).reinstate(record, payload)
    }

    fn restorable(&self) -> bool {
        (**self).restorable()
    }
}

fn capture_failure(descriptor: &ArtifactDescriptor, err: io::Error) -> WardenError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        WardenError::PermissionDenied {
            identity: descriptor.identity.clone(),
            action: "back up",
            reason: err.to_string(),
        }
    } else {
        WardenError::backup_failure(&descriptor.identity, err.to_string())
    }
}

/// Launch agents and daemons: the payload is the plist file itself
#[derive(Debug, Clone, Default)]
pub struct LaunchItemStrategy;

impl LaunchItemStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl ArtifactStrategy for LaunchItemStrategy {
    fn category(&self) -> Category {
        Category::LaunchItem
    }

    fn capture_state(&self, descriptor: &ArtifactDescriptor) -> Result<CapturedState> {
        let path = descriptor.path().ok_or_else(|| {
            WardenError::backup_failure(&descriptor.identity, "descriptor has no file path")
        })?;
        let payload = fs::read(&path).map_err(|e| capture_failure(descriptor, e))?;
        Ok(CapturedState {
            location: OriginalLocation::Path { path },
            payload,
        })
    }

    fn mutate(&self, descriptor: &ArtifactDescriptor, record: &BackupRecord) -> Result<()> {
        let OriginalLocation::Path { path } = &record.original_location else {
            return Err(WardenError::invalid_format(format!(
                "backup of {} has no file location",
                descriptor.identity
            )));
        };
        fs::remove_file(path).map_err(|e| WardenError::from_io(&descriptor.identity, "quarantine", e))?;
        debug!("Removed {} after backup {}", path.display(), record.backup_id);
        Ok(())
    }

    fn reinstate(&self, record: &BackupRecord, payload: &[u8]) -> Result<()> {
        let identity = &record.artifact_identity;
        let OriginalLocation::Path { path } = &record.original_location else {
            return Err(WardenError::invalid_format(format!(
                "backup of {identity} has no file location"
            )));
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| WardenError::from_io(identity, "restore", e))?;
        }
        fs::write(path, payload).map_err(|e| WardenError::from_io(identity, "restore", e))
    }
}

/// Session login-item registration primitives
#[cfg_attr(test, mockall::automock)]
pub trait LoginItemRegistry: Send + Sync {
    fn unregister(&self, registration: &LoginItemRegistration) -> io::Result<()>;
    fn register(&self, registration: &LoginItemRegistration) -> io::Result<()>;
}

/// Login items: the payload is the serialized registration
#[derive(Debug)]
pub struct LoginItemStrategy<R> {
    registry: R,
}

impl<R: LoginItemRegistry> LoginItemStrategy<R> {
    pub fn new(registry: R) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }
}

impl<R: LoginItemRegistry> ArtifactStrategy for LoginItemStrategy<R> {
    fn category(&self) -> Category {
        Category::LoginItem
    }

    fn capture_state(&self, descriptor: &ArtifactDescriptor) -> Result<CapturedState> {
        let registration = LoginItemRegistration::from_descriptor(descriptor).ok_or_else(|| {
            WardenError::backup_failure(&descriptor.identity, "descriptor has no login item name")
        })?;
        let payload = serde_json::to_vec(&registration)
            .map_err(|e| WardenError::backup_failure(&descriptor.identity, e.to_string()))?;
        Ok(CapturedState {
            location: OriginalLocation::LoginItem { registration },
            payload,
        })
    }

    fn mutate(&self, descriptor: &ArtifactDescriptor, record: &BackupRecord) -> Result<()> {
        let OriginalLocation::LoginItem { registration } = &record.original_location else {
            return Err(WardenError::invalid_format(format!(
                "backup of {} has no login item registration",
                descriptor.identity
            )));
        };
        self.registry
            .unregister(registration)
            .map_err(|e| WardenError::from_io(&descriptor.identity, "remove", e))
    }

    fn reinstate(&self, record: &BackupRecord, payload: &[u8]) -> Result<()> {
        let registration: LoginItemRegistration = serde_json::from_slice(payload)?;
        self.registry
            .register(&registration)
            .map_err(|e| WardenError::from_io(&record.artifact_identity, "restore", e))
    }
}

/// Terminates whatever is listening on a port
#[cfg_attr(test, mockall::automock)]
pub trait PortCloser: Send + Sync {
    fn close(&self, binding: &PortBinding) -> io::Result<()>;
}

/// Listening ports: the payload is the serialized binding. Not restorable.
#[derive(Debug)]
pub struct PortStrategy<P> {
    closer: P,
}

impl<P: PortCloser> PortStrategy<P> {
    pub fn new(closer: P) -> Self {
        Self { closer }
    }
}

impl<P: PortCloser> ArtifactStrategy for PortStrategy<P> {
    fn category(&self) -> Category {
        Category::Port
    }

    fn capture_state(&self, descriptor: &ArtifactDescriptor) -> Result<CapturedState> {
        let binding = PortBinding::from_descriptor(descriptor).ok_or_else(|| {
            WardenError::backup_failure(&descriptor.identity, "descriptor has no port number")
        })?;
        let payload = serde_json::to_vec(&binding)
            .map_err(|e| WardenError::backup_failure(&descriptor.identity, e.to_string()))?;
        Ok(CapturedState {
            location: OriginalLocation::Port { binding },
            payload,
        })
    }

    fn mutate(&self, descriptor: &ArtifactDescriptor, record: &BackupRecord) -> Result<()> {
        let OriginalLocation::Port { binding } = &record.original_location else {
            return Err(WardenError::invalid_format(format!(
                "backup of {} has no port binding",
                descriptor.identity
            )));
        };
        self.closer
            .close(binding)
            .map_err(|e| WardenError::from_io(&descriptor.identity, "close", e))
    }

    fn reinstate(&self, _record: &BackupRecord, _payload: &[u8]) -> Result<()> {
        Err(WardenError::UnsupportedOperation {
            category: Category::Port,
            action: "restore",
        })
    }

    fn restorable(&self) -> bool {
        false
    }
}
