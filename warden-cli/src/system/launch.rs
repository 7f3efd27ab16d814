//! Launch agents and daemons, found by scanning the launchd directories.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};
use warden_core::model::attr;
use warden_core::{ArtifactCollector, ArtifactDescriptor, Category, Result};

use super::collector_failure;

/// File-name fragments that mark a plist as worth a closer look
pub const SUSPICIOUS_KEYWORDS: [&str; 8] = [
    "remote", "mdm", "backdoor", "rat", "suspicious", "hack", "keylog", "spy",
];

/// Attribute holding the first suspicious keyword found in the file name
pub const KEYWORD_ATTR: &str = "keyword";

pub struct LaunchDirCollector {
    dirs: Vec<PathBuf>,
}

impl LaunchDirCollector {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// The system-wide agent and daemon directories plus the user's agents
    pub fn system() -> Self {
        let mut dirs = vec![
            PathBuf::from("/Library/LaunchAgents"),
            PathBuf::from("/Library/LaunchDaemons"),
        ];
        if let Some(home) = std::env::var_os("HOME") {
            dirs.push(PathBuf::from(home).join("Library/LaunchAgents"));
        }
        Self::new(dirs)
    }

    fn describe(path: &Path) -> ArtifactDescriptor {
        let mut descriptor = ArtifactDescriptor::launch_item(path);
        if let Some(stem) = path.file_stem() {
            descriptor = descriptor.with_attribute(attr::LABEL, stem.to_string_lossy().into_owned());
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if let Some(keyword) = SUSPICIOUS_KEYWORDS.iter().find(|k| name.contains(*k)) {
            descriptor = descriptor.with_attribute(KEYWORD_ATTR, *keyword);
        }
        if let Some(writable) = world_writable(path) {
            descriptor = descriptor.with_attribute(attr::WORLD_WRITABLE, writable);
        }
        if let Some(signed) = code_signature(path) {
            descriptor = descriptor.with_attribute(attr::SIGNED, signed);
        }
        descriptor
    }
}

impl ArtifactCollector for LaunchDirCollector {
    fn category(&self) -> Category {
        Category::LaunchItem
    }

    fn collect(&self) -> Result<Vec<ArtifactDescriptor>> {
        let mut descriptors = Vec::new();
        for dir in &self.dirs {
            if !dir.is_dir() {
                debug!("Skipping missing launch directory {}", dir.display());
                continue;
            }
            let mut paths: Vec<PathBuf> = fs::read_dir(dir)
                .map_err(|e| collector_failure(Category::LaunchItem, e))?
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry.path()),
                    Err(e) => {
                        warn!("Unreadable entry in {}: {}", dir.display(), e);
                        None
                    }
                })
                .filter(|path| path.is_file())
                .collect();
            paths.sort();
            descriptors.extend(paths.iter().map(|path| Self::describe(path)));
        }
        Ok(descriptors)
    }
}

#[cfg(unix)]
fn world_writable(path: &Path) -> Option<bool> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o002 != 0)
}

#[cfg(not(unix))]
fn world_writable(_path: &Path) -> Option<bool> {
    None
}

/// `None` when `codesign` could not give an answer
fn code_signature(path: &Path) -> Option<bool> {
    let output = Command::new("codesign").arg("-dv").arg(path).output().ok()?;
    classify_signature(output.status.success(), &String::from_utf8_lossy(&output.stderr))
}

fn classify_signature(success: bool, stderr: &str) -> Option<bool> {
    if stderr.contains("code object is not signed") {
        Some(false)
    } else if success {
        Some(true)
    } else {
        None
    }
}
