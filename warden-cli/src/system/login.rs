//! Login items through System Events, via `osascript`.

use std::io;
use tracing::warn;
use warden_core::{
    ArtifactCollector, ArtifactDescriptor, Category, LoginItemRegistration, LoginItemRegistry,
    Result,
};

use super::{collector_failure, run};

#[derive(Debug, Clone, Copy, Default)]
pub struct OsascriptLoginItems;

fn system_events(script: &str) -> io::Result<String> {
    let script = format!("tell application \"System Events\" to {script}");
    let output = run("osascript", &["-e", &script])?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Split an AppleScript list as printed by `osascript`
fn parse_list(output: &str) -> Vec<String> {
    output
        .split(", ")
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pair names with paths; paths are dropped when the lists disagree in length
fn pair(names: Vec<String>, paths: Vec<String>) -> Vec<(String, Option<String>)> {
    if paths.len() != names.len() {
        if !paths.is_empty() {
            warn!(
                "osascript returned {} names but {} paths; ignoring paths",
                names.len(),
                paths.len()
            );
        }
        return names.into_iter().map(|name| (name, None)).collect();
    }
    names
        .into_iter()
        .zip(paths)
        .map(|(name, path)| {
            let path = (path != "missing value").then_some(path);
            (name, path)
        })
        .collect()
}

impl LoginItemRegistry for OsascriptLoginItems {
    fn unregister(&self, registration: &LoginItemRegistration) -> io::Result<()> {
        system_events(&format!("delete login item {}", quote(&registration.name))).map(|_| ())
    }

    fn register(&self, registration: &LoginItemRegistration) -> io::Result<()> {
        let path = registration.path.as_deref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("login item {} has no path to register", registration.name),
            )
        })?;
        system_events(&format!(
            "make login item at end with properties {{path:{}, hidden:{}}}",
            quote(path),
            registration.hidden
        ))
        .map(|_| ())
    }
}

impl ArtifactCollector for OsascriptLoginItems {
    fn category(&self) -> Category {
        Category::LoginItem
    }

    fn collect(&self) -> Result<Vec<ArtifactDescriptor>> {
        let names = system_events("get the name of every login item")
            .map_err(|e| collector_failure(Category::LoginItem, e))?;
        let paths = system_events("get the path of every login item").unwrap_or_else(|e| {
            warn!("Could not read login item paths: {}", e);
            String::new()
        });
        Ok(pair(parse_list(&names), parse_list(&paths))
            .into_iter()
            .map(|(name, path)| ArtifactDescriptor::login_item(name, path.as_deref()))
            .collect())
    }
}
