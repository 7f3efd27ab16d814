/*!
macOS collectors and mutation primitives.

Everything here shells out to the stock system tools (`codesign`, `osascript`,
`lsof`, `kill`, `profiles`); the parsers are kept separate from the command
invocations so they can be tested on captured output.
*/

pub mod launch;
pub mod login;
pub mod ports;
pub mod profiles;

use std::io;
use std::process::{Command, Output};
use std::sync::Arc;
use tracing::debug;
use warden_core::{
    ArtifactCollector, Category, LaunchItemStrategy, LoginItemStrategy, PortStrategy,
    ProfileCollector, Strategies, WardenError,
};

pub use launch::LaunchDirCollector;
pub use login::OsascriptLoginItems;
pub use ports::LsofPorts;
pub use profiles::ProfilesCommand;

/// Run `program` and fail on a non-zero exit status
pub(crate) fn run(program: &str, args: &[&str]) -> io::Result<Output> {
    debug!("Running {} {:?}", program, args);
    let output = Command::new(program).args(args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let kind = if stderr.contains("not permitted") || stderr.contains("not allowed") {
            io::ErrorKind::PermissionDenied
        } else {
            io::ErrorKind::Other
        };
        return Err(io::Error::new(
            kind,
            format!("{program} exited with {}: {}", output.status, stderr.trim()),
        ));
    }
    Ok(output)
}

pub(crate) fn collector_failure(category: Category, err: io::Error) -> WardenError {
    WardenError::CollectorFailure {
        category,
        reason: err.to_string(),
    }
}

/// Strategies backed by the live system
pub fn strategies() -> Strategies {
    Strategies::new(
        LaunchItemStrategy::new(),
        LoginItemStrategy::new(OsascriptLoginItems),
        PortStrategy::new(LsofPorts),
    )
}

/// One collector per artifact category
pub fn collectors() -> Vec<Arc<dyn ArtifactCollector>> {
    vec![
        Arc::new(LaunchDirCollector::system()),
        Arc::new(OsascriptLoginItems),
        Arc::new(LsofPorts),
    ]
}

pub fn profile_collector() -> Arc<dyn ProfileCollector> {
    Arc::new(ProfilesCommand)
}
