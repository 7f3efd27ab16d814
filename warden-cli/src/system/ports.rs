//! Listening sockets via `lsof`; closing one terminates its owning process.

use std::collections::HashSet;
use std::io;
use std::process::Command;
use warden_core::{
    ArtifactCollector, ArtifactDescriptor, Category, PortBinding, PortCloser, Protocol, Result,
};

use super::{collector_failure, run};

#[derive(Debug, Clone, Copy, Default)]
pub struct LsofPorts;

/// `lsof` exits 1 when nothing matches; that is an empty result, not an error
fn lsof(args: &[&str]) -> io::Result<String> {
    let output = Command::new("lsof").args(args).output()?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() || (output.status.code() == Some(1) && output.stderr.is_empty()) {
        return Ok(stdout);
    }
    Err(io::Error::new(
        io::ErrorKind::Other,
        format!(
            "lsof exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    ))
}

/// Parse `lsof -nP` output into bindings, first socket per port and protocol
pub fn parse_lsof(output: &str) -> Vec<PortBinding> {
    let mut seen = HashSet::new();
    let mut bindings = Vec::new();

    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 || parts[0] == "COMMAND" {
            continue;
        }
        let protocol = match parts[7] {
            "TCP" => Protocol::Tcp,
            "UDP" => Protocol::Udp,
            _ => continue,
        };
        let name = parts[8];
        // Connected sockets are not listeners
        if name.contains("->") {
            continue;
        }
        if protocol == Protocol::Tcp && !line.contains("(LISTEN)") {
            continue;
        }
        let Some((address, port)) = name.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };
        if !seen.insert((port, protocol)) {
            continue;
        }
        bindings.push(PortBinding {
            address: Some(address.to_string()),
            process: Some(parts[0].to_string()),
            pid: parts[1].parse().ok(),
            ..PortBinding::new(port, protocol)
        });
    }
    bindings
}

impl PortCloser for LsofPorts {
    fn close(&self, binding: &PortBinding) -> io::Result<()> {
        let pid = binding.pid.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no owning process recorded for {}", binding.identity()),
            )
        })?;
        run("kill", &["-TERM", &pid.to_string()]).map(|_| ())
    }
}

impl ArtifactCollector for LsofPorts {
    fn category(&self) -> Category {
        Category::Port
    }

    fn collect(&self) -> Result<Vec<ArtifactDescriptor>> {
        let tcp = lsof(&["-nP", "-iTCP", "-sTCP:LISTEN"])
            .map_err(|e| collector_failure(Category::Port, e))?;
        let udp = lsof(&["-nP", "-iUDP"]).map_err(|e| collector_failure(Category::Port, e))?;
        Ok(parse_lsof(&format!("{tcp}\n{udp}"))
            .iter()
            .map(ArtifactDescriptor::port)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
COMMAND     PID USER   FD   TYPE             DEVICE SIZE/OFF NODE NAME
rapportd    512 me      4u  IPv4 0x1a2b3c4d5e6f7a8b      0t0  TCP *:49152 (LISTEN)
rapportd    512 me      5u  IPv6 0x1a2b3c4d5e6f7a8c      0t0  TCP *:49152 (LISTEN)
node       4242 me     23u  IPv4 0x1a2b3c4d5e6f7a8d      0t0  TCP 127.0.0.1:8080 (LISTEN)
Safari      900 me     30u  IPv4 0x1a2b3c4d5e6f7a8e      0t0  TCP 10.0.0.2:50000->17.0.0.1:443 (ESTABLISHED)
mDNSRespo   300 _mdns  7u  IPv4 0x1a2b3c4d5e6f7a8f      0t0  UDP *:5353
";

    #[test]
    fn test_parse_lsof_listeners() {
        let bindings = parse_lsof(OUTPUT);
        let ids: Vec<String> = bindings.iter().map(|b| b.identity().to_string()).collect();
        assert_eq!(ids, vec!["49152/tcp", "8080/tcp", "5353/udp"]);

        assert_eq!(bindings[1].process.as_deref(), Some("node"));
        assert_eq!(bindings[1].pid, Some(4242));
        assert_eq!(bindings[1].address.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_parse_lsof_ignores_garbage() {
        assert!(parse_lsof("").is_empty());
        assert!(parse_lsof("lsof: WARNING: can't stat() fuse file system").is_empty());
    }

    #[test]
    fn test_close_requires_pid() {
        let err = LsofPorts.close(&PortBinding::new(8080, Protocol::Tcp)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
