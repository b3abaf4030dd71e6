//! SSH configuration entries for remote mode.
//!
//! When remote mode is enabled the dev container runs an SSH server
//! reachable through the forwarded remote port. A host block is added to
//! `~/.ssh/config` so `ssh <name>.okteto` (and editors building on it)
//! just work, and removed again on shutdown.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Result;
use crate::model::RemoteForward;

/// Suffix of the managed host aliases.
const HOST_SUFFIX: &str = ".okteto";

fn ssh_config_path() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| String::from("."));
    PathBuf::from(home).join(".ssh").join("config")
}

/// Adds the host entry for a dev environment. Reverse forwards become
/// `RemoteForward` directives, so their tunnels open with the SSH
/// session.
///
/// # Errors
///
/// Returns an error if the SSH configuration cannot be updated.
pub fn add_entry(name: &str, port: u16, remote_forwards: &[RemoteForward]) -> Result<()> {
    add_entry_to(&ssh_config_path(), name, port, remote_forwards)
}

/// Removes the host entry of a dev environment.
///
/// # Errors
///
/// Returns an error if the SSH configuration cannot be updated.
pub fn remove_entry(name: &str) -> Result<()> {
    remove_entry_from(&ssh_config_path(), name)
}

fn add_entry_to(
    path: &Path,
    name: &str,
    port: u16,
    remote_forwards: &[RemoteForward],
) -> Result<()> {
    // Replace any stale block from a previous run first.
    remove_entry_from(path, name)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut content = std::fs::read_to_string(path).unwrap_or_default();
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&format!(
        "Host {name}{HOST_SUFFIX}\n  HostName localhost\n  Port {port}\n  StrictHostKeyChecking no\n  UserKnownHostsFile /dev/null\n"
    ));
    for forward in remote_forwards {
        content.push_str(&format!(
            "  RemoteForward {} localhost:{}\n",
            forward.remote, forward.local
        ));
    }

    std::fs::write(path, content)?;
    info!("added ssh entry {name}{HOST_SUFFIX} on port {port}");
    Ok(())
}

fn remove_entry_from(path: &Path, name: &str) -> Result<()> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Ok(());
    };

    let host_line = format!("Host {name}{HOST_SUFFIX}");
    let mut kept = Vec::new();
    let mut in_block = false;

    for line in content.lines() {
        if line.trim() == host_line {
            in_block = true;
            continue;
        }
        if in_block {
            if line.trim_start().starts_with("Host ") {
                in_block = false;
            } else {
                continue;
            }
        }
        kept.push(line);
    }

    let mut updated = kept.join("\n");
    if !updated.is_empty() {
        updated.push('\n');
    }

    if updated != content {
        debug!("removed ssh entry {name}{HOST_SUFFIX}");
        std::fs::write(path, updated)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_remove_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("config");

        add_entry_to(&config, "api", 2222, &[]).expect("add");
        let content = std::fs::read_to_string(&config).expect("read");
        assert!(content.contains("Host api.okteto"));
        assert!(content.contains("Port 2222"));

        remove_entry_from(&config, "api").expect("remove");
        let content = std::fs::read_to_string(&config).expect("read");
        assert!(!content.contains("api.okteto"));
    }

    #[test]
    fn test_add_replaces_stale_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("config");

        add_entry_to(&config, "api", 2222, &[]).expect("add");
        add_entry_to(&config, "api", 2223, &[]).expect("add again");

        let content = std::fs::read_to_string(&config).expect("read");
        assert_eq!(content.matches("Host api.okteto").count(), 1);
        assert!(content.contains("Port 2223"));
        assert!(!content.contains("Port 2222"));
    }

    #[test]
    fn test_remote_forward_directives() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("config");

        let forwards = [RemoteForward {
            remote: 9000,
            local: 9001,
        }];
        add_entry_to(&config, "api", 2222, &forwards).expect("add");

        let content = std::fs::read_to_string(&config).expect("read");
        assert!(content.contains("RemoteForward 9000 localhost:9001"));

        remove_entry_from(&config, "api").expect("remove");
        let content = std::fs::read_to_string(&config).expect("read");
        assert!(!content.contains("RemoteForward"));
    }

    #[test]
    fn test_remove_keeps_other_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("config");

        std::fs::write(&config, "Host other\n  Port 22\n").expect("seed");
        add_entry_to(&config, "api", 2222, &[]).expect("add");
        remove_entry_from(&config, "api").expect("remove");

        let content = std::fs::read_to_string(&config).expect("read");
        assert!(content.contains("Host other"));
        assert!(content.contains("Port 22"));
        assert!(!content.contains("api.okteto"));
    }

    #[test]
    fn test_remove_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        remove_entry_from(&dir.path().join("config"), "api").expect("no-op");
    }
}
