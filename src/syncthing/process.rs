//! Local syncthing process lifecycle.
//!
//! The supervisor owns one child syncthing per dev environment home
//! directory. The PID file is the only cross-invocation lock: a second
//! activation on the same home interrupts the previous child and takes
//! over.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result, SyncError};
use crate::home;
use crate::model::Dev;

use super::config;
use super::SyncStatus;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const CONFIG_FILE: &str = "config.xml";
const LOG_FILE: &str = "syncthing.log";
const PID_FILE: &str = "syncthing.pid";

const BINARY_NAME: &str = "syncthing";

/// How long to wait for an interrupted child to exit.
const STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to wait for a stale daemon to exit after SIGINT.
const TAKEOVER_TIMEOUT: Duration = Duration::from_secs(2);

/// The local syncthing process and its control-plane coordinates.
pub struct Syncthing {
    home: PathBuf,
    folder_path: PathBuf,
    listen_port: u16,
    gui_port: u16,
    remote_port: u16,
    remote_gui_port: u16,
    api_key: String,
    gui_password_hash: String,
    pub(super) rest: reqwest::Client,
    pub(super) status: SyncStatus,
    child: Option<tokio::process::Child>,
}

impl Syncthing {
    /// Prepares a supervisor for a dev spec: picks the four local ports
    /// via port-zero binds and generates the GUI credentials. The child
    /// is not started until [`Syncthing::run`].
    ///
    /// # Errors
    ///
    /// Returns an error if no local ports are available or the REST
    /// client cannot be built.
    pub fn new(dev: &Dev) -> Result<Self> {
        let listen_port = available_port()?;
        let gui_port = available_port()?;
        let remote_port = available_port()?;
        let remote_gui_port = available_port()?;

        let gui_password = Uuid::new_v4().to_string();
        let gui_password_hash = hex::encode(Sha256::digest(gui_password.as_bytes()));

        // The GUI serves TLS with the embedded certificate, so the
        // loopback client skips verification.
        let rest = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Sync(SyncError::api(format!("failed to create HTTP client: {e}"))))?;

        Ok(Self {
            home: home::dev_home(&dev.namespace, &dev.name),
            folder_path: dev.dev_dir.clone(),
            listen_port,
            gui_port,
            remote_port,
            remote_gui_port,
            api_key: String::from("cnd"),
            gui_password_hash,
            rest,
            status: SyncStatus::Down,
            child: None,
        })
    }

    /// Local sync protocol port.
    #[must_use]
    pub const fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Local REST API port.
    #[must_use]
    pub const fn gui_port(&self) -> u16 {
        self.gui_port
    }

    /// Local end of the tunnel to the remote sync port.
    #[must_use]
    pub const fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Local end of the tunnel to the remote GUI port.
    #[must_use]
    pub const fn remote_gui_port(&self) -> u16 {
        self.remote_gui_port
    }

    /// REST API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Hash of the generated GUI password.
    #[must_use]
    pub fn gui_password_hash(&self) -> &str {
        &self.gui_password_hash
    }

    /// Directory synchronized with the remote container.
    #[must_use]
    pub fn folder_path(&self) -> &Path {
        &self.folder_path
    }

    /// Current observable state of the synchronization.
    #[must_use]
    pub const fn status(&self) -> SyncStatus {
        self.status
    }

    /// Path to the syncthing log, surfaced in freeze errors.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.home.join(LOG_FILE)
    }

    fn pid_path(&self) -> PathBuf {
        self.home.join(PID_FILE)
    }

    /// Renders the configuration shipped to the remote sidecar.
    #[must_use]
    pub fn remote_config_xml(&self, dev: &Dev) -> String {
        config::remote_config_xml(self, dev)
    }

    /// Starts the child syncthing, interrupting any stale daemon found
    /// through the PID file first.
    ///
    /// # Errors
    ///
    /// Returns an error if the binary is missing or the child cannot be
    /// spawned.
    pub async fn run(&mut self, dev: &Dev) -> Result<()> {
        let bin_path = find_in_path(BINARY_NAME).ok_or(Error::Sync(SyncError::BinaryNotFound))?;
        debug!("running syncthing from {}", bin_path.display());

        self.init_config(dev)?;
        self.cleanup_daemon(TAKEOVER_TIMEOUT).await?;

        let log_path = self.log_path();
        let child = tokio::process::Command::new(&bin_path)
            .arg("-home")
            .arg(&self.home)
            .arg("-no-browser")
            .arg("-verbose")
            .arg("-logfile")
            .arg(&log_path)
            .env("STNOUPGRADE", "1")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| Error::Sync(SyncError::process(format!("failed to start syncthing: {e}"))))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Sync(SyncError::process("syncthing exited immediately")))?;
        std::fs::write(self.pid_path(), pid.to_string())?;

        self.child = Some(child);
        self.status = SyncStatus::Pinging;
        info!(
            "syncthing running on https://127.0.0.1:{} and tcp://127.0.0.1:{}",
            self.gui_port, self.listen_port
        );
        Ok(())
    }

    /// Writes the home directory: configuration, TLS pair, all `0700`.
    fn init_config(&self, dev: &Dev) -> Result<()> {
        std::fs::create_dir_all(&self.home)?;
        restrict_permissions(&self.home)?;

        write_file(&self.home.join(CONFIG_FILE), &config::local_config_xml(self, dev))?;
        write_file(&self.home.join(CERT_FILE), config::CERT_PEM)?;
        write_file(&self.home.join(KEY_FILE), config::KEY_PEM)?;

        Ok(())
    }

    /// Interrupts the daemon recorded in the PID file and waits for it
    /// to exit. Skipped on Windows.
    async fn cleanup_daemon(&self, budget: Duration) -> Result<()> {
        if !cfg!(unix) {
            return Ok(());
        }

        let Some(pid) = read_pid(&self.pid_path()) else {
            return Ok(());
        };
        if !pid_alive(pid) {
            return Ok(());
        }

        info!("interrupting previous syncthing (pid {pid})");
        interrupt(pid);

        let start = std::time::Instant::now();
        while pid_alive(pid) {
            if start.elapsed() > budget {
                warn!("previous syncthing (pid {pid}) did not exit in time");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Ok(())
    }

    /// Stops the child and, with `force`, deletes the home directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be removed.
    pub async fn stop(&mut self, force: bool) -> Result<()> {
        self.cleanup_daemon(STOP_TIMEOUT).await?;

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
                Ok(_) => debug!("syncthing clean shutdown"),
                Err(_) => {
                    warn!("syncthing did not exit in time, killing it");
                    let _ = child.kill().await;
                }
            }
        }

        self.status = SyncStatus::Down;
        if force {
            self.remove_folder()?;
        }
        Ok(())
    }

    /// Deletes every file created by this instance, and the parent
    /// namespace directory when it ends up empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    pub fn remove_folder(&self) -> Result<()> {
        if self.home.as_os_str().is_empty() {
            return Ok(());
        }
        if self.home.exists() {
            std::fs::remove_dir_all(&self.home)?;
        }

        if let Some(parent) = self.home.parent() {
            if parent.exists() && parent.read_dir()?.next().is_none() {
                debug!("deleting {} since it's empty", parent.display());
                std::fs::remove_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Returns true if a syncthing child is alive for the given home
/// directory.
#[must_use]
pub fn exists(home: &Path) -> bool {
    read_pid(&home.join(PID_FILE)).is_some_and(pid_alive)
}

fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

#[cfg(not(unix))]
const fn pid_alive(_pid: i32) -> bool {
    false
}

#[cfg(unix)]
fn interrupt(pid: i32) {
    let _ = std::process::Command::new("kill")
        .args(["-2", &pid.to_string()])
        .status();
}

#[cfg(not(unix))]
const fn interrupt(_pid: i32) {}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents)?;
    restrict_permissions(path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn available_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let candidate = dir.join(format!("{binary}.exe"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_port() {
        let port = available_port().expect("port");
        assert!(port > 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_pid_alive() {
        let own_pid = i32::try_from(std::process::id()).expect("pid fits");
        assert!(pid_alive(own_pid));
        assert!(!pid_alive(999_999_999));
    }

    #[test]
    fn test_exists_without_pid_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(!exists(dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn test_exists_with_live_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(PID_FILE), std::process::id().to_string())
            .expect("write pid");
        assert!(exists(dir.path()));

        std::fs::write(dir.path().join(PID_FILE), "999999999").expect("write pid");
        assert!(!exists(dir.path()));
    }
}
