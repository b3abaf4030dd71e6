//! Syncthing REST control plane.
//!
//! The supervisor never syncs files itself; it drives the child process
//! over its loopback HTTPS API and the remote sidecar through the
//! forwarded GUI port. Waits retry per-endpoint before surfacing, and
//! the completion wait enforces the freeze threshold.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, SyncError};
use crate::model::Dev;

use super::config;
use super::process::Syncthing;
use super::SyncStatus;

/// Interval between ping attempts.
const PING_INTERVAL: Duration = Duration::from_millis(500);

/// Per-endpoint retry budget for the waits.
const WAIT_BUDGET: Duration = Duration::from_secs(30);

/// Budget for the initial folder scan.
const SCAN_BUDGET: Duration = Duration::from_secs(120);

/// Interval between completion polls.
const COMPLETION_INTERVAL: Duration = Duration::from_millis(500);

/// The completion wait fails when neither side makes progress for this
/// long.
const FREEZE_THRESHOLD: Duration = Duration::from_secs(60);

/// Interval between steady-state health polls.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// An event returned by `/rest/events`. `data` is null for some event
/// types.
#[derive(Debug, Deserialize)]
struct Event {
    id: u64,
    #[serde(rename = "type")]
    event_type: String,
    #[allow(dead_code)]
    time: DateTime<Utc>,
    #[serde(default)]
    data: Option<EventData>,
}

/// The payload fields the supervisor cares about.
#[derive(Debug, Default, Deserialize)]
struct EventData {
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    completion: Option<f64>,
    #[serde(default)]
    to: Option<String>,
}

impl Syncthing {
    fn base_url(&self, local: bool) -> String {
        let port = if local {
            self.gui_port()
        } else {
            self.remote_gui_port()
        };
        format!("https://127.0.0.1:{port}")
    }

    async fn events(&self, local: bool, since: u64) -> Result<Vec<Event>> {
        let url = format!("{}/rest/events", self.base_url(local));
        let response = self
            .rest
            .get(&url)
            .header("X-API-Key", self.api_key())
            .query(&[
                ("limit", String::from("30")),
                ("since", since.to_string()),
                ("timeout", String::from("1")),
            ])
            .send()
            .await
            .map_err(|e| Error::Sync(SyncError::api(e.to_string())))?;

        if !response.status().is_success() {
            return Err(Error::Sync(SyncError::api(format!(
                "events returned {}",
                response.status()
            ))));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Sync(SyncError::api(format!("failed to parse events: {e}"))))
    }

    async fn ping(&self, local: bool) -> bool {
        let url = format!("{}/rest/system/ping", self.base_url(local));
        match self
            .rest
            .get(&url)
            .header("X-API-Key", self.api_key())
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Waits until the local or the remote syncthing answers pings.
    ///
    /// # Errors
    ///
    /// Returns a timeout error when the retry budget runs out or the
    /// wait is cancelled.
    pub async fn wait_for_ping(&mut self, cancel: &CancellationToken, local: bool) -> Result<()> {
        let side = if local { "local" } else { "remote" };
        debug!("waiting for the {side} syncthing to be responsive");
        let start = Instant::now();

        while start.elapsed() < WAIT_BUDGET {
            if cancel.is_cancelled() {
                break;
            }
            if self.ping(local).await {
                return Ok(());
            }
            tokio::time::sleep(PING_INTERVAL).await;
        }

        Err(Error::Sync(SyncError::Timeout {
            expected_state: String::from("responsive"),
        }))
    }

    /// Posts the user's ignore patterns from `.stignore`, when present.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn send_stignore(&self, dev: &Dev) -> Result<()> {
        let stignore = self.folder_path().join(".stignore");
        let Ok(content) = std::fs::read_to_string(&stignore) else {
            debug!("no .stignore file found");
            return Ok(());
        };

        let patterns: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        info!("sending {} ignore patterns", patterns.len());

        let url = format!("{}/rest/db/ignores", self.base_url(true));
        self.rest
            .post(&url)
            .header("X-API-Key", self.api_key())
            .query(&[("folder", config::folder_id(dev))])
            .json(&serde_json::json!({ "ignore": patterns }))
            .send()
            .await
            .map_err(|e| Error::Sync(SyncError::api(e.to_string())))?;
        Ok(())
    }

    /// Blocks until the local folder is fully scanned. During bootstrap
    /// the local state is then pushed with `/rest/db/override` so remote
    /// deletions cannot propagate back.
    ///
    /// # Errors
    ///
    /// Returns an error when the scan does not finish within its budget
    /// or the wait is cancelled.
    pub async fn wait_for_scanning(
        &mut self,
        cancel: &CancellationToken,
        dev: &Dev,
        bootstrap: bool,
    ) -> Result<()> {
        self.status = SyncStatus::Scanning;
        let folder = config::folder_id(dev);
        debug!("waiting for initial scan of folder {folder}");

        let start = Instant::now();
        let mut since = 0;
        let mut scanning_seen = false;

        loop {
            if cancel.is_cancelled() || start.elapsed() > SCAN_BUDGET {
                return Err(Error::Sync(SyncError::Timeout {
                    expected_state: String::from("scanned"),
                }));
            }

            if let Ok(events) = self.events(true, since).await {
                for event in events {
                    since = since.max(event.id);
                    let Some(data) = &event.data else { continue };
                    if event.event_type != "StateChanged" || data.folder.as_deref() != Some(&folder)
                    {
                        continue;
                    }
                    match data.to.as_deref() {
                        Some("scanning") => scanning_seen = true,
                        Some("idle") if scanning_seen => {
                            if bootstrap {
                                self.override_changes(dev).await?;
                            }
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }

            tokio::time::sleep(COMPLETION_INTERVAL).await;
        }
    }

    /// Pushes the local folder state to the remote device.
    async fn override_changes(&self, dev: &Dev) -> Result<()> {
        let url = format!("{}/rest/db/override", self.base_url(true));
        self.rest
            .post(&url)
            .header("X-API-Key", self.api_key())
            .query(&[("folder", config::folder_id(dev))])
            .send()
            .await
            .map_err(|e| Error::Sync(SyncError::api(e.to_string())))?;
        Ok(())
    }

    /// Streams the folder completion percentage onto `reporter` until it
    /// reaches 100. Values are monotonically non-decreasing.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Frozen`] when neither side reports progress
    /// within the freeze threshold.
    pub async fn wait_for_completion(
        &mut self,
        cancel: &CancellationToken,
        dev: &Dev,
        reporter: mpsc::Sender<f64>,
    ) -> Result<()> {
        let folder = config::folder_id(dev);
        self.status = SyncStatus::Syncing(0.0);

        let mut since = 0;
        let mut remote_since = 0;
        let mut max_completion = 0.0f64;
        let mut last_progress = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Sync(SyncError::Timeout {
                    expected_state: String::from("synchronized"),
                }));
            }

            if let Ok(events) = self.events(true, since).await {
                for event in events {
                    since = since.max(event.id);
                    let Some(data) = &event.data else { continue };
                    if event.event_type != "FolderCompletion"
                        || data.folder.as_deref() != Some(&folder)
                    {
                        continue;
                    }
                    if let Some(completion) = data.completion {
                        if completion > max_completion {
                            max_completion = completion;
                            last_progress = Instant::now();
                            self.status = SyncStatus::Syncing(max_completion / 100.0);
                            let _ = reporter.send(max_completion).await;
                        }
                    }
                }
            }

            if max_completion >= 100.0 {
                self.status = SyncStatus::Idle;
                return Ok(());
            }

            if last_progress.elapsed() > FREEZE_THRESHOLD {
                // One last check: if the remote side is still catching
                // up, the sync is alive and the timer resets.
                if self.remote_in_progress(&folder, &mut remote_since).await {
                    last_progress = Instant::now();
                    continue;
                }
                self.status = SyncStatus::Frozen;
                return Err(Error::Sync(SyncError::Frozen {
                    log_path: self.log_path(),
                }));
            }

            tokio::time::sleep(COMPLETION_INTERVAL).await;
        }
    }

    /// Returns true if the remote device reports sync progress.
    async fn remote_in_progress(&self, folder: &str, since: &mut u64) -> bool {
        match self.events(false, *since).await {
            Ok(events) => events.iter().any(|event| {
                *since = (*since).max(event.id);
                event.event_type == "FolderCompletion"
                    && event
                        .data
                        .as_ref()
                        .and_then(|data| data.folder.as_deref())
                        == Some(folder)
            }),
            Err(_) => false,
        }
    }

    /// Switches the folder between `sendonly` bootstrap and
    /// `sendreceive` steady state.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be updated.
    pub async fn update_folder_type(&self, dev: &Dev, folder_type: &str) -> Result<()> {
        info!("updating folder type to {folder_type}");
        let url = format!("{}/rest/system/config", self.base_url(true));
        let response = self
            .rest
            .put(&url)
            .header("X-API-Key", self.api_key())
            .json(&config::config_json(self, dev, folder_type))
            .send()
            .await
            .map_err(|e| Error::Sync(SyncError::api(e.to_string())))?;

        if !response.status().is_success() {
            return Err(Error::Sync(SyncError::api(format!(
                "config update returned {}",
                response.status()
            ))));
        }
        Ok(())
    }

    /// Restarts the local syncthing so a configuration change takes
    /// effect.
    ///
    /// # Errors
    ///
    /// Returns an error if the restart call fails or the process does
    /// not come back.
    pub async fn restart(&mut self, cancel: &CancellationToken) -> Result<()> {
        info!("restarting syncthing");
        let url = format!("{}/rest/system/restart", self.base_url(true));
        self.rest
            .post(&url)
            .header("X-API-Key", self.api_key())
            .send()
            .await
            .map_err(|e| Error::Sync(SyncError::api(e.to_string())))?;

        self.wait_for_ping(cancel, true).await
    }

    /// Spawns the steady-state monitor: polls both sides every five
    /// seconds and closes `disconnect` after two consecutive failures.
    #[must_use]
    pub fn monitor_task(
        &self,
        cancel: CancellationToken,
        disconnect: mpsc::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let rest = self.rest.clone();
        let api_key = self.api_key().to_string();
        let local_url = format!("{}/rest/system/ping", self.base_url(true));
        let remote_url = format!("{}/rest/system/ping", self.base_url(false));

        tokio::spawn(async move {
            let mut failures = 0;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(MONITOR_INTERVAL) => {}
                }

                let mut healthy = true;
                for url in [&local_url, &remote_url] {
                    let ok = match rest.get(url).header("X-API-Key", &api_key).send().await {
                        Ok(response) => response.status().is_success(),
                        Err(_) => false,
                    };
                    if !ok {
                        healthy = false;
                        break;
                    }
                }

                if healthy {
                    failures = 0;
                } else {
                    failures += 1;
                    warn!("synchronization service unreachable ({failures}/2)");
                    if failures >= 2 {
                        let _ = disconnect.try_send(());
                        return;
                    }
                }
            }
        })
    }
}
