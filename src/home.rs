//! Per-environment local state directory.
//!
//! Every dev environment owns `~/.okteto/<namespace>/<name>`: the
//! syncthing material lives there, and so does `okteto.state`, the file
//! external tools poll to follow the activation. State writes are
//! atomic (write-then-rename) and never regress within a cycle.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use crate::error::{Error, Result};

/// Name of the state file.
pub const STATE_FILE: &str = "okteto.state";

/// The activation state reported to external observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    /// The overlay is being installed.
    Activating,
    /// The overlay is rolling out.
    Starting,
    /// The persistent volume is attaching.
    Attaching,
    /// The dev image is pulling.
    Pulling,
    /// The synchronization service is starting.
    StartingSync,
    /// Files are synchronizing.
    Synchronizing,
    /// The environment is ready.
    Ready,
    /// The activation failed. Terminal for the cycle.
    Failed,
}

impl ActivationState {
    /// Position in the activation sequence, used to reject regressions.
    const fn order(self) -> u8 {
        match self {
            Self::Activating => 0,
            Self::Starting => 1,
            Self::Attaching => 2,
            Self::Pulling => 3,
            Self::StartingSync => 4,
            Self::Synchronizing => 5,
            Self::Ready => 6,
            Self::Failed => 7,
        }
    }
}

impl std::fmt::Display for ActivationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            Self::Activating => "activating",
            Self::Starting => "starting",
            Self::Attaching => "attaching",
            Self::Pulling => "pulling",
            Self::StartingSync => "startingSync",
            Self::Synchronizing => "synchronizing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        write!(f, "{token}")
    }
}

impl FromStr for ActivationState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "activating" => Ok(Self::Activating),
            "starting" => Ok(Self::Starting),
            "attaching" => Ok(Self::Attaching),
            "pulling" => Ok(Self::Pulling),
            "startingSync" => Ok(Self::StartingSync),
            "synchronizing" => Ok(Self::Synchronizing),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(Error::internal(format!("unknown activation state: '{other}'"))),
        }
    }
}

/// Root of the okteto local state, `$OKTETO_HOME` or `~/.okteto`.
#[must_use]
pub fn okteto_home() -> PathBuf {
    if let Ok(home) = std::env::var("OKTETO_HOME") {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    let user_home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| String::from("."));
    PathBuf::from(user_home).join(".okteto")
}

/// State directory of one dev environment.
#[must_use]
pub fn dev_home(namespace: &str, name: &str) -> PathBuf {
    okteto_home().join(namespace).join(name)
}

/// Handle to the state directory of one dev environment. The directory
/// is exclusively owned by one invocation for the duration of a cycle.
#[derive(Debug)]
pub struct Home {
    dir: PathBuf,
    last_state: Option<ActivationState>,
}

impl Home {
    /// Acquires the directory, creating it with mode `0700`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(namespace: &str, name: &str) -> Result<Self> {
        Self::at(dev_home(namespace, name))
    }

    fn at(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            dir,
            last_state: None,
        })
    }

    /// Path of the state directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the activation state atomically. Within a cycle a state
    /// never regresses: stale writes are dropped. `failed` always wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub fn write_state(&mut self, state: ActivationState) -> Result<()> {
        if let Some(last) = self.last_state {
            if state != ActivationState::Failed && state.order() < last.order() {
                debug!("dropping stale state transition {last} -> {state}");
                return Ok(());
            }
        }

        let path = self.dir.join(STATE_FILE);
        let temp = self.dir.join(format!("{STATE_FILE}.tmp"));
        std::fs::write(&temp, format!("{state}\n"))?;
        std::fs::rename(&temp, &path)?;

        debug!("state: {state}");
        self.last_state = Some(state);
        Ok(())
    }

    /// Resets the monotonicity guard for a new activation cycle.
    pub fn new_cycle(&mut self) {
        self.last_state = None;
    }

    /// Reads the last written activation state.
    ///
    /// # Errors
    ///
    /// Returns an error if no state was ever written or the token is
    /// unknown.
    pub fn read_state(&self) -> Result<ActivationState> {
        let content = std::fs::read_to_string(self.dir.join(STATE_FILE))?;
        content.trim().parse()
    }

    /// Removes the state directory, and the parent namespace directory
    /// when it ends up empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        if let Some(parent) = self.dir.parent() {
            if parent.exists() && parent.read_dir()?.next().is_none() {
                std::fs::remove_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_home() -> (Home, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = Home::at(dir.path().join("ns").join("api")).expect("home");
        (home, dir)
    }

    #[test]
    fn test_write_and_read_state() {
        let (mut home, _dir) = test_home();

        home.write_state(ActivationState::Activating).expect("write");
        assert_eq!(home.read_state().expect("read"), ActivationState::Activating);

        let raw = std::fs::read_to_string(home.dir().join(STATE_FILE)).expect("raw");
        assert_eq!(raw, "activating\n");
    }

    #[test]
    fn test_state_never_regresses() {
        let (mut home, _dir) = test_home();

        home.write_state(ActivationState::Synchronizing).expect("write");
        home.write_state(ActivationState::Attaching).expect("stale write");
        assert_eq!(
            home.read_state().expect("read"),
            ActivationState::Synchronizing
        );

        home.write_state(ActivationState::Ready).expect("write");
        assert_eq!(home.read_state().expect("read"), ActivationState::Ready);
    }

    #[test]
    fn test_failed_overrides_any_state() {
        let (mut home, _dir) = test_home();

        home.write_state(ActivationState::Ready).expect("write");
        home.write_state(ActivationState::Failed).expect("write");
        assert_eq!(home.read_state().expect("read"), ActivationState::Failed);
    }

    #[test]
    fn test_new_cycle_resets_guard() {
        let (mut home, _dir) = test_home();

        home.write_state(ActivationState::Ready).expect("write");
        home.new_cycle();
        home.write_state(ActivationState::Activating).expect("write");
        assert_eq!(home.read_state().expect("read"), ActivationState::Activating);
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            ActivationState::Activating,
            ActivationState::Starting,
            ActivationState::Attaching,
            ActivationState::Pulling,
            ActivationState::StartingSync,
            ActivationState::Synchronizing,
            ActivationState::Ready,
            ActivationState::Failed,
        ] {
            let parsed: ActivationState = state.to_string().parse().expect("parse");
            assert_eq!(parsed, state);
        }
        assert!("bogus".parse::<ActivationState>().is_err());
    }

    #[test]
    fn test_destroy_removes_empty_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ns_dir = dir.path().join("ns");
        let home = Home::at(ns_dir.join("api")).expect("home");

        home.destroy().expect("destroy");
        assert!(!ns_dir.exists());
    }
}
