//! Synchronizer supervisor.
//!
//! This module owns the local syncthing child process and drives both
//! synchronization sides over their REST APIs. It does not implement any
//! file synchronization itself.

mod api;
mod config;
mod process;

pub use config::{
    config_json, folder_id, local_config_xml, remote_config_xml, CERT_PEM,
    DEFAULT_REMOTE_DEVICE_ID, FOLDER_TYPE_SEND_ONLY, FOLDER_TYPE_SEND_RECEIVE, KEY_PEM,
};
pub use process::{exists, Syncthing};

/// Observable state of the synchronization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncStatus {
    /// No child process is running.
    Down,
    /// The child is starting and not answering pings yet.
    Pinging,
    /// The initial folder scan is running.
    Scanning,
    /// Files are syncing; completion is in `[0, 1]`.
    Syncing(f64),
    /// Both sides are in sync.
    Idle,
    /// No progress within the freeze threshold.
    Frozen,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Down => write!(f, "down"),
            Self::Pinging => write!(f, "pinging"),
            Self::Scanning => write!(f, "scanning"),
            Self::Syncing(completion) => write!(f, "syncing ({:.0}%)", completion * 100.0),
            Self::Idle => write!(f, "idle"),
            Self::Frozen => write!(f, "frozen"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Dev;

    fn dev() -> Dev {
        Dev::read("name: api\n").expect("manifest should parse")
    }

    #[test]
    fn test_local_config_contains_ports_and_api_key() {
        let dev = dev();
        let syncthing = Syncthing::new(&dev).expect("supervisor");
        let xml = local_config_xml(&syncthing, &dev);

        assert!(xml.contains(&format!("127.0.0.1:{}", syncthing.gui_port())));
        assert!(xml.contains(&format!("tcp://127.0.0.1:{}", syncthing.listen_port())));
        assert!(xml.contains(&format!("tcp://127.0.0.1:{}", syncthing.remote_port())));
        assert!(xml.contains("<apikey>cnd</apikey>"));
        assert!(xml.contains(DEFAULT_REMOTE_DEVICE_ID));
        assert!(xml.contains(r#"type="sendonly""#));
        assert!(xml.contains("okteto-api"));
    }

    #[test]
    fn test_remote_config_targets_cluster_ports() {
        let dev = dev();
        let syncthing = Syncthing::new(&dev).expect("supervisor");
        let xml = remote_config_xml(&syncthing, &dev);

        assert!(xml.contains("tcp://0.0.0.0:22000"));
        assert!(xml.contains("0.0.0.0:8384"));
        assert!(xml.contains(r#"path="/var/okteto""#));
        assert!(xml.contains(r#"type="sendreceive""#));
    }

    #[test]
    fn test_config_json_folder_type() {
        let dev = dev();
        let syncthing = Syncthing::new(&dev).expect("supervisor");

        let json = config_json(&syncthing, &dev, FOLDER_TYPE_SEND_RECEIVE);
        assert_eq!(json["folders"][0]["type"], "sendreceive");
        assert_eq!(json["folders"][0]["id"], "okteto-api");

        let json = config_json(&syncthing, &dev, FOLDER_TYPE_SEND_ONLY);
        assert_eq!(json["folders"][0]["type"], "sendonly");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SyncStatus::Syncing(0.42).to_string(), "syncing (42%)");
        assert_eq!(SyncStatus::Down.to_string(), "down");
    }
}
