//! Syncthing configuration rendering.
//!
//! Both sides of the synchronization run from configuration generated
//! here: the local process gets a `config.xml` written into its home
//! directory, the remote sidecar gets one through the secret. The same
//! embedded TLS pair is installed on both sides, which is why the remote
//! device ID is a fixed constant.

use crate::model::Dev;

use super::process::Syncthing;

/// TLS certificate installed on both syncthing sides.
pub const CERT_PEM: &str = include_str!("certs/cert.pem");

/// TLS key installed on both syncthing sides.
pub const KEY_PEM: &str = include_str!("certs/key.pem");

/// Device ID of the remote syncthing, derived from the embedded
/// certificate.
pub const DEFAULT_REMOTE_DEVICE_ID: &str =
    "ATOPHFJ-VPVLDFY-QVZDCF2-OQQ7IOW-OG4DIXF-OA7RWU3-ZYA4S22-SI4XVAU";

/// Seconds the file watcher waits after a change before syncing.
pub const DEFAULT_FILE_WATCHER_DELAY: u32 = 5;

/// Folder type during the bootstrap scan: local changes win, remote
/// deletions do not propagate.
pub const FOLDER_TYPE_SEND_ONLY: &str = "sendonly";

/// Folder type once the environment is in steady state.
pub const FOLDER_TYPE_SEND_RECEIVE: &str = "sendreceive";

/// Cluster-side syncthing listen port.
pub const CLUSTER_PORT: u16 = crate::model::SYNC_TCP_PORT;

/// Cluster-side syncthing GUI port.
pub const CLUSTER_GUI_PORT: u16 = crate::model::SYNC_GUI_PORT;

/// Returns the folder id shared between the two devices.
#[must_use]
pub fn folder_id(dev: &Dev) -> String {
    format!("okteto-{}", dev.name)
}

/// Renders the local `config.xml`.
#[must_use]
pub fn local_config_xml(s: &Syncthing, dev: &Dev) -> String {
    render_config_xml(
        &folder_id(dev),
        &s.folder_path().display().to_string(),
        FOLDER_TYPE_SEND_ONLY,
        &format!("tcp://127.0.0.1:{}", s.listen_port()),
        &format!("tcp://127.0.0.1:{}", s.remote_port()),
        &format!("127.0.0.1:{}", s.gui_port()),
        s.api_key(),
        s.gui_password_hash(),
    )
}

/// Renders the `config.xml` shipped to the remote sidecar through the
/// secret.
#[must_use]
pub fn remote_config_xml(s: &Syncthing, dev: &Dev) -> String {
    render_config_xml(
        &folder_id(dev),
        "/var/okteto",
        FOLDER_TYPE_SEND_RECEIVE,
        &format!("tcp://0.0.0.0:{CLUSTER_PORT}"),
        "dynamic",
        &format!("0.0.0.0:{CLUSTER_GUI_PORT}"),
        s.api_key(),
        s.gui_password_hash(),
    )
}

#[allow(clippy::too_many_arguments)]
fn render_config_xml(
    folder_id: &str,
    folder_path: &str,
    folder_type: &str,
    listen_address: &str,
    remote_address: &str,
    gui_address: &str,
    api_key: &str,
    gui_password_hash: &str,
) -> String {
    format!(
        r#"<configuration version="28">
    <folder id="{folder_id}" label="okteto" path="{folder_path}" type="{folder_type}" rescanIntervalS="300" fsWatcherEnabled="true" fsWatcherDelayS="{DEFAULT_FILE_WATCHER_DELAY}" ignorePerms="false" autoNormalize="true">
        <device id="{DEFAULT_REMOTE_DEVICE_ID}"></device>
        <minDiskFree unit="%">1</minDiskFree>
        <maxConflicts>0</maxConflicts>
    </folder>
    <device id="{DEFAULT_REMOTE_DEVICE_ID}" compression="metadata" introducer="false">
        <address>{remote_address}</address>
    </device>
    <gui enabled="true" tls="true">
        <address>{gui_address}</address>
        <user>okteto</user>
        <password>{gui_password_hash}</password>
        <apikey>{api_key}</apikey>
    </gui>
    <options>
        <listenAddress>{listen_address}</listenAddress>
        <globalAnnounceEnabled>false</globalAnnounceEnabled>
        <localAnnounceEnabled>false</localAnnounceEnabled>
        <relaysEnabled>false</relaysEnabled>
        <natEnabled>false</natEnabled>
        <urAccepted>-1</urAccepted>
        <restartOnWakeup>false</restartOnWakeup>
        <autoUpgradeIntervalH>0</autoUpgradeIntervalH>
        <stunServer></stunServer>
        <defaultFolderPath></defaultFolderPath>
    </options>
</configuration>
"#
    )
}

/// Builds the JSON configuration for `PUT /rest/system/config`, used to
/// flip the folder type between bootstrap and steady state.
#[must_use]
pub fn config_json(s: &Syncthing, dev: &Dev, folder_type: &str) -> serde_json::Value {
    serde_json::json!({
        "version": 28,
        "folders": [{
            "id": folder_id(dev),
            "label": "okteto",
            "path": s.folder_path().display().to_string(),
            "type": folder_type,
            "rescanIntervalS": 300,
            "fsWatcherEnabled": true,
            "fsWatcherDelayS": DEFAULT_FILE_WATCHER_DELAY,
            "devices": [{"deviceID": DEFAULT_REMOTE_DEVICE_ID}],
            "maxConflicts": 0,
        }],
        "devices": [{
            "deviceID": DEFAULT_REMOTE_DEVICE_ID,
            "compression": "metadata",
            "introducer": false,
            "addresses": [format!("tcp://127.0.0.1:{}", s.remote_port())],
        }],
        "gui": {
            "enabled": true,
            "tls": true,
            "address": format!("127.0.0.1:{}", s.gui_port()),
            "user": "okteto",
            "password": s.gui_password_hash(),
            "apiKey": s.api_key(),
        },
        "options": {
            "listenAddresses": [format!("tcp://127.0.0.1:{}", s.listen_port())],
            "globalAnnounceEnabled": false,
            "localAnnounceEnabled": false,
            "relaysEnabled": false,
            "natEnabled": false,
            "urAccepted": -1,
            "restartOnWakeup": false,
            "autoUpgradeIntervalH": 0,
        },
    })
}
