//! Analytics events.
//!
//! The core only names the events; shipping them is handled by the
//! external telemetry pipeline, so here each event is recorded on the
//! debug log.

use tracing::debug;

/// Identifies the machine in recorded events.
fn machine_id() -> String {
    hostname::get().map_or_else(
        |_| String::from("unknown"),
        |h| h.to_string_lossy().to_string(),
    )
}

/// Records an activation attempt.
pub fn track_up(name: &str, single: bool, swap: bool) {
    debug!(event = "up", machine = %machine_id(), name, single, swap);
}

/// Records a successful reconnection.
pub fn track_reconnect(swap: bool) {
    debug!(event = "reconnect", swap);
}

/// Records an activation that never became ready.
pub fn track_up_error(swap: bool) {
    debug!(event = "up_error", swap);
}

/// Records a synchronization failure.
pub fn track_sync_error() {
    debug!(event = "sync_error");
}

/// Records a deactivation.
pub fn track_down(name: &str) {
    debug!(event = "down", name);
}
