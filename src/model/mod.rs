//! Manifest model for the okteto CLI.
//!
//! This module handles the `okteto.yml` manifest:
//! - Parsing and strict deserialization of the `Dev` spec
//! - Validation and defaulting of manifest values
//! - The port forward string grammar

mod dev;
mod forward;

pub use dev::{
    find_manifest, Capabilities, Dev, EnvVar, ImagePullPolicy, ResourceRequirements,
    SecurityContext, Volume, AUTO_CREATE_ANNOTATION, DEFAULT_IMAGE, DEFAULT_MANIFEST_FILES,
    MARKER_PATH_VARIABLE, ORIGINAL_SPEC_ANNOTATION, REMOTE_PORT_VARIABLE, REMOTE_SSH_PORT,
    RESTART_ANNOTATION, SYNC_GUI_PORT, SYNC_TCP_PORT,
};
pub use forward::{Forward, RemoteForward};
