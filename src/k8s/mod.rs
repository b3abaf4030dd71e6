//! Cluster client facade.
//!
//! This module provides every typed operation the activation loop
//! performs against the cluster: deployment translation and rollout, dev
//! pod discovery and readiness gating, secret/volume/service management,
//! command execution and port forwarding.

mod client;
pub mod deployments;
pub mod exec;
mod forward;
pub mod pods;
pub mod secrets;
pub mod services;
pub mod translate;
pub mod volumes;

pub use client::{with_retries, ClusterClient};
pub use forward::PortForwardManager;
pub use translate::{is_auto_create, is_dev_mode, restore, sandbox, translate, TranslationRule};
