// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Okteto
//!
//! A command-line tool that turns a Kubernetes deployment into a live remote
//! development environment.
//!
//! ## Overview
//!
//! `okteto up` swaps a deployment's container for a development image backed
//! by a persistent volume, attaches a bidirectional file synchronizer,
//! bridges local ports to the remote pod and hands the developer a terminal
//! inside the container. `okteto down` restores the original workload.
//!
//! ## Architecture
//!
//! The heart of the tool is the **activation loop**: a supervisor that
//! concurrently installs the dev-mode overlay, health-gates the syncthing
//! sidecar, maintains the port-forward bundle, streams the interactive
//! shell, and re-converges on disconnects without losing the session.
//!
//! ## Modules
//!
//! - [`model`]: Manifest parsing and validation
//! - [`k8s`]: Cluster client facade, translation and port forwarding
//! - [`syncthing`]: Synchronizer supervisor
//! - [`up`]: The activation loop
//! - [`home`]: Local state directory and activation state file
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! name: api
//! image: node:16
//! command: ["yarn", "start"]
//! forward:
//!   - "8080:3000"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod analytics;
pub mod cli;
pub mod error;
pub mod home;
pub mod k8s;
pub mod model;
pub mod ssh;
pub mod syncthing;
pub mod up;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands};
pub use error::{ClusterError, Error, ManifestError, Result, SyncError, UserError};
pub use home::{ActivationState, Home};
pub use k8s::{ClusterClient, PortForwardManager, TranslationRule};
pub use model::{Dev, Forward, RemoteForward};
pub use syncthing::{SyncStatus, Syncthing};
