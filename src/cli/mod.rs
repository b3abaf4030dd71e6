//! Command-line interface of the okteto tool.

mod commands;
pub mod output;

pub use commands::{Cli, Commands};
pub use output::Spinner;
