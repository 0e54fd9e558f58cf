//! Command-line interface: argument parsing and command handlers

pub mod lifecycle;
pub mod parser;

pub use lifecycle::{handle_restart, handle_start, handle_status, handle_stop, Context};
pub use parser::{Cli, Commands};
