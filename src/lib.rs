//! dsctl library
//!
//! Start, stop and inspect the driver status detection program: PID file
//! tracking, process-table fallback, systemd passthrough and signal
//! escalation.

pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod pidfile;
pub mod platform;
pub mod service;
pub mod signal;
pub mod status;
pub mod stopper;
pub mod supervisor;
pub mod utils;
pub mod venv;

// Re-export commonly used types for convenience
pub use error::{DsctlError, DsctlResult, ErrorCategory};
pub use pidfile::{PidFile, PidFileError, PidRecord, PidState};
pub use service::{ServiceError, ServiceManager, Systemctl};
pub use status::{RunState, StatusReport};
pub use stopper::{StopOptions, StopOutcome, Stopper};
pub use supervisor::{LaunchMode, StartOptions, StartOutcome, Supervisor};
