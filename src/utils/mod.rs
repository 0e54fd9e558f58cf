//! Shared helpers: configuration paths, environment handling, logging

pub mod config_paths;
pub mod env;
pub mod logger;

pub use config_paths::{ConfigPaths, LauncherConfig, ResolvedLayout};

/// Format a duration as `1h 02m 03s`, dropping leading zero units.
pub fn format_uptime(duration: chrono::Duration) -> String {
    let total = duration.num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
