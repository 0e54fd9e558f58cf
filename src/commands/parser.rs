//! Command-line parsing
//!
//! clap derive definitions for the `dsctl` interface.

use crate::supervisor::LaunchMode;
use crate::utils::env::parse_env_assignment;
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "dsctl",
    about = "Start, stop and inspect the driver status detection program",
    version
)]
pub struct Cli {
    /// Config file (default ~/.dsctl/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error); overrides RUST_LOG
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the detection program
    Start {
        /// service: exec in place (systemd ExecStart); manual: run from a shell
        #[arg(value_enum, default_value_t = LaunchMode::Manual)]
        mode: LaunchMode,

        /// Manual mode: stay attached and wait for the program to exit
        #[arg(long)]
        foreground: bool,

        /// Manual mode: never hand over to the systemd unit
        #[arg(long)]
        direct: bool,

        /// Extra environment for the program (KEY=VALUE, repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_assignment)]
        env_vars: Vec<(String, String)>,
    },

    /// Stop the detection program
    Stop {
        /// Send SIGKILL without waiting
        #[arg(long)]
        force: bool,

        /// Seconds to wait after SIGTERM before SIGKILL
        #[arg(long, value_name = "SECS")]
        grace: Option<u64>,

        /// Never hand over to the systemd unit
        #[arg(long)]
        direct: bool,
    },

    /// Show whether the detection program is running
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stop, then start again
    Restart {
        #[arg(value_enum, default_value_t = LaunchMode::Manual)]
        mode: LaunchMode,

        #[arg(long)]
        foreground: bool,

        #[arg(long)]
        direct: bool,
    },
}

impl Cli {
    /// Parse the process arguments (clap handles errors and exits)
    pub fn parse_args() -> Self {
        Self::parse_args_from(std::env::args_os())
    }

    /// Try to parse arguments (for tests or custom argv)
    pub fn try_parse_args_from<I, T>(iter: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Cli::try_parse_from(iter)
    }

    pub fn parse_args_from<I, T>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        match Self::try_parse_args_from(iter) {
            Ok(cli) => cli,
            Err(err) => err.exit(),
        }
    }
}
