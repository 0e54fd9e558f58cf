//! Handlers for start, stop, status and restart
//!
//! Each returns the process exit code for `main`.

use crate::config::MIN_STOP_GRACE;
use crate::error::DsctlResult;
use crate::service::{ServiceManager, Systemctl};
use crate::status;
use crate::stopper::{StopOptions, StopOutcome, Stopper};
use crate::supervisor::{StartOptions, StartOutcome, Supervisor};
use crate::utils::{ConfigPaths, LauncherConfig, ResolvedLayout};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Everything a command needs: resolved paths plus the service manager
pub struct Context<M: ServiceManager> {
    pub paths: ConfigPaths,
    pub layout: ResolvedLayout,
    pub service: M,
}

impl Context<Systemctl> {
    /// Config file, then `DSCTL_*` overrides, then resolution
    pub fn load(paths: ConfigPaths, config_override: Option<&Path>) -> DsctlResult<Self> {
        paths.ensure_dirs()?;

        let config_file = config_override.unwrap_or(&paths.config_file);
        let mut config = LauncherConfig::load(config_file)?;
        config.apply_env();
        let layout = config.resolve(&paths);
        debug!(?layout, "resolved layout");

        Ok(Self {
            paths,
            layout,
            service: Systemctl::detect(),
        })
    }
}

pub async fn handle_start<M: ServiceManager>(
    ctx: &Context<M>,
    options: &StartOptions,
) -> DsctlResult<u8> {
    let outcome = Supervisor::new(&ctx.layout, &ctx.service)
        .start(options)
        .await?;

    match outcome {
        StartOutcome::Delegated { unit, status } => {
            println!("✅ Started {} through systemd", unit);
            if let Some(text) = status {
                print!("{}", text);
            }
            Ok(0)
        }
        StartOutcome::Background { pid, log_file } => {
            println!("✅ Detection program started (pid {})", pid);
            println!("   Output: {}", log_file.display());
            Ok(0)
        }
        StartOutcome::Exited { code, .. } => Ok(clamp_exit_code(code)),
    }
}

pub async fn handle_stop<M: ServiceManager>(
    ctx: &Context<M>,
    options: &StopOptions,
) -> DsctlResult<u8> {
    let outcome = Stopper::new(&ctx.layout, &ctx.service).stop(options).await?;

    match outcome {
        StopOutcome::Delegated { unit, status } => {
            println!("✅ Stopped {} through systemd", unit);
            if let Some(text) = status {
                print!("{}", text);
            }
            Ok(0)
        }
        StopOutcome::NotRunning => {
            println!("Detection process not found, nothing to stop");
            Ok(0)
        }
        StopOutcome::Stopped(report) => {
            for pid in &report.terminated {
                println!("✅ Stopped pid {}", pid);
            }
            for pid in &report.killed {
                println!("⚠️  Killed pid {} (did not exit after SIGTERM)", pid);
            }
            for pid in &report.failed {
                eprintln!("❌ pid {} is still running", pid);
            }
            if report.all_stopped() {
                Ok(0)
            } else {
                Ok(1)
            }
        }
    }
}

pub fn handle_status<M: ServiceManager>(ctx: &Context<M>, json: bool) -> DsctlResult<u8> {
    let report = status::collect(&ctx.layout, &ctx.service);
    if json {
        let text = serde_json::to_string_pretty(&report).map_err(|err| {
            crate::error::DsctlError::config_with_source("Cannot serialize status", err)
        })?;
        println!("{}", text);
    } else {
        report.print();
    }
    Ok(0)
}

pub async fn handle_restart<M: ServiceManager>(
    ctx: &Context<M>,
    options: &StartOptions,
) -> DsctlResult<u8> {
    let stop = StopOptions {
        direct: options.direct,
        ..StopOptions::default()
    };
    let code = handle_stop(ctx, &stop).await?;
    if code != 0 {
        return Ok(code);
    }
    handle_start(ctx, options).await
}

/// `--grace` never goes below the minimum poll window
pub fn grace_from_secs(secs: Option<u64>) -> Option<Duration> {
    secs.map(|secs| Duration::from_secs(secs).max(MIN_STOP_GRACE))
}

fn clamp_exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
