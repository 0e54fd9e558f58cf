//! Stopping the detection program

use crate::core::process_table::{self, CommandPattern};
use crate::error::DsctlResult;
use crate::pidfile::{PidFile, PidState};
use crate::platform::{self, TerminationReport};
use crate::service::ServiceManager;
use crate::utils::ResolvedLayout;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct StopOptions {
    /// SIGKILL straight away
    pub force: bool,
    /// Override the configured grace period
    pub grace: Option<Duration>,
    /// Never hand over to the service manager
    pub direct: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The registered unit was stopped instead
    Delegated {
        unit: String,
        status: Option<String>,
    },
    NotRunning,
    Stopped(TerminationReport),
}

pub struct Stopper<'a, M: ServiceManager> {
    layout: &'a ResolvedLayout,
    service: &'a M,
    pid_file: PidFile,
}

impl<'a, M: ServiceManager> Stopper<'a, M> {
    pub fn new(layout: &'a ResolvedLayout, service: &'a M) -> Self {
        Self {
            layout,
            service,
            pid_file: PidFile::new(&layout.pid_file),
        }
    }

    pub async fn stop(&self, options: &StopOptions) -> DsctlResult<StopOutcome> {
        if !options.direct
            && self.layout.use_service_manager
            && self.service.is_registered(&self.layout.service_unit)
        {
            return self.stop_unit();
        }

        let targets = self.targets();
        if targets.is_empty() {
            self.release_pid_file();
            return Ok(StopOutcome::NotRunning);
        }

        let grace = options.grace.unwrap_or(self.layout.stop_grace);
        info!(?targets, force = options.force, "stopping detection program");
        let report = platform::terminate_with_grace(&targets, grace, options.force).await;

        if report.all_stopped() {
            self.release_pid_file();
        } else {
            warn!(failed = ?report.failed, "some processes survived SIGKILL");
        }
        Ok(StopOutcome::Stopped(report))
    }

    fn stop_unit(&self) -> DsctlResult<StopOutcome> {
        let unit = self.layout.service_unit.clone();
        info!("{} is registered, stopping it through systemd", unit);
        self.service.stop(&unit)?;

        // best effort: a unit that stopped cleanly may report non-zero here
        let status = match self.service.status(&unit) {
            Ok(text) => Some(text),
            Err(err) => {
                debug!("status after stop failed: {}", err);
                None
            }
        };
        Ok(StopOutcome::Delegated { unit, status })
    }

    /// PIDs to signal: the PID file's program plus command-line matches
    pub fn targets(&self) -> Vec<u32> {
        let pattern = CommandPattern::new(&self.layout.entry_point);
        let mut targets = Vec::new();

        if let Some(record) = self.pid_file.live_record(&pattern) {
            match record.state {
                PidState::Running => targets.push(record.pid),
                PidState::Starting => debug!(
                    launcher = record.launcher_pid,
                    "a launcher is still starting the program"
                ),
            }
        }

        match process_table::find_matching(&pattern) {
            Ok(matches) => {
                for found in matches {
                    if !targets.contains(&found.pid) {
                        debug!(pid = found.pid, cmd = %found.command_line, "found by command line");
                        targets.push(found.pid);
                    }
                }
            }
            Err(err) => warn!("process table lookup failed: {}", err),
        }

        targets
    }

    fn release_pid_file(&self) {
        let pattern = CommandPattern::new(&self.layout.entry_point);
        // leave a file that a concurrent launch has just claimed
        if self.pid_file.live_record(&pattern).is_some() {
            return;
        }
        if let Err(err) = self.pid_file.release() {
            warn!("failed to remove PID file: {}", err);
        }
    }
}
