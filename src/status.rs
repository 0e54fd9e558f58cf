//! Status report
//!
//! Sources are consulted in order of trust: the PID file, then the
//! process table, then the service manager.

use crate::core::process_table::{self, CommandPattern};
use crate::pidfile::{PidFile, PidState};
use crate::service::ServiceManager;
use crate::supervisor::LaunchMode;
use crate::utils::{format_uptime, ResolvedLayout};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Starting,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    PidFile,
    ProcessTable,
    ServiceManager,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub state: RunState,
    pub pid: Option<u32>,
    pub source: Option<StatusSource>,
    pub mode: Option<LaunchMode>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<i64>,
    /// Matching processes not tracked by the PID file
    pub untracked: Vec<u32>,
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_status: Option<String>,
}

impl StatusReport {
    fn stopped() -> Self {
        Self {
            state: RunState::Stopped,
            pid: None,
            source: None,
            mode: None,
            started_at: None,
            uptime_secs: None,
            untracked: Vec::new(),
            unit: None,
            unit_status: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state != RunState::Stopped
    }

    pub fn print(&self) {
        match (self.state, self.pid) {
            (RunState::Running, Some(pid)) => {
                println!("● detection program running (pid {})", pid)
            }
            (RunState::Running, None) => println!("● detection program running"),
            (RunState::Starting, _) => println!("◌ detection program starting"),
            (RunState::Stopped, _) => println!("○ detection program not running"),
        }

        if let Some(source) = self.source {
            let source = match source {
                StatusSource::PidFile => "PID file",
                StatusSource::ProcessTable => "process table",
                StatusSource::ServiceManager => "service manager",
            };
            println!("  Source:  {}", source);
        }
        if let Some(mode) = self.mode {
            println!("  Mode:    {}", mode);
        }
        if let Some(started_at) = self.started_at {
            println!("  Started: {}", started_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        if let Some(uptime) = self.uptime_secs {
            println!("  Uptime:  {}", format_uptime(chrono::Duration::seconds(uptime)));
        }
        if !self.untracked.is_empty() {
            println!("  ⚠️  untracked instances: {:?}", self.untracked);
        }
        if let Some(unit) = &self.unit {
            println!("  Unit:    {}", unit);
        }
        if let Some(text) = &self.unit_status {
            println!();
            print!("{}", text);
        }
    }
}

pub fn collect<M: ServiceManager>(layout: &ResolvedLayout, service: &M) -> StatusReport {
    let pattern = CommandPattern::new(&layout.entry_point);
    let mut report = StatusReport::stopped();

    let matches = match process_table::find_matching(&pattern) {
        Ok(matches) => matches.into_iter().map(|m| m.pid).collect::<Vec<_>>(),
        Err(err) => {
            warn!("process table lookup failed: {}", err);
            Vec::new()
        }
    };

    if let Some(record) = PidFile::new(&layout.pid_file).live_record(&pattern) {
        report.state = match record.state {
            PidState::Running => RunState::Running,
            PidState::Starting => RunState::Starting,
        };
        report.pid = Some(record.pid);
        report.source = Some(StatusSource::PidFile);
        report.mode = Some(record.mode);
        report.started_at = Some(record.started_at);
        report.uptime_secs = Some((Utc::now() - record.started_at).num_seconds());
        report.untracked = matches.into_iter().filter(|pid| *pid != record.pid).collect();
    } else if let Some((&first, rest)) = matches.split_first() {
        report.state = RunState::Running;
        report.pid = Some(first);
        report.source = Some(StatusSource::ProcessTable);
        report.untracked = rest.to_vec();
    }

    if layout.use_service_manager && service.is_registered(&layout.service_unit) {
        report.unit = Some(layout.service_unit.clone());
        match service.status(&layout.service_unit) {
            Ok(text) => {
                if !report.is_running() && unit_is_active(&text) {
                    report.state = RunState::Running;
                    report.pid = main_pid(&text);
                    report.source = Some(StatusSource::ServiceManager);
                }
                report.unit_status = Some(text);
            }
            Err(err) => warn!("unit status unavailable: {}", err),
        }
    }

    report
}

fn unit_is_active(status: &str) -> bool {
    status
        .lines()
        .any(|line| line.trim_start().starts_with("Active: active"))
}

/// `Main PID: 1234 (python)` -> 1234
fn main_pid(status: &str) -> Option<u32> {
    status.lines().find_map(|line| {
        line.trim_start()
            .strip_prefix("Main PID:")
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|pid| pid.parse().ok())
    })
}
