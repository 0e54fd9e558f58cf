//! Service manager passthrough
//!
//! When the detection program is registered as a systemd unit, `start`
//! and `stop` hand over to `systemctl` instead of managing the process
//! directly.

use crate::config::SYSTEMCTL_ENV;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Output};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to run systemctl {action} {unit}: {source}")]
    Spawn {
        action: String,
        unit: String,
        #[source]
        source: io::Error,
    },
    #[error("systemctl {action} {unit} exited with {code:?}: {stderr}")]
    Failed {
        action: String,
        unit: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[cfg_attr(test, mockall::automock)]
pub trait ServiceManager {
    /// Whether a unit file with this name is installed
    fn is_registered(&self, unit: &str) -> bool;
    fn start(&self, unit: &str) -> Result<(), ServiceError>;
    fn stop(&self, unit: &str) -> Result<(), ServiceError>;
    /// Human-readable status text
    fn status(&self, unit: &str) -> Result<String, ServiceError>;
}

/// `systemctl`-backed service manager
#[derive(Debug, Clone)]
pub struct Systemctl {
    program: Option<PathBuf>,
}

impl Systemctl {
    /// Locate `systemctl` (`DSCTL_SYSTEMCTL` overrides the PATH lookup)
    pub fn detect() -> Self {
        let program = match std::env::var_os(SYSTEMCTL_ENV) {
            Some(path) => Some(PathBuf::from(path)),
            None => which::which("systemctl").ok(),
        };
        if program.is_none() {
            debug!("systemctl not found, service manager integration disabled");
        }
        Self { program }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    pub fn unavailable() -> Self {
        Self { program: None }
    }

    pub fn is_available(&self) -> bool {
        self.program.is_some()
    }

    fn run(&self, action: &str, unit: &str, extra: &[&str]) -> Result<Output, ServiceError> {
        let program = self.program.as_ref().ok_or_else(|| ServiceError::Spawn {
            action: action.to_string(),
            unit: unit.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "systemctl not available"),
        })?;

        debug!("systemctl {} {} {:?}", action, unit, extra);
        Command::new(program)
            .arg(action)
            .arg(unit)
            .args(extra)
            .output()
            .map_err(|source| ServiceError::Spawn {
                action: action.to_string(),
                unit: unit.to_string(),
                source,
            })
    }

    fn run_checked(&self, action: &str, unit: &str) -> Result<(), ServiceError> {
        let output = self.run(action, unit, &[])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ServiceError::Failed {
                action: action.to_string(),
                unit: unit.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl ServiceManager for Systemctl {
    fn is_registered(&self, unit: &str) -> bool {
        if !self.is_available() {
            return false;
        }
        let unit = normalize_unit(unit);
        match self.run("list-unit-files", &unit, &["--no-legend", "--no-pager"]) {
            Ok(output) => {
                output.status.success()
                    && String::from_utf8_lossy(&output.stdout)
                        .lines()
                        .any(|line| line.split_whitespace().next() == Some(unit.as_str()))
            }
            Err(err) => {
                debug!("unit lookup failed: {}", err);
                false
            }
        }
    }

    fn start(&self, unit: &str) -> Result<(), ServiceError> {
        self.run_checked("start", &normalize_unit(unit))
    }

    fn stop(&self, unit: &str) -> Result<(), ServiceError> {
        self.run_checked("stop", &normalize_unit(unit))
    }

    fn status(&self, unit: &str) -> Result<String, ServiceError> {
        // `status` exits 3 for an inactive unit and still prints useful output
        let output = self.run("status", &normalize_unit(unit), &["--no-pager"])?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// `driver-status-detection` -> `driver-status-detection.service`
pub fn normalize_unit(unit: &str) -> String {
    if unit.contains('.') {
        unit.to_string()
    } else {
        format!("{}.service", unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Fake systemctl that logs its arguments and knows one unit
    fn fake_systemctl(dir: &TempDir, stop_exit: i32) -> (PathBuf, PathBuf) {
        let log = dir.path().join("calls.log");
        let script = dir.path().join("systemctl");
        let body = format!(
            "#!/bin/sh\n\
             echo \"$@\" >> '{log}'\n\
             case \"$1\" in\n\
               list-unit-files) [ \"$2\" = demo.service ] && echo 'demo.service enabled enabled'; exit 0 ;;\n\
               stop) echo 'stop failed' >&2; exit {stop_exit} ;;\n\
               status) echo 'demo.service - Demo'; echo '   Active: inactive (dead)'; exit 3 ;;\n\
             esac\n\
             exit 0\n",
            log = log.display(),
            stop_exit = stop_exit,
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    #[test]
    fn normalize_appends_service_suffix() {
        assert_eq!(normalize_unit("demo"), "demo.service");
        assert_eq!(normalize_unit("demo.service"), "demo.service");
        assert_eq!(normalize_unit("demo.timer"), "demo.timer");
    }

    #[test]
    fn unavailable_manager_has_no_units() {
        assert!(!Systemctl::unavailable().is_registered("demo.service"));
    }

    #[test]
    fn registered_unit_is_detected() {
        let dir = TempDir::new().unwrap();
        let (script, _) = fake_systemctl(&dir, 0);
        let systemctl = Systemctl::with_program(script);

        assert!(systemctl.is_registered("demo"));
        assert!(!systemctl.is_registered("other.service"));
    }

    #[test]
    fn start_and_status_pass_through() {
        let dir = TempDir::new().unwrap();
        let (script, log) = fake_systemctl(&dir, 0);
        let systemctl = Systemctl::with_program(script);

        systemctl.start("demo").unwrap();
        let status = systemctl.status("demo").unwrap();
        assert!(status.contains("inactive"));

        let calls = std::fs::read_to_string(log).unwrap();
        assert!(calls.contains("start demo.service"));
        assert!(calls.contains("status demo.service --no-pager"));
    }

    #[test]
    fn failed_stop_reports_exit_code_and_stderr() {
        let dir = TempDir::new().unwrap();
        let (script, _) = fake_systemctl(&dir, 5);
        let systemctl = Systemctl::with_program(script);

        match systemctl.stop("demo.service") {
            Err(ServiceError::Failed { code, stderr, .. }) => {
                assert_eq!(code, Some(5));
                assert_eq!(stderr, "stop failed");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
