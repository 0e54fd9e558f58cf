//! Starting the detection program
//!
//! Three ways to run it:
//! - `service`: replace the launcher with the program (`exec`), for use as
//!   a unit's `ExecStart`; the exit code is the program's own
//! - `manual` (default): start it in the background with output appended
//!   to the log file, or hand over to the registered systemd unit
//! - `manual --foreground`: supervise it, forward signals, wait for exit

use crate::config::STARTUP_CHECK;
use crate::core::{process_table, CommandPattern};
use crate::error::{DsctlError, DsctlResult};
use crate::pidfile::{PidFile, PidLock, PidRecord};
use crate::platform;
use crate::service::ServiceManager;
use crate::signal;
use crate::utils::ResolvedLayout;
use crate::venv::Interpreter;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use tracing::{debug, info, warn};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// Run in place of the launcher (systemd ExecStart)
    Service,
    /// Run on demand from a shell
    #[default]
    Manual,
}

impl std::fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchMode::Service => f.write_str("service"),
            LaunchMode::Manual => f.write_str("manual"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub mode: LaunchMode,
    /// Manual mode: wait for the program instead of detaching
    pub foreground: bool,
    /// Manual mode: never hand over to the service manager
    pub direct: bool,
    /// Extra `KEY=VALUE` pairs for the child, on top of the configured ones
    pub extra_env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The registered unit was started instead
    Delegated {
        unit: String,
        status: Option<String>,
    },
    /// Detached program left running
    Background { pid: u32, log_file: PathBuf },
    /// Foreground program finished
    Exited { pid: u32, code: i32 },
}

pub struct Supervisor<'a, M: ServiceManager> {
    layout: &'a ResolvedLayout,
    service: &'a M,
    pid_file: PidFile,
}

impl<'a, M: ServiceManager> Supervisor<'a, M> {
    pub fn new(layout: &'a ResolvedLayout, service: &'a M) -> Self {
        Self {
            layout,
            service,
            pid_file: PidFile::new(&layout.pid_file),
        }
    }

    pub fn pattern(&self) -> CommandPattern {
        CommandPattern::new(&self.layout.entry_point)
    }

    pub async fn start(&self, options: &StartOptions) -> DsctlResult<StartOutcome> {
        if self.should_delegate(options) {
            return self.start_unit();
        }

        self.layout.validate()?;
        let interpreter = Interpreter::resolve(self.layout)?;
        let lock = self
            .pid_file
            .acquire(PidRecord::starting(options.mode), &self.pattern())?;
        // checked under the claim so a racing launcher cannot slip in between
        self.refuse_untracked_instance()?;

        match (options.mode, options.foreground) {
            (LaunchMode::Service, _) => Err(self.exec_in_place(&interpreter, options, lock)),
            (LaunchMode::Manual, false) => {
                self.spawn_background(&interpreter, options, lock).await
            }
            (LaunchMode::Manual, true) => self.run_foreground(&interpreter, options, lock).await,
        }
    }

    fn should_delegate(&self, options: &StartOptions) -> bool {
        options.mode == LaunchMode::Manual
            && !options.direct
            && self.layout.use_service_manager
            && self.service.is_registered(&self.layout.service_unit)
    }

    /// Instances started without a PID file (old scripts, a manual `python main.py`)
    fn refuse_untracked_instance(&self) -> DsctlResult<()> {
        match process_table::find_matching(&self.pattern()) {
            Ok(found) => match found.first() {
                Some(existing) => {
                    warn!(
                        pid = existing.pid,
                        cmd = %existing.command_line,
                        "detection program already running without a PID file"
                    );
                    Err(DsctlError::AlreadyRunning { pid: existing.pid })
                }
                None => Ok(()),
            },
            Err(err) => {
                warn!("process table lookup failed: {}", err);
                Ok(())
            }
        }
    }

    fn start_unit(&self) -> DsctlResult<StartOutcome> {
        let unit = self.layout.service_unit.clone();
        info!("{} is registered, starting it through systemd", unit);
        self.service.start(&unit)?;

        let status = match self.service.status(&unit) {
            Ok(text) => Some(text),
            Err(err) => {
                debug!("status after start failed: {}", err);
                None
            }
        };
        Ok(StartOutcome::Delegated { unit, status })
    }

    fn build_command(&self, interpreter: &Interpreter, options: &StartOptions) -> Command {
        let mut cmd = Command::new(interpreter.program());
        cmd.arg(&self.layout.entry_point);
        cmd.current_dir(&self.layout.app_dir);
        interpreter.apply(&mut cmd);
        cmd.envs(self.layout.env.iter().map(|(k, v)| (k, v)));
        cmd.envs(options.extra_env.iter().map(|(k, v)| (k, v)));
        cmd
    }

    fn command_line(&self, interpreter: &Interpreter) -> Vec<String> {
        vec![
            interpreter.program().to_string_lossy().into_owned(),
            self.layout.entry_point.to_string_lossy().into_owned(),
        ]
    }

    /// Replace the current process image; only returns on failure
    fn exec_in_place(
        &self,
        interpreter: &Interpreter,
        options: &StartOptions,
        mut lock: PidLock,
    ) -> DsctlError {
        // exec keeps our pid, so the record is final before the program starts
        if let Err(err) = lock.mark_running(std::process::id(), self.command_line(interpreter)) {
            return err.into();
        }

        let mut cmd = self.build_command(interpreter, options);
        info!(
            "exec {} {}",
            interpreter.program().display(),
            self.layout.entry_point.display()
        );
        let err = cmd.exec();

        // still here: exec failed and the lock drops with the PID file
        DsctlError::process(
            "Failed to exec detection program",
            interpreter.program().display().to_string(),
            Some(err),
        )
    }

    async fn spawn_background(
        &self,
        interpreter: &Interpreter,
        options: &StartOptions,
        mut lock: PidLock,
    ) -> DsctlResult<StartOutcome> {
        let log_file = self.layout.log_file.clone();
        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                DsctlError::filesystem(
                    "Cannot create log directory",
                    parent.display().to_string(),
                    Some(err),
                )
            })?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .map_err(|err| {
                DsctlError::filesystem(
                    "Cannot open log file",
                    log_file.display().to_string(),
                    Some(err),
                )
            })?;
        let log_err = log.try_clone()?;

        let mut cmd = self.build_command(interpreter, options);
        cmd.env("PYTHONUNBUFFERED", "1");
        cmd.stdin(Stdio::null()).stdout(log).stderr(log_err);
        platform::detach_command(&mut cmd);

        let mut child = cmd.spawn().map_err(|err| {
            DsctlError::process(
                "Failed to start detection program",
                interpreter.program().display().to_string(),
                Some(err),
            )
        })?;
        let pid = child.id();

        // catch programs that die on startup (bad venv, import errors)
        tokio::time::sleep(STARTUP_CHECK).await;
        if let Some(status) = child.try_wait()? {
            return Err(DsctlError::process(
                format!(
                    "Detection program exited during startup with code {}, see {}",
                    exit_code(status),
                    log_file.display()
                ),
                self.layout.entry_point.display().to_string(),
                None,
            ));
        }

        if let Err(err) = lock.mark_running(pid, self.command_line(interpreter)) {
            // never leave an untracked instance behind
            warn!("could not record pid {}, stopping it: {}", pid, err);
            stop_unrecorded(pid);
            return Err(err.into());
        }
        lock.persist();

        info!(pid, log = %log_file.display(), "detection program started in background");
        Ok(StartOutcome::Background { pid, log_file })
    }

    async fn run_foreground(
        &self,
        interpreter: &Interpreter,
        options: &StartOptions,
        mut lock: PidLock,
    ) -> DsctlResult<StartOutcome> {
        let mut cmd = self.build_command(interpreter, options);
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        platform::prepare_command(&mut cmd);

        let mut child = tokio::process::Command::from(cmd).spawn().map_err(|err| {
            DsctlError::process(
                "Failed to start detection program",
                interpreter.program().display().to_string(),
                Some(err),
            )
        })?;
        let pid = child
            .id()
            .ok_or_else(|| DsctlError::process("Child exited before it was tracked", "", None))?;

        let _guard = signal::install(pid)?;
        if let Err(err) = lock.mark_running(pid, self.command_line(interpreter)) {
            warn!("could not record pid {}: {}", pid, err);
        }
        info!(pid, "detection program running in foreground");

        let status = child.wait().await?;
        let code = exit_code(status);
        info!(pid, code, "detection program exited");
        Ok(StartOutcome::Exited { pid, code })
    }
}

/// Shell convention: signal deaths map to 128 + signal number
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// SIGTERM for a program whose PID could not be recorded
fn stop_unrecorded(pid: u32) {
    if let Err(errno) = platform::send_signal(pid, nix::sys::signal::Signal::SIGTERM) {
        warn!("pid={} SIGTERM failed, program left running: {}", pid, errno);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MockServiceManager;
    use crate::utils::{ConfigPaths, LauncherConfig};
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// App dir whose venv "python" is a shell stub running `main.py` as sh
    fn fixture(dir: &TempDir, program: &str) -> ResolvedLayout {
        let app = dir.path().join("app");
        let bin = app.join("venv").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let python = bin.join("python");
        std::fs::write(&python, "#!/bin/sh\nexec sh \"$@\"\n").unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(app.join("main.py"), program).unwrap();

        let config = LauncherConfig {
            app_dir: app.to_string_lossy().into_owned(),
            ..LauncherConfig::default()
        };
        let paths = ConfigPaths::with_dirs(dir.path().join("config"), dir.path().join("run"));
        config.resolve(&paths)
    }

    fn unregistered() -> MockServiceManager {
        let mut service = MockServiceManager::new();
        service.expect_is_registered().return_const(false);
        service
    }

    #[test]
    fn exit_code_maps_signals() {
        assert_eq!(exit_code(ExitStatus::from_raw(7 << 8)), 7);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGKILL)), 128 + libc::SIGKILL);
    }

    #[test]
    fn unrecorded_program_is_terminated() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        stop_unrecorded(child.id());
        assert_eq!(child.wait().unwrap().signal(), Some(libc::SIGTERM));

        // unsignallable pid: logged, not raised
        stop_unrecorded(0);
    }

    #[tokio::test]
    async fn manual_start_delegates_to_registered_unit() {
        let dir = TempDir::new().unwrap();
        let layout = fixture(&dir, "exit 0\n");

        let mut service = MockServiceManager::new();
        service.expect_is_registered().return_const(true);
        service.expect_start().times(1).returning(|_| Ok(()));
        service
            .expect_status()
            .returning(|_| Ok("Active: active (running)".to_string()));

        let outcome = Supervisor::new(&layout, &service)
            .start(&StartOptions::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StartOutcome::Delegated {
                unit: layout.service_unit.clone(),
                status: Some("Active: active (running)".to_string()),
            }
        );
        assert!(!layout.pid_file.exists());
    }

    #[tokio::test]
    #[serial(signal_handlers)]
    async fn direct_flag_skips_service_manager() {
        let dir = TempDir::new().unwrap();
        let layout = fixture(&dir, "exit 3\n");

        let mut service = MockServiceManager::new();
        service.expect_is_registered().never();
        service.expect_start().never();

        let options = StartOptions {
            foreground: true,
            direct: true,
            ..StartOptions::default()
        };
        let outcome = Supervisor::new(&layout, &service)
            .start(&options)
            .await
            .unwrap();
        assert!(matches!(outcome, StartOutcome::Exited { code: 3, .. }));
    }

    #[tokio::test]
    #[serial(signal_handlers)]
    async fn foreground_run_passes_env_and_releases_pid_file() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("env.out");
        let layout = fixture(
            &dir,
            &format!(
                "echo \"$DS_CAMERA_INDEX $VIRTUAL_ENV\" > '{}'\n",
                marker.display()
            ),
        );
        let service = unregistered();

        let options = StartOptions {
            foreground: true,
            extra_env: vec![("DS_CAMERA_INDEX".to_string(), "2".to_string())],
            ..StartOptions::default()
        };
        let outcome = Supervisor::new(&layout, &service)
            .start(&options)
            .await
            .unwrap();

        assert!(matches!(outcome, StartOutcome::Exited { code: 0, .. }));
        let written = std::fs::read_to_string(marker).unwrap();
        assert_eq!(
            written.trim(),
            format!("2 {}", layout.venv_dir.display())
        );
        assert!(!layout.pid_file.exists());
    }

    #[tokio::test]
    async fn background_start_records_pid_and_refuses_second_start() {
        let dir = TempDir::new().unwrap();
        let layout = fixture(&dir, "echo started\nsleep 30\n");
        let service = unregistered();
        let supervisor = Supervisor::new(&layout, &service);

        let outcome = supervisor.start(&StartOptions::default()).await.unwrap();
        let StartOutcome::Background { pid, .. } = outcome else {
            panic!("expected background start, got {:?}", outcome);
        };

        let record = PidFile::new(&layout.pid_file).read().unwrap().unwrap();
        assert_eq!(record.pid, pid);

        let second = supervisor.start(&StartOptions::default()).await;
        assert!(matches!(second, Err(DsctlError::AlreadyRunning { pid: p }) if p == pid));

        let report =
            platform::terminate_with_grace(&[pid], std::time::Duration::from_secs(2), false).await;
        assert!(report.all_stopped());
    }

    #[tokio::test]
    async fn instance_without_pid_file_blocks_start() {
        let dir = TempDir::new().unwrap();
        let layout = fixture(&dir, "while :; do sleep 1; done\n");
        let service = unregistered();

        // started the old way: relative entry point from the app dir
        let mut legacy = Command::new("sh")
            .arg("main.py")
            .current_dir(&layout.app_dir)
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let legacy_pid = legacy.id();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let result = Supervisor::new(&layout, &service)
            .start(&StartOptions::default())
            .await;
        let running: Vec<u32> = process_table::find_matching(&CommandPattern::new(&layout.entry_point))
            .unwrap()
            .into_iter()
            .map(|m| m.pid)
            .collect();

        legacy.kill().unwrap();
        legacy.wait().unwrap();

        assert!(matches!(result, Err(DsctlError::AlreadyRunning { pid }) if pid == legacy_pid));
        assert_eq!(running, vec![legacy_pid]);
        assert!(!layout.pid_file.exists());
    }

    #[tokio::test]
    async fn program_dying_on_startup_is_reported() {
        let dir = TempDir::new().unwrap();
        let layout = fixture(&dir, "echo 'ImportError: cv2' >&2\nexit 1\n");
        let service = unregistered();

        let err = Supervisor::new(&layout, &service)
            .start(&StartOptions::default())
            .await
            .unwrap_err();
        assert!(err.user_message().contains("code 1"));
        assert!(!layout.pid_file.exists());

        let log = std::fs::read_to_string(&layout.log_file).unwrap();
        assert!(log.contains("ImportError"));
    }

    #[tokio::test]
    async fn missing_entry_point_is_rejected_before_claiming() {
        let dir = TempDir::new().unwrap();
        let layout = fixture(&dir, "exit 0\n");
        std::fs::remove_file(&layout.entry_point).unwrap();
        let service = unregistered();

        let err = Supervisor::new(&layout, &service)
            .start(&StartOptions {
                direct: true,
                ..StartOptions::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Validation);
        assert!(!layout.pid_file.exists());
    }
}
