use std::time::Duration;

pub const DEFAULT_APP_DIR: &str = "/home/pi/driver-status-detection";
pub const DEFAULT_VENV_DIR_NAME: &str = "venv";
pub const DEFAULT_ENTRY_POINT: &str = "main.py";
pub const DEFAULT_INTERPRETER: &str = "python3";
pub const DEFAULT_SERVICE_UNIT: &str = "driver-status-detection.service";

// Persistent settings live under ~/.dsctl, runtime state under <tmp>/.dsctl
pub const CONFIG_DIRECTORY: &str = ".dsctl";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const PID_FILE_NAME: &str = "dsctl.pid";
pub const LOG_FILE_NAME: &str = "detection.log";
pub const LAUNCHER_LOG_FILE_NAME: &str = "dsctl.log";

pub const APP_DIR_ENV: &str = "DSCTL_APP_DIR";
pub const VENV_ENV: &str = "DSCTL_VENV";
pub const ENTRY_ENV: &str = "DSCTL_ENTRY";
pub const UNIT_ENV: &str = "DSCTL_UNIT";
pub const NO_SERVICE_ENV: &str = "DSCTL_NO_SERVICE";
pub const STOP_GRACE_ENV: &str = "DSCTL_STOP_GRACE_SECS";
pub const RUNTIME_DIR_ENV: &str = "DSCTL_RUNTIME_DIR";
pub const SYSTEMCTL_ENV: &str = "DSCTL_SYSTEMCTL";

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);
pub const MIN_STOP_GRACE: Duration = Duration::from_secs(1);
pub const TERMINATION_POLL_INTERVAL: Duration = Duration::from_millis(100);
// Time to wait for the kernel to reap a process after SIGKILL
pub const KILL_SETTLE: Duration = Duration::from_millis(500);
// A background program still alive after this long counts as started
pub const STARTUP_CHECK: Duration = Duration::from_millis(300);
// A launcher's claim older than this was abandoned (launcher killed mid-start)
pub const STARTING_CLAIM_TIMEOUT: Duration = Duration::from_secs(30);
