//! Configuration paths and launcher settings
//!
//! Layout:
//! - persistent settings (`config.json`) live in ~/.dsctl/
//! - runtime state (PID file, logs) lives in <tmp>/.dsctl/

use crate::config::{
    APP_DIR_ENV, CONFIG_DIRECTORY, CONFIG_FILE_NAME, DEFAULT_APP_DIR, DEFAULT_ENTRY_POINT,
    DEFAULT_INTERPRETER, DEFAULT_SERVICE_UNIT, DEFAULT_STOP_GRACE, DEFAULT_VENV_DIR_NAME,
    ENTRY_ENV, LAUNCHER_LOG_FILE_NAME, LOG_FILE_NAME, MIN_STOP_GRACE, NO_SERVICE_ENV,
    PID_FILE_NAME, RUNTIME_DIR_ENV, STOP_GRACE_ENV, UNIT_ENV, VENV_ENV,
};
use crate::error::{DsctlError, DsctlResult};
use crate::utils::env::expand_env_var;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Launcher settings (read from config.json)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Application directory holding the entry point
    pub app_dir: String,
    /// Virtual environment directory (default `<app_dir>/venv`)
    pub venv_dir: Option<String>,
    /// Program started inside the application directory
    pub entry_point: String,
    /// Interpreter used when no virtual environment is present
    pub interpreter: String,
    pub service_unit: String,
    /// Delegate to the service manager when the unit is registered
    pub use_service_manager: bool,
    pub stop_grace_secs: u64,
    pub pid_file: Option<String>,
    pub log_file: Option<String>,
    /// Extra environment for the child (values may reference `${VAR}`)
    pub env: BTreeMap<String, String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            app_dir: DEFAULT_APP_DIR.to_string(),
            venv_dir: None,
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            interpreter: DEFAULT_INTERPRETER.to_string(),
            service_unit: DEFAULT_SERVICE_UNIT.to_string(),
            use_service_manager: true,
            stop_grace_secs: DEFAULT_STOP_GRACE.as_secs(),
            pid_file: None,
            log_file: None,
            env: BTreeMap::new(),
        }
    }
}

impl LauncherConfig {
    /// Load from a JSON file; a missing file yields the defaults
    pub fn load(config_file: &Path) -> DsctlResult<Self> {
        if !config_file.exists() {
            tracing::debug!(path = %config_file.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_file).map_err(|err| {
            DsctlError::filesystem(
                "Cannot read config file",
                config_file.display().to_string(),
                Some(err),
            )
        })?;

        serde_json::from_str(&content).map_err(|err| {
            DsctlError::config_with_source(
                format!("{} is not valid JSON", config_file.display()),
                err,
            )
        })
    }

    /// Apply `DSCTL_*` environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(APP_DIR_ENV) {
            self.app_dir = dir;
        }
        if let Ok(dir) = std::env::var(VENV_ENV) {
            self.venv_dir = Some(dir);
        }
        if let Ok(entry) = std::env::var(ENTRY_ENV) {
            self.entry_point = entry;
        }
        if let Ok(unit) = std::env::var(UNIT_ENV) {
            self.service_unit = unit;
        }
        if let Ok(value) = std::env::var(NO_SERVICE_ENV) {
            if is_truthy(&value) {
                self.use_service_manager = false;
            }
        }
        if let Ok(value) = std::env::var(STOP_GRACE_ENV) {
            match value.trim().parse::<u64>() {
                Ok(secs) => self.stop_grace_secs = secs,
                Err(_) => tracing::warn!(
                    "{}={} is not a number of seconds, keeping {}",
                    STOP_GRACE_ENV,
                    value,
                    self.stop_grace_secs
                ),
            }
        }
    }

    /// Resolve every path the launcher needs
    pub fn resolve(&self, paths: &ConfigPaths) -> ResolvedLayout {
        let app_dir = expand_path(&self.app_dir);
        let venv_dir = self
            .venv_dir
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| app_dir.join(DEFAULT_VENV_DIR_NAME));
        let entry_point = {
            let entry = expand_path(&self.entry_point);
            if entry.is_absolute() {
                entry
            } else {
                app_dir.join(entry)
            }
        };

        let env = self
            .env
            .iter()
            .map(|(key, value)| (key.clone(), expand_env_var(value)))
            .collect();

        ResolvedLayout {
            venv_dir,
            entry_point,
            interpreter: self.interpreter.clone(),
            service_unit: self.service_unit.clone(),
            use_service_manager: self.use_service_manager,
            stop_grace: Duration::from_secs(self.stop_grace_secs).max(MIN_STOP_GRACE),
            pid_file: self
                .pid_file
                .as_deref()
                .map(expand_path)
                .unwrap_or_else(|| paths.pid_file.clone()),
            log_file: self
                .log_file
                .as_deref()
                .map(expand_path)
                .unwrap_or_else(|| paths.log_file.clone()),
            env,
            app_dir,
        }
    }
}

/// Fully resolved launcher layout
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLayout {
    pub app_dir: PathBuf,
    pub venv_dir: PathBuf,
    pub entry_point: PathBuf,
    pub interpreter: String,
    pub service_unit: String,
    pub use_service_manager: bool,
    pub stop_grace: Duration,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub env: Vec<(String, String)>,
}

impl ResolvedLayout {
    /// Check the application directory and entry point exist
    pub fn validate(&self) -> DsctlResult<()> {
        if !self.app_dir.is_dir() {
            return Err(DsctlError::validation(
                format!("{} is not a directory", self.app_dir.display()),
                Some("app_dir"),
            ));
        }
        if !self.entry_point.is_file() {
            return Err(DsctlError::validation(
                format!("{} does not exist", self.entry_point.display()),
                Some("entry_point"),
            ));
        }
        Ok(())
    }
}

/// Configuration path set
pub struct ConfigPaths {
    /// Persistent settings directory (~/.dsctl/)
    pub config_dir: PathBuf,
    /// Runtime state directory (<tmp>/.dsctl/)
    pub runtime_dir: PathBuf,
    pub config_file: PathBuf,
    pub pid_file: PathBuf,
    /// Detection program output in background runs
    pub log_file: PathBuf,
    /// dsctl's own log
    pub launcher_log_file: PathBuf,
}

impl ConfigPaths {
    pub fn new() -> DsctlResult<Self> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| DsctlError::config("Cannot find home directory"))?;
        let runtime_dir = match std::env::var(RUNTIME_DIR_ENV) {
            Ok(dir) => expand_path(&dir),
            Err(_) => std::env::temp_dir().join(CONFIG_DIRECTORY),
        };
        Ok(Self::with_dirs(home_dir.join(CONFIG_DIRECTORY), runtime_dir))
    }

    pub fn with_dirs(config_dir: PathBuf, runtime_dir: PathBuf) -> Self {
        Self {
            config_file: config_dir.join(CONFIG_FILE_NAME),
            pid_file: runtime_dir.join(PID_FILE_NAME),
            log_file: runtime_dir.join(LOG_FILE_NAME),
            launcher_log_file: runtime_dir.join(LAUNCHER_LOG_FILE_NAME),
            config_dir,
            runtime_dir,
        }
    }

    pub fn ensure_dirs(&self) -> DsctlResult<()> {
        for dir in [&self.config_dir, &self.runtime_dir] {
            std::fs::create_dir_all(dir).map_err(|err| {
                DsctlError::filesystem(
                    "Cannot create directory",
                    dir.display().to_string(),
                    Some(err),
                )
            })?;
        }
        Ok(())
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
