//! Unified error handling for dsctl
//!
//! Module-level errors (`PidFileError`, `ServiceError`) convert into
//! [`DsctlError`], which carries a category and a user-facing message.

use crate::pidfile::PidFileError;
use crate::service::ServiceError;
use std::fmt;
use std::io;
use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum DsctlError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Filesystem errors
    #[error("Filesystem error: {message} (path: {path})")]
    Filesystem {
        message: String,
        path: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Process management errors
    #[error("Process error: {message}")]
    Process {
        message: String,
        command: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Service manager errors
    #[error("Service manager error: {message} (unit: {unit})")]
    Service {
        message: String,
        unit: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// A live instance already owns the PID file
    #[error("Detection program already running (pid {pid})")]
    AlreadyRunning { pid: u32 },
}

pub type DsctlResult<T> = Result<T, DsctlError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Config,
    Filesystem,
    Process,
    Service,
    Validation,
}

impl ErrorCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            ErrorCategory::Config => "Configuration",
            ErrorCategory::Filesystem => "Filesystem",
            ErrorCategory::Process => "Process",
            ErrorCategory::Service => "Service manager",
            ErrorCategory::Validation => "Validation",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl DsctlError {
    pub fn config(message: impl Into<String>) -> Self {
        DsctlError::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DsctlError::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn filesystem(
        message: impl Into<String>,
        path: impl Into<String>,
        source: Option<io::Error>,
    ) -> Self {
        DsctlError::Filesystem {
            message: message.into(),
            path: path.into(),
            source: source.map(|err| Box::new(err) as BoxedSource),
        }
    }

    pub fn process(
        message: impl Into<String>,
        command: impl Into<String>,
        source: Option<io::Error>,
    ) -> Self {
        DsctlError::Process {
            message: message.into(),
            command: command.into(),
            source: source.map(|err| Box::new(err) as BoxedSource),
        }
    }

    pub fn validation(message: impl Into<String>, field: Option<&str>) -> Self {
        DsctlError::Validation {
            message: message.into(),
            field: field.map(str::to_string),
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            DsctlError::Config { .. } => ErrorCategory::Config,
            DsctlError::Filesystem { .. } => ErrorCategory::Filesystem,
            DsctlError::Process { .. } | DsctlError::AlreadyRunning { .. } => {
                ErrorCategory::Process
            }
            DsctlError::Service { .. } => ErrorCategory::Service,
            DsctlError::Validation { .. } => ErrorCategory::Validation,
        }
    }

    /// Process exit code for this error
    ///
    /// A failed `systemctl` passes its own exit code through.
    pub fn exit_code(&self) -> u8 {
        if let DsctlError::Service {
            source: Some(source),
            ..
        } = self
        {
            if let Some(ServiceError::Failed {
                code: Some(code), ..
            }) = source.downcast_ref::<ServiceError>()
            {
                if let Ok(code) = u8::try_from(*code) {
                    if code != 0 {
                        return code;
                    }
                }
            }
        }
        1
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            DsctlError::Config { message, .. } => {
                format!("Configuration problem: {}", message)
            }
            DsctlError::Filesystem { message, path, .. } => {
                format!("{} ({})", message, path)
            }
            DsctlError::Process {
                message, command, ..
            } => {
                if command.is_empty() {
                    message.clone()
                } else {
                    format!("{}: {}", message, command)
                }
            }
            DsctlError::Service { message, unit, .. } => {
                format!("{} failed for {}", message, unit)
            }
            DsctlError::Validation { message, field } => match field {
                Some(field) => format!("Invalid {}: {}", field, message),
                None => message.clone(),
            },
            DsctlError::AlreadyRunning { pid } => format!(
                "Detection program is already running (pid {}). Run 'dsctl stop' first.",
                pid
            ),
        }
    }
}

impl From<io::Error> for DsctlError {
    fn from(err: io::Error) -> Self {
        DsctlError::Process {
            message: err.to_string(),
            command: String::new(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<PidFileError> for DsctlError {
    fn from(err: PidFileError) -> Self {
        match err {
            PidFileError::AlreadyRunning(pid) => DsctlError::AlreadyRunning { pid },
            PidFileError::Io { ref path, .. } | PidFileError::Malformed { ref path, .. } => {
                let path = path.display().to_string();
                DsctlError::Filesystem {
                    message: "PID file access failed".to_string(),
                    path,
                    source: Some(Box::new(err)),
                }
            }
        }
    }
}

impl From<ServiceError> for DsctlError {
    fn from(err: ServiceError) -> Self {
        let (message, unit) = match &err {
            ServiceError::Spawn { action, unit, .. } => {
                (format!("systemctl {}", action), unit.clone())
            }
            ServiceError::Failed { action, unit, .. } => {
                (format!("systemctl {}", action), unit.clone())
            }
        };
        DsctlError::Service {
            message,
            unit,
            source: Some(Box::new(err)),
        }
    }
}
