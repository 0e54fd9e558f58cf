//! Process table lookup
//!
//! Finds running instances of the detection program by their command
//! line, the way `pgrep -f` would. Used to cross-check PID file records
//! (PID reuse) and to find instances started without a PID file.

use psutil::process::Process;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessTableError {
    #[error("Failed to enumerate processes: {0}")]
    Enumerate(#[from] psutil::Error),
}

/// What a detection program command line looks like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPattern {
    entry_point: PathBuf,
}

impl CommandPattern {
    pub fn new(entry_point: impl Into<PathBuf>) -> Self {
        Self {
            entry_point: entry_point.into(),
        }
    }

    /// An argument names the entry point, either absolutely or relative
    /// to the process's working directory.
    pub fn matches(&self, argv: &[String], cwd: Option<&Path>) -> bool {
        argv.iter().any(|arg| {
            let arg = Path::new(arg);
            if arg == self.entry_point {
                return true;
            }
            if arg.is_absolute() {
                return false;
            }
            match cwd {
                Some(cwd) => same_path(&cwd.join(arg), &self.entry_point),
                None => false,
            }
        })
    }
}

fn same_path(left: &Path, right: &Path) -> bool {
    match (left.canonicalize(), right.canonicalize()) {
        (Ok(left), Ok(right)) => left == right,
        _ => left == right,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMatch {
    pub pid: u32,
    pub command_line: String,
}

/// Argument vector of `pid`, if readable
pub fn command_line(pid: u32) -> Option<Vec<String>> {
    let process = Process::new(pid).ok()?;
    process
        .cmdline_vec()
        .ok()
        .flatten()
        .filter(|argv| !argv.is_empty())
}

fn working_dir(pid: u32) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/cwd")).ok()
}

fn executable(pid: u32) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/exe")).ok()
}

/// Check that `pid` is a dsctl launcher
///
/// Same executable as the current process, or an `argv[0]` named
/// `dsctl` when the executable link is unreadable (other user).
pub fn is_launcher(pid: u32) -> bool {
    if let (Some(exe), Ok(own)) = (executable(pid), std::env::current_exe()) {
        if exe == own {
            return true;
        }
    }
    command_line(pid)
        .and_then(|argv| argv.into_iter().next())
        .is_some_and(|argv0| Path::new(&argv0).file_name() == Some(OsStr::new("dsctl")))
}

/// Check that `pid` is alive and still runs the detection program
pub fn is_instance(pid: u32, pattern: &CommandPattern) -> bool {
    match command_line(pid) {
        Some(argv) => pattern.matches(&argv, working_dir(pid).as_deref()),
        None => false,
    }
}

/// All processes other than the current one matching `pattern`
pub fn find_matching(pattern: &CommandPattern) -> Result<Vec<ProcessMatch>, ProcessTableError> {
    let own_pid = std::process::id();
    let mut found = Vec::new();

    for process in psutil::process::processes()? {
        // processes exit while we iterate; skip what we cannot read
        let Ok(process) = process else { continue };
        let pid = process.pid();
        if pid == own_pid {
            continue;
        }
        let Ok(Some(argv)) = process.cmdline_vec() else {
            continue;
        };
        if pattern.matches(&argv, working_dir(pid).as_deref()) {
            found.push(ProcessMatch {
                pid,
                command_line: argv.join(" "),
            });
        }
    }

    found.sort_by_key(|m| m.pid);
    Ok(found)
}
