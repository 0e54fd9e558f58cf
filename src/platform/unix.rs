use crate::config::{KILL_SETTLE, TERMINATION_POLL_INTERVAL};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use psutil::process::{Process, Status};
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Put a supervised child in its own process group
///
/// Terminal Ctrl-C then reaches only the launcher, which forwards it.
/// On Linux the child also receives SIGTERM if the launcher dies.
pub fn prepare_command(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if set_process_group() != 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                if set_parent_death_signal() != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }
}

/// Start the child in a new session so it outlives the launcher's terminal
pub fn detach_command(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Check if process is alive
///
/// EPERM means the process exists but belongs to someone else. A zombie
/// has exited and only waits to be reaped, so it counts as dead.
pub fn process_alive(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    let exists = match kill(target, None) {
        Ok(()) => true,
        Err(errno) => errno == Errno::EPERM,
    };
    exists && !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    Process::new(pid)
        .and_then(|process| process.status())
        .map(|status| matches!(status, Status::Zombie))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    /// The process had already exited
    Gone,
}

pub fn send_signal(pid: u32, signal: Signal) -> Result<SignalOutcome, Errno> {
    let target = to_pid(pid).ok_or(Errno::EINVAL)?;
    match kill(target, signal) {
        Ok(()) => {
            debug!("pid={} sent {}", pid, signal);
            Ok(SignalOutcome::Delivered)
        }
        Err(Errno::ESRCH) => Ok(SignalOutcome::Gone),
        Err(errno) => Err(errno),
    }
}

/// Result of a SIGTERM/SIGKILL escalation over a set of processes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// Exited after SIGTERM (or were already gone)
    pub terminated: Vec<u32>,
    /// Needed SIGKILL
    pub killed: Vec<u32>,
    /// Still alive, or could not be signalled
    pub failed: Vec<u32>,
}

impl TerminationReport {
    pub fn all_stopped(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Terminate processes
///
/// SIGTERM every pid, poll until they are gone or `grace` elapses, then
/// SIGKILL the survivors. With `force` the SIGTERM phase is skipped.
pub async fn terminate_with_grace(pids: &[u32], grace: Duration, force: bool) -> TerminationReport {
    let mut report = TerminationReport::default();
    let mut pending: Vec<u32> = Vec::new();

    if force {
        pending.extend_from_slice(pids);
    } else {
        for &pid in pids {
            match send_signal(pid, Signal::SIGTERM) {
                Ok(SignalOutcome::Delivered) => pending.push(pid),
                Ok(SignalOutcome::Gone) => report.terminated.push(pid),
                Err(errno) => {
                    warn!("pid={} SIGTERM failed: {}", pid, errno);
                    report.failed.push(pid);
                }
            }
        }

        let deadline = Instant::now() + grace;
        while !pending.is_empty() && Instant::now() < deadline {
            sleep(TERMINATION_POLL_INTERVAL).await;
            pending.retain(|&pid| {
                if process_alive(pid) {
                    true
                } else {
                    report.terminated.push(pid);
                    false
                }
            });
        }
    }

    if pending.is_empty() {
        return report;
    }

    for &pid in &pending {
        match send_signal(pid, Signal::SIGKILL) {
            Ok(SignalOutcome::Delivered) => {}
            Ok(SignalOutcome::Gone) => {}
            Err(errno) => warn!("pid={} SIGKILL failed: {}", pid, errno),
        }
    }

    let deadline = Instant::now() + KILL_SETTLE;
    loop {
        let still_alive = pending.iter().any(|&pid| process_alive(pid));
        if !still_alive || Instant::now() >= deadline {
            break;
        }
        sleep(TERMINATION_POLL_INTERVAL).await;
    }

    for pid in pending {
        if process_alive(pid) {
            report.failed.push(pid);
        } else {
            report.killed.push(pid);
        }
    }

    report
}

fn to_pid(pid: u32) -> Option<Pid> {
    // pid 0 and negative values address process groups, never a single process
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}

/// Encapsulates unsafe setpgid call
unsafe fn set_process_group() -> libc::c_int {
    unsafe { libc::setpgid(0, 0) }
}

/// Encapsulates unsafe prctl call
#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> libc::c_int {
    unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn spawn_sleeper(script: &str) -> std::process::Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn sh")
    }

    #[test]
    fn current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn group_addresses_are_never_alive() {
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
    }

    #[tokio::test]
    async fn sigterm_stops_cooperative_process() {
        let mut child = spawn_sleeper("sleep 30");
        let pid = child.id();

        // reap in the background so the pid does not linger as a zombie
        let reaper = std::thread::spawn(move || child.wait());

        let report = terminate_with_grace(&[pid], Duration::from_secs(3), false).await;
        assert_eq!(report.terminated, vec![pid]);
        assert!(report.killed.is_empty());
        assert!(report.all_stopped());
        let _ = reaper.join();
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_after_grace() {
        let mut child = spawn_sleeper("trap '' TERM; while :; do sleep 1; done");
        let pid = child.id();
        // give the shell time to install the trap
        sleep(Duration::from_millis(200)).await;

        let reaper = std::thread::spawn(move || child.wait());

        let report = terminate_with_grace(&[pid], Duration::from_secs(1), false).await;
        assert_eq!(report.killed, vec![pid]);
        assert!(report.all_stopped());
        let _ = reaper.join();
    }

    #[test]
    fn unreaped_child_is_not_alive() {
        let mut child = spawn_sleeper("exit 0");
        let pid = child.id();
        std::thread::sleep(Duration::from_millis(200));

        assert!(!process_alive(pid));
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn vanished_pid_counts_as_terminated() {
        let mut child = spawn_sleeper("exit 0");
        let pid = child.id();
        child.wait().unwrap();

        let report = terminate_with_grace(&[pid], Duration::from_secs(1), false).await;
        assert_eq!(report.terminated, vec![pid]);
    }
}
