//! Signal forwarding for foreground runs
//!
//! The supervised child runs in its own process group, so terminal
//! signals only reach the launcher. While a [`SignalGuard`] is alive,
//! SIGINT, SIGTERM and SIGHUP received by the launcher are re-sent to
//! the child; the child decides how to shut down.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};

static CHILD_PID: AtomicI32 = AtomicI32::new(0);

const FORWARDED: [libc::c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGHUP];

pub struct SignalGuard {
    previous: Vec<(libc::c_int, libc::sigaction)>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        CHILD_PID.store(0, Ordering::SeqCst);
        for (signum, action) in &self.previous {
            unsafe {
                libc::sigaction(*signum, action, std::ptr::null_mut());
            }
        }
    }
}

/// Forward termination signals to `child_pid` until the guard drops
pub fn install(child_pid: u32) -> io::Result<SignalGuard> {
    let pid = i32::try_from(child_pid)
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid child pid"))?;
    CHILD_PID.store(pid, Ordering::SeqCst);

    let mut previous = Vec::with_capacity(FORWARDED.len());
    for signum in FORWARDED {
        match unsafe { replace_handler(signum) } {
            Ok(old) => previous.push((signum, old)),
            Err(err) => {
                // restore whatever was already swapped before bailing out
                drop(SignalGuard { previous });
                return Err(err);
            }
        }
    }

    Ok(SignalGuard { previous })
}

/// Install the forwarding handler for `signum`, returning the old action
unsafe fn replace_handler(signum: libc::c_int) -> io::Result<libc::sigaction> {
    extern "C" fn handler(signum: libc::c_int) {
        forward(signum);
    }

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_flags = libc::SA_RESTART;
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);

        let mut old: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(signum, &action, &mut old) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(old)
    }
}

// Runs in signal context: only async-signal-safe calls allowed
fn forward(signum: libc::c_int) {
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        unsafe {
            libc::kill(pid, signum);
        }
    }
}
