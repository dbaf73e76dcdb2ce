//! Process liveness and signalling.
//!
//! Unix hosts check with signal 0. Elsewhere a process counts as alive as
//! soon as the OS can find it; there is no permission distinction.

use std::io;

/// Outcome of asking a process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The signal was delivered.
    Sent,
    /// No such process.
    AlreadyGone,
    /// The process exists but belongs to another user.
    PermissionDenied,
}

#[cfg(unix)]
mod imp {
    use std::io;

    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    use super::Interrupt;

    fn pid_of(pid: u32) -> Option<Pid> {
        // 0 and negative values address process groups.
        i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
    }

    pub fn is_process_alive(pid: u32) -> bool {
        let Some(pid) = pid_of(pid) else {
            return false;
        };
        match kill(pid, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    pub fn interrupt(pid: u32) -> io::Result<Interrupt> {
        let Some(pid) = pid_of(pid) else {
            return Ok(Interrupt::AlreadyGone);
        };
        match kill(pid, Signal::SIGINT) {
            Ok(()) => Ok(Interrupt::Sent),
            Err(Errno::ESRCH) => Ok(Interrupt::AlreadyGone),
            Err(Errno::EPERM) => Ok(Interrupt::PermissionDenied),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::io;
    use std::process::{Command, Stdio};

    use super::Interrupt;

    pub fn is_process_alive(pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let output = Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
            .stderr(Stdio::null())
            .output();
        match output {
            Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")),
            Err(_) => false,
        }
    }

    pub fn interrupt(pid: u32) -> io::Result<Interrupt> {
        if !is_process_alive(pid) {
            return Ok(Interrupt::AlreadyGone);
        }
        let status = Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(Interrupt::Sent)
        } else if is_process_alive(pid) {
            Ok(Interrupt::PermissionDenied)
        } else {
            Ok(Interrupt::AlreadyGone)
        }
    }
}

/// Whether `pid` refers to a live process.
pub fn is_process_alive(pid: u32) -> bool {
    imp::is_process_alive(pid)
}

/// Ask `pid` to exit without waiting for it.
pub fn interrupt(pid: u32) -> io::Result<Interrupt> {
    imp::interrupt(pid)
}
