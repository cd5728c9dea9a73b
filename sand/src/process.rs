//! Process bookkeeping on top of fork, kill and waitpid

use crate::errors::SandError;
use std::io;

pub type Pid = libc::pid_t;

/// What a non-blocking wait tells us about a child
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessState {
    /// no state change yet
    Running,
    /// reaped just now, with its exit code
    Exited(i32),
    /// already reaped or never ours
    Gone,
}

impl ProcessState {
    pub fn is_alive(self) -> bool {
        self == ProcessState::Running
    }
}

/// Exit code of a raw wait status, negative signal number when killed
pub fn exit_code(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        -libc::WTERMSIG(status)
    } else {
        status
    }
}

/// waitpid that retries on EINTR; `None` means nothing changed state
pub fn waitpid(pid: Pid, flags: libc::c_int) -> io::Result<Option<(Pid, i32)>> {
    let mut status: libc::c_int = 0;
    loop {
        let result = unsafe { libc::waitpid(pid, &mut status, flags) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(if result == 0 {
            None
        } else {
            Some((result, exit_code(status)))
        });
    }
}

fn classify(pid: Pid, err: io::Error) -> Result<ProcessState, SandError> {
    match err.raw_os_error() {
        Some(libc::ECHILD) | Some(libc::ESRCH) => Ok(ProcessState::Gone),
        Some(libc::EPERM) => Err(SandError::ProcessPermission(pid)),
        _ => {
            log::error!("unexpected error while checking process {}: {}", pid, err);
            Err(SandError::ProcessError { pid, source: err })
        }
    }
}

/// Check a child without blocking
pub fn check(pid: Pid) -> Result<ProcessState, SandError> {
    match waitpid(pid, libc::WNOHANG) {
        Ok(None) => Ok(ProcessState::Running),
        Ok(Some((_, code))) => Ok(ProcessState::Exited(code)),
        Err(err) => classify(pid, err),
    }
}

/// Block until a child exits
pub fn wait(pid: Pid) -> Result<ProcessState, SandError> {
    match waitpid(pid, 0) {
        Ok(Some((_, code))) => Ok(ProcessState::Exited(code)),
        Ok(None) => Ok(ProcessState::Running),
        Err(err) => classify(pid, err),
    }
}

/// Send a signal; a process that is already gone is not an error
pub fn signal(pid: Pid, signal: libc::c_int) -> Result<ProcessState, SandError> {
    if unsafe { libc::kill(pid, signal) } < 0 {
        classify(pid, io::Error::last_os_error())
    } else {
        Ok(ProcessState::Running)
    }
}

/// Signal every process in the group led by `pid`
pub fn signal_group(pid: Pid, signal: libc::c_int) -> Result<ProcessState, SandError> {
    if unsafe { libc::kill(-pid, signal) } < 0 {
        classify(pid, io::Error::last_os_error())
    } else {
        Ok(ProcessState::Running)
    }
}

/// Move `pid` (0 for the caller) into a process group of its own
pub fn own_process_group(pid: Pid) -> io::Result<()> {
    if unsafe { libc::setpgid(pid, 0) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub enum Fork {
    Parent(Pid),
    Child,
}

pub fn fork() -> io::Result<Fork> {
    match unsafe { libc::fork() } {
        pid if pid < 0 => Err(io::Error::last_os_error()),
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(pid)),
    }
}

/// Leave a forked child without running the parent's destructors
pub fn exit_child(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}
