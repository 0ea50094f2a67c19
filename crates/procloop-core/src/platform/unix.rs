//! Pieces shared by the Linux and macOS backends: pipes, non-blocking reads
//! and writes, reaping and signals.

#![allow(unsafe_code)]

use super::Termination;
use crate::exit_code;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::fd::{BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::sync::Once;
use tracing::{debug, trace};

/// The OS identity of a spawned child.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildHandle {
    pub pid: libc::pid_t,
}

pub(crate) fn close_descriptor(fd: RawFd) {
    if let Err(e) = unistd::close(fd) {
        trace!("close({}) failed: {}", fd, e);
    }
}

pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    Ok(unistd::read(fd, buf)?)
}

pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: `fd` is held open by the caller's descriptor guard for the
    // duration of the call.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    Ok(unistd::write(fd, buf)?)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = OFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// A pipe whose both ends are close-on-exec. Returns `(read, write)`.
#[cfg(target_os = "linux")]
pub(crate) fn pipe_cloexec() -> io::Result<(OwnedFd, OwnedFd)> {
    Ok(unistd::pipe2(OFlag::O_CLOEXEC)?)
}

/// A pipe whose both ends are close-on-exec. Returns `(read, write)`.
#[cfg(not(target_os = "linux"))]
pub(crate) fn pipe_cloexec() -> io::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::FdFlag;
    use std::os::fd::AsRawFd;

    let (read, write) = unistd::pipe()?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}

/// The three pipes of one child.
///
/// Everything is owned until handed out, so an early return at any point
/// closes whatever was already opened.
pub(crate) struct StdioPipes {
    pub child_stdin: OwnedFd,
    pub child_stdout: OwnedFd,
    pub child_stderr: OwnedFd,
    parent_stdin: OwnedFd,
    parent_stdout: OwnedFd,
    parent_stderr: OwnedFd,
}

impl StdioPipes {
    pub(crate) fn create() -> io::Result<Self> {
        use std::os::fd::AsRawFd;

        let (child_stdin, parent_stdin) = pipe_cloexec()?;
        let (parent_stdout, child_stdout) = pipe_cloexec()?;
        let (parent_stderr, child_stderr) = pipe_cloexec()?;

        for fd in [&parent_stdin, &parent_stdout, &parent_stderr] {
            set_nonblocking(fd.as_raw_fd())?;
        }

        Ok(Self {
            child_stdin,
            child_stdout,
            child_stderr,
            parent_stdin,
            parent_stdout,
            parent_stderr,
        })
    }

    /// Close the child-side ends and release the parent-side ends as
    /// `(stdin, stdout, stderr)`.
    pub(crate) fn into_parent(self) -> (RawFd, RawFd, RawFd) {
        drop(self.child_stdin);
        drop(self.child_stdout);
        drop(self.child_stderr);
        (
            self.parent_stdin.into_raw_fd(),
            self.parent_stdout.into_raw_fd(),
            self.parent_stderr.into_raw_fd(),
        )
    }
}

/// Ignore SIGPIPE so a write to a dead child's stdin returns EPIPE instead
/// of killing this process.
pub(crate) fn ignore_sigpipe() {
    static IGNORE: Once = Once::new();
    IGNORE.call_once(|| {
        // SAFETY: installing SIG_IGN does not run any handler code.
        match unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
            Ok(_) => debug!("SIGPIPE ignored"),
            Err(e) => debug!("Failed to ignore SIGPIPE: {}", e),
        }
    });
}

/// Map a wait status to the engine's exit code; `None` while still running.
pub(crate) fn decode_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, exit_code::EXEC_FAILED_STATUS) => Some(exit_code::EXEC_FAILED),
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(signal as i32),
        _ => None,
    }
}

pub(crate) fn try_wait(child: &ChildHandle) -> io::Result<Option<i32>> {
    match waitpid(Pid::from_raw(child.pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => Ok(decode_status(status)),
        Err(Errno::EINTR) => Ok(None),
        // Somebody else reaped it; the status is gone.
        Err(Errno::ECHILD) => Ok(Some(exit_code::UNKNOWN)),
        Err(e) => Err(e.into()),
    }
}

/// Blocking reap, for children known to be exiting right now.
pub(crate) fn reap_blocking(pid: libc::pid_t) {
    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Err(Errno::EINTR) => continue,
            _ => return,
        }
    }
}

pub(crate) fn signal(child: &ChildHandle, termination: Termination) -> io::Result<()> {
    let sig = match termination {
        Termination::Terminate => Signal::SIGTERM,
        Termination::Kill => Signal::SIGKILL,
    };
    match signal::kill(Pid::from_raw(child.pid), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn cstring(value: &OsStr) -> io::Result<CString> {
    CString::new(value.as_bytes()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interior NUL byte in {:?}", value),
        )
    })
}

/// `KEY=VALUE` entries for an exec environment.
pub(crate) fn environment_block(environment: &[(OsString, OsString)]) -> io::Result<Vec<CString>> {
    environment
        .iter()
        .map(|(key, value)| {
            let mut entry = key.clone();
            entry.push("=");
            entry.push(value);
            cstring(&entry)
        })
        .collect()
}

/// NULL-terminated pointer array over owned C strings.
pub(crate) struct CStringArray {
    _owned: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl CStringArray {
    pub(crate) fn new(owned: Vec<CString>) -> Self {
        let mut ptrs: Vec<*const libc::c_char> = owned.iter().map(|s| s.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        Self { _owned: owned, ptrs }
    }

    pub(crate) fn as_ptr(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}
