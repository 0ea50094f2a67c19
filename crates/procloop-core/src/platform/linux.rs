//! Linux backend: fork + exec, epoll, eventfd.

#![allow(unsafe_code)]

use super::unix::{self, ChildHandle, CStringArray, StdioPipes};
use super::{
    decode_token, token, Multiplexer, PlatformBackend, Readiness, SpawnRequest, SpawnedChild,
    Termination, Waker, WAKE_TOKEN,
};
use crate::config::EngineConfig;
use crate::descriptor::RawDescriptor;
use crate::process::{ProcessKey, Stream};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::epoll::{self, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::signal::{self, pthread_sigmask, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{self, ForkResult};
use std::collections::HashSet;
use std::ffi::{CStr, CString, OsStr, OsString};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

pub(crate) struct LinuxBackend;

impl PlatformBackend for LinuxBackend {
    type Multiplexer = Epoll;

    fn spawn(request: &SpawnRequest<'_>) -> io::Result<SpawnedChild> {
        unix::ignore_sigpipe();

        let program = request
            .command
            .first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
        let path = resolve_program(program, request.environment)?;

        // Everything the child touches is allocated before fork.
        let path = unix::cstring(path.as_os_str())?;
        let argv = CStringArray::new(
            request
                .command
                .iter()
                .map(|arg| unix::cstring(arg))
                .collect::<io::Result<Vec<_>>>()?,
        );
        let envp = CStringArray::new(unix::environment_block(request.environment)?);
        let cwd = request
            .current_dir
            .map(|dir| unix::cstring(dir.as_os_str()))
            .transpose()?;

        let pipes = StdioPipes::create()?;
        let (error_read, error_write) = unix::pipe_cloexec()?;

        let child_fds = ChildFds {
            stdin: pipes.child_stdin.as_fd(),
            stdout: pipes.child_stdout.as_fd(),
            stderr: pipes.child_stderr.as_fd(),
            error: error_write.as_fd(),
        };

        // SAFETY: the child branch only makes async-signal-safe calls on
        // memory prepared above, then execs or exits.
        let pid = match unsafe { unistd::fork() }? {
            ForkResult::Parent { child } => child.as_raw(),
            ForkResult::Child => exec_child(&child_fds, &path, &argv, &envp, cwd.as_deref()),
        };

        drop(error_write);
        let (stdin, stdout, stderr) = pipes.into_parent();
        let handle = ChildHandle { pid };

        let exec_error = match read_exec_error(&error_read) {
            Ok(None) => None,
            Ok(Some(errno)) => Some(io::Error::from_raw_os_error(errno)),
            Err(e) => Some(e),
        };
        if let Some(err) = exec_error {
            unix::reap_blocking(pid);
            for fd in [stdin, stdout, stderr] {
                unix::close_descriptor(fd);
            }
            return Err(err);
        }

        // A child that died between exec and here is reaped now so its
        // status is not lost.
        let early_exit = unix::try_wait(&handle)?;
        debug!("Forked pid {} (early exit: {:?})", pid, early_exit);

        Ok(SpawnedChild {
            pid: pid as u32,
            handle,
            stdin,
            stdout,
            stderr,
            early_exit,
        })
    }

    fn make_multiplexer(_buffer_capacity: usize) -> io::Result<Epoll> {
        Epoll::new()
    }

    fn try_wait(child: &ChildHandle) -> io::Result<Option<i32>> {
        unix::try_wait(child)
    }

    fn signal(child: &ChildHandle, termination: Termination) -> io::Result<()> {
        unix::signal(child, termination)
    }

    fn resume(_child: &ChildHandle) -> io::Result<()> {
        Ok(())
    }
}

struct ChildFds<'a> {
    stdin: BorrowedFd<'a>,
    stdout: BorrowedFd<'a>,
    stderr: BorrowedFd<'a>,
    error: BorrowedFd<'a>,
}

/// Runs in the forked child. Never returns.
///
/// Nothing here may allocate: the parent is multithreaded and another
/// thread may have held the allocator lock at fork time.
fn exec_child(
    fds: &ChildFds<'_>,
    path: &CString,
    argv: &CStringArray,
    envp: &CStringArray,
    cwd: Option<&CStr>,
) -> ! {
    if pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None).is_err() {
        fail_exec(fds.error);
    }
    // SAFETY: restoring the default disposition runs no handler code.
    if unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) }.is_err() {
        fail_exec(fds.error);
    }

    for (fd, target) in [(fds.stdin, 0), (fds.stdout, 1), (fds.stderr, 2)] {
        let fd = fd.as_raw_fd();
        let result = if fd == target {
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map(drop)
        } else {
            unistd::dup2(fd, target).map(drop)
        };
        if result.is_err() {
            fail_exec(fds.error);
        }
    }

    if let Some(cwd) = cwd {
        if unistd::chdir(cwd).is_err() {
            fail_exec(fds.error);
        }
    }

    // nix's execve builds its pointer arrays on the heap, so the prepared
    // ones are passed to libc directly.
    // SAFETY: all three arrays are NUL-terminated and outlive the call.
    unsafe {
        libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr());
    }
    fail_exec(fds.error)
}

/// Report errno through the error pipe and exit with the exec-failure status.
fn fail_exec(error: BorrowedFd<'_>) -> ! {
    let errno = Errno::last_raw();
    let _ = unistd::write(error, &errno.to_ne_bytes());
    // SAFETY: _exit is async-signal-safe and skips atexit handlers.
    unsafe { libc::_exit(crate::exit_code::EXEC_FAILED_STATUS) }
}

/// Blocks until the child execs (pipe closes, `None`) or reports an errno.
fn read_exec_error(error_read: &OwnedFd) -> io::Result<Option<i32>> {
    let mut bytes = [0u8; 4];
    let mut filled = 0;
    while filled < bytes.len() {
        match unix::read_fd(error_read.as_raw_fd(), &mut bytes[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok((filled == bytes.len()).then(|| i32::from_ne_bytes(bytes)))
}

/// Resolve `program` against `PATH` the way a shell would.
///
/// Done before fork so the child does not have to search.
fn resolve_program(program: &OsStr, environment: &[(OsString, OsString)]) -> io::Result<PathBuf> {
    if program.as_bytes().contains(&b'/') {
        return Ok(PathBuf::from(program));
    }
    let search = environment
        .iter()
        .find(|(key, _)| key == "PATH")
        .map(|(_, value)| value.clone())
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_else(|| OsString::from("/usr/local/bin:/usr/bin:/bin"));

    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found on PATH", program.to_string_lossy()),
            )
        })
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Wakes an [`Epoll`] by bumping its eventfd counter.
pub(crate) struct EventFdWaker {
    fd: Arc<EventFd>,
}

impl Waker for EventFdWaker {
    fn wake(&self) -> io::Result<()> {
        match self.fd.arm() {
            Ok(_) => Ok(()),
            // Counter saturated: a wake is already pending.
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Level-triggered epoll instance with an eventfd waker.
pub(crate) struct Epoll {
    epoll: epoll::Epoll,
    wake: Arc<EventFd>,
    events: Vec<EpollEvent>,
    // Processes whose stdin is in the interest list (armed or spent one-shot).
    stdin_added: HashSet<ProcessKey>,
}

/// Borrow a descriptor the caller keeps open with a `DescriptorGuard`.
fn guarded_fd<'a>(raw: RawDescriptor) -> BorrowedFd<'a> {
    // SAFETY: every raw descriptor handed to the multiplexer comes from a
    // live guard that outlasts the call it is passed to.
    unsafe { BorrowedFd::borrow_raw(raw) }
}

impl Epoll {
    fn new() -> io::Result<Self> {
        let epoll = epoll::Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let wake = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        epoll.add(&wake, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))?;

        Ok(Self {
            epoll,
            wake: Arc::new(wake),
            events: vec![EpollEvent::empty(); EngineConfig::EVENT_BATCH_SIZE],
            stdin_added: HashSet::new(),
        })
    }

    fn drain_wake(&self) {
        let _ = self.wake.read();
    }
}

impl Multiplexer for Epoll {
    type Waker = EventFdWaker;

    fn waker(&self) -> io::Result<EventFdWaker> {
        Ok(EventFdWaker {
            fd: Arc::clone(&self.wake),
        })
    }

    fn register_output(&mut self, key: ProcessKey, stream: Stream, raw: RawDescriptor) -> io::Result<()> {
        let event = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP, token(key, stream));
        self.epoll.add(guarded_fd(raw), event)?;
        Ok(())
    }

    fn arm_stdin(&mut self, key: ProcessKey, raw: RawDescriptor) -> io::Result<()> {
        let mut event = EpollEvent::new(
            EpollFlags::EPOLLOUT | EpollFlags::EPOLLONESHOT,
            token(key, Stream::Stdin),
        );
        let fd = guarded_fd(raw);
        let result = if self.stdin_added.contains(&key) {
            match self.epoll.modify(fd, &mut event) {
                Err(Errno::ENOENT) => self.epoll.add(fd, event),
                other => other,
            }
        } else {
            match self.epoll.add(fd, event) {
                Err(Errno::EEXIST) => self.epoll.modify(fd, &mut event),
                other => other,
            }
        };
        result?;
        self.stdin_added.insert(key);
        Ok(())
    }

    fn deregister(&mut self, key: ProcessKey, stream: Stream, raw: Option<RawDescriptor>) {
        if stream == Stream::Stdin && !self.stdin_added.remove(&key) {
            return;
        }
        if let Some(fd) = raw {
            if let Err(e) = self.epoll.delete(guarded_fd(fd)) {
                trace!("epoll DEL for {} of {} failed: {}", stream, key, e);
            }
        }
    }

    fn poll(&mut self, events: &mut Vec<Readiness>, timeout: Duration) -> io::Result<()> {
        let timeout = EpollTimeout::try_from(timeout).unwrap_or(EpollTimeout::MAX);
        let ready = match self.epoll.wait(&mut self.events, timeout) {
            Ok(ready) => ready,
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut woken = false;
        for event in &self.events[..ready] {
            match decode_token(event.data()) {
                Some(readiness) => events.push(readiness),
                None => woken = true,
            }
        }
        if woken {
            self.drain_wake();
        }
        Ok(())
    }

    fn read(&mut self, _key: ProcessKey, _stream: Stream, raw: RawDescriptor, buf: &mut [u8]) -> io::Result<usize> {
        unix::read_fd(raw, buf)
    }

    fn write(&mut self, _key: ProcessKey, raw: RawDescriptor, buf: &[u8]) -> io::Result<usize> {
        unix::write_fd(raw, buf)
    }
}
