//! macOS backend: posix_spawnp with a suspended child, kqueue, `EVFILT_USER`.

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
use nix::sys::event::{self, EventFilter, EventFlag, FilterFlag, KEvent};
use nix::sys::time::TimeSpec;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

// <spawn.h> flags (Apple extensions).
const POSIX_SPAWN_START_SUSPENDED: libc::c_short = 0x0080;
const POSIX_SPAWN_CLOEXEC_DEFAULT: libc::c_short = 0x4000;

// Per-thread working directory syscalls.
const SYS_PTHREAD_CHDIR: libc::c_int = 348;
const SYS_PTHREAD_FCHDIR: libc::c_int = 349;

// posix_spawn inherits the calling thread's working directory; changing it is
// serialized so two spawns never see each other's directory.
static CHDIR_LOCK: Mutex<()> = Mutex::new(());

pub(crate) struct MacBackend;

impl PlatformBackend for MacBackend {
    type Multiplexer = Kqueue;

    fn spawn(request: &SpawnRequest<'_>) -> io::Result<SpawnedChild> {
        unix::ignore_sigpipe();

        let program = request
            .command
            .first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
        let program = unix::cstring(program)?;
        let argv = CStringArray::new(
            request
                .command
                .iter()
                .map(|arg| unix::cstring(arg))
                .collect::<io::Result<Vec<_>>>()?,
        );
        let envp = CStringArray::new(unix::environment_block(request.environment)?);

        let pipes = StdioPipes::create()?;
        let actions = FileActions::new(&pipes)?;
        let attributes = SpawnAttributes::new()?;

        let mut pid: libc::pid_t = 0;
        let mut spawn = || {
            // SAFETY: every pointer refers to memory owned by this frame that
            // outlives the call.
            unsafe {
                libc::posix_spawnp(
                    &mut pid,
                    program.as_ptr(),
                    &actions.inner,
                    &attributes.inner,
                    argv.as_ptr() as *const *mut libc::c_char,
                    envp.as_ptr() as *const *mut libc::c_char,
                )
            }
        };
        let rc = match request.current_dir {
            Some(dir) => with_thread_cwd(dir, spawn)?,
            None => spawn(),
        };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }

        let (stdin, stdout, stderr) = pipes.into_parent();
        let handle = ChildHandle { pid };
        debug!("Spawned suspended pid {}", pid);

        Ok(SpawnedChild {
            pid: pid as u32,
            handle,
            stdin,
            stdout,
            stderr,
            early_exit: None,
        })
    }

    fn make_multiplexer(_buffer_capacity: usize) -> io::Result<Kqueue> {
        Kqueue::new()
    }

    fn try_wait(child: &ChildHandle) -> io::Result<Option<i32>> {
        unix::try_wait(child)
    }

    fn signal(child: &ChildHandle, termination: Termination) -> io::Result<()> {
        unix::signal(child, termination)
    }

    fn resume(child: &ChildHandle) -> io::Result<()> {
        match nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(child.pid),
            nix::sys::signal::Signal::SIGCONT,
        ) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Run `f` with this thread's working directory set to `dir`, then restore it.
#[allow(deprecated)]
fn with_thread_cwd<T>(dir: &Path, f: impl FnOnce() -> T) -> io::Result<T> {
    let dir = unix::cstring(dir.as_os_str())?;
    let _guard = CHDIR_LOCK.lock().unwrap();

    // SAFETY: valid NUL-terminated path.
    if unsafe { libc::syscall(SYS_PTHREAD_CHDIR, dir.as_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let result = f();
    // SAFETY: -1 reverts the thread to the process-wide working directory.
    if unsafe { libc::syscall(SYS_PTHREAD_FCHDIR, -1) } < 0 {
        warn!("Failed to restore thread working directory: {}", io::Error::last_os_error());
    }
    Ok(result)
}

struct FileActions {
    inner: libc::posix_spawn_file_actions_t,
}

impl FileActions {
    fn new(pipes: &StdioPipes) -> io::Result<Self> {
        let mut inner: libc::posix_spawn_file_actions_t = std::ptr::null_mut();
        // SAFETY: initializing an out-parameter.
        check(unsafe { libc::posix_spawn_file_actions_init(&mut inner) })?;
        let mut actions = Self { inner };
        for (fd, target) in [
            (pipes.child_stdin.as_raw_fd(), 0),
            (pipes.child_stdout.as_raw_fd(), 1),
            (pipes.child_stderr.as_raw_fd(), 2),
        ] {
            // SAFETY: `inner` was initialized above.
            check(unsafe { libc::posix_spawn_file_actions_adddup2(&mut actions.inner, fd, target) })?;
        }
        Ok(actions)
    }
}

impl Drop for FileActions {
    fn drop(&mut self) {
        // SAFETY: initialized in `new`.
        unsafe {
            libc::posix_spawn_file_actions_destroy(&mut self.inner);
        }
    }
}

struct SpawnAttributes {
    inner: libc::posix_spawnattr_t,
}

impl SpawnAttributes {
    fn new() -> io::Result<Self> {
        let mut inner: libc::posix_spawnattr_t = std::ptr::null_mut();
        // SAFETY: initializing an out-parameter.
        check(unsafe { libc::posix_spawnattr_init(&mut inner) })?;
        let mut attributes = Self { inner };

        // SAFETY: sigset out-parameters are initialized before use.
        unsafe {
            let mut default_signals: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut default_signals);
            libc::sigaddset(&mut default_signals, libc::SIGPIPE);
            check(libc::posix_spawnattr_setsigdefault(&mut attributes.inner, &default_signals))?;

            let mut empty_mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut empty_mask);
            check(libc::posix_spawnattr_setsigmask(&mut attributes.inner, &empty_mask))?;
        }

        let flags = POSIX_SPAWN_START_SUSPENDED
            | POSIX_SPAWN_CLOEXEC_DEFAULT
            | libc::POSIX_SPAWN_SETSIGDEF as libc::c_short
            | libc::POSIX_SPAWN_SETSIGMASK as libc::c_short;
        // SAFETY: `inner` was initialized above.
        check(unsafe { libc::posix_spawnattr_setflags(&mut attributes.inner, flags) })?;
        Ok(attributes)
    }
}

impl Drop for SpawnAttributes {
    fn drop(&mut self) {
        // SAFETY: initialized in `new`.
        unsafe {
            libc::posix_spawnattr_destroy(&mut self.inner);
        }
    }
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// Wakes a [`Kqueue`] by triggering its user event.
pub(crate) struct KqueueWaker {
    kq: Arc<event::Kqueue>,
}

impl Waker for KqueueWaker {
    fn wake(&self) -> io::Result<()> {
        let change = kevent(
            WAKE_TOKEN as usize,
            EventFilter::EVFILT_USER,
            EventFlag::empty(),
            FilterFlag::NOTE_TRIGGER,
            WAKE_TOKEN,
        );
        submit(&self.kq, &[change])
    }
}

/// kqueue instance; output streams use `EVFILT_READ`, stdin a one-shot
/// `EVFILT_WRITE`.
pub(crate) struct Kqueue {
    kq: Arc<event::Kqueue>,
    events: Vec<KEvent>,
}

fn kevent(ident: usize, filter: EventFilter, flags: EventFlag, fflags: FilterFlag, data: u64) -> KEvent {
    KEvent::new(ident, filter, flags, fflags, 0, data as isize)
}

fn submit(kq: &event::Kqueue, changes: &[KEvent]) -> io::Result<()> {
    kq.kevent(changes, &mut [], None)?;
    Ok(())
}

impl Kqueue {
    fn new() -> io::Result<Self> {
        let kq = event::Kqueue::new()?;
        let wake = kevent(
            WAKE_TOKEN as usize,
            EventFilter::EVFILT_USER,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR,
            FilterFlag::empty(),
            WAKE_TOKEN,
        );
        submit(&kq, &[wake])?;
        let idle = kevent(0, EventFilter::EVFILT_READ, EventFlag::empty(), FilterFlag::empty(), 0);
        Ok(Self {
            kq: Arc::new(kq),
            events: vec![idle; EngineConfig::EVENT_BATCH_SIZE],
        })
    }
}

impl Multiplexer for Kqueue {
    type Waker = KqueueWaker;

    fn waker(&self) -> io::Result<KqueueWaker> {
        Ok(KqueueWaker {
            kq: Arc::clone(&self.kq),
        })
    }

    fn register_output(&mut self, key: ProcessKey, stream: Stream, raw: RawDescriptor) -> io::Result<()> {
        let change = kevent(
            raw as usize,
            EventFilter::EVFILT_READ,
            EventFlag::EV_ADD,
            FilterFlag::empty(),
            token(key, stream),
        );
        submit(&self.kq, &[change])
    }

    fn arm_stdin(&mut self, key: ProcessKey, raw: RawDescriptor) -> io::Result<()> {
        let change = kevent(
            raw as usize,
            EventFilter::EVFILT_WRITE,
            EventFlag::EV_ADD | EventFlag::EV_ONESHOT,
            FilterFlag::empty(),
            token(key, Stream::Stdin),
        );
        submit(&self.kq, &[change])
    }

    fn deregister(&mut self, key: ProcessKey, stream: Stream, raw: Option<RawDescriptor>) {
        let Some(fd) = raw else { return };
        let filter = match stream {
            Stream::Stdin => EventFilter::EVFILT_WRITE,
            Stream::Stdout | Stream::Stderr => EventFilter::EVFILT_READ,
        };
        let change = kevent(fd as usize, filter, EventFlag::EV_DELETE, FilterFlag::empty(), 0);
        if let Err(e) = submit(&self.kq, &[change]) {
            // ENOENT for a one-shot that already fired.
            trace!("kqueue delete for {} of {} failed: {}", stream, key, e);
        }
    }

    fn poll(&mut self, events: &mut Vec<Readiness>, timeout: Duration) -> io::Result<()> {
        let timeout = TimeSpec::from(timeout);
        let ready = match self.kq.kevent(&[], &mut self.events, Some(*timeout.as_ref())) {
            Ok(ready) => ready,
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for event in &self.events[..ready] {
            if let Some(readiness) = decode_token(event.udata() as u64) {
                events.push(readiness);
            }
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
