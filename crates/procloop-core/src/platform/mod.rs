//! Platform backends.
//!
//! Each supported OS provides a [`PlatformBackend`] (spawning, reaping,
//! signalling) and a [`Multiplexer`] (the kernel readiness or completion
//! facility a worker polls). The implementation is picked with `cfg` at
//! compile time; the event loop only sees the traits.
//!
//! | OS      | Spawn                         | Multiplexer | Wake           |
//! |---------|-------------------------------|-------------|----------------|
//! | Linux   | fork + exec                   | epoll       | eventfd        |
//! | macOS   | posix_spawnp, start suspended | kqueue      | `EVFILT_USER`  |
//! | Windows | CreateProcessW, suspended     | IOCP        | empty packet   |

#[cfg(unix)]
mod unix;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "macos")]
mod macos;

#[cfg(windows)]
mod windows;

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
compile_error!("procloop supports Linux, macOS and Windows");

use crate::descriptor::RawDescriptor;
use crate::process::{ProcessKey, Stream};
use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::time::Duration;

#[cfg(target_os = "linux")]
pub(crate) use linux::{EventFdWaker as PollWaker, LinuxBackend as Backend};

#[cfg(target_os = "macos")]
pub(crate) use macos::{KqueueWaker as PollWaker, MacBackend as Backend};

#[cfg(windows)]
pub(crate) use windows::{CompletionWaker as PollWaker, WindowsBackend as Backend};

#[cfg(unix)]
pub(crate) use unix::{close_descriptor, ChildHandle};

#[cfg(windows)]
pub(crate) use windows::{close_descriptor, ChildHandle};

/// Token reserved for the wake signal. Process keys start at 1.
pub(crate) const WAKE_TOKEN: u64 = 0;

/// Pack a process key and stream into a poll token.
pub(crate) fn token(key: ProcessKey, stream: Stream) -> u64 {
    (key << 2) | stream.index()
}

/// Inverse of [`token`]; `None` for the wake token or garbage.
pub(crate) fn decode_token(token: u64) -> Option<Readiness> {
    if token == WAKE_TOKEN {
        return None;
    }
    let stream = Stream::from_index(token & 0b11)?;
    Some(Readiness {
        key: token >> 2,
        stream,
    })
}

/// One stream of one process is ready for I/O (or has hung up).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub key: ProcessKey,
    pub stream: Stream,
}

/// How hard to ask a child to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    Terminate,
    Kill,
}

/// What to run.
pub(crate) struct SpawnRequest<'a> {
    pub command: &'a [OsString],
    pub environment: &'a [(OsString, OsString)],
    pub current_dir: Option<&'a Path>,
}

/// Uniform result of a successful spawn on every platform.
pub(crate) struct SpawnedChild {
    pub pid: u32,
    pub handle: ChildHandle,
    pub stdin: RawDescriptor,
    pub stdout: RawDescriptor,
    pub stderr: RawDescriptor,
    /// Exit status collected right after launch, if the child already died.
    pub early_exit: Option<i32>,
}

/// Wakes a worker blocked in [`Multiplexer::poll`]. Usable from any thread.
pub(crate) trait Waker: Send + Sync + 'static {
    fn wake(&self) -> io::Result<()>;
}

/// One kernel multiplexer instance, owned by exactly one worker thread.
///
/// Output streams are registered level-triggered for the lifetime of the
/// stream. Stdin is armed one-shot whenever the worker has something to
/// write.
pub(crate) trait Multiplexer {
    type Waker: Waker;

    fn waker(&self) -> io::Result<Self::Waker>;

    /// Start watching stdout or stderr of `key` for readability.
    fn register_output(&mut self, key: ProcessKey, stream: Stream, raw: RawDescriptor) -> io::Result<()>;

    /// Report stdin of `key` once when it becomes writable.
    fn arm_stdin(&mut self, key: ProcessKey, raw: RawDescriptor) -> io::Result<()>;

    /// Stop watching a stream.
    ///
    /// `raw` is `None` when the descriptor was already closed elsewhere;
    /// only bookkeeping is dropped then.
    fn deregister(&mut self, key: ProcessKey, stream: Stream, raw: Option<RawDescriptor>);

    /// Wait up to `timeout` and append ready streams to `events`.
    fn poll(&mut self, events: &mut Vec<Readiness>, timeout: Duration) -> io::Result<()>;

    /// Non-blocking read; `Ok(0)` means end of stream.
    fn read(&mut self, key: ProcessKey, stream: Stream, raw: RawDescriptor, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking write to stdin.
    fn write(&mut self, key: ProcessKey, raw: RawDescriptor, buf: &[u8]) -> io::Result<usize>;
}

/// OS process operations.
pub(crate) trait PlatformBackend {
    type Multiplexer: Multiplexer;

    /// Create the pipes and launch the child.
    fn spawn(request: &SpawnRequest<'_>) -> io::Result<SpawnedChild>;

    /// Create a multiplexer on the calling (worker) thread.
    ///
    /// `buffer_capacity` is the pool's per-stream buffer size; backends that
    /// stage reads in their own buffers size them to match.
    fn make_multiplexer(buffer_capacity: usize) -> io::Result<Self::Multiplexer>;

    /// Non-blocking exit check. `Ok(None)` while the child runs.
    fn try_wait(child: &ChildHandle) -> io::Result<Option<i32>>;

    fn signal(child: &ChildHandle, termination: Termination) -> io::Result<()>;

    /// Let a child that was created suspended run. No-op where children
    /// start running.
    fn resume(child: &ChildHandle) -> io::Result<()>;
}

/// Name of the current platform backend, for logs.
pub fn backend_name() -> &'static str {
    if cfg!(target_os = "linux") {
        "epoll"
    } else if cfg!(target_os = "macos") {
        "kqueue"
    } else {
        "iocp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        for key in [1u64, 2, 77, 1 << 40] {
            for stream in [Stream::Stdin, Stream::Stdout, Stream::Stderr] {
                let decoded = decode_token(token(key, stream)).unwrap();
                assert_eq!(decoded, Readiness { key, stream });
            }
        }
    }

    #[test]
    fn test_wake_token_is_not_a_stream() {
        assert_eq!(decode_token(WAKE_TOKEN), None);
        assert_eq!(decode_token(0b11 | (5 << 2)), None);
    }

    #[test]
    fn test_backend_name() {
        assert!(["epoll", "kqueue", "iocp"].contains(&backend_name()));
    }
}
