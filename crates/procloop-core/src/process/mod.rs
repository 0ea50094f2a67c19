//! Process handles.
//!
//! A child is represented by two halves:
//!
//! - [`Process`]: the cheaply clonable, thread-safe handle given to
//!   applications and listeners. It holds the descriptors, the stdin write
//!   queue, the state and the exit latch.
//! - [`ProcessIo`]: the worker-owned half holding the buffers and the
//!   listener. Only the owning worker thread touches it, so the read/write
//!   state machine needs no locking.
//!
//! Application threads never perform I/O themselves; `write_stdin`,
//! `want_write` and `close_stdin` enqueue a command on the owning worker
//! and wake it.

mod io;
mod latch;

pub(crate) use io::ProcessIo;

use crate::descriptor::{RawDescriptor, RefCountedDescriptor};
use crate::error::{ProcloopError, Result};
use crate::event::{Command, WorkerShared};
use crate::exit_code;
use crate::platform::{Backend, ChildHandle, PlatformBackend, Termination};
use bytes::Bytes;
use latch::ExitLatch;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Pool-unique identifier of a process; also the high bits of its poll tokens.
pub(crate) type ProcessKey = u64;

/// One of the child's standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

impl Stream {
    pub fn name(self) -> &'static str {
        match self {
            Stream::Stdin => "stdin",
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }

    pub(crate) fn index(self) -> u64 {
        match self {
            Stream::Stdin => 0,
            Stream::Stdout => 1,
            Stream::Stderr => 2,
        }
    }

    pub(crate) fn from_index(index: u64) -> Option<Self> {
        match index {
            0 => Some(Stream::Stdin),
            1 => Some(Stream::Stdout),
            2 => Some(Stream::Stderr),
            _ => None,
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawn in progress.
    Spawning,
    /// Running and registered with a worker.
    Running,
    /// Both output streams reached EOF; waiting for the OS to confirm exit.
    SoftExited,
    /// The exit transition has run.
    Exited,
}

impl ProcessState {
    fn to_u8(self) -> u8 {
        match self {
            ProcessState::Spawning => 0,
            ProcessState::Running => 1,
            ProcessState::SoftExited => 2,
            ProcessState::Exited => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProcessState::Spawning,
            1 => ProcessState::Running,
            2 => ProcessState::SoftExited,
            _ => ProcessState::Exited,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Spawning => "spawning",
            ProcessState::Running => "running",
            ProcessState::SoftExited => "soft-exited",
            ProcessState::Exited => "exited",
        };
        f.write_str(name)
    }
}

/// Entry of the stdin write queue.
#[derive(Debug)]
pub(crate) enum WriteEntry {
    Data(Bytes),
    /// Close stdin once everything queued before it has been written.
    Close,
}

enum ChildSlot {
    NeverStarted,
    Live(ChildHandle),
    Reaped,
}

/// Raw parts of a freshly spawned child.
pub(crate) struct StartedChild {
    pub pid: u32,
    pub handle: ChildHandle,
    pub stdin: RawDescriptor,
    pub stdout: RawDescriptor,
    pub stderr: RawDescriptor,
    /// Already reaped at launch.
    pub reaped: bool,
}

pub(crate) struct ProcessShared {
    key: ProcessKey,
    command: String,
    pid: u32,
    redirect_error_stream: bool,
    state: AtomicU8,
    child: Mutex<ChildSlot>,
    stdin: RefCountedDescriptor,
    stdout: RefCountedDescriptor,
    stderr: RefCountedDescriptor,
    pending_writes: Mutex<VecDeque<WriteEntry>>,
    user_wants_write: AtomicBool,
    stdin_closing: AtomicBool,
    stdin_draining: AtomicBool,
    exit: ExitLatch,
    worker: OnceLock<Arc<WorkerShared>>,
}

/// Handle to a child process driven by a [`ProcessPool`](crate::ProcessPool).
///
/// Clones share the same process.
#[derive(Clone)]
pub struct Process {
    inner: Arc<ProcessShared>,
}

impl Process {
    pub(crate) fn started(
        key: ProcessKey,
        command: String,
        redirect_error_stream: bool,
        child: StartedChild,
    ) -> Self {
        let slot = if child.reaped {
            ChildSlot::Reaped
        } else {
            ChildSlot::Live(child.handle)
        };
        Self::build(
            key,
            command,
            child.pid,
            redirect_error_stream,
            slot,
            [
                RefCountedDescriptor::new(child.stdin),
                RefCountedDescriptor::new(child.stdout),
                RefCountedDescriptor::new(child.stderr),
            ],
        )
    }

    pub(crate) fn never_started(key: ProcessKey, command: String, redirect_error_stream: bool) -> Self {
        Self::build(
            key,
            command,
            0,
            redirect_error_stream,
            ChildSlot::NeverStarted,
            [
                RefCountedDescriptor::closed(),
                RefCountedDescriptor::closed(),
                RefCountedDescriptor::closed(),
            ],
        )
    }

    /// A process with fake descriptors and no child, for driving `ProcessIo`
    /// against a scripted multiplexer.
    #[cfg(test)]
    pub(crate) fn detached(key: ProcessKey, redirect_error_stream: bool) -> Self {
        fn ignore(_: RawDescriptor) {}
        Self::build(
            key,
            "detached".into(),
            0,
            redirect_error_stream,
            ChildSlot::NeverStarted,
            [
                RefCountedDescriptor::with_closer(10, ignore),
                RefCountedDescriptor::with_closer(11, ignore),
                RefCountedDescriptor::with_closer(12, ignore),
            ],
        )
    }

    fn build(
        key: ProcessKey,
        command: String,
        pid: u32,
        redirect_error_stream: bool,
        child: ChildSlot,
        [stdin, stdout, stderr]: [RefCountedDescriptor; 3],
    ) -> Self {
        Self {
            inner: Arc::new(ProcessShared {
                key,
                command,
                pid,
                redirect_error_stream,
                state: AtomicU8::new(ProcessState::Spawning.to_u8()),
                child: Mutex::new(child),
                stdin,
                stdout,
                stderr,
                pending_writes: Mutex::new(VecDeque::new()),
                user_wants_write: AtomicBool::new(false),
                stdin_closing: AtomicBool::new(false),
                stdin_draining: AtomicBool::new(false),
                exit: ExitLatch::default(),
                worker: OnceLock::new(),
            }),
        }
    }

    /// OS process id; `0` if the child never started.
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// The command line, for display.
    pub fn command(&self) -> &str {
        &self.inner.command
    }

    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// True until the OS has confirmed termination.
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            ProcessState::Running | ProcessState::SoftExited
        )
    }

    pub fn is_redirect_error_stream(&self) -> bool {
        self.inner.redirect_error_stream
    }

    /// The exit code, or [`ProcloopError::StillRunning`] before the exit
    /// transition has run.
    pub fn exit_value(&self) -> Result<i32> {
        self.inner
            .exit
            .get()
            .ok_or(ProcloopError::StillRunning { pid: self.pid() })
    }

    /// Block until the exit transition has run and return the exit code.
    ///
    /// Must not be called from a listener callback of the same pool.
    pub fn wait_for(&self) -> i32 {
        self.inner.exit.wait()
    }

    /// Like [`wait_for`](Self::wait_for) with an upper bound.
    pub fn wait_for_timeout(&self, timeout: Duration) -> Option<i32> {
        self.inner.exit.wait_timeout(timeout)
    }

    /// Queue bytes for the child's stdin.
    ///
    /// The queue is unbounded; the worker writes at most one buffer's worth
    /// at a time.
    pub fn write_stdin(&self, data: impl Into<Bytes>) -> Result<()> {
        if self.inner.stdin.is_closed() || self.inner.stdin_closing.load(Ordering::Acquire) {
            return Err(ProcloopError::StdinClosed);
        }
        self.inner
            .pending_writes
            .lock()
            .unwrap()
            .push_back(WriteEntry::Data(data.into()));
        self.notify_worker(Command::WantWrite(self.inner.key));
        Ok(())
    }

    /// Ask for [`on_stdin_ready`](crate::ProcessListener::on_stdin_ready)
    /// once the write queue is empty and stdin is writable.
    pub fn want_write(&self) -> Result<()> {
        if self.inner.stdin.is_closed() || self.inner.stdin_closing.load(Ordering::Acquire) {
            return Err(ProcloopError::StdinClosed);
        }
        self.inner.user_wants_write.store(true, Ordering::Release);
        self.notify_worker(Command::WantWrite(self.inner.key));
        Ok(())
    }

    /// Close the child's stdin.
    ///
    /// A forced close drops queued writes and closes now; repeating it is a
    /// no-op. A graceful close lets queued writes drain first and may only be
    /// requested once.
    pub fn close_stdin(&self, force: bool) -> Result<()> {
        if force {
            self.inner.stdin_closing.store(true, Ordering::Release);
            if self.inner.stdin.close() {
                self.inner.pending_writes.lock().unwrap().clear();
                self.inner.user_wants_write.store(false, Ordering::Release);
                self.notify_worker(Command::CloseStdin(self.inner.key));
            }
            return Ok(());
        }

        if self.inner.stdin.is_closed()
            || self
                .inner
                .stdin_closing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return Err(ProcloopError::StdinClosed);
        }
        self.inner
            .pending_writes
            .lock()
            .unwrap()
            .push_back(WriteEntry::Close);
        self.notify_worker(Command::WantWrite(self.inner.key));
        Ok(())
    }

    /// True while queued or in-flight stdin bytes remain.
    pub fn has_pending_writes(&self) -> bool {
        // The worker marks a chunk as draining under this lock before taking
        // it off the queue.
        let pending = self.inner.pending_writes.lock().unwrap();
        self.inner.stdin_draining.load(Ordering::Acquire)
            || pending
                .iter()
                .any(|entry| matches!(entry, WriteEntry::Data(_)))
    }

    /// Ask the child to terminate (`force = false`) or kill it (`force = true`).
    ///
    /// Returns immediately; the exit is reported through the listener once
    /// the worker has reaped the child.
    pub fn destroy(&self, force: bool) -> Result<()> {
        if self.state() == ProcessState::Exited {
            return Ok(());
        }
        let termination = if force {
            Termination::Kill
        } else {
            Termination::Terminate
        };
        self.signal(termination)?;
        Ok(())
    }

    pub(crate) fn key(&self) -> ProcessKey {
        self.inner.key
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        self.inner.state.store(state.to_u8(), Ordering::Release);
    }

    pub(crate) fn descriptor(&self, stream: Stream) -> &RefCountedDescriptor {
        match stream {
            Stream::Stdin => &self.inner.stdin,
            Stream::Stdout => &self.inner.stdout,
            Stream::Stderr => &self.inner.stderr,
        }
    }

    pub(crate) fn bind_worker(&self, worker: Arc<WorkerShared>) {
        // Sticky: the first assignment wins.
        let _ = self.inner.worker.set(worker);
    }

    fn notify_worker(&self, command: Command) {
        if let Some(worker) = self.inner.worker.get() {
            worker.submit(command);
        }
    }

    /// Pop the next stdin chunk, splitting data larger than `capacity`.
    pub(crate) fn next_write(&self, capacity: usize) -> Option<WriteEntry> {
        let mut pending = self.inner.pending_writes.lock().unwrap();
        if let Some(WriteEntry::Data(bytes)) = pending.front_mut() {
            self.inner.stdin_draining.store(true, Ordering::Release);
            if bytes.len() > capacity {
                return Some(WriteEntry::Data(bytes.split_to(capacity)));
            }
        }
        let entry = pending.pop_front();
        if matches!(entry, Some(WriteEntry::Close)) {
            pending.clear();
        }
        entry
    }

    pub(crate) fn has_queued_writes(&self) -> bool {
        !self.inner.pending_writes.lock().unwrap().is_empty()
    }

    pub(crate) fn discard_writes(&self) {
        self.inner.pending_writes.lock().unwrap().clear();
        self.inner.user_wants_write.store(false, Ordering::Release);
        self.inner.stdin_closing.store(true, Ordering::Release);
        self.inner.stdin_draining.store(false, Ordering::Release);
    }

    pub(crate) fn user_wants_write(&self) -> bool {
        self.inner.user_wants_write.load(Ordering::Acquire)
    }

    pub(crate) fn set_user_wants_write(&self, wants: bool) {
        self.inner.user_wants_write.store(wants, Ordering::Release);
    }

    pub(crate) fn set_stdin_draining(&self, draining: bool) {
        self.inner.stdin_draining.store(draining, Ordering::Release);
    }

    /// Make the exit code visible; `false` if the exit transition already ran.
    pub(crate) fn record_exit(&self, code: i32) -> bool {
        self.inner.exit.record(code)
    }

    pub(crate) fn release_exit(&self, code: i32) -> bool {
        self.inner.exit.release(code)
    }

    /// Non-blocking check for termination; reaps the child when it is done.
    pub(crate) fn try_reap(&self) -> std::io::Result<Option<i32>> {
        let mut slot = self.inner.child.lock().unwrap();
        let status = match &*slot {
            ChildSlot::NeverStarted => Some(exit_code::NEVER_STARTED),
            ChildSlot::Reaped => Some(exit_code::UNKNOWN),
            ChildSlot::Live(handle) => Backend::try_wait(handle)?,
        };
        if status.is_some() {
            *slot = ChildSlot::Reaped;
        }
        Ok(status)
    }

    /// Send a termination request unless the child was already reaped.
    pub(crate) fn signal(&self, termination: Termination) -> std::io::Result<()> {
        match &*self.inner.child.lock().unwrap() {
            ChildSlot::Live(handle) => Backend::signal(handle, termination),
            ChildSlot::NeverStarted | ChildSlot::Reaped => Ok(()),
        }
    }

    /// Let a child created suspended start running.
    pub(crate) fn resume(&self) -> std::io::Result<()> {
        match &*self.inner.child.lock().unwrap() {
            ChildSlot::Live(handle) => Backend::resume(handle),
            ChildSlot::NeverStarted | ChildSlot::Reaped => Ok(()),
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid())
            .field("command", &self.command())
            .field("state", &self.state())
            .field("exit", &self.inner.exit.get())
            .finish()
    }
}
