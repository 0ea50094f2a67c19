//! Worker-side state machine of one process.

use super::{Process, ProcessState, Stream, WriteEntry};
use crate::buffer::IoBuffer;
use crate::config::EngineConfig;
use crate::error::ProcloopError;
use crate::exit_code;
use crate::listener::ProcessListener;
use crate::platform::{Multiplexer, Termination};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const KILL_REAP_ATTEMPTS: usize = 100;
const KILL_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Buffers, listener and stream flags of a process, owned by its worker.
pub(crate) struct ProcessIo {
    process: Process,
    listener: Box<dyn ProcessListener>,
    stdout: IoBuffer,
    stderr: IoBuffer,
    stdin: IoBuffer,
    stdout_closed: bool,
    stderr_closed: bool,
    early_exit: Option<i32>,
    // Exit code and reap time while leftover output is drained.
    reaped: Option<(i32, Instant)>,
    soft_exit_detection: bool,
}

enum Drain {
    /// Both output streams are at EOF.
    Closed,
    /// Nothing left to read right now.
    Quiet,
    /// The read budget ran out with data still coming.
    Pending,
}

enum Flush {
    Drained,
    Blocked,
    Failed(io::Error),
}

enum StdinStep {
    Rearm,
    Idle,
    Close(Option<ProcloopError>),
}

impl ProcessIo {
    pub(crate) fn new(
        process: Process,
        listener: Box<dyn ProcessListener>,
        buffer_capacity: usize,
        soft_exit_detection: bool,
        early_exit: Option<i32>,
    ) -> Self {
        let mut stdin = IoBuffer::with_capacity(buffer_capacity);
        stdin.flip();
        Self {
            process,
            listener,
            stdout: IoBuffer::with_capacity(buffer_capacity),
            stderr: IoBuffer::with_capacity(buffer_capacity),
            stdin,
            stdout_closed: false,
            stderr_closed: false,
            early_exit,
            reaped: None,
            soft_exit_detection,
        }
    }

    /// Report a launch failure and run the exit transition with
    /// [`exit_code::NEVER_STARTED`].
    pub(crate) fn launch_failed(process: Process, listener: Box<dyn ProcessListener>, err: &ProcloopError) {
        let mut io = Self::new(process, listener, 0, true, None);
        io.report_error(err, true);
        io.exit(exit_code::NEVER_STARTED);
    }

    pub(crate) fn process(&self) -> &Process {
        &self.process
    }

    pub(crate) fn started(&mut self) {
        let (process, listener) = (&self.process, &mut self.listener);
        if let Err(e) = guarded("on_started", || listener.on_started(process)) {
            self.report_error(&e, false);
        }
    }

    /// Both output streams are at EOF and soft-exit detection is on.
    pub(crate) fn is_soft_exit(&self) -> bool {
        self.soft_exit_detection && self.stdout_closed && self.stderr_closed
    }

    /// Non-blocking exit check; `Some` once the child has been reaped.
    pub(crate) fn poll_exit(&mut self) -> Option<i32> {
        if let Some(code) = self.early_exit.take() {
            return Some(code);
        }
        match self.process.try_reap() {
            Ok(status) => status,
            Err(e) => {
                warn!("Failed to collect status of pid {}: {}", self.process.pid(), e);
                Some(exit_code::UNKNOWN)
            }
        }
    }

    /// Kill the child and wait briefly for the OS to confirm it.
    pub(crate) fn kill_and_reap(&mut self) -> i32 {
        if let Err(e) = self.process.signal(Termination::Kill) {
            warn!("Failed to kill pid {}: {}", self.process.pid(), e);
        }
        for _ in 0..KILL_REAP_ATTEMPTS {
            if let Some(code) = self.poll_exit() {
                return code;
            }
            thread::sleep(KILL_REAP_INTERVAL);
        }
        warn!("pid {} did not die after SIGKILL", self.process.pid());
        exit_code::UNKNOWN
    }

    fn is_closed(&self, stream: Stream) -> bool {
        match stream {
            Stream::Stdout => self.stdout_closed,
            Stream::Stderr => self.stderr_closed,
            Stream::Stdin => self.process.descriptor(Stream::Stdin).is_closed(),
        }
    }

    /// Read once from stdout or stderr and deliver the bytes.
    ///
    /// Returns `true` when bytes were read and the stream is still open.
    pub(crate) fn read_output<M: Multiplexer>(&mut self, mux: &mut M, stream: Stream) -> bool {
        if stream == Stream::Stdin || self.is_closed(stream) {
            return false;
        }
        let process = self.process.clone();
        let result = match process.descriptor(stream).acquire() {
            Some(guard) => {
                let buffer = self.output_buffer(stream);
                mux.read(process.key(), stream, guard.raw(), buffer.spare_mut())
            }
            None => Ok(0),
        };

        match result {
            Ok(0) => {
                self.finish_stream(mux, stream);
                false
            }
            Ok(n) => {
                self.output_buffer(stream).advance_filled(n);
                self.deliver(stream, false);
                if self.output_buffer(stream).is_full() {
                    self.buffer_not_drained(mux, stream);
                    return false;
                }
                true
            }
            Err(e) if is_transient(&e) => false,
            Err(e) => {
                warn!("Reading {} of pid {} failed: {}", stream, process.pid(), e);
                self.report_error(&ProcloopError::Stream { stream, source: e }, false);
                self.finish_stream(mux, stream);
                false
            }
        }
    }

    /// Exit check used when soft-exit detection is off.
    ///
    /// Once the child is reaped, its pipes are drained until both reach EOF.
    /// A pipe that stays open but quiet past [`EngineConfig::EXIT_DRAIN_GRACE`]
    /// (a grandchild still holds it) is given up on, as is anything still
    /// streaming after [`EngineConfig::EXIT_DRAIN_TIMEOUT`]. Returns the exit
    /// code once the exit transition may run.
    pub(crate) fn settle_exit<M: Multiplexer>(&mut self, mux: &mut M) -> Option<i32> {
        let (code, reaped_at) = match self.reaped {
            Some(reaped) => reaped,
            None => {
                let reaped = (self.poll_exit()?, Instant::now());
                self.reaped = Some(reaped);
                reaped
            }
        };
        let waited = reaped_at.elapsed();
        match self.drain_output(mux) {
            Drain::Closed => Some(code),
            Drain::Quiet if waited >= EngineConfig::EXIT_DRAIN_GRACE => Some(code),
            _ if waited >= EngineConfig::EXIT_DRAIN_TIMEOUT => {
                warn!(
                    "Output of pid {} still open {:?} after exit; closing it",
                    self.process.pid(),
                    waited
                );
                Some(code)
            }
            _ => None,
        }
    }

    /// Read what the pipes hold, up to a per-stream budget.
    fn drain_output<M: Multiplexer>(&mut self, mux: &mut M) -> Drain {
        let mut pending = false;
        for stream in [Stream::Stdout, Stream::Stderr] {
            let mut reads = 0;
            while reads < EngineConfig::DRAIN_READ_LIMIT && self.read_output(mux, stream) {
                reads += 1;
            }
            pending |= reads == EngineConfig::DRAIN_READ_LIMIT;
        }
        if self.stdout_closed && self.stderr_closed {
            Drain::Closed
        } else if pending {
            Drain::Pending
        } else {
            Drain::Quiet
        }
    }

    fn output_buffer(&mut self, stream: Stream) -> &mut IoBuffer {
        match stream {
            Stream::Stderr => &mut self.stderr,
            _ => &mut self.stdout,
        }
    }

    /// Hand the filled part of a buffer to the listener, then compact.
    fn deliver(&mut self, stream: Stream, closed: bool) {
        let to_stderr = stream == Stream::Stderr && !self.process.is_redirect_error_stream();
        let (process, listener) = (&self.process, &mut self.listener);
        let buffer = match stream {
            Stream::Stderr => &mut self.stderr,
            _ => &mut self.stdout,
        };

        buffer.flip();
        let result = if to_stderr {
            guarded("on_stderr", || listener.on_stderr(process, buffer, closed))
        } else {
            guarded("on_stdout", || listener.on_stdout(process, buffer, closed))
        };
        buffer.compact();

        if let Err(e) = result {
            self.report_error(&e, false);
        }
    }

    fn buffer_not_drained<M: Multiplexer>(&mut self, mux: &mut M, stream: Stream) {
        error!(
            "Listener of pid {} left its {} buffer full; destroying the process",
            self.process.pid(),
            stream
        );
        self.report_error(&ProcloopError::BufferNotDrained { stream }, false);
        self.finish_stream(mux, stream);
        if let Err(e) = self.process.signal(Termination::Kill) {
            warn!("Failed to kill pid {}: {}", self.process.pid(), e);
        }
    }

    /// Close an output stream and deliver its final callback.
    fn finish_stream<M: Multiplexer>(&mut self, mux: &mut M, stream: Stream) {
        if self.is_closed(stream) {
            return;
        }
        match stream {
            Stream::Stdout => self.stdout_closed = true,
            Stream::Stderr => self.stderr_closed = true,
            Stream::Stdin => return,
        }
        let descriptor = self.process.descriptor(stream);
        {
            let guard = descriptor.acquire();
            mux.deregister(self.process.key(), stream, guard.as_ref().map(|g| g.raw()));
        }
        descriptor.close();
        debug!("{} of pid {} closed", stream, self.process.pid());
        self.deliver(stream, true);
    }

    /// Write as much queued stdin data as the pipe takes.
    ///
    /// Returns `true` when stdin should be armed again.
    pub(crate) fn write_stdin<M: Multiplexer>(&mut self, mux: &mut M) -> bool {
        let process = self.process.clone();
        let step = match process.descriptor(Stream::Stdin).acquire() {
            Some(guard) => self.pump_stdin(mux, guard.raw()),
            None => StdinStep::Close(None),
        };

        match step {
            StdinStep::Rearm => {
                process.set_stdin_draining(self.stdin.has_remaining());
                true
            }
            StdinStep::Idle => {
                process.set_stdin_draining(false);
                false
            }
            StdinStep::Close(err) => {
                if let Some(e) = err {
                    self.report_error(&e, false);
                }
                self.close_stdin(mux);
                false
            }
        }
    }

    fn pump_stdin<M: Multiplexer>(&mut self, mux: &mut M, raw: crate::descriptor::RawDescriptor) -> StdinStep {
        for _ in 0..EngineConfig::MAX_STDIN_CHUNKS_PER_EVENT {
            if self.stdin.has_remaining() {
                match self.flush_stdin(mux, raw) {
                    Flush::Drained => {}
                    Flush::Blocked => return StdinStep::Rearm,
                    Flush::Failed(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        debug!("stdin of pid {} closed by the child", self.process.pid());
                        return StdinStep::Close(None);
                    }
                    Flush::Failed(e) => {
                        return StdinStep::Close(Some(ProcloopError::Stream {
                            stream: Stream::Stdin,
                            source: e,
                        }))
                    }
                }
            }

            match self.process.next_write(self.stdin.capacity()) {
                Some(WriteEntry::Close) => return StdinStep::Close(None),
                Some(WriteEntry::Data(chunk)) => {
                    self.stdin.clear();
                    self.stdin.put_slice(&chunk);
                    self.stdin.flip();
                    continue;
                }
                None => {}
            }

            if !self.process.user_wants_write() {
                return StdinStep::Idle;
            }

            self.stdin.clear();
            let (process, listener, buffer) = (&self.process, &mut self.listener, &mut self.stdin);
            let result = guarded("on_stdin_ready", || listener.on_stdin_ready(process, buffer));
            self.stdin.flip();

            let want_more = result.unwrap_or_else(|e| {
                self.report_error(&e, false);
                false
            });
            self.process.set_user_wants_write(want_more);

            if !self.stdin.has_remaining() && !self.process.has_queued_writes() {
                return if want_more {
                    StdinStep::Rearm
                } else {
                    StdinStep::Idle
                };
            }
        }
        StdinStep::Rearm
    }

    /// Write the active buffer, shrinking the attempt on `EAGAIN`.
    fn flush_stdin<M: Multiplexer>(&mut self, mux: &mut M, raw: crate::descriptor::RawDescriptor) -> Flush {
        let key = self.process.key();
        let mut attempt = self.stdin.remaining();
        let mut interrupted = 0;
        while self.stdin.has_remaining() {
            let len = attempt.min(self.stdin.remaining());
            match mux.write(key, raw, &self.stdin.as_slice()[..len]) {
                Ok(0) => return Flush::Blocked,
                Ok(n) => self.stdin.consume(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    attempt /= 4;
                    if attempt == 0 {
                        return Flush::Blocked;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    interrupted += 1;
                    if interrupted > EngineConfig::MAX_INTERRUPTED_WRITES {
                        return Flush::Blocked;
                    }
                }
                Err(e) => return Flush::Failed(e),
            }
        }
        Flush::Drained
    }

    /// Force-close stdin from the worker and drop anything still queued.
    pub(crate) fn close_stdin<M: Multiplexer>(&mut self, mux: &mut M) {
        let descriptor = self.process.descriptor(Stream::Stdin);
        {
            let guard = descriptor.acquire();
            mux.deregister(self.process.key(), Stream::Stdin, guard.as_ref().map(|g| g.raw()));
        }
        if descriptor.close() {
            debug!("stdin of pid {} closed", self.process.pid());
        }
        self.process.discard_writes();
        self.stdin.clear();
        self.stdin.flip();
    }

    /// Remove every stream of this process from the multiplexer.
    pub(crate) fn detach<M: Multiplexer>(&mut self, mux: &mut M) {
        let key = self.process.key();
        for stream in [Stream::Stdin, Stream::Stdout, Stream::Stderr] {
            let guard = self.process.descriptor(stream).acquire();
            mux.deregister(key, stream, guard.as_ref().map(|g| g.raw()));
        }
    }

    /// The exit transition. Runs at most once per process; buffers are
    /// released when `self` drops at the end.
    ///
    /// The exit code is visible through [`Process::exit_value`] from the
    /// start, so listener callbacks see it; `wait_for` returns only after
    /// `on_exit`.
    pub(crate) fn exit(mut self, code: i32) {
        if !self.process.record_exit(code) {
            return;
        }

        self.process.descriptor(Stream::Stdin).close();
        self.process.discard_writes();
        self.process.descriptor(Stream::Stdout).close();
        self.process.descriptor(Stream::Stderr).close();
        self.process.set_state(ProcessState::Exited);

        if !self.stdout_closed {
            self.stdout_closed = true;
            self.deliver(Stream::Stdout, true);
        }
        if !self.stderr_closed {
            self.stderr_closed = true;
            self.deliver(Stream::Stderr, true);
        }

        let (process, listener) = (&self.process, &mut self.listener);
        if let Err(e) = guarded("on_exit", || listener.on_exit(process, code)) {
            self.report_error(&e, false);
        }
        self.process.release_exit(code);

        match exit_code::describe(code) {
            Some(sentinel) => debug!("pid {} exited ({})", self.process.pid(), sentinel),
            None => debug!("pid {} exited with {}", self.process.pid(), code),
        }
    }

    pub(crate) fn report_error(&mut self, err: &ProcloopError, during_launch: bool) {
        let (process, listener) = (&self.process, &mut self.listener);
        if let Err(panic) = guarded("on_error", || listener.on_error(process, err, during_launch)) {
            error!("{} (while handling: {})", panic, err);
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Run a listener callback, turning a panic into an error.
fn guarded<T>(callback: &'static str, f: impl FnOnce() -> T) -> Result<T, ProcloopError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| ProcloopError::ListenerPanicked {
        callback,
        message: panic_message(payload.as_ref()),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::RawDescriptor;
    use crate::platform::{Readiness, Waker};
    use crate::process::ProcessKey;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct NoWake;

    impl Waker for NoWake {
        fn wake(&self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Multiplexer that replays scripted reads and throttles writes.
    #[derive(Default)]
    struct ScriptedMux {
        stdout: VecDeque<io::Result<Vec<u8>>>,
        stderr: VecDeque<io::Result<Vec<u8>>>,
        written: Vec<u8>,
        // Bytes accepted per write call; every other call answers EAGAIN.
        accept_per_write: usize,
        write_calls: usize,
        write_error: Option<io::ErrorKind>,
        deregistered: Vec<Stream>,
    }

    impl Multiplexer for ScriptedMux {
        type Waker = NoWake;

        fn waker(&self) -> io::Result<NoWake> {
            Ok(NoWake)
        }

        fn register_output(&mut self, _: ProcessKey, _: Stream, _: RawDescriptor) -> io::Result<()> {
            Ok(())
        }

        fn arm_stdin(&mut self, _: ProcessKey, _: RawDescriptor) -> io::Result<()> {
            Ok(())
        }

        fn deregister(&mut self, _: ProcessKey, stream: Stream, _: Option<RawDescriptor>) {
            self.deregistered.push(stream);
        }

        fn poll(&mut self, _: &mut Vec<Readiness>, _: Duration) -> io::Result<()> {
            Ok(())
        }

        fn read(&mut self, _: ProcessKey, stream: Stream, _: RawDescriptor, buf: &mut [u8]) -> io::Result<usize> {
            let script = match stream {
                Stream::Stderr => &mut self.stderr,
                _ => &mut self.stdout,
            };
            match script.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        script.push_front(Ok(data[n..].to_vec()));
                    }
                    Ok(n)
                }
            }
        }

        fn write(&mut self, _: ProcessKey, _: RawDescriptor, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.write_error {
                return Err(kind.into());
            }
            self.write_calls += 1;
            if self.write_calls % 2 == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.accept_per_write);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    #[derive(Default)]
    struct Record {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        stdout_closes: usize,
        stderr_closes: usize,
        exits: Vec<i32>,
        errors: Vec<String>,
        launch_errors: usize,
        fills: usize,
    }

    struct Recorder {
        record: Arc<Mutex<Record>>,
        consume: bool,
        fill: Vec<Vec<u8>>,
        panic_on_stdout: bool,
    }

    impl Recorder {
        fn new() -> (Self, Arc<Mutex<Record>>) {
            let record = Arc::new(Mutex::new(Record::default()));
            (
                Self {
                    record: Arc::clone(&record),
                    consume: true,
                    fill: Vec::new(),
                    panic_on_stdout: false,
                },
                record,
            )
        }
    }

    impl ProcessListener for Recorder {
        fn on_stdout(&mut self, _: &Process, buffer: &mut IoBuffer, closed: bool) {
            if self.panic_on_stdout {
                panic!("listener exploded");
            }
            let mut record = self.record.lock().unwrap();
            if self.consume {
                record.stdout.extend_from_slice(buffer.as_slice());
                buffer.consume_all();
            }
            if closed {
                record.stdout_closes += 1;
            }
        }

        fn on_stderr(&mut self, _: &Process, buffer: &mut IoBuffer, closed: bool) {
            let mut record = self.record.lock().unwrap();
            record.stderr.extend_from_slice(buffer.as_slice());
            buffer.consume_all();
            if closed {
                record.stderr_closes += 1;
            }
        }

        fn on_stdin_ready(&mut self, _: &Process, buffer: &mut IoBuffer) -> bool {
            self.record.lock().unwrap().fills += 1;
            if self.fill.is_empty() {
                return false;
            }
            let next = self.fill.remove(0);
            buffer.put_slice(&next);
            !self.fill.is_empty()
        }

        fn on_exit(&mut self, _: &Process, exit_code: i32) {
            self.record.lock().unwrap().exits.push(exit_code);
        }

        fn on_error(&mut self, _: &Process, error: &ProcloopError, during_launch: bool) {
            let mut record = self.record.lock().unwrap();
            record.errors.push(error.to_string());
            if during_launch {
                record.launch_errors += 1;
            }
        }
    }

    fn io_with(listener: Recorder, capacity: usize, redirect: bool) -> ProcessIo {
        let process = Process::detached(1, redirect);
        ProcessIo::new(process, Box::new(listener), capacity, true, None)
    }

    #[test]
    fn test_read_delivers_and_closes_once() {
        let (listener, record) = Recorder::new();
        let mut io = io_with(listener, 8, false);
        let mut mux = ScriptedMux::default();
        mux.stdout.push_back(Ok(b"hello world".to_vec()));
        mux.stdout.push_back(Ok(Vec::new()));

        assert!(io.read_output(&mut mux, Stream::Stdout));
        assert!(io.read_output(&mut mux, Stream::Stdout));
        assert!(!io.read_output(&mut mux, Stream::Stdout));
        assert!(!io.read_output(&mut mux, Stream::Stdout));

        let record = record.lock().unwrap();
        assert_eq!(record.stdout, b"hello world");
        assert_eq!(record.stdout_closes, 1);
        assert!(io.process().descriptor(Stream::Stdout).is_closed());
        assert_eq!(mux.deregistered, vec![Stream::Stdout]);
    }

    #[test]
    fn test_soft_exit_needs_both_streams() {
        let (listener, _record) = Recorder::new();
        let mut io = io_with(listener, 8, false);
        let mut mux = ScriptedMux::default();
        mux.stdout.push_back(Ok(Vec::new()));
        mux.stderr.push_back(Ok(Vec::new()));

        io.read_output(&mut mux, Stream::Stdout);
        assert!(!io.is_soft_exit());
        io.read_output(&mut mux, Stream::Stderr);
        assert!(io.is_soft_exit());
    }

    #[test]
    fn test_read_error_is_fatal_for_that_stream_only() {
        let (listener, record) = Recorder::new();
        let mut io = io_with(listener, 8, false);
        let mut mux = ScriptedMux::default();
        mux.stdout.push_back(Err(io::ErrorKind::ConnectionReset.into()));
        mux.stderr.push_back(Ok(b"still here".to_vec()));

        io.read_output(&mut mux, Stream::Stdout);
        // Eight bytes fit the buffer; the rest comes on the next read.
        assert!(io.read_output(&mut mux, Stream::Stderr));
        assert!(io.read_output(&mut mux, Stream::Stderr));

        let record = record.lock().unwrap();
        assert_eq!(record.errors.len(), 1);
        assert_eq!(record.stdout_closes, 1);
        assert_eq!(record.stderr, b"still here");
        assert!(!io.process().descriptor(Stream::Stderr).is_closed());
    }

    #[test]
    fn test_would_block_is_not_an_error() {
        let (listener, record) = Recorder::new();
        let mut io = io_with(listener, 8, false);
        let mut mux = ScriptedMux::default();
        assert!(!io.read_output(&mut mux, Stream::Stdout));
        assert!(record.lock().unwrap().errors.is_empty());
        assert!(!io.process().descriptor(Stream::Stdout).is_closed());
    }

    #[test]
    fn test_unconsumed_bytes_are_redelivered() {
        struct HalfConsumer(Arc<Mutex<Vec<Vec<u8>>>>);
        impl ProcessListener for HalfConsumer {
            fn on_stdout(&mut self, _: &Process, buffer: &mut IoBuffer, _: bool) {
                self.0.lock().unwrap().push(buffer.as_slice().to_vec());
                // Keep the last byte for the next round.
                let keep = buffer.remaining().min(1);
                buffer.consume(buffer.remaining() - keep);
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let process = Process::detached(1, false);
        let mut io = ProcessIo::new(process, Box::new(HalfConsumer(Arc::clone(&seen))), 8, true, None);
        let mut mux = ScriptedMux::default();
        mux.stdout.push_back(Ok(b"abc".to_vec()));
        mux.stdout.push_back(Ok(b"de".to_vec()));

        io.read_output(&mut mux, Stream::Stdout);
        io.read_output(&mut mux, Stream::Stdout);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], b"abc");
        assert_eq!(seen[1], b"cde");
    }

    #[test]
    fn test_buffer_not_drained_is_reported() {
        let (mut listener, record) = Recorder::new();
        listener.consume = false;
        let mut io = io_with(listener, 4, false);
        let mut mux = ScriptedMux::default();
        mux.stdout.push_back(Ok(b"ab".to_vec()));
        mux.stdout.push_back(Ok(b"cdef".to_vec()));

        assert!(io.read_output(&mut mux, Stream::Stdout));
        assert!(!io.read_output(&mut mux, Stream::Stdout));

        let record = record.lock().unwrap();
        assert_eq!(record.errors.len(), 1);
        assert!(record.errors[0].contains("buffer is full"));
        assert_eq!(record.stdout_closes, 1);
        assert!(io.process().descriptor(Stream::Stdout).is_closed());
    }

    #[test]
    fn test_redirected_stderr_goes_to_stdout() {
        let (listener, record) = Recorder::new();
        let mut io = io_with(listener, 16, true);
        let mut mux = ScriptedMux::default();
        mux.stderr.push_back(Ok(b"oops".to_vec()));
        mux.stderr.push_back(Ok(Vec::new()));
        mux.stdout.push_back(Ok(Vec::new()));

        io.read_output(&mut mux, Stream::Stderr);
        io.read_output(&mut mux, Stream::Stderr);
        io.read_output(&mut mux, Stream::Stdout);

        let record = record.lock().unwrap();
        assert_eq!(record.stdout, b"oops");
        assert!(record.stderr.is_empty());
        // One final call per pipe, both routed to on_stdout.
        assert_eq!(record.stdout_closes, 2);
        assert_eq!(record.stderr_closes, 0);
    }

    #[test]
    fn test_listener_panic_is_routed_to_on_error() {
        let (mut listener, record) = Recorder::new();
        listener.panic_on_stdout = true;
        let mut io = io_with(listener, 16, false);
        let mut mux = ScriptedMux::default();
        mux.stdout.push_back(Ok(b"x".to_vec()));

        io.read_output(&mut mux, Stream::Stdout);

        let record = record.lock().unwrap();
        assert_eq!(record.errors.len(), 1);
        assert!(record.errors[0].contains("listener exploded"));
    }

    #[test]
    fn test_write_crosses_buffer_boundaries_in_order() {
        let (listener, _record) = Recorder::new();
        let mut io = io_with(listener, 16, false);
        let mut mux = ScriptedMux {
            accept_per_write: 5,
            ..ScriptedMux::default()
        };

        let payload: Vec<u8> = (0..100u8).collect();
        io.process().write_stdin(payload.clone()).unwrap();
        io.process().write_stdin(b"tail".to_vec()).unwrap();

        let mut rounds = 0;
        while io.write_stdin(&mut mux) {
            rounds += 1;
            assert!(rounds < 1_000, "write path never settled");
        }

        let mut expected = payload;
        expected.extend_from_slice(b"tail");
        assert_eq!(mux.written, expected);
        assert!(!io.process().has_pending_writes());
    }

    #[test]
    fn test_tombstone_closes_after_queued_data() {
        let (listener, _record) = Recorder::new();
        let mut io = io_with(listener, 16, false);
        let mut mux = ScriptedMux {
            accept_per_write: 64,
            ..ScriptedMux::default()
        };

        io.process().write_stdin(b"last words".to_vec()).unwrap();
        io.process().close_stdin(false).unwrap();

        while io.write_stdin(&mut mux) {}

        assert_eq!(mux.written, b"last words");
        assert!(io.process().descriptor(Stream::Stdin).is_closed());
        assert!(mux.deregistered.contains(&Stream::Stdin));
    }

    #[test]
    fn test_broken_pipe_closes_stdin_quietly() {
        let (listener, record) = Recorder::new();
        let mut io = io_with(listener, 16, false);
        let mut mux = ScriptedMux {
            write_error: Some(io::ErrorKind::BrokenPipe),
            ..ScriptedMux::default()
        };

        io.process().write_stdin(b"nobody listens".to_vec()).unwrap();
        assert!(!io.write_stdin(&mut mux));
        assert!(io.process().descriptor(Stream::Stdin).is_closed());
        assert!(record.lock().unwrap().errors.is_empty());
    }

    #[test]
    fn test_stdin_ready_fills_until_listener_is_done() {
        let (mut listener, record) = Recorder::new();
        listener.fill = vec![b"one ".to_vec(), b"two".to_vec()];
        let mut io = io_with(listener, 16, false);
        let mut mux = ScriptedMux {
            accept_per_write: 64,
            ..ScriptedMux::default()
        };

        io.process().want_write().unwrap();
        while io.write_stdin(&mut mux) {}

        assert_eq!(mux.written, b"one two");
        assert_eq!(record.lock().unwrap().fills, 2);
        assert!(!io.process().user_wants_write());
    }

    #[test]
    fn test_exit_flushes_and_fires_once() {
        let (listener, record) = Recorder::new();
        let mut io = io_with(listener, 16, false);
        let mut mux = ScriptedMux::default();
        mux.stdout.push_back(Ok(Vec::new()));
        io.read_output(&mut mux, Stream::Stdout);

        let process = io.process().clone();
        io.detach(&mut mux);
        io.exit(42);

        let record = record.lock().unwrap();
        assert_eq!(record.exits, vec![42]);
        assert_eq!(record.stdout_closes, 1);
        assert_eq!(record.stderr_closes, 1);
        assert_eq!(process.state(), ProcessState::Exited);
        assert_eq!(process.exit_value().unwrap(), 42);
        assert!(process.descriptor(Stream::Stdin).is_closed());
    }

    #[test]
    fn test_exit_value_is_visible_inside_on_exit() {
        struct ExitObserver(Arc<Mutex<Option<(bool, Option<i32>)>>>);
        impl ProcessListener for ExitObserver {
            fn on_exit(&mut self, process: &Process, _: i32) {
                *self.0.lock().unwrap() = Some((process.is_running(), process.exit_value().ok()));
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let process = Process::detached(1, false);
        let io = ProcessIo::new(process.clone(), Box::new(ExitObserver(Arc::clone(&seen))), 8, true, None);
        io.exit(5);

        assert_eq!(*seen.lock().unwrap(), Some((false, Some(5))));
        assert_eq!(process.wait_for(), 5);
    }

    #[test]
    fn test_settle_exit_drains_everything_after_reap() {
        let (listener, record) = Recorder::new();
        let process = Process::detached(1, false);
        let mut io = ProcessIo::new(process, Box::new(listener), 8, false, Some(0));
        let mut mux = ScriptedMux::default();
        let payload: Vec<u8> = (0..1029u32).map(|i| (i % 251) as u8).collect();
        mux.stdout.push_back(Ok(payload.clone()));
        mux.stdout.push_back(Ok(Vec::new()));
        mux.stderr.push_back(Ok(Vec::new()));

        // 64 reads of 8 bytes per round.
        assert_eq!(io.settle_exit(&mut mux), None);
        assert_eq!(io.settle_exit(&mut mux), None);
        assert_eq!(io.settle_exit(&mut mux), Some(0));

        let record = record.lock().unwrap();
        assert_eq!(record.stdout, payload);
        assert_eq!(record.stdout_closes, 1);
        assert_eq!(record.stderr_closes, 1);
    }

    #[test]
    fn test_settle_exit_gives_up_on_a_quiet_open_pipe() {
        let (listener, record) = Recorder::new();
        let process = Process::detached(1, false);
        let mut io = ProcessIo::new(process, Box::new(listener), 8, false, Some(3));
        let mut mux = ScriptedMux::default();
        mux.stdout.push_back(Ok(b"tail".to_vec()));
        mux.stderr.push_back(Ok(Vec::new()));

        assert_eq!(io.settle_exit(&mut mux), None);
        thread::sleep(EngineConfig::EXIT_DRAIN_GRACE + Duration::from_millis(20));
        assert_eq!(io.settle_exit(&mut mux), Some(3));

        let record = record.lock().unwrap();
        assert_eq!(record.stdout, b"tail");
        assert_eq!(record.stdout_closes, 0);
    }

    #[test]
    fn test_launch_failed_reports_and_exits() {
        let (listener, record) = Recorder::new();
        let process = Process::never_started(5, "missing".into(), false);
        let err = ProcloopError::launch("missing", io::ErrorKind::NotFound.into());

        ProcessIo::launch_failed(process.clone(), Box::new(listener), &err);

        let record = record.lock().unwrap();
        assert_eq!(record.launch_errors, 1);
        assert_eq!(record.exits, vec![exit_code::NEVER_STARTED]);
        assert_eq!(process.wait_for(), exit_code::NEVER_STARTED);
    }
}
