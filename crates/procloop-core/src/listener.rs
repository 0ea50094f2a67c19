//! The listener contract: the only way application code sees a child's I/O.
//!
//! Every callback runs on the worker thread that owns the process. Callbacks
//! must not block. Calling [`Process::wait_for`] from inside one would
//! deadlock the worker. A panic inside a callback is caught and reported
//! through [`ProcessListener::on_error`].

use crate::buffer::IoBuffer;
use crate::error::ProcloopError;
use crate::process::Process;

/// Receives the I/O and lifecycle events of one child process.
///
/// All methods have defaults: output is discarded, stdin is never filled,
/// and lifecycle events are ignored.
pub trait ProcessListener: Send + 'static {
    /// The child has been spawned. Runs on the spawning thread, before the
    /// process is handed to its worker.
    fn on_started(&mut self, _process: &Process) {}

    /// New stdout bytes are in `buffer`'s window.
    ///
    /// Consume bytes by advancing the buffer's position. Unconsumed bytes
    /// are kept and delivered again with the next read. A buffer that stays
    /// full after this returns is reported as
    /// [`ProcloopError::BufferNotDrained`] and the process is destroyed.
    /// `closed` is `true` on the final call for each pipe. With the error
    /// stream redirected both pipes report here, so `closed` arrives twice.
    fn on_stdout(&mut self, _process: &Process, buffer: &mut IoBuffer, _closed: bool) {
        buffer.consume_all();
    }

    /// Same as [`on_stdout`](Self::on_stdout) for stderr. Not called when
    /// the error stream is redirected.
    fn on_stderr(&mut self, _process: &Process, buffer: &mut IoBuffer, _closed: bool) {
        buffer.consume_all();
    }

    /// Stdin can take more data and the write queue is empty.
    ///
    /// Only called after [`Process::want_write`]. Fill `buffer` and return
    /// `true` to be called again once it has been written.
    fn on_stdin_ready(&mut self, _process: &Process, _buffer: &mut IoBuffer) -> bool {
        false
    }

    /// The process has terminated. Called exactly once, after the final
    /// `closed` output callbacks.
    fn on_exit(&mut self, _process: &Process, _exit_code: i32) {}

    /// Something failed. `during_launch` is `true` when the child never ran.
    fn on_error(&mut self, _process: &Process, _error: &ProcloopError, _during_launch: bool) {}
}

/// Listener that discards all output.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardListener;

impl ProcessListener for DiscardListener {}

impl<L: ProcessListener + ?Sized> ProcessListener for Box<L> {
    fn on_started(&mut self, process: &Process) {
        (**self).on_started(process)
    }

    fn on_stdout(&mut self, process: &Process, buffer: &mut IoBuffer, closed: bool) {
        (**self).on_stdout(process, buffer, closed)
    }

    fn on_stderr(&mut self, process: &Process, buffer: &mut IoBuffer, closed: bool) {
        (**self).on_stderr(process, buffer, closed)
    }

    fn on_stdin_ready(&mut self, process: &Process, buffer: &mut IoBuffer) -> bool {
        (**self).on_stdin_ready(process, buffer)
    }

    fn on_exit(&mut self, process: &Process, exit_code: i32) {
        (**self).on_exit(process, exit_code)
    }

    fn on_error(&mut self, process: &Process, error: &ProcloopError, during_launch: bool) {
        (**self).on_error(process, error, during_launch)
    }
}
