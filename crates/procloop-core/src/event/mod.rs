//! Worker threads and their event loops.
//!
//! A [`WorkerShared`] is the pool-side face of one worker: its status, its
//! inbox and the waker of its multiplexer, all behind one mutex. The thread
//! itself runs an [`EventProcessor`](processor::EventProcessor) that owns the
//! multiplexer and every [`ProcessIo`] assigned to the worker.

mod processor;
mod worker;

pub(crate) use worker::{WorkerShared, WorkerStatus};

use crate::process::{ProcessIo, ProcessKey};

/// Message from application threads to a worker.
pub(crate) enum Command {
    /// Take ownership of a freshly spawned process.
    Register(Box<ProcessIo>),
    /// Stdin has queued data or the listener wants to fill it.
    WantWrite(ProcessKey),
    /// Stdin was force-closed; drop its registration.
    CloseStdin(ProcessKey),
    /// Kill everything and stop the loop.
    Shutdown,
}
