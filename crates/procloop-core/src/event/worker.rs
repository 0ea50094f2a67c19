use super::processor::EventProcessor;
use super::Command;
use crate::config::{EngineConfig, PoolConfig};
use crate::error::{ProcloopError, Result};
use crate::platform::{Backend, Multiplexer, PlatformBackend, PollWaker, Waker};
use crate::process::ProcessIo;
use std::collections::VecDeque;
use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Lifecycle of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerStatus {
    /// No thread; the next assignment starts one.
    Idle,
    Running,
    /// The pool was shut down; assignments are refused.
    Stopped,
}

struct WorkerSlot {
    status: WorkerStatus,
    inbox: VecDeque<Command>,
    waker: Option<PollWaker>,
    thread: Option<JoinHandle<()>>,
}

/// One worker of a pool. Status, inbox and waker share a single lock, so
/// assigning a process and deciding to retire cannot interleave.
pub(crate) struct WorkerShared {
    index: usize,
    config: Arc<PoolConfig>,
    slot: Mutex<WorkerSlot>,
}

impl WorkerShared {
    pub(crate) fn new(index: usize, config: Arc<PoolConfig>) -> Self {
        Self {
            index,
            config,
            slot: Mutex::new(WorkerSlot {
                status: WorkerStatus::Idle,
                inbox: VecDeque::new(),
                waker: None,
                thread: None,
            }),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        self.slot.lock().unwrap().status
    }

    /// Take every queued command.
    pub(crate) fn take_inbox(&self) -> VecDeque<Command> {
        std::mem::take(&mut self.slot.lock().unwrap().inbox)
    }

    /// Queue a command for a running worker and wake it.
    ///
    /// Commands for an idle or stopped worker are dropped: such a worker
    /// owns no live process.
    pub(crate) fn submit(&self, command: Command) {
        let mut slot = self.slot.lock().unwrap();
        if slot.status != WorkerStatus::Running {
            return;
        }
        slot.inbox.push_back(command);
        wake(&slot, self.index);
    }

    /// Hand a process to this worker, starting its thread if needed.
    ///
    /// On failure the process comes back to the caller untouched.
    pub(crate) fn assign(
        self: &Arc<Self>,
        io: Box<ProcessIo>,
    ) -> std::result::Result<(), (ProcloopError, Box<ProcessIo>)> {
        let mut slot = self.slot.lock().unwrap();
        match slot.status {
            WorkerStatus::Stopped => return Err((ProcloopError::PoolShutdown, io)),
            WorkerStatus::Idle => {
                if let Err(e) = self.start(&mut slot) {
                    return Err((e, io));
                }
            }
            WorkerStatus::Running => {}
        }
        slot.inbox.push_back(Command::Register(io));
        wake(&slot, self.index);
        Ok(())
    }

    /// Start the thread and wait until its multiplexer exists.
    fn start(self: &Arc<Self>, slot: &mut WorkerSlot) -> Result<()> {
        // A previous thread that retired is already gone or about to be.
        slot.thread.take();

        let (ready_tx, ready_rx) = mpsc::sync_channel::<io::Result<PollWaker>>(1);
        let shared = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{}-{}", EngineConfig::WORKER_THREAD_PREFIX, self.index))
            .spawn(move || run(shared, ready_tx))
            .map_err(|e| ProcloopError::Io {
                message: format!("failed to start worker {}", self.index),
                source: Some(e),
            })?;

        let waker = match ready_rx.recv() {
            Ok(Ok(waker)) => waker,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(ProcloopError::Io {
                    message: format!("failed to create multiplexer for worker {}", self.index),
                    source: Some(e),
                });
            }
            Err(_) => {
                let _ = handle.join();
                return Err(ProcloopError::WorkerFailed {
                    index: self.index,
                    message: "worker exited before its multiplexer was ready".into(),
                });
            }
        };

        slot.status = WorkerStatus::Running;
        slot.waker = Some(waker);
        slot.thread = Some(handle);
        info!("Started worker {}", self.index);
        Ok(())
    }

    /// Retire if nothing arrived while the loop was idle. Called by the loop
    /// itself; returns `true` when the thread should exit.
    pub(crate) fn try_retire(&self) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.status != WorkerStatus::Running || !slot.inbox.is_empty() {
            return false;
        }
        slot.status = WorkerStatus::Idle;
        slot.waker = None;
        // Detach: a thread cannot join itself.
        slot.thread.take();
        debug!("Worker {} retired after idling", self.index);
        true
    }

    /// The loop died; forget the thread so the next assignment restarts it.
    /// Returns whatever was still queued.
    pub(crate) fn mark_failed(&self) -> VecDeque<Command> {
        let mut slot = self.slot.lock().unwrap();
        if slot.status == WorkerStatus::Running {
            slot.status = WorkerStatus::Idle;
        }
        slot.waker = None;
        slot.thread.take();
        std::mem::take(&mut slot.inbox)
    }

    /// Stop accepting work, tell the loop to kill its processes and return
    /// the thread to join.
    pub(crate) fn stop(&self) -> Option<JoinHandle<()>> {
        let mut slot = self.slot.lock().unwrap();
        let was_running = slot.status == WorkerStatus::Running;
        slot.status = WorkerStatus::Stopped;
        if was_running {
            slot.inbox.push_back(Command::Shutdown);
            wake(&slot, self.index);
        }
        slot.waker = None;
        slot.thread.take()
    }
}

fn wake(slot: &WorkerSlot, index: usize) {
    if let Some(waker) = &slot.waker {
        if let Err(e) = waker.wake() {
            warn!("Failed to wake worker {}: {}", index, e);
        }
    }
}

/// Thread body: build the multiplexer, report readiness, run the loop.
fn run(shared: Arc<WorkerShared>, ready: mpsc::SyncSender<io::Result<PollWaker>>) {
    let mux = match Backend::make_multiplexer(shared.config().buffer_capacity) {
        Ok(mux) => mux,
        Err(e) => {
            error!("Worker {} could not create its multiplexer: {}", shared.index(), e);
            let _ = ready.send(Err(e));
            return;
        }
    };
    let waker = match mux.waker() {
        Ok(waker) => waker,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(waker)).is_err() {
        return;
    }
    drop(ready);

    EventProcessor::new(mux, shared).run();
}
