use super::{Command, WorkerShared};
use crate::error::ProcloopError;
use crate::exit_code;
use crate::platform::{backend_name, Multiplexer, Readiness, Termination};
use crate::process::{ProcessIo, ProcessKey, ProcessState, Stream};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

enum Flow {
    Continue,
    Stop,
}

/// The event loop of one worker thread.
///
/// Owns the multiplexer, the live processes (keyed by process key) and the
/// dead pool of processes whose output is finished but whose exit status has
/// not been collected yet.
pub(crate) struct EventProcessor<M: Multiplexer> {
    mux: M,
    shared: Arc<WorkerShared>,
    live: HashMap<ProcessKey, ProcessIo>,
    dead: Vec<ProcessIo>,
    events: Vec<Readiness>,
    idle_ticks: u32,
}

impl<M: Multiplexer> EventProcessor<M> {
    pub(crate) fn new(mux: M, shared: Arc<WorkerShared>) -> Self {
        Self {
            mux,
            shared,
            live: HashMap::new(),
            dead: Vec::new(),
            events: Vec::with_capacity(crate::config::EngineConfig::EVENT_BATCH_SIZE),
            idle_ticks: 0,
        }
    }

    pub(crate) fn run(mut self) {
        debug!(
            "Worker {} event loop running on {}",
            self.shared.index(),
            backend_name()
        );
        loop {
            match self.tick() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
        debug!("Worker {} event loop stopped", self.shared.index());
    }

    fn tick(&mut self) -> io::Result<Flow> {
        let config = self.shared.config();
        let poll_interval = config.poll_interval;
        let soft_exit_detection = config.soft_exit_detection;
        let linger_iterations = config.linger_iterations();

        self.events.clear();
        self.mux.poll(&mut self.events, poll_interval)?;
        let mut active = !self.events.is_empty();

        for command in self.shared.take_inbox() {
            active = true;
            match command {
                Command::Register(io) => self.register(*io),
                Command::WantWrite(key) => {
                    if let Some(io) = self.live.get_mut(&key) {
                        arm_stdin(&mut self.mux, io);
                    }
                }
                Command::CloseStdin(key) => {
                    if let Some(io) = self.live.get_mut(&key) {
                        io.close_stdin(&mut self.mux);
                    }
                }
                Command::Shutdown => {
                    self.shutdown();
                    return Ok(Flow::Stop);
                }
            }
        }

        let events = std::mem::take(&mut self.events);
        for ready in &events {
            self.dispatch(*ready);
        }
        self.events = events;

        if soft_exit_detection {
            self.collect_soft_exits();
        } else {
            self.poll_live();
        }
        self.sweep_dead();

        if active || !self.live.is_empty() || !self.dead.is_empty() {
            self.idle_ticks = 0;
        } else {
            self.idle_ticks += 1;
            if self.idle_ticks > linger_iterations && self.shared.try_retire() {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Register the output streams and let the child run.
    fn register(&mut self, mut io: ProcessIo) {
        let process = io.process().clone();
        let key = process.key();
        let attached = [Stream::Stdout, Stream::Stderr]
            .into_iter()
            .try_for_each(|stream| match process.descriptor(stream).acquire() {
                Some(guard) => self.mux.register_output(key, stream, guard.raw()),
                None => Ok(()),
            })
            .and_then(|()| process.resume());

        match attached {
            Ok(()) => {
                debug!(
                    "Worker {} registered pid {} ({})",
                    self.shared.index(),
                    process.pid(),
                    process.command()
                );
                if process.has_queued_writes() || process.user_wants_write() {
                    arm_stdin(&mut self.mux, &mut io);
                }
                self.live.insert(key, io);
            }
            Err(e) => {
                error!("Failed to register pid {}: {}", process.pid(), e);
                io.report_error(
                    &ProcloopError::Io {
                        message: format!("failed to register pid {}", process.pid()),
                        source: Some(e),
                    },
                    false,
                );
                if let Err(e) = process.signal(Termination::Kill) {
                    warn!("Failed to kill pid {}: {}", process.pid(), e);
                }
                self.dead.push(io);
            }
        }
    }

    fn dispatch(&mut self, ready: Readiness) {
        let Some(io) = self.live.get_mut(&ready.key) else {
            return;
        };
        match ready.stream {
            Stream::Stdin => {
                if io.write_stdin(&mut self.mux) {
                    arm_stdin(&mut self.mux, io);
                }
            }
            stream => {
                io.read_output(&mut self.mux, stream);
            }
        }
    }

    /// Move processes whose output streams both hit EOF to the dead pool.
    fn collect_soft_exits(&mut self) {
        let finished: Vec<ProcessKey> = self
            .live
            .iter()
            .filter(|(_, io)| io.is_soft_exit())
            .map(|(key, _)| *key)
            .collect();
        for key in finished {
            if let Some(io) = self.live.remove(&key) {
                io.process().set_state(ProcessState::SoftExited);
                self.dead.push(io);
            }
        }
    }

    /// Check every live process for termination. A reaped process stays
    /// live until what is left in its pipes has been delivered.
    fn poll_live(&mut self) {
        let mux = &mut self.mux;
        let exited: Vec<(ProcessKey, i32)> = self
            .live
            .iter_mut()
            .filter_map(|(key, io)| io.settle_exit(mux).map(|code| (*key, code)))
            .collect();
        for (key, code) in exited {
            if let Some(io) = self.live.remove(&key) {
                self.finish(io, code);
            }
        }
    }

    fn sweep_dead(&mut self) {
        let mut i = 0;
        while i < self.dead.len() {
            match self.dead[i].poll_exit() {
                Some(code) => {
                    let io = self.dead.swap_remove(i);
                    self.finish(io, code);
                }
                None => i += 1,
            }
        }
    }

    fn finish(&mut self, mut io: ProcessIo, code: i32) {
        io.detach(&mut self.mux);
        io.exit(code);
    }

    fn shutdown(&mut self) {
        let mut all: Vec<ProcessIo> = self.live.drain().map(|(_, io)| io).collect();
        all.append(&mut self.dead);
        info!(
            "Worker {} shutting down, killing {} processes",
            self.shared.index(),
            all.len()
        );
        for mut io in all {
            io.kill_and_reap();
            self.finish(io, exit_code::KILLED_ON_SHUTDOWN);
        }
    }

    /// The multiplexer broke: fail every process this worker knows about.
    fn fail(&mut self, err: io::Error) {
        let index = self.shared.index();
        error!("Worker {} event loop failed: {}", index, err);

        let mut all: Vec<ProcessIo> = self.live.drain().map(|(_, io)| io).collect();
        all.append(&mut self.dead);
        for command in self.shared.mark_failed() {
            if let Command::Register(io) = command {
                all.push(*io);
            }
        }

        let failure = ProcloopError::WorkerFailed {
            index,
            message: err.to_string(),
        };
        for mut io in all {
            io.report_error(&failure, false);
            let code = io.kill_and_reap();
            self.finish(io, code);
        }
    }
}

/// Ask for one writable notification on stdin.
fn arm_stdin<M: Multiplexer>(mux: &mut M, io: &mut ProcessIo) {
    let process = io.process().clone();
    let result = match process.descriptor(Stream::Stdin).acquire() {
        Some(guard) => mux.arm_stdin(process.key(), guard.raw()),
        None => return,
    };
    if let Err(e) = result {
        warn!("Failed to watch stdin of pid {}: {}", process.pid(), e);
        io.report_error(
            &ProcloopError::Stream {
                stream: Stream::Stdin,
                source: e,
            },
            false,
        );
        io.close_stdin(mux);
    }
}
