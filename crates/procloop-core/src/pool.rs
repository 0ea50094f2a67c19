//! The process pool: spawning and worker assignment.

use crate::builder::{display_command, IoMode, ProcessBuilder};
use crate::config::PoolConfig;
use crate::error::{ProcloopError, Result};
use crate::event::{WorkerShared, WorkerStatus};
use crate::exit_code;
use crate::listener::ProcessListener;
use crate::platform::{backend_name, Backend, PlatformBackend, SpawnRequest, SpawnedChild};
use crate::process::{Process, ProcessIo, ProcessState, StartedChild};
use std::ffi::OsString;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use tracing::{debug, info, warn};

/// A fixed set of event-loop workers that drive child processes.
///
/// Workers start lazily on their first assignment and retire after idling
/// for the configured linger time. New processes are assigned round robin.
///
/// ```no_run
/// use procloop::{DiscardListener, PoolConfig, ProcessBuilder, ProcessPool};
///
/// let pool = ProcessPool::new(PoolConfig::default().with_workers(2))?;
/// let process = ProcessBuilder::new("true").start(&pool, DiscardListener)?;
/// assert_eq!(process.wait_for(), 0);
/// # Ok::<(), procloop::ProcloopError>(())
/// ```
pub struct ProcessPool {
    config: Arc<PoolConfig>,
    workers: Vec<Arc<WorkerShared>>,
    next: Mutex<usize>,
    next_key: AtomicU64,
    shut_down: AtomicBool,
}

impl ProcessPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// A process-wide pool with the default configuration, created on first
    /// use. It is never shut down implicitly.
    pub fn global() -> &'static ProcessPool {
        static GLOBAL: OnceLock<ProcessPool> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::build(PoolConfig::default()))
    }

    fn build(config: PoolConfig) -> Self {
        let config = Arc::new(config);
        let workers = (0..config.workers)
            .map(|index| Arc::new(WorkerShared::new(index, Arc::clone(&config))))
            .collect();
        info!(
            "Created process pool with {} workers on {}",
            config.workers,
            backend_name()
        );
        Self {
            config,
            workers,
            next: Mutex::new(0),
            next_key: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Number of workers whose thread is currently running.
    pub fn active_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|worker| worker.status() == WorkerStatus::Running)
            .count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Spawn a child and hand it to a worker.
    ///
    /// Launch failures are reported to the listener (`on_error` with
    /// `during_launch = true`, then `on_exit` with
    /// [`exit_code::NEVER_STARTED`]) and returned.
    pub fn spawn<L: ProcessListener>(&self, builder: &ProcessBuilder, listener: L) -> Result<Process> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let command = builder.display_command();
        let redirect = builder.is_redirect_error_stream();
        let listener: Box<dyn ProcessListener> = Box::new(listener);

        let child = match self.launch(builder) {
            Ok(child) => child,
            Err(err) => {
                warn!("Failed to launch {}: {}", command, err);
                let process = Process::never_started(key, command, redirect);
                ProcessIo::launch_failed(process, listener, &err);
                return Err(err);
            }
        };

        let early_exit = child.early_exit;
        let process = Process::started(
            key,
            command,
            redirect,
            StartedChild {
                pid: child.pid,
                handle: child.handle,
                stdin: child.stdin,
                stdout: child.stdout,
                stderr: child.stderr,
                reaped: early_exit.is_some(),
            },
        );
        debug!("Spawned pid {} ({})", process.pid(), process.command());

        let mut io = ProcessIo::new(
            process.clone(),
            listener,
            self.config.buffer_capacity,
            self.config.soft_exit_detection,
            early_exit,
        );
        process.set_state(ProcessState::Running);
        io.started();

        let worker = self.next_worker();
        process.bind_worker(Arc::clone(worker));
        if let Err((err, io)) = worker.assign(Box::new(io)) {
            warn!("Failed to assign pid {} to worker {}: {}", process.pid(), worker.index(), err);
            let mut io = *io;
            io.report_error(&err, true);
            io.kill_and_reap();
            io.exit(exit_code::NEVER_STARTED);
            return Err(err);
        }
        Ok(process)
    }

    fn launch(&self, builder: &ProcessBuilder) -> Result<SpawnedChild> {
        if self.is_shut_down() {
            return Err(ProcloopError::PoolShutdown);
        }
        if builder.get_io_mode() != IoMode::NonBlocking {
            return Err(ProcloopError::UnsupportedIoMode(builder.get_io_mode()));
        }

        let mut command: Vec<OsString> = builder.get_command().to_vec();
        let user = builder.get_effective_user();
        if let Some(user) = user {
            user.elevate(&mut command)?;
        }

        let environment = builder.environment();
        let spawned = Backend::spawn(&SpawnRequest {
            command: &command,
            environment: &environment,
            current_dir: builder.get_current_dir(),
        })
        .map_err(|e| ProcloopError::launch(display_command(&command), e));

        if let Some(user) = user {
            if let Err(e) = user.descend(&mut command) {
                warn!("Effective user hook failed to restore the command: {}", e);
            }
        }
        spawned
    }

    fn next_worker(&self) -> &Arc<WorkerShared> {
        let mut next = self.next.lock().unwrap();
        let worker = &self.workers[*next];
        *next = (*next + 1) % self.workers.len();
        worker
    }

    /// Stop every worker, killing its live processes with exit code
    /// [`exit_code::KILLED_ON_SHUTDOWN`]. Blocks until the workers have
    /// finished; idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down process pool");
        let handles: Vec<_> = self.workers.iter().filter_map(|worker| worker.stop()).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("A worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("workers", &self.workers.len())
            .field("active_workers", &self.active_workers())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_config() {
        assert!(matches!(
            ProcessPool::new(PoolConfig::default().with_workers(0)),
            Err(ProcloopError::Config { .. })
        ));
    }

    #[test]
    fn test_workers_start_lazily() {
        let pool = ProcessPool::new(PoolConfig::default().with_workers(3)).unwrap();
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(pool.active_workers(), 0);
    }

    #[test]
    fn test_round_robin() {
        let pool = ProcessPool::new(PoolConfig::default().with_workers(3)).unwrap();
        let picked: Vec<usize> = (0..7).map(|_| pool.next_worker().index()).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_refuses_spawns() {
        let pool = ProcessPool::new(PoolConfig::default().with_workers(1)).unwrap();
        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_shut_down());

        let err = ProcessBuilder::new("true")
            .start(&pool, crate::DiscardListener)
            .unwrap_err();
        assert!(matches!(err, ProcloopError::PoolShutdown));
    }

    #[test]
    fn test_unsupported_io_mode_is_a_launch_failure() {
        let pool = ProcessPool::new(PoolConfig::default().with_workers(1)).unwrap();
        let err = ProcessBuilder::new("true")
            .io_mode(IoMode::Pty)
            .start(&pool, crate::DiscardListener)
            .unwrap_err();
        assert!(matches!(err, ProcloopError::UnsupportedIoMode(IoMode::Pty)));
        assert!(err.is_launch_failure());
    }
}
