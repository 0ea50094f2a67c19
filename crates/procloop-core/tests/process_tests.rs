//! Integration tests driving real children through a process pool.
//!
//! These rely on `sh`, `cat` and friends, so they only run on Unix.
#![cfg(unix)]

use procloop::{
    exit_code, IoBuffer, PoolConfig, Process, ProcessBuilder, ProcessListener, ProcessPool,
    ProcessState, ProcloopError,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(20);

#[derive(Default)]
struct Record {
    started: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    closes: usize,
    closes_at_exit: Option<usize>,
    exits: Vec<i32>,
    errors: Vec<String>,
    launch_errors: usize,
}

/// Listener that records everything it sees.
#[derive(Clone, Default)]
struct Collector {
    record: Arc<Mutex<Record>>,
}

impl Collector {
    fn new() -> Self {
        Self::default()
    }

    fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.record.lock().unwrap().stdout).into_owned()
    }

    fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.record.lock().unwrap().stderr).into_owned()
    }

    fn exits(&self) -> Vec<i32> {
        self.record.lock().unwrap().exits.clone()
    }

    fn errors(&self) -> Vec<String> {
        self.record.lock().unwrap().errors.clone()
    }

    /// Exactly one exit, preceded by the final callback of both streams.
    fn assert_clean_exit(&self, code: i32) {
        let record = self.record.lock().unwrap();
        assert_eq!(record.exits, vec![code]);
        assert_eq!(record.closes, 2);
        assert_eq!(record.closes_at_exit, Some(2));
    }
}

impl ProcessListener for Collector {
    fn on_started(&mut self, _process: &Process) {
        self.record.lock().unwrap().started += 1;
    }

    fn on_stdout(&mut self, _process: &Process, buffer: &mut IoBuffer, closed: bool) {
        let mut record = self.record.lock().unwrap();
        record.stdout.extend_from_slice(buffer.as_slice());
        buffer.consume_all();
        if closed {
            record.closes += 1;
        }
    }

    fn on_stderr(&mut self, _process: &Process, buffer: &mut IoBuffer, closed: bool) {
        let mut record = self.record.lock().unwrap();
        record.stderr.extend_from_slice(buffer.as_slice());
        buffer.consume_all();
        if closed {
            record.closes += 1;
        }
    }

    fn on_exit(&mut self, _process: &Process, exit_code: i32) {
        let mut record = self.record.lock().unwrap();
        record.closes_at_exit = Some(record.closes);
        record.exits.push(exit_code);
    }

    fn on_error(&mut self, _process: &Process, error: &ProcloopError, during_launch: bool) {
        let mut record = self.record.lock().unwrap();
        record.errors.push(error.to_string());
        if during_launch {
            record.launch_errors += 1;
        }
    }
}

fn pool(workers: usize) -> ProcessPool {
    ProcessPool::new(PoolConfig::default().with_workers(workers)).unwrap()
}

fn sh(script: &str) -> ProcessBuilder {
    let mut builder = ProcessBuilder::new("sh");
    builder.arg("-c").arg(script);
    builder
}

fn wait(process: &Process) -> i32 {
    process
        .wait_for_timeout(WAIT)
        .unwrap_or_else(|| panic!("{:?} did not exit in time", process))
}

#[test]
fn test_cat_echoes_and_exits_cleanly() {
    let pool = pool(2);
    let listener = Collector::new();
    let process = ProcessBuilder::new("cat").start(&pool, listener.clone()).unwrap();
    assert!(process.pid() > 0);

    process.write_stdin("hello\n").unwrap();
    process.close_stdin(false).unwrap();

    assert_eq!(wait(&process), 0);
    assert_eq!(listener.stdout(), "hello\n");
    assert_eq!(listener.record.lock().unwrap().started, 1);
    listener.assert_clean_exit(0);
    assert_eq!(process.state(), ProcessState::Exited);
    assert!(!process.is_running());
    assert_eq!(process.exit_value().unwrap(), 0);
}

#[test]
fn test_missing_executable_fails_at_launch() {
    let pool = pool(1);
    for program in ["procloop-no-such-program", "/nonexistent/procloop/program"] {
        let listener = Collector::new();
        let err = ProcessBuilder::new(program)
            .start(&pool, listener.clone())
            .unwrap_err();

        assert!(err.is_launch_failure(), "{err}");
        assert!(err.is_not_found(), "{err}");
        let record = listener.record.lock().unwrap();
        assert_eq!(record.launch_errors, 1);
        assert_eq!(record.exits, vec![exit_code::NEVER_STARTED]);
        assert_eq!(record.started, 0);
    }
}

#[test]
fn test_immediate_exit_code_delivered_once_each_time() {
    let pool = pool(2);
    let builder = sh("exit 42");
    // Batches keep the number of open pipes well under descriptor limits.
    for _ in 0..20 {
        let runs: Vec<(Process, Collector)> = (0..50)
            .map(|_| {
                let listener = Collector::new();
                let process = builder.start(&pool, listener.clone()).unwrap();
                (process, listener)
            })
            .collect();
        for (process, listener) in runs {
            assert_eq!(wait(&process), 42);
            listener.assert_clean_exit(42);
        }
    }
}

#[test]
fn test_roundtrip_smaller_and_larger_than_buffer() {
    let pool = ProcessPool::new(
        PoolConfig::default()
            .with_workers(1)
            .with_buffer_capacity(1024),
    )
    .unwrap();

    for size in [100usize, 1024, 200_000] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let listener = Collector::new();
        let process = ProcessBuilder::new("cat").start(&pool, listener.clone()).unwrap();

        // Uneven chunks so queue entries straddle buffer boundaries.
        for chunk in payload.chunks(777) {
            process.write_stdin(chunk.to_vec()).unwrap();
        }
        process.close_stdin(false).unwrap();

        assert_eq!(wait(&process), 0);
        assert_eq!(listener.record.lock().unwrap().stdout, payload, "size {size}");
        assert!(!process.has_pending_writes());
    }
}

#[test]
fn test_stdin_ready_callback_streams_data() {
    struct Producer {
        chunks: Vec<Vec<u8>>,
        output: Arc<Mutex<Vec<u8>>>,
    }

    impl ProcessListener for Producer {
        fn on_stdout(&mut self, _process: &Process, buffer: &mut IoBuffer, _closed: bool) {
            self.output.lock().unwrap().extend_from_slice(buffer.as_slice());
            buffer.consume_all();
        }

        fn on_stdin_ready(&mut self, process: &Process, buffer: &mut IoBuffer) -> bool {
            if let Some(chunk) = self.chunks.pop() {
                buffer.put_slice(&chunk);
            }
            if self.chunks.is_empty() {
                process.close_stdin(false).unwrap();
                return false;
            }
            true
        }
    }

    let pool = pool(1);
    let output = Arc::new(Mutex::new(Vec::new()));
    let chunks: Vec<Vec<u8>> = (0..50).rev().map(|i| format!("line {i}\n").into_bytes()).collect();
    let expected: Vec<u8> = chunks.iter().rev().flatten().copied().collect();

    let process = ProcessBuilder::new("cat")
        .start(
            &pool,
            Producer {
                chunks,
                output: Arc::clone(&output),
            },
        )
        .unwrap();
    process.want_write().unwrap();

    assert_eq!(wait(&process), 0);
    assert_eq!(*output.lock().unwrap(), expected);
}

#[test]
fn test_forced_close_twice() {
    let pool = pool(1);
    let listener = Collector::new();
    let process = ProcessBuilder::new("cat").start(&pool, listener.clone()).unwrap();

    process.write_stdin("never sent?").unwrap();
    process.close_stdin(true).unwrap();
    process.close_stdin(true).unwrap();
    assert!(matches!(
        process.write_stdin("late"),
        Err(ProcloopError::StdinClosed)
    ));
    assert!(matches!(
        process.close_stdin(false),
        Err(ProcloopError::StdinClosed)
    ));

    assert_eq!(wait(&process), 0);
    listener.assert_clean_exit(0);
    assert!(listener.errors().is_empty());
}

#[test]
fn test_soft_exit_waits_for_real_exit() {
    let pool = pool(1);
    let listener = Collector::new();
    let process = sh("exec >&- 2>&-; sleep 1; exit 3")
        .start(&pool, listener.clone())
        .unwrap();

    thread::sleep(Duration::from_millis(400));
    assert!(process.is_running());
    assert!(process.exit_value().is_err());
    assert!(listener.exits().is_empty());
    assert_eq!(listener.record.lock().unwrap().closes, 2);

    assert_eq!(wait(&process), 3);
    listener.assert_clean_exit(3);
}

#[test]
fn test_soft_exit_detection_disabled() {
    let pool = ProcessPool::new(
        PoolConfig::default()
            .with_workers(1)
            .with_soft_exit_detection(false),
    )
    .unwrap();
    let listener = Collector::new();
    let process = sh("echo done; echo oops 1>&2; exit 7")
        .start(&pool, listener.clone())
        .unwrap();

    assert_eq!(wait(&process), 7);
    assert_eq!(listener.stdout(), "done\n");
    assert_eq!(listener.stderr(), "oops\n");
    listener.assert_clean_exit(7);
}

#[test]
fn test_soft_exit_disabled_delivers_output_larger_than_one_drain() {
    let pool = ProcessPool::new(
        PoolConfig::default()
            .with_workers(1)
            .with_buffer_capacity(256)
            .with_soft_exit_detection(false),
    )
    .unwrap();

    for _ in 0..5 {
        let listener = Collector::new();
        let process = sh("head -c 60000 /dev/zero")
            .start(&pool, listener.clone())
            .unwrap();
        process.close_stdin(false).unwrap();

        assert_eq!(wait(&process), 0);
        assert_eq!(listener.record.lock().unwrap().stdout.len(), 60000);
        listener.assert_clean_exit(0);
    }
}

#[test]
fn test_partial_consumer_receives_every_line() {
    /// Consumes only complete lines and leaves the rest for the next call.
    struct LineReader {
        lines: Arc<Mutex<Vec<String>>>,
    }

    impl ProcessListener for LineReader {
        fn on_stdout(&mut self, _process: &Process, buffer: &mut IoBuffer, closed: bool) {
            let data = buffer.as_slice();
            let end = match data.iter().rposition(|&b| b == b'\n') {
                Some(last) => last + 1,
                None if closed => data.len(),
                None => return,
            };
            let mut lines = self.lines.lock().unwrap();
            for line in String::from_utf8_lossy(&data[..end]).lines() {
                lines.push(line.to_string());
            }
            buffer.consume(end);
        }
    }

    for soft_exit in [true, false] {
        let pool = ProcessPool::new(
            PoolConfig::default()
                .with_workers(1)
                .with_buffer_capacity(64)
                .with_soft_exit_detection(soft_exit),
        )
        .unwrap();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let listener = LineReader {
            lines: Arc::clone(&lines),
        };
        let process = sh("i=0; while [ $i -lt 2000 ]; do echo \"line $i\"; i=$((i+1)); done")
            .start(&pool, listener)
            .unwrap();
        process.close_stdin(false).unwrap();

        assert_eq!(wait(&process), 0);
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2000, "soft exit detection: {}", soft_exit);
        assert_eq!(lines[0], "line 0");
        assert_eq!(lines[1999], "line 1999");
    }
}

#[test]
fn test_buffer_not_drained_destroys_process() {
    struct Hoarder(Collector);

    impl ProcessListener for Hoarder {
        fn on_stdout(&mut self, _process: &Process, _buffer: &mut IoBuffer, closed: bool) {
            if closed {
                self.0.record.lock().unwrap().closes += 1;
            }
        }

        fn on_stderr(&mut self, process: &Process, buffer: &mut IoBuffer, closed: bool) {
            self.0.on_stderr(process, buffer, closed)
        }

        fn on_exit(&mut self, process: &Process, exit_code: i32) {
            self.0.on_exit(process, exit_code)
        }

        fn on_error(&mut self, process: &Process, error: &ProcloopError, during_launch: bool) {
            self.0.on_error(process, error, during_launch)
        }
    }

    let pool = ProcessPool::new(
        PoolConfig::default()
            .with_workers(1)
            .with_buffer_capacity(16),
    )
    .unwrap();
    let listener = Collector::new();
    let process = sh("head -c 4096 /dev/zero; exec sleep 30")
        .start(&pool, Hoarder(listener.clone()))
        .unwrap();

    let code = wait(&process);
    assert_eq!(code, 9, "killed with SIGKILL");
    let errors = listener.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("buffer is full"), "{}", errors[0]);
    listener.assert_clean_exit(9);
}

#[test]
fn test_listener_panic_is_reported() {
    struct Grumpy(Collector);

    impl ProcessListener for Grumpy {
        fn on_stdout(&mut self, _process: &Process, buffer: &mut IoBuffer, _closed: bool) {
            buffer.consume_all();
            panic!("no output please");
        }

        fn on_exit(&mut self, process: &Process, exit_code: i32) {
            self.0.on_exit(process, exit_code)
        }

        fn on_error(&mut self, process: &Process, error: &ProcloopError, during_launch: bool) {
            self.0.on_error(process, error, during_launch)
        }
    }

    let pool = pool(1);
    let listener = Collector::new();
    let process = sh("echo hi").start(&pool, Grumpy(listener.clone())).unwrap();

    assert_eq!(wait(&process), 0);
    assert_eq!(listener.exits(), vec![0]);
    let errors = listener.errors();
    assert!(!errors.is_empty());
    assert!(errors.iter().all(|e| e.contains("no output please")));
}

#[test]
fn test_redirect_error_stream() {
    let pool = pool(1);
    let listener = Collector::new();
    let process = sh("echo out; echo err 1>&2")
        .redirect_error_stream(true)
        .start(&pool, listener.clone())
        .unwrap();

    assert_eq!(wait(&process), 0);
    let stdout = listener.stdout();
    assert!(stdout.contains("out\n"));
    assert!(stdout.contains("err\n"));
    assert!(listener.stderr().is_empty());
    listener.assert_clean_exit(0);
}

#[test]
fn test_current_dir_and_environment() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool(1);

    let listener = Collector::new();
    let process = sh("pwd -P; printf '%s' \"$PROCLOOP_TEST_VALUE\"")
        .current_dir(dir.path())
        .env("PROCLOOP_TEST_VALUE", "forty-two")
        .start(&pool, listener.clone())
        .unwrap();
    assert_eq!(wait(&process), 0);

    let expected = dir.path().canonicalize().unwrap();
    assert_eq!(
        listener.stdout(),
        format!("{}\nforty-two", expected.display())
    );

    let listener = Collector::new();
    let process = ProcessBuilder::new("/usr/bin/env")
        .env_clear()
        .env("ONLY", "1")
        .start(&pool, listener.clone())
        .unwrap();
    assert_eq!(wait(&process), 0);
    assert_eq!(listener.stdout(), "ONLY=1\n");
}

#[test]
fn test_destroy_reports_signal() {
    let pool = pool(1);
    let listener = Collector::new();
    let process = ProcessBuilder::new("sleep")
        .arg("30")
        .start(&pool, listener.clone())
        .unwrap();

    process.destroy(false).unwrap();
    assert_eq!(wait(&process), 15);
    listener.assert_clean_exit(15);
    // Destroying an exited process is a no-op.
    process.destroy(true).unwrap();
}

#[test]
fn test_shutdown_kills_live_processes() {
    let pool = pool(2);
    let listeners: Vec<Collector> = (0..3).map(|_| Collector::new()).collect();
    let processes: Vec<Process> = listeners
        .iter()
        .map(|listener| {
            ProcessBuilder::new("sleep")
                .arg("30")
                .start(&pool, listener.clone())
                .unwrap()
        })
        .collect();

    pool.shutdown();

    for (process, listener) in processes.iter().zip(&listeners) {
        assert_eq!(wait(process), exit_code::KILLED_ON_SHUTDOWN);
        listener.assert_clean_exit(exit_code::KILLED_ON_SHUTDOWN);
    }
    assert_eq!(pool.active_workers(), 0);
}

#[test]
fn test_idle_worker_retires_and_restarts() {
    let pool = ProcessPool::new(
        PoolConfig::default()
            .with_workers(1)
            .with_poll_interval(Duration::from_millis(100))
            .with_linger_time(Duration::from_millis(1000)),
    )
    .unwrap();

    let process = ProcessBuilder::new("true")
        .start(&pool, Collector::new())
        .unwrap();
    assert_eq!(wait(&process), 0);
    assert_eq!(pool.active_workers(), 1);

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while pool.active_workers() > 0 {
        assert!(std::time::Instant::now() < deadline, "worker never retired");
        thread::sleep(Duration::from_millis(100));
    }

    let listener = Collector::new();
    let process = sh("echo again").start(&pool, listener.clone()).unwrap();
    assert_eq!(wait(&process), 0);
    assert_eq!(listener.stdout(), "again\n");
}
