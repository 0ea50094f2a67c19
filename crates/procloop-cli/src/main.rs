//! procloop - run child processes through the procloop event-loop pool.
//!
//! `procloop run -- <command>` forwards a single child's output and feeds it
//! stdin; `procloop batch -n <count> -- <command>` runs many copies at once and
//! reports how often each exit code came back.

mod forward;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use forward::Forwarder;
use procloop::{
    exit_code, DiscardListener, PoolConfig, Process, ProcessBuilder, ProcessPool, ProcloopError,
};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const STDIN_CHUNK: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(name = "procloop")]
#[command(about = "Run child processes on a non-blocking I/O pool")]
struct Args {
    /// Number of event-loop workers (default: half the cores)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Per-stream buffer capacity in bytes
    #[arg(long, global = true)]
    buffer_capacity: Option<usize>,

    /// JSON file with pool settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one command, forwarding its output
    Run {
        /// File to feed into the child's stdin ("-" for our own stdin)
        #[arg(long)]
        stdin: Option<PathBuf>,

        /// Prefix for every stdout line
        #[arg(long, default_value = "")]
        stdout_prefix: String,

        /// Prefix for every stderr line
        #[arg(long, default_value = "")]
        stderr_prefix: String,

        /// Merge stderr into stdout
        #[arg(long)]
        redirect_stderr: bool,

        /// Working directory of the child
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Command and arguments
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },

    /// Run a command many times concurrently and count exit codes
    Batch {
        /// How many copies to run
        #[arg(short = 'n', long, default_value = "100")]
        count: usize,

        /// Command and arguments
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the child's output.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(io::stderr)
        .compact()
        .init();

    let config = pool_config(&args)?;
    debug!("Pool configuration: {:?}", config);
    let pool = Arc::new(ProcessPool::new(config).context("invalid pool configuration")?);

    let interrupted = Arc::clone(&pool);
    ctrlc::set_handler(move || {
        info!("Interrupted, killing children");
        interrupted.shutdown();
    })
    .context("failed to install Ctrl-C handler")?;

    let code = match args.command {
        Commands::Run {
            stdin,
            stdout_prefix,
            stderr_prefix,
            redirect_stderr,
            cwd,
            command,
        } => {
            let mut builder = ProcessBuilder::from_command(&command)?;
            builder.redirect_error_stream(redirect_stderr);
            if let Some(dir) = cwd {
                builder.current_dir(dir);
            }
            run(&pool, &builder, stdin, &stdout_prefix, &stderr_prefix)?
        }
        Commands::Batch { count, command } => {
            let builder = ProcessBuilder::from_command(&command)?;
            batch(&pool, &builder, count)?
        }
    };

    pool.shutdown();
    std::process::exit(code);
}

fn pool_config(args: &Args) -> Result<PoolConfig> {
    let mut config = match &args.config {
        Some(path) => PoolConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => PoolConfig::default(),
    };
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(capacity) = args.buffer_capacity {
        config = config.with_buffer_capacity(capacity);
    }
    Ok(config)
}

fn run(
    pool: &ProcessPool,
    builder: &ProcessBuilder,
    stdin: Option<PathBuf>,
    stdout_prefix: &str,
    stderr_prefix: &str,
) -> Result<i32> {
    let listener = Forwarder::new(stdout_prefix, stderr_prefix);
    let process = match builder.start(pool, listener) {
        Ok(process) => process,
        Err(e) if e.is_launch_failure() => {
            warn!("{}", e);
            return Ok(exit_status(exit_code::NEVER_STARTED));
        }
        Err(e) => return Err(e.into()),
    };
    info!("Running pid {}: {}", process.pid(), process.command());

    let feeder = match stdin {
        Some(path) => {
            let source: Box<dyn Read + Send> = if path.as_os_str() == "-" {
                Box::new(io::stdin())
            } else {
                Box::new(File::open(&path).with_context(|| format!("failed to open {}", path.display()))?)
            };
            let process = process.clone();
            Some(thread::spawn(move || feed_stdin(&process, source)))
        }
        None => {
            process.close_stdin(false)?;
            None
        }
    };

    let code = process.wait_for();
    if let Some(feeder) = feeder {
        // The feeder may still be blocked reading our stdin; don't wait.
        if feeder.is_finished() {
            if let Ok(Err(e)) = feeder.join() {
                warn!("Feeding stdin failed: {}", e);
            }
        }
    }
    info!("pid {} exited: {}", process.pid(), describe(code));
    Ok(exit_status(code))
}

/// Copy `source` into the child's stdin, then close it gracefully.
fn feed_stdin(process: &Process, mut source: Box<dyn Read + Send>) -> Result<()> {
    let mut buf = vec![0u8; STDIN_CHUNK];
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("failed to read stdin source"),
        };
        match process.write_stdin(Bytes::copy_from_slice(&buf[..n])) {
            Ok(()) => {}
            // The child closed its stdin or exited; nothing more to send.
            Err(ProcloopError::StdinClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    match process.close_stdin(false) {
        Ok(()) | Err(ProcloopError::StdinClosed) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn batch(pool: &ProcessPool, builder: &ProcessBuilder, count: usize) -> Result<i32> {
    if count == 0 {
        bail!("count must be at least 1");
    }
    info!("Running {} copies of {}", count, builder.display_command());

    let mut processes = Vec::with_capacity(count);
    let mut counts: BTreeMap<i32, usize> = BTreeMap::new();
    for _ in 0..count {
        match builder.start(pool, DiscardListener) {
            Ok(process) => {
                process.close_stdin(false)?;
                processes.push(process);
            }
            Err(e) if e.is_launch_failure() => {
                debug!("{}", e);
                *counts.entry(exit_code::NEVER_STARTED).or_default() += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    for process in &processes {
        *counts.entry(process.wait_for()).or_default() += 1;
    }

    for (code, n) in &counts {
        println!("{:>6}  {}", n, describe(*code));
    }
    let failed = counts
        .iter()
        .any(|(code, _)| *code != 0);
    Ok(if failed { 1 } else { 0 })
}

fn describe(code: i32) -> String {
    match exit_code::describe(code) {
        Some(name) => name.to_string(),
        None => format!("exit {}", code),
    }
}

/// Map an exit code, sentinels included, to a status for our own exit.
fn exit_status(code: i32) -> i32 {
    match code {
        exit_code::NEVER_STARTED | exit_code::EXEC_FAILED => 127,
        exit_code::KILLED_ON_SHUTDOWN => 130,
        exit_code::UNKNOWN => 1,
        code => code,
    }
}
