//! procloop - non-blocking child-process I/O on a small pool of event loops.
//!
//! Instead of one or two threads per child for stdout, stderr and stdin, a
//! fixed set of worker threads each drive many children through the OS
//! readiness facility (epoll on Linux, kqueue on macOS, an I/O completion port
//! on Windows). Applications never touch descriptors: they receive bytes and
//! lifecycle events through a [`ProcessListener`] and feed stdin through the
//! [`Process`] handle.
//!
//! # Example
//!
//! ```rust,no_run
//! use procloop::{IoBuffer, PoolConfig, Process, ProcessBuilder, ProcessListener, ProcessPool};
//!
//! struct Echo;
//!
//! impl ProcessListener for Echo {
//!     fn on_stdout(&mut self, _process: &Process, buffer: &mut IoBuffer, _closed: bool) {
//!         print!("{}", String::from_utf8_lossy(buffer.as_slice()));
//!         buffer.consume_all();
//!     }
//! }
//!
//! fn main() -> procloop::Result<()> {
//!     let pool = ProcessPool::new(PoolConfig::default())?;
//!     let process = ProcessBuilder::new("cat").start(&pool, Echo)?;
//!     process.write_stdin("hello\n")?;
//!     process.close_stdin(false)?;
//!     assert_eq!(process.wait_for(), 0);
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod builder;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod exit_code;
pub mod listener;
pub mod pool;

mod event;
mod platform;
mod process;

// Re-export commonly used types
pub use buffer::IoBuffer;
pub use builder::{EffectiveUser, IoMode, ProcessBuilder, SudoUser};
pub use config::{EngineConfig, PoolConfig};
pub use descriptor::RefCountedDescriptor;
pub use error::{ProcloopError, Result};
pub use listener::{DiscardListener, ProcessListener};
pub use platform::backend_name;
pub use pool::ProcessPool;
pub use process::{Process, ProcessState, Stream};
