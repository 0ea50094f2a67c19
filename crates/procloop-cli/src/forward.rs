//! Listener that copies a child's output to our own stdout/stderr.

use procloop::{IoBuffer, Process, ProcessListener, ProcloopError};
use std::io::{self, Write};
use tracing::{debug, warn};

/// Writes bytes, starting every line with a fixed prefix.
pub struct PrefixedWriter<W: Write> {
    inner: W,
    prefix: Vec<u8>,
    at_line_start: bool,
}

impl<W: Write> PrefixedWriter<W> {
    pub fn new(inner: W, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            at_line_start: true,
        }
    }

    pub fn write_chunk(&mut self, mut data: &[u8]) -> io::Result<()> {
        if self.prefix.is_empty() {
            return self.inner.write_all(data);
        }
        while !data.is_empty() {
            if self.at_line_start {
                self.inner.write_all(&self.prefix)?;
                self.at_line_start = false;
            }
            match data.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    self.inner.write_all(&data[..=end])?;
                    self.at_line_start = true;
                    data = &data[end + 1..];
                }
                None => {
                    self.inner.write_all(data)?;
                    data = &[];
                }
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Forwards stdout and stderr of one child, optionally prefixing lines.
pub struct Forwarder {
    stdout: PrefixedWriter<io::Stdout>,
    stderr: PrefixedWriter<io::Stderr>,
}

impl Forwarder {
    pub fn new(stdout_prefix: &str, stderr_prefix: &str) -> Self {
        Self {
            stdout: PrefixedWriter::new(io::stdout(), stdout_prefix),
            stderr: PrefixedWriter::new(io::stderr(), stderr_prefix),
        }
    }
}

fn forward<W: Write>(writer: &mut PrefixedWriter<W>, buffer: &mut IoBuffer, closed: bool) {
    if let Err(e) = writer.write_chunk(buffer.as_slice()) {
        warn!("Failed to forward output: {}", e);
    }
    buffer.consume_all();
    if closed {
        let _ = writer.flush();
    }
}

impl ProcessListener for Forwarder {
    fn on_started(&mut self, process: &Process) {
        debug!("Started pid {}: {}", process.pid(), process.command());
    }

    fn on_stdout(&mut self, _process: &Process, buffer: &mut IoBuffer, closed: bool) {
        forward(&mut self.stdout, buffer, closed);
    }

    fn on_stderr(&mut self, _process: &Process, buffer: &mut IoBuffer, closed: bool) {
        forward(&mut self.stderr, buffer, closed);
    }

    fn on_error(&mut self, process: &Process, error: &ProcloopError, during_launch: bool) {
        if during_launch {
            warn!("{}: {}", process.command(), error);
        } else {
            warn!("pid {}: {}", process.pid(), error);
        }
    }
}
