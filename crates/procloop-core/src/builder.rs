//! Spawn configuration.

use crate::error::{ProcloopError, Result};
use crate::listener::ProcessListener;
use crate::pool::ProcessPool;
use crate::process::Process;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How the child's standard streams are driven.
///
/// The event-loop engine only drives [`IoMode::NonBlocking`]; the other
/// modes are rejected at spawn time with
/// [`ProcloopError::UnsupportedIoMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    /// Pipes polled by the worker pool.
    #[default]
    NonBlocking,
    /// Caller-owned blocking streams.
    Blocking,
    /// A pseudo-terminal.
    Pty,
}

/// Hook that rewrites a command line to run as another user.
///
/// `elevate` runs before the spawn; `descend` always runs afterwards, even
/// when the spawn failed.
pub trait EffectiveUser: Send + Sync + fmt::Debug {
    fn elevate(&self, command: &mut Vec<OsString>) -> Result<()>;

    fn descend(&self, command: &mut Vec<OsString>) -> Result<()>;
}

/// Runs the command through `sudo -n -u <user> --`.
#[derive(Debug, Clone)]
pub struct SudoUser {
    username: String,
    sudo: PathBuf,
}

impl SudoUser {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            sudo: PathBuf::from("sudo"),
        }
    }

    /// Use a specific sudo binary instead of the one on `PATH`.
    pub fn with_sudo_path(mut self, sudo: impl Into<PathBuf>) -> Self {
        self.sudo = sudo.into();
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    fn prefix(&self) -> [OsString; 5] {
        [
            self.sudo.clone().into_os_string(),
            OsString::from("-n"),
            OsString::from("-u"),
            OsString::from(&self.username),
            OsString::from("--"),
        ]
    }
}

impl EffectiveUser for SudoUser {
    fn elevate(&self, command: &mut Vec<OsString>) -> Result<()> {
        if self.username.is_empty() {
            return Err(ProcloopError::EffectiveUser {
                message: "empty user name".into(),
            });
        }
        command.splice(0..0, self.prefix());
        Ok(())
    }

    fn descend(&self, command: &mut Vec<OsString>) -> Result<()> {
        let prefix = self.prefix();
        if command.starts_with(&prefix) {
            command.drain(..prefix.len());
        }
        Ok(())
    }
}

/// Builder for a child process driven by a [`ProcessPool`].
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    command: Vec<OsString>,
    env: BTreeMap<OsString, Option<OsString>>,
    env_clear: bool,
    current_dir: Option<PathBuf>,
    redirect_error_stream: bool,
    io_mode: IoMode,
    effective_user: Option<Arc<dyn EffectiveUser>>,
}

impl ProcessBuilder {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            command: vec![program.as_ref().to_os_string()],
            env: BTreeMap::new(),
            env_clear: false,
            current_dir: None,
            redirect_error_stream: false,
            io_mode: IoMode::default(),
            effective_user: None,
        }
    }

    /// Build from a full command line; the first element is the program.
    pub fn from_command<I, S>(command: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut parts = command.into_iter();
        let program = parts.next().ok_or(ProcloopError::EmptyCommand)?;
        let mut builder = Self::new(program);
        builder.args(parts);
        Ok(builder)
    }

    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.command.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(&mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> &mut Self {
        self.env.insert(
            key.as_ref().to_os_string(),
            Some(value.as_ref().to_os_string()),
        );
        self
    }

    pub fn env_remove(&mut self, key: impl AsRef<OsStr>) -> &mut Self {
        self.env.insert(key.as_ref().to_os_string(), None);
        self
    }

    /// Start from an empty environment instead of inheriting this process's.
    pub fn env_clear(&mut self) -> &mut Self {
        self.env_clear = true;
        self.env.clear();
        self
    }

    pub fn current_dir(&mut self, dir: impl AsRef<Path>) -> &mut Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Deliver stderr bytes through `on_stdout`.
    pub fn redirect_error_stream(&mut self, redirect: bool) -> &mut Self {
        self.redirect_error_stream = redirect;
        self
    }

    pub fn io_mode(&mut self, mode: IoMode) -> &mut Self {
        self.io_mode = mode;
        self
    }

    pub fn effective_user(&mut self, user: impl EffectiveUser + 'static) -> &mut Self {
        self.effective_user = Some(Arc::new(user));
        self
    }

    /// Spawn through `pool`, driving I/O with `listener`.
    pub fn start<L: ProcessListener>(&self, pool: &ProcessPool, listener: L) -> Result<Process> {
        pool.spawn(self, listener)
    }

    pub fn get_program(&self) -> &OsStr {
        &self.command[0]
    }

    pub fn get_command(&self) -> &[OsString] {
        &self.command
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn get_io_mode(&self) -> IoMode {
        self.io_mode
    }

    pub fn is_redirect_error_stream(&self) -> bool {
        self.redirect_error_stream
    }

    pub(crate) fn get_effective_user(&self) -> Option<&Arc<dyn EffectiveUser>> {
        self.effective_user.as_ref()
    }

    /// The environment the child will see.
    pub fn environment(&self) -> Vec<(OsString, OsString)> {
        let mut merged: BTreeMap<OsString, OsString> = if self.env_clear {
            BTreeMap::new()
        } else {
            std::env::vars_os().collect()
        };
        for (key, value) in &self.env {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }

    /// Human-readable command line for logs and errors.
    pub fn display_command(&self) -> String {
        display_command(&self.command)
    }
}

pub(crate) fn display_command(command: &[OsString]) -> String {
    command
        .iter()
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}
