//! Runs shell commands with elevated privileges.
//!
//! The [`PrivilegedExecutor`] trait is the seam between the supervision logic
//! and the host: the default [`ShellExecutor`] goes through `su -c`, but any
//! other transport (an `adb shell`, a test double) only has to hand back a
//! [`ProcessHandle`].
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};

use tracing::debug;

use crate::drain;
use crate::error::{DumpError, Result};

/// How a command is elevated before it reaches the shell interpreter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Elevation {
    /// `su -c <command>`.
    #[default]
    Su,
    /// `sh -c <command>`, for processes that already run as root.
    Direct,
    /// [`Elevation::Direct`] when the effective uid is 0, [`Elevation::Su`] otherwise.
    Auto,
}

impl Elevation {
    /// Collapses [`Elevation::Auto`] into a concrete mode.
    pub fn resolve(self) -> Elevation {
        match self {
            Elevation::Auto if running_as_root() => Elevation::Direct,
            Elevation::Auto => Elevation::Su,
            other => other,
        }
    }

    fn program(self) -> &'static str {
        match self.resolve() {
            Elevation::Direct => "sh",
            _ => "su",
        }
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

/// Blocks until a spawned process terminates.
pub trait WaitForExit: Send {
    /// Waits for the process and returns its exit code.
    fn wait_for_exit(self: Box<Self>) -> io::Result<i32>;
}

impl WaitForExit for Child {
    fn wait_for_exit(mut self: Box<Self>) -> io::Result<i32> {
        let status = self.wait()?;
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Ok(128 + signal);
            }
        }
        Ok(status.code().unwrap_or(-1))
    }
}

/// A running privileged command.
///
/// Both streams can be taken and drained on other threads while
/// [`ProcessHandle::wait_for_exit`] blocks; waiting consumes the handle so it
/// happens at most once.
pub struct ProcessHandle {
    command: String,
    stdout: Option<Box<dyn Read + Send>>,
    stderr: Option<Box<dyn Read + Send>>,
    exit: Box<dyn WaitForExit>,
}

impl ProcessHandle {
    pub fn new(
        command: impl Into<String>,
        stdout: Box<dyn Read + Send>,
        stderr: Box<dyn Read + Send>,
        exit: Box<dyn WaitForExit>,
    ) -> Self {
        Self {
            command: command.into(),
            stdout: Some(stdout),
            stderr: Some(stderr),
            exit,
        }
    }

    /// The shell text this process was started with.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Hands the output stream to a drainer; `None` once taken.
    pub fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stdout.take()
    }

    /// Hands the error stream to a drainer; `None` once taken.
    pub fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stderr.take()
    }

    /// Blocks the calling thread until the process exits.
    pub fn wait_for_exit(self) -> io::Result<i32> {
        // Streams still held here are dropped first so the child never blocks
        // on a pipe that nobody is going to read.
        let ProcessHandle {
            stdout,
            stderr,
            exit,
            ..
        } = self;
        drop(stdout);
        drop(stderr);
        exit.wait_for_exit()
    }
}

/// Capability to run a shell command with superuser-equivalent rights.
///
/// Implementations are shared with drain and poll threads, hence `Sync`.
pub trait PrivilegedExecutor: Sync {
    /// Starts `command` verbatim through an elevated shell.
    ///
    /// No retries: a failure to start is reported as [`DumpError::Spawn`].
    fn spawn(&self, command: &str) -> Result<ProcessHandle>;
}

impl<E: PrivilegedExecutor + ?Sized> PrivilegedExecutor for &E {
    fn spawn(&self, command: &str) -> Result<ProcessHandle> {
        (**self).spawn(command)
    }
}

/// Runs commands through `su -c` or `sh -c` on the local host.
#[derive(Clone, Debug, Default)]
pub struct ShellExecutor {
    elevation: Elevation,
}

impl ShellExecutor {
    pub fn new(elevation: Elevation) -> Self {
        Self {
            elevation: elevation.resolve(),
        }
    }

    pub fn elevation(&self) -> Elevation {
        self.elevation
    }
}

impl PrivilegedExecutor for ShellExecutor {
    fn spawn(&self, command: &str) -> Result<ProcessHandle> {
        let program = self.elevation.program();
        debug!(program, command, "spawning privileged command");

        let mut child = Command::new(program)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DumpError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let missing = || DumpError::Spawn {
            command: command.to_string(),
            source: io::Error::other("child process has no piped output"),
        };
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;

        Ok(ProcessHandle::new(
            command,
            Box::new(stdout),
            Box::new(stderr),
            Box::new(child),
        ))
    }
}

/// Snapshot of a finished privileged command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs `command` to completion, draining both streams concurrently.
pub fn run_command<E: PrivilegedExecutor + ?Sized>(executor: &E, command: &str) -> Result<CommandResult> {
    let handle = executor.spawn(command)?;
    drain::drain_and_wait(handle, None, None)
}
