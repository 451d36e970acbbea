//! Error types shared by the copy supervision pipeline.
use std::io;
use thiserror::Error;

use crate::supervisor::CopyStrategy;

/// Result type for the supervision pipeline.
pub type Result<T> = std::result::Result<T, DumpError>;

/// Everything that can go wrong while dumping partitions.
///
/// Only [`DumpError::UnsupportedProgressMode`] is recoverable: the supervisor
/// reacts to it by retrying with the polling strategy. [`DumpError::PollFailed`]
/// is swallowed by the poller. Every other variant settles the current job as
/// failed.
#[derive(Debug, Error)]
pub enum DumpError {
    /// The privileged shell could not be started at all.
    #[error("failed to spawn privileged command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The copy utility exited non-zero for a reason other than missing
    /// progress support.
    #[error("copying `{partition}` with {strategy} failed with exit code {exit_code}")]
    CopyFailed {
        partition: String,
        strategy: CopyStrategy,
        exit_code: i32,
        stderr: String,
    },

    /// The copy utility rejected the structured progress option.
    #[error("copy utility does not support structured progress (exit code {exit_code})")]
    UnsupportedProgressMode { exit_code: i32 },

    /// A single size probe failed while polling.
    #[error("size probe of `{path}` failed")]
    PollFailed { path: String },

    /// Reading a stream or waiting on the process failed.
    #[error("I/O error while supervising `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },

    /// A drain or poll thread panicked before it could be joined cleanly.
    #[error("{task} thread panicked")]
    TaskPanicked { task: &'static str },

    /// A dump was requested while another one is still running.
    #[error("a dump is already in progress")]
    AlreadyRunning,
}

impl DumpError {
    /// Whether the supervisor may recover from this error by switching strategy.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DumpError::UnsupportedProgressMode { .. })
    }
}
