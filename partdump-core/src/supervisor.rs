//! Supervises the privileged copy of one partition.
//!
//! The supervisor first runs `dd` with `status=progress` and parses the byte
//! counts it prints. Older or stripped-down `dd` builds reject that option; in
//! that case the copy is retried without it while a poller measures the
//! growing image file once per interval.
//!
//! ```text
//! Idle -> RunningPrimary -> Success
//!                        -> PrimaryFailed -> RunningFallback -> Success | Failure
//!                        -> Failure
//! ```
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::DumpConfig;
use crate::drain;
use crate::error::{DumpError, Result};
use crate::exec::{CommandResult, PrivilegedExecutor};
use crate::partition::Partition;
use crate::progress::{self, DumpObserver, ProgressSample};

/// How progress is obtained for a copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyStrategy {
    /// Parse the copy utility's own progress lines.
    StructuredProgress,
    /// Poll the size of the destination file.
    PollingFallback,
}

impl fmt::Display for CopyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyStrategy::StructuredProgress => f.write_str("structured progress"),
            CopyStrategy::PollingFallback => f.write_str("polling fallback"),
        }
    }
}

/// Where a [`CopyJob`] is in the primary/fallback state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    RunningPrimary,
    PrimaryFailed,
    RunningFallback,
    Success,
    Failure,
}

impl SupervisorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SupervisorState::Success | SupervisorState::Failure)
    }
}

/// One partition copy, from start to its final exit code.
///
/// `bytes_copied` only ever grows and is written by exactly one observer at
/// a time: the error-stream drain in the primary run, the poller in the
/// fallback run.
#[derive(Debug)]
pub struct CopyJob {
    source: Partition,
    destination: PathBuf,
    strategy: CopyStrategy,
    state: SupervisorState,
    bytes_copied: AtomicU64,
    total_bytes: i64,
    exit_code: Option<i32>,
}

impl CopyJob {
    pub fn new(source: Partition, destination: impl Into<PathBuf>, total_bytes: i64) -> Self {
        Self {
            source,
            destination: destination.into(),
            strategy: CopyStrategy::StructuredProgress,
            state: SupervisorState::Idle,
            bytes_copied: AtomicU64::new(0),
            total_bytes,
            exit_code: None,
        }
    }

    pub fn source(&self) -> &Partition {
        &self.source
    }

    pub fn destination(&self) -> &PathBuf {
        &self.destination
    }

    pub fn strategy(&self) -> CopyStrategy {
        self.strategy
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::Acquire)
    }

    pub fn total_bytes(&self) -> i64 {
        self.total_bytes
    }

    /// Exit code of the last attempted strategy, set once the job settles.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn record(&self, bytes: u64, observer: &dyn DumpObserver) {
        let previous = self.bytes_copied.fetch_max(bytes, Ordering::AcqRel);
        observer.on_progress(ProgressSample::new(previous.max(bytes), self.total_bytes));
    }

    fn transition(&mut self, state: SupervisorState) {
        debug!(partition = %self.source.name, from = ?self.state, to = ?state, "copy state change");
        self.state = state;
    }

    fn settle(&mut self, exit_code: Option<i32>, state: SupervisorState) {
        self.exit_code = exit_code;
        self.transition(state);
    }
}

/// Decides what a finished run means for the job.
///
/// With `progress_keyword` set, a non-zero exit whose error text mentions the
/// keyword (case-insensitively) is reported as
/// [`DumpError::UnsupportedProgressMode`]. This is a best-effort heuristic on
/// the copy utility's wording.
pub fn classify_exit(
    partition: &str,
    strategy: CopyStrategy,
    result: &CommandResult,
    progress_keyword: Option<&str>,
) -> Result<()> {
    if result.success() {
        return Ok(());
    }
    if let Some(keyword) = progress_keyword {
        if result.stderr.to_lowercase().contains(&keyword.to_lowercase()) {
            return Err(DumpError::UnsupportedProgressMode {
                exit_code: result.exit_code,
            });
        }
    }
    Err(DumpError::CopyFailed {
        partition: partition.to_string(),
        strategy,
        exit_code: result.exit_code,
        stderr: result.stderr.clone(),
    })
}

/// Runs [`CopyJob`]s through a [`PrivilegedExecutor`].
///
/// Holds no per-job state, so one supervisor can run several jobs at once.
pub struct CopySupervisor<'a, E: PrivilegedExecutor + ?Sized> {
    executor: &'a E,
    config: &'a DumpConfig,
}

impl<'a, E: PrivilegedExecutor + ?Sized> CopySupervisor<'a, E> {
    pub fn new(executor: &'a E, config: &'a DumpConfig) -> Self {
        Self { executor, config }
    }

    /// Copies `job`'s partition to its destination, falling back to polling
    /// when structured progress is unsupported.
    ///
    /// Returns once every helper thread has been joined. On success the job is
    /// in [`SupervisorState::Success`]; on error it is in
    /// [`SupervisorState::Failure`] and the error says why.
    pub fn run(&self, job: &mut CopyJob, observer: &dyn DumpObserver) -> Result<()> {
        let started = Instant::now();
        let outcome = self.run_strategies(job, observer);
        match &outcome {
            Ok(()) => info!(
                partition = %job.source.name,
                strategy = %job.strategy,
                bytes = job.bytes_copied(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "partition copied"
            ),
            Err(err) => {
                if !job.state.is_terminal() {
                    job.settle(job.exit_code, SupervisorState::Failure);
                }
                warn!(partition = %job.source.name, %err, "partition copy failed");
            }
        }
        outcome
    }

    fn run_strategies(&self, job: &mut CopyJob, observer: &dyn DumpObserver) -> Result<()> {
        job.strategy = CopyStrategy::StructuredProgress;
        job.transition(SupervisorState::RunningPrimary);
        let primary = self.run_primary(job, observer)?;

        match classify_exit(
            &job.source.name,
            CopyStrategy::StructuredProgress,
            &primary,
            Some(self.config.progress_keyword.as_str()),
        ) {
            Ok(()) => {
                job.settle(Some(primary.exit_code), SupervisorState::Success);
                return Ok(());
            }
            Err(err) if err.is_recoverable() => {
                warn!(
                    partition = %job.source.name,
                    exit_code = primary.exit_code,
                    "structured progress unsupported, retrying with polling"
                );
                job.transition(SupervisorState::PrimaryFailed);
            }
            Err(err) => {
                job.settle(Some(primary.exit_code), SupervisorState::Failure);
                return Err(err);
            }
        }

        job.strategy = CopyStrategy::PollingFallback;
        job.transition(SupervisorState::RunningFallback);
        let fallback = self.run_fallback(job, observer)?;

        let outcome = classify_exit(&job.source.name, CopyStrategy::PollingFallback, &fallback, None);
        let state = if outcome.is_ok() {
            SupervisorState::Success
        } else {
            SupervisorState::Failure
        };
        job.settle(Some(fallback.exit_code), state);
        outcome
    }

    fn run_primary(&self, job: &CopyJob, observer: &dyn DumpObserver) -> Result<CommandResult> {
        let command = self.config.copy_command(
            &job.source.real_path,
            &job.destination,
            CopyStrategy::StructuredProgress,
        );
        let handle = self.executor.spawn(&command)?;

        let mut on_stderr = |line: &str| {
            if let Some(bytes) = progress::parse_bytes_line(line) {
                job.record(bytes, observer);
            }
        };
        drain::drain_and_wait(handle, None, Some(&mut on_stderr))
    }

    fn run_fallback(&self, job: &CopyJob, observer: &dyn DumpObserver) -> Result<CommandResult> {
        let command = self.config.copy_command(
            &job.source.real_path,
            &job.destination,
            CopyStrategy::PollingFallback,
        );
        let handle = self.executor.spawn(&command)?;
        let stop = AtomicBool::new(false);

        thread::scope(|scope| {
            let poller = scope.spawn(|| self.poll_until_stopped(job, observer, &stop));

            let result = drain::drain_and_wait(handle, None, None);
            stop.store(true, Ordering::Release);
            poller.thread().unpark();
            let joined = poller.join();

            let result = result?;
            joined.map_err(|_| DumpError::TaskPanicked { task: "poller" })?;
            Ok(result)
        })
    }

    fn poll_until_stopped(&self, job: &CopyJob, observer: &dyn DumpObserver, stop: &AtomicBool) {
        let path = job.destination.to_string_lossy();
        while !stop.load(Ordering::Acquire) {
            match progress::probe_file_size(self.executor, &path) {
                Ok(size) => job.record(size, observer),
                Err(err) => debug!(%err, "skipping progress sample"),
            }

            let deadline = Instant::now() + self.config.poll_interval;
            while !stop.load(Ordering::Acquire) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::park_timeout(deadline - now);
            }
        }
    }
}
