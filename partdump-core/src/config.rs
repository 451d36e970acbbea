//! Settings shared by the supervisor and the coordinator.
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::partition::Partition;
use crate::supervisor::CopyStrategy;

pub const DEFAULT_OUTPUT_DIR: &str = "/sdcard/Backup";
pub const DEFAULT_BY_NAME_DIR: &str = "/dev/block/by-name";
pub const DEFAULT_BLOCK_SIZE: &str = "4M";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Error-text keyword that marks `status=progress` as unsupported.
pub const DEFAULT_PROGRESS_KEYWORD: &str = "status";

/// Where images go and how the copy is run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpConfig {
    /// Directory that receives one `<name>.img` per partition.
    pub output_dir: PathBuf,
    /// Directory of symbolic partition links to enumerate.
    pub by_name_dir: PathBuf,
    /// Block size handed to `dd` as `bs=`.
    pub block_size: String,
    /// Interval between destination size probes in the polling strategy.
    pub poll_interval: Duration,
    /// Case-insensitive keyword that, found in the error text of a failed
    /// structured-progress run, triggers the polling fallback.
    pub progress_keyword: String,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            by_name_dir: PathBuf::from(DEFAULT_BY_NAME_DIR),
            block_size: DEFAULT_BLOCK_SIZE.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            progress_keyword: DEFAULT_PROGRESS_KEYWORD.to_string(),
        }
    }
}

impl DumpConfig {
    /// Sets the directory that receives the images.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Sets the directory of partition links to enumerate.
    pub fn with_by_name_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.by_name_dir = dir.into();
        self
    }

    /// Sets the `bs=` value passed to `dd`.
    pub fn with_block_size(mut self, block_size: impl Into<String>) -> Self {
        self.block_size = block_size.into();
        self
    }

    /// Sets how often the polling strategy measures the image file.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the keyword that marks structured progress as unsupported.
    pub fn with_progress_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.progress_keyword = keyword.into();
        self
    }

    /// Where the image of `partition` is written.
    pub fn image_path(&self, partition: &Partition) -> PathBuf {
        self.output_dir.join(format!("{}.img", partition.name))
    }

    /// The `dd` invocation for one strategy.
    pub(crate) fn copy_command(&self, source: &str, destination: &Path, strategy: CopyStrategy) -> String {
        let mut command = format!(
            "dd if=\"{source}\" of=\"{}\" bs={}",
            destination.display(),
            self.block_size
        );
        if strategy == CopyStrategy::StructuredProgress {
            command.push_str(" status=progress");
        }
        command
    }

    pub(crate) fn mkdir_command(&self) -> String {
        format!("mkdir -p \"{}\"", self.output_dir.display())
    }
}
