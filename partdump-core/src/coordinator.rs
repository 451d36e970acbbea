//! Dumps a selection of partitions one after another.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

use crate::config::DumpConfig;
use crate::error::{DumpError, Result};
use crate::exec::{self, PrivilegedExecutor};
use crate::partition::{self, Partition};
use crate::progress::{DumpObserver, ProgressSample};
use crate::supervisor::{CopyJob, CopySupervisor};

/// Whether a coordinator is free to start a new dump.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Running,
}

/// What a call to [`DumpCoordinator::dump_all`] achieved.
#[derive(Debug, Default)]
pub struct DumpSummary {
    /// Images written successfully, in order.
    pub dumped: Vec<PathBuf>,
    /// The partition that stopped the run, with the reason.
    pub failure: Option<(String, DumpError)>,
}

impl DumpSummary {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Resets the coordinator to idle however `dump_all` exits.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Dumps partitions one at a time through a [`PrivilegedExecutor`].
pub struct DumpCoordinator<E> {
    executor: E,
    config: DumpConfig,
    running: AtomicBool,
}

impl<E: PrivilegedExecutor> DumpCoordinator<E> {
    pub fn new(executor: E, config: DumpConfig) -> Self {
        Self {
            executor,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DumpConfig {
        &self.config
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Whether a dump is currently in progress.
    pub fn current_state(&self) -> CoordinatorState {
        if self.running.load(Ordering::Acquire) {
            CoordinatorState::Running
        } else {
            CoordinatorState::Idle
        }
    }

    /// Lists the partitions under the configured by-name directory.
    pub fn enumerate(&self) -> anyhow::Result<Vec<Partition>> {
        partition::enumerate(&self.executor, &self.config.by_name_dir)
    }

    /// Dumps `partitions` in order into the output directory.
    ///
    /// Stops at the first partition that fails; images already written stay
    /// on disk. Fails with [`DumpError::AlreadyRunning`] if another dump is
    /// in progress on this coordinator.
    pub fn dump_all(&self, partitions: &[Partition], observer: &dyn DumpObserver) -> Result<DumpSummary> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DumpError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        observer.on_status(&format!("Preparing dump ({} selected)...", partitions.len()));

        let mut summary = DumpSummary::default();
        for (index, partition) in partitions.iter().enumerate() {
            match self.dump_one(partition, index + 1, partitions.len(), observer) {
                Ok(image) => summary.dumped.push(image),
                Err(err) => {
                    error!(partition = %partition.name, %err, "dump stopped");
                    summary.failure = Some((partition.name.clone(), err));
                    break;
                }
            }
        }

        if summary.is_success() {
            info!(count = summary.dumped.len(), dir = %self.config.output_dir.display(), "dump complete");
            observer.on_status(&format!(
                "Dump complete. Files in {}.",
                self.config.output_dir.display()
            ));
        } else {
            observer.on_status("Dump failed. Check root access and free space.");
        }
        Ok(summary)
    }

    fn dump_one(
        &self,
        partition: &Partition,
        current: usize,
        total: usize,
        observer: &dyn DumpObserver,
    ) -> Result<PathBuf> {
        observer.on_status(&format!("Dump {current}/{total}: {}", partition.name));

        self.ensure_output_dir()?;

        let total_bytes = if partition.size_known() {
            partition.total_bytes
        } else {
            partition::probe_block_size(&self.executor, &partition.real_path)
        };
        observer.on_progress(ProgressSample::new(0, total_bytes));

        let mut job = CopyJob::new(partition.clone(), self.config.image_path(partition), total_bytes);
        CopySupervisor::new(&self.executor, &self.config).run(&mut job, observer)?;
        Ok(job.destination().clone())
    }

    fn ensure_output_dir(&self) -> Result<()> {
        let result = exec::run_command(&self.executor, &self.config.mkdir_command())?;
        if !result.success() {
            warn!(
                exit_code = result.exit_code,
                stderr = %result.stderr.trim(),
                "could not create output directory"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::ScriptedExecutor;
    use std::sync::{Arc, Barrier, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        statuses: Mutex<Vec<String>>,
        samples: Mutex<Vec<ProgressSample>>,
    }

    impl DumpObserver for Recorder {
        fn on_status(&self, message: &str) {
            self.statuses.lock().unwrap().push(message.to_string());
        }

        fn on_progress(&self, sample: ProgressSample) {
            self.samples.lock().unwrap().push(sample);
        }
    }

    fn part(name: &str, dev: &str, total: i64) -> Partition {
        Partition::new(name, format!("/dev/block/by-name/{name}"), format!("/dev/block/{dev}"), total)
    }

    fn dd_for(dev: &str) -> String {
        format!("dd if=\"/dev/block/{dev}\"")
    }

    #[test]
    fn stops_at_first_failure_and_skips_the_rest() {
        let executor = ScriptedExecutor::new()
            .on("mkdir -p", 0, "", "")
            .on(&dd_for("sda1"), 0, "", "1024 bytes copied\n")
            .on(&dd_for("sda2"), 1, "", "dd: /dev/block/sda2: I/O error\n")
            .on(&dd_for("sda3"), 0, "", "");
        let coordinator = DumpCoordinator::new(executor, DumpConfig::default());
        let recorder = Recorder::default();
        let partitions = [part("boot", "sda1", 1024), part("system", "sda2", 2048), part("vendor", "sda3", 4096)];

        let summary = coordinator.dump_all(&partitions, &recorder).unwrap();

        assert!(!summary.is_success());
        assert_eq!(summary.dumped, [PathBuf::from("/sdcard/Backup/boot.img")]);
        let (failed, err) = summary.failure.as_ref().unwrap();
        assert_eq!(failed, "system");
        assert!(matches!(err, DumpError::CopyFailed { .. }));

        let executor = coordinator.executor();
        assert_eq!(executor.count(&dd_for("sda1")), 1);
        assert_eq!(executor.count(&dd_for("sda2")), 1);
        assert_eq!(executor.count(&dd_for("sda3")), 0);

        let statuses = recorder.statuses.lock().unwrap();
        assert_eq!(statuses.first().map(String::as_str), Some("Preparing dump (3 selected)..."));
        assert!(statuses.contains(&"Dump 1/3: boot".to_string()));
        assert!(statuses.contains(&"Dump 2/3: system".to_string()));
        assert!(!statuses.iter().any(|s| s.starts_with("Dump 3/3")));
        assert_eq!(
            statuses.last().map(String::as_str),
            Some("Dump failed. Check root access and free space.")
        );
        assert_eq!(coordinator.current_state(), CoordinatorState::Idle);
    }

    #[test]
    fn successful_run_points_at_output_dir() {
        let executor = ScriptedExecutor::new()
            .on("mkdir -p", 0, "", "")
            .on("dd", 0, "", "");
        let config = DumpConfig::default().with_output_dir("/data/dumps");
        let coordinator = DumpCoordinator::new(executor, config);
        let recorder = Recorder::default();

        let summary = coordinator
            .dump_all(&[part("boot", "sda1", 512), part("dtbo", "sda2", 512)], &recorder)
            .unwrap();

        assert!(summary.is_success());
        assert_eq!(
            summary.dumped,
            [PathBuf::from("/data/dumps/boot.img"), PathBuf::from("/data/dumps/dtbo.img")]
        );
        assert_eq!(
            recorder.statuses.lock().unwrap().last().map(String::as_str),
            Some("Dump complete. Files in /data/dumps.")
        );
        assert_eq!(coordinator.executor().count("mkdir -p \"/data/dumps\""), 2);
    }

    #[test]
    fn unknown_size_is_probed_then_reported_raw() {
        let executor = ScriptedExecutor::new()
            .on("mkdir -p", 0, "", "")
            .on("cat /sys/class/block/sda9/size", 1, "", "")
            .on(&dd_for("sda9"), 0, "", "512 bytes copied\r1024 bytes copied\n");
        let coordinator = DumpCoordinator::new(executor, DumpConfig::default());
        let recorder = Recorder::default();

        let summary = coordinator.dump_all(&[part("misc", "sda9", 0)], &recorder).unwrap();

        assert!(summary.is_success());
        assert_eq!(coordinator.executor().count("cat /sys/class/block/sda9/size"), 1);
        let samples = recorder.samples.lock().unwrap();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.permille().is_none()));
        assert_eq!(samples.last().unwrap().to_string(), "Copied: 1.0 KB");
    }

    #[test]
    fn probed_size_enables_percentages() {
        let executor = ScriptedExecutor::new()
            .on("mkdir -p", 0, "", "")
            .on("cat /sys/class/block/sda9/size", 0, "4\n", "")
            .on(&dd_for("sda9"), 0, "", "1024 bytes copied\n");
        let coordinator = DumpCoordinator::new(executor, DumpConfig::default());
        let recorder = Recorder::default();

        coordinator.dump_all(&[part("misc", "sda9", -1)], &recorder).unwrap();

        let samples = recorder.samples.lock().unwrap();
        assert_eq!(samples.last().unwrap().total_bytes, 2048);
        assert_eq!(samples.last().unwrap().permille(), Some(500));
    }

    #[test]
    fn mkdir_failure_is_not_fatal() {
        let executor = ScriptedExecutor::new()
            .on("mkdir -p", 1, "", "mkdir: File exists\n")
            .on("dd", 0, "", "");
        let coordinator = DumpCoordinator::new(executor, DumpConfig::default());

        let summary = coordinator.dump_all(&[part("boot", "sda1", 512)], &()).unwrap();

        assert!(summary.is_success());
    }

    #[test]
    fn spawn_failure_fails_the_run() {
        let executor = ScriptedExecutor::new().refuse("mkdir");
        let coordinator = DumpCoordinator::new(executor, DumpConfig::default());

        let summary = coordinator.dump_all(&[part("boot", "sda1", 512)], &()).unwrap();

        assert!(matches!(summary.failure, Some((_, DumpError::Spawn { .. }))));
        assert!(summary.dumped.is_empty());
    }

    #[test]
    fn rejects_concurrent_dumps() {
        let gate = Arc::new(Barrier::new(2));
        let executor = ScriptedExecutor::new()
            .on("mkdir -p", 0, "", "")
            .on_gated("dd", 0, Arc::clone(&gate));
        let coordinator = DumpCoordinator::new(executor, DumpConfig::default());
        let partitions = [part("boot", "sda1", 512)];

        std::thread::scope(|scope| {
            let first = scope.spawn(|| coordinator.dump_all(&partitions, &()));
            // The first dump cannot finish before the gate opens.
            while coordinator.current_state() == CoordinatorState::Idle {
                std::thread::yield_now();
            }
            assert!(matches!(
                coordinator.dump_all(&partitions, &()),
                Err(DumpError::AlreadyRunning)
            ));
            gate.wait();
            assert!(first.join().unwrap().unwrap().is_success());
        });
        assert_eq!(coordinator.current_state(), CoordinatorState::Idle);
    }

    #[cfg(unix)]
    #[test]
    fn dumps_real_files_end_to_end() {
        use crate::exec::{Elevation, ShellExecutor};

        let dir = tempfile::tempdir().unwrap();
        let mut partitions = Vec::new();
        for (name, len) in [("boot", 4096usize), ("dtbo", 1024)] {
            let source = dir.path().join(format!("{name}.raw"));
            std::fs::write(&source, vec![name.len() as u8; len]).unwrap();
            partitions.push(Partition::new(name, "", source.to_string_lossy(), len as i64));
        }
        let output = dir.path().join("backup");
        let config = DumpConfig::default()
            .with_output_dir(&output)
            .with_block_size("1K")
            .with_poll_interval(Duration::from_millis(10));
        let coordinator = DumpCoordinator::new(ShellExecutor::new(Elevation::Direct), config);

        let summary = coordinator.dump_all(&partitions, &()).unwrap();

        assert!(summary.is_success());
        assert_eq!(std::fs::metadata(output.join("boot.img")).unwrap().len(), 4096);
        assert_eq!(std::fs::metadata(output.join("dtbo.img")).unwrap().len(), 1024);
    }
}
