//! The core, UI-agnostic library for the `partdump` partition backup utility.
//!
//! `partdump-core` is designed to be used as a library by any front-end, whether
//! it's a command-line interface (like `partdump`) or a graphical user interface.
//! It backs up raw partitions of a rooted device to image files by supervising
//! a privileged `dd`, turning whatever progress the copy exposes into a bounded
//! percentage or a raw byte count.
//!
//! The library is structured into several key modules:
//! - [`partition`]: The `Partition` record and privileged enumeration of
//!   `/dev/block/by-name`.
//! - [`exec`]: The [`exec::PrivilegedExecutor`] capability and its `su`/`sh`
//!   implementation.
//! - [`drain`]: Concurrent, line-oriented draining of process output.
//! - [`progress`]: Progress extraction, percentage mapping and the
//!   [`progress::DumpObserver`] callback interface.
//! - [`supervisor`]: The copy state machine with its polling fallback.
//! - [`coordinator`]: Sequential dumping of a partition selection.
//!
//! Progress is reported through a [`progress::DumpObserver`]. Its methods are
//! called from the library's worker threads, so the calling application can
//! render updates however it chooses as long as it does so thread-safely.
//!
//! ## Example: Dumping Partitions with Progress Reporting
//!
//! ```rust,no_run
//! use partdump_core::coordinator::DumpCoordinator;
//! use partdump_core::config::DumpConfig;
//! use partdump_core::exec::{Elevation, ShellExecutor};
//! use partdump_core::progress::{DumpObserver, ProgressSample};
//!
//! struct Printer;
//!
//! impl DumpObserver for Printer {
//!     fn on_status(&self, message: &str) {
//!         println!("{message}");
//!     }
//!
//!     fn on_progress(&self, sample: ProgressSample) {
//!         println!("{sample}");
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let coordinator = DumpCoordinator::new(
//!         ShellExecutor::new(Elevation::Auto),
//!         DumpConfig::default(),
//!     );
//!
//!     let partitions = coordinator.enumerate()?;
//!     let selected: Vec<_> = partitions
//!         .into_iter()
//!         .filter(|p| p.name == "boot" || p.name == "dtbo")
//!         .collect();
//!
//!     let summary = coordinator.dump_all(&selected, &Printer)?;
//!     if !summary.is_success() {
//!         anyhow::bail!("dump failed");
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod drain;
pub mod error;
pub mod exec;
pub mod partition;
pub mod progress;
pub mod supervisor;

pub use error::{DumpError, Result};
