//! Progress extraction and reporting.
//!
//! Progress reaches the supervisor two ways: as `dd status=progress` lines on
//! the error stream, or by polling the size of the growing image file. Both
//! end up as a [`ProgressSample`] pushed to a [`DumpObserver`].
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{DumpError, Result};
use crate::exec::{self, PrivilegedExecutor};

static BYTES_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+)\s+bytes").expect("static pattern is valid"));

const UNIT_PREFIXES: &[u8] = b"KMGTPE";

/// Receives status and progress updates for a dump.
///
/// Progress is pushed from drain and poll threads, never from the thread that
/// called into the library, so implementations must be thread-safe.
pub trait DumpObserver: Sync {
    /// A human-readable status line.
    fn on_status(&self, message: &str);

    /// A new progress sample for the current copy.
    fn on_progress(&self, sample: ProgressSample);
}

/// Ignores every update.
impl DumpObserver for () {
    fn on_status(&self, _message: &str) {}
    fn on_progress(&self, _sample: ProgressSample) {}
}

/// One progress reading: bytes copied so far against the expected total.
///
/// A `total_bytes` of zero or less means the total is unknown, in which case
/// only the raw byte count is meaningful.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressSample {
    pub bytes_copied: u64,
    pub total_bytes: i64,
}

impl ProgressSample {
    pub fn new(bytes_copied: u64, total_bytes: i64) -> Self {
        Self {
            bytes_copied,
            total_bytes,
        }
    }

    pub fn total_known(&self) -> bool {
        self.total_bytes > 0
    }

    /// Progress in parts per thousand, clamped to `0..=1000`.
    ///
    /// `None` when the total is unknown.
    pub fn permille(&self) -> Option<u16> {
        if !self.total_known() {
            return None;
        }
        let scaled = u128::from(self.bytes_copied) * 1000 / self.total_bytes as u128;
        Some(scaled.min(1000) as u16)
    }

    /// Percentage with one decimal, e.g. `"42.7"`.
    pub fn percent_label(&self) -> Option<String> {
        self.permille()
            .map(|permille| format!("{}.{}", permille / 10, permille % 10))
    }
}

impl fmt::Display for ProgressSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.percent_label() {
            Some(percent) => write!(
                f,
                "Copying... {percent}% ({} / {})",
                format_bytes(self.bytes_copied),
                format_bytes(self.total_bytes as u64)
            ),
            None => write!(f, "Copied: {}", format_bytes(self.bytes_copied)),
        }
    }
}

/// Extracts the byte count from a copy-utility progress line.
///
/// Matches the first run of digits followed by whitespace and `bytes`, so both
/// `"52428800 bytes (52 MB, 50 MiB) copied, 1 s, 52 MB/s"` and the final
/// summary line yield a value.
pub fn parse_bytes_line(line: &str) -> Option<u64> {
    let captures = BYTES_PATTERN.captures(line)?;
    captures.get(1)?.as_str().parse().ok()
}

/// Parses the output of a size query (`stat -c %s`, a sysfs counter).
pub fn parse_size_output(output: &str) -> Option<u64> {
    output.trim().parse().ok()
}

/// Queries the current size of `path` with a privileged `stat`.
pub fn probe_file_size<E: PrivilegedExecutor + ?Sized>(executor: &E, path: &str) -> Result<u64> {
    let failed = || DumpError::PollFailed {
        path: path.to_string(),
    };
    let result = exec::run_command(executor, &format!("stat -c %s \"{path}\" 2>/dev/null"))
        .map_err(|_| failed())?;
    parse_size_output(&result.stdout).ok_or_else(failed)
}

/// Formats a byte count with binary units, e.g. `"0 B"`, `"1.0 KB"`, `"3.4 GB"`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNIT_PREFIXES.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}B", UNIT_PREFIXES[unit] as char)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::ScriptedExecutor;

    #[test]
    fn extracts_digit_run_before_bytes() {
        assert_eq!(
            parse_bytes_line("52428800 bytes (52 MB, 50 MiB) copied, 1 s, 52.4 MB/s"),
            Some(52_428_800)
        );
        assert_eq!(parse_bytes_line("copied so far: 17   bytes"), Some(17));
        assert_eq!(parse_bytes_line("1+0 records in"), None);
        assert_eq!(parse_bytes_line("12 kbytes"), None);
        assert_eq!(parse_bytes_line("bytes 12"), None);
        assert_eq!(parse_bytes_line(""), None);
    }

    #[test]
    fn only_ascii_digits_count() {
        assert_eq!(parse_bytes_line("\u{0663} bytes, then 5 bytes"), Some(5));
        assert_eq!(parse_bytes_line("\u{0663}\u{0664} bytes"), None);
    }

    #[test]
    fn first_match_wins() {
        assert_eq!(parse_bytes_line("10 bytes then 20 bytes"), Some(10));
    }

    #[test]
    fn overflowing_counts_are_rejected() {
        assert_eq!(parse_bytes_line("99999999999999999999999 bytes"), None);
    }

    #[test]
    fn permille_is_bounded_and_monotonic() {
        let total = 7_777i64;
        let mut last = 0;
        for copied in 0..=total as u64 {
            let permille = ProgressSample::new(copied, total).permille().unwrap();
            assert!(permille >= last);
            assert!(permille <= 1000);
            last = permille;
        }
        assert_eq!(ProgressSample::new(total as u64, total).permille(), Some(1000));
        assert_eq!(ProgressSample::new(total as u64 * 3, total).permille(), Some(1000));
    }

    #[test]
    fn huge_totals_do_not_overflow() {
        let total = i64::MAX;
        let sample = ProgressSample::new(total as u64 / 2, total);
        assert_eq!(sample.permille(), Some(499));
    }

    #[test]
    fn unknown_total_reports_raw_bytes() {
        for total in [0, -1] {
            let sample = ProgressSample::new(2048, total);
            assert_eq!(sample.permille(), None);
            assert_eq!(sample.to_string(), "Copied: 2.0 KB");
        }
    }

    #[test]
    fn renders_one_decimal_of_percentage() {
        let sample = ProgressSample::new(1234, 10_000);
        assert_eq!(sample.percent_label().as_deref(), Some("12.3"));
        assert_eq!(sample.to_string(), "Copying... 12.3% (1.2 KB / 9.8 KB)");
        assert_eq!(ProgressSample::new(0, 10).percent_label().as_deref(), Some("0.0"));
    }

    #[test]
    fn formats_bytes_across_unit_thresholds() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.0 MB");
        assert_eq!(format_bytes(4 * 1024 * 1024 * 1024), "4.0 GB");
        assert_eq!(format_bytes(u64::MAX), "16.0 EB");
    }

    #[test]
    fn parses_size_output() {
        assert_eq!(parse_size_output("  4096\n"), Some(4096));
        assert_eq!(parse_size_output(""), None);
        assert_eq!(parse_size_output("stat: cannot stat"), None);
    }

    #[test]
    fn probes_file_size_through_executor() {
        let executor = ScriptedExecutor::new()
            .on("stat -c %s \"/sdcard/Backup/boot.img\"", 0, "65536\n", "")
            .on("stat", 1, "", "");
        assert_eq!(probe_file_size(&executor, "/sdcard/Backup/boot.img").unwrap(), 65536);
        assert!(matches!(
            probe_file_size(&executor, "/missing"),
            Err(DumpError::PollFailed { .. })
        ));

        let refusing = ScriptedExecutor::new().refuse("stat");
        assert!(matches!(
            probe_file_size(&refusing, "/x"),
            Err(DumpError::PollFailed { .. })
        ));
    }
}
