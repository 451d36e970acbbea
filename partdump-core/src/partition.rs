use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::exec::{self, PrivilegedExecutor};
use crate::progress::{format_bytes, parse_size_output};

/// Size of one sector as reported by `/sys/class/block/<dev>/size`.
pub const SECTOR_SIZE: i64 = 512;

/// A named partition exposed by the device.
///
/// Populated by [`enumerate`] (or by any other source) and only read by the
/// copy pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// The partition label (e.g., "boot").
    pub name: String,
    /// The symbolic path the partition was found under (e.g., `/dev/block/by-name/boot`).
    pub link_path: String,
    /// The resolved device node (e.g., `/dev/block/sda12`).
    pub real_path: String,
    /// The exact size in bytes, or `-1` if unknown.
    pub total_bytes: i64,
}

impl Partition {
    pub fn new(
        name: impl Into<String>,
        link_path: impl Into<String>,
        real_path: impl Into<String>,
        total_bytes: i64,
    ) -> Self {
        Self {
            name: name.into(),
            link_path: link_path.into(),
            real_path: real_path.into(),
            total_bytes,
        }
    }

    pub fn size_known(&self) -> bool {
        self.total_bytes > 0
    }

    /// Human-readable size, `"?"` when unknown.
    pub fn size_label(&self) -> String {
        if self.size_known() {
            format_bytes(self.total_bytes as u64)
        } else {
            "?".to_string()
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  ({})", self.name, self.size_label())
    }
}

fn sectors_to_bytes(sectors: Option<u64>) -> i64 {
    match sectors {
        Some(sectors) if sectors > 0 => i64::try_from(sectors)
            .map(|sectors| sectors.saturating_mul(SECTOR_SIZE))
            .unwrap_or(-1),
        _ => -1,
    }
}

/// Parses one `name|link|real|sectors` record of the enumeration script.
pub fn parse_listing_line(line: &str) -> Option<Partition> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < 4 {
        return None;
    }
    let link_path = fields[1];
    // The glob stays literal when the directory is empty.
    if link_path.ends_with("/*") {
        return None;
    }
    Some(Partition::new(
        fields[0],
        link_path,
        fields[2],
        sectors_to_bytes(parse_size_output(fields[3])),
    ))
}

/// Parses the whole output of the enumeration script, skipping malformed lines.
pub fn parse_listing(output: &str) -> Vec<Partition> {
    output
        .trim()
        .lines()
        .filter_map(parse_listing_line)
        .collect()
}

fn listing_command(by_name_dir: &Path) -> String {
    format!(
        "for f in {}/*; do name=$(basename \"$f\"); real=$(readlink -f \"$f\" 2>/dev/null); \
         base=$(basename \"$real\"); size=$(cat /sys/class/block/$base/size 2>/dev/null); \
         echo \"$name|$f|$real|$size\"; done",
        by_name_dir.display()
    )
}

/// Lists the partitions linked from `by_name_dir` (usually `/dev/block/by-name`).
///
/// Every entry is resolved to its device node and sized from sysfs with
/// elevated privileges. A listing that fails or comes back empty yields an
/// empty list; only a failure to start the privileged shell is an error.
pub fn enumerate<E: PrivilegedExecutor + ?Sized>(
    executor: &E,
    by_name_dir: &Path,
) -> Result<Vec<Partition>> {
    let result = exec::run_command(executor, &listing_command(by_name_dir))
        .with_context(|| format!("Could not list partitions under {}", by_name_dir.display()))?;

    if !result.success() || result.stdout.trim().is_empty() {
        warn!(
            exit_code = result.exit_code,
            dir = %by_name_dir.display(),
            "partition listing came back empty"
        );
        return Ok(Vec::new());
    }

    let partitions = parse_listing(&result.stdout);
    debug!(count = partitions.len(), "enumerated partitions");
    Ok(partitions)
}

/// Reads the size of a block device from sysfs, `-1` if it cannot be read.
pub fn probe_block_size<E: PrivilegedExecutor + ?Sized>(executor: &E, real_path: &str) -> i64 {
    let base_name = real_path.rsplit('/').next().unwrap_or(real_path);
    let command = format!("cat /sys/class/block/{base_name}/size 2>/dev/null");
    match exec::run_command(executor, &command) {
        Ok(result) => sectors_to_bytes(parse_size_output(&result.stdout)),
        Err(err) => {
            debug!(%err, real_path, "block size probe failed");
            -1
        }
    }
}
