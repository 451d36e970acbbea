use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use dialoguer::{Confirm, MultiSelect, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use partdump_core::config::{
    DEFAULT_BLOCK_SIZE, DEFAULT_BY_NAME_DIR, DEFAULT_OUTPUT_DIR, DumpConfig,
};
use partdump_core::coordinator::DumpCoordinator;
use partdump_core::exec::{Elevation, ShellExecutor};
use partdump_core::partition::Partition;
use partdump_core::progress::{DumpObserver, ProgressSample};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Progress bars run on a permille scale, one decimal of percentage.
const PERMILLE_SCALE: u64 = 1000;

#[derive(Parser)]
#[command(name = "partdump")]
#[command(about = "Back up device partitions to image files", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// How privileged commands are run
    #[arg(long, value_enum, default_value_t = ElevationArg::Auto, global = true)]
    elevation: ElevationArg,

    /// Directory holding the named partition links
    #[arg(long, default_value = DEFAULT_BY_NAME_DIR, global = true)]
    by_name_dir: PathBuf,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the named partitions of this device
    List,
    /// Dump partitions to image files
    Dump {
        /// Partitions to dump; pick interactively when omitted
        names: Vec<String>,

        /// Dump every listed partition
        #[arg(long, conflicts_with = "names")]
        all: bool,

        /// Directory that receives the images
        #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
        output_dir: PathBuf,

        /// Block size passed to dd
        #[arg(long, default_value = DEFAULT_BLOCK_SIZE)]
        block_size: String,

        /// Interval between size polls when dd cannot report progress
        #[arg(long, default_value_t = 1000)]
        poll_interval_ms: u64,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ElevationArg {
    /// Use sh when already root, su otherwise
    Auto,
    /// Always go through su -c
    Su,
    /// Run sh -c directly
    Direct,
}

impl From<ElevationArg> for Elevation {
    fn from(arg: ElevationArg) -> Self {
        match arg {
            ElevationArg::Auto => Elevation::Auto,
            ElevationArg::Su => Elevation::Su,
            ElevationArg::Direct => Elevation::Direct,
        }
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// Renders dump updates on a single progress bar.
///
/// The bar switches between a permille bar and a byte spinner depending on
/// whether the current partition's size is known.
struct BarObserver {
    bar: ProgressBar,
    mode: AtomicU8,
    /// Receives status lines while the bar is hidden (no terminal attached).
    plain: Mutex<Box<dyn Write + Send>>,
}

const MODE_UNSET: u8 = 0;
const MODE_PERCENT: u8 = 1;
const MODE_RAW: u8 = 2;

impl BarObserver {
    fn new(bar: ProgressBar) -> Self {
        Self::with_plain_output(bar, Box::new(io::stderr()))
    }

    fn with_plain_output(bar: ProgressBar, plain: Box<dyn Write + Send>) -> Self {
        Self {
            bar,
            mode: AtomicU8::new(MODE_UNSET),
            plain: Mutex::new(plain),
        }
    }

    fn switch_mode(&self, mode: u8) {
        if self.mode.swap(mode, Ordering::AcqRel) == mode {
            return;
        }
        let style = if mode == MODE_PERCENT {
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.green/black}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("■ ")
        } else {
            ProgressStyle::default_spinner()
                .template("[{elapsed_precise}] [{spinner:.blue}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
        };
        self.bar.set_style(style);
        if mode == MODE_RAW {
            self.bar.enable_steady_tick(Duration::from_millis(100));
        } else {
            self.bar.disable_steady_tick();
        }
    }
}

impl DumpObserver for BarObserver {
    fn on_status(&self, message: &str) {
        if !self.bar.is_hidden() {
            self.bar.println(format!("{} {}", style("›").cyan(), message));
            return;
        }
        if let Ok(mut plain) = self.plain.lock() {
            let _ = writeln!(plain, "{message}");
        }
    }

    fn on_progress(&self, sample: ProgressSample) {
        match sample.permille() {
            Some(permille) => {
                self.switch_mode(MODE_PERCENT);
                self.bar.set_length(PERMILLE_SCALE);
                self.bar.set_position(u64::from(permille));
            }
            None => self.switch_mode(MODE_RAW),
        }
        self.bar.set_message(sample.to_string());
    }
}

/// Resolves the partitions to dump from the command line, or asks.
fn select_partitions(partitions: &[Partition], names: &[String], all: bool) -> Result<Vec<Partition>> {
    if all {
        return Ok(partitions.to_vec());
    }

    if !names.is_empty() {
        return names
            .iter()
            .map(|name| {
                partitions
                    .iter()
                    .find(|p| &p.name == name)
                    .cloned()
                    .ok_or_else(|| anyhow!("Unknown partition '{name}'."))
            })
            .collect();
    }

    let items: Vec<String> = partitions.iter().map(|p| p.to_string()).collect();
    let chosen = MultiSelect::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the partitions to dump (space to toggle)")
        .items(&items)
        .interact()?;

    if chosen.is_empty() {
        return Err(anyhow!("Select one or more partitions first."));
    }
    Ok(chosen.into_iter().map(|i| partitions[i].clone()).collect())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn load_partitions<E: partdump_core::exec::PrivilegedExecutor>(
    coordinator: &DumpCoordinator<E>,
) -> Result<Vec<Partition>> {
    let partitions = coordinator.enumerate()?;
    if partitions.is_empty() {
        return Err(anyhow!(
            "Could not list {}. Is root available?",
            coordinator.config().by_name_dir.display()
        ));
    }
    Ok(partitions)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let executor = ShellExecutor::new(cli.elevation.into());

    match cli.command {
        Commands::List => {
            let config = DumpConfig::default().with_by_name_dir(&cli.by_name_dir);
            let coordinator = DumpCoordinator::new(executor, config);
            let partitions = load_partitions(&coordinator)?;

            println!("Found {} partitions:", partitions.len());
            println!("\n  {:<20} {:>10}  {}", "NAME", "SIZE", "DEVICE");
            println!("  {:-<20} {:->10}  {:-<20}", "", "", "");
            for partition in partitions {
                println!(
                    "  {:<20} {:>10}  {}",
                    partition.name,
                    partition.size_label(),
                    partition.real_path
                );
            }
        }
        Commands::Dump {
            names,
            all,
            output_dir,
            block_size,
            poll_interval_ms,
            yes,
        } => {
            let config = DumpConfig::default()
                .with_by_name_dir(&cli.by_name_dir)
                .with_output_dir(&output_dir)
                .with_block_size(block_size)
                .with_poll_interval(Duration::from_millis(poll_interval_ms.max(1)));
            let coordinator = DumpCoordinator::new(executor, config);
            let partitions = load_partitions(&coordinator)?;
            let selected = select_partitions(&partitions, &names, all)?;

            println!("This will dump {} partitions:", selected.len());
            for partition in &selected {
                println!(
                    "  {} -> {}",
                    style(partition).cyan(),
                    coordinator.config().image_path(partition).display()
                );
            }
            println!();

            if !yes && !confirm_operation("Are you sure you want to proceed?")? {
                println!("Dump cancelled.");
                return Ok(());
            }

            println!();

            let bar = ProgressBar::new(PERMILLE_SCALE);
            let observer = BarObserver::new(bar.clone());
            let summary = coordinator.dump_all(&selected, &observer)?;

            match summary.failure {
                None => {
                    bar.finish_with_message("Dump complete.");
                    println!(
                        "\n✨ Backed up {} partitions to {}.",
                        summary.dumped.len(),
                        style(output_dir.display()).cyan()
                    );
                }
                Some((name, err)) => {
                    bar.abandon_with_message("❌ Dump failed.");
                    return Err(anyhow::Error::new(err).context(format!(
                        "Dump of '{name}' failed. Check root access and free space."
                    )));
                }
            }
        }
    }

    Ok(())
}
