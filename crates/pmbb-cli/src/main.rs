#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use pmbb_core::{LinuxPlatform, Platform, bounds, locate};
use pmbb_ndctl::SysfsConfig;
use pmbb_types::{BadBlock, BadBlockSet, FileType};
use std::env::VarError;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, info_span};
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "PMBB_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "log format {raw:?} (from --log-format or {key}) is not one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    /// `--log-format`, else `PMBB_LOG_FORMAT`, else human.
    fn resolve(flag: Option<Self>) -> Result<Self> {
        if let Some(format) = flag {
            return Ok(format);
        }
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Self::parse(&value),
            Err(VarError::NotPresent) => Ok(Self::Human),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} is not valid UTF-8; unset it or pass --log-format", key = Self::ENV_KEY)
            }
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

/// Install the stderr subscriber. `RUST_LOG` filters, default `info`.
fn init_logging(flag: Option<LogFormat>) -> Result<LogFormat> {
    let format = LogFormat::resolve(flag)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let installed = match format {
        LogFormat::Human => builder.compact().try_init(),
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
    };
    installed.map_err(|err| {
        anyhow::anyhow!("cannot install {} log subscriber: {err}", format.as_str())
    })?;
    Ok(format)
}

#[derive(Parser)]
#[command(name = "pmbb", about = "Persistent-memory bad block discovery and clearing")]
struct Cli {
    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `PMBB_LOG_FORMAT` > `human`.
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    /// Root of the sysfs tree (`PMBB_SYSFS_ROOT`, default `/sys`).
    #[arg(long, global = true)]
    sysfs_root: Option<PathBuf>,
    /// Root of the device node tree (`PMBB_DEV_ROOT`, default `/dev`).
    #[arg(long, global = true)]
    dev_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the file-relative bad blocks of a file.
    List {
        /// Regular file on a DAX filesystem, or a device-DAX node.
        file: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Print the number of bad blocks. Exits 2 when there are any.
    Count {
        file: PathBuf,
    },
    /// Clear bad blocks, all of them unless ranges are given.
    Clear {
        file: PathBuf,
        /// File-relative range as OFFSET:LENGTH (decimal or 0x hex). Repeatable.
        #[arg(long = "range", value_name = "OFFSET:LENGTH", value_parser = parse_range)]
        ranges: Vec<BadBlock>,
    },
    /// Show the region and namespace a file lives on.
    Namespace {
        file: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    const fn name(&self) -> &'static str {
        match self {
            Self::List { .. } => "list",
            Self::Count { .. } => "count",
            Self::Clear { .. } => "clear",
            Self::Namespace { .. } => "namespace",
        }
    }
}

/// Exit status of a command that ran to completion.
const EXIT_OK: i32 = 0;
const EXIT_HAS_BADBLOCKS: i32 = 2;

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    match run() {
        Ok(EXIT_OK) => {}
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let log_format = init_logging(cli.log_format)?;
    let config = sysfs_config(cli.sysfs_root, cli.dev_root)?;
    let command_name = cli.command.name();
    let run_span = info_span!(
        target: "pmbb::cli",
        "command",
        command = command_name,
        log_format = log_format.as_str(),
        sysfs_root = %config.sysfs_root.display()
    );
    let _run_guard = run_span.enter();
    let started = Instant::now();

    info!(
        target: "pmbb::cli",
        command = command_name,
        log_format = log_format.as_str(),
        "command_start"
    );

    let linux = LinuxPlatform::new(config);
    let platform = linux.platform();
    let result = match cli.command {
        Command::List { file, json } => list_cmd(&platform, &file, json).map(|()| EXIT_OK),
        Command::Count { file } => count_cmd(&platform, &file),
        Command::Clear { file, ranges } => clear_cmd(&platform, &file, ranges).map(|()| EXIT_OK),
        Command::Namespace { file, json } => {
            namespace_cmd(&platform, &file, json).map(|()| EXIT_OK)
        }
    };

    let duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    match &result {
        Err(err) => error!(
            target: "pmbb::cli",
            command = command_name,
            duration_us,
            error = %err,
            "command_failed"
        ),
        Ok(exit_code) => info!(
            target: "pmbb::cli",
            command = command_name,
            duration_us,
            exit_code,
            "command_succeeded"
        ),
    }

    result
}

/// Flag, then environment, then the default root.
fn sysfs_config(sysfs_root: Option<PathBuf>, dev_root: Option<PathBuf>) -> Result<SysfsConfig> {
    let mut config = SysfsConfig::from_env().context("failed to read sysfs roots from environment")?;
    if let Some(root) = sysfs_root {
        config.sysfs_root = root;
    }
    if let Some(root) = dev_root {
        config.dev_root = root;
    }
    Ok(config)
}

// ── Commands ────────────────────────────────────────────────────────────────

fn list_cmd(platform: &Platform<'_>, path: &Path, json: bool) -> Result<()> {
    let set = pmbb_core::get_badblocks(platform, path)
        .with_context(|| format!("failed to read bad blocks of {}", path.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&set).context("serialize bad blocks")?
        );
        return Ok(());
    }

    if set.is_empty() {
        println!("{}: no bad blocks", path.display());
        return Ok(());
    }
    println!("{}: {} bad block(s)", path.display(), set.count());
    println!("{:>20} {:>12} {:>8}", "OFFSET", "LENGTH", "REPLICA");
    for record in &set {
        println!(
            "{:>20} {:>12} {:>8}",
            format!("{:#x}", record.offset),
            record.length,
            record.healthy_replica_count
        );
    }
    Ok(())
}

fn count_cmd(platform: &Platform<'_>, path: &Path) -> Result<i32> {
    let set = pmbb_core::get_badblocks(platform, path)
        .with_context(|| format!("failed to count bad blocks of {}", path.display()))?;
    println!("{}", set.count());
    Ok(if set.is_empty() {
        EXIT_OK
    } else {
        EXIT_HAS_BADBLOCKS
    })
}

fn clear_cmd(platform: &Platform<'_>, path: &Path, ranges: Vec<BadBlock>) -> Result<()> {
    let command_span = info_span!(
        target: "pmbb::cli::clear",
        "clear",
        file = %path.display(),
        explicit_ranges = ranges.len()
    );
    let _command_guard = command_span.enter();

    if ranges.is_empty() {
        pmbb_core::clear_all_badblocks(platform, path)
            .with_context(|| format!("failed to clear bad blocks of {}", path.display()))?;
        println!("{}: all reported bad blocks cleared", path.display());
        return Ok(());
    }

    let file_type = platform
        .ndctl
        .file_type(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let ns_resource = match file_type {
        FileType::DevDax => device_resource(platform, path)?,
        FileType::Regular => 0,
    };
    let count = ranges.len();
    let targets = BadBlockSet::new(ns_resource, ranges);
    pmbb_core::clear_badblocks(platform, path, Some(&targets))
        .with_context(|| format!("failed to clear ranges of {}", path.display()))?;
    println!("{}: {count} range(s) cleared", path.display());
    Ok(())
}

/// Absolute resource of the namespace under a device-DAX node: region
/// resource plus the namespace offset inside the region.
fn device_resource(platform: &Platform<'_>, path: &Path) -> Result<u64> {
    let placement = locate::locate(platform.ndctl, path)
        .with_context(|| format!("failed to locate {}", path.display()))?;
    let (Some(region), Some(namespace)) = (placement.region, placement.namespace) else {
        bail!("{} is not on a PMEM namespace", path.display());
    };
    let window = bounds::resolve_bounds(&region, &namespace)?;
    let region_resource = region
        .resource()
        .with_context(|| format!("{} has no resource attribute", region.name()))?;
    region_resource
        .checked_add(window.offset)
        .with_context(|| format!("namespace resource of {} overflows", namespace.name()))
}

fn namespace_cmd(platform: &Platform<'_>, path: &Path, json: bool) -> Result<()> {
    let report = pmbb_core::namespace_report(platform, path)
        .with_context(|| format!("failed to resolve the namespace of {}", path.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize namespace report")?
        );
        return Ok(());
    }

    let Some(report) = report else {
        println!("{}: not on a PMEM namespace", path.display());
        return Ok(());
    };
    println!("region:    {}", report.region);
    println!("namespace: {}", report.namespace);
    println!("mode:      {} ({})", report.mode, report.kind.label());
    println!("offset:    {:#x}", report.bounds.offset);
    println!("size:      {:#x}", report.bounds.size);
    Ok(())
}

// ── Argument parsing ────────────────────────────────────────────────────────

fn parse_u64(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|err| format!("{raw:?}: {err}"))
}

fn parse_range(raw: &str) -> Result<BadBlock, String> {
    let (offset, length) = raw
        .split_once(':')
        .ok_or_else(|| format!("{raw:?}: expected OFFSET:LENGTH"))?;
    let offset = parse_u64(offset)?;
    let length = parse_u64(length)?;
    let length = u32::try_from(length).map_err(|_| format!("{raw:?}: length exceeds u32"))?;
    if length == 0 {
        return Err(format!("{raw:?}: length must be non-zero"));
    }
    Ok(BadBlock::new(offset, length))
}
