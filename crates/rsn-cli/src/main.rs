use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use rsn_core::{export, FileEntry, FilesystemType, RecoveryEngine, RecoveryStats, ScanOptions, ScanReport};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rsn", version, about = "Deleted-file metadata recovery for NTFS, APFS and ext4")]
struct Cli {
	/// Log more (-v info, -vv debug). RUST_LOG overrides.
	#[arg(short, long, action = ArgAction::Count, global = true)]
	verbose: u8,
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Identify the filesystem on a device or image
	Detect {
		device: PathBuf,
	},
	/// Walk filesystem metadata and list recoverable entries
	Scan {
		/// Device path (/dev/sdb1, \\.\PhysicalDrive1) or image file
		device: PathBuf,
		#[arg(long, value_enum, default_value_t = OutputFormat::Table)]
		format: OutputFormat,
		/// Write results here instead of stdout
		#[arg(short, long)]
		output: Option<PathBuf>,
		/// Only list deleted entries
		#[arg(long)]
		deleted_only: bool,
		/// Minimum confidence score (0.0-1.0)
		#[arg(long)]
		min_confidence: Option<f32>,
		/// Cap on ext4 inode slots visited
		#[arg(long)]
		max_inodes: Option<u64>,
		/// JSON file with scan options
		#[arg(long)]
		config: Option<PathBuf>,
	},
	/// List APFS snapshots
	Snapshots {
		device: PathBuf,
	},
	/// Show the ext4 journal location
	Journal {
		device: PathBuf,
	},
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
	Table,
	Csv,
	Json,
}

fn init_tracing(verbose: u8) {
	let default = match verbose {
		0 => "warn",
		1 => "info",
		_ => "debug",
	};
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(io::stderr)
		.init();
}

fn load_options(config: Option<&Path>) -> Result<ScanOptions> {
	let Some(path) = config else {
		return Ok(ScanOptions::default());
	};
	let text = std::fs::read_to_string(path)
		.with_context(|| format!("Failed to read config {}", path.display()))?;
	serde_json::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
}

fn open_engine(device: &Path, options: ScanOptions) -> Result<RecoveryEngine> {
	let mut engine = RecoveryEngine::with_options(options);
	engine
		.try_open_device(device)
		.with_context(|| format!("Cannot open {}", device.display()))?;
	Ok(engine)
}

/// Open, check the detected type and parse
fn scan_expecting(device: &Path, expected: FilesystemType) -> Result<RecoveryEngine> {
	let mut engine = open_engine(device, ScanOptions::default())?;
	let detected = engine.detect_filesystem();
	if detected != expected {
		bail!("{} holds {}, not {}", device.display(), detected, expected);
	}
	engine.try_parse_device().context("Scan failed")?;
	Ok(engine)
}

/// Ctrl-C stops the walk at the next record; partial results are still written
fn cancel_on_interrupt(engine: &RecoveryEngine) -> Result<()> {
	let cancel = engine.cancel_handle();
	ctrlc::set_handler(move || cancel.cancel()).context("Failed to set Ctrl+C handler")
}

fn progress_bar() -> Result<ProgressBar> {
	let bar = ProgressBar::new(100);
	bar.set_style(
		ProgressStyle::default_bar()
			.template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>3}% {msg}")?
			.progress_chars("#>-"),
	);
	Ok(bar)
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
	Ok(match output {
		Some(path) => Box::new(BufWriter::new(
			File::create(path).with_context(|| format!("Cannot create {}", path.display()))?,
		)),
		None => Box::new(io::stdout().lock()),
	})
}

fn write_table<W: Write>(entries: &[FileEntry], writer: &mut W) -> io::Result<()> {
	writeln!(writer, "{:<8} {:>12} {:>6}  {:<8} PATH", "ID", "SIZE", "CONF", "STATUS")?;
	for entry in entries {
		writeln!(
			writer,
			"{:<8} {:>12} {:>5.0}%  {:<8} {}{}",
			entry.id,
			entry.size,
			entry.recovery_confidence * 100.0,
			if entry.is_deleted { "deleted" } else { "active" },
			entry.path,
			if entry.is_directory { "/" } else { "" },
		)?;
	}
	writer.flush()
}

fn print_summary(report: &ScanReport) {
	eprintln!("Scan {} of {} ({})", report.scan_id, report.device, report.filesystem);
	eprintln!(
		"Entries: {}  deleted: {}  skipped: {}  read: {} MB in {:.2?}{}",
		report.stats.total_recoverable,
		report.stats.total_deleted,
		report.skipped,
		report.bytes_read / (1024 * 1024),
		report.elapsed,
		if report.cancelled { "  (cancelled)" } else { "" }
	);
}

fn main() -> Result<()> {
	let cli = Cli::parse();
	init_tracing(cli.verbose);

	match cli.command {
		Commands::Detect { device } => {
			let mut engine = open_engine(&device, ScanOptions::default())?;
			let fs_type = engine.detect_filesystem();
			let info = engine.device_info();
			println!("Device:      {}", info.path);
			println!("Size:        {} bytes", info.total_bytes);
			println!("Sector size: {} bytes", info.sector_size);
			println!("Filesystem:  {}", info.filesystem_name);
			if fs_type == FilesystemType::Unknown {
				bail!("No known filesystem signature on {}", device.display());
			}
			if !fs_type.has_parser() {
				eprintln!("{} is detected but cannot be scanned", fs_type);
			}
		}
		Commands::Scan {
			device,
			format,
			output,
			deleted_only,
			min_confidence,
			max_inodes,
			config,
		} => {
			let mut options = load_options(config.as_deref())?;
			if deleted_only {
				options.include_live = false;
			}
			if max_inodes.is_some() {
				options.max_inodes = max_inodes;
			}
			tracing::debug!("Scan options: {:?}", options);

			let mut engine = open_engine(&device, options)?;
			cancel_on_interrupt(&engine)?;
			let bar = progress_bar()?;
			let feed = bar.clone();
			engine.set_progress_callback(move |p| {
				feed.set_position(p.percent as u64);
				feed.set_message(format!(
					"{} | {} found, {} deleted",
					p.operation, p.files_found, p.deleted_found
				));
			});

			let result = engine.try_parse_device();
			bar.finish_and_clear();
			let mut report = result.with_context(|| format!("Scan of {} failed", device.display()))?;

			if let Some(min) = min_confidence {
				report.entries.retain(|e| e.recovery_confidence >= min);
				report.stats = RecoveryStats::from_entries(&report.entries, report.skipped);
			}

			let mut writer = output_writer(output.as_deref())?;
			match format {
				OutputFormat::Table => write_table(&report.entries, &mut writer)?,
				OutputFormat::Csv => export::write_csv(&report.entries, &mut writer, Utc::now())?,
				OutputFormat::Json => export::write_json(&report, &mut writer)?,
			}
			print_summary(&report);
		}
		Commands::Snapshots { device } => {
			let engine = scan_expecting(&device, FilesystemType::Apfs)?;
			let snapshots = engine.apfs_snapshots();
			if snapshots.is_empty() {
				println!("No snapshots");
			}
			for snap in snapshots {
				let created = snap
					.create_time
					.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
					.unwrap_or_else(|| "-".to_string());
				println!("{:>10}  {}  {}  ({})", snap.xid, created, snap.name, snap.volume);
			}
		}
		Commands::Journal { device } => {
			let engine = scan_expecting(&device, FilesystemType::Ext4)?;
			match engine.ext4_journal_info() {
				Some(info) => println!("{}", info),
				None => println!("No journal"),
			}
		}
	}
	Ok(())
}
