use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use suc_core::events::TracingObserver;
use suc_core::protocol::{TransferRange, parse_hex};
use suc_core::session::{SessionConfig, UploadSession, read_probe_file};
use suc_core::transport::NusbTransport;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "SUC - Samsung Upload Client (Pure Rust)", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Load settings from a TOML file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for per-area dumps
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Bulk transfer timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Save the raw probe response to this file
    #[arg(long, global = true)]
    save_probe: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the probed partition table
    Print,
    /// Download specific memory partition
    Partition {
        /// Partition number to read
        index: usize,
    },
    /// Download all memory partitions
    All,
    /// Download specific range
    Range {
        /// Start offset in hex
        start: String,
        /// End offset in hex (inclusive)
        end: String,
        #[arg(short, long, default_value = "range.bin")]
        output: PathBuf,
    },
    /// Try to download the full address space
    Full {
        #[arg(short, long, default_value = "range.bin")]
        output: PathBuf,
    },
    /// Print partition table from file
    File {
        /// Filename to read from
        path: PathBuf,
    },
    /// List attached USB devices
    Devices,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {}", e);
    }

    info!("Starting SUC (nusb backend)...");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    Ok(config)
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;

    match &args.command {
        Some(Command::File { path }) => {
            let table = read_probe_file(path, config.min_record_start)?;
            print!("{}", table);
            return Ok(());
        }
        Some(Command::Devices) => return list_devices(),
        _ => {}
    }

    let mut session = UploadSession::connect(config, Arc::new(TracingObserver))?;
    match &args.save_probe {
        Some(path) => session.capture_probe(path)?,
        None => session.probe()?,
    };

    match args.command.unwrap_or(Command::Print) {
        Command::Print => {
            if let Some(table) = session.table() {
                print!("{}", table);
            }
            print_usage_hints();
        }
        Command::Partition { index } => {
            println!("\nDownloading ....\n-----------------");
            let path = session.download_partition(index)?;
            println!("Done. Dumped memory was written to {}", path.display());
        }
        Command::All => {
            println!("\nDownloading ....\n-----------------");
            let report = session.download_all()?;
            for area in report.failures() {
                if let Err(e) = &area.result {
                    warn!(area = %area.name, "{}", e);
                }
            }
            let dir = session.config().output_dir.clone();
            session.finish()?;
            if !report.all_succeeded() {
                anyhow::bail!(
                    "{} of {} areas failed, partial dumps kept in {}",
                    report.failures().count(),
                    report.areas.len(),
                    dir.display()
                );
            }
            println!(
                "Done. Dumped memory has been written to {} directory.",
                dir.display()
            );
            return Ok(());
        }
        Command::Range { start, end, output } => {
            let start = parse_hex(&start).with_context(|| format!("Invalid start '{}'", start))?;
            let end = parse_hex(&end).with_context(|| format!("Invalid end '{}'", end))?;
            let range = TransferRange::new(start, end)?;
            println!("\nDownloading ....\n-----------------");
            session.download_range(range, &output)?;
            println!("Done. Dumped memory was written to {}", output.display());
        }
        Command::Full { output } => {
            println!("\nDownloading ....\n-----------------");
            session.dump_full(&output)?;
            println!("Done. Dumped memory was written to {}", output.display());
        }
        Command::File { .. } | Command::Devices => {}
    }

    session.finish()
}

fn print_usage_hints() {
    println!("\nRun 'suc all' to dump all areas");
    println!("Run 'suc partition [number]' to dump specific area");
    println!("Run 'suc range [start_hex] [end_hex]' to dump specific memarea");
    println!("Run 'suc full' to try to bruteforce dump memarea");
    println!("Run 'suc file [filename]' to print the partition table from file");
}

fn list_devices() -> Result<()> {
    let devices = NusbTransport::list_attached().context("Failed to enumerate USB devices")?;
    if devices.is_empty() {
        println!("No USB devices found");
    }
    for device in devices {
        println!(
            "{:04X}:{:04X}  {}  {}",
            device.vendor_id,
            device.product_id,
            device.manufacturer.as_deref().unwrap_or("-"),
            device.product.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
