//! qr-attendance - log scanned attendance entries to monthly append blobs
//!
//! Reads one entry per line from stdin (a QR scanner acting as a keyboard,
//! or a pipe) and hands each to the attendance logger, which delivers it in
//! the background and keeps a local fallback file while the store is
//! unreachable.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Fallback file: $XDG_DATA_HOME/qr-attendance-logger/failed_attendance.log
//! - Logs: $XDG_STATE_HOME/qr-attendance-logger/qr-attendance.log
//! - Config: $XDG_CONFIG_HOME/qr-attendance-logger/config.toml

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qr_attendance_core::sink::{AppendBlobSink, AzureBlobService, MemoryBlobService, RemoteSink};
use qr_attendance_core::{AttendanceLogger, Config, DeliveryStats, FallbackStore, LoggerOptions};
use serde::Serialize;
use std::fs;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread;

#[derive(Parser)]
#[command(name = "qr-attendance")]
#[command(about = "Log scanned attendance entries to monthly append blobs")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Read entries from stdin and deliver them (default)
    Run {
        /// Keep blobs in memory and print them on exit instead of using Azure
        #[arg(long)]
        dry_run: bool,

        /// Echo every accepted entry
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show configuration and pending fallback records
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the config file path
    Config,
}

/// Events feeding the run loop
enum Input {
    Line(String),
    Eof,
    Interrupted,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    match args.command.unwrap_or(Command::Run {
        dry_run: false,
        verbose: false,
    }) {
        Command::Run { dry_run, verbose } => cmd_run(&config, dry_run, verbose),
        Command::Status { json } => cmd_status(&config, json),
        Command::Config => {
            println!("{}", Config::config_path().display());
            Ok(())
        }
    }
}

fn cmd_run(config: &Config, dry_run: bool, verbose: bool) -> Result<()> {
    let _log_guard = qr_attendance_core::logging::init(&config.logging)
        .context("failed to initialize logging")?;

    tracing::info!(dry_run, "qr-attendance starting");

    let mut options = LoggerOptions::from_config(config);

    if dry_run {
        // The real fallback file is only copied, never consumed
        let scratch = tempfile::TempDir::new().context("failed to create dry-run directory")?;
        options.working_dir = scratch.path().to_path_buf();
        let real_fallback = config.fallback_path();
        if real_fallback.is_file() {
            fs::copy(&real_fallback, options.fallback_path())
                .context("failed to copy fallback file")?;
            println!("Dry run uses a copy of {}", real_fallback.display());
        }

        let service = MemoryBlobService::new();
        let sink = AppendBlobSink::connect(service.clone()).context("failed to open memory store")?;
        let stats = run_logger(sink, options, verbose)?;
        print_stats(&stats);

        println!("\nDry run - blobs kept in memory:");
        for (name, content) in service.blobs() {
            println!("--- {}", name);
            print!("{}", content);
        }
        return Ok(());
    }

    let credentials = config
        .remote
        .credentials()
        .context("storage credentials are not configured")?;
    let service = AzureBlobService::new(&credentials, &config.remote, config.delivery.append_timeout())
        .context("invalid remote settings")?;
    println!("Blob endpoint: {}/{}", service.endpoint(), service.container());

    let sink = AppendBlobSink::connect(service).context("failed to connect to blob storage")?;
    let stats = run_logger(sink, options, verbose)?;
    print_stats(&stats);

    Ok(())
}

/// Feed stdin into a logger until EOF or Ctrl+C, then drain and stop it
fn run_logger<S>(sink: S, options: LoggerOptions, verbose: bool) -> Result<DeliveryStats>
where
    S: RemoteSink + 'static,
{
    let logger = AttendanceLogger::start(sink, options).context("failed to start logger")?;
    println!("Working directory: {}", logger.working_dir().display());

    let (tx, rx) = mpsc::channel();

    let interrupt_tx = tx.clone();
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if should_exit_on_interrupt(&interrupted, &interrupt_tx) {
            eprintln!("\nInterrupted while draining, exiting without waiting");
            std::process::exit(130);
        }
    })
    .context("failed to set Ctrl+C handler")?;

    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(Input::Line(line)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read from stdin");
                        break;
                    }
                }
            }
            let _ = tx.send(Input::Eof);
        })
        .context("failed to spawn stdin reader")?;

    println!("Ready. Scan entries, Ctrl+C or end of input to stop.");

    let mut accepted = 0usize;
    for input in rx {
        match input {
            Input::Line(line) => {
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                logger.log(text);
                accepted += 1;
                if verbose {
                    let timestamp = chrono::Local::now().format("%H:%M:%S");
                    println!("[{}] Queued: {}", timestamp, text);
                }
            }
            Input::Eof => break,
            Input::Interrupted => {
                eprintln!("\nShutting down... (Ctrl+C again to exit without draining)");
                break;
            }
        }
    }

    tracing::info!(accepted, "Input closed, draining queue");
    println!("Accepted {} entr{}, delivering...", accepted, if accepted == 1 { "y" } else { "ies" });

    let fallback = logger.fallback_path().to_path_buf();
    let stats = logger.shutdown().context("delivery worker failed")?;

    let pending = FallbackStore::new(&fallback).pending_lines().unwrap_or(0);
    if pending > 0 {
        println!(
            "{} record(s) kept in {} for the next run",
            pending,
            fallback.display()
        );
    }

    Ok(stats)
}

/// First Ctrl+C stops reading input; a second one, or one arriving after
/// the input loop has ended, exits immediately.
fn should_exit_on_interrupt(interrupted: &AtomicBool, tx: &Sender<Input>) -> bool {
    if interrupted.swap(true, Ordering::SeqCst) {
        return true;
    }
    tx.send(Input::Interrupted).is_err()
}

fn print_stats(stats: &DeliveryStats) {
    println!("\nDelivery complete:");
    println!("  Delivered:      {}", stats.delivered);
    println!("  Failed:         {}", stats.failed);
    println!("  Re-added:       {}", stats.reingested);
    if stats.dropped_lines > 0 {
        println!("  Dropped lines:  {}", stats.dropped_lines);
    }
    if stats.lost > 0 {
        println!("  Lost:           {}", stats.lost);
    }
}

#[derive(Serialize)]
struct StatusReport {
    config_path: String,
    config_found: bool,
    container: String,
    blob_file_name: String,
    endpoint: Option<String>,
    credentials: Option<String>,
    credential_source: Option<String>,
    working_dir: String,
    fallback_path: String,
    pending_records: usize,
    log_path: String,
}

impl StatusReport {
    fn collect(config: &Config) -> Result<Self> {
        let config_path = Config::config_path();
        let fallback_path = config.fallback_path();
        let pending_records = FallbackStore::new(&fallback_path)
            .pending_lines()
            .context("failed to read fallback file")?;

        Ok(Self {
            config_found: config_path.exists(),
            config_path: config_path.display().to_string(),
            container: config.remote.container.clone(),
            blob_file_name: config.remote.blob_file_name.clone(),
            endpoint: config.remote.endpoint.clone(),
            credentials: config
                .remote
                .credentials()
                .ok()
                .map(|c| c.describe().to_string()),
            credential_source: config.remote.credential_source().map(|s| s.to_string()),
            working_dir: Config::data_dir().display().to_string(),
            fallback_path: fallback_path.display().to_string(),
            pending_records,
            log_path: Config::log_path().display().to_string(),
        })
    }
}

fn cmd_status(config: &Config, json: bool) -> Result<()> {
    let report = StatusReport::collect(config)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to encode status")?
        );
        return Ok(());
    }

    println!("QR Attendance Logger Status");
    println!("===========================");
    println!();
    println!(
        "Config file:     {}{}",
        report.config_path,
        if report.config_found { "" } else { " (not found, using defaults)" }
    );
    println!("Container:       {}", report.container);
    println!("Blob file name:  {}", report.blob_file_name);
    println!(
        "Endpoint:        {}",
        report.endpoint.as_deref().unwrap_or("<from credentials>")
    );
    match (&report.credentials, &report.credential_source) {
        (Some(kind), Some(source)) => println!("Credentials:     {} ({})", kind, source),
        _ => println!("Credentials:     <not set>"),
    }
    println!();
    println!("Working dir:     {}", report.working_dir);
    println!("Fallback file:   {}", report.fallback_path);
    println!("Pending records: {}", report.pending_records);
    println!("Log file:        {}", report.log_path);

    if report.pending_records > 0 {
        println!();
        println!("Pending records are retried with the next scanned entry.");
    }

    Ok(())
}
