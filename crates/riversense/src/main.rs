//! RiverSense CLI - GNSS raw log to RINEX conversion.

use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{error, info};

use riversense::config::{load_config, Config};
use riversense::pipeline::{DownloadError, SubmitError};
use riversense::store::{JobFilter, JobStatus};
use riversense::telemetry::{init_logging, LogLevel};
use riversense::App;

#[derive(Parser, Debug)]
#[command(name = "riversense", version, about = "GNSS raw log to RINEX conversion pipeline")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, global = true, env = "RIVERSENSE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run conversion workers until interrupted
    Worker {
        /// Override the configured number of workers
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Submit a GnssLogger file for conversion
    Submit {
        /// Raw measurement log (CSV text or JSON upload)
        file: PathBuf,
    },

    /// Show a job as JSON
    Status { id: i64 },

    /// List jobs, newest first
    List {
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: u64,
    },

    /// Send a failed job back to the queue
    Retry { id: i64 },

    /// Write a completed job's RINEX file
    Fetch {
        id: i64,

        /// Output path; defaults to the artifact's file name in the current directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(2);
            }
        },
        None => Config::default(),
    };

    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        config.logging.level
    };
    if let Err(e) = init_logging(level, config.logging.format) {
        eprintln!("Warning: logging disabled: {}", e);
    }

    if let Err(e) = run(cli.command, config) {
        error!("Command failed: {:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run(command: Command, mut config: Config) -> anyhow::Result<()> {
    if let Command::Worker {
        workers: Some(workers),
    } = command
    {
        if workers == 0 {
            bail!("--workers must be at least 1");
        }
        config.worker_count = workers;
    }

    let app = App::open(config).context("failed to open pipeline storage")?;

    match command {
        Command::Worker { .. } => run_workers(&app),
        Command::Submit { file } => submit(&app, &file),
        Command::Status { id } => {
            let job = app.service().status(id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Command::List { status, limit } => list(&app, status, limit),
        Command::Retry { id } => {
            let job = app.service().retry(id)?;
            println!("Job {} is {} again", job.id, job.status);
            Ok(())
        }
        Command::Fetch { id, output } => fetch(&app, id, output),
    }
}

fn run_workers(app: &App) -> anyhow::Result<()> {
    info!(
        "Writing artifacts to {} with {} workers",
        app.artifact_directory().display(),
        app.config.worker_count
    );

    let pool = app.start_workers()?;
    let shutdown = pool.shutdown_signal();
    ctrlc::set_handler(move || {
        info!("Interrupt received, finishing in-flight jobs...");
        shutdown.trigger();
    })
    .context("failed to install Ctrl-C handler")?;

    while !pool.is_shutdown() {
        if let Some(report) = pool.recv_report_timeout(Duration::from_millis(500)) {
            match (&report.outcome, &report.error) {
                (Some(outcome), _) => info!("Job {}: {:?}", report.job_id, outcome),
                (None, Some(err)) => error!("Job {}: {}", report.job_id, err),
                (None, None) => {}
            }
        }
    }

    pool.wait();
    Ok(())
}

fn submit(app: &App, file: &Path) -> anyhow::Result<()> {
    let payload =
        std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;

    match app.service().submit(&payload) {
        Ok(id) => {
            println!("{}", id);
            Ok(())
        }
        Err(SubmitError::QueueUnavailable { job_id, source }) => {
            bail!("job {} was recorded as failed, queue unavailable: {}", job_id, source)
        }
        Err(e) => Err(e.into()),
    }
}

fn list(app: &App, status: Option<String>, limit: u64) -> anyhow::Result<()> {
    if let Some(ref s) = status {
        if JobStatus::parse(s).is_none() {
            bail!("unknown status '{}'", s);
        }
    }

    let service = app.service();
    let jobs = service.list(&JobFilter {
        status,
        limit: Some(limit),
        offset: None,
    })?;

    for job in &jobs {
        let detail = match (job.status, &job.artifact_path, &job.failure_reason) {
            (JobStatus::Completed, Some(path), _) => path.display().to_string(),
            (JobStatus::Failed, _, Some(reason)) => reason.clone(),
            (JobStatus::Processing, _, _) if job.attempts > 0 => format!("retry {}", job.attempts),
            _ => String::new(),
        };
        println!(
            "{:>8}  {:<10}  {}  {}",
            job.id,
            job.status.as_str(),
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            detail
        );
    }

    let counts = service
        .counts()?
        .into_iter()
        .map(|(status, n)| format!("{}={}", status, n))
        .collect::<Vec<_>>()
        .join(" ");
    println!("{}", counts);
    Ok(())
}

fn fetch(app: &App, id: i64, output: Option<PathBuf>) -> anyhow::Result<()> {
    let download = match app.service().download(id) {
        Ok(download) => download,
        Err(DownloadError::NotReady { status, .. }) => {
            bail!("job {} is {}; no RINEX file yet", id, status)
        }
        Err(e) => return Err(e.into()),
    };

    let target = output.unwrap_or_else(|| PathBuf::from(&download.file_name));
    std::fs::write(&target, &download.bytes)
        .with_context(|| format!("failed to write {}", target.display()))?;
    println!("{}", target.display());
    Ok(())
}
