//! Presence Agent CLI
//!
//! Runs a day's tracking session and drives the leave workflow.

use anyhow::{bail, Context};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use presence_agent::{
    config::Config,
    core::{
        AttendanceFlusher, DailyRosterInitializer, LeaveAttendanceSynchronizer, LeaveRequest,
        LeaveStatus, LeaveWorkflow, PresenceTracker, RosterEntry, SyncReport, TrackerConfig,
    },
    session::{ClockMode, FlushWorker, SessionConfig, StopReason, TrackingSession},
    source::LineSource,
    stats::SessionStats,
    store::{InMemoryStore, RecordStore, SharedNotifier, SharedStore, StoreError},
    VERSION,
};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "presence-agent")]
#[command(version = VERSION)]
#[command(about = "Camera-driven attendance tracking agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track a day's attendance from a stream of sightings
    Start {
        /// JSON-lines sighting file (defaults to stdin)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Run against an in-memory store seeded with this roster (JSON array)
        #[arg(long)]
        roster: Option<PathBuf>,

        /// Record store base URL (overrides the config file)
        #[arg(long)]
        store_url: Option<String>,

        /// Day to track (defaults to today in the configured timezone)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Take the clock from sighting timestamps instead of the system clock
        #[arg(long)]
        event_time: bool,
    },

    /// Submit and decide leave requests
    Leave {
        #[command(subcommand)]
        action: LeaveCommand,
    },

    /// Show an employee's attendance record for a day
    Status {
        #[arg(long)]
        username: String,

        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Show configuration
    Config,
}

#[derive(Subcommand)]
enum LeaveCommand {
    /// Request leave for a date range
    Submit {
        #[arg(long)]
        employee: u64,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        reason: String,
    },
    /// Approve a pending request
    Approve { id: u64 },
    /// Reject a pending request
    Reject { id: u64 },
    /// Withdraw a pending request
    Withdraw {
        id: u64,
        #[arg(long)]
        employee: u64,
    },
    /// Re-apply a decided request to the attendance rows
    Resync { id: u64 },
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Start {
            input,
            roster,
            store_url,
            date,
            event_time,
        } => cmd_start(input, roster, store_url, date, event_time),
        Commands::Leave { action } => cmd_leave(action),
        Commands::Status { username, date } => cmd_status(&username, date),
        Commands::Config => {
            cmd_config();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config() -> Config {
    Config::load().unwrap_or_else(|e| {
        warn!(error = %e, "could not load config; using defaults");
        Config::default()
    })
}

fn today(config: &Config) -> anyhow::Result<NaiveDate> {
    let tz = config.tz()?;
    Ok(Utc::now().with_timezone(&tz).date_naive())
}

#[cfg(feature = "http-store")]
fn http_store(config: &Config) -> anyhow::Result<(SharedStore, SharedNotifier)> {
    let store = Arc::new(presence_agent::store::HttpRecordStore::new(
        config.store.clone(),
    )?);
    println!("Record store: {} (station {})", config.store.base_url, store.station_id());
    let notifier: SharedNotifier = store.clone();
    let store: SharedStore = store;
    Ok((store, notifier))
}

#[cfg(not(feature = "http-store"))]
fn http_store(_config: &Config) -> anyhow::Result<(SharedStore, SharedNotifier)> {
    bail!("built without the http-store feature; use --roster for an in-memory run")
}

fn read_roster(path: &Path) -> anyhow::Result<Vec<RosterEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading roster {}", path.display()))?;
    let entries: Vec<RosterEntry> = serde_json::from_str(&content)
        .with_context(|| format!("parsing roster {}", path.display()))?;
    Ok(entries)
}

fn cmd_start(
    input: Option<PathBuf>,
    roster: Option<PathBuf>,
    store_url: Option<String>,
    date: Option<NaiveDate>,
    event_time: bool,
) -> anyhow::Result<()> {
    println!("Presence Agent v{VERSION}");
    println!();

    let mut config = load_config();
    if let Some(url) = store_url {
        config.store.base_url = url;
    }
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    let date = match date {
        Some(date) => date,
        None => today(&config)?,
    };

    let memory = match &roster {
        Some(path) => Some(Arc::new(InMemoryStore::with_roster(read_roster(path)?))),
        None => None,
    };
    let store: SharedStore = match &memory {
        Some(memory) => {
            println!("Record store: in-memory (dry run)");
            memory.clone()
        }
        None => http_store(&config)?.0,
    };

    let runtime = Runtime::new().context("starting async runtime")?;
    let day = runtime
        .block_on(DailyRosterInitializer::new(store.clone(), config.retry.clone()).initialize(date))
        .context("initializing the day's roster")?;

    println!("Tracking {} employees on {date}", day.len());
    println!("  Timezone: {}", config.timezone);
    println!("  Late after: {}", config.late_cutoff);
    println!("  End of day: {}", config.end_of_day);
    println!(
        "  Checkpoint interval: {}s",
        config.checkpoint_interval.as_secs()
    );
    println!(
        "  Clock: {}",
        if event_time { "sighting timestamps" } else { "system" }
    );
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let tracker = PresenceTracker::new(TrackerConfig::from_config(&config)?, day);
    let stats = Arc::new(SessionStats::with_persistence(date, config.stats_path()));
    let worker = FlushWorker::spawn(
        AttendanceFlusher::new(store),
        config.retry.clone(),
        config.flush_queue_capacity,
    )
    .context("starting flush worker")?;

    let source = match &input {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("opening {}", path.display()))?;
            LineSource::spawn(BufReader::new(file), config.sighting_queue_capacity)?
        }
        None => LineSource::spawn(
            BufReader::new(std::io::stdin()),
            config.sighting_queue_capacity,
        )?,
    };

    let session_config = SessionConfig {
        clock: if event_time {
            ClockMode::Event
        } else {
            ClockMode::Wall
        },
        checkpoint_interval: chrono::Duration::from_std(config.checkpoint_interval)
            .unwrap_or_else(|_| chrono::Duration::minutes(5)),
        ..SessionConfig::default()
    };
    let session = TrackingSession::new(tracker, worker, stats.clone(), session_config);

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    let summary = session.run(source.receiver(), &running);
    let skipped = source.skipped();
    // Stdin may still be open after an interrupt; only wait for a finished reader.
    if input.is_some() && summary.reason == StopReason::SourceExhausted {
        source.join();
    }

    println!();
    println!("Session ended: {:?}", summary.reason);
    println!(
        "  Checked in: {} of {}",
        summary.checked_in, summary.employees
    );
    if skipped > 0 {
        println!("  Malformed sighting lines: {skipped}");
    }
    if !summary.lost.is_empty() {
        println!("  Not persisted: {:?}", summary.lost);
    }

    if let Some(memory) = memory {
        println!();
        println!("Attendance rows:");
        for record in memory.records() {
            println!(
                "  employee {} | {} | in {} | out {} | out of sight {}s | worked {}s",
                record.employee_id,
                record.status,
                record
                    .check_in_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string()),
                record
                    .check_out_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string()),
                record.out_of_sight_duration.num_seconds(),
                record
                    .working_hours
                    .map(|w| w.num_seconds())
                    .unwrap_or_default(),
            );
        }
    }

    // Final stats
    println!();
    println!("{}", stats.summary());

    if !summary.lost.is_empty() {
        bail!("{} attendance states were not persisted", summary.lost.len());
    }
    Ok(())
}

fn cmd_leave(action: LeaveCommand) -> anyhow::Result<()> {
    let config = load_config();
    let tz = config.tz()?;
    let (store, notifier) = http_store(&config)?;

    let sync = LeaveAttendanceSynchronizer::new(
        store.clone(),
        notifier,
        config.rejection_policy,
        config.retry.clone(),
    );
    let workflow = LeaveWorkflow::new(store, sync, tz, config.leave_same_day_cutoff);
    let runtime = Runtime::new().context("starting async runtime")?;

    match action {
        LeaveCommand::Submit {
            employee,
            start,
            end,
            reason,
        } => {
            let leave =
                runtime.block_on(workflow.submit(employee, start, end, &reason, Utc::now()))?;
            println!(
                "Leave request {} submitted: {} to {} ({})",
                leave.id, leave.start_date, leave.end_date, leave.status
            );
        }
        LeaveCommand::Approve { id } => decide(&runtime, &workflow, id, LeaveStatus::Approved)?,
        LeaveCommand::Reject { id } => decide(&runtime, &workflow, id, LeaveStatus::Rejected)?,
        LeaveCommand::Withdraw { id, employee } => {
            runtime.block_on(workflow.withdraw(id, employee))?;
            println!("Leave request {id} withdrawn.");
        }
        LeaveCommand::Resync { id } => {
            let (leave, report) = runtime.block_on(workflow.resync(id))?;
            print_sync(&leave, &report);
        }
    }
    Ok(())
}

fn decide(
    runtime: &Runtime,
    workflow: &LeaveWorkflow,
    id: u64,
    decision: LeaveStatus,
) -> anyhow::Result<()> {
    let (leave, report) = runtime.block_on(workflow.decide(id, decision))?;
    print_sync(&leave, &report);
    Ok(())
}

fn print_sync(leave: &LeaveRequest, report: &SyncReport) {
    println!(
        "Leave request {} is {} ({} to {})",
        leave.id, leave.status, leave.start_date, leave.end_date
    );
    println!(
        "  Attendance rows: {} created, {} deleted, {} untouched",
        report.created, report.deleted, report.skipped
    );
}

fn cmd_status(username: &str, date: Option<NaiveDate>) -> anyhow::Result<()> {
    let config = load_config();
    let date = match date {
        Some(date) => date,
        None => today(&config)?,
    };
    let (store, _) = http_store(&config)?;
    let runtime = Runtime::new().context("starting async runtime")?;

    match runtime.block_on(store.lookup_record(username, date)) {
        Ok(handle) => {
            println!("Attendance for {username} on {date}");
            println!("  Record: {}", handle.id);
            if let Some(status) = handle.status {
                println!("  Status: {status}");
            }
            println!("  Checked in: {}", if handle.is_first { "no" } else { "yes" });
        }
        Err(StoreError::NotFound(_)) => {
            println!("No attendance record for {username} on {date}.");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn cmd_config() {
    let config = load_config();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();

    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Error serializing config: {e}"),
    }
}

fn ctrlc_handler(running: Arc<AtomicBool>) {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .unwrap_or_else(|e| warn!(error = %e, "could not install Ctrl+C handler"));
}
