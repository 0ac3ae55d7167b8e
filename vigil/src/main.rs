//! vigil - periodic condition monitor and escalation engine
//!
//! Evaluates watched projects and milestones, persists each finding at most once
//! per recipient and day, and escalates overdue milestones.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/vigil/vigil.db (~/.local/share/vigil/vigil.db)
//! - Logs: $XDG_STATE_HOME/vigil/vigil.log (~/.local/state/vigil/vigil.log)
//! - Config: $XDG_CONFIG_HOME/vigil/config.toml (~/.config/vigil/config.toml)

mod process_lock;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use process_lock::{acquire_daemon_guard, acquire_pass_guard, try_acquire_pass_guard};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vigil_core::rules::validate_rule;
use vigil_core::store::{MilestoneRepository, WatchedEntityRepository};
use vigil_core::{
    CancelToken, Config, Database, ImportBundle, MonitorEngine, PassReport, PassStage, Scheduler,
};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Condition monitoring and escalation engine")]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one evaluation pass now
    Run {
        /// Evaluate as of this RFC 3339 instant instead of the current time
        #[arg(long)]
        at: Option<String>,

        /// Print the pass report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run passes on the configured schedule until interrupted
    Daemon,

    /// Show database, schedule and collaborator status
    Status,

    /// Load projects, milestones, team members and rules from a JSON file
    Import {
        /// Path to the JSON bundle
        file: PathBuf,
    },

    /// Show the escalation history of a milestone
    History {
        milestone_id: String,
    },

    /// Show escalation statistics for a project
    Stats {
        project_id: String,
    },

    /// List escalation rules and whether they pass validation
    Rules,

    /// List persisted notifications, newest first
    Notifications {
        /// Only show notifications for this recipient
        #[arg(long)]
        recipient: Option<String>,

        /// Maximum number of notifications to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        vigil_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("vigil starting");

    let db_path = Config::database_path();

    match cli.command {
        Command::Run { at, json } => run_once(&config, &db_path, at.as_deref(), json, cli.verbose),
        Command::Daemon => run_daemon(&config, &db_path),
        Command::Status => show_status(&config, &db_path),
        Command::Import { file } => import_bundle(&config, &db_path, &file),
        Command::History { milestone_id } => show_history(&config, &db_path, &milestone_id),
        Command::Stats { project_id } => show_stats(&config, &db_path, &project_id),
        Command::Rules => show_rules(&config, &db_path, cli.verbose),
        Command::Notifications { recipient, limit } => {
            show_notifications(&config, &db_path, recipient.as_deref(), limit)
        }
    }
}

fn open_database(config: &Config, db_path: &Path) -> Result<Database> {
    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open_with_timeout(
        db_path,
        Duration::from_millis(config.engine.store_timeout_ms),
    )
    .context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    Ok(db)
}

fn build_engine(config: &Config, db_path: &Path) -> Result<MonitorEngine<Database>> {
    let db = open_database(config, db_path)?;
    MonitorEngine::from_config(Arc::new(db), config).context("failed to build engine")
}

fn parse_instant(value: Option<&str>) -> Result<DateTime<Utc>> {
    match value {
        None => Ok(Utc::now()),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .with_context(|| format!("invalid --at instant: {}", s)),
    }
}

// ============================================
// run
// ============================================

/// Run a single pass with a progress bar
fn run_once(
    config: &Config,
    db_path: &Path,
    at: Option<&str>,
    json: bool,
    verbose: u8,
) -> Result<()> {
    let now = parse_instant(at)?;
    let _pass_guard = acquire_pass_guard(db_path).context("failed to acquire process lock")?;
    let engine = build_engine(config, db_path)?;

    // Ctrl+C cancels between items; already-written records stay valid
    let cancel = CancelToken::new();
    let c = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling pass...");
        c.cancel();
    })
    .context("failed to set Ctrl+C handler")?;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let report = engine.run_pass_with_progress(now, &cancel, |stage, done, total| {
        if done == 1 {
            pb.set_length(total as u64);
        }
        pb.set_position(done as u64);
        pb.set_message(match stage {
            PassStage::Entities => "projects",
            PassStage::Upcoming => "upcoming milestones",
            PassStage::Milestones => "overdue milestones",
        });
    });
    pb.finish_and_clear();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to encode report")?
        );
    } else {
        print_report(&report, verbose);
    }

    if let Some(error) = &report.fatal_error {
        bail!("evaluation pass aborted: {}", error);
    }
    Ok(())
}

fn print_report(report: &PassReport, verbose: u8) {
    println!("Pass complete:");
    println!("  Created:      {}", report.created);
    println!("  Skipped:      {}", report.skipped);
    println!("  Failed:       {}", report.failed);
    println!(
        "  Escalations:  {} ({} in cool-down)",
        report.escalations, report.escalations_skipped
    );
    println!(
        "  Notices:      {} sent, {} already sent today",
        report.escalation_notices, report.escalation_notices_skipped
    );
    println!(
        "  Actions:      {} run, {} failed",
        report.actions_run, report.actions_failed
    );

    if verbose >= 1 {
        println!("  Undelivered:  {}", report.delivery_failures);
        println!("  Rejected rules: {}", report.rules_rejected);
        println!("  Duration:     {}ms", report.duration_ms);
    }
    if report.cancelled {
        println!("  (cancelled before completion)");
    }
}

// ============================================
// daemon
// ============================================

/// Run scheduled passes until Ctrl+C
fn run_daemon(config: &Config, db_path: &Path) -> Result<()> {
    let _daemon_guard = acquire_daemon_guard(db_path)?;
    let engine = Arc::new(build_engine(config, db_path)?);

    let running = Arc::new(AtomicBool::new(true));
    let cancel = CancelToken::new();
    {
        let r = running.clone();
        let c = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nShutting down...");
            r.store(false, Ordering::SeqCst);
            c.cancel();
        })
        .context("failed to set Ctrl+C handler")?;
    }

    let mut scheduler = Scheduler::new(&config.scheduler).context("invalid scheduler config")?;
    let lock_path = db_path.to_path_buf();
    let job_cancel = cancel.clone();
    scheduler
        .start(move |at| {
            let _pass_guard = match try_acquire_pass_guard(&lock_path) {
                Ok(Some(guard)) => guard,
                Ok(None) => {
                    tracing::warn!("Another pass is running; skipping scheduled run");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to acquire pass lock");
                    return;
                }
            };

            let report = engine.run_pass(at, &job_cancel);
            let timestamp = chrono::Local::now().format("%H:%M:%S");
            match &report.fatal_error {
                None => println!(
                    "[{}] Pass: {} created, {} skipped, {} failed, {} escalations",
                    timestamp, report.created, report.skipped, report.failed, report.escalations
                ),
                Some(error) => println!("[{}] Pass aborted: {}", timestamp, error),
            }
        })
        .context("failed to start scheduler")?;

    match scheduler.status().next_run {
        Some(next) => println!(
            "Daemon running (cron \"{}\"). Next run: {}. Press Ctrl+C to stop.",
            config.scheduler.cron,
            next.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M")
        ),
        None => println!("Daemon running with no upcoming scheduled runs."),
    }

    while running.load(Ordering::SeqCst) && scheduler.status().running {
        thread::sleep(Duration::from_millis(200));
    }

    scheduler.stop().context("failed to stop scheduler")?;
    let status = scheduler.status();
    println!("Daemon stopped after {} run(s).", status.runs);
    tracing::info!(runs = status.runs, "vigil daemon stopped");

    Ok(())
}

// ============================================
// import and queries
// ============================================

fn import_bundle(config: &Config, db_path: &Path, file: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let bundle: ImportBundle = serde_json::from_str(&contents)
        .with_context(|| format!("invalid import bundle: {}", file.display()))?;

    let _pass_guard = acquire_pass_guard(db_path).context("failed to acquire process lock")?;
    let db = open_database(config, db_path)?;
    let summary = db.import(&bundle).context("import failed")?;

    println!("Import complete:");
    println!("  Projects:     {}", summary.projects);
    println!("  Milestones:   {}", summary.milestones);
    println!("  Team members: {}", summary.team_members);
    println!("  Rules:        {}", summary.rules);
    Ok(())
}

fn show_status(config: &Config, db_path: &Path) -> Result<()> {
    let db = open_database(config, db_path)?;
    let now = Utc::now();

    let schema_version = vigil_core::db::schema::get_schema_version(&db.connection())?;
    let active = db.list_active().context("failed to list projects")?.len();
    let overdue = db.list_overdue(now).context("failed to list milestones")?.len();
    let notifications = db.count_notifications()?;
    let rules = db.list_rules()?.len();

    println!("Database: {} (schema v{})", db_path.display(), schema_version);
    println!("Config:   {}", Config::config_path().display());
    println!("Logs:     {}", Config::log_path().display());
    println!();
    println!("  Active projects:     {}", active);
    println!("  Overdue milestones:  {}", overdue);
    println!("  Escalation rules:    {}", rules);
    println!("  Notifications:       {}", notifications);
    println!();
    println!("  Sink:                {:?}", config.sink.kind);
    println!("  Action backend:      {:?}", config.actions.backend);
    println!("  Calendar zone:       {}", config.engine.calendar_zone()?);

    let scheduler = Scheduler::new(&config.scheduler)?;
    match scheduler.next_after(now) {
        Some(next) => println!(
            "  Next scheduled run:  {} (cron \"{}\")",
            next.to_rfc3339(),
            config.scheduler.cron
        ),
        None => println!("  Next scheduled run:  none"),
    }
    Ok(())
}

fn show_history(config: &Config, db_path: &Path, milestone_id: &str) -> Result<()> {
    let db = open_database(config, db_path)?;
    let Some(milestone) = db.get_milestone(milestone_id)? else {
        bail!("milestone not found: {}", milestone_id);
    };

    let history = db.list_escalation_history(milestone_id)?;
    println!(
        "Milestone {} ({}), due {}",
        milestone.name,
        milestone.id,
        milestone.due_date.format("%Y-%m-%d")
    );
    if history.is_empty() {
        println!("  No escalations recorded.");
        return Ok(());
    }
    for entry in &history {
        println!(
            "  {}  {:<9} rule={} days_overdue={}",
            entry.created_at.format("%Y-%m-%d %H:%M"),
            entry.level.as_str(),
            entry.rule_id,
            entry.days_overdue
        );
    }

    let actions = db.list_action_log(milestone_id)?;
    if !actions.is_empty() {
        println!("\nActions:");
        for action in &actions {
            let outcome = match (&action.error, &action.result) {
                (Some(error), _) => format!("failed: {}", error),
                (None, Some(result)) => result.to_string(),
                (None, None) => "ok".to_string(),
            };
            println!(
                "  {}  {:<24} {}",
                action.executed_at.format("%Y-%m-%d %H:%M"),
                action.action,
                outcome
            );
        }
    }
    Ok(())
}

fn show_stats(config: &Config, db_path: &Path, project_id: &str) -> Result<()> {
    let db = open_database(config, db_path)?;
    let stats = db.escalation_stats(project_id, Utc::now())?;

    println!("Project {}:", project_id);
    println!("  Overdue milestones:          {}", stats.overdue_count);
    println!("  Escalations (last 30 days):  {}", stats.recent_escalations);
    for (level, count) in &stats.by_level {
        println!("    {:<14} {}", level.label(), count);
    }
    Ok(())
}

fn show_rules(config: &Config, db_path: &Path, verbose: u8) -> Result<()> {
    let db = open_database(config, db_path)?;
    let rules = db.list_rules()?;
    if rules.is_empty() {
        println!("No escalation rules.");
        return Ok(());
    }

    for rule in &rules {
        let state = match (rule.is_active, validate_rule(rule)) {
            (false, _) => "inactive".to_string(),
            (true, Ok(_)) => "active".to_string(),
            (true, Err(e)) => format!("rejected: {}", e),
        };
        println!("{} [{}] project={} ({})", rule.id, rule.name, rule.project_id, state);

        if verbose >= 1 {
            for level in &rule.escalation_levels {
                println!(
                    "    {:<9} after {} day(s)",
                    level.level.as_str(),
                    level.days_overdue
                );
            }
            for action in &rule.actions {
                println!("    action: {}", action.action_type);
            }
        }
    }
    Ok(())
}

fn show_notifications(
    config: &Config,
    db_path: &Path,
    recipient: Option<&str>,
    limit: usize,
) -> Result<()> {
    let db = open_database(config, db_path)?;
    let records = db.list_notifications(recipient, limit)?;
    if records.is_empty() {
        println!("No notifications.");
        return Ok(());
    }
    for record in &records {
        println!(
            "{}  {:<8} {:<20} {:<10} {}",
            record.created_at.format("%Y-%m-%d %H:%M"),
            record.priority.as_str(),
            record.check_type,
            record.recipient_id,
            record.title
        );
    }
    Ok(())
}
