//! lamco-portal-doctor - Wayland screen-sharing diagnostics
//!
//! Entry point for the doctor binary.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use lamco_portal_doctor::{
    config::Config,
    facts::{self, FactSnapshot},
    fixes::FixEngine,
    probe,
    report::{self, UnitLog},
    rules::{self, Finding, OverallStatus},
};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Journal lines collected per unit for reports
const JOURNAL_LINES: u32 = 50;

/// Command-line arguments for lamco-portal-doctor
#[derive(Parser, Debug)]
#[command(name = "lamco-portal-doctor")]
#[command(version, about = "Diagnose and repair Wayland screen-sharing portals", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run the diagnostic rules and exit (the default action)
    ///
    /// Exits with status 1 when any critical finding is present, so the
    /// check works in scripts and health probes.
    #[arg(long)]
    pub check: bool,

    /// Print a full, sanitized markdown report on stdout
    ///
    /// The report is safe to attach to public bug trackers: home paths,
    /// the username, the hostname, and long hex tokens are scrubbed.
    #[arg(long)]
    pub report: bool,

    /// Drive a real ScreenCast negotiation end to end and exit
    ///
    /// Behaves exactly like a screen-sharing application: a portal
    /// permission dialog may appear. The capture session is closed again
    /// immediately after the stream is granted.
    #[arg(long)]
    pub test_screencast: bool,

    /// Apply the fix for one finding (ids come from --check)
    #[arg(long, value_name = "FINDING_ID")]
    pub fix: Option<String>,

    /// Skip the confirmation prompt for --fix and --undo
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Undo a previously applied fix (the latest one when no id is given)
    #[arg(long, value_name = "BACKUP_ID", num_args = 0..=1, default_missing_value = "latest")]
    pub undo: Option<String>,

    /// List recorded fix backups and exit
    #[arg(long)]
    pub list_backups: bool,

    /// Output format for --check and --report (text|json)
    #[arg(long, default_value = "text")]
    pub format: String,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Write logs to a file (in addition to stderr)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (needed for logging settings)
    let config = Config::load_or_default(args.config.as_deref())?;

    init_logging(&args, &config.logging)?;

    info!("════════════════════════════════════════════════════════");
    info!("  lamco-portal-doctor v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "  Built: {} {}",
        option_env!("BUILD_DATE").unwrap_or("unknown"),
        option_env!("BUILD_TIME").unwrap_or("")
    );
    info!("  Commit: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    info!("════════════════════════════════════════════════════════");

    if args.check {
        return run_check(&args.format).await;
    }

    if args.list_backups {
        return list_backups(&config);
    }

    if let Some(id) = &args.undo {
        return undo_fix(&config, id, args.yes).await;
    }

    if let Some(id) = &args.fix {
        return apply_fix(&config, id, args.yes).await;
    }

    if args.report {
        return run_report(&args.format).await;
    }

    if args.test_screencast {
        return run_screencast_test(&config).await;
    }

    run_check(&args.format).await
}

/// Collect facts, evaluate the rules, print the result
async fn run_check(format: &str) -> Result<()> {
    let snapshot = facts::collect().await;
    let findings = rules::evaluate(&snapshot);

    if format == "json" {
        println!("{}", check_json(&snapshot, &findings)?);
    } else {
        print_check_text(&snapshot, &findings);
    }

    // Scripts rely on the exit code to distinguish broken from degraded
    if OverallStatus::from_findings(&findings) == OverallStatus::Broken {
        std::process::exit(1);
    }
    Ok(())
}

fn check_json(snapshot: &FactSnapshot, findings: &[Finding]) -> Result<String> {
    let status = OverallStatus::from_findings(findings);
    serde_json::to_string_pretty(&serde_json::json!({
        "status": status.name(),
        "findings": findings,
        "snapshot": snapshot,
    }))
    .context("Failed to serialize check result")
}

fn print_check_text(snapshot: &FactSnapshot, findings: &[Finding]) {
    println!("╔════════════════════════════════════════════════════════╗");
    println!("║         Screen Sharing Health Check                    ║");
    println!("╚════════════════════════════════════════════════════════╝");
    println!();

    println!(
        "Session: {} on {}",
        snapshot.session_type, snapshot.desktop
    );
    println!("Compositor: {}", snapshot.compositor.label());
    println!(
        "Portal frontend: {}",
        if snapshot.portal_frontend_owned {
            "running"
        } else {
            "not running"
        }
    );
    let backends: Vec<String> = snapshot
        .backends
        .iter()
        .map(|b| {
            format!(
                "{} ({})",
                b.name,
                if b.running { "running" } else { "installed" }
            )
        })
        .collect();
    println!(
        "Backends: {}",
        if backends.is_empty() {
            "none found".to_string()
        } else {
            backends.join(", ")
        }
    );
    println!("PipeWire: {}", snapshot.pipewire.summary());
    println!("WirePlumber: {}", snapshot.wireplumber.summary());
    println!();

    if findings.is_empty() {
        println!("✅ No problems found");
    } else {
        println!("Findings:");
        for finding in findings {
            println!(
                "  {} [{}] {}",
                finding.severity.emoji(),
                finding.id,
                finding.title
            );
            println!("     {}", finding.explanation);
            if let Some(fix) = &finding.fix {
                println!(
                    "     Fix available: {} (--fix {})",
                    fix.describe(),
                    finding.id
                );
            }
        }
        println!();
        let status = OverallStatus::from_findings(findings);
        println!("Overall: {} {}", status.emoji(), status);
    }
}

/// Assemble and print the full diagnostic report
async fn run_report(format: &str) -> Result<()> {
    let snapshot = facts::collect().await;
    let findings = rules::evaluate(&snapshot);

    if format == "json" {
        println!("{}", check_json(&snapshot, &findings)?);
        return Ok(());
    }

    let logs = gather_logs(&snapshot);
    let report = report::assemble(&snapshot, &findings, None, &logs);
    println!("{report}");
    Ok(())
}

/// Journal excerpts for failed units, plus the frontend for context
fn gather_logs(snapshot: &FactSnapshot) -> Vec<UnitLog> {
    let mut units = snapshot.failed_units();
    if !units.contains(&facts::PORTAL_FRONTEND_UNIT) {
        units.push(facts::PORTAL_FRONTEND_UNIT);
    }

    units
        .into_iter()
        .filter_map(|unit| {
            facts::probes::journal_excerpt(unit, JOURNAL_LINES).map(|excerpt| UnitLog {
                unit: unit.to_string(),
                excerpt,
            })
        })
        .collect()
}

/// Drive a live portal negotiation like a real screen-sharing app
async fn run_screencast_test(config: &Config) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════╗");
    println!("║         Live Screencast Probe                          ║");
    println!("╚════════════════════════════════════════════════════════╝");
    println!();
    println!("This drives a real ScreenCast session through the portal,");
    println!("exactly like a screen-sharing app would. A permission dialog");
    println!("may appear; the session is closed again immediately.");
    println!("Press Ctrl-C to cancel.");
    println!();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received - cancelling probe");
            let _ = cancel_tx.send(true);
        }
    });

    let outcome = probe::run_live(config.probe_timeouts(), cancel_rx).await?;

    println!("Result: {}", outcome.summary());
    if outcome.succeeded() {
        println!("✅ The portal granted a PipeWire stream; screen sharing works");
        Ok(())
    } else {
        println!("❌ The portal did not deliver a stream; run --check for diagnosis");
        std::process::exit(1);
    }
}

/// Preview, confirm, and apply the fix for one finding
async fn apply_fix(config: &Config, id: &str, assume_yes: bool) -> Result<()> {
    let snapshot = facts::collect().await;
    let findings = rules::evaluate(&snapshot);
    let Some(finding) = findings.iter().find(|f| f.id == id) else {
        bail!("No current finding with id '{id}'; run --check to list findings");
    };

    let engine = FixEngine::with_default_paths(config.fixes.backup_dir.clone())?;
    let plan = engine.preview(finding)?;

    println!("Fix for [{}]: {}", finding.id, plan.description);
    if let Some(diff) = &plan.diff {
        println!();
        println!("{diff}");
    }
    if plan.reversible {
        println!("A backup will be recorded; --undo restores the previous state.");
    } else {
        println!("This restarts services; there is nothing to undo afterwards.");
    }
    println!();

    if !assume_yes && !confirm("Apply this fix?")? {
        println!("Aborted; nothing was changed.");
        return Ok(());
    }

    let (outcome, snapshot) = engine.apply_and_recheck(&plan).await?;
    if let Some(backup) = &outcome.backup {
        println!("✅ Applied; backup {} recorded", backup.id);
    }
    for unit in &outcome.restarted {
        println!("✅ Restarted {unit}");
    }

    let remaining = rules::evaluate(&snapshot);
    if remaining.iter().any(|f| f.id == id) {
        println!("⚠️  The finding is still present; run --report for details");
    } else {
        println!("✅ The finding is resolved");
    }
    Ok(())
}

/// Restore the state captured before an applied fix
async fn undo_fix(config: &Config, id: &str, assume_yes: bool) -> Result<()> {
    let engine = FixEngine::with_default_paths(config.fixes.backup_dir.clone())?;
    let record = if id == "latest" {
        engine.store().latest_applied()?
    } else {
        engine.store().find(id)?
    };
    let Some(record) = record else {
        bail!("No matching applied backup; run --list-backups to see what exists");
    };

    println!(
        "Undo backup {} from {} (fix '{}', target {})",
        record.id,
        record.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        record.fix_id,
        record.target_path.display()
    );
    if !assume_yes && !confirm("Restore the previous state?")? {
        println!("Aborted; nothing was changed.");
        return Ok(());
    }

    engine.undo(&record).await?;
    println!("✅ Restored {}", record.target_path.display());
    Ok(())
}

/// List recorded backups, newest first
fn list_backups(config: &Config) -> Result<()> {
    let engine = FixEngine::with_default_paths(config.fixes.backup_dir.clone())?;
    let records = engine.store().list()?;
    if records.is_empty() {
        println!("No backups recorded.");
        return Ok(());
    }

    println!("{} backup(s), newest first:", records.len());
    for record in records {
        println!(
            "  {}  {}  fix={}  applied={}  target={}",
            record.id,
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.fix_id,
            record.applied,
            record.target_path.display()
        );
    }
    Ok(())
}

/// Ask for confirmation on stdin; default is no
fn confirm(prompt: &str) -> Result<bool> {
    use std::io::{self, Write as _};

    print!("{prompt} [y/N] ");
    io::stdout().flush().context("Failed to flush stdout")?;

    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("Failed to read confirmation")?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes" | "Yes" | "YES"))
}

fn init_logging(args: &Args, logging: &lamco_portal_doctor::config::LoggingConfig) -> Result<()> {
    use std::fs::File;

    // CLI -v flag overrides config
    let log_level = if args.verbose > 0 {
        match args.verbose {
            1 => "debug",
            _ => "trace",
        }
    } else {
        match logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => logging.level.as_str(),
            _ => "info", // Invalid value, fallback to info
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // zbus at warn: its debug output floods every portal round trip
        tracing_subscriber::EnvFilter::new(format!(
            "lamco_portal_doctor={log_level},zbus=warn,warn"
        ))
    });

    // stdout carries check output and reports; logs stay on stderr
    let log_file = log_file_path(args, logging).and_then(|path| match File::create(&path) {
        Ok(f) => Some((f, path)),
        Err(e) => {
            eprintln!(
                "Warning: Cannot create log file {}: {e}; logging to stderr only",
                path.display()
            );
            None
        }
    });

    if let Some((file, path)) = log_file {
        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(std::io::stderr),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(std::io::stderr),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .pretty()
                            .with_writer(std::io::stderr),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
        }
        info!("Logging to file: {}", path.display());
    } else {
        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(std::io::stderr),
                    )
                    .init();
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(std::io::stderr),
                    )
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .pretty()
                            .with_writer(std::io::stderr),
                    )
                    .init();
            }
        }
    }

    Ok(())
}

/// Resolve the log file: CLI flag first, then the configured directory
fn log_file_path(
    args: &Args,
    logging: &lamco_portal_doctor::config::LoggingConfig,
) -> Option<PathBuf> {
    if let Some(path) = &args.log_file {
        return Some(path.clone());
    }

    let dir = logging.log_dir.clone()?;
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("Warning: Cannot create log directory {}: {e}", dir.display());
        return None;
    }
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    Some(dir.join(format!("lamco-portal-doctor-{timestamp}.log")))
}
