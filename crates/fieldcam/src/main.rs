//! `fieldcam` - CLI for the fieldcam capture pipeline
//!
//! This binary runs the pipeline in the foreground and provides commands for
//! inspecting and maintaining the image store.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fieldcam::cli::{Cli, Command, ConfigCommand, EvictCommand, SessionsCommand};
use fieldcam::storage::{EvictionReport, StorageManager};
use fieldcam::{init_logging, Config, Pipeline};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone()).context("loading configuration")?;

    // Execute the command
    match cli.command {
        Command::Run => handle_run(config).await,
        Command::Status(cmd) => handle_status(&config, cmd.json),
        Command::Sessions(cmd) => handle_sessions(&config, &cmd),
        Command::Evict(cmd) => handle_evict(&config, &cmd),
        Command::Config(cmd) => handle_config(&config, cmd, cli.config),
    }
}

async fn handle_run(config: Config) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;
    info!(platform = platform_name(), "Starting fieldcam");

    let cancel = CancellationToken::new();
    tokio::spawn(forward_shutdown_signal(cancel.clone()));

    let stats = Pipeline::builder(config)
        .build()
        .run(cancel)
        .await
        .context("pipeline failed")?;
    info!(
        persisted = stats.frames_persisted,
        dropped = stats.dropped_frames,
        "fieldcam stopped"
    );
    Ok(())
}

/// Cancel `cancel` on SIGINT or SIGTERM.
async fn forward_shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                    _ = term.recv() => info!("Terminated"),
                }
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    cancel.cancel();
}

fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let storage = StorageManager::from_config(config).context("opening storage")?;
    let health = storage.check_health();
    let sessions = storage.list_sessions()?;
    let catalog = storage.catalog_stats()?;
    let latest = storage.latest_image()?;

    if json {
        let status = serde_json::json!({
            "platform": platform_name(),
            "storage_root": storage.root(),
            "storage": health,
            "sessions": sessions.len(),
            "catalog": catalog,
            "latest": latest,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("fieldcam status");
    println!("---------------");
    println!("Platform:      {}", platform_name());
    println!("Storage root:  {}", storage.root().display());
    println!("Storage:       {} ({})", health.status, health.message);
    println!("Free space:    {}", format_bytes(health.free_space));
    println!("Used:          {:.1}%", health.used_percentage);
    println!("Sessions:      {}", sessions.len());
    match catalog {
        Some(stats) => {
            println!("Images:        {}", stats.total_images);
            println!("  REAL:        {}", stats.real_fixes);
            println!("  FALLBACK:    {}", stats.fallback_fixes);
            if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
                println!("Range:         {oldest} .. {newest}");
            }
        }
        None => println!("Catalog:       unavailable"),
    }
    if let Some(latest) = latest {
        println!(
            "Latest:        #{} at {} ({}, {})",
            latest.sequence, latest.captured_at, latest.fix, latest.file_name
        );
    }
    Ok(())
}

fn handle_sessions(config: &Config, cmd: &SessionsCommand) -> anyhow::Result<()> {
    let storage = StorageManager::from_config(config).context("opening storage")?;
    let mut sessions = storage.list_sessions()?;
    cmd.apply_limit(&mut sessions);

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No sessions in {}", storage.root().display());
        return Ok(());
    }
    println!(
        "{:<16} {:>8} {:>10} {:>12}  ends",
        "session", "images", "catalogued", "size"
    );
    for session in &sessions {
        let catalogued = session
            .catalogued
            .map_or_else(|| "-".to_string(), |n| n.to_string());
        println!(
            "{:<16} {:>8} {:>10} {:>12}  {}",
            session.name,
            session.images,
            catalogued,
            format_bytes(session.bytes),
            session.end.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn handle_evict(config: &Config, cmd: &EvictCommand) -> anyhow::Result<()> {
    let storage = StorageManager::from_config(config).context("opening storage")?;
    let report = if cmd.dry_run {
        storage.plan_eviction(Utc::now())?
    } else {
        storage.evict(Utc::now())?
    };
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_eviction(&report);
    }
    Ok(())
}

fn print_eviction(report: &EvictionReport) {
    let verb = if report.dry_run { "Would remove" } else { "Removed" };
    if report.evicted.is_empty() {
        println!("Nothing to evict.");
    }
    for session in &report.evicted {
        println!(
            "{verb} {} ({}, {:?})",
            session.name,
            format_bytes(session.bytes),
            session.reason
        );
    }
    if let (Some(before), Some(after)) = (report.free_before, report.free_after) {
        println!("Free space: {} -> {}", format_bytes(before), format_bytes(after));
    }
    if report.space_pressure && !report.recovered {
        println!("Warning: no eligible sessions left; free space is still below target.");
    }
}

fn handle_config(
    config: &Config,
    cmd: ConfigCommand,
    config_path: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("{}", render_sections(config)?);
            }
        }
        ConfigCommand::Path => {
            let path = config_path.unwrap_or_else(Config::default_config_path);
            println!("{}", path.display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.or(config_path).unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)).and_then(|c| c.validate()) {
                Ok(()) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}

/// Render the configuration section by section.
fn render_sections(config: &Config) -> anyhow::Result<String> {
    use std::fmt::Write;

    let value = serde_json::to_value(config)?;
    let mut out = String::new();
    if let Some(sections) = value.as_object() {
        for (section, fields) in sections {
            writeln!(out, "[{section}]")?;
            if let Some(fields) = fields.as_object() {
                for (key, value) in fields {
                    writeln!(out, "  {key:<28} {value}")?;
                }
            }
            out.push('\n');
        }
    }
    Ok(out.trim_end().to_string())
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(target_os = "linux")]
fn platform_name() -> &'static str {
    fieldcam_linux::platform_name()
}

#[cfg(not(target_os = "linux"))]
fn platform_name() -> &'static str {
    std::env::consts::OS
}
