mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use serde_json::json;
use std::io::IsTerminal;
use std::path::Path;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, ConfigCommands};
use marzban_backup::core::schedule::{cron_expression, job_line};
use marzban_backup::core::{
    find_database_container, BackupSequencer, ComposeController, Crontab, DockerExecAdapter,
    DockerManager, EngineConfig, Error, RestoreSequencer, RunLock, RunOutcome, StateStore,
    TelegramUploader,
};
use marzban_backup::utils::*;

const EXIT_FAILED: u8 = 1;
const EXIT_NOT_CONFIGURED: u8 = 3;
const EXIT_LOCKED: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths = match AppPaths::resolve(cli.config.as_deref()) {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            return ExitCode::from(EXIT_FAILED);
        }
    };

    let config = match EngineConfig::load(&paths.config_file) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(cli.verbose, &paths.log_file);
            tracing::error!("{:#}", e);
            return ExitCode::from(EXIT_NOT_CONFIGURED);
        }
    };

    let log_file = config
        .installation
        .log_file
        .clone()
        .unwrap_or_else(|| paths.log_file.clone());
    init_tracing(cli.verbose, &log_file);

    let json = cli.json;
    match run(cli, paths, config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            if json {
                println!("{}", json!({ "success": false, "message": format!("{:#}", e) }));
            }
            ExitCode::from(EXIT_FAILED)
        }
    }
}

/// stderr plus a size-rotated, uncolored log file
fn init_tracing(verbose: u8, log_file: &Path) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = if verbose == 0 {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    } else {
        EnvFilter::new(level)
    };

    let file_layer = rotating_log(log_file, LOG_MAX_BYTES, LOG_KEEP_FILES)
        .map_err(|e| eprintln!("Cannot open log file {}: {}", log_file.display(), e))
        .ok()
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal())
                .with_target(false),
        )
        .with(file_layer)
        .init();
}

async fn run(cli: Cli, paths: AppPaths, config: EngineConfig) -> Result<ExitCode> {
    match cli.command {
        Commands::RunBackup { no_upload } => handle_backup(&paths, &config, !no_upload, cli.json).await,
        Commands::DoRestore { archive } => handle_restore(&paths, &config, &archive, cli.json).await,
        Commands::DoAutoBackupSetup { interval, disable } => {
            handle_auto_backup_setup(&paths, config, interval, disable, cli.json).await
        }
        Commands::GetDbType => handle_get_db_type(&config).await,
        Commands::Status => handle_status(&paths, &config, cli.json).await,
        Commands::Config { command } => handle_config(command, &config, cli.json),
    }
}

/// Fail early with "not configured" when the config has errors
fn check_config(config: &EngineConfig, json: bool) -> Option<ExitCode> {
    match config.ensure_valid() {
        Ok(()) => None,
        Err(e) => {
            report_error(&format!("{:#}", e), json);
            Some(ExitCode::from(EXIT_NOT_CONFIGURED))
        }
    }
}

fn acquire_lock(paths: &AppPaths, json: bool) -> Result<std::result::Result<RunLock, ExitCode>> {
    match RunLock::acquire(&paths.lock_file) {
        Ok(lock) => Ok(Ok(lock)),
        Err(Error::Locked(pid)) => {
            report_error(&Error::Locked(pid).to_string(), json);
            Ok(Err(ExitCode::from(EXIT_LOCKED)))
        }
        Err(e) => Err(e).context("Failed to take the run lock"),
    }
}

fn report_error(message: &str, json: bool) {
    if json {
        println!("{}", json!({ "success": false, "message": message }));
    } else {
        eprintln!("{} {}", "Error:".red().bold(), message);
    }
}

fn print_outcome(outcome: &RunOutcome, json: bool) -> Result<ExitCode> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        println!();
        if outcome.success {
            println!("{} {}", "✓".green().bold(), outcome.message.green());
        } else {
            println!("{} {}", "✗".red().bold(), outcome.message.red());
        }
        for warning in &outcome.warnings {
            println!("  {} {}", "!".yellow(), warning.yellow());
        }
        let duration = std::time::Duration::from_secs(outcome.duration().as_secs());
        println!("  Duration: {}", humantime::format_duration(duration));
    }

    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILED)
    })
}

async fn backup(paths: &AppPaths, config: &EngineConfig, upload: bool) -> Result<RunOutcome> {
    let runtime = Arc::new(DockerManager::new().context("Cannot connect to the Docker daemon")?);
    let services = Arc::new(ComposeController::new(&config.installation.service_dir));
    let database = Arc::new(DockerExecAdapter::new());
    let settings = config.run_settings()?;

    let mut sequencer = BackupSequencer::new(runtime, services, database, settings)
        .with_state_store(StateStore::new(&paths.state_file));

    if upload {
        if let Some((token, chat_id)) = config.telegram.upload_target() {
            sequencer = sequencer.with_uploader(Arc::new(TelegramUploader::new(token, chat_id)?));
        }
    }

    Ok(sequencer.run().await)
}

async fn handle_backup(paths: &AppPaths, config: &EngineConfig, upload: bool, json: bool) -> Result<ExitCode> {
    if let Some(code) = check_config(config, json) {
        return Ok(code);
    }
    let _lock = match acquire_lock(paths, json)? {
        Ok(lock) => lock,
        Err(code) => return Ok(code),
    };

    let outcome = backup(paths, config, upload).await?;
    print_outcome(&outcome, json)
}

async fn handle_restore(paths: &AppPaths, config: &EngineConfig, archive: &Path, json: bool) -> Result<ExitCode> {
    if let Some(code) = check_config(config, json) {
        return Ok(code);
    }
    if !archive.is_file() {
        report_error(&format!("Backup file not found: {}", archive.display()), json);
        return Ok(ExitCode::from(EXIT_NOT_CONFIGURED));
    }
    let _lock = match acquire_lock(paths, json)? {
        Ok(lock) => lock,
        Err(code) => return Ok(code),
    };

    let runtime = Arc::new(DockerManager::new().context("Cannot connect to the Docker daemon")?);
    let services = Arc::new(ComposeController::new(&config.installation.service_dir));
    let database = Arc::new(DockerExecAdapter::new());

    let outcome = RestoreSequencer::new(runtime, services, database, config.run_settings()?)
        .with_state_store(StateStore::new(&paths.state_file))
        .run(archive)
        .await;

    print_outcome(&outcome, json)
}

async fn handle_auto_backup_setup(
    paths: &AppPaths,
    mut config: EngineConfig,
    interval: Option<u32>,
    disable: bool,
    json: bool,
) -> Result<ExitCode> {
    let _lock = match acquire_lock(paths, json)? {
        Ok(lock) => lock,
        Err(code) => return Ok(code),
    };
    let crontab = Crontab::new();

    if disable {
        crontab.install(None).await?;
        if json {
            println!("{}", json!({ "success": true, "message": "Auto-backup disabled" }));
        } else {
            println!("{} Auto-backup disabled", "✓".green().bold());
        }
        return Ok(ExitCode::SUCCESS);
    }

    let Some(minutes) = interval.or(config.telegram.backup_interval) else {
        report_error("No backup interval given and telegram.backup_interval is not set", json);
        return Ok(ExitCode::from(EXIT_NOT_CONFIGURED));
    };

    if interval.is_some() && config.telegram.backup_interval != interval {
        config.telegram.backup_interval = interval;
        config.save(&paths.config_file)?;
    }
    if let Some(code) = check_config(&config, json) {
        return Ok(code);
    }

    let schedule = cron_expression(minutes)?;
    let executable = std::env::current_exe().context("Cannot locate the running executable")?;
    crontab
        .install(Some(&job_line(&schedule, &executable, &paths.config_file)))
        .await?;
    tracing::info!("Auto-backup scheduled every {} minutes ({})", minutes, schedule);

    // confirmation backup
    let outcome = backup(paths, &config, true).await?;
    print_outcome(&outcome, json)
}

/// Connected Docker client, or None when the daemon does not answer
async fn reachable_docker() -> Option<DockerManager> {
    match DockerManager::new() {
        Ok(docker) if docker.check_docker().await => Some(docker),
        Ok(_) => {
            tracing::warn!("Docker daemon is not responding");
            None
        }
        Err(e) => {
            tracing::warn!("Cannot connect to the Docker daemon: {}", e);
            None
        }
    }
}

async fn handle_get_db_type(config: &EngineConfig) -> Result<ExitCode> {
    let docker = reachable_docker().await;
    let container = match &docker {
        Some(runtime) => find_database_container(runtime, true, &config.installation.app_token).await,
        None => None,
    };

    let result = match &container {
        Some(c) => json!({ "db_type": c.engine.as_str(), "container": c.name, "docker": true }),
        None => json!({ "db_type": "none", "container": null, "docker": docker.is_some() }),
    };
    println!("{}", result);

    Ok(ExitCode::SUCCESS)
}

async fn handle_status(paths: &AppPaths, config: &EngineConfig, json: bool) -> Result<ExitCode> {
    let state = StateStore::new(&paths.state_file).load();
    let docker = reachable_docker().await.is_some();
    let job = match Crontab::new().installed_job().await {
        Ok(job) => job,
        Err(e) => {
            tracing::debug!("Cannot read crontab: {}", e);
            None
        }
    };

    if json {
        println!(
            "{}",
            json!({
                "config_file": paths.config_file,
                "docker_reachable": docker,
                "last_backup_time": state.last_backup_time,
                "last_backup_archive": state.last_backup_archive,
                "last_restore_time": state.last_restore_time,
                "last_restore_archive": state.last_restore_archive,
                "auto_backup": job.is_some(),
                "backup_interval": config.telegram.backup_interval,
                "upload_configured": config.telegram.upload_target().is_some(),
            })
        );
        return Ok(ExitCode::SUCCESS);
    }

    println!("{}\n", "Marzban Backup Status".bold());
    println!("{:<20} {}", "Config file:", paths.config_file.display());
    println!("{:<20} {}", "Service dir:", config.installation.service_dir.display());
    let daemon = if docker { "reachable".green() } else { "unreachable".red() };
    println!("{:<20} {}", "Docker:", daemon);

    match (&state.last_backup_time, &state.last_backup_archive) {
        (Some(time), Some(archive)) => {
            let size = file_size(archive);
            let present = if archive.exists() {
                format_bytes(size)
            } else {
                "missing".red().to_string()
            };
            println!("{:<20} {} ({}, {})", "Last backup:", format_timestamp(time), archive.display(), present);
        }
        _ => println!("{:<20} {}", "Last backup:", "never".dimmed()),
    }
    match &state.last_restore_time {
        Some(time) => println!("{:<20} {}", "Last restore:", format_timestamp(time)),
        None => println!("{:<20} {}", "Last restore:", "never".dimmed()),
    }

    match (&job, config.telegram.backup_interval) {
        (Some(_), Some(minutes)) => println!("{:<20} {} every {} minutes", "Auto-backup:", "enabled".green(), minutes),
        (Some(_), None) => println!("{:<20} {}", "Auto-backup:", "enabled".green()),
        (None, _) => println!("{:<20} {}", "Auto-backup:", "disabled".yellow()),
    }
    let upload = if config.telegram.upload_target().is_some() {
        "Telegram".green()
    } else {
        "not configured".yellow()
    };
    println!("{:<20} {}", "Upload:", upload);

    Ok(ExitCode::SUCCESS)
}

fn handle_config(command: ConfigCommands, config: &EngineConfig, json: bool) -> Result<ExitCode> {
    match command {
        ConfigCommands::View => {
            let masked = masked_config(config);
            if json {
                println!("{}", serde_json::to_string_pretty(&masked)?);
            } else {
                print!("{}", toml::to_string_pretty(&masked).context("Failed to serialize config")?);
            }
            Ok(ExitCode::SUCCESS)
        }
        ConfigCommands::Validate => {
            let errors = config.validate();
            let warnings = config.warnings();

            if json {
                println!(
                    "{}",
                    json!({ "valid": errors.is_empty(), "errors": errors, "warnings": warnings })
                );
            } else {
                for error in &errors {
                    println!("  {} {}", "✗".red(), error);
                }
                for warning in &warnings {
                    println!("  {} {}", "!".yellow(), warning.yellow());
                }
                if errors.is_empty() {
                    println!("{} Configuration is valid", "✓".green().bold());
                }
            }

            Ok(if !errors.is_empty() {
                ExitCode::from(EXIT_NOT_CONFIGURED)
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}

fn masked_config(config: &EngineConfig) -> EngineConfig {
    let mut masked = config.clone();
    if masked.database.password.is_some() {
        masked.database.password = Some("********".to_string());
    }
    masked.telegram.bot_token = masked.telegram.bot_token.as_deref().map(|t| mask_sensitive(t, 4));
    masked
}
