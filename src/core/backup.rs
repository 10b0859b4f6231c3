/// Backup sequencer
///
/// ```text
/// Idle -> DumpingDb -> SnapshottingFs -> Archiving -> Done
/// ```
///
/// `Failed` is reachable from every state. DumpingDb is skipped outright when
/// no database container (or no password) is found. A failed run leaves
/// neither archive nor staging directory behind.

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::core::archive;
use crate::core::config::RunSettings;
use crate::core::database::{dump_all_databases, wait_until_ready, DatabaseAdapter, DatabaseCredentials};
use crate::core::discovery::{find_database_container, DatabaseContainer};
use crate::core::docker::{ContainerRuntime, ServiceAction, ServiceController};
use crate::core::error::Error;
use crate::core::run::{AtState, RunContext, RunOutcome, StepFailure};
use crate::core::snapshot::snapshot;
use crate::core::state::StateStore;
use crate::core::telegram::ArchiveUploader;
use crate::utils::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackupState {
    Idle,
    DumpingDb,
    SnapshottingFs,
    Archiving,
    Done,
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BackupState::Idle => "preparing",
            BackupState::DumpingDb => "dumping databases",
            BackupState::SnapshottingFs => "copying files",
            BackupState::Archiving => "creating the archive",
            BackupState::Done => "finishing",
        };
        f.write_str(text)
    }
}

type StepResult<T> = std::result::Result<T, StepFailure<BackupState>>;

/// `marzban_backup_<local timestamp>.tar.gz`
pub fn archive_file_name(at: DateTime<Local>) -> String {
    format!(
        "{}{}{}",
        ARCHIVE_PREFIX,
        at.format(ARCHIVE_TIMESTAMP_FORMAT),
        ARCHIVE_SUFFIX
    )
}

pub struct BackupSequencer {
    runtime: Arc<dyn ContainerRuntime>,
    services: Arc<dyn ServiceController>,
    database: Arc<dyn DatabaseAdapter>,
    settings: RunSettings,
    uploader: Option<Arc<dyn ArchiveUploader>>,
    state_store: Option<StateStore>,
}

impl BackupSequencer {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        services: Arc<dyn ServiceController>,
        database: Arc<dyn DatabaseAdapter>,
        settings: RunSettings,
    ) -> Self {
        Self {
            runtime,
            services,
            database,
            settings,
            uploader: None,
            state_store: None,
        }
    }

    /// Hand finished archives to `uploader`
    pub fn with_uploader(mut self, uploader: Arc<dyn ArchiveUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_state_store(mut self, store: StateStore) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Run one backup to a terminal state
    pub async fn run(&self) -> RunOutcome {
        let mut ctx = match RunContext::new(BACKUP_STAGING_PREFIX) {
            Ok(ctx) => ctx,
            Err(e) => return RunOutcome::aborted(format!("Could not create staging directory: {}", e)),
        };

        ctx.journal.info("Starting backup process...");
        let archive_path = self.settings.output_dir.join(archive_file_name(Local::now()));

        match self.execute(&mut ctx, &archive_path).await {
            Ok(()) => {
                let size = file_size(&archive_path);
                ctx.journal.info(format!(
                    "Backup created: {} ({})",
                    archive_path.display(),
                    format_bytes(size)
                ));

                self.record(&mut ctx, &archive_path);
                self.upload(&mut ctx, &archive_path, size).await;

                let message = format!("Backup created: {}", archive_path.display());
                ctx.finish(true, message, Some(archive_path))
            }
            Err(failure) => {
                if archive_path.exists() {
                    if let Err(e) = std::fs::remove_file(&archive_path) {
                        ctx.journal.warn(format!("Could not remove incomplete archive: {}", e));
                    }
                }
                let message = format!("Backup {}", failure);
                ctx.journal.error(&message);
                ctx.finish(false, message, None)
            }
        }
    }

    async fn execute(&self, ctx: &mut RunContext, archive_path: &Path) -> StepResult<()> {
        let container =
            find_database_container(self.runtime.as_ref(), true, &self.settings.app_token).await;

        let mut dumped_any = false;
        match (container, self.settings.credentials()) {
            (Some(container), Some(creds)) => {
                tracing::debug!("Backup state: {:?}", BackupState::DumpingDb);
                ctx.journal.info(format!(
                    "Found {} container: {}",
                    container.engine, container.name
                ));
                dumped_any = self.dump(ctx, &container, &creds).await?;
            }
            (Some(container), None) => {
                ctx.journal.warn(format!(
                    "Found database container {} but no password is configured. Skipping database backup.",
                    container.name
                ));
            }
            (None, _) => {
                ctx.journal.warn("No MySQL/MariaDB container found. Skipping database backup.");
            }
        }

        tracing::debug!("Backup state: {:?}", BackupState::SnapshottingFs);
        ctx.journal.info("Copying filesystem data...");
        let fs_dir = ctx.staging_dir().join(ARCHIVE_FS_DIR);
        let report = snapshot(&self.settings.sources, &fs_dir).at_state(BackupState::SnapshottingFs)?;
        for (name, path) in &report.missing {
            ctx.journal.warn(format!("Path not found, skipping '{}': {}", name, path.display()));
        }
        if !report.copied.is_empty() {
            ctx.journal.info(format!(
                "Copied {} ({} files, {})",
                report.copied.join(", "),
                report.stats.files,
                format_bytes(report.stats.bytes)
            ));
        }
        if report.copied.is_empty() && !dumped_any {
            return Err(StepFailure {
                state: BackupState::SnapshottingFs,
                error: Error::Other("nothing to back up: no database dumps and no source paths found".to_string()),
            });
        }

        tracing::debug!("Backup state: {:?}", BackupState::Archiving);
        ctx.journal.info("Compressing backup files...");
        archive::pack(ctx.staging_dir(), archive_path).at_state(BackupState::Archiving)?;

        Ok(())
    }

    /// Dump every schema into staging; true when at least one dump was written
    async fn dump(
        &self,
        ctx: &mut RunContext,
        container: &DatabaseContainer,
        creds: &DatabaseCredentials,
    ) -> StepResult<bool> {
        if !container.is_running() {
            let service = self
                .settings
                .db_service
                .clone()
                .unwrap_or_else(|| container.service_name().to_string());
            ctx.journal.info(format!(
                "Database container is {}, starting service '{}'",
                container.state.as_str(),
                service
            ));

            let action = ServiceAction::UpService(service);
            if !self.services.run_service_command(&action).await {
                return Err(StepFailure {
                    state: BackupState::DumpingDb,
                    error: Error::CommandFailed {
                        command: action.to_string(),
                        stderr: "could not start the database service".to_string(),
                    },
                });
            }

            let timings = &self.settings.timings;
            wait_until_ready(
                self.database.as_ref(),
                container,
                creds,
                timings.backup_settle(),
                timings.readiness_attempts,
                timings.readiness_interval(),
            )
            .await
            .at_state(BackupState::DumpingDb)?;
        }

        ctx.journal.info("Backing up databases...");
        let dump_dir = ctx.staging_dir().join(ARCHIVE_DB_DIR);
        let summary = dump_all_databases(self.database.as_ref(), container, creds, &dump_dir)
            .await
            .at_state(BackupState::DumpingDb)?;

        for name in &summary.dumped {
            ctx.journal.info(format!("Dumped database: {}", name));
        }
        for (name, error) in &summary.failed {
            ctx.journal.warn(format!("Dump of database '{}' failed: {}", name, error));
        }
        if summary.is_partial() {
            ctx.journal.warn(format!(
                "Partial database backup: {} of {} databases could not be dumped",
                summary.failed.len(),
                summary.failed.len() + summary.dumped.len()
            ));
        }
        if summary.dumped.is_empty() && summary.failed.is_empty() {
            ctx.journal.warn("No user databases found.");
        }

        Ok(!summary.dumped.is_empty())
    }

    fn record(&self, ctx: &mut RunContext, archive_path: &Path) {
        if let Some(store) = &self.state_store {
            if let Err(e) = store.record_backup(archive_path, Utc::now()) {
                ctx.journal.warn(format!("Could not record backup time: {}", e));
            }
        }
    }

    async fn upload(&self, ctx: &mut RunContext, archive_path: &Path, size: u64) {
        let Some(uploader) = &self.uploader else {
            return;
        };

        let caption = format!(
            "Marzban backup\nHost: {}\nTime: {}\nSize: {}",
            hostname(),
            format_timestamp(&Utc::now()),
            format_bytes(size)
        );

        match uploader.upload(archive_path, &caption).await {
            Ok(()) => ctx.journal.info("Backup uploaded to Telegram."),
            Err(e) => ctx.journal.warn(format!(
                "{}. The archive is kept at {}",
                e,
                archive_path.display()
            )),
        }
    }
}
