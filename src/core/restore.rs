/// Restore sequencer
///
/// ```text
/// Extracting -> StoppingServices -> RestoringFilesystem -> StartingDatabaseOnly
///   -> WaitingForReadiness -> ImportingDumps -> StartingAllServices -> Done
/// ```
///
/// A failure before StartingAllServices triggers one best-effort `up` of the
/// whole service group. Restores are never retried.

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::core::archive;
use crate::core::config::RunSettings;
use crate::core::database::{import_all_dumps, list_dump_files, wait_until_ready, DatabaseAdapter};
use crate::core::discovery::find_database_container;
use crate::core::docker::{ContainerRuntime, ServiceAction, ServiceController};
use crate::core::error::{Error, IoContext, Result};
use crate::core::run::{AtState, RunContext, RunOutcome, StepFailure};
use crate::core::snapshot;
use crate::core::state::StateStore;
use crate::utils::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RestoreState {
    Extracting,
    StoppingServices,
    RestoringFilesystem,
    StartingDatabaseOnly,
    WaitingForReadiness,
    ImportingDumps,
    StartingAllServices,
    Done,
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RestoreState::Extracting => "extracting the archive",
            RestoreState::StoppingServices => "stopping services",
            RestoreState::RestoringFilesystem => "restoring files",
            RestoreState::StartingDatabaseOnly => "starting the database",
            RestoreState::WaitingForReadiness => "waiting for the database",
            RestoreState::ImportingDumps => "importing databases",
            RestoreState::StartingAllServices => "starting all services",
            RestoreState::Done => "finishing",
        };
        f.write_str(text)
    }
}

type StepResult<T> = std::result::Result<T, StepFailure<RestoreState>>;

/// Logical names stored under the archive's filesystem directory
fn tree_names(fs_dir: &Path) -> Result<Vec<String>> {
    if !fs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(fs_dir).at_path(fs_dir)? {
        names.push(entry.at_path(fs_dir)?.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

fn enter(state: RestoreState) -> RestoreState {
    tracing::debug!("Restore state: {:?}", state);
    state
}

pub struct RestoreSequencer {
    runtime: Arc<dyn ContainerRuntime>,
    services: Arc<dyn ServiceController>,
    database: Arc<dyn DatabaseAdapter>,
    settings: RunSettings,
    state_store: Option<StateStore>,
}

impl RestoreSequencer {
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
            state_store: None,
        }
    }

    pub fn with_state_store(mut self, store: StateStore) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Replace the installation's state with the archive's. Runs to a terminal state.
    pub async fn run(&self, archive_path: &Path) -> RunOutcome {
        let mut ctx = match RunContext::new(RESTORE_STAGING_PREFIX) {
            Ok(ctx) => ctx,
            Err(e) => return RunOutcome::aborted(format!("Could not create staging directory: {}", e)),
        };

        ctx.journal.info(format!("Starting restore from {}", archive_path.display()));

        match self.execute(&mut ctx, archive_path).await {
            Ok(()) => {
                if let Some(store) = &self.state_store {
                    if let Err(e) = store.record_restore(archive_path, Utc::now()) {
                        ctx.journal.warn(format!("Could not record restore time: {}", e));
                    }
                }
                ctx.journal.info("Restore process completed successfully!");
                ctx.finish(true, "Restore completed", None)
            }
            Err(failure) => {
                let message = format!("Restore {}", failure);
                ctx.journal.error(&message);

                if failure.state < RestoreState::StartingAllServices {
                    ctx.journal.warn("Attempting to bring services back up...");
                    if self.services.run_service_command(&ServiceAction::Up).await {
                        ctx.journal.info("Services started.");
                    } else {
                        ctx.journal.error("Could not start services. Manual intervention is required.");
                    }
                }

                ctx.finish(false, message, None)
            }
        }
    }

    async fn execute(&self, ctx: &mut RunContext, archive_path: &Path) -> StepResult<()> {
        let state = enter(RestoreState::Extracting);
        ctx.journal.info("Extracting backup archive...");
        let members = archive::unpack(archive_path, ctx.staging_dir()).at_state(state)?;
        ctx.journal.info(format!(
            "Archive contains: {}",
            members.iter().map(|m| format!("{}/", m)).collect::<Vec<_>>().join(", ")
        ));
        let dumps = list_dump_files(&ctx.staging_dir().join(ARCHIVE_DB_DIR)).at_state(state)?;

        let fs_dir = ctx.staging_dir().join(ARCHIVE_FS_DIR);
        let trees = tree_names(&fs_dir).at_state(state)?;
        if !trees.is_empty() && trees.iter().all(|name| self.settings.sources.get(name).is_none()) {
            return Err(StepFailure {
                state,
                error: Error::InvalidArchive(format!(
                    "filesystem trees {} match no configured source",
                    trees.join(", ")
                )),
            });
        }

        // compose down removes the containers, so resolve the service first
        let db_service = if dumps.is_empty() {
            None
        } else {
            self.resolve_database_service(ctx).await
        };

        let state = enter(RestoreState::StoppingServices);
        ctx.journal.info("Stopping services...");
        self.service_step(&ServiceAction::Down).await.at_state(state)?;

        let state = enter(RestoreState::RestoringFilesystem);
        if fs_dir.is_dir() {
            ctx.journal.info("Restoring files...");
            let report = snapshot::restore(&fs_dir, &self.settings.sources).at_state(state)?;
            for name in &report.restored {
                ctx.journal.info(format!("Restored '{}'", name));
            }
            for name in &report.not_in_archive {
                ctx.journal.warn(format!("'{}' is not in the backup; left untouched", name));
            }
            for name in &report.unknown {
                ctx.journal.warn(format!("Backup contains unknown tree '{}'; ignored", name));
            }
        } else {
            ctx.journal.warn("Backup contains no filesystem data.");
        }

        match (dumps.is_empty(), db_service, self.settings.credentials()) {
            (true, _, _) => ctx.journal.info("No database dumps in backup. Skipping database restore."),
            (false, None, _) => ctx.journal.warn(
                "Backup contains database dumps but no database service was found. Skipping database restore.",
            ),
            (false, Some(_), None) => ctx.journal.warn(
                "Backup contains database dumps but no database password is configured. Skipping database restore.",
            ),
            (false, Some(service), Some(creds)) => {
                let state = enter(RestoreState::StartingDatabaseOnly);
                ctx.journal.info(format!("Starting database service '{}'...", service));
                self.service_step(&ServiceAction::UpService(service))
                    .await
                    .at_state(state)?;

                let state = enter(RestoreState::WaitingForReadiness);
                let container = find_database_container(self.runtime.as_ref(), false, &self.settings.app_token)
                    .await
                    .ok_or_else(|| Error::NotReady {
                        attempts: 0,
                        last_error: "database container is not running after start".to_string(),
                    })
                    .at_state(state)?;
                ctx.journal.info(format!("Waiting for {} to accept queries...", container.name));
                let timings = &self.settings.timings;
                wait_until_ready(
                    self.database.as_ref(),
                    &container,
                    &creds,
                    timings.restore_settle(),
                    timings.readiness_attempts,
                    timings.readiness_interval(),
                )
                .await
                .at_state(state)?;

                let state = enter(RestoreState::ImportingDumps);
                let imported = import_all_dumps(self.database.as_ref(), &container, &creds, &dumps)
                    .await
                    .at_state(state)?;
                ctx.journal.info(format!("Restored databases: {}", imported.join(", ")));
            }
        }

        let state = enter(RestoreState::StartingAllServices);
        ctx.journal.info("Starting all services...");
        self.service_step(&ServiceAction::Up).await.at_state(state)?;

        enter(RestoreState::Done);
        Ok(())
    }

    /// Configured service, else the discovered container's, else the compose file's
    async fn resolve_database_service(&self, ctx: &mut RunContext) -> Option<String> {
        if let Some(service) = &self.settings.db_service {
            return Some(service.clone());
        }

        if let Some(container) =
            find_database_container(self.runtime.as_ref(), true, &self.settings.app_token).await
        {
            ctx.journal.info(format!(
                "Found {} container: {} (service '{}')",
                container.engine,
                container.name,
                container.service_name()
            ));
            return Some(container.service_name().to_string());
        }

        let service = self.services.database_service();
        if let Some(service) = &service {
            ctx.journal.info(format!("Using database service '{}' from the compose file", service));
        }
        service
    }

    async fn service_step(&self, action: &ServiceAction) -> Result<()> {
        if self.services.run_service_command(action).await {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command: format!("compose {}", action),
                stderr: "see log for details".to_string(),
            })
        }
    }
}
