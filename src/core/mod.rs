pub mod archive;
pub mod backup;
pub mod config;
pub mod database;
pub mod discovery;
pub mod docker;
pub mod error;
pub mod lock;
pub mod restore;
pub mod run;
pub mod schedule;
pub mod snapshot;
pub mod state;
pub mod telegram;

pub use backup::BackupSequencer;
pub use config::{EngineConfig, RunSettings};
pub use database::{DatabaseAdapter, DockerExecAdapter};
pub use discovery::{find_database_container, DatabaseContainer, DbEngine};
pub use docker::{ComposeController, ContainerRuntime, DockerManager, ServiceController};
pub use error::{Error, Result};
pub use lock::RunLock;
pub use restore::RestoreSequencer;
pub use run::RunOutcome;
pub use schedule::Crontab;
pub use state::StateStore;
pub use telegram::{ArchiveUploader, TelegramUploader};
