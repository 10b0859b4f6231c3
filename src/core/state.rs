use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::error::{IoContext, Result};

/// Persistent record of past runs, kept as JSON next to the config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunState {
    pub last_backup_time: Option<DateTime<Utc>>,
    pub last_backup_archive: Option<PathBuf>,
    pub last_restore_time: Option<DateTime<Utc>>,
    pub last_restore_archive: Option<PathBuf>,
}

/// Narrow read/update access to the state file
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load from file or start empty. A corrupt file is reported and ignored.
    pub fn load(&self) -> RunState {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return RunState::default(),
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable state file {}: {}", self.path.display(), e);
            RunState::default()
        })
    }

    fn save(&self, state: &RunState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).at_path(parent)?;
        }
        let content = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, content).at_path(&self.path)
    }

    pub fn record_backup(&self, archive: &Path, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.load();
        state.last_backup_time = Some(at);
        state.last_backup_archive = Some(archive.to_path_buf());
        self.save(&state)
    }

    pub fn record_restore(&self, archive: &Path, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.load();
        state.last_restore_time = Some(at);
        state.last_restore_archive = Some(archive.to_path_buf());
        self.save(&state)
    }
}
