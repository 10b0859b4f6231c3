/// Locations of the files this tool keeps for itself
/// Defaults live in ~/.config/marzban-backup/

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::{CONFIG_DIR_NAME, CONFIG_ENV_VAR, CONFIG_FILE_NAME, LOCK_FILE_NAME, LOG_FILE_NAME, STATE_FILE_NAME};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub state_file: PathBuf,
    pub log_file: PathBuf,
    pub lock_file: PathBuf,
}

impl AppPaths {
    /// Resolve paths from an explicit config file, the environment, or the default directory
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let config_file = match explicit {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(CONFIG_ENV_VAR) {
                Some(path) => PathBuf::from(path),
                None => Self::default_dir()?.join(CONFIG_FILE_NAME),
            },
        };

        let dir = config_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;

        Ok(Self::in_dir(&dir, config_file))
    }

    /// Lay out the sibling files next to a config file
    pub fn in_dir(dir: &Path, config_file: PathBuf) -> Self {
        Self {
            config_file,
            state_file: dir.join(STATE_FILE_NAME),
            log_file: dir.join(LOG_FILE_NAME),
            lock_file: dir.join(LOCK_FILE_NAME),
        }
    }

    fn default_dir() -> Result<PathBuf> {
        let base = match dirs::config_dir() {
            Some(dir) => dir,
            None => {
                let home = std::env::var("HOME").context("HOME environment variable not set")?;
                PathBuf::from(home).join(".config")
            }
        };
        Ok(base.join(CONFIG_DIR_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_explicit_path_places_siblings_next_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("nested").join("config.toml");

        let paths = AppPaths::resolve(Some(&config)).unwrap();

        assert_eq!(paths.config_file, config);
        assert_eq!(paths.state_file, dir.path().join("nested").join(STATE_FILE_NAME));
        assert_eq!(paths.lock_file, dir.path().join("nested").join(LOCK_FILE_NAME));
        assert!(dir.path().join("nested").is_dir());
    }
}
