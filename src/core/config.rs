/// Engine configuration
///
/// Read once per run from a TOML file and passed by value into the
/// sequencers. Nothing here is rewritten during a run.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::database::DatabaseCredentials;
use crate::core::schedule::cron_expression;
use crate::core::snapshot::{ExclusionRule, SourcePath, SourcePathSet};
use crate::core::error::Result;
use crate::utils::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseSection,
    pub telegram: TelegramSection,
    pub installation: InstallationSection,
    pub sources: Vec<SourceEntry>,
    pub timings: Timings,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            user: DEFAULT_DB_USER.to_string(),
            password: None,
        }
    }
}

impl std::fmt::Debug for DatabaseSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSection")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***HIDDEN***"))
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_chat_id: Option<String>,
    /// Auto backup interval in minutes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_interval: Option<u32>,
}

impl std::fmt::Debug for TelegramSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSection")
            .field("bot_token", &self.bot_token.as_deref().map(|t| mask_sensitive(t, 4)))
            .field("admin_chat_id", &self.admin_chat_id)
            .field("backup_interval", &self.backup_interval)
            .finish()
    }
}

impl TelegramSection {
    /// Token and chat id, when both are set
    pub fn upload_target(&self) -> Option<(&str, &str)> {
        match (self.bot_token.as_deref(), self.admin_chat_id.as_deref()) {
            (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => Some((token, chat)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallationSection {
    pub service_dir: PathBuf,
    pub app_token: String,
    pub output_dir: PathBuf,
    /// Compose service of the database, when it cannot be discovered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for InstallationSection {
    fn default() -> Self {
        Self {
            service_dir: PathBuf::from(DEFAULT_SERVICE_DIR),
            app_token: DEFAULT_APP_TOKEN.to_string(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            db_service: None,
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub preserve_symlinks: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub backup_settle_secs: u64,
    pub restore_settle_secs: u64,
    pub readiness_attempts: u32,
    pub readiness_interval_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            backup_settle_secs: DEFAULT_BACKUP_SETTLE_SECS,
            restore_settle_secs: DEFAULT_RESTORE_SETTLE_SECS,
            readiness_attempts: DEFAULT_READINESS_ATTEMPTS,
            readiness_interval_secs: DEFAULT_READINESS_INTERVAL_SECS,
        }
    }
}

impl Timings {
    pub fn backup_settle(&self) -> Duration {
        Duration::from_secs(self.backup_settle_secs)
    }

    pub fn restore_settle(&self) -> Duration {
        Duration::from_secs(self.restore_settle_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_secs(self.readiness_interval_secs)
    }

    /// No waiting at all, for tests
    pub fn immediate() -> Self {
        Self {
            backup_settle_secs: 0,
            restore_settle_secs: 0,
            readiness_attempts: 1,
            readiness_interval_secs: 0,
        }
    }
}

/// What one backup or restore run needs, resolved from the configuration
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub sources: SourcePathSet,
    pub database: DatabaseSection,
    /// Compose .env consulted when no password is configured
    pub env_file: PathBuf,
    pub app_token: String,
    pub db_service: Option<String>,
    pub output_dir: PathBuf,
    pub timings: Timings,
}

impl RunSettings {
    /// Resolved on each call: a restore may bring back a different .env
    pub fn credentials(&self) -> Option<DatabaseCredentials> {
        resolve_credentials(&self.database, &self.env_file)
    }
}

fn resolve_credentials(database: &DatabaseSection, env_file: &Path) -> Option<DatabaseCredentials> {
    let password = match &database.password {
        Some(password) if !password.is_empty() => password.clone(),
        _ => find_dotenv_password(env_file)?,
    };
    Some(DatabaseCredentials::new(&database.user, password))
}

/// The two stock Marzban trees
pub fn default_sources() -> Vec<SourceEntry> {
    vec![
        SourceEntry {
            name: APP_STATE_NAME.to_string(),
            path: PathBuf::from(APP_STATE_PATH),
            exclude: APP_STATE_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            preserve_symlinks: false,
        },
        SourceEntry {
            name: APP_CONFIG_NAME.to_string(),
            path: PathBuf::from(APP_CONFIG_PATH),
            exclude: Vec::new(),
            preserve_symlinks: false,
        },
    ]
}

impl EngineConfig {
    /// Load from a TOML file; a missing file yields defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default().with_default_sources());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config.with_default_sources())
    }

    /// Save configuration to file, readable by the owner only
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        fs::write(path, contents).context("Failed to write config file")?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to restrict config file permissions")?;

        Ok(())
    }

    fn with_default_sources(mut self) -> Self {
        if self.sources.is_empty() {
            self.sources = default_sources();
        }
        self
    }

    /// Build the validated source set
    pub fn source_set(&self) -> Result<SourcePathSet> {
        let sources = self
            .sources
            .iter()
            .map(|entry| {
                let exclusions = ExclusionRule::new(entry.exclude.iter().cloned())?;
                Ok(SourcePath::new(&entry.name, &entry.path)
                    .with_exclusions(exclusions)
                    .with_preserve_symlinks(entry.preserve_symlinks))
            })
            .collect::<Result<Vec<_>>>()?;

        SourcePathSet::new(sources)
    }

    pub fn run_settings(&self) -> Result<RunSettings> {
        Ok(RunSettings {
            sources: self.source_set()?,
            database: self.database.clone(),
            env_file: self.env_file(),
            app_token: self.installation.app_token.clone(),
            db_service: self.installation.db_service.clone(),
            output_dir: self.installation.output_dir.clone(),
            timings: self.timings.clone(),
        })
    }

    /// Credentials from config, falling back to the installation's .env
    pub fn credentials(&self) -> Option<DatabaseCredentials> {
        resolve_credentials(&self.database, &self.env_file())
    }

    pub fn env_file(&self) -> PathBuf {
        self.installation.service_dir.join(DEFAULT_ENV_FILE)
    }

    /// Problems that make the configuration unusable
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Err(e) = self.source_set() {
            errors.push(e.to_string());
        }

        if self.database.user.trim().is_empty() {
            errors.push("database.user is empty".to_string());
        }

        let telegram = &self.telegram;
        match (&telegram.bot_token, &telegram.admin_chat_id) {
            (Some(_), None) | (None, Some(_)) => {
                errors.push("telegram.bot_token and telegram.admin_chat_id must be set together".to_string())
            }
            _ => {}
        }
        if let Some(chat) = &telegram.admin_chat_id {
            if chat.parse::<i64>().is_err() {
                errors.push(format!("telegram.admin_chat_id '{}' is not a numeric chat id", chat));
            }
        }
        if let Some(interval) = telegram.backup_interval {
            if let Err(e) = cron_expression(interval) {
                errors.push(e.to_string());
            }
        }

        if !self.installation.output_dir.is_absolute() {
            errors.push("installation.output_dir must be an absolute path".to_string());
        }

        errors
    }

    /// Harmless oddities: source paths missing on this host are skipped at run time
    pub fn warnings(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter(|entry| !entry.path.exists())
            .map(|entry| {
                format!(
                    "source '{}' path {} does not exist and will be skipped",
                    entry.name,
                    entry.path.display()
                )
            })
            .collect()
    }

    /// Fail with every validation message joined
    pub fn ensure_valid(&self) -> anyhow::Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "Configuration errors:\n{}",
                errors.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n")
            ))
        }
    }
}

/// Look for the database root password in a compose .env file
pub fn find_dotenv_password(env_file: &Path) -> Option<String> {
    if !env_file.exists() {
        return None;
    }

    let iter = match dotenv::from_path_iter(env_file) {
        Ok(iter) => iter,
        Err(e) => {
            tracing::warn!("Error reading {}: {}", env_file.display(), e);
            return None;
        }
    };

    for item in iter {
        match item {
            Ok((key, value)) if DOTENV_PASSWORD_KEYS.contains(&key.as_str()) && !value.is_empty() => {
                return Some(value);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Skipping unparsable line in {}: {}", env_file.display(), e),
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_stock_layout() {
        let config = EngineConfig::load(Path::new("/nonexistent/config.toml")).unwrap();

        assert_eq!(config.database.user, "root");
        assert_eq!(config.installation.service_dir, PathBuf::from("/opt/marzban"));
        assert_eq!(config.sources, default_sources());
        let set = config.source_set().unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.get(APP_STATE_NAME).unwrap().exclusions.patterns().contains(&"mysql".to_string()));
        assert!(set.get(APP_CONFIG_NAME).unwrap().exclusions.is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let toml = r#"
            [database]
            user = "admin"
            password = "pw"

            [telegram]
            bot_token = "123:abc"
            admin_chat_id = "42"
            backup_interval = 120

            [installation]
            service_dir = "/srv/marzban"
            output_dir = "/backups"

            [[sources]]
            name = "state"
            path = "/srv/state"
            exclude = ["mysql"]

            [timings]
            restore_settle_secs = 30
        "#;
        let config: EngineConfig = toml::from_str(toml).unwrap();

        assert_eq!(config.database.user, "admin");
        assert_eq!(config.telegram.upload_target(), Some(("123:abc", "42")));
        assert_eq!(config.installation.app_token, "marzban");
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.timings.restore_settle_secs, 30);
        assert_eq!(config.timings.readiness_attempts, DEFAULT_READINESS_ATTEMPTS);
        assert_eq!(config.credentials().unwrap().password, "pw");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = EngineConfig::load(&path).unwrap();
        config.database.password = Some("secret".to_string());
        config.telegram.backup_interval = Some(60);

        config.save(&path).unwrap();
        let reloaded = EngineConfig::load(&path).unwrap();

        assert_eq!(reloaded.database.password.as_deref(), Some("secret"));
        assert_eq!(reloaded.telegram.backup_interval, Some(60));
        assert_eq!(reloaded.sources, default_sources());
    }

    #[test]
    fn test_password_falls_back_to_dotenv() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".env"),
            "UVICORN_PORT=8000\n# comment\nMYSQL_ROOT_PASSWORD=from-dotenv\n",
        )
        .unwrap();
        let mut config = EngineConfig::default();
        config.installation.service_dir = dir.path().to_path_buf();

        let creds = config.credentials().unwrap();

        assert_eq!(creds.user, "root");
        assert_eq!(creds.password, "from-dotenv");
    }

    #[test]
    fn test_no_password_anywhere_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.installation.service_dir = dir.path().to_path_buf();

        assert!(config.credentials().is_none());
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = EngineConfig::default();
        config.sources = vec![
            SourceEntry {
                name: "dup".to_string(),
                path: PathBuf::from("/a"),
                exclude: vec![],
                preserve_symlinks: false,
            },
            SourceEntry {
                name: "dup".to_string(),
                path: PathBuf::from("/b"),
                exclude: vec![],
                preserve_symlinks: false,
            },
        ];
        config.telegram.bot_token = Some("123:abc".to_string());
        config.telegram.backup_interval = Some(7 * 60 + 5);

        let errors = config.validate();

        assert!(errors.iter().any(|e| e.contains("duplicate source name")));
        assert!(errors.iter().any(|e| e.contains("must be set together")));
        assert!(errors.iter().any(|e| e.contains("interval")));
        assert!(config.ensure_valid().is_err());
        assert_eq!(config.warnings().len(), 2);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let mut config = EngineConfig::default();
        config.database.password = Some("db-secret".to_string());
        config.telegram.bot_token = Some("123456789:AAHfiqksKZ8WmR2zSjiQ7".to_string());

        let debug = format!("{:?}", config);

        assert!(!debug.contains("db-secret"));
        assert!(!debug.contains("AAHfiqksKZ8WmR2zSjiQ7"));
    }
}
