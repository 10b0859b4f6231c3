/// Marzban installation layout and backup constants
///
/// Defaults match a stock `marzban` install script deployment

/// Directory holding docker-compose.yml and .env
pub const DEFAULT_SERVICE_DIR: &str = "/opt/marzban";

/// Token used to prefer the panel's own database container
pub const DEFAULT_APP_TOKEN: &str = "marzban";

/// Where finished archives are written
pub const DEFAULT_OUTPUT_DIR: &str = "/root";

pub const DEFAULT_DB_USER: &str = "root";

pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";
pub const DEFAULT_ENV_FILE: &str = ".env";

/// .env keys that may carry the database root password
pub const DOTENV_PASSWORD_KEYS: &[&str] = &["MYSQL_ROOT_PASSWORD", "MARIADB_ROOT_PASSWORD"];

/// Logical name of the tree that also hosts live database storage
pub const APP_STATE_NAME: &str = "app-state";
pub const APP_STATE_PATH: &str = "/var/lib/marzban";

/// Children of app-state never copied: raw database files, socket, logs
pub const APP_STATE_EXCLUDES: &[&str] = &["mysql", "logs", "mysql.sock", "mysql.sock.lock"];

pub const APP_CONFIG_NAME: &str = "app-config";
pub const APP_CONFIG_PATH: &str = "/opt/marzban";

/// Built-in schemas that are never dumped
pub const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "mysql", "performance_schema", "sys"];

/// Image names recognised as a database engine
pub const DATABASE_IMAGE_PATTERN: &str = r"(?i)mysql|mariadb";

/// Label set by compose on every container it manages
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Archive layout
pub const ARCHIVE_DB_DIR: &str = "db_dumps";
pub const ARCHIVE_FS_DIR: &str = "filesystem";
pub const ARCHIVE_PREFIX: &str = "marzban_backup_";
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";
pub const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Staging directory prefixes
pub const BACKUP_STAGING_PREFIX: &str = "hexbackup_";
pub const RESTORE_STAGING_PREFIX: &str = "restore_";

/// Compose invocations tried in order
pub const COMPOSE_VARIANTS: &[&[&str]] = &[&["docker", "compose"], &["docker-compose"]];

/// Timing defaults (seconds)
pub const DEFAULT_BACKUP_SETTLE_SECS: u64 = 5;
pub const DEFAULT_RESTORE_SETTLE_SECS: u64 = 15;
pub const DEFAULT_READINESS_ATTEMPTS: u32 = 10;
pub const DEFAULT_READINESS_INTERVAL_SECS: u64 = 3;

/// Telegram bot API refuses documents above 50 MB
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const TELEGRAM_UPLOAD_LIMIT: u64 = 50 * 1024 * 1024;

/// Marker appended to the crontab line this tool owns
pub const CRON_JOB_MARKER: &str = "# HEXMOSTAFA_MARZBAN_BACKUP_JOB";

/// Files kept in the config directory
pub const CONFIG_DIR_NAME: &str = "marzban-backup";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATE_FILE_NAME: &str = "state.json";
pub const LOG_FILE_NAME: &str = "marzban_backup.log";
pub const LOCK_FILE_NAME: &str = "run.lock";

/// Log rotation: 10 MB per file, five rotated files kept
pub const LOG_MAX_BYTES: usize = 10 * 1024 * 1024;
pub const LOG_KEEP_FILES: usize = 5;

/// Environment override for the config file location
pub const CONFIG_ENV_VAR: &str = "MARZBAN_BACKUP_CONFIG";
