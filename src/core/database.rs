/// Database dump and import through the engine's own client tools
///
/// Every command runs inside the database container with `docker exec`.
/// The password travels only through the MYSQL_PWD environment variable,
/// forwarded by name, so it never shows up in an argument list or a log line.

use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::core::discovery::DatabaseContainer;
use crate::core::error::{Error, IoContext, Result};
use crate::utils::SYSTEM_SCHEMAS;

const PASSWORD_ENV: &str = "MYSQL_PWD";

/// Exit codes docker uses when the requested binary is missing in the container
const EXEC_NOT_FOUND_CODES: &[i32] = &[126, 127];

#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseCredentials {
    pub user: String,
    pub password: String,
}

impl DatabaseCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("user", &self.user)
            .field("password", &"***HIDDEN***")
            .finish()
    }
}

/// Operations the sequencers need from the database engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// All schema names, system schemas included
    async fn list_databases(
        &self,
        container: &DatabaseContainer,
        creds: &DatabaseCredentials,
    ) -> Result<Vec<String>>;

    /// Write a standalone dump (with CREATE DATABASE) of one schema to `dest`
    async fn dump_database(
        &self,
        container: &DatabaseContainer,
        creds: &DatabaseCredentials,
        name: &str,
        dest: &Path,
    ) -> Result<()>;

    /// Drop and recreate the schema, then stream the SQL file into it
    async fn import_database(
        &self,
        container: &DatabaseContainer,
        creds: &DatabaseCredentials,
        name: &str,
        sql_path: &Path,
    ) -> Result<()>;

    /// Run a trivial query
    async fn ping(&self, container: &DatabaseContainer, creds: &DatabaseCredentials) -> Result<()>;
}

/// Result of dumping every user schema
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DumpSummary {
    pub dumped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl DumpSummary {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

pub fn is_system_schema(name: &str) -> bool {
    SYSTEM_SCHEMAS.contains(&name)
}

/// Names safe to use as an SQL identifier and as a file stem
pub fn is_valid_database_name(name: &str) -> bool {
    let pattern = Regex::new(r"^[A-Za-z0-9_$-]{1,64}$").expect("database name pattern is a valid regex");
    pattern.is_match(name)
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Parse `SHOW DATABASES` output, header line tolerated
pub fn parse_database_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "Database")
        .map(str::to_string)
        .collect()
}

/// Dump every non-system schema into `dest_dir`, one `<name>.sql` each.
///
/// Schemas are dumped one after another. A failed schema is recorded and the
/// rest still run; failing to list schemas fails the whole call.
pub async fn dump_all_databases(
    adapter: &dyn DatabaseAdapter,
    container: &DatabaseContainer,
    creds: &DatabaseCredentials,
    dest_dir: &Path,
) -> Result<DumpSummary> {
    let databases = adapter.list_databases(container, creds).await?;
    std::fs::create_dir_all(dest_dir).at_path(dest_dir)?;

    let mut summary = DumpSummary::default();

    for db in databases.into_iter().filter(|db| !is_system_schema(db)) {
        if !is_valid_database_name(&db) {
            tracing::warn!("Skipping database with unsupported name: {:?}", db);
            summary.failed.push((db, "unsupported database name".to_string()));
            continue;
        }

        tracing::info!("Dumping database: {}", db);
        let final_path = dest_dir.join(format!("{}.sql", db));
        let partial_path = dest_dir.join(format!("{}.sql.part", db));

        let result = match adapter.dump_database(container, creds, &db, &partial_path).await {
            Ok(()) => std::fs::rename(&partial_path, &final_path).at_path(&final_path),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => summary.dumped.push(db),
            Err(e) => {
                let _ = std::fs::remove_file(&partial_path);
                tracing::error!("Dump of database '{}' failed: {}", db, e);
                summary.failed.push((db, e.to_string()));
            }
        }
    }

    Ok(summary)
}

/// SQL dump files in a directory, sorted by name
pub fn list_dump_files(dump_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !dump_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut dumps = Vec::new();
    for entry in std::fs::read_dir(dump_dir).at_path(dump_dir)? {
        let path = entry.at_path(dump_dir)?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sql") || !path.is_file() {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            dumps.push((stem.to_string(), path.clone()));
        }
    }
    dumps.sort();

    Ok(dumps)
}

/// Import every dump serially, stopping at the first failure
pub async fn import_all_dumps(
    adapter: &dyn DatabaseAdapter,
    container: &DatabaseContainer,
    creds: &DatabaseCredentials,
    dumps: &[(String, PathBuf)],
) -> Result<Vec<String>> {
    let mut imported = Vec::new();

    for (name, path) in dumps {
        if !is_valid_database_name(name) {
            return Err(Error::InvalidArchive(format!(
                "dump file name '{}' is not a valid database name",
                name
            )));
        }
        tracing::info!("Restoring database: {}", name);
        adapter.import_database(container, creds, name, path).await?;
        imported.push(name.clone());
    }

    Ok(imported)
}

/// Wait a fixed settle delay, then poll a trivial query until it succeeds
pub async fn wait_until_ready(
    adapter: &dyn DatabaseAdapter,
    container: &DatabaseContainer,
    creds: &DatabaseCredentials,
    settle: Duration,
    attempts: u32,
    interval: Duration,
) -> Result<()> {
    if !settle.is_zero() {
        tracing::info!("Waiting {} for the database to initialize...", humantime::format_duration(settle));
        tokio::time::sleep(settle).await;
    }

    let attempts = attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match adapter.ping(container, creds).await {
            Ok(()) => {
                tracing::info!("Database is ready (attempt {}/{})", attempt, attempts);
                return Ok(());
            }
            Err(e) => {
                tracing::debug!("Readiness probe {}/{} failed: {}", attempt, attempts, e);
                last_error = e.to_string();
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }

    Err(Error::NotReady {
        attempts,
        last_error,
    })
}

/// Runs the engine's client tools via `docker exec`
#[derive(Debug, Clone)]
pub struct DockerExecAdapter {
    docker: Vec<String>,
}

impl Default for DockerExecAdapter {
    fn default() -> Self {
        Self::new()
    }
}

enum Io<'a> {
    None,
    StdoutTo(&'a Path),
    StdinFrom(&'a Path),
}

impl DockerExecAdapter {
    pub fn new() -> Self {
        Self::with_command(vec!["docker".to_string()])
    }

    /// Use a different docker invocation (program plus leading arguments)
    pub fn with_command(docker: Vec<String>) -> Self {
        Self { docker }
    }

    /// Run one of `binaries` inside the container, falling back when a binary is missing
    async fn exec(
        &self,
        container: &DatabaseContainer,
        creds: &DatabaseCredentials,
        binaries: &[&str],
        args: &[&str],
        io: Io<'_>,
    ) -> Result<String> {
        let Some((program, base)) = self.docker.split_first() else {
            return Err(Error::Config("docker command is empty".to_string()));
        };

        let mut last_error = None;

        for binary in binaries {
            let command_line = format!(
                "docker exec {} {} -u{} {}",
                container.exec_target(),
                binary,
                creds.user,
                args.join(" ")
            );
            tracing::debug!("Running: {}", command_line);

            let mut cmd = Command::new(program);
            cmd.args(base).arg("exec");
            if matches!(io, Io::StdinFrom(_)) {
                cmd.arg("-i");
            }
            cmd.args(["-e", PASSWORD_ENV])
                .arg(container.exec_target())
                .arg(binary)
                .arg(format!("-u{}", creds.user))
                .args(args)
                .env(PASSWORD_ENV, &creds.password)
                .stderr(Stdio::piped());

            match &io {
                Io::None => {
                    cmd.stdin(Stdio::null()).stdout(Stdio::piped());
                }
                Io::StdoutTo(path) => {
                    let file = std::fs::File::create(path).at_path(*path)?;
                    cmd.stdin(Stdio::null()).stdout(Stdio::from(file));
                }
                Io::StdinFrom(path) => {
                    let file = std::fs::File::open(path).at_path(*path)?;
                    cmd.stdin(Stdio::from(file)).stdout(Stdio::piped());
                }
            }

            let output = cmd.output().await.map_err(|e| Error::CommandFailed {
                command: command_line.clone(),
                stderr: e.to_string(),
            })?;

            if output.status.success() {
                return Ok(String::from_utf8_lossy(&output.stdout).to_string());
            }

            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let missing_binary = output
                .status
                .code()
                .map(|code| EXEC_NOT_FOUND_CODES.contains(&code))
                .unwrap_or(false);

            last_error = Some(Error::CommandFailed {
                command: command_line,
                stderr,
            });

            if !missing_binary {
                break;
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Other("no client binary to run".to_string())))
    }

    async fn sql(&self, container: &DatabaseContainer, creds: &DatabaseCredentials, statement: &str) -> Result<String> {
        self.exec(
            container,
            creds,
            container.engine.client_binaries(),
            &["-N", "-B", "-e", statement],
            Io::None,
        )
        .await
    }
}

#[async_trait]
impl DatabaseAdapter for DockerExecAdapter {
    async fn list_databases(
        &self,
        container: &DatabaseContainer,
        creds: &DatabaseCredentials,
    ) -> Result<Vec<String>> {
        let output = self.sql(container, creds, "SHOW DATABASES;").await?;
        Ok(parse_database_list(&output))
    }

    async fn dump_database(
        &self,
        container: &DatabaseContainer,
        creds: &DatabaseCredentials,
        name: &str,
        dest: &Path,
    ) -> Result<()> {
        self.exec(
            container,
            creds,
            container.engine.dump_binaries(),
            &[
                "--single-transaction",
                "--routines",
                "--triggers",
                "--databases",
                name,
            ],
            Io::StdoutTo(dest),
        )
        .await?;
        Ok(())
    }

    async fn import_database(
        &self,
        container: &DatabaseContainer,
        creds: &DatabaseCredentials,
        name: &str,
        sql_path: &Path,
    ) -> Result<()> {
        let db = quote_identifier(name);
        let recreate = format!("DROP DATABASE IF EXISTS {db}; CREATE DATABASE {db};");
        self.sql(container, creds, &recreate).await?;

        self.exec(
            container,
            creds,
            container.engine.client_binaries(),
            &[name],
            Io::StdinFrom(sql_path),
        )
        .await?;
        Ok(())
    }

    async fn ping(&self, container: &DatabaseContainer, creds: &DatabaseCredentials) -> Result<()> {
        self.sql(container, creds, "SELECT 1;").await?;
        Ok(())
    }
}
