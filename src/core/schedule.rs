/// Periodic auto-backup through the user's crontab

use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::core::error::{Error, Result};
use crate::utils::CRON_JOB_MARKER;

/// Cron schedule for an interval in minutes
pub fn cron_expression(interval_minutes: u32) -> Result<String> {
    match interval_minutes {
        0 => Err(Error::Config("backup interval must be at least 1 minute".to_string())),
        m if m < 60 => Ok(format!("*/{} * * * *", m)),
        m if m % 1440 == 0 => Ok(format!("0 0 */{} * *", m / 1440)),
        m if m % 60 == 0 && m < 1440 => Ok(format!("0 */{} * * *", m / 60)),
        m => Err(Error::Config(format!(
            "backup interval of {} minutes cannot be expressed as a cron step (use < 60, whole hours below a day, or whole days)",
            m
        ))),
    }
}

/// The crontab line that runs one backup, tagged with the job marker.
///
/// Output is discarded: the run writes its own rotated log file.
pub fn job_line(schedule: &str, executable: &Path, config_file: &Path) -> String {
    format!(
        "{} {} --config {} run-backup > /dev/null 2>&1 {}",
        schedule,
        cron_quote(executable),
        cron_quote(config_file),
        CRON_JOB_MARKER
    )
}

/// Single-quote a path for the shell cron hands the line to; `%` is a
/// newline to cron unless escaped
fn cron_quote(path: &Path) -> String {
    let quoted = path.display().to_string().replace('\'', "'\\''").replace('%', "\\%");
    format!("'{}'", quoted)
}

/// Drop every line carrying the marker, then append `job` when given
pub fn rewrite_crontab(current: &str, job: Option<&str>) -> String {
    let mut lines: Vec<&str> = current
        .lines()
        .filter(|line| !line.contains(CRON_JOB_MARKER))
        .collect();
    if let Some(job) = job {
        lines.push(job);
    }

    let mut table = lines.join("\n");
    if !table.is_empty() {
        table.push('\n');
    }
    table
}

/// Reads and writes the crontab through the `crontab` CLI
#[derive(Debug, Clone)]
pub struct Crontab {
    command: Vec<String>,
}

impl Default for Crontab {
    fn default() -> Self {
        Self {
            command: vec!["crontab".to_string()],
        }
    }
}

impl Crontab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command(command: Vec<String>) -> Self {
        Self { command }
    }

    fn base(&self) -> Result<Command> {
        let (program, base) = self
            .command
            .split_first()
            .ok_or_else(|| Error::Other("No crontab command configured".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(base);
        Ok(cmd)
    }

    /// Current table; "no crontab for user" reads as empty
    pub async fn read(&self) -> Result<String> {
        let output = self.base()?.arg("-l").stdin(Stdio::null()).output().await?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.to_lowercase().contains("no crontab") {
            Ok(String::new())
        } else {
            Err(Error::CommandFailed {
                command: "crontab -l".to_string(),
                stderr,
            })
        }
    }

    pub async fn write(&self, table: &str) -> Result<()> {
        let mut child = self
            .base()?
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(table.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command: "crontab -".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Replace the marked job with `job`, or remove it when `None`
    pub async fn install(&self, job: Option<&str>) -> Result<()> {
        let current = self.read().await?;
        let updated = rewrite_crontab(&current, job);
        self.write(&updated).await?;

        match job {
            Some(_) => tracing::info!("Auto-backup cron job installed"),
            None => tracing::info!("Auto-backup cron job removed"),
        }
        Ok(())
    }

    /// The installed job line, if any
    pub async fn installed_job(&self) -> Result<Option<String>> {
        let current = self.read().await?;
        Ok(current
            .lines()
            .find(|line| line.contains(CRON_JOB_MARKER))
            .map(str::to_string))
    }
}
