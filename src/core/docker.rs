/// Docker and Docker Compose integration
///
/// Lists containers through the Docker API and drives the panel's service
/// group through the compose CLI in its installation directory

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerSummary;
use bollard::Docker;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::core::discovery::database_image_pattern;
use crate::core::error::{Error, Result};
use crate::utils::{ContainerState, COMPOSE_SERVICE_LABEL, COMPOSE_VARIANTS, DEFAULT_COMPOSE_FILE};

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    /// Compose service the container belongs to, if compose created it
    pub service: Option<String>,
}

/// Read access to the container runtime
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers; stopped ones too when `include_stopped` is set
    async fn list_containers(&self, include_stopped: bool) -> Result<Vec<ContainerRecord>>;
}

#[derive(Clone)]
pub struct DockerManager {
    docker: Docker,
}

impl DockerManager {
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Check if Docker daemon is accessible
    pub async fn check_docker(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    /// Convert ContainerSummary to ContainerRecord
    fn summary_to_record(summary: ContainerSummary) -> ContainerRecord {
        let name = summary
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let state = summary
            .state
            .as_deref()
            .unwrap_or("unknown")
            .into();

        let service = summary
            .labels
            .as_ref()
            .and_then(|labels| labels.get(COMPOSE_SERVICE_LABEL))
            .cloned();

        ContainerRecord {
            id: summary.id.unwrap_or_default(),
            name,
            image: summary.image.unwrap_or_else(|| "unknown".to_string()),
            state,
            service,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerManager {
    async fn list_containers(&self, include_stopped: bool) -> Result<Vec<ContainerRecord>> {
        let options = Some(ListContainersOptions::<String> {
            all: include_stopped,
            ..Default::default()
        });

        let containers = self.docker.list_containers(options).await?;

        Ok(containers.into_iter().map(Self::summary_to_record).collect())
    }
}

/// Lifecycle actions on the managed service group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAction {
    /// Start every service, detached
    Up,
    /// Stop and remove every service
    Down,
    /// Start one service alone, detached
    UpService(String),
}

impl ServiceAction {
    pub fn compose_args(&self) -> Vec<&str> {
        match self {
            ServiceAction::Up => vec!["up", "-d"],
            ServiceAction::Down => vec!["down"],
            ServiceAction::UpService(service) => vec!["up", "-d", service.as_str()],
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.compose_args().join(" "))
    }
}

/// Starts and stops the service group
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Run a lifecycle action. Never fails loudly: returns false and logs stderr.
    async fn run_service_command(&self, action: &ServiceAction) -> bool;

    /// Service whose image is a database engine, from the service definitions
    fn database_service(&self) -> Option<String>;
}

/// Runs compose in the installation directory
#[derive(Debug, Clone)]
pub struct ComposeController {
    project_dir: PathBuf,
    variants: Vec<Vec<String>>,
}

impl ComposeController {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let variants = COMPOSE_VARIANTS
            .iter()
            .map(|v| v.iter().map(|s| s.to_string()).collect())
            .collect();
        Self::with_variants(project_dir, variants)
    }

    /// Use explicit compose invocations, tried in order
    pub fn with_variants(project_dir: impl Into<PathBuf>, variants: Vec<Vec<String>>) -> Self {
        Self {
            project_dir: project_dir.into(),
            variants,
        }
    }

    /// Execute a compose command, falling back through the known invocations
    pub async fn compose_command(&self, args: &[&str]) -> Result<String> {
        if !self.project_dir.is_dir() {
            return Err(Error::Config(format!(
                "Service directory '{}' not found. Is the panel installed?",
                self.project_dir.display()
            )));
        }

        let mut last_error = None;

        for variant in &self.variants {
            let Some((program, base)) = variant.split_first() else {
                continue;
            };
            let command_line = format!("{} {}", variant.join(" "), args.join(" "));
            tracing::info!("Running command: {}", command_line);

            let output = Command::new(program)
                .args(base)
                .args(args)
                .current_dir(&self.project_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await;

            match output {
                Ok(output) if output.status.success() => {
                    return Ok(String::from_utf8_lossy(&output.stdout).to_string());
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    tracing::warn!("Command with '{}' failed: {}", variant.join(" "), stderr);
                    last_error = Some(Error::CommandFailed {
                        command: command_line,
                        stderr,
                    });
                }
                Err(e) => {
                    tracing::warn!("Command with '{}' failed: {}", variant.join(" "), e);
                    last_error = Some(Error::CommandFailed {
                        command: command_line,
                        stderr: e.to_string(),
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Other("No compose command configured".to_string())))
    }

    /// Find the compose service whose image looks like a database engine
    pub fn find_database_service(&self, image_pattern: &Regex) -> Result<Option<(String, String)>> {
        let compose_file = self.project_dir.join(DEFAULT_COMPOSE_FILE);
        if !compose_file.exists() {
            return Ok(None);
        }

        let services = parse_compose_images(&compose_file)?;
        let mut matches: Vec<(String, String)> = services
            .into_iter()
            .filter(|(_, image)| image_pattern.is_match(image))
            .collect();
        matches.sort();

        Ok(matches.into_iter().next())
    }
}

#[async_trait]
impl ServiceController for ComposeController {
    async fn run_service_command(&self, action: &ServiceAction) -> bool {
        match self.compose_command(&action.compose_args()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Could not run '{}': {}", action, e);
                false
            }
        }
    }

    fn database_service(&self) -> Option<String> {
        match self.find_database_service(&database_image_pattern()) {
            Ok(found) => found.map(|(service, _)| service),
            Err(e) => {
                tracing::warn!("Could not read compose file: {}", e);
                None
            }
        }
    }
}

/// Parse docker-compose.yml into service name -> image
fn parse_compose_images(compose_file: &Path) -> Result<HashMap<String, String>> {
    use serde_yaml::Value;

    let content = std::fs::read_to_string(compose_file)
        .map_err(|e| Error::io_at(compose_file, e))?;

    let yaml: Value = serde_yaml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", compose_file.display(), e)))?;

    let mut services = HashMap::new();

    if let Some(services_map) = yaml.get("services").and_then(|s| s.as_mapping()) {
        for (service_name, service_config) in services_map {
            let Some(name) = service_name.as_str() else {
                continue;
            };
            if let Some(image) = service_config.get("image").and_then(|i| i.as_str()) {
                services.insert(name.to_string(), image.to_string());
            }
        }
    }

    Ok(services)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a shell script standing in for a CLI tool; returns the `sh <script>` invocation
    pub(crate) fn fake_tool(dir: &Path, name: &str, body: &str) -> Vec<String> {
        let path = dir.join(name);
        std::fs::write(&path, format!("{}\n", body)).unwrap();
        vec!["sh".to_string(), path.to_string_lossy().to_string()]
    }

    #[test]
    fn test_service_action_args() {
        assert_eq!(ServiceAction::Up.compose_args(), vec!["up", "-d"]);
        assert_eq!(ServiceAction::Down.compose_args(), vec!["down"]);
        assert_eq!(
            ServiceAction::UpService("mysql".to_string()).to_string(),
            "up -d mysql"
        );
    }

    #[test]
    fn test_summary_to_record_reads_compose_label() {
        let mut labels = HashMap::new();
        labels.insert(COMPOSE_SERVICE_LABEL.to_string(), "mysql".to_string());

        let record = DockerManager::summary_to_record(ContainerSummary {
            id: Some("abc123".to_string()),
            names: Some(vec!["/marzban-mysql-1".to_string()]),
            image: Some("mysql:8.0".to_string()),
            state: Some("running".to_string()),
            labels: Some(labels),
            ..Default::default()
        });

        assert_eq!(record.name, "marzban-mysql-1");
        assert_eq!(record.service.as_deref(), Some("mysql"));
        assert!(record.state.is_running());
    }

    #[tokio::test]
    async fn test_down_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls.log");
        let tool = fake_tool(
            dir.path(),
            "compose",
            &format!("echo \"$@\" >> {}\nexit 0", calls.display()),
        );
        let controller = ComposeController::with_variants(dir.path(), vec![tool]);

        assert!(controller.run_service_command(&ServiceAction::Down).await);
        assert!(controller.run_service_command(&ServiceAction::Down).await);

        let log = std::fs::read_to_string(&calls).unwrap();
        assert_eq!(log.lines().collect::<Vec<_>>(), vec!["down", "down"]);
    }

    #[tokio::test]
    async fn test_falls_back_to_second_variant() {
        let dir = tempfile::tempdir().unwrap();
        let broken = fake_tool(dir.path(), "plugin", "echo 'unknown command' >&2\nexit 1");
        let legacy = fake_tool(dir.path(), "legacy", "exit 0");
        let controller = ComposeController::with_variants(dir.path(), vec![broken, legacy]);

        assert!(controller.run_service_command(&ServiceAction::Up).await);
    }

    #[tokio::test]
    async fn test_all_variants_failing_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let broken = fake_tool(dir.path(), "compose", "echo 'no such service' >&2\nexit 1");
        let controller = ComposeController::with_variants(dir.path(), vec![broken]);

        assert!(!controller.run_service_command(&ServiceAction::Up).await);
        match controller.compose_command(&["up", "-d"]).await {
            Err(Error::CommandFailed { stderr, .. }) => assert_eq!(stderr, "no such service"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_service_dir_returns_false() {
        let controller = ComposeController::new("/nonexistent/marzban");
        assert!(!controller.run_service_command(&ServiceAction::Down).await);
    }

    #[test]
    fn test_find_database_service_from_compose_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(DEFAULT_COMPOSE_FILE),
            "services:\n  marzban:\n    image: gozargah/marzban:latest\n  mariadb:\n    image: mariadb:lts\n",
        )
        .unwrap();
        let controller = ComposeController::new(dir.path());
        let pattern = Regex::new(crate::utils::DATABASE_IMAGE_PATTERN).unwrap();

        let found = controller.find_database_service(&pattern).unwrap();

        assert_eq!(found, Some(("mariadb".to_string(), "mariadb:lts".to_string())));
    }
}
