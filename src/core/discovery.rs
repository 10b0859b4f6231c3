/// Locates the panel's database container among the host's containers

use regex::Regex;
use serde::Serialize;
use std::fmt;

use crate::core::docker::{ContainerRecord, ContainerRuntime};
use crate::utils::{ContainerState, DATABASE_IMAGE_PATTERN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DbEngine {
    MySql,
    MariaDb,
}

impl DbEngine {
    /// Guess the engine from an image reference
    pub fn from_image(image: &str) -> Option<Self> {
        let image = image.to_lowercase();
        if image.contains("mariadb") {
            Some(DbEngine::MariaDb)
        } else if image.contains("mysql") {
            Some(DbEngine::MySql)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DbEngine::MySql => "mysql",
            DbEngine::MariaDb => "mariadb",
        }
    }

    /// Client binaries to try inside the container, preferred first
    pub fn client_binaries(&self) -> &'static [&'static str] {
        match self {
            DbEngine::MySql => &["mysql"],
            DbEngine::MariaDb => &["mariadb", "mysql"],
        }
    }

    pub fn dump_binaries(&self) -> &'static [&'static str] {
        match self {
            DbEngine::MySql => &["mysqldump"],
            DbEngine::MariaDb => &["mariadb-dump", "mysqldump"],
        }
    }
}

impl fmt::Display for DbEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A database container resolved for one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub engine: DbEngine,
    pub service: Option<String>,
    #[serde(skip)]
    pub state: ContainerState,
}

impl DatabaseContainer {
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Reference usable with `docker exec`
    pub fn exec_target(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Compose service to address for lifecycle commands
    pub fn service_name(&self) -> &str {
        self.service.as_deref().unwrap_or(&self.name)
    }

    fn from_record(record: ContainerRecord) -> Option<Self> {
        let engine = DbEngine::from_image(&record.image)?;
        Some(Self {
            id: record.id,
            name: record.name,
            image: record.image,
            engine,
            service: record.service,
            state: record.state,
        })
    }
}

pub fn database_image_pattern() -> Regex {
    Regex::new(DATABASE_IMAGE_PATTERN).expect("database image pattern is a valid regex")
}

/// Pick the database container from a container list.
///
/// Prefers a match whose name contains `app_token`, otherwise the first match.
pub fn select_database_container(
    containers: Vec<ContainerRecord>,
    app_token: &str,
) -> Option<DatabaseContainer> {
    let pattern = database_image_pattern();
    let token = app_token.to_lowercase();

    let candidates: Vec<ContainerRecord> = containers
        .into_iter()
        .filter(|c| pattern.is_match(&c.image))
        .collect();

    let preferred = candidates
        .iter()
        .position(|c| !token.is_empty() && c.name.to_lowercase().contains(&token))
        .unwrap_or(0);

    candidates
        .into_iter()
        .nth(preferred)
        .and_then(DatabaseContainer::from_record)
}

/// Find the database container. Absence is a normal outcome, reported as None.
pub async fn find_database_container(
    runtime: &dyn ContainerRuntime,
    include_stopped: bool,
    app_token: &str,
) -> Option<DatabaseContainer> {
    match runtime.list_containers(include_stopped).await {
        Ok(containers) => select_database_container(containers, app_token),
        Err(e) => {
            tracing::warn!("Could not list containers: {}", e);
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::docker::MockContainerRuntime;
    use crate::core::error::Error;

    pub(crate) fn record(name: &str, image: &str, state: ContainerState) -> ContainerRecord {
        ContainerRecord {
            id: format!("{}-id", name),
            name: name.to_string(),
            image: image.to_string(),
            state,
            service: Some(name.rsplit('-').nth(1).unwrap_or(name).to_string()),
        }
    }

    #[test]
    fn test_prefers_container_named_after_app() {
        let containers = vec![
            record("other-mysql-1", "mysql:8.0", ContainerState::Running),
            record("marzban-mysql-1", "mysql:8.0", ContainerState::Running),
            record("marzban-marzban-1", "gozargah/marzban:latest", ContainerState::Running),
        ];

        let found = select_database_container(containers, "marzban").unwrap();

        assert_eq!(found.name, "marzban-mysql-1");
        assert_eq!(found.engine, DbEngine::MySql);
        assert_eq!(found.service_name(), "mysql");
    }

    #[test]
    fn test_falls_back_to_first_match() {
        let containers = vec![
            record("web-1", "nginx:latest", ContainerState::Running),
            record("shop-mariadb-1", "mariadb:lts", ContainerState::Stopped),
            record("blog-mysql-1", "mysql:5.7", ContainerState::Running),
        ];

        let found = select_database_container(containers, "marzban").unwrap();

        assert_eq!(found.name, "shop-mariadb-1");
        assert_eq!(found.engine, DbEngine::MariaDb);
        assert!(!found.is_running());
    }

    #[test]
    fn test_no_match_is_none() {
        let containers = vec![record("marzban-marzban-1", "gozargah/marzban", ContainerState::Running)];
        assert!(select_database_container(containers, "marzban").is_none());
        assert!(select_database_container(Vec::new(), "marzban").is_none());
    }

    #[test]
    fn test_engine_from_image() {
        assert_eq!(DbEngine::from_image("MariaDB:10.11"), Some(DbEngine::MariaDb));
        assert_eq!(DbEngine::from_image("mysql/mysql-server"), Some(DbEngine::MySql));
        assert_eq!(DbEngine::from_image("postgres:16"), None);
    }

    #[tokio::test]
    async fn test_runtime_error_is_reported_as_absence() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_containers()
            .times(1)
            .returning(|_| Err(Error::Other("daemon unreachable".to_string())));

        assert!(find_database_container(&runtime, true, "marzban").await.is_none());
    }
}
