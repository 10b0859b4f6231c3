/// Filesystem snapshot and restore of the configured source trees
///
/// Each source path is staged under its logical name, never its leaf
/// directory name, so two sources ending in the same directory name cannot
/// collide.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::core::error::{Error, IoContext, Result};

/// Child names skipped while copying one source tree.
///
/// Patterns match a single path component; `*` matches any run of characters.
/// Applied at every depth of the tree it belongs to and nowhere else.
#[derive(Debug, Clone, Default)]
pub struct ExclusionRule {
    patterns: Vec<String>,
    matchers: Vec<Regex>,
}

impl ExclusionRule {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let matchers = patterns
            .iter()
            .map(|p| {
                let escaped = regex::escape(p).replace(r"\*", ".*");
                Regex::new(&format!("^{}$", escaped))
                    .map_err(|e| Error::Config(format!("invalid exclude pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns, matchers })
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    fn matches(&self, name: &OsStr) -> bool {
        let name = name.to_string_lossy();
        self.matchers.iter().any(|m| m.is_match(&name))
    }

    /// The subset of `names` (children of `parent`) to skip
    pub fn ignored(&self, _parent: &Path, names: &[OsString]) -> HashSet<OsString> {
        names.iter().filter(|n| self.matches(n)).cloned().collect()
    }

    pub fn is_excluded(&self, parent: &Path, name: &OsStr) -> bool {
        !self.ignored(parent, &[name.to_os_string()]).is_empty()
    }
}

/// One configured source tree
#[derive(Debug, Clone)]
pub struct SourcePath {
    pub name: String,
    pub path: PathBuf,
    pub exclusions: ExclusionRule,
    /// Recreate symlinks as links instead of copying their targets
    pub preserve_symlinks: bool,
}

impl SourcePath {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            exclusions: ExclusionRule::none(),
            preserve_symlinks: false,
        }
    }

    pub fn with_exclusions(mut self, exclusions: ExclusionRule) -> Self {
        self.exclusions = exclusions;
        self
    }

    pub fn with_preserve_symlinks(mut self, preserve: bool) -> Self {
        self.preserve_symlinks = preserve;
        self
    }
}

/// Logical name -> absolute path mapping with unique, path-safe names
#[derive(Debug, Clone, Default)]
pub struct SourcePathSet {
    sources: Vec<SourcePath>,
}

impl SourcePathSet {
    pub fn new(sources: Vec<SourcePath>) -> Result<Self> {
        let mut seen = HashSet::new();
        for source in &sources {
            validate_logical_name(&source.name)?;
            if !seen.insert(source.name.clone()) {
                return Err(Error::Config(format!("duplicate source name '{}'", source.name)));
            }
            if !source.path.is_absolute() {
                return Err(Error::Config(format!(
                    "source '{}' path '{}' must be absolute",
                    source.name,
                    source.path.display()
                )));
            }
        }
        Ok(Self { sources })
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourcePath> {
        self.sources.iter()
    }

    pub fn get(&self, name: &str) -> Option<&SourcePath> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// A logical name must be a single normal path component
pub fn validate_logical_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains('/') => Ok(()),
        _ => Err(Error::Config(format!("invalid source name '{}'", name))),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes: u64,
    pub skipped: u64,
}

impl CopyStats {
    fn absorb(&mut self, other: &CopyStats) {
        self.files += other.files;
        self.dirs += other.dirs;
        self.symlinks += other.symlinks;
        self.bytes += other.bytes;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Default, Clone)]
pub struct SnapshotReport {
    pub copied: Vec<String>,
    pub missing: Vec<(String, PathBuf)>,
    pub stats: CopyStats,
}

#[derive(Debug, Default, Clone)]
pub struct FsRestoreReport {
    pub restored: Vec<String>,
    /// Configured but absent from the archive; destination left untouched
    pub not_in_archive: Vec<String>,
    /// Present in the archive but not configured; ignored
    pub unknown: Vec<String>,
}

/// Copy a tree, realizing symlinked content unless `preserve_symlinks` is set.
///
/// Dangling links and link loops are skipped with a warning; any other
/// read or write error aborts the copy.
pub fn copy_tree(
    src: &Path,
    dst: &Path,
    exclusions: &ExclusionRule,
    preserve_symlinks: bool,
) -> Result<CopyStats> {
    let mut stats = CopyStats::default();

    let walker = WalkDir::new(src)
        .follow_links(!preserve_symlinks)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || exclusions.is_empty() {
                return true;
            }
            let parent = entry.path().parent().unwrap_or(src);
            let keep = !exclusions.is_excluded(parent, entry.file_name());
            if !keep {
                tracing::debug!("Excluding {}", entry.path().display());
            }
            keep
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| src.to_path_buf());
                let dangling = e
                    .io_error()
                    .map(|io| io.kind() == std::io::ErrorKind::NotFound)
                    .unwrap_or(false);
                if e.loop_ancestor().is_some() || dangling {
                    tracing::warn!("Skipping unreadable link {}: {}", path.display(), e);
                    stats.skipped += 1;
                    continue;
                }
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "walk error"));
                return Err(Error::io_at(path, source));
            }
        };

        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Other(format!("path outside source tree: {}", e)))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).at_path(&target)?;
            if let Ok(meta) = entry.metadata() {
                let _ = fs::set_permissions(&target, meta.permissions());
            }
            stats.dirs += 1;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).at_path(entry.path())?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).at_path(parent)?;
            }
            std::os::unix::fs::symlink(&link, &target).at_path(&target)?;
            stats.symlinks += 1;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).at_path(parent)?;
            }
            stats.bytes += fs::copy(entry.path(), &target).at_path(entry.path())?;
            stats.files += 1;
        } else {
            // sockets, fifos, devices
            tracing::debug!("Skipping special file {}", entry.path().display());
            stats.skipped += 1;
        }
    }

    Ok(stats)
}

/// Copy every existing source into `staging_dir/<logical name>`
pub fn snapshot(sources: &SourcePathSet, staging_dir: &Path) -> Result<SnapshotReport> {
    fs::create_dir_all(staging_dir).at_path(staging_dir)?;
    let mut report = SnapshotReport::default();

    for source in sources.iter() {
        if !source.path.exists() {
            tracing::warn!("Path not found, skipping: {}", source.path.display());
            report.missing.push((source.name.clone(), source.path.clone()));
            continue;
        }

        tracing::info!("Copying '{}' to backup as '{}'", source.path.display(), source.name);
        let destination = staging_dir.join(&source.name);
        let stats = copy_tree(&source.path, &destination, &source.exclusions, source.preserve_symlinks)?;
        tracing::debug!("Copied {} files ({} bytes) from {}", stats.files, stats.bytes, source.name);

        report.stats.absorb(&stats);
        report.copied.push(source.name.clone());
    }

    Ok(report)
}

fn remove_existing(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io_at(path, e)),
    };

    if meta.is_dir() {
        fs::remove_dir_all(path).at_path(path)
    } else {
        fs::remove_file(path).at_path(path)
    }
}

/// Replace each configured destination with its staged tree.
///
/// Destructive: an existing destination is deleted in full before the copy.
/// Only names present in the staging area are touched. Must only run while
/// the services are stopped.
pub fn restore(staging_dir: &Path, sources: &SourcePathSet) -> Result<FsRestoreReport> {
    let mut report = FsRestoreReport::default();

    if staging_dir.is_dir() {
        for entry in fs::read_dir(staging_dir).at_path(staging_dir)? {
            let name = entry.at_path(staging_dir)?.file_name().to_string_lossy().to_string();
            if sources.get(&name).is_none() {
                tracing::warn!("Backup contains unknown tree '{}', ignoring it", name);
                report.unknown.push(name);
            }
        }
        report.unknown.sort();
    }

    for source in sources.iter() {
        let staged = staging_dir.join(&source.name);
        if !staged.exists() {
            tracing::warn!(
                "Did not find '{}' in backup. Skipping restore for '{}'.",
                source.name,
                source.path.display()
            );
            report.not_in_archive.push(source.name.clone());
            continue;
        }

        if fs::symlink_metadata(&source.path).is_ok() {
            tracing::warn!("Removing existing directory: {}", source.path.display());
            remove_existing(&source.path)?;
        }
        if let Some(parent) = source.path.parent() {
            fs::create_dir_all(parent).at_path(parent)?;
        }

        tracing::info!("Restoring '{}' to '{}'", source.name, source.path.display());
        copy_tree(&staged, &source.path, &ExclusionRule::none(), source.preserve_symlinks)?;
        report.restored.push(source.name.clone());
    }

    Ok(report)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::{APP_CONFIG_NAME, APP_STATE_EXCLUDES, APP_STATE_NAME};

    pub(crate) fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    /// A miniature /var/lib/marzban and /opt/marzban
    pub(crate) fn sample_installation(root: &Path) -> SourcePathSet {
        let state = root.join("var/lib/marzban");
        write(&state.join("db.sqlite3"), "sqlite bytes");
        write(&state.join("certs/panel.pem"), "-----BEGIN CERT-----");
        write(&state.join("mysql/ibdata1"), "live innodb pages");
        write(&state.join("mysql/marzban/users.ibd"), "live table");
        write(&state.join("logs/access.log"), "GET /");
        write(&state.join("xray/logs/error.log"), "nested log");
        write(&state.join("mysql.sock.lock"), "12");

        let config = root.join("opt/marzban");
        write(&config.join("settings.json"), "{\"port\": 8000}");
        write(&config.join(".env"), "MYSQL_ROOT_PASSWORD=secret");
        write(&config.join("docker-compose.yml"), "services: {}");

        SourcePathSet::new(vec![
            SourcePath::new(APP_STATE_NAME, state)
                .with_exclusions(ExclusionRule::new(APP_STATE_EXCLUDES.iter().copied()).unwrap()),
            SourcePath::new(APP_CONFIG_NAME, config),
        ])
        .unwrap()
    }

    pub(crate) fn collect_files(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        let mut files: Vec<(PathBuf, Vec<u8>)> = WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
                (rel, fs::read(e.path()).unwrap())
            })
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_snapshot_applies_exclusions_only_to_app_state() {
        let install = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let sources = sample_installation(install.path());
        // same child names in the config tree must survive
        write(&install.path().join("opt/marzban/logs/keep.txt"), "kept");

        let report = snapshot(&sources, staging.path()).unwrap();

        assert_eq!(report.copied, vec![APP_STATE_NAME, APP_CONFIG_NAME]);
        let state: Vec<PathBuf> = collect_files(&staging.path().join(APP_STATE_NAME))
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        assert_eq!(
            state,
            vec![PathBuf::from("certs/panel.pem"), PathBuf::from("db.sqlite3")]
        );
        for path in &state {
            let first = path.components().next().unwrap().as_os_str().to_string_lossy().to_string();
            assert!(!APP_STATE_EXCLUDES.contains(&first.as_str()));
            assert!(!path.components().any(|c| c.as_os_str() == "logs" || c.as_os_str() == "mysql"));
        }
        assert!(staging.path().join(APP_CONFIG_NAME).join("logs/keep.txt").is_file());
    }

    #[test]
    fn test_snapshot_skips_missing_paths() {
        let staging = tempfile::tempdir().unwrap();
        let sources = SourcePathSet::new(vec![SourcePath::new("app-state", "/nonexistent/marzban")]).unwrap();

        let report = snapshot(&sources, staging.path()).unwrap();

        assert!(report.copied.is_empty());
        assert_eq!(report.missing.len(), 1);
        assert!(!staging.path().join("app-state").exists());
    }

    #[test]
    fn test_same_leaf_names_do_not_collide() {
        let install = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        write(&install.path().join("var/lib/marzban/a.txt"), "state");
        write(&install.path().join("opt/marzban/a.txt"), "config");
        let sources = SourcePathSet::new(vec![
            SourcePath::new("var_lib_marzban", install.path().join("var/lib/marzban")),
            SourcePath::new("opt_marzban", install.path().join("opt/marzban")),
        ])
        .unwrap();

        snapshot(&sources, staging.path()).unwrap();

        assert_eq!(fs::read_to_string(staging.path().join("var_lib_marzban/a.txt")).unwrap(), "state");
        assert_eq!(fs::read_to_string(staging.path().join("opt_marzban/a.txt")).unwrap(), "config");
    }

    #[test]
    fn test_symlinks_are_realized_by_default() {
        let install = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let tree = install.path().join("tree");
        write(&install.path().join("outside/real.txt"), "target content");
        fs::create_dir_all(&tree).unwrap();
        std::os::unix::fs::symlink(install.path().join("outside/real.txt"), tree.join("link.txt")).unwrap();
        std::os::unix::fs::symlink(install.path().join("gone.txt"), tree.join("dangling.txt")).unwrap();
        let sources = SourcePathSet::new(vec![SourcePath::new("tree", &tree)]).unwrap();

        let report = snapshot(&sources, staging.path()).unwrap();

        let copied = staging.path().join("tree/link.txt");
        assert!(!fs::symlink_metadata(&copied).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&copied).unwrap(), "target content");
        assert!(!staging.path().join("tree/dangling.txt").exists());
        assert_eq!(report.stats.skipped, 1);
    }

    #[test]
    fn test_symlinks_preserved_when_configured() {
        let install = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let tree = install.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        std::os::unix::fs::symlink("relative/target", tree.join("link")).unwrap();
        let sources =
            SourcePathSet::new(vec![SourcePath::new("tree", &tree).with_preserve_symlinks(true)]).unwrap();

        snapshot(&sources, staging.path()).unwrap();

        let link = staging.path().join("tree/link");
        assert_eq!(fs::read_link(link).unwrap(), PathBuf::from("relative/target"));
    }

    #[test]
    fn test_restore_replaces_instead_of_merging() {
        let install = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let sources = sample_installation(install.path());
        snapshot(&sources, staging.path()).unwrap();

        let config = install.path().join("opt/marzban");
        write(&config.join("stale.json"), "left over");
        write(&config.join("settings.json"), "{\"port\": 1}");

        let report = restore(staging.path(), &sources).unwrap();

        assert_eq!(report.restored, vec![APP_STATE_NAME, APP_CONFIG_NAME]);
        assert!(!config.join("stale.json").exists());
        assert_eq!(fs::read_to_string(config.join("settings.json")).unwrap(), "{\"port\": 8000}");
        // live database files are gone too: the engine reinitializes from dumps
        assert!(!install.path().join("var/lib/marzban/mysql").exists());
    }

    #[test]
    fn test_restore_never_deletes_without_replacement() {
        let install = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let sources = sample_installation(install.path());
        write(&staging.path().join(APP_CONFIG_NAME).join("settings.json"), "restored");
        write(&staging.path().join("foreign").join("x"), "unknown tree");

        let report = restore(staging.path(), &sources).unwrap();

        assert_eq!(report.restored, vec![APP_CONFIG_NAME]);
        assert_eq!(report.not_in_archive, vec![APP_STATE_NAME]);
        assert_eq!(report.unknown, vec!["foreign"]);
        assert!(install.path().join("var/lib/marzban/db.sqlite3").is_file());
        assert!(install.path().join("var/lib/marzban/mysql/ibdata1").is_file());
    }

    #[test]
    fn test_source_set_validation() {
        assert!(SourcePathSet::new(vec![
            SourcePath::new("a", "/x"),
            SourcePath::new("a", "/y"),
        ])
        .is_err());
        assert!(SourcePathSet::new(vec![SourcePath::new("../up", "/x")]).is_err());
        assert!(SourcePathSet::new(vec![SourcePath::new("a/b", "/x")]).is_err());
        assert!(SourcePathSet::new(vec![SourcePath::new("rel", "relative/path")]).is_err());
        assert!(SourcePathSet::new(vec![SourcePath::new("app-state", "/var/lib/marzban")]).is_ok());
    }

    #[test]
    fn test_exclusion_rule_wildcards() {
        let rule = ExclusionRule::new(["mysql", "*.sock", "logs"]).unwrap();
        let names: Vec<OsString> = ["mysql", "mysql.sock", "mysqlx", "logs", "db.sqlite3"]
            .iter()
            .map(OsString::from)
            .collect();

        let ignored = rule.ignored(Path::new("/var/lib/marzban"), &names);

        assert_eq!(ignored.len(), 3);
        assert!(ignored.contains(&OsString::from("mysql.sock")));
        assert!(!ignored.contains(&OsString::from("mysqlx")));
    }
}
