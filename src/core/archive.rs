/// Backup archive codec: gzip-compressed tar with a fixed two-member layout
///
/// ```text
/// db_dumps/<database>.sql
/// filesystem/<logical name>/...
/// ```
///
/// Paths are stored relative, with no wrapper directory.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder};

use crate::core::error::{Error, IoContext, Result};
use crate::utils::{ARCHIVE_DB_DIR, ARCHIVE_FS_DIR};

/// Top-level members allowed in an archive
pub const ARCHIVE_MEMBERS: &[&str] = &[ARCHIVE_DB_DIR, ARCHIVE_FS_DIR];

/// Pack the staging directory's `db_dumps/` and `filesystem/` into `archive_path`.
///
/// The archive is written next to its final name and renamed into place once
/// complete; on error nothing is left at either path.
pub fn pack(staging_dir: &Path, archive_path: &Path) -> Result<PathBuf> {
    let partial = partial_path(archive_path);

    match write_archive(staging_dir, &partial) {
        Ok(()) => {
            std::fs::rename(&partial, archive_path).at_path(archive_path)?;
            Ok(archive_path.to_path_buf())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            Err(e)
        }
    }
}

fn partial_path(archive_path: &Path) -> PathBuf {
    let mut name = archive_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    archive_path.with_file_name(name)
}

fn write_archive(staging_dir: &Path, archive_path: &Path) -> Result<()> {
    if let Some(parent) = archive_path.parent() {
        std::fs::create_dir_all(parent).at_path(parent)?;
    }

    let file = File::create(archive_path).at_path(archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);
    // staging already holds realized content; links left there are kept as links
    builder.follow_symlinks(false);

    for member in ARCHIVE_MEMBERS {
        let dir = staging_dir.join(member);
        if dir.is_dir() {
            builder.append_dir_all(member, &dir).at_path(&dir)?;
        }
    }

    let encoder = builder.into_inner().at_path(archive_path)?;
    encoder.finish().at_path(archive_path)?;
    Ok(())
}

/// Normalized relative path of a member, rejecting absolute or escaping paths
fn member_path(raw: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidArchive(format!(
                    "member '{}' escapes the archive root",
                    raw.display()
                )));
            }
        }
    }
    Ok(normalized)
}

fn open_archive(archive_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let file = File::open(archive_path).at_path(archive_path)?;
    Ok(Archive::new(GzDecoder::new(file)))
}

fn unreadable(archive_path: &Path, e: std::io::Error) -> Error {
    Error::InvalidArchive(format!(
        "'{}' is not a readable gzip tar archive: {}",
        archive_path.display(),
        e
    ))
}

/// List member names without extracting
pub fn list_members(archive_path: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = open_archive(archive_path)?;
    let mut members = Vec::new();

    for entry in archive.entries().map_err(|e| unreadable(archive_path, e))? {
        let entry = entry.map_err(|e| unreadable(archive_path, e))?;
        let raw = entry.path().map_err(|e| unreadable(archive_path, e))?.to_path_buf();
        let path = member_path(&raw)?;
        if !path.as_os_str().is_empty() {
            members.push(path);
        }
    }

    Ok(members)
}

/// Check the layout; returns the top-level members present
pub fn validate(archive_path: &Path) -> Result<BTreeSet<String>> {
    let members = list_members(archive_path)?;
    let mut top_level = BTreeSet::new();

    for member in &members {
        let Some(Component::Normal(first)) = member.components().next() else {
            continue;
        };
        let first = first.to_string_lossy().to_string();
        if !ARCHIVE_MEMBERS.contains(&first.as_str()) {
            return Err(Error::InvalidArchive(format!(
                "unexpected member '{}' (expected only {}/ and {}/)",
                member.display(),
                ARCHIVE_DB_DIR,
                ARCHIVE_FS_DIR
            )));
        }
        top_level.insert(first);
    }

    if top_level.is_empty() {
        return Err(Error::InvalidArchive(format!(
            "neither {}/ nor {}/ found in '{}'",
            ARCHIVE_DB_DIR,
            ARCHIVE_FS_DIR,
            archive_path.display()
        )));
    }

    Ok(top_level)
}

/// Validate, then extract into `dest_dir`
pub fn unpack(archive_path: &Path, dest_dir: &Path) -> Result<BTreeSet<String>> {
    let top_level = validate(archive_path)?;

    std::fs::create_dir_all(dest_dir).at_path(dest_dir)?;
    let mut archive = open_archive(archive_path)?;
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(dest_dir)
        .map_err(|e| unreadable(archive_path, e))?;

    Ok(top_level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::tests::{collect_files, sample_installation, write};
    use crate::core::snapshot::{restore, snapshot};
    use crate::utils::{APP_CONFIG_NAME, APP_STATE_NAME};
    use std::io::Write;

    fn tar_gz(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, content) in entries {
            // raw name bytes: the builder would normalize `./` and refuse `..`
            let mut header = tar::Header::new_gnu();
            header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_pack_layout_is_relative_without_wrapper() {
        let staging = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write(&staging.path().join("db_dumps/marzban.sql"), "CREATE DATABASE marzban;");
        write(&staging.path().join("filesystem/app-config/settings.json"), "{}");
        write(&staging.path().join("stray.txt"), "not archived");

        let archive = pack(staging.path(), &out.path().join("backup.tar.gz")).unwrap();

        let members = list_members(&archive).unwrap();
        assert!(members.contains(&PathBuf::from("db_dumps/marzban.sql")));
        assert!(members.contains(&PathBuf::from("filesystem/app-config/settings.json")));
        assert!(members.iter().all(|m| m.starts_with("db_dumps") || m.starts_with("filesystem")));
        assert!(!out.path().join("backup.tar.gz.partial").exists());
    }

    #[test]
    fn test_round_trip_through_snapshot() {
        let install = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let extracted = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let sources = sample_installation(install.path());
        write(&staging.path().join("db_dumps/marzban.sql"), "CREATE DATABASE `marzban`;\nINSERT INTO admins VALUES (1);\n");
        snapshot(&sources, &staging.path().join(ARCHIVE_FS_DIR)).unwrap();
        let config_before = collect_files(&install.path().join("opt/marzban"));

        let archive = pack(staging.path(), &out.path().join("b.tar.gz")).unwrap();
        let members = unpack(&archive, extracted.path()).unwrap();
        std::fs::remove_dir_all(install.path().join("opt/marzban")).unwrap();
        restore(&extracted.path().join(ARCHIVE_FS_DIR), &sources).unwrap();

        assert_eq!(members.into_iter().collect::<Vec<_>>(), vec![ARCHIVE_DB_DIR, ARCHIVE_FS_DIR]);
        assert_eq!(collect_files(&install.path().join("opt/marzban")), config_before);
        assert_eq!(
            collect_files(&install.path().join("var/lib/marzban")),
            collect_files(&staging.path().join(ARCHIVE_FS_DIR).join(APP_STATE_NAME))
        );
        assert_eq!(
            std::fs::read_to_string(extracted.path().join("db_dumps/marzban.sql")).unwrap(),
            "CREATE DATABASE `marzban`;\nINSERT INTO admins VALUES (1);\n"
        );
        assert!(extracted.path().join(ARCHIVE_FS_DIR).join(APP_CONFIG_NAME).join(".env").is_file());
    }

    #[test]
    fn test_unpack_rejects_foreign_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("foreign.tar.gz");
        tar_gz(&archive, &[("home/user/notes.txt", "hello")]);

        let result = unpack(&archive, &dir.path().join("out"));

        assert!(matches!(result, Err(Error::InvalidArchive(_))));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_unpack_rejects_non_gzip_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("garbage.tar.gz");
        File::create(&archive).unwrap().write_all(b"definitely not gzip").unwrap();

        assert!(matches!(validate(&archive), Err(Error::InvalidArchive(_))));
    }

    #[test]
    fn test_unpack_rejects_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("empty.tar.gz");
        tar_gz(&archive, &[]);

        assert!(matches!(validate(&archive), Err(Error::InvalidArchive(_))));
    }

    #[test]
    fn test_accepts_dot_prefixed_members() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("legacy.tar.gz");
        tar_gz(&archive, &[("./db_dumps/marzban.sql", "CREATE DATABASE marzban;")]);

        let members = unpack(&archive, &dir.path().join("out")).unwrap();

        assert!(members.contains(ARCHIVE_DB_DIR));
        assert!(dir.path().join("out/db_dumps/marzban.sql").is_file());
    }

    #[test]
    fn test_unpack_rejects_escaping_member() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.tar.gz");
        tar_gz(
            &archive,
            &[("filesystem/app-config/ok.txt", "ok"), ("../outside.txt", "escape")],
        );

        assert!(matches!(unpack(&archive, &dir.path().join("out")), Err(Error::InvalidArchive(_))));
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[test]
    fn test_member_path_rejects_escapes() {
        assert!(member_path(Path::new("../etc/passwd")).is_err());
        assert!(member_path(Path::new("/etc/passwd")).is_err());
        assert_eq!(
            member_path(Path::new("./filesystem/app-config")).unwrap(),
            PathBuf::from("filesystem/app-config")
        );
    }
}
