/// Size-bounded log file for the tracing file layer

use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use std::path::Path;

/// Appending writer that rolls `path` over to `path.1 .. path.<keep>` once it
/// reaches `max_bytes`; the oldest file is dropped
pub fn rotating_log(path: &Path, max_bytes: usize, keep: usize) -> std::io::Result<FileRotate<AppendCount>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    Ok(FileRotate::new(
        path,
        AppendCount::new(keep),
        ContentLimit::Bytes(max_bytes),
        Compression::None,
        #[cfg(unix)]
        Some(0o600),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rotation_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("backup.log");

        let mut log = rotating_log(&path, 100, 2).unwrap();
        for i in 0..100 {
            writeln!(log, "line {:04} of the run log", i).unwrap();
        }
        log.flush().unwrap();
        drop(log);

        let mut names: Vec<String> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();

        assert_eq!(names, vec!["backup.log", "backup.log.1", "backup.log.2"]);
        for name in &names {
            let size = std::fs::metadata(path.parent().unwrap().join(name)).unwrap().len();
            assert!(size <= 100, "{} is {} bytes", name, size);
        }
    }
}
