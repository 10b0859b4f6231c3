/// Exclusive run lock: one backup or restore per installation at a time

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::core::error::{Error, IoContext, Result};

/// Held while a run is in progress.
///
/// Exclusion comes from an advisory `flock` on the open file, which the
/// kernel drops when the holder exits, crashed or not. The PID written into
/// the file is only there to name the holder in error messages. The file
/// itself is never removed, so every caller locks the same inode.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).at_path(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .at_path(path)?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(errno) if errno == Errno::EWOULDBLOCK => return Err(Error::Locked(read_pid(&mut file))),
            Err(errno) => return Err(Error::io_at(path, std::io::Error::from(errno))),
        }

        file.set_len(0).at_path(path)?;
        file.seek(SeekFrom::Start(0)).at_path(path)?;
        write!(file, "{}", std::process::id()).at_path(path)?;
        file.flush().at_path(path)?;
        tracing::debug!("Run lock taken: {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // still holding the flock here; closing the file releases it
        if let Err(e) = self.file.set_len(0) {
            tracing::warn!("Could not clear lock {}: {}", self.path.display(), e);
        }
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}
