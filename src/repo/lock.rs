//! Process-exclusive repository lock

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::RepoError;
use crate::logging::*;

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Exclusive OS lock on `<meta dir>/LOCK`, released on drop
#[derive(Debug)]
pub struct RepoLock {
	file: File,
	path: PathBuf,
}

impl RepoLock {
	/// Lock `path`, retrying until `timeout` elapses
	pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, RepoError> {
		let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
		let started = Instant::now();
		loop {
			match file.try_lock_exclusive() {
				Ok(()) => {
					debug!("Locked {}", path.display());
					return Ok(RepoLock { file, path: path.to_path_buf() });
				}
				Err(e) if e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
					let waited = started.elapsed();
					if waited >= timeout {
						return Err(RepoError::LockTimeout { path: path.to_path_buf(), waited });
					}
					thread::sleep(RETRY_INTERVAL.min(timeout - waited));
				}
				Err(e) => return Err(RepoError::Io(e)),
			}
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for RepoLock {
	fn drop(&mut self) {
		if let Err(e) = FileExt::unlock(&self.file) {
			warn!("Failed to unlock {}: {}", self.path.display(), e);
		}
	}
}


// vim: ts=4
