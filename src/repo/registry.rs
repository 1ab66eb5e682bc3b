//! Registry of open repositories
//!
//! Maps any path inside a repository to its root and hands out
//! reference-counted handles to one shared `LocalRepoManager` per root.
//! A manager whose last handle was closed stays open for
//! `idle_close_delay` so that back-to-back sessions do not reopen the
//! store; `evict_idle()` closes the expired ones.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use uuid::Uuid;

use super::{is_repository_root, LocalRepoManager};
use crate::config::Config;
use crate::error::RepoError;
use crate::logging::*;

struct OpenRepo {
	manager: Arc<LocalRepoManager>,
	handles: usize,
	idle_since: Option<Instant>,
}

struct Shared {
	config: Arc<Config>,
	repos: Mutex<HashMap<PathBuf, OpenRepo>>,
}

#[derive(Clone)]
pub struct RepoRegistry {
	shared: Arc<Shared>,
}

impl RepoRegistry {
	pub fn new(config: Arc<Config>) -> Self {
		RepoRegistry { shared: Arc::new(Shared { config, repos: Mutex::new(HashMap::new()) }) }
	}

	pub fn config(&self) -> Arc<Config> {
		self.shared.config.clone()
	}

	fn repos(&self) -> MutexGuard<'_, HashMap<PathBuf, OpenRepo>> {
		self.shared.repos.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Root of the repository containing `path`
	pub fn resolve_root(&self, path: &Path) -> Result<PathBuf, RepoError> {
		let canonical = path.canonicalize().map_err(|_| RepoError::NotFound { path: path.to_path_buf() })?;
		canonical
			.ancestors()
			.find(|dir| is_repository_root(dir, &self.shared.config))
			.map(Path::to_path_buf)
			.ok_or(RepoError::NotFound { path: canonical.clone() })
	}

	/// Id of the repository containing `path`
	pub fn repository_id(&self, path: &Path) -> Result<Uuid, RepoError> {
		let handle = self.open(path)?;
		Ok(handle.repository_id())
	}

	/// Create a new repository at `root` and return a handle to it
	pub fn create(&self, root: &Path) -> Result<RepoHandle, RepoError> {
		let manager = LocalRepoManager::create(root, self.config())?;
		let root = manager.root().to_path_buf();
		let manager = Arc::new(manager);
		self.repos().insert(root.clone(), OpenRepo { manager: manager.clone(), handles: 1, idle_since: None });
		Ok(RepoHandle { registry: self.clone(), root, manager, closed: false })
	}

	/// Handle to the repository containing `path`, opening it if needed
	pub fn open(&self, path: &Path) -> Result<RepoHandle, RepoError> {
		let root = self.resolve_root(path)?;
		let mut repos = self.repos();
		if let Some(open) = repos.get_mut(&root) {
			open.handles += 1;
			open.idle_since = None;
			let manager = open.manager.clone();
			return Ok(RepoHandle { registry: self.clone(), root, manager, closed: false });
		}

		let manager = Arc::new(LocalRepoManager::open(&root, self.config())?);
		repos.insert(root.clone(), OpenRepo { manager: manager.clone(), handles: 1, idle_since: None });
		Ok(RepoHandle { registry: self.clone(), root, manager, closed: false })
	}

	fn release(&self, root: &Path) {
		let mut repos = self.repos();
		let close_now = match repos.get_mut(root) {
			Some(open) => {
				open.handles = open.handles.saturating_sub(1);
				if open.handles == 0 {
					open.idle_since = Some(Instant::now());
				}
				open.handles == 0 && self.shared.config.idle_close_delay_ms == 0
			}
			None => false,
		};
		if close_now {
			repos.remove(root);
			debug!("Closed repository {}", root.display());
		}
	}

	/// Close managers that have been idle for at least the configured delay
	pub fn evict_idle(&self) -> usize {
		let delay = self.shared.config.idle_close_delay();
		self.evict(|idle| idle.elapsed() >= delay)
	}

	/// Close every manager without open handles
	pub fn close_all_idle(&self) -> usize {
		self.evict(|_| true)
	}

	fn evict<F: Fn(Instant) -> bool>(&self, expired: F) -> usize {
		let mut repos = self.repos();
		let before = repos.len();
		repos.retain(|root, open| match open.idle_since {
			Some(idle) if open.handles == 0 && expired(idle) => {
				debug!("Closing idle repository {}", root.display());
				false
			}
			_ => true,
		});
		before - repos.len()
	}

	/// Number of managers currently open
	pub fn open_count(&self) -> usize {
		self.repos().len()
	}
}

/// Counted reference to an open repository
///
/// Dropping the handle closes it. The manager itself is closed once no
/// handles remain and the idle delay has passed.
pub struct RepoHandle {
	registry: RepoRegistry,
	root: PathBuf,
	manager: Arc<LocalRepoManager>,
	closed: bool,
}

impl RepoHandle {
	/// Manager for use inside blocking tasks
	pub fn shared(&self) -> Arc<LocalRepoManager> {
		self.manager.clone()
	}

	pub fn close(mut self) {
		self.release();
	}

	fn release(&mut self) {
		if !self.closed {
			self.closed = true;
			self.registry.release(&self.root);
		}
	}
}

impl Deref for RepoHandle {
	type Target = LocalRepoManager;

	fn deref(&self) -> &LocalRepoManager {
		&self.manager
	}
}

impl Drop for RepoHandle {
	fn drop(&mut self) {
		self.release();
	}
}


// vim: ts=4
