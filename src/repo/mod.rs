//! Local repository management
//!
//! A repository is a directory tree with a metadata directory at its root.
//! The metadata directory holds the lock file and the redb store.

mod lock;
pub mod registry;

pub use lock::RepoLock;
pub use registry::{RepoHandle, RepoRegistry};

use rand::Rng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::RepoError;
use crate::logging::*;
use crate::scan::{LocalRepoSync, ScanReport};
use crate::store::{LocalRepoTransaction, RepoStore};
use crate::types::{RemoteRepository, RemoteRepositoryRequest};
use crate::util;

pub const LOCK_FILE_NAME: &str = "LOCK";
pub const STORE_FILE_NAME: &str = "metadata.redb";

const PUBLIC_KEY_LENGTH: usize = 32;

/// An open, locked repository
pub struct LocalRepoManager {
	root: PathBuf,
	config: Arc<Config>,
	store: RepoStore,
	repository_id: Uuid,
	_lock: RepoLock,
}

impl std::fmt::Debug for LocalRepoManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LocalRepoManager")
			.field("root", &self.root)
			.field("repository_id", &self.repository_id)
			.finish()
	}
}

/// True if `dir` is the root of a repository
pub fn is_repository_root(dir: &Path, config: &Config) -> bool {
	dir.join(&config.meta_dir_name).join(STORE_FILE_NAME).is_file()
}

impl LocalRepoManager {
	/// Turn an existing directory into a new repository
	pub fn create(root: &Path, config: Arc<Config>) -> Result<Self, RepoError> {
		let root = root.canonicalize()?;
		if !root.is_dir() {
			return Err(RepoError::Io(io::Error::new(
				io::ErrorKind::InvalidInput,
				format!("{} is not a directory", root.display()),
			)));
		}
		if let Some(existing) = root.ancestors().find(|dir| is_repository_root(dir, &config)) {
			return Err(RepoError::AlreadyExists { path: existing.to_path_buf() });
		}

		let meta_dir = root.join(&config.meta_dir_name);
		fs::create_dir_all(&meta_dir)?;
		let lock = RepoLock::acquire(&meta_dir.join(LOCK_FILE_NAME), config.lock_timeout())?;

		let repository_id = Uuid::new_v4();
		let mut public_key = vec![0u8; PUBLIC_KEY_LENGTH];
		rand::thread_rng().fill(&mut public_key[..]);
		let root_mtime = util::to_millis(fs::metadata(&root)?.modified()?);
		let store = RepoStore::create(&meta_dir.join(STORE_FILE_NAME), repository_id, &public_key, root_mtime)?;

		info!("Created repository {} at {}", repository_id, root.display());
		Ok(LocalRepoManager { root, config, store, repository_id, _lock: lock })
	}

	/// Open the repository whose root is `root`
	pub fn open(root: &Path, config: Arc<Config>) -> Result<Self, RepoError> {
		let root = root.canonicalize()?;
		if !is_repository_root(&root, &config) {
			return Err(RepoError::NotFound { path: root });
		}
		let meta_dir = root.join(&config.meta_dir_name);
		let lock = RepoLock::acquire(&meta_dir.join(LOCK_FILE_NAME), config.lock_timeout())?;
		let store = RepoStore::open(&meta_dir.join(STORE_FILE_NAME))?;
		let repository_id = store.repository_id()?;

		let manager = LocalRepoManager { root, config, store, repository_id, _lock: lock };
		manager.recover_interrupted_transfers()?;
		debug!("Opened repository {} at {}", repository_id, manager.root.display());
		Ok(manager)
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn shared_config(&self) -> Arc<Config> {
		self.config.clone()
	}

	pub fn repository_id(&self) -> Uuid {
		self.repository_id
	}

	pub fn public_key(&self) -> Result<Vec<u8>, RepoError> {
		Ok(self.store.public_key()?)
	}

	pub fn local_revision(&self) -> Result<i64, RepoError> {
		Ok(self.store.local_revision()?)
	}

	pub fn begin(&self) -> Result<LocalRepoTransaction, RepoError> {
		Ok(self.store.begin()?)
	}

	/// Filesystem location of a repository path
	pub fn fs_path(&self, path: &str) -> PathBuf {
		util::to_fs_path(&self.root, path)
	}

	/// Full scan of the repository in one transaction
	pub fn scan(&self) -> Result<ScanReport, RepoError> {
		let mut tx = self.begin()?;
		let report = {
			let mut sync = LocalRepoSync::new(&self.root, &self.config, &mut tx)?;
			sync.sync_all()?;
			sync.into_report()
		};
		tx.commit()?;
		Ok(report)
	}

	/// Remove temp files left by interrupted transfers and clear the
	/// in-progress flags that pointed at them
	fn recover_interrupted_transfers(&self) -> Result<(), RepoError> {
		let removed = cleanup_temp_files(&self.root, &self.config);
		let mut tx = self.begin()?;
		for mut file in tx.in_progress_files()? {
			file.set_in_progress(false);
			tx.save_repo_file(&mut file)?;
		}
		if tx.is_stamped() || removed > 0 {
			info!("Recovered {} interrupted transfers in {}", removed, self.root.display());
		}
		tx.commit()?;
		Ok(())
	}

	// ========================================================================
	// PEERS
	// ========================================================================

	pub fn remote_repositories(&self) -> Result<Vec<RemoteRepository>, RepoError> {
		let tx = self.begin()?;
		let remotes = tx.remote_repositories()?;
		tx.abort()?;
		Ok(remotes)
	}

	pub fn remote_repository(&self, id: Uuid) -> Result<Option<RemoteRepository>, RepoError> {
		let tx = self.begin()?;
		let remote = tx.remote_repository(id)?;
		tx.abort()?;
		Ok(remote)
	}

	/// Register or update a peer. Sync bookkeeping of an existing peer is kept.
	pub fn put_remote_repository(
		&self,
		repository_id: Uuid,
		remote_root: Option<String>,
		public_key: Vec<u8>,
		local_path_prefix: &str,
	) -> Result<RemoteRepository, RepoError> {
		if repository_id == self.repository_id {
			return Err(RepoError::InvalidPath { path: format!("cannot connect {} to itself", repository_id) });
		}
		let prefix = util::normalize_path(local_path_prefix);
		let tx = self.begin()?;
		let remote = match tx.remote_repository(repository_id)? {
			Some(mut existing) => {
				existing.remote_root = remote_root;
				existing.public_key = public_key;
				existing.local_path_prefix = prefix;
				existing
			}
			None => RemoteRepository::new(repository_id, remote_root, public_key, &prefix),
		};
		tx.save_remote_repository(&remote)?;
		tx.remove_connection_request(repository_id)?;
		tx.commit()?;
		info!("Connected repository {} to {}", self.repository_id, repository_id);
		Ok(remote)
	}

	pub fn remove_remote_repository(&self, repository_id: Uuid) -> Result<bool, RepoError> {
		let tx = self.begin()?;
		let removed = tx.remove_remote_repository(repository_id)?;
		tx.commit()?;
		Ok(removed)
	}

	/// Record an inbound connection request
	pub fn request_repo_connection(
		&self,
		repository_id: Uuid,
		public_key: &[u8],
		local_path_prefix: &str,
	) -> Result<(), RepoError> {
		let tx = self.begin()?;
		if let Some(remote) = tx.remote_repository(repository_id)? {
			tx.abort()?;
			if remote.public_key != public_key {
				return Err(RepoError::PublicKeyMismatch { repository_id });
			}
			return Ok(());
		}
		let request = RemoteRepositoryRequest {
			repository_id,
			public_key: public_key.to_vec(),
			local_path_prefix: util::normalize_path(local_path_prefix),
			created: util::now_millis(),
		};
		tx.save_connection_request(&request)?;
		tx.commit()?;
		info!("Repository {} requested a connection to {}", repository_id, self.repository_id);
		Ok(())
	}

	pub fn connection_requests(&self) -> Result<Vec<RemoteRepositoryRequest>, RepoError> {
		let tx = self.begin()?;
		let requests = tx.connection_requests()?;
		tx.abort()?;
		Ok(requests)
	}

	/// Turn a pending request into an inbound-only peer
	pub fn accept_connection_request(&self, repository_id: Uuid) -> Result<RemoteRepository, RepoError> {
		let tx = self.begin()?;
		let request = match tx.connection_request(repository_id)? {
			Some(request) => request,
			None => {
				tx.abort()?;
				return Err(RepoError::NoConnectionRequest { repository_id });
			}
		};
		tx.abort()?;
		self.put_remote_repository(repository_id, None, request.public_key, &request.local_path_prefix)
	}
}

/// Remove leftover temp files below `root`; returns how many were removed
pub fn cleanup_temp_files(root: &Path, config: &Config) -> usize {
	fn scan_dir(dir: &Path, config: &Config, count: &mut usize) {
		let entries = match fs::read_dir(dir) {
			Ok(e) => e,
			Err(e) => {
				warn!("Cannot read directory {} during cleanup: {}", dir.display(), e);
				return;
			}
		};

		for entry in entries.flatten() {
			let path = entry.path();
			let name = entry.file_name();
			let name = name.to_string_lossy();
			if name == config.meta_dir_name.as_str() {
				continue;
			}
			let metadata = match fs::symlink_metadata(&path) {
				Ok(m) => m,
				Err(e) => {
					debug!("Cannot access {} during cleanup: {}", path.display(), e);
					continue;
				}
			};

			if name.starts_with(&config.temp_file_prefix) && metadata.is_file() {
				debug!("Removing orphaned temp file {}", path.display());
				match fs::remove_file(&path) {
					Ok(()) => *count += 1,
					Err(e) if e.kind() == io::ErrorKind::NotFound => {}
					Err(e) => warn!("Failed to remove temp file {}: {}", path.display(), e),
				}
			} else if metadata.is_dir() {
				// Preserve the directory timestamp so the scanner does not see a change
				let mtime = filetime::FileTime::from_last_modification_time(&metadata);
				let before = *count;
				scan_dir(&path, config, count);
				if *count != before {
					let _ = filetime::set_file_mtime(&path, mtime);
				}
			}
		}
	}

	let mut count = 0;
	let root_mtime = fs::metadata(root).ok().map(|m| filetime::FileTime::from_last_modification_time(&m));
	scan_dir(root, config, &mut count);
	if count > 0 {
		if let Some(mtime) = root_mtime {
			let _ = filetime::set_file_mtime(root, mtime);
		}
	}
	count
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn config() -> Arc<Config> {
		Arc::new(Config { lock_timeout_ms: 100, ..Config::default() })
	}

	#[test]
	fn test_create_then_open() {
		let dir = TempDir::new().unwrap();
		let id = {
			let manager = LocalRepoManager::create(dir.path(), config()).unwrap();
			assert_eq!(manager.public_key().unwrap().len(), PUBLIC_KEY_LENGTH);
			manager.repository_id()
		};
		let manager = LocalRepoManager::open(dir.path(), config()).unwrap();
		assert_eq!(manager.repository_id(), id);
	}

	#[test]
	fn test_create_twice_fails() {
		let dir = TempDir::new().unwrap();
		drop(LocalRepoManager::create(dir.path(), config()).unwrap());
		assert!(matches!(LocalRepoManager::create(dir.path(), config()), Err(RepoError::AlreadyExists { .. })));

		let nested = dir.path().join("sub");
		fs::create_dir(&nested).unwrap();
		assert!(matches!(LocalRepoManager::create(&nested, config()), Err(RepoError::AlreadyExists { .. })));
	}

	#[test]
	fn test_open_locked_repository_times_out() {
		let dir = TempDir::new().unwrap();
		let _first = LocalRepoManager::create(dir.path(), config()).unwrap();
		assert!(matches!(LocalRepoManager::open(dir.path(), config()), Err(RepoError::LockTimeout { .. })));
	}

	#[test]
	fn test_open_missing_repository() {
		let dir = TempDir::new().unwrap();
		assert!(matches!(LocalRepoManager::open(dir.path(), config()), Err(RepoError::NotFound { .. })));
	}

	#[test]
	fn test_open_removes_temp_files() {
		let dir = TempDir::new().unwrap();
		drop(LocalRepoManager::create(dir.path(), config()).unwrap());
		fs::create_dir(dir.path().join("d")).unwrap();
		fs::write(dir.path().join("d").join(".replicr-tmp_x"), b"partial").unwrap();
		fs::write(dir.path().join("d").join("keep"), b"data").unwrap();

		let _manager = LocalRepoManager::open(dir.path(), config()).unwrap();
		assert!(!dir.path().join("d").join(".replicr-tmp_x").exists());
		assert!(dir.path().join("d").join("keep").exists());
	}

	#[test]
	fn test_connection_request_flow() {
		let dir = TempDir::new().unwrap();
		let manager = LocalRepoManager::create(dir.path(), config()).unwrap();
		let peer = Uuid::new_v4();

		assert!(matches!(
			manager.accept_connection_request(peer),
			Err(RepoError::NoConnectionRequest { .. })
		));

		manager.request_repo_connection(peer, b"peer-key", "/shared").unwrap();
		assert_eq!(manager.connection_requests().unwrap().len(), 1);

		let remote = manager.accept_connection_request(peer).unwrap();
		assert_eq!(remote.remote_root, None);
		assert_eq!(remote.local_path_prefix, "/shared");
		assert!(manager.connection_requests().unwrap().is_empty());

		// already connected: same key is accepted, a different one is not
		manager.request_repo_connection(peer, b"peer-key", "/shared").unwrap();
		assert!(matches!(
			manager.request_repo_connection(peer, b"other", "/shared"),
			Err(RepoError::PublicKeyMismatch { .. })
		));
		assert!(manager.connection_requests().unwrap().is_empty());
	}

	#[test]
	fn test_put_remote_keeps_bookkeeping() {
		let dir = TempDir::new().unwrap();
		let manager = LocalRepoManager::create(dir.path(), config()).unwrap();
		let peer = Uuid::new_v4();
		manager.put_remote_repository(peer, None, vec![1], "/").unwrap();

		let tx = manager.begin().unwrap();
		let mut remote = tx.remote_repository(peer).unwrap().unwrap();
		remote.revision = 42;
		tx.save_remote_repository(&remote).unwrap();
		tx.commit().unwrap();

		let updated = manager.put_remote_repository(peer, Some("file:///x".into()), vec![1], "/").unwrap();
		assert_eq!(updated.revision, 42);
		assert_eq!(updated.remote_root.as_deref(), Some("file:///x"));
		assert_eq!(manager.remote_repositories().unwrap().len(), 1);

		assert!(manager.remove_remote_repository(peer).unwrap());
		assert!(manager.remote_repository(peer).unwrap().is_none());
	}
}

// vim: ts=4
