//! Transport backed by a repository on the local filesystem
//!
//! Filesystem and database work runs on tokio's blocking pool. Every
//! mutating operation rescans the affected path first so that a change
//! made locally since the last scan is seen before it would be
//! overwritten, and rescans again afterwards so that the metadata matches
//! what was written. Entities written on behalf of the client carry its
//! id in `last_sync_from_repository_id`.

use async_trait::async_trait;
use filetime::FileTime;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{FileChunkSet, RepoTransport, TransportResult};
use crate::change_set::{ChangeSet, ChangeSetBuilder};
use crate::error::{RepoError, TransportError};
use crate::logging::*;
use crate::repo::{LocalRepoManager, RepoHandle, RepoRegistry};
use crate::scan::LocalRepoSync;
use crate::store::LocalRepoTransaction;
use crate::types::{RemoteRepository, RepoFile, RepoFileKind};
use crate::util;

pub struct LocalRepoTransport {
	url: String,
	ops: Arc<LocalOps>,
	handle: Mutex<Option<RepoHandle>>,
}

impl LocalRepoTransport {
	/// Open the repository behind a `file://` URL. Blocks while the
	/// repository lock is acquired.
	pub fn open(registry: &RepoRegistry, url: &str, client: Uuid) -> TransportResult<Self> {
		let path = util::path_from_file_url(url).ok_or_else(|| TransportError::Unsupported { url: url.to_string() })?;
		let handle = registry.open(&path)?;
		let canonical = path.canonicalize()?;
		if !canonical.is_dir() {
			return Err(TransportError::NotFound { path: canonical.display().to_string() });
		}
		let relative = canonical
			.strip_prefix(handle.root())
			.map_err(|_| TransportError::Unsupported { url: url.to_string() })?;
		let prefix = util::normalize_path(&relative.to_string_lossy());
		Ok(Self::new(handle, url, &prefix, client))
	}

	pub fn new(handle: RepoHandle, url: &str, prefix: &str, client: Uuid) -> Self {
		let ops = LocalOps { manager: handle.shared(), prefix: util::normalize_path(prefix), client };
		LocalRepoTransport { url: url.to_string(), ops: Arc::new(ops), handle: Mutex::new(Some(handle)) }
	}

	async fn run<T, F>(&self, f: F) -> TransportResult<T>
	where
		T: Send + 'static,
		F: FnOnce(&LocalOps) -> TransportResult<T> + Send + 'static,
	{
		let ops = self.ops.clone();
		tokio::task::spawn_blocking(move || f(&ops)).await?
	}
}

#[async_trait]
impl RepoTransport for LocalRepoTransport {
	fn url(&self) -> &str {
		&self.url
	}

	fn client_repository_id(&self) -> Uuid {
		self.ops.client
	}

	fn path_prefix(&self) -> &str {
		&self.ops.prefix
	}

	async fn repository_id(&self) -> TransportResult<Uuid> {
		Ok(self.ops.manager.repository_id())
	}

	async fn public_key(&self) -> TransportResult<Vec<u8>> {
		self.run(|ops| Ok(ops.manager.public_key()?)).await
	}

	async fn request_repo_connection(&self, public_key: &[u8]) -> TransportResult<()> {
		let public_key = public_key.to_vec();
		self.run(move |ops| Ok(ops.manager.request_repo_connection(ops.client, &public_key, &ops.prefix)?)).await
	}

	async fn change_set(&self, local_sync: bool, since_revision: Option<i64>) -> TransportResult<ChangeSet> {
		self.run(move |ops| ops.change_set(local_sync, since_revision)).await
	}

	async fn end_sync_from_repository(&self, retry_paths: &[String]) -> TransportResult<()> {
		let retry_paths = retry_paths.to_vec();
		self.run(move |ops| ops.end_sync_from_repository(&retry_paths)).await
	}

	async fn end_sync_to_repository(&self, from_revision: i64) -> TransportResult<()> {
		self.run(move |ops| ops.end_sync_to_repository(from_revision)).await
	}

	async fn make_directory(&self, path: &str, last_modified: Option<i64>) -> TransportResult<()> {
		let path = path.to_string();
		self.run(move |ops| ops.make_directory(&path, last_modified)).await
	}

	async fn make_symlink(&self, path: &str, target: &str, last_modified: i64) -> TransportResult<()> {
		let (path, target) = (path.to_string(), target.to_string());
		self.run(move |ops| ops.make_symlink(&path, &target, last_modified)).await
	}

	async fn copy(&self, from_path: &str, to_path: &str) -> TransportResult<()> {
		let (from, to) = (from_path.to_string(), to_path.to_string());
		self.run(move |ops| ops.copy(&from, &to)).await
	}

	async fn move_file(&self, from_path: &str, to_path: &str) -> TransportResult<()> {
		let (from, to) = (from_path.to_string(), to_path.to_string());
		self.run(move |ops| ops.move_file(&from, &to)).await
	}

	async fn delete(&self, path: &str) -> TransportResult<()> {
		let path = path.to_string();
		self.run(move |ops| ops.delete(&path)).await
	}

	async fn file_chunk_set(&self, path: &str, allow_cached: bool) -> TransportResult<FileChunkSet> {
		let path = path.to_string();
		self.run(move |ops| ops.file_chunk_set(&path, allow_cached)).await
	}

	async fn file_data(&self, path: &str, offset: u64, length: u64) -> TransportResult<Option<Vec<u8>>> {
		let path = path.to_string();
		self.run(move |ops| ops.file_data(&path, offset, length)).await
	}

	async fn begin_put_file(&self, path: &str) -> TransportResult<()> {
		let path = path.to_string();
		self.run(move |ops| ops.begin_put_file(&path)).await
	}

	async fn put_file_data(&self, path: &str, offset: u64, data: &[u8]) -> TransportResult<()> {
		let (path, data) = (path.to_string(), data.to_vec());
		self.run(move |ops| ops.put_file_data(&path, offset, &data)).await
	}

	async fn end_put_file(&self, path: &str, last_modified: i64, length: u64, sha1: Option<&str>) -> TransportResult<()> {
		let path = path.to_string();
		let sha1 = sha1.map(str::to_string);
		self.run(move |ops| ops.end_put_file(&path, last_modified, length, sha1.as_deref())).await
	}

	async fn abort_put_file(&self, path: &str) -> TransportResult<()> {
		let path = path.to_string();
		self.run(move |ops| ops.abort_put_file(&path)).await
	}

	async fn close(&self) -> TransportResult<()> {
		let handle = self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
		if let Some(handle) = handle {
			handle.close();
		}
		Ok(())
	}
}

/// Run `f`, then restore the timestamp the parent directory had before
fn preserving_parent_mtime<T, F>(fs_path: &Path, f: F) -> io::Result<T>
where
	F: FnOnce() -> io::Result<T>,
{
	let parent = match fs_path.parent() {
		Some(parent) => parent,
		None => return f(),
	};
	let before = fs::metadata(parent).ok().map(|m| FileTime::from_last_modification_time(&m));
	let result = f();
	if let Some(mtime) = before {
		if let Err(e) = filetime::set_file_mtime(parent, mtime) {
			debug!("Cannot restore timestamp of {}: {}", parent.display(), e);
		}
	}
	result
}

fn remove_entry(fs_path: &Path) -> io::Result<()> {
	let meta = fs::symlink_metadata(fs_path)?;
	if meta.is_dir() {
		fs::remove_dir_all(fs_path)
	} else {
		fs::remove_file(fs_path)
	}
}

fn not_found(path: &str) -> TransportError {
	TransportError::NotFound { path: path.to_string() }
}

/// Save a node and its descendants again so that they carry the
/// transaction's revision
fn restamp_subtree(tx: &mut LocalRepoTransaction, node: RepoFile) -> TransportResult<usize> {
	let mut count = 0;
	let mut pending = vec![node];
	while let Some(mut node) = pending.pop() {
		if node.is_directory() {
			pending.extend(tx.children(node.id)?);
		}
		tx.save_repo_file(&mut node)?;
		count += 1;
	}
	Ok(count)
}

fn chunk_set_of(file: &RepoFile) -> FileChunkSet {
	match &file.kind {
		RepoFileKind::NormalFile { length, sha1, chunks, in_progress: false } => FileChunkSet {
			exists: true,
			length: *length,
			last_modified: file.last_modified,
			sha1: Some(sha1.clone()),
			chunks: chunks.clone(),
		},
		_ => FileChunkSet::missing(),
	}
}

/// Blocking side of the transport
struct LocalOps {
	manager: Arc<LocalRepoManager>,
	prefix: String,
	client: Uuid,
}

impl LocalOps {
	/// Repository path of a transport path
	fn repo_path(&self, path: &str) -> TransportResult<String> {
		let repo_path = util::prefix_path(&self.prefix, path);
		let config = self.manager.config();
		if util::segments(&repo_path).any(|s| s == ".." || config.is_internal_name(s)) {
			return Err(RepoError::InvalidPath { path: path.to_string() }.into());
		}
		Ok(repo_path)
	}

	fn temp_path(&self, fs_path: &Path) -> PathBuf {
		let name = fs_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
		fs_path.with_file_name(self.manager.config().temp_file_name(&name))
	}

	fn connected(&self, tx: &LocalRepoTransaction) -> TransportResult<RemoteRepository> {
		tx.remote_repository(self.client)?.ok_or(TransportError::NotConnected { repository_id: self.client })
	}

	/// Bring the metadata of one path up to date. With `on_behalf` the
	/// client gets no modifications for what the scan finds.
	fn rescan(
		&self,
		tx: &mut LocalRepoTransaction,
		repo_path: &str,
		recursive: bool,
		on_behalf: bool,
	) -> TransportResult<Option<RepoFile>> {
		let mut sync = LocalRepoSync::new(self.manager.root(), self.manager.config(), tx)?;
		if on_behalf {
			sync.exclude_remote(Some(self.client));
		}
		Ok(sync.sync_path(repo_path, recursive)?)
	}

	/// Rescan a path written for the client and attribute it to the client
	fn record_write(&self, tx: &mut LocalRepoTransaction, repo_path: &str) -> TransportResult<Option<RepoFile>> {
		let node = self.rescan(tx, repo_path, false, true)?;
		match node {
			Some(mut node) => {
				node.set_in_progress(false);
				node.last_sync_from_repository_id = Some(self.client);
				tx.save_repo_file(&mut node)?;
				Ok(Some(node))
			}
			None => Ok(None),
		}
	}

	/// Changed locally since the last revision delivered to the client, by
	/// someone other than the client
	fn collides(&self, tx: &LocalRepoTransaction, file: &RepoFile) -> TransportResult<bool> {
		if file.last_sync_from_repository_id == Some(self.client) {
			return Ok(false);
		}
		Ok(file.local_revision > tx.synced_revision(self.client)?)
	}

	/// A directory collides if any file or symlink below it does
	fn subtree_collides(&self, tx: &LocalRepoTransaction, file: &RepoFile) -> TransportResult<bool> {
		if !file.is_directory() {
			return self.collides(tx, file);
		}
		let mut pending = vec![file.id];
		while let Some(id) = pending.pop() {
			for child in tx.children(id)? {
				if child.is_directory() {
					pending.push(child.id);
				} else if self.collides(tx, &child)? {
					return Ok(true);
				}
			}
		}
		Ok(false)
	}

	/// Commit what the scans found and report the collision
	fn collision(&self, tx: LocalRepoTransaction, repo_path: &str) -> TransportResult<()> {
		tx.commit()?;
		info!("Collision at {} while writing for {}", repo_path, self.client);
		Err(TransportError::Collision { path: repo_path.to_string() })
	}

	fn change_set(&self, local_sync: bool, since_revision: Option<i64>) -> TransportResult<ChangeSet> {
		let mut tx = self.manager.begin()?;
		self.connected(&tx)?;
		if local_sync {
			let mut sync = LocalRepoSync::new(self.manager.root(), self.manager.config(), &mut tx)?;
			sync.sync_all()?;
		}
		let change_set = ChangeSetBuilder::new(&tx, self.client, &self.prefix).build(since_revision)?;
		tx.commit()?;
		Ok(change_set)
	}

	fn end_sync_from_repository(&self, retry_paths: &[String]) -> TransportResult<()> {
		let mut tx = self.manager.begin()?;
		self.connected(&tx)?;
		let mut last_sync = tx.last_sync_to_remote_or_default(self.client)?;
		last_sync.local_repository_revision_synced = last_sync.local_repository_revision_in_progress;
		tx.save_last_sync_to_remote(&last_sync)?;
		let pruned = tx.prune_modifications(self.client, last_sync.local_repository_revision_synced)?;

		// a fresh revision puts rejected entries above what was just marked synced
		let mut pending = 0;
		for path in retry_paths {
			let repo_path = self.repo_path(path)?;
			if let Some(node) = tx.repo_file_by_path(&repo_path)? {
				pending += restamp_subtree(&mut tx, node)?;
			}
		}
		tx.commit()?;
		debug!(
			"{} received revision {}, pruned {} modifications, {} entries pending",
			self.client, last_sync.local_repository_revision_synced, pruned, pending
		);
		Ok(())
	}

	fn end_sync_to_repository(&self, from_revision: i64) -> TransportResult<()> {
		let tx = self.manager.begin()?;
		let mut remote = self.connected(&tx)?;
		remote.revision = from_revision;
		remote.local_revision = tx.local_revision()?;
		tx.save_remote_repository(&remote)?;
		tx.commit()?;
		Ok(())
	}

	fn make_directory(&self, path: &str, last_modified: Option<i64>) -> TransportResult<()> {
		let repo_path = self.repo_path(path)?;
		let fs_path = self.manager.fs_path(&repo_path);
		let mut tx = self.manager.begin()?;
		self.connected(&tx)?;

		match self.rescan(&mut tx, &repo_path, false, false)? {
			Some(dir) if dir.is_directory() => {
				let lm = match last_modified {
					Some(lm) if lm != dir.last_modified => lm,
					_ => {
						tx.commit()?;
						return Ok(());
					}
				};
				if self.collides(&tx, &dir)? {
					debug!("Keeping local timestamp of directory {}", repo_path);
					tx.commit()?;
					return Ok(());
				}
				filetime::set_file_mtime(&fs_path, util::to_file_time(lm))?;
			}
			Some(other) => {
				if self.subtree_collides(&tx, &other)? {
					return self.collision(tx, &repo_path);
				}
				preserving_parent_mtime(&fs_path, || {
					remove_entry(&fs_path)?;
					fs::create_dir(&fs_path)
				})?;
				self.rescan(&mut tx, &repo_path, false, true)?;
				if let Some(lm) = last_modified {
					filetime::set_file_mtime(&fs_path, util::to_file_time(lm))?;
				}
			}
			None => {
				let created = preserving_parent_mtime(&fs_path, || fs::create_dir(&fs_path));
				match created {
					Ok(()) => {}
					Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found(path)),
					Err(e) => return Err(e.into()),
				}
				if let Some(lm) = last_modified {
					filetime::set_file_mtime(&fs_path, util::to_file_time(lm))?;
				}
			}
		}

		self.record_write(&mut tx, &repo_path)?;
		tx.commit()?;
		Ok(())
	}

	fn make_symlink(&self, path: &str, target: &str, last_modified: i64) -> TransportResult<()> {
		let repo_path = self.repo_path(path)?;
		let fs_path = self.manager.fs_path(&repo_path);
		let mut tx = self.manager.begin()?;
		self.connected(&tx)?;

		if let Some(existing) = self.rescan(&mut tx, &repo_path, false, false)? {
			let same = matches!(&existing.kind, RepoFileKind::Symlink { target: t } if t == target);
			if same && existing.last_modified == last_modified {
				tx.commit()?;
				return Ok(());
			}
			if self.subtree_collides(&tx, &existing)? {
				return self.collision(tx, &repo_path);
			}
			preserving_parent_mtime(&fs_path, || remove_entry(&fs_path))?;
		}

		let created = preserving_parent_mtime(&fs_path, || create_symlink(target, &fs_path));
		match created {
			Ok(()) => {}
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found(path)),
			Err(e) => return Err(e.into()),
		}
		let mtime = util::to_file_time(last_modified);
		filetime::set_symlink_file_times(&fs_path, mtime, mtime)?;

		self.record_write(&mut tx, &repo_path)?;
		tx.commit()?;
		Ok(())
	}

	fn copy(&self, from_path: &str, to_path: &str) -> TransportResult<()> {
		let from = self.repo_path(from_path)?;
		let to = self.repo_path(to_path)?;
		let mut tx = self.manager.begin()?;
		self.connected(&tx)?;

		let source = match self.rescan(&mut tx, &from, false, false)? {
			Some(source) if source.is_normal_file() && !source.is_in_progress() => source,
			_ => {
				tx.commit()?;
				return Err(not_found(from_path));
			}
		};
		if self.rescan(&mut tx, &to, false, false)?.is_some() {
			debug!("Copy target {} exists, not copying", to);
			tx.commit()?;
			return Ok(());
		}

		let from_fs = self.manager.fs_path(&from);
		let to_fs = self.manager.fs_path(&to);
		let temp = self.temp_path(&to_fs);
		let copied = preserving_parent_mtime(&to_fs, || {
			fs::copy(&from_fs, &temp)?;
			filetime::set_file_mtime(&temp, util::to_file_time(source.last_modified))?;
			fs::rename(&temp, &to_fs)
		});
		match copied {
			Ok(()) => {}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				let _ = fs::remove_file(&temp);
				tx.commit()?;
				return Err(not_found(to_path));
			}
			Err(e) => return Err(e.into()),
		}

		self.record_write(&mut tx, &to)?;
		tx.commit()?;
		debug!("Copied {} to {} for {}", from, to, self.client);
		Ok(())
	}

	fn move_file(&self, from_path: &str, to_path: &str) -> TransportResult<()> {
		let from = self.repo_path(from_path)?;
		let to = self.repo_path(to_path)?;
		let mut tx = self.manager.begin()?;
		self.connected(&tx)?;

		let source = match self.rescan(&mut tx, &from, true, false)? {
			Some(source) => source,
			None => {
				tx.commit()?;
				return Err(not_found(from_path));
			}
		};
		if self.subtree_collides(&tx, &source)? {
			return self.collision(tx, &from);
		}
		if self.rescan(&mut tx, &to, false, false)?.is_some() {
			return self.collision(tx, &to);
		}

		let from_fs = self.manager.fs_path(&from);
		let to_fs = self.manager.fs_path(&to);
		let moved = preserving_parent_mtime(&from_fs, || preserving_parent_mtime(&to_fs, || fs::rename(&from_fs, &to_fs)));
		match moved {
			Ok(()) => {}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				tx.commit()?;
				return Err(not_found(to_path));
			}
			Err(e) => return Err(e.into()),
		}

		self.rescan(&mut tx, &from, false, true)?;
		{
			let mut sync = LocalRepoSync::new(self.manager.root(), self.manager.config(), &mut tx)?;
			sync.exclude_remote(Some(self.client));
			sync.sync_path(&to, true)?;
		}
		self.record_write(&mut tx, &to)?;
		tx.commit()?;
		debug!("Moved {} to {} for {}", from, to, self.client);
		Ok(())
	}

	fn delete(&self, path: &str) -> TransportResult<()> {
		let repo_path = self.repo_path(path)?;
		let mut tx = self.manager.begin()?;
		self.connected(&tx)?;

		if util::is_root(&repo_path) {
			// the repository root stays; its contents go
			let root = tx.root()?;
			let mut collided = None;
			for child in tx.children(root.id)? {
				let child_path = util::join_path(&repo_path, &child.name);
				if let Err(e) = self.delete_node(&mut tx, &child_path) {
					match e {
						TransportError::Collision { path } => collided = Some(path),
						e => return Err(e),
					}
				}
			}
			tx.commit()?;
			return match collided {
				Some(path) => Err(TransportError::Collision { path }),
				None => Ok(()),
			};
		}

		let result = self.delete_node(&mut tx, &repo_path);
		tx.commit()?;
		result
	}

	fn delete_node(&self, tx: &mut LocalRepoTransaction, repo_path: &str) -> TransportResult<()> {
		let node = match self.rescan(tx, repo_path, true, false)? {
			Some(node) => node,
			None => return Ok(()),
		};
		if self.subtree_collides(tx, &node)? {
			info!("Collision at {} while deleting for {}", repo_path, self.client);
			return Err(TransportError::Collision { path: repo_path.to_string() });
		}
		let fs_path = self.manager.fs_path(repo_path);
		match preserving_parent_mtime(&fs_path, || remove_entry(&fs_path)) {
			Ok(()) => {}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {}
			Err(e) => return Err(e.into()),
		}
		self.rescan(tx, repo_path, false, true)?;
		debug!("Deleted {} for {}", repo_path, self.client);
		Ok(())
	}

	fn file_chunk_set(&self, path: &str, allow_cached: bool) -> TransportResult<FileChunkSet> {
		let repo_path = self.repo_path(path)?;
		let mut tx = self.manager.begin()?;
		let node = if allow_cached {
			tx.repo_file_by_path(&repo_path)?
		} else {
			self.rescan(&mut tx, &repo_path, false, false)?
		};
		let chunk_set = node.as_ref().map(chunk_set_of).unwrap_or_else(FileChunkSet::missing);
		tx.commit()?;
		Ok(chunk_set)
	}

	fn file_data(&self, path: &str, offset: u64, length: u64) -> TransportResult<Option<Vec<u8>>> {
		let repo_path = self.repo_path(path)?;
		let fs_path = self.manager.fs_path(&repo_path);
		let mut file = match fs::File::open(&fs_path) {
			Ok(file) => file,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		let meta = file.metadata()?;
		if !meta.is_file() {
			return Ok(None);
		}
		file.seek(SeekFrom::Start(offset))?;
		let available = meta.len().saturating_sub(offset).min(length);
		let mut data = Vec::with_capacity(available as usize);
		file.take(length).read_to_end(&mut data)?;
		Ok(Some(data))
	}

	fn begin_put_file(&self, path: &str) -> TransportResult<()> {
		let repo_path = self.repo_path(path)?;
		let fs_path = self.manager.fs_path(&repo_path);
		let mut tx = self.manager.begin()?;
		self.connected(&tx)?;

		let mut existing = self.rescan(&mut tx, &repo_path, true, false)?;
		if let Some(node) = existing.take() {
			if self.subtree_collides(&tx, &node)? {
				return self.collision(tx, &repo_path);
			}
			if node.is_normal_file() {
				existing = Some(node);
			} else {
				preserving_parent_mtime(&fs_path, || remove_entry(&fs_path))?;
				self.rescan(&mut tx, &repo_path, false, true)?;
			}
		}

		let temp = self.temp_path(&fs_path);
		let seeded = preserving_parent_mtime(&fs_path, || match &existing {
			Some(_) => fs::copy(&fs_path, &temp).map(|_| ()),
			None => fs::File::create(&temp).map(|_| ()),
		});
		match seeded {
			Ok(()) => {}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				tx.commit()?;
				return Err(not_found(path));
			}
			Err(e) => return Err(e.into()),
		}

		if let Some(mut node) = existing {
			node.set_in_progress(true);
			node.last_sync_from_repository_id = Some(self.client);
			tx.save_repo_file(&mut node)?;
		}
		tx.commit()?;
		Ok(())
	}

	fn put_file_data(&self, path: &str, offset: u64, data: &[u8]) -> TransportResult<()> {
		let repo_path = self.repo_path(path)?;
		let temp = self.temp_path(&self.manager.fs_path(&repo_path));
		let mut file = match OpenOptions::new().write(true).open(&temp) {
			Ok(file) => file,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found(path)),
			Err(e) => return Err(e.into()),
		};
		file.seek(SeekFrom::Start(offset))?;
		file.write_all(data)?;
		Ok(())
	}

	fn end_put_file(&self, path: &str, last_modified: i64, length: u64, sha1: Option<&str>) -> TransportResult<()> {
		let repo_path = self.repo_path(path)?;
		let fs_path = self.manager.fs_path(&repo_path);
		let temp = self.temp_path(&fs_path);
		let mut tx = self.manager.begin()?;
		self.connected(&tx)?;

		if fs::symlink_metadata(&temp).is_err() {
			tx.commit()?;
			return Err(not_found(path));
		}

		if let Some(mut node) = self.rescan(&mut tx, &repo_path, true, false)? {
			let identical = matches!(sha1, Some(s) if node.content() == Some((s, length)));
			if !identical && self.subtree_collides(&tx, &node)? {
				preserving_parent_mtime(&fs_path, || fs::remove_file(&temp))?;
				if node.is_in_progress() {
					node.set_in_progress(false);
					tx.save_repo_file(&mut node)?;
				}
				return self.collision(tx, &repo_path);
			}
			if !node.is_normal_file() {
				preserving_parent_mtime(&fs_path, || remove_entry(&fs_path))?;
				self.rescan(&mut tx, &repo_path, false, true)?;
			}
		}

		preserving_parent_mtime(&fs_path, || {
			OpenOptions::new().write(true).open(&temp)?.set_len(length)?;
			filetime::set_file_mtime(&temp, util::to_file_time(last_modified))?;
			fs::rename(&temp, &fs_path)
		})?;

		let node = self.record_write(&mut tx, &repo_path)?;
		tx.commit()?;

		if let (Some(expected), Some(node)) = (sha1, &node) {
			if node.content().map(|(s, _)| s) != Some(expected) {
				warn!("{} does not match the expected digest after writing; it changed while being transferred", repo_path);
			}
		}
		Ok(())
	}

	fn abort_put_file(&self, path: &str) -> TransportResult<()> {
		let repo_path = self.repo_path(path)?;
		let fs_path = self.manager.fs_path(&repo_path);
		let temp = self.temp_path(&fs_path);
		match preserving_parent_mtime(&fs_path, || fs::remove_file(&temp)) {
			Ok(()) => {}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {}
			Err(e) => return Err(e.into()),
		}

		// with the temp file gone the rescan clears the in-progress flag
		let mut tx = self.manager.begin()?;
		self.rescan(&mut tx, &repo_path, false, false)?;
		tx.commit()?;
		debug!("Aborted transfer of {} for {}", repo_path, self.client);
		Ok(())
	}
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> io::Result<()> {
	std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn create_symlink(_target: &str, _link: &Path) -> io::Result<()> {
	Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported on this platform"))
}


// vim: ts=4
