//! Filesystem to metadata reconciliation (LocalRepoSync)
//!
//! Walks a directory tree and brings the persisted `RepoFile` graph in line
//! with it inside one write transaction. Deletions and newly created files
//! also queue the modifications connected peers need: a delete modification
//! per peer for every removed node, and copy modifications pointing at
//! existing copies of a new file's content.

use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::chunking::{Fingerprint, Fingerprinter};
use crate::config::Config;
use crate::error::RepoError;
use crate::logging::*;
use crate::store::LocalRepoTransaction;
use crate::types::{ModificationKind, RepoFile, RepoFileKind};
use crate::util;

/// Counters of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
	pub created: usize,
	pub updated: usize,
	pub deleted: usize,
	pub hashed_bytes: u64,
	pub delete_modifications: usize,
	pub copy_modifications: usize,
}

impl ScanReport {
	pub fn has_changes(&self) -> bool {
		self.created + self.updated + self.deleted > 0
	}
}

/// What the filesystem currently holds at a path
#[derive(Debug)]
enum EntryType {
	Directory,
	Symlink(String),
	File(u64),
}

#[derive(Debug)]
struct Entry {
	kind: EntryType,
	last_modified: i64,
}

impl Entry {
	fn matches(&self, kind: &RepoFileKind) -> bool {
		matches!(
			(&self.kind, kind),
			(EntryType::Directory, RepoFileKind::Directory)
				| (EntryType::Symlink(_), RepoFileKind::Symlink { .. })
				| (EntryType::File(_), RepoFileKind::NormalFile { .. })
		)
	}
}

fn stat_entry(path: &Path) -> Result<Option<Entry>, RepoError> {
	let meta = match fs::symlink_metadata(path) {
		Ok(m) => m,
		Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(e.into()),
	};
	let last_modified = util::to_millis(meta.modified()?);
	let file_type = meta.file_type();
	let kind = if file_type.is_symlink() {
		match fs::read_link(path) {
			Ok(target) => EntryType::Symlink(target.to_string_lossy().into_owned()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		}
	} else if file_type.is_dir() {
		EntryType::Directory
	} else if file_type.is_file() {
		EntryType::File(meta.len())
	} else {
		debug!("Ignoring special file {}", path.display());
		return Ok(None);
	};
	Ok(Some(Entry { kind, last_modified }))
}

pub struct LocalRepoSync<'a> {
	root: &'a Path,
	config: &'a Config,
	tx: &'a mut LocalRepoTransaction,
	fingerprinter: Fingerprinter,
	remotes: Vec<Uuid>,
	/// Peer on whose behalf the scan runs; it gets no modifications
	excluded_remote: Option<Uuid>,
	/// Paths created or deleted during this pass, by (sha1, length)
	pass_contents: HashMap<(String, u64), Vec<String>>,
	report: ScanReport,
}

impl<'a> LocalRepoSync<'a> {
	pub fn new(root: &'a Path, config: &'a Config, tx: &'a mut LocalRepoTransaction) -> Result<Self, RepoError> {
		let remotes = tx.remote_repositories()?.into_iter().map(|r| r.repository_id).collect();
		Ok(LocalRepoSync {
			root,
			config,
			tx,
			fingerprinter: Fingerprinter::from_config(config),
			remotes,
			excluded_remote: None,
			pass_contents: HashMap::new(),
			report: ScanReport::default(),
		})
	}

	/// Scan on behalf of a peer: no modifications are queued for it
	pub fn exclude_remote(&mut self, remote: Option<Uuid>) {
		self.excluded_remote = remote;
	}

	pub fn report(&self) -> &ScanReport {
		&self.report
	}

	pub fn into_report(self) -> ScanReport {
		self.report
	}

	/// Scan the whole repository
	pub fn sync_all(&mut self) -> Result<(), RepoError> {
		self.sync_root(true)?;
		info!(
			"Scanned {}: {} created, {} updated, {} deleted, {} bytes hashed",
			self.root.display(),
			self.report.created,
			self.report.updated,
			self.report.deleted,
			self.report.hashed_bytes
		);
		Ok(())
	}

	/// Scan one repository path. Missing ancestors are created on the way;
	/// `recursive` applies to the target only.
	pub fn sync_path(&mut self, path: &str, recursive: bool) -> Result<Option<RepoFile>, RepoError> {
		let path = util::normalize_path(path);
		if util::is_root(&path) {
			return self.sync_root(recursive).map(Some);
		}

		let segments: Vec<String> = util::segments(&path).map(str::to_string).collect();
		let mut parent = self.tx.root()?;
		let mut parent_fs = self.root.to_path_buf();
		let mut parent_path = util::ROOT_PATH.to_string();

		for (i, name) in segments.iter().enumerate() {
			if self.config.is_internal_name(name) {
				return Err(RepoError::InvalidPath { path });
			}
			let last = i + 1 == segments.len();
			let existing = self.tx.child(parent.id, name)?;
			let fs_path = parent_fs.join(name);
			let repo_path = util::join_path(&parent_path, name);
			let node = self.sync(existing, Some(parent.id), &fs_path, &repo_path, name, last && recursive)?;
			match node {
				None => return Ok(None),
				Some(node) if last => return Ok(Some(node)),
				Some(node) if !node.is_directory() => return Ok(None),
				Some(node) => {
					parent = node;
					parent_fs = fs_path;
					parent_path = repo_path;
				}
			}
		}
		Ok(None)
	}

	fn sync_root(&mut self, recursive: bool) -> Result<RepoFile, RepoError> {
		let root = self.tx.root()?;
		let is_dir = matches!(stat_entry(self.root)?, Some(Entry { kind: EntryType::Directory, .. }));
		if !is_dir {
			return Err(RepoError::NotFound { path: self.root.to_path_buf() });
		}
		let root_fs = self.root.to_path_buf();
		self.sync(Some(root), None, &root_fs, util::ROOT_PATH, "", recursive)?
			.ok_or_else(|| RepoError::NotFound { path: root_fs.clone() })
	}

	fn sync(
		&mut self,
		node: Option<RepoFile>,
		parent_id: Option<u64>,
		fs_path: &Path,
		repo_path: &str,
		name: &str,
		recursive: bool,
	) -> Result<Option<RepoFile>, RepoError> {
		let entry = stat_entry(fs_path)?;

		let mut node = node;
		if let Some(existing) = node.take() {
			match &entry {
				Some(entry) if entry.matches(&existing.kind) => node = Some(existing),
				_ => self.delete_recursively(existing, repo_path)?,
			}
		}

		let entry = match entry {
			Some(entry) => entry,
			None => return Ok(None),
		};

		let file = match node {
			None => self.create(parent_id, name, fs_path, repo_path, entry)?,
			Some(existing) => self.update(existing, fs_path, repo_path, entry)?,
		};

		if let Some(file) = &file {
			if recursive && file.is_directory() {
				self.sync_children(file, fs_path, repo_path)?;
			}
		}
		Ok(file)
	}

	fn fingerprint(&mut self, fs_path: &Path) -> Result<Option<Fingerprint>, RepoError> {
		match self.fingerprinter.fingerprint_file(fs_path) {
			Ok(fp) => {
				self.report.hashed_bytes += fp.length;
				Ok(Some(fp))
			}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				debug!("{} vanished while hashing", fs_path.display());
				Ok(None)
			}
			Err(e) => Err(e.into()),
		}
	}

	fn create(
		&mut self,
		parent_id: Option<u64>,
		name: &str,
		fs_path: &Path,
		repo_path: &str,
		entry: Entry,
	) -> Result<Option<RepoFile>, RepoError> {
		let kind = match entry.kind {
			EntryType::Directory => RepoFileKind::Directory,
			EntryType::Symlink(target) => RepoFileKind::Symlink { target },
			EntryType::File(_) => match self.fingerprint(fs_path)? {
				Some(fp) => {
					RepoFileKind::NormalFile { length: fp.length, sha1: fp.sha1, chunks: fp.chunks, in_progress: false }
				}
				None => return Ok(None),
			},
		};

		let mut file = RepoFile::new(parent_id, name, entry.last_modified, kind);
		self.tx.save_repo_file(&mut file)?;
		self.report.created += 1;
		debug!("Created {} {}", file.kind.type_name(), repo_path);

		if let Some((sha1, length)) = file.content() {
			let key = (sha1.to_string(), length);
			self.create_copy_modifications(&file, repo_path, &key)?;
			self.pass_contents.entry(key).or_default().push(repo_path.to_string());
		}
		Ok(Some(file))
	}

	fn update(
		&mut self,
		existing: RepoFile,
		fs_path: &Path,
		repo_path: &str,
		entry: Entry,
	) -> Result<Option<RepoFile>, RepoError> {
		let mut file = existing;
		let modified = file.last_modified != entry.last_modified
			|| match (&file.kind, &entry.kind) {
				(RepoFileKind::NormalFile { length, .. }, EntryType::File(len)) => length != len,
				(RepoFileKind::Symlink { target }, EntryType::Symlink(t)) => target != t,
				_ => false,
			};
		let mut changed = false;

		if modified {
			match entry.kind {
				EntryType::File(_) => {
					let fp = match self.fingerprint(fs_path)? {
						Some(fp) => fp,
						None => {
							self.delete_recursively(file, repo_path)?;
							return Ok(None);
						}
					};
					// a local write supersedes any transfer into this file; its
					// end_put_file will see the collision
					file.kind =
						RepoFileKind::NormalFile { length: fp.length, sha1: fp.sha1, chunks: fp.chunks, in_progress: false };
				}
				EntryType::Symlink(target) => file.kind = RepoFileKind::Symlink { target },
				EntryType::Directory => {}
			}
			file.last_modified = entry.last_modified;
			file.last_sync_from_repository_id = None;
			changed = true;
			self.report.updated += 1;
			debug!("Updated {} {}", file.kind.type_name(), repo_path);
		}

		if file.is_in_progress() && !self.temp_file_exists(fs_path) {
			debug!("Clearing stale in-progress flag of {}", repo_path);
			file.set_in_progress(false);
			changed = true;
		}

		if changed {
			self.tx.save_repo_file(&mut file)?;
		}
		Ok(Some(file))
	}

	fn temp_file_exists(&self, fs_path: &Path) -> bool {
		let name = match fs_path.file_name() {
			Some(name) => name.to_string_lossy(),
			None => return false,
		};
		let temp = fs_path.with_file_name(self.config.temp_file_name(&name));
		fs::symlink_metadata(temp).is_ok()
	}

	fn sync_children(&mut self, dir: &RepoFile, fs_path: &Path, repo_path: &str) -> Result<(), RepoError> {
		let mut names = Vec::new();
		let entries = match fs::read_dir(fs_path) {
			Ok(entries) => Some(entries),
			Err(e) if e.kind() == io::ErrorKind::NotFound => None,
			Err(e) => return Err(e.into()),
		};
		for entry in entries.into_iter().flatten() {
			let entry = entry?;
			match entry.file_name().into_string() {
				Ok(name) if self.config.is_internal_name(&name) => {}
				Ok(name) => names.push(name),
				Err(name) => warn!("Skipping non UTF-8 name {:?} in {}", name, fs_path.display()),
			}
		}
		names.sort();

		let mut persisted: BTreeMap<String, RepoFile> =
			self.tx.children(dir.id)?.into_iter().map(|child| (child.name.clone(), child)).collect();

		for name in names {
			let child = persisted.remove(&name);
			let child_fs: PathBuf = fs_path.join(&name);
			let child_path = util::join_path(repo_path, &name);
			self.sync(child, Some(dir.id), &child_fs, &child_path, &name, true)?;
		}

		for (name, child) in persisted {
			let child_path = util::join_path(repo_path, &name);
			self.delete_recursively(child, &child_path)?;
		}
		Ok(())
	}

	fn delete_recursively(&mut self, file: RepoFile, repo_path: &str) -> Result<(), RepoError> {
		self.create_delete_modifications(&file, repo_path)?;
		if file.is_directory() {
			for child in self.tx.children(file.id)? {
				let child_path = util::join_path(repo_path, &child.name);
				self.delete_recursively(child, &child_path)?;
			}
		}
		if let Some((sha1, length)) = file.content() {
			self.pass_contents.entry((sha1.to_string(), length)).or_default().push(repo_path.to_string());
		}
		self.tx.delete_repo_file(&file)?;
		self.report.deleted += 1;
		debug!("Deleted {} {}", file.kind.type_name(), repo_path);
		Ok(())
	}

	fn target_remotes(&self) -> Vec<Uuid> {
		self.remotes.iter().copied().filter(|r| Some(*r) != self.excluded_remote).collect()
	}

	fn create_delete_modifications(&mut self, file: &RepoFile, repo_path: &str) -> Result<(), RepoError> {
		let (length, sha1) = match file.content() {
			Some((sha1, length)) => (Some(length), Some(sha1.to_string())),
			None => (None, None),
		};
		for remote in self.target_remotes() {
			let kind = ModificationKind::Delete { path: repo_path.to_string(), length, sha1: sha1.clone() };
			self.tx.add_modification(remote, kind)?;
			self.report.delete_modifications += 1;
		}
		Ok(())
	}

	fn create_copy_modifications(
		&mut self,
		file: &RepoFile,
		repo_path: &str,
		content: &(String, u64),
	) -> Result<(), RepoError> {
		let (sha1, length) = (content.0.as_str(), content.1);
		let max = self.config.max_copy_modifications(length);
		let remotes = self.target_remotes();
		if max == 0 || remotes.is_empty() {
			return Ok(());
		}

		let mut sources: Vec<String> = Vec::new();

		let same_pass = self.pass_contents.get(content).cloned().unwrap_or_default();
		take_candidates(same_pass, &mut sources, max, repo_path);

		if sources.len() < max {
			let mut existing = Vec::new();
			for other in self.tx.normal_files_with_content(sha1, length)? {
				if other.id != file.id {
					existing.push(self.tx.repo_file_path(&other)?);
				}
			}
			take_candidates(existing, &mut sources, max, repo_path);
		}

		if sources.len() < max {
			let deleted = self
				.tx
				.delete_modifications_with_content(sha1, length)?
				.into_iter()
				.filter_map(|m| match m.kind {
					ModificationKind::Delete { path, .. } => Some(path),
					ModificationKind::Copy { .. } => None,
				})
				.collect();
			take_candidates(deleted, &mut sources, max, repo_path);
		}

		for source in &sources {
			for remote in &remotes {
				let kind = ModificationKind::Copy {
					from_path: source.clone(),
					to_path: repo_path.to_string(),
					length,
					sha1: sha1.to_string(),
				};
				self.tx.add_modification(*remote, kind)?;
				self.report.copy_modifications += 1;
			}
		}
		if !sources.is_empty() {
			debug!("{} may be copied from {:?}", repo_path, sources);
		}
		Ok(())
	}
}

/// Add shuffled candidates until `max` distinct sources are collected
fn take_candidates(mut candidates: Vec<String>, sources: &mut Vec<String>, max: usize, own_path: &str) {
	candidates.shuffle(&mut rand::thread_rng());
	for candidate in candidates {
		if sources.len() >= max {
			break;
		}
		if candidate != own_path && !sources.contains(&candidate) {
			sources.push(candidate);
		}
	}
}


// vim: ts=4
