//! Change-set computation
//!
//! A change-set tells one peer what changed locally since the revision it
//! last received: the modifications queued for it and the changed nodes
//! together with the ancestors needed to place them in the tree. Paths are
//! relative to the path prefix the peer sees as its root.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::StoreError;
use crate::logging::*;
use crate::store::LocalRepoTransaction;
use crate::types::{ModificationKind, RepoFile, RepoFileKind};
use crate::util;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryDto {
	pub repository_id: Uuid,
	/// Revision the change-set was built at
	pub revision: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoFileDto {
	pub id: u64,
	/// None for the root of the change-set tree
	pub parent_id: Option<u64>,
	/// Empty for the root of the change-set tree
	pub name: String,
	pub last_modified: i64,
	pub local_revision: i64,
	pub kind: RepoFileKind,
	/// Present only so that its descendants can be placed
	pub needed_as_parent_only: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationDto {
	pub id: u64,
	pub local_revision: i64,
	pub kind: ModificationKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
	pub repository: RepositoryDto,
	pub modifications: Vec<ModificationDto>,
	pub repo_files: Vec<RepoFileDto>,
}

impl ChangeSet {
	pub fn is_empty(&self) -> bool {
		self.modifications.is_empty() && self.repo_files.iter().all(|f| f.needed_as_parent_only)
	}

	/// Copy modifications whose target is `path`
	pub fn copies_to<'a>(&'a self, path: &'a str) -> impl Iterator<Item = (&'a str, &'a str, u64)> + 'a {
		self.modifications.iter().filter_map(move |m| match &m.kind {
			ModificationKind::Copy { from_path, to_path, length, sha1 } if to_path == path => {
				Some((from_path.as_str(), sha1.as_str(), *length))
			}
			_ => None,
		})
	}
}

impl RepoFileDto {
	fn from_repo_file(file: &RepoFile, is_prefix_root: bool, needed_as_parent_only: bool) -> Self {
		RepoFileDto {
			id: file.id,
			parent_id: if is_prefix_root { None } else { file.parent },
			name: if is_prefix_root { String::new() } else { file.name.clone() },
			last_modified: file.last_modified,
			local_revision: file.local_revision,
			kind: file.kind.clone(),
			needed_as_parent_only,
		}
	}
}

pub struct ChangeSetBuilder<'a> {
	tx: &'a LocalRepoTransaction,
	remote_repository_id: Uuid,
	path_prefix: String,
}

impl<'a> ChangeSetBuilder<'a> {
	pub fn new(tx: &'a LocalRepoTransaction, remote_repository_id: Uuid, path_prefix: &str) -> Self {
		ChangeSetBuilder { tx, remote_repository_id, path_prefix: util::normalize_path(path_prefix) }
	}

	/// Build the change-set and mark the current revision as in progress
	/// for the peer. `since` overrides the last synced revision.
	pub fn build(&self, since: Option<i64>) -> Result<ChangeSet, StoreError> {
		let revision = self.tx.local_revision()?;
		let mut last_sync = self.tx.last_sync_to_remote_or_default(self.remote_repository_id)?;
		last_sync.local_repository_revision_in_progress = revision;
		self.tx.save_last_sync_to_remote(&last_sync)?;

		let after = since.unwrap_or(last_sync.local_repository_revision_synced);
		let modifications = self.modifications(after)?;
		let repo_files = self.repo_files(after)?;
		debug!(
			"Change-set for {} after revision {}: {} modifications, {} nodes",
			self.remote_repository_id,
			after,
			modifications.len(),
			repo_files.len()
		);

		Ok(ChangeSet {
			repository: RepositoryDto { repository_id: self.tx.repository_id()?, revision },
			modifications,
			repo_files,
		})
	}

	fn modifications(&self, after: i64) -> Result<Vec<ModificationDto>, StoreError> {
		let mut result = Vec::new();
		let mut root_deleted = false;
		for modification in self.tx.modifications_after(self.remote_repository_id, after)? {
			let kind = match modification.kind {
				ModificationKind::Delete { path, length, sha1 } => {
					if util::is_same_or_descendant(&self.path_prefix, &path) {
						// the prefix itself or one of its ancestors
						if root_deleted {
							continue;
						}
						root_deleted = true;
						ModificationKind::Delete { path: util::ROOT_PATH.to_string(), length: None, sha1: None }
					} else {
						match util::unprefix_path(&self.path_prefix, &path) {
							Some(path) => ModificationKind::Delete { path, length, sha1 },
							None => continue,
						}
					}
				}
				ModificationKind::Copy { from_path, to_path, length, sha1 } => {
					let from = util::unprefix_path(&self.path_prefix, &from_path);
					let to = util::unprefix_path(&self.path_prefix, &to_path);
					match (from, to) {
						(Some(from_path), Some(to_path)) => ModificationKind::Copy { from_path, to_path, length, sha1 },
						_ => continue,
					}
				}
			};
			result.push(ModificationDto { id: modification.id, local_revision: modification.local_revision, kind });
		}
		Ok(result)
	}

	fn repo_files(&self, after: i64) -> Result<Vec<RepoFileDto>, StoreError> {
		let prefix_root = match self.tx.repo_file_by_path(&self.path_prefix)? {
			Some(file) => file,
			None => return Ok(Vec::new()),
		};

		let mut result: BTreeMap<u64, RepoFileDto> = BTreeMap::new();
		for file in self.tx.repo_files_changed_after(after)? {
			if file.is_in_progress() || file.last_sync_from_repository_id == Some(self.remote_repository_id) {
				continue;
			}
			let ancestors = match self.ancestors_below(&file, prefix_root.id)? {
				Some(ancestors) => ancestors,
				None => continue,
			};

			result.insert(file.id, RepoFileDto::from_repo_file(&file, file.id == prefix_root.id, false));
			for ancestor in ancestors {
				result
					.entry(ancestor.id)
					.or_insert_with(|| RepoFileDto::from_repo_file(&ancestor, ancestor.id == prefix_root.id, true));
			}
		}
		Ok(result.into_values().collect())
	}

	/// Ancestors of `file` up to and including the prefix root, or None if
	/// the file lies outside the prefix
	fn ancestors_below(&self, file: &RepoFile, prefix_root_id: u64) -> Result<Option<Vec<RepoFile>>, StoreError> {
		let mut ancestors = Vec::new();
		if file.id == prefix_root_id {
			return Ok(Some(ancestors));
		}
		let mut parent = file.parent;
		while let Some(id) = parent {
			let node = self
				.tx
				.repo_file(id)?
				.ok_or_else(|| StoreError::Corrupted { message: format!("dangling parent {}", id) })?;
			let reached = node.id == prefix_root_id;
			parent = node.parent;
			ancestors.push(node);
			if reached {
				return Ok(Some(ancestors));
			}
		}
		Ok(None)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::RepoStore;
	use crate::types::RemoteRepository;
	use tempfile::TempDir;

	struct Fixture {
		_dir: TempDir,
		store: RepoStore,
		peer: Uuid,
	}

	fn fixture() -> Fixture {
		let dir = TempDir::new().unwrap();
		let store = RepoStore::create(&dir.path().join("meta.redb"), Uuid::new_v4(), b"key", 1000).unwrap();
		let peer = Uuid::new_v4();
		let tx = store.begin().unwrap();
		tx.save_remote_repository(&RemoteRepository::new(peer, None, vec![], "/")).unwrap();
		tx.commit().unwrap();
		Fixture { _dir: dir, store, peer }
	}

	fn file(sha1: &str, length: u64) -> RepoFileKind {
		RepoFileKind::NormalFile { length, sha1: sha1.to_string(), chunks: vec![], in_progress: false }
	}

	/// Creates /sub/inner/f.txt and /top.txt
	fn populate(store: &RepoStore) -> (RepoFile, RepoFile, RepoFile, RepoFile) {
		let mut tx = store.begin().unwrap();
		let root = tx.root().unwrap();
		let mut sub = RepoFile::new(Some(root.id), "sub", 10, RepoFileKind::Directory);
		tx.save_repo_file(&mut sub).unwrap();
		let mut inner = RepoFile::new(Some(sub.id), "inner", 10, RepoFileKind::Directory);
		tx.save_repo_file(&mut inner).unwrap();
		let mut f = RepoFile::new(Some(inner.id), "f.txt", 10, file("aaa", 3));
		tx.save_repo_file(&mut f).unwrap();
		let mut top = RepoFile::new(Some(root.id), "top.txt", 10, file("bbb", 4));
		tx.save_repo_file(&mut top).unwrap();
		tx.commit().unwrap();
		(sub, inner, f, top)
	}

	#[test]
	fn test_full_change_set_marks_in_progress() {
		let fx = fixture();
		populate(&fx.store);

		let tx = fx.store.begin().unwrap();
		let change_set = ChangeSetBuilder::new(&tx, fx.peer, "/").build(None).unwrap();
		let revision = tx.local_revision().unwrap();
		let last_sync = tx.last_sync_to_remote(fx.peer).unwrap().unwrap();
		tx.commit().unwrap();

		assert_eq!(change_set.repository.revision, revision);
		assert_eq!(last_sync.local_repository_revision_in_progress, revision);
		assert_eq!(last_sync.local_repository_revision_synced, -1);
		// root, sub, inner, f.txt, top.txt
		assert_eq!(change_set.repo_files.len(), 5);
		let root = change_set.repo_files.iter().find(|f| f.parent_id.is_none()).unwrap();
		assert_eq!(root.name, "");
		assert!(!change_set.is_empty());
	}

	#[test]
	fn test_prefix_scoping_and_parent_only_flags() {
		let fx = fixture();
		let (sub, inner, f, _top) = populate(&fx.store);

		// mark everything as delivered, then touch only f.txt
		let tx = fx.store.begin().unwrap();
		let mut last_sync = tx.last_sync_to_remote_or_default(fx.peer).unwrap();
		last_sync.local_repository_revision_synced = tx.local_revision().unwrap();
		tx.save_last_sync_to_remote(&last_sync).unwrap();
		tx.commit().unwrap();

		let mut tx = fx.store.begin().unwrap();
		let mut changed = f.clone();
		changed.last_modified = 20;
		tx.save_repo_file(&mut changed).unwrap();
		tx.commit().unwrap();

		let tx = fx.store.begin().unwrap();
		let change_set = ChangeSetBuilder::new(&tx, fx.peer, "/sub").build(None).unwrap();
		tx.abort().unwrap();

		let ids: Vec<u64> = change_set.repo_files.iter().map(|f| f.id).collect();
		assert_eq!(ids, vec![sub.id, inner.id, f.id]);
		let prefix_root = &change_set.repo_files[0];
		assert_eq!(prefix_root.parent_id, None);
		assert_eq!(prefix_root.name, "");
		assert!(prefix_root.needed_as_parent_only);
		assert!(change_set.repo_files[1].needed_as_parent_only);
		assert!(!change_set.repo_files[2].needed_as_parent_only);
		assert_eq!(change_set.repo_files[2].name, "f.txt");
	}

	#[test]
	fn test_excludes_echo_and_in_progress() {
		let fx = fixture();
		let (_sub, _inner, f, top) = populate(&fx.store);

		let mut tx = fx.store.begin().unwrap();
		let mut echoed = f.clone();
		echoed.last_sync_from_repository_id = Some(fx.peer);
		tx.save_repo_file(&mut echoed).unwrap();
		let mut writing = top.clone();
		writing.set_in_progress(true);
		tx.save_repo_file(&mut writing).unwrap();
		tx.commit().unwrap();

		let tx = fx.store.begin().unwrap();
		let change_set = ChangeSetBuilder::new(&tx, fx.peer, "/").build(None).unwrap();
		tx.abort().unwrap();
		assert!(change_set.repo_files.iter().all(|d| d.id != f.id && d.id != top.id));
	}

	#[test]
	fn test_modifications_rewritten_for_prefix() {
		let fx = fixture();
		let mut tx = fx.store.begin().unwrap();
		let delete = |path: &str| ModificationKind::Delete { path: path.to_string(), length: None, sha1: None };
		tx.add_modification(fx.peer, delete("/sub/a")).unwrap();
		tx.add_modification(fx.peer, delete("/other")).unwrap();
		tx.add_modification(fx.peer, delete("/sub")).unwrap();
		tx.add_modification(fx.peer, delete("/")).unwrap();
		tx.add_modification(
			fx.peer,
			ModificationKind::Copy {
				from_path: "/sub/x".to_string(),
				to_path: "/sub/y".to_string(),
				length: 1,
				sha1: "s".to_string(),
			},
		)
		.unwrap();
		tx.add_modification(
			fx.peer,
			ModificationKind::Copy {
				from_path: "/other/x".to_string(),
				to_path: "/sub/y".to_string(),
				length: 1,
				sha1: "s".to_string(),
			},
		)
		.unwrap();
		tx.commit().unwrap();

		let tx = fx.store.begin().unwrap();
		let change_set = ChangeSetBuilder::new(&tx, fx.peer, "/sub").build(None).unwrap();
		tx.abort().unwrap();

		let kinds: Vec<ModificationKind> = change_set.modifications.into_iter().map(|m| m.kind).collect();
		assert_eq!(
			kinds,
			vec![
				delete("/a"),
				delete("/"),
				ModificationKind::Copy {
					from_path: "/x".to_string(),
					to_path: "/y".to_string(),
					length: 1,
					sha1: "s".to_string()
				},
			]
		);
	}

	#[test]
	fn test_since_overrides_synced_revision() {
		let fx = fixture();
		populate(&fx.store);
		let tx = fx.store.begin().unwrap();
		let revision = tx.local_revision().unwrap();
		let change_set = ChangeSetBuilder::new(&tx, fx.peer, "/").build(Some(revision)).unwrap();
		tx.abort().unwrap();
		assert!(change_set.repo_files.is_empty());
		assert!(change_set.is_empty());
	}
}

// vim: ts=4
