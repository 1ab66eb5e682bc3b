//! Write transaction over the metadata store
//!
//! Every mutation of a change-tracked entity goes through `stamp()`, which
//! allocates the next local revision the first time it is called in a
//! transaction and returns the same value afterwards.

use redb::{ReadableTable, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::*;
use crate::error::StoreError;
use crate::types::{
	LastSyncToRemoteRepo, Modification, ModificationKind, RemoteRepository, RemoteRepositoryRequest, RepoFile,
};

pub struct LocalRepoTransaction {
	txn: WriteTransaction,
	revision: Option<i64>,
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
	Ok(serde_json::from_slice(bytes)?)
}

impl LocalRepoTransaction {
	pub(crate) fn new(txn: WriteTransaction) -> Self {
		LocalRepoTransaction { txn, revision: None }
	}

	pub(crate) fn create_tables(&self) -> Result<(), StoreError> {
		self.txn.open_table(REPO_FILES)?;
		self.txn.open_table(CHILDREN)?;
		self.txn.open_table(FILES_BY_REVISION)?;
		self.txn.open_table(FILES_BY_CONTENT)?;
		self.txn.open_table(MODIFICATIONS)?;
		self.txn.open_table(MODIFICATIONS_BY_REMOTE)?;
		self.txn.open_table(DELETES_BY_CONTENT)?;
		self.txn.open_table(REMOTE_REPOSITORIES)?;
		self.txn.open_table(CONNECTION_REQUESTS)?;
		self.txn.open_table(LAST_SYNC)?;
		self.txn.open_table(PROPERTIES)?;
		Ok(())
	}

	pub fn commit(self) -> Result<(), StoreError> {
		self.txn.commit()?;
		Ok(())
	}

	pub fn abort(self) -> Result<(), StoreError> {
		self.txn.abort()?;
		Ok(())
	}

	// ========================================================================
	// PROPERTIES & REVISIONS
	// ========================================================================

	pub(crate) fn property<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
		let table = self.txn.open_table(PROPERTIES)?;
		let value = match table.get(key)? {
			Some(bytes) => Some(decode(bytes.value())?),
			None => None,
		};
		Ok(value)
	}

	pub(crate) fn set_property<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
		let bytes = serde_json::to_vec(value)?;
		let mut table = self.txn.open_table(PROPERTIES)?;
		table.insert(key, bytes.as_slice())?;
		Ok(())
	}

	pub fn repository_id(&self) -> Result<Uuid, StoreError> {
		self.property(PROP_REPOSITORY_ID)?
			.ok_or_else(|| StoreError::Corrupted { message: "repository id missing".to_string() })
	}

	/// Revision visible in this transaction (stamped or last committed)
	pub fn local_revision(&self) -> Result<i64, StoreError> {
		match self.revision {
			Some(revision) => Ok(revision),
			None => Ok(self.property(PROP_LOCAL_REVISION)?.unwrap_or(-1)),
		}
	}

	/// Revision of this transaction, allocated on first use
	pub fn stamp(&mut self) -> Result<i64, StoreError> {
		if let Some(revision) = self.revision {
			return Ok(revision);
		}
		let next = self.local_revision()? + 1;
		self.set_property(PROP_LOCAL_REVISION, &next)?;
		self.revision = Some(next);
		Ok(next)
	}

	/// True once something change-tracked was written
	pub fn is_stamped(&self) -> bool {
		self.revision.is_some()
	}

	fn next_id(&self) -> Result<u64, StoreError> {
		let id: u64 = self.property(PROP_NEXT_ID)?.unwrap_or(1);
		self.set_property(PROP_NEXT_ID, &(id + 1))?;
		Ok(id)
	}

	// ========================================================================
	// REPO FILES
	// ========================================================================

	pub fn repo_file(&self, id: u64) -> Result<Option<RepoFile>, StoreError> {
		let table = self.txn.open_table(REPO_FILES)?;
		let file = match table.get(id)? {
			Some(bytes) => Some(decode(bytes.value())?),
			None => None,
		};
		Ok(file)
	}

	pub fn root(&self) -> Result<RepoFile, StoreError> {
		let id: u64 = self
			.property(PROP_ROOT_ID)?
			.ok_or_else(|| StoreError::Corrupted { message: "root id missing".to_string() })?;
		self.repo_file(id)?
			.ok_or_else(|| StoreError::Corrupted { message: format!("root node {} missing", id) })
	}

	pub fn child(&self, parent_id: u64, name: &str) -> Result<Option<RepoFile>, StoreError> {
		let id = {
			let table = self.txn.open_table(CHILDREN)?;
			let id = table.get((parent_id, name))?.map(|guard| guard.value());
			id
		};
		match id {
			Some(id) => self.repo_file(id),
			None => Ok(None),
		}
	}

	/// Children of a node, ordered by name
	pub fn children(&self, parent_id: u64) -> Result<Vec<RepoFile>, StoreError> {
		let mut ids = Vec::new();
		{
			let table = self.txn.open_table(CHILDREN)?;
			for entry in table.range((parent_id, "")..(parent_id + 1, ""))? {
				let (_, id) = entry?;
				ids.push(id.value());
			}
		}
		let mut children = Vec::with_capacity(ids.len());
		for id in ids {
			match self.repo_file(id)? {
				Some(child) => children.push(child),
				None => {
					return Err(StoreError::Corrupted { message: format!("child index points to missing node {}", id) })
				}
			}
		}
		Ok(children)
	}

	/// Insert or update a node; stamps the transaction revision onto it
	pub fn save_repo_file(&mut self, file: &mut RepoFile) -> Result<(), StoreError> {
		let revision = self.stamp()?;
		if file.id == 0 {
			file.id = self.next_id()?;
		} else if let Some(old) = self.repo_file(file.id)? {
			self.remove_file_indexes(&old)?;
		}
		file.local_revision = revision;

		let bytes = serde_json::to_vec(file)?;
		{
			let mut table = self.txn.open_table(REPO_FILES)?;
			table.insert(file.id, bytes.as_slice())?;
		}
		self.insert_file_indexes(file)
	}

	/// Remove a single node; children must have been removed before
	pub fn delete_repo_file(&mut self, file: &RepoFile) -> Result<(), StoreError> {
		self.stamp()?;
		if let Some(old) = self.repo_file(file.id)? {
			self.remove_file_indexes(&old)?;
		}
		let mut table = self.txn.open_table(REPO_FILES)?;
		table.remove(file.id)?;
		Ok(())
	}

	fn insert_file_indexes(&self, file: &RepoFile) -> Result<(), StoreError> {
		if let Some(parent) = file.parent {
			let mut children = self.txn.open_table(CHILDREN)?;
			children.insert((parent, file.name.as_str()), file.id)?;
		}
		{
			let mut by_revision = self.txn.open_table(FILES_BY_REVISION)?;
			by_revision.insert((file.local_revision, file.id), ())?;
		}
		if let Some((sha1, length)) = file.content() {
			let mut by_content = self.txn.open_table(FILES_BY_CONTENT)?;
			by_content.insert((sha1, length, file.id), ())?;
		}
		Ok(())
	}

	fn remove_file_indexes(&self, file: &RepoFile) -> Result<(), StoreError> {
		if let Some(parent) = file.parent {
			let mut children = self.txn.open_table(CHILDREN)?;
			children.remove((parent, file.name.as_str()))?;
		}
		{
			let mut by_revision = self.txn.open_table(FILES_BY_REVISION)?;
			by_revision.remove((file.local_revision, file.id))?;
		}
		if let Some((sha1, length)) = file.content() {
			let mut by_content = self.txn.open_table(FILES_BY_CONTENT)?;
			by_content.remove((sha1, length, file.id))?;
		}
		Ok(())
	}

	/// Nodes whose revision is greater than `revision`
	pub fn repo_files_changed_after(&self, revision: i64) -> Result<Vec<RepoFile>, StoreError> {
		let mut ids = Vec::new();
		{
			let table = self.txn.open_table(FILES_BY_REVISION)?;
			for entry in table.range((revision.saturating_add(1), 0u64)..)? {
				let (key, _) = entry?;
				ids.push(key.value().1);
			}
		}
		self.load_files(ids)
	}

	/// Normal files with the given content
	pub fn normal_files_with_content(&self, sha1: &str, length: u64) -> Result<Vec<RepoFile>, StoreError> {
		let mut ids = Vec::new();
		{
			let table = self.txn.open_table(FILES_BY_CONTENT)?;
			for entry in table.range((sha1, length, 0u64)..=(sha1, length, u64::MAX))? {
				let (key, _) = entry?;
				ids.push(key.value().2);
			}
		}
		self.load_files(ids)
	}

	fn load_files(&self, ids: Vec<u64>) -> Result<Vec<RepoFile>, StoreError> {
		let mut files = Vec::with_capacity(ids.len());
		for id in ids {
			if let Some(file) = self.repo_file(id)? {
				files.push(file);
			}
		}
		Ok(files)
	}

	/// Absolute repository path of a node
	pub fn repo_file_path(&self, file: &RepoFile) -> Result<String, StoreError> {
		let mut names = Vec::new();
		let mut parent = file.parent;
		if parent.is_some() {
			names.push(file.name.clone());
		}
		while let Some(id) = parent {
			let node = self
				.repo_file(id)?
				.ok_or_else(|| StoreError::Corrupted { message: format!("dangling parent {}", id) })?;
			if node.parent.is_some() {
				names.push(node.name.clone());
			}
			parent = node.parent;
		}
		names.reverse();
		Ok(format!("/{}", names.join("/")))
	}

	pub fn repo_file_by_path(&self, path: &str) -> Result<Option<RepoFile>, StoreError> {
		lookup_path(self, path)
	}

	/// Every normal file still flagged as being written
	pub fn in_progress_files(&self) -> Result<Vec<RepoFile>, StoreError> {
		let table = self.txn.open_table(REPO_FILES)?;
		let mut files = Vec::new();
		for entry in table.iter()? {
			let (_, bytes) = entry?;
			let file: RepoFile = decode(bytes.value())?;
			if file.is_in_progress() {
				files.push(file);
			}
		}
		Ok(files)
	}

	// ========================================================================
	// MODIFICATIONS
	// ========================================================================

	pub fn add_modification(
		&mut self,
		remote_repository_id: Uuid,
		kind: ModificationKind,
	) -> Result<Modification, StoreError> {
		let local_revision = self.stamp()?;
		let modification = Modification { id: self.next_id()?, remote_repository_id, local_revision, kind };
		let bytes = serde_json::to_vec(&modification)?;
		let remote = remote_repository_id.to_string();
		{
			let mut table = self.txn.open_table(MODIFICATIONS)?;
			table.insert(modification.id, bytes.as_slice())?;
		}
		{
			let mut by_remote = self.txn.open_table(MODIFICATIONS_BY_REMOTE)?;
			by_remote.insert((remote.as_str(), local_revision, modification.id), ())?;
		}
		if let ModificationKind::Delete { length: Some(length), sha1: Some(sha1), .. } = &modification.kind {
			let mut by_content = self.txn.open_table(DELETES_BY_CONTENT)?;
			by_content.insert((sha1.as_str(), *length, modification.id), ())?;
		}
		Ok(modification)
	}

	fn modification(&self, id: u64) -> Result<Option<Modification>, StoreError> {
		let table = self.txn.open_table(MODIFICATIONS)?;
		let modification = match table.get(id)? {
			Some(bytes) => Some(decode(bytes.value())?),
			None => None,
		};
		Ok(modification)
	}

	/// Modifications for a remote with revision greater than `revision`, oldest first
	pub fn modifications_after(&self, remote_repository_id: Uuid, revision: i64) -> Result<Vec<Modification>, StoreError> {
		let remote = remote_repository_id.to_string();
		let mut ids = Vec::new();
		{
			let table = self.txn.open_table(MODIFICATIONS_BY_REMOTE)?;
			let from = (remote.as_str(), revision.saturating_add(1), 0u64);
			let to = (remote.as_str(), i64::MAX, u64::MAX);
			for entry in table.range(from..=to)? {
				let (key, _) = entry?;
				ids.push(key.value().2);
			}
		}
		let mut modifications = Vec::with_capacity(ids.len());
		for id in ids {
			if let Some(m) = self.modification(id)? {
				modifications.push(m);
			}
		}
		Ok(modifications)
	}

	/// Historical delete modifications (any remote) of the given content
	pub fn delete_modifications_with_content(&self, sha1: &str, length: u64) -> Result<Vec<Modification>, StoreError> {
		let mut ids = Vec::new();
		{
			let table = self.txn.open_table(DELETES_BY_CONTENT)?;
			for entry in table.range((sha1, length, 0u64)..=(sha1, length, u64::MAX))? {
				let (key, _) = entry?;
				ids.push(key.value().2);
			}
		}
		let mut modifications = Vec::with_capacity(ids.len());
		for id in ids {
			if let Some(m) = self.modification(id)? {
				modifications.push(m);
			}
		}
		Ok(modifications)
	}

	fn remove_modification(&self, modification: &Modification) -> Result<(), StoreError> {
		let remote = modification.remote_repository_id.to_string();
		{
			let mut table = self.txn.open_table(MODIFICATIONS)?;
			table.remove(modification.id)?;
		}
		{
			let mut by_remote = self.txn.open_table(MODIFICATIONS_BY_REMOTE)?;
			by_remote.remove((remote.as_str(), modification.local_revision, modification.id))?;
		}
		if let ModificationKind::Delete { length: Some(length), sha1: Some(sha1), .. } = &modification.kind {
			let mut by_content = self.txn.open_table(DELETES_BY_CONTENT)?;
			by_content.remove((sha1.as_str(), *length, modification.id))?;
		}
		Ok(())
	}

	/// Drop a remote's modifications with revision <= `up_to`
	pub fn prune_modifications(&self, remote_repository_id: Uuid, up_to: i64) -> Result<usize, StoreError> {
		let remote = remote_repository_id.to_string();
		let mut ids = Vec::new();
		{
			let table = self.txn.open_table(MODIFICATIONS_BY_REMOTE)?;
			let from = (remote.as_str(), i64::MIN, 0u64);
			let to = (remote.as_str(), up_to, u64::MAX);
			for entry in table.range(from..=to)? {
				let (key, _) = entry?;
				ids.push(key.value().2);
			}
		}
		let mut removed = 0;
		for id in ids {
			if let Some(m) = self.modification(id)? {
				self.remove_modification(&m)?;
				removed += 1;
			}
		}
		Ok(removed)
	}

	// ========================================================================
	// REMOTE REPOSITORIES
	// ========================================================================

	pub fn remote_repositories(&self) -> Result<Vec<RemoteRepository>, StoreError> {
		let table = self.txn.open_table(REMOTE_REPOSITORIES)?;
		let mut remotes = Vec::new();
		for entry in table.iter()? {
			let (_, bytes) = entry?;
			remotes.push(decode(bytes.value())?);
		}
		Ok(remotes)
	}

	pub fn remote_repository(&self, id: Uuid) -> Result<Option<RemoteRepository>, StoreError> {
		let table = self.txn.open_table(REMOTE_REPOSITORIES)?;
		let remote = match table.get(id.to_string().as_str())? {
			Some(bytes) => Some(decode(bytes.value())?),
			None => None,
		};
		Ok(remote)
	}

	pub fn save_remote_repository(&self, remote: &RemoteRepository) -> Result<(), StoreError> {
		let bytes = serde_json::to_vec(remote)?;
		let mut table = self.txn.open_table(REMOTE_REPOSITORIES)?;
		table.insert(remote.repository_id.to_string().as_str(), bytes.as_slice())?;
		Ok(())
	}

	/// Remove a remote together with its modifications and sync bookkeeping
	pub fn remove_remote_repository(&self, id: Uuid) -> Result<bool, StoreError> {
		let key = id.to_string();
		let existed = {
			let mut table = self.txn.open_table(REMOTE_REPOSITORIES)?;
			let existed = table.remove(key.as_str())?.is_some();
			existed
		};
		self.prune_modifications(id, i64::MAX)?;
		let mut last_sync = self.txn.open_table(LAST_SYNC)?;
		last_sync.remove(key.as_str())?;
		Ok(existed)
	}

	// ========================================================================
	// CONNECTION REQUESTS
	// ========================================================================

	pub fn connection_requests(&self) -> Result<Vec<RemoteRepositoryRequest>, StoreError> {
		let table = self.txn.open_table(CONNECTION_REQUESTS)?;
		let mut requests = Vec::new();
		for entry in table.iter()? {
			let (_, bytes) = entry?;
			requests.push(decode(bytes.value())?);
		}
		Ok(requests)
	}

	pub fn connection_request(&self, id: Uuid) -> Result<Option<RemoteRepositoryRequest>, StoreError> {
		let table = self.txn.open_table(CONNECTION_REQUESTS)?;
		let request = match table.get(id.to_string().as_str())? {
			Some(bytes) => Some(decode(bytes.value())?),
			None => None,
		};
		Ok(request)
	}

	pub fn save_connection_request(&self, request: &RemoteRepositoryRequest) -> Result<(), StoreError> {
		let bytes = serde_json::to_vec(request)?;
		let mut table = self.txn.open_table(CONNECTION_REQUESTS)?;
		table.insert(request.repository_id.to_string().as_str(), bytes.as_slice())?;
		Ok(())
	}

	pub fn remove_connection_request(&self, id: Uuid) -> Result<bool, StoreError> {
		let mut table = self.txn.open_table(CONNECTION_REQUESTS)?;
		let existed = table.remove(id.to_string().as_str())?.is_some();
		Ok(existed)
	}

	// ========================================================================
	// LAST SYNC BOOKKEEPING
	// ========================================================================

	pub fn last_sync_to_remote(&self, id: Uuid) -> Result<Option<LastSyncToRemoteRepo>, StoreError> {
		let table = self.txn.open_table(LAST_SYNC)?;
		let last_sync = match table.get(id.to_string().as_str())? {
			Some(bytes) => Some(decode(bytes.value())?),
			None => None,
		};
		Ok(last_sync)
	}

	/// Stored bookkeeping, or the "never synced" state
	pub fn last_sync_to_remote_or_default(&self, id: Uuid) -> Result<LastSyncToRemoteRepo, StoreError> {
		Ok(self.last_sync_to_remote(id)?.unwrap_or_else(|| LastSyncToRemoteRepo::new(id)))
	}

	pub fn save_last_sync_to_remote(&self, last_sync: &LastSyncToRemoteRepo) -> Result<(), StoreError> {
		let bytes = serde_json::to_vec(last_sync)?;
		let mut table = self.txn.open_table(LAST_SYNC)?;
		table.insert(last_sync.remote_repository_id.to_string().as_str(), bytes.as_slice())?;
		Ok(())
	}

	/// Revision up to which local changes were delivered to a remote
	pub fn synced_revision(&self, id: Uuid) -> Result<i64, StoreError> {
		Ok(self.last_sync_to_remote(id)?.map(|l| l.local_repository_revision_synced).unwrap_or(-1))
	}
}

// vim: ts=4
