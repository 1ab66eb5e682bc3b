//! Embedded metadata store of one repository
//!
//! Every table lives in a single redb database under the repository's
//! metadata directory. Values are JSON; secondary indexes are tuple-keyed
//! tables with unit values so that range scans answer the lookups the
//! scanner and the change-set builder need.

mod transaction;

pub use transaction::LocalRepoTransaction;

use redb::{ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::StoreError;
use crate::logging::*;
use crate::types::{RepoFile, RepoFileKind};
use crate::util;

/// Bumped whenever the table layout changes
pub const SCHEMA_VERSION: u32 = 1;

/// Key: RepoFile id. Value: JSON RepoFile
pub(crate) const REPO_FILES: TableDefinition<u64, &[u8]> = TableDefinition::new("repo_files");

/// Key: (parent id, name). Value: child id
pub(crate) const CHILDREN: TableDefinition<(u64, &str), u64> = TableDefinition::new("repo_file_children");

/// Key: (local revision, RepoFile id)
pub(crate) const FILES_BY_REVISION: TableDefinition<(i64, u64), ()> =
	TableDefinition::new("repo_files_by_revision");

/// Key: (sha1, length, RepoFile id) for normal files
pub(crate) const FILES_BY_CONTENT: TableDefinition<(&str, u64, u64), ()> =
	TableDefinition::new("repo_files_by_content");

/// Key: Modification id. Value: JSON Modification
pub(crate) const MODIFICATIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("modifications");

/// Key: (remote repository id, local revision, Modification id)
pub(crate) const MODIFICATIONS_BY_REMOTE: TableDefinition<(&str, i64, u64), ()> =
	TableDefinition::new("modifications_by_remote");

/// Key: (sha1, length, Modification id) for delete modifications with content
pub(crate) const DELETES_BY_CONTENT: TableDefinition<(&str, u64, u64), ()> =
	TableDefinition::new("delete_modifications_by_content");

/// Key: remote repository id. Value: JSON RemoteRepository
pub(crate) const REMOTE_REPOSITORIES: TableDefinition<&str, &[u8]> = TableDefinition::new("remote_repositories");

/// Key: requesting repository id. Value: JSON RemoteRepositoryRequest
pub(crate) const CONNECTION_REQUESTS: TableDefinition<&str, &[u8]> =
	TableDefinition::new("remote_repository_requests");

/// Key: remote repository id. Value: JSON LastSyncToRemoteRepo
pub(crate) const LAST_SYNC: TableDefinition<&str, &[u8]> = TableDefinition::new("last_sync_to_remote_repo");

/// Key: property name. Value: JSON value
pub(crate) const PROPERTIES: TableDefinition<&str, &[u8]> = TableDefinition::new("properties");

pub(crate) const PROP_SCHEMA_VERSION: &str = "schemaVersion";
pub(crate) const PROP_REPOSITORY_ID: &str = "repositoryId";
pub(crate) const PROP_PUBLIC_KEY: &str = "publicKey";
pub(crate) const PROP_LOCAL_REVISION: &str = "localRevision";
pub(crate) const PROP_NEXT_ID: &str = "nextId";
pub(crate) const PROP_ROOT_ID: &str = "rootId";

/// Handle to an open metadata database
pub struct RepoStore {
	db: redb::Database,
	path: PathBuf,
}

impl RepoStore {
	/// Create a new store with its identity and the root directory node
	pub fn create(
		path: &Path,
		repository_id: Uuid,
		public_key: &[u8],
		root_last_modified: i64,
	) -> Result<Self, StoreError> {
		let db = redb::Database::create(path)?;
		let store = RepoStore { db, path: path.to_path_buf() };

		let mut tx = store.begin()?;
		tx.create_tables()?;
		tx.set_property(PROP_SCHEMA_VERSION, &SCHEMA_VERSION)?;
		tx.set_property(PROP_REPOSITORY_ID, &repository_id)?;
		tx.set_property(PROP_PUBLIC_KEY, &hex::encode(public_key))?;
		tx.set_property(PROP_NEXT_ID, &1u64)?;

		let mut root = RepoFile::new(None, "", root_last_modified, RepoFileKind::Directory);
		tx.save_repo_file(&mut root)?;
		tx.set_property(PROP_ROOT_ID, &root.id)?;
		tx.commit()?;

		info!("Created metadata store {} for repository {}", path.display(), repository_id);
		Ok(store)
	}

	/// Open an existing store, checking its schema version
	pub fn open(path: &Path) -> Result<Self, StoreError> {
		let db = redb::Database::open(path)?;
		let store = RepoStore { db, path: path.to_path_buf() };
		let version: u32 = store
			.read_property(PROP_SCHEMA_VERSION)?
			.ok_or_else(|| StoreError::Corrupted { message: "schema version missing".to_string() })?;
		if version != SCHEMA_VERSION {
			return Err(StoreError::VersionMismatch { found: version, expected: SCHEMA_VERSION });
		}
		Ok(store)
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Start a write transaction
	pub fn begin(&self) -> Result<LocalRepoTransaction, StoreError> {
		Ok(LocalRepoTransaction::new(self.db.begin_write()?))
	}

	fn read_property<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(PROPERTIES)?;
		let value = match table.get(key)? {
			Some(bytes) => Some(serde_json::from_slice(bytes.value())?),
			None => None,
		};
		Ok(value)
	}

	pub fn repository_id(&self) -> Result<Uuid, StoreError> {
		self.read_property(PROP_REPOSITORY_ID)?
			.ok_or_else(|| StoreError::Corrupted { message: "repository id missing".to_string() })
	}

	pub fn public_key(&self) -> Result<Vec<u8>, StoreError> {
		let encoded: String = self
			.read_property(PROP_PUBLIC_KEY)?
			.ok_or_else(|| StoreError::Corrupted { message: "public key missing".to_string() })?;
		hex::decode(encoded).map_err(|e| StoreError::Corrupted { message: format!("public key: {}", e) })
	}

	/// Last committed revision (-1 for an empty store)
	pub fn local_revision(&self) -> Result<i64, StoreError> {
		Ok(self.read_property(PROP_LOCAL_REVISION)?.unwrap_or(-1))
	}

	/// Number of persisted repo files, root included
	pub fn repo_file_count(&self) -> Result<u64, StoreError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(REPO_FILES)?;
		Ok(table.len()?)
	}
}

/// Resolve a repository path to its node, walking from the root
pub(crate) fn lookup_path(tx: &LocalRepoTransaction, path: &str) -> Result<Option<RepoFile>, StoreError> {
	let mut current = tx.root()?;
	for segment in util::segments(path) {
		match tx.child(current.id, segment)? {
			Some(child) => current = child,
			None => return Ok(None),
		}
	}
	Ok(Some(current))
}


// vim: ts=4
