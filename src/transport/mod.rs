//! Repository transport abstraction
//!
//! The sync engine talks to both ends of a session only through
//! `RepoTransport`. A transport is bound to one repository URL and to the
//! client repository on whose behalf it acts; every path it accepts or
//! returns is relative to the path prefix of its URL.

pub mod factory;
pub mod local;

pub use factory::{LocalTransportFactory, TransportFactory, TransportRegistry};
pub use local::LocalRepoTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change_set::ChangeSet;
use crate::error::TransportError;
use crate::types::FileChunk;
use crate::util;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Current state of a file as seen by a transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunkSet {
	pub exists: bool,
	pub length: u64,
	pub last_modified: i64,
	pub sha1: Option<String>,
	pub chunks: Vec<FileChunk>,
}

impl FileChunkSet {
	pub fn missing() -> Self {
		FileChunkSet { exists: false, length: 0, last_modified: 0, sha1: None, chunks: Vec::new() }
	}

	/// Same length, timestamp and digest
	pub fn is_equal_to(&self, other: &FileChunkSet) -> bool {
		self.exists && other.exists
			&& self.length == other.length
			&& self.last_modified == other.last_modified
			&& self.sha1.is_some()
			&& self.sha1 == other.sha1
	}

	pub fn has_content(&self, sha1: &str, length: u64) -> bool {
		self.exists && self.length == length && self.sha1.as_deref() == Some(sha1)
	}
}

/// Operations one side of a sync session offers
#[async_trait]
pub trait RepoTransport: Send + Sync {
	// === Identity ===

	/// URL this transport was created for
	fn url(&self) -> &str;

	/// Repository on whose behalf this transport acts
	fn client_repository_id(&self) -> Uuid;

	/// Repository path that appears as "/" through this transport
	fn path_prefix(&self) -> &str;

	/// Repository path of a transport path
	fn prefix_path(&self, path: &str) -> String {
		util::prefix_path(self.path_prefix(), path)
	}

	/// Transport path of a repository path; None outside the prefix
	fn unprefix_path(&self, path: &str) -> Option<String> {
		util::unprefix_path(self.path_prefix(), path)
	}

	async fn repository_id(&self) -> TransportResult<Uuid>;

	async fn public_key(&self) -> TransportResult<Vec<u8>>;

	/// Ask the repository to accept the client as a peer
	async fn request_repo_connection(&self, public_key: &[u8]) -> TransportResult<()>;

	// === Change-sets ===

	/// Changes since the last revision delivered to the client. With
	/// `local_sync` the repository is rescanned first.
	async fn change_set(&self, local_sync: bool, since_revision: Option<i64>) -> TransportResult<ChangeSet>;

	/// The client received and applied the last change-set. Entries in
	/// `retry_paths` were not taken by the client; they and everything
	/// below them stay pending for the next change-set.
	async fn end_sync_from_repository(&self, retry_paths: &[String]) -> TransportResult<()>;

	/// The client delivered everything up to its `from_revision`
	async fn end_sync_to_repository(&self, from_revision: i64) -> TransportResult<()>;

	// === Tree operations ===

	async fn make_directory(&self, path: &str, last_modified: Option<i64>) -> TransportResult<()>;

	async fn make_symlink(&self, path: &str, target: &str, last_modified: i64) -> TransportResult<()>;

	async fn copy(&self, from_path: &str, to_path: &str) -> TransportResult<()>;

	async fn move_file(&self, from_path: &str, to_path: &str) -> TransportResult<()>;

	async fn delete(&self, path: &str) -> TransportResult<()>;

	// === File contents ===

	/// Chunk layout of a file; `allow_cached` permits answering from
	/// metadata without a rescan
	async fn file_chunk_set(&self, path: &str, allow_cached: bool) -> TransportResult<FileChunkSet>;

	/// Raw bytes of a file range; None if the file does not exist
	async fn file_data(&self, path: &str, offset: u64, length: u64) -> TransportResult<Option<Vec<u8>>>;

	async fn begin_put_file(&self, path: &str) -> TransportResult<()>;

	async fn put_file_data(&self, path: &str, offset: u64, data: &[u8]) -> TransportResult<()>;

	async fn end_put_file(&self, path: &str, last_modified: i64, length: u64, sha1: Option<&str>) -> TransportResult<()>;

	/// Give up a transfer started with `begin_put_file`; the file keeps its
	/// previous content
	async fn abort_put_file(&self, path: &str) -> TransportResult<()>;

	// === Lifecycle ===

	async fn close(&self) -> TransportResult<()>;
}


// vim: ts=4
