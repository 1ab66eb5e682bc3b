//! Persistent entity types of a repository

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed-size slice of a file with its digest
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
	pub offset: u64,
	pub length: u64,
	pub sha1: String,
}

/// Type-specific part of a [`RepoFile`]
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RepoFileKind {
	Directory,
	Symlink {
		target: String,
	},
	#[serde(rename_all = "camelCase")]
	NormalFile {
		length: u64,
		sha1: String,
		chunks: Vec<FileChunk>,
		/// A peer is currently writing this file through a temp file
		in_progress: bool,
	},
}

impl RepoFileKind {
	pub fn type_name(&self) -> &'static str {
		match self {
			RepoFileKind::Directory => "directory",
			RepoFileKind::Symlink { .. } => "symlink",
			RepoFileKind::NormalFile { .. } => "file",
		}
	}

	/// Same variant, ignoring the payload
	pub fn same_type(&self, other: &RepoFileKind) -> bool {
		std::mem::discriminant(self) == std::mem::discriminant(other)
	}
}

/// One node of the repository tree
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoFile {
	/// 0 until first saved
	pub id: u64,
	/// None only for the repository root
	pub parent: Option<u64>,
	pub name: String,
	/// Milliseconds since the Unix epoch
	pub last_modified: i64,
	/// Revision of the transaction that last changed this node
	pub local_revision: i64,
	/// Peer that most recently wrote this node, if any
	pub last_sync_from_repository_id: Option<Uuid>,
	pub kind: RepoFileKind,
}

impl RepoFile {
	pub fn new(parent: Option<u64>, name: &str, last_modified: i64, kind: RepoFileKind) -> Self {
		RepoFile {
			id: 0,
			parent,
			name: name.to_string(),
			last_modified,
			local_revision: -1,
			last_sync_from_repository_id: None,
			kind,
		}
	}

	pub fn is_directory(&self) -> bool {
		matches!(self.kind, RepoFileKind::Directory)
	}

	pub fn is_normal_file(&self) -> bool {
		matches!(self.kind, RepoFileKind::NormalFile { .. })
	}

	pub fn is_in_progress(&self) -> bool {
		matches!(self.kind, RepoFileKind::NormalFile { in_progress: true, .. })
	}

	/// (sha1, length) of a normal file
	pub fn content(&self) -> Option<(&str, u64)> {
		match &self.kind {
			RepoFileKind::NormalFile { sha1, length, .. } => Some((sha1.as_str(), *length)),
			_ => None,
		}
	}

	pub fn set_in_progress(&mut self, value: bool) {
		if let RepoFileKind::NormalFile { in_progress, .. } = &mut self.kind {
			*in_progress = value;
		}
	}
}

/// Change that a peer must replay and that cannot be derived from the tree
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ModificationKind {
	#[serde(rename_all = "camelCase")]
	Delete { path: String, length: Option<u64>, sha1: Option<String> },
	#[serde(rename_all = "camelCase")]
	Copy { from_path: String, to_path: String, length: u64, sha1: String },
}

/// A modification queued for exactly one remote repository
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Modification {
	pub id: u64,
	pub remote_repository_id: Uuid,
	pub local_revision: i64,
	pub kind: ModificationKind,
}

/// A connected peer
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRepository {
	pub repository_id: Uuid,
	/// URL of the peer; None for inbound-only links
	pub remote_root: Option<String>,
	pub public_key: Vec<u8>,
	/// Last revision of the peer applied locally
	pub revision: i64,
	/// Sub-tree of this repository exposed to the peer
	pub local_path_prefix: String,
	/// Local revision reached by the last download from the peer
	pub local_revision: i64,
}

impl RemoteRepository {
	pub fn new(repository_id: Uuid, remote_root: Option<String>, public_key: Vec<u8>, prefix: &str) -> Self {
		RemoteRepository {
			repository_id,
			remote_root,
			public_key,
			revision: -1,
			local_path_prefix: prefix.to_string(),
			local_revision: -1,
		}
	}
}

/// Pending inbound connection request
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRepositoryRequest {
	pub repository_id: Uuid,
	pub public_key: Vec<u8>,
	pub local_path_prefix: String,
	/// Milliseconds since the Unix epoch
	pub created: i64,
}

/// Per-peer bookkeeping of what has been delivered
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSyncToRemoteRepo {
	pub remote_repository_id: Uuid,
	pub local_repository_revision_synced: i64,
	pub local_repository_revision_in_progress: i64,
}

impl LastSyncToRemoteRepo {
	pub fn new(remote_repository_id: Uuid) -> Self {
		LastSyncToRemoteRepo {
			remote_repository_id,
			local_repository_revision_synced: -1,
			local_repository_revision_in_progress: -1,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_repo_file_kind_serialization() {
		let file = RepoFile::new(
			Some(1),
			"a.txt",
			1000,
			RepoFileKind::NormalFile { length: 3, sha1: "abc".into(), chunks: vec![], in_progress: false },
		);
		let json = serde_json::to_string(&file).unwrap();
		assert!(json.contains("\"type\":\"normalFile\""));
		assert!(json.contains("inProgress"));
		let back: RepoFile = serde_json::from_str(&json).unwrap();
		assert_eq!(back, file);
	}

	#[test]
	fn test_same_type() {
		let dir = RepoFileKind::Directory;
		let link = RepoFileKind::Symlink { target: "x".into() };
		let link2 = RepoFileKind::Symlink { target: "y".into() };
		assert!(link.same_type(&link2));
		assert!(!dir.same_type(&link));
	}

	#[test]
	fn test_in_progress_flag() {
		let mut file = RepoFile::new(
			None,
			"f",
			0,
			RepoFileKind::NormalFile { length: 0, sha1: String::new(), chunks: vec![], in_progress: false },
		);
		assert!(!file.is_in_progress());
		file.set_in_progress(true);
		assert!(file.is_in_progress());

		let mut dir = RepoFile::new(None, "", 0, RepoFileKind::Directory);
		dir.set_in_progress(true);
		assert!(!dir.is_in_progress());
	}
}

// vim: ts=4
