//! Error types for replicr operations

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Errors raised by the embedded metadata store
#[derive(Debug)]
pub enum StoreError {
	/// Underlying database failure
	Database(redb::Error),

	/// A stored value could not be encoded or decoded
	Serialization(serde_json::Error),

	/// Metadata is inconsistent (missing root, dangling parent, ...)
	Corrupted { message: String },

	/// The store was written by an incompatible schema version
	VersionMismatch { found: u32, expected: u32 },
}

impl fmt::Display for StoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StoreError::Database(e) => write!(f, "Database error: {}", e),
			StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
			StoreError::Corrupted { message } => write!(f, "Metadata corrupted: {}", message),
			StoreError::VersionMismatch { found, expected } => {
				write!(f, "Metadata schema version {} is not supported (expected {})", found, expected)
			}
		}
	}
}

impl Error for StoreError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			StoreError::Database(e) => Some(e),
			StoreError::Serialization(e) => Some(e),
			_ => None,
		}
	}
}

impl From<redb::Error> for StoreError {
	fn from(e: redb::Error) -> Self {
		StoreError::Database(e)
	}
}

impl From<redb::DatabaseError> for StoreError {
	fn from(e: redb::DatabaseError) -> Self {
		StoreError::Database(e.into())
	}
}

impl From<redb::TransactionError> for StoreError {
	fn from(e: redb::TransactionError) -> Self {
		StoreError::Database(e.into())
	}
}

impl From<redb::TableError> for StoreError {
	fn from(e: redb::TableError) -> Self {
		StoreError::Database(e.into())
	}
}

impl From<redb::StorageError> for StoreError {
	fn from(e: redb::StorageError) -> Self {
		StoreError::Database(e.into())
	}
}

impl From<redb::CommitError> for StoreError {
	fn from(e: redb::CommitError) -> Self {
		StoreError::Database(e.into())
	}
}

impl From<serde_json::Error> for StoreError {
	fn from(e: serde_json::Error) -> Self {
		StoreError::Serialization(e)
	}
}

/// Local repository errors
#[derive(Debug)]
pub enum RepoError {
	/// No repository contains the given path
	NotFound { path: PathBuf },

	/// A repository already exists at (or above) the given path
	AlreadyExists { path: PathBuf },

	/// The repository lock could not be acquired in time
	LockTimeout { path: PathBuf, waited: Duration },

	/// Path is not a valid repository path
	InvalidPath { path: String },

	/// No pending connection request for the given repository
	NoConnectionRequest { repository_id: Uuid },

	/// A connected peer presented a different public key
	PublicKeyMismatch { repository_id: Uuid },

	/// I/O error
	Io(io::Error),

	/// Metadata store error
	Store(StoreError),
}

impl fmt::Display for RepoError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RepoError::NotFound { path } => {
				write!(f, "No repository found at or above {}", path.display())
			}
			RepoError::AlreadyExists { path } => {
				write!(f, "Repository already exists: {}", path.display())
			}
			RepoError::LockTimeout { path, waited } => {
				write!(f, "Could not lock repository {} within {:?}", path.display(), waited)
			}
			RepoError::InvalidPath { path } => write!(f, "Invalid repository path: {}", path),
			RepoError::NoConnectionRequest { repository_id } => {
				write!(f, "No connection request from repository {}", repository_id)
			}
			RepoError::PublicKeyMismatch { repository_id } => {
				write!(f, "Repository {} presented an unexpected public key", repository_id)
			}
			RepoError::Io(e) => write!(f, "I/O error: {}", e),
			RepoError::Store(e) => write!(f, "Store error: {}", e),
		}
	}
}

impl Error for RepoError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			RepoError::Io(e) => Some(e),
			RepoError::Store(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for RepoError {
	fn from(e: io::Error) -> Self {
		RepoError::Io(e)
	}
}

impl From<StoreError> for RepoError {
	fn from(e: StoreError) -> Self {
		RepoError::Store(e)
	}
}

/// Transport-level errors
#[derive(Debug)]
pub enum TransportError {
	/// Destination was modified independently of the writing peer
	Collision { path: String },

	/// Path does not exist or has the wrong type for the operation
	NotFound { path: String },

	/// The repository behind a URL is not the one recorded for it
	IdentityMismatch { url: String, expected: Uuid, actual: Uuid },

	/// No transport is available for the URL
	Unsupported { url: String },

	/// The client repository is not connected to this repository
	NotConnected { repository_id: Uuid },

	/// I/O error
	Io(io::Error),

	/// Local repository error
	Repo(RepoError),

	/// A blocking task panicked or was cancelled
	Task { message: String },
}

impl TransportError {
	/// Collisions are skipped by the sync engine instead of failing the session
	pub fn is_collision(&self) -> bool {
		matches!(self, TransportError::Collision { .. })
	}

	/// Per-item conditions that do not abort a sync session
	pub fn is_recoverable(&self) -> bool {
		matches!(self, TransportError::Collision { .. } | TransportError::NotFound { .. })
	}
}

impl fmt::Display for TransportError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransportError::Collision { path } => write!(f, "Collision at {}", path),
			TransportError::NotFound { path } => write!(f, "Not found: {}", path),
			TransportError::IdentityMismatch { url, expected, actual } => {
				write!(f, "Repository at {} is {}, expected {}", url, actual, expected)
			}
			TransportError::Unsupported { url } => write!(f, "Unsupported repository URL: {}", url),
			TransportError::NotConnected { repository_id } => {
				write!(f, "Repository {} is not connected", repository_id)
			}
			TransportError::Io(e) => write!(f, "I/O error: {}", e),
			TransportError::Repo(e) => write!(f, "{}", e),
			TransportError::Task { message } => write!(f, "Background task failed: {}", message),
		}
	}
}

impl Error for TransportError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			TransportError::Io(e) => Some(e),
			TransportError::Repo(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for TransportError {
	fn from(e: io::Error) -> Self {
		TransportError::Io(e)
	}
}

impl From<RepoError> for TransportError {
	fn from(e: RepoError) -> Self {
		TransportError::Repo(e)
	}
}

impl From<StoreError> for TransportError {
	fn from(e: StoreError) -> Self {
		TransportError::Repo(RepoError::Store(e))
	}
}

impl From<tokio::task::JoinError> for TransportError {
	fn from(e: tokio::task::JoinError) -> Self {
		TransportError::Task { message: e.to_string() }
	}
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
	/// Config file could not be read
	Io { path: PathBuf, source: io::Error },

	/// Config file could not be parsed
	Parse { path: PathBuf, message: String },

	/// A value is out of range
	Invalid { message: String },
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConfigError::Io { path, source } => {
				write!(f, "Failed to read config {}: {}", path.display(), source)
			}
			ConfigError::Parse { path, message } => {
				write!(f, "Failed to parse config {}: {}", path.display(), message)
			}
			ConfigError::Invalid { message } => write!(f, "Invalid configuration: {}", message),
		}
	}
}

impl Error for ConfigError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			ConfigError::Io { source, .. } => Some(source),
			_ => None,
		}
	}
}

/// Session-level sync errors
#[derive(Debug)]
pub enum SyncError {
	/// Remote repository is not registered locally
	UnknownRemote { repository_id: Uuid },

	/// Remote repository has no URL to connect to
	NoRemoteRoot { repository_id: Uuid },

	/// The daemon no longer accepts work
	ShuttingDown,

	/// Transport error
	Transport(TransportError),

	/// Local repository error
	Repo(RepoError),

	/// Configuration error
	Config(ConfigError),
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::UnknownRemote { repository_id } => {
				write!(f, "Remote repository {} is not connected", repository_id)
			}
			SyncError::NoRemoteRoot { repository_id } => {
				write!(f, "Remote repository {} has no URL", repository_id)
			}
			SyncError::ShuttingDown => write!(f, "Sync daemon is shutting down"),
			SyncError::Transport(e) => write!(f, "Transport error: {}", e),
			SyncError::Repo(e) => write!(f, "Repository error: {}", e),
			SyncError::Config(e) => write!(f, "{}", e),
		}
	}
}

impl Error for SyncError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			SyncError::Transport(e) => Some(e),
			SyncError::Repo(e) => Some(e),
			SyncError::Config(e) => Some(e),
			_ => None,
		}
	}
}

impl From<TransportError> for SyncError {
	fn from(e: TransportError) -> Self {
		SyncError::Transport(e)
	}
}

impl From<RepoError> for SyncError {
	fn from(e: RepoError) -> Self {
		SyncError::Repo(e)
	}
}

impl From<StoreError> for SyncError {
	fn from(e: StoreError) -> Self {
		SyncError::Repo(RepoError::Store(e))
	}
}

impl From<ConfigError> for SyncError {
	fn from(e: ConfigError) -> Self {
		SyncError::Config(e)
	}
}

impl From<tokio::task::JoinError> for SyncError {
	fn from(e: tokio::task::JoinError) -> Self {
		SyncError::Transport(TransportError::from(e))
	}
}

/// Render an error and its `source()` chain, outermost first
pub fn error_chain(e: &(dyn Error + 'static)) -> Vec<String> {
	let mut chain = vec![e.to_string()];
	let mut current = e.source();
	while let Some(cause) = current {
		chain.push(cause.to_string());
		current = cause.source();
	}
	chain
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_collision_is_recoverable() {
		let e = TransportError::Collision { path: "/a".to_string() };
		assert!(e.is_collision());
		assert!(e.is_recoverable());
		let e = TransportError::Io(io::Error::new(io::ErrorKind::Other, "boom"));
		assert!(!e.is_recoverable());
	}

	#[test]
	fn test_error_chain() {
		let io = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
		let e = SyncError::Transport(TransportError::Repo(RepoError::Io(io)));
		let chain = error_chain(&e);
		assert_eq!(chain.len(), 4);
		assert!(chain[0].starts_with("Transport error"));
		assert_eq!(chain[3], "denied");
	}
}

// vim: ts=4
