//! # Replicr - Peer-to-Peer File Repository Replicator
//!
//! Replicr keeps directory trees ("repositories") on several peers in sync.
//! Each repository records its files in a local metadata store, stamped
//! with a monotonically increasing revision, so that a peer only has to
//! exchange what changed since the last sync with the other side. Files
//! are compared and transferred chunk by chunk using SHA-1 digests.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use replicr::{Config, RepoRegistry, SyncDaemon, TransportRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = RepoRegistry::new(Arc::new(Config::default()));
//!     let daemon = SyncDaemon::new(registry.clone(), TransportRegistry::with_local(registry));
//!     let repository_id = daemon.start_sync("./docs".as_ref()).await?;
//!     daemon.shutdown().await;
//!     for state in daemon.states(repository_id) {
//!         println!("{}: {}", state.url, state.message);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## One Session by Hand
//!
//! ```rust,ignore
//! use replicr::sync::RepoToRepoSync;
//!
//! let report = RepoToRepoSync::new(registry, transports, root, peer_id).sync().await?;
//! println!("{} bytes transferred", report.bytes_transferred());
//! ```

pub mod callbacks;
pub mod change_set;
pub mod chunking;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod repo;
pub mod scan;
pub mod store;
pub mod sync;
pub mod transport;
pub mod types;
pub mod util;

// Re-export commonly used types
pub use config::Config;
pub use daemon::{RepoSyncState, SyncDaemon};
pub use error::{ConfigError, RepoError, StoreError, SyncError, TransportError};
pub use repo::{LocalRepoManager, RepoHandle, RepoRegistry};
pub use sync::{RepoToRepoSync, SyncReport};
pub use transport::{RepoTransport, TransportRegistry};
pub use types::{FileChunk, RemoteRepository, RepoFile, RepoFileKind};

// vim: ts=4
