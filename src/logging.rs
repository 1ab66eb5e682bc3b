//! Logging prelude for convenient access to tracing macros.
//!
//! ```ignore
//! use crate::logging::*;
//!
//! info!("Sync session started");
//! debug!("Skipping unchanged file");
//! ```

pub use tracing::{debug, error, info, warn};

/// Initialize the tracing subscriber with environment filter support.
///
/// Logs at INFO level and above by default. The library never calls this
/// itself; binaries do. Control the level with `RUST_LOG`:
///
/// ```bash
/// RUST_LOG=debug replicr sync ~/docs
/// RUST_LOG=replicr::scan=debug,replicr::sync=trace replicr sync ~/docs
/// ```
pub fn init_tracing() {
	init_tracing_with_default("info");
}

/// Same as [`init_tracing`], with an explicit fallback filter used when
/// `RUST_LOG` is unset.
pub fn init_tracing_with_default(default_filter: &str) {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
		)
		.with_writer(std::io::stderr)
		.try_init();
}

// vim: ts=4
