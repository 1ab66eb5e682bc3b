//! Configuration for replicr
//!
//! All tunables live in one `Config` struct. Priority chain:
//! 1. Built-in defaults (`Config::default()`)
//! 2. Config file (TOML, or JSON5 for `.json`/`.json5`)
//! 3. Environment variables (`REPLICR_*` prefix)

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

// ============================================================================
// MAIN CONFIGURATION STRUCT
// ============================================================================

/// Configuration shared by repositories, transports and the sync daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	// ========================================================================
	// FINGERPRINTING
	// ========================================================================
	/// Size of a file chunk in bytes
	pub chunk_size: u64,

	/// Read buffer used while hashing
	pub read_buffer_size: usize,

	// ========================================================================
	// COPY-MODIFICATION INFERENCE
	// ========================================================================
	/// Upper bounds on copy modifications per new file, by file size.
	/// Tiers are checked in order; the first with `length < below` applies.
	pub copy_modification_tiers: Vec<CopyModificationTier>,

	/// Limit for files larger than every tier
	pub copy_modification_max: usize,

	// ========================================================================
	// REPOSITORY LAYOUT
	// ========================================================================
	/// Name of the metadata directory inside every repository root
	pub meta_dir_name: String,

	/// Prefix of temporary files written during transfers
	pub temp_file_prefix: String,

	/// How long to retry acquiring a repository lock (milliseconds)
	pub lock_timeout_ms: u64,

	/// Idle repositories are closed after this delay (milliseconds)
	pub idle_close_delay_ms: u64,

	// ========================================================================
	// DAEMON
	// ========================================================================
	/// Number of outcomes kept per (repository, peer)
	pub state_history_per_peer: usize,

	/// Repositories synchronized at the same time
	pub max_concurrent_syncs: usize,

	/// Interval of the daemon housekeeping task (milliseconds)
	pub housekeeping_interval_ms: u64,

	// ========================================================================
	// OUTPUT
	// ========================================================================
	/// Default log filter when RUST_LOG is unset
	pub log_level: String,
}

/// One row of the copy-modification size table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyModificationTier {
	/// Applies to files strictly smaller than this
	pub below: u64,

	/// Maximum number of copy sources
	pub max_copies: usize,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			chunk_size: MIB,
			read_buffer_size: 32 * KIB as usize,

			copy_modification_tiers: default_copy_tiers(),
			copy_modification_max: 11,

			meta_dir_name: ".replicr-repo".to_string(),
			temp_file_prefix: ".replicr-tmp_".to_string(),
			lock_timeout_ms: 30_000,
			idle_close_delay_ms: 60_000,

			state_history_per_peer: 10,
			max_concurrent_syncs: 4,
			housekeeping_interval_ms: 10_000,

			log_level: "info".to_string(),
		}
	}
}

fn default_copy_tiers() -> Vec<CopyModificationTier> {
	[(10 * KIB, 0), (100 * KIB, 1), (MIB, 2), (10 * MIB, 3), (100 * MIB, 5), (GIB, 7), (10 * GIB, 9)]
		.iter()
		.map(|&(below, max_copies)| CopyModificationTier { below, max_copies })
		.collect()
}

impl Config {
	/// Load a config file; the format is chosen by extension
	pub fn load(path: &Path) -> Result<Config, ConfigError> {
		let text = std::fs::read_to_string(path)
			.map_err(|e| ConfigError::Io { path: path.to_path_buf(), source: e })?;
		let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
		let config: Config = match ext {
			"json" | "json5" => json5::from_str(&text)
				.map_err(|e| ConfigError::Parse { path: path.to_path_buf(), message: e.to_string() })?,
			_ => toml::from_str(&text)
				.map_err(|e| ConfigError::Parse { path: path.to_path_buf(), message: e.to_string() })?,
		};
		config.validate()?;
		Ok(config)
	}

	/// Override values from `REPLICR_*` environment variables
	pub fn apply_env(mut self) -> Result<Config, ConfigError> {
		self.apply_vars(|name| std::env::var(name).ok())?;
		Ok(self)
	}

	fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
			value.trim().parse().map_err(|_| ConfigError::Invalid {
				message: format!("{}: cannot parse '{}'", name, value),
			})
		}

		if let Some(v) = lookup("REPLICR_CHUNK_SIZE") {
			self.chunk_size = parse("REPLICR_CHUNK_SIZE", &v)?;
		}
		if let Some(v) = lookup("REPLICR_READ_BUFFER_SIZE") {
			self.read_buffer_size = parse("REPLICR_READ_BUFFER_SIZE", &v)?;
		}
		if let Some(v) = lookup("REPLICR_LOCK_TIMEOUT_MS") {
			self.lock_timeout_ms = parse("REPLICR_LOCK_TIMEOUT_MS", &v)?;
		}
		if let Some(v) = lookup("REPLICR_IDLE_CLOSE_DELAY_MS") {
			self.idle_close_delay_ms = parse("REPLICR_IDLE_CLOSE_DELAY_MS", &v)?;
		}
		if let Some(v) = lookup("REPLICR_STATE_HISTORY_PER_PEER") {
			self.state_history_per_peer = parse("REPLICR_STATE_HISTORY_PER_PEER", &v)?;
		}
		if let Some(v) = lookup("REPLICR_MAX_CONCURRENT_SYNCS") {
			self.max_concurrent_syncs = parse("REPLICR_MAX_CONCURRENT_SYNCS", &v)?;
		}
		if let Some(v) = lookup("REPLICR_HOUSEKEEPING_INTERVAL_MS") {
			self.housekeeping_interval_ms = parse("REPLICR_HOUSEKEEPING_INTERVAL_MS", &v)?;
		}
		if let Some(v) = lookup("REPLICR_LOG_LEVEL") {
			self.log_level = v;
		}
		self.validate()
	}

	/// Check value ranges
	pub fn validate(&self) -> Result<(), ConfigError> {
		let invalid = |message: &str| Err(ConfigError::Invalid { message: message.to_string() });

		if self.chunk_size == 0 {
			return invalid("chunkSize must be > 0");
		}
		if self.read_buffer_size == 0 {
			return invalid("readBufferSize must be > 0");
		}
		if self.max_concurrent_syncs == 0 {
			return invalid("maxConcurrentSyncs must be > 0");
		}
		if self.state_history_per_peer == 0 {
			return invalid("stateHistoryPerPeer must be > 0");
		}
		if self.meta_dir_name.is_empty() || self.meta_dir_name.contains('/') {
			return invalid("metaDirName must be a plain file name");
		}
		if self.temp_file_prefix.is_empty() || self.temp_file_prefix.contains('/') {
			return invalid("tempFilePrefix must be a non-empty file name prefix");
		}
		if self.copy_modification_tiers.windows(2).any(|w| w[0].below >= w[1].below) {
			return invalid("copyModificationTiers must be sorted by 'below'");
		}
		Ok(())
	}

	/// Maximum number of copy modifications inferred for a new file
	pub fn max_copy_modifications(&self, length: u64) -> usize {
		self.copy_modification_tiers
			.iter()
			.find(|tier| length < tier.below)
			.map(|tier| tier.max_copies)
			.unwrap_or(self.copy_modification_max)
	}

	pub fn lock_timeout(&self) -> Duration {
		Duration::from_millis(self.lock_timeout_ms)
	}

	pub fn idle_close_delay(&self) -> Duration {
		Duration::from_millis(self.idle_close_delay_ms)
	}

	pub fn housekeeping_interval(&self) -> Duration {
		Duration::from_millis(self.housekeeping_interval_ms.max(1))
	}

	/// True for names the scanner never records
	pub fn is_internal_name(&self, name: &str) -> bool {
		name == self.meta_dir_name || name.starts_with(&self.temp_file_prefix)
	}

	/// Temp file name used while writing `name`
	pub fn temp_file_name(&self, name: &str) -> String {
		format!("{}{}", self.temp_file_prefix, name)
	}
}


// vim: ts=4
