//! Repository-to-repository sync session (RepoToRepoSync)
//!
//! A session rescans the local repository, then downloads the remote's
//! change-set, uploads the local one and downloads once more so that
//! anything the upload caused on the far side comes straight back.

pub mod chunked;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::callbacks::{NoCallbacks, SyncCallbacks, SyncPhase};
use crate::change_set::{ChangeSet, RepoFileDto};
use crate::error::{SyncError, TransportError};
use crate::logging::*;
use crate::repo::{LocalRepoManager, RepoRegistry};
use crate::scan::ScanReport;
use crate::transport::{LocalRepoTransport, RepoTransport, TransportRegistry};
use crate::types::{ModificationKind, RepoFileKind};
use crate::util;
use chunked::FileOutcome;

/// Counters of one change-set application
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseReport {
	/// Revision of the change-set source
	pub source_revision: i64,
	pub directories: usize,
	pub symlinks: usize,
	pub files_transferred: usize,
	pub files_unchanged: usize,
	pub bytes_transferred: u64,
	pub copies: usize,
	pub deletes: usize,
	pub collisions: usize,
	pub skipped: usize,
	/// Tree entries the destination did not take; the source offers them again
	pub retry_paths: Vec<String>,
}

/// Outcome of a complete session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
	pub local_repository_id: Uuid,
	pub remote_repository_id: Uuid,
	pub url: String,
	pub scan: ScanReport,
	pub download: PhaseReport,
	pub upload: PhaseReport,
	pub redownload: PhaseReport,
}

impl SyncReport {
	fn phases(&self) -> [&PhaseReport; 3] {
		[&self.download, &self.upload, &self.redownload]
	}

	pub fn files_transferred(&self) -> usize {
		self.phases().iter().map(|p| p.files_transferred).sum()
	}

	pub fn bytes_transferred(&self) -> u64 {
		self.phases().iter().map(|p| p.bytes_transferred).sum()
	}

	pub fn collisions(&self) -> usize {
		self.phases().iter().map(|p| p.collisions).sum()
	}
}

pub struct RepoToRepoSync {
	registry: RepoRegistry,
	transports: TransportRegistry,
	local_root: PathBuf,
	remote_repository_id: Uuid,
	callbacks: Arc<dyn SyncCallbacks>,
}

impl RepoToRepoSync {
	pub fn new(
		registry: RepoRegistry,
		transports: TransportRegistry,
		local_root: &Path,
		remote_repository_id: Uuid,
	) -> Self {
		RepoToRepoSync {
			registry,
			transports,
			local_root: local_root.to_path_buf(),
			remote_repository_id,
			callbacks: Arc::new(NoCallbacks),
		}
	}

	pub fn with_callbacks(mut self, callbacks: Arc<dyn SyncCallbacks>) -> Self {
		self.callbacks = callbacks;
		self
	}

	/// Run one complete session
	pub async fn sync(&self) -> Result<SyncReport, SyncError> {
		self.callbacks.on_phase(SyncPhase::Init);

		let registry = self.registry.clone();
		let root = self.local_root.clone();
		let handle = tokio::task::spawn_blocking(move || registry.open(&root)).await??;
		let manager = handle.shared();

		let remote = handle
			.remote_repository(self.remote_repository_id)?
			.ok_or(SyncError::UnknownRemote { repository_id: self.remote_repository_id })?;
		let url = remote.remote_root.clone().ok_or(SyncError::NoRemoteRoot { repository_id: remote.repository_id })?;
		let local_repository_id = handle.repository_id();
		let local_url = util::file_url(&handle.fs_path(&remote.local_path_prefix));
		let local = LocalRepoTransport::new(handle, &local_url, &remote.local_path_prefix, remote.repository_id);

		info!("Syncing {} with {} ({})", local_repository_id, remote.repository_id, url);
		let remote_transport = match self.transports.create(&url, local_repository_id).await {
			Ok(transport) => transport,
			Err(e) => {
				let _ = local.close().await;
				return Err(e.into());
			}
		};

		let mut report = SyncReport {
			local_repository_id,
			remote_repository_id: remote.repository_id,
			url: url.clone(),
			..SyncReport::default()
		};
		let result = self.run(manager, &local, remote_transport.as_ref(), &mut report).await;

		if let Err(e) = remote_transport.close().await {
			warn!("Failed to close transport for {}: {}", url, e);
		}
		if let Err(e) = local.close().await {
			warn!("Failed to close local transport: {}", e);
		}
		self.callbacks.on_phase(SyncPhase::Done);

		match result {
			Ok(()) => {
				info!(
					"Sync with {} done: {} files, {} bytes transferred, {} collisions",
					url,
					report.files_transferred(),
					report.bytes_transferred(),
					report.collisions()
				);
				Ok(report)
			}
			Err(e) => {
				error!("Sync with {} failed: {}", url, e);
				Err(e)
			}
		}
	}

	async fn run(
		&self,
		manager: Arc<LocalRepoManager>,
		local: &dyn RepoTransport,
		remote: &dyn RepoTransport,
		report: &mut SyncReport,
	) -> Result<(), SyncError> {
		let actual = remote.repository_id().await?;
		if actual != self.remote_repository_id {
			return Err(TransportError::IdentityMismatch {
				url: remote.url().to_string(),
				expected: self.remote_repository_id,
				actual,
			}
			.into());
		}

		self.callbacks.on_phase(SyncPhase::LocalRescan);
		report.scan = tokio::task::spawn_blocking(move || manager.scan()).await??;

		self.callbacks.on_phase(SyncPhase::Download);
		report.download = self.transfer(remote, local, true).await?;

		self.callbacks.on_phase(SyncPhase::Upload);
		report.upload = self.transfer(local, remote, false).await?;

		self.callbacks.on_phase(SyncPhase::Redownload);
		report.redownload = self.transfer(remote, local, true).await?;
		Ok(())
	}

	/// Fetch the source's change-set, apply it to the destination and
	/// commit the bookkeeping on both sides
	async fn transfer(
		&self,
		source: &dyn RepoTransport,
		dest: &dyn RepoTransport,
		local_sync: bool,
	) -> Result<PhaseReport, SyncError> {
		let change_set = source.change_set(local_sync, None).await?;
		debug!(
			"Applying {} modifications and {} nodes from {} to {}",
			change_set.modifications.len(),
			change_set.repo_files.len(),
			source.url(),
			dest.url()
		);

		let mut report = PhaseReport { source_revision: change_set.repository.revision, ..PhaseReport::default() };
		self.apply(&change_set, source, dest, &mut report).await?;

		source.end_sync_from_repository(&report.retry_paths).await?;
		dest.end_sync_to_repository(change_set.repository.revision).await?;
		Ok(report)
	}

	async fn apply(
		&self,
		change_set: &ChangeSet,
		source: &dyn RepoTransport,
		dest: &dyn RepoTransport,
		report: &mut PhaseReport,
	) -> Result<(), SyncError> {
		for modification in &change_set.modifications {
			if let ModificationKind::Copy { from_path, to_path, length, sha1 } = &modification.kind {
				if !dest.file_chunk_set(from_path, true).await?.has_content(sha1, *length) {
					continue;
				}
				if dest.file_chunk_set(to_path, true).await?.exists {
					continue;
				}
				if self.recoverable(dest.copy(from_path, to_path).await, to_path, report)? {
					report.copies += 1;
				}
			}
		}

		for modification in &change_set.modifications {
			if let ModificationKind::Delete { path, .. } = &modification.kind {
				if self.recoverable(dest.delete(path).await, path, report)? {
					report.deletes += 1;
				}
			}
		}

		let mut children: HashMap<Option<u64>, Vec<&RepoFileDto>> = HashMap::new();
		for file in &change_set.repo_files {
			children.entry(file.parent_id).or_default().push(file);
		}
		for list in children.values_mut() {
			// reversed so that popping visits names in order
			list.sort_by(|a, b| b.name.cmp(&a.name));
		}

		let mut stack: Vec<(&RepoFileDto, String)> = match children.get(&None) {
			Some(roots) => roots.iter().map(|root| (*root, util::ROOT_PATH.to_string())).collect(),
			None => Vec::new(),
		};
		while let Some((file, path)) = stack.pop() {
			if !file.needed_as_parent_only && !self.apply_file(file, &path, change_set, source, dest, report).await? {
				report.retry_paths.push(path.clone());
			}
			if let Some(list) = children.get(&Some(file.id)) {
				for child in list {
					stack.push((*child, util::join_path(&path, &child.name)));
				}
			}
		}
		Ok(())
	}

	/// Ok(false) if the destination did not take the entry
	async fn apply_file(
		&self,
		file: &RepoFileDto,
		path: &str,
		change_set: &ChangeSet,
		source: &dyn RepoTransport,
		dest: &dyn RepoTransport,
		report: &mut PhaseReport,
	) -> Result<bool, SyncError> {
		match &file.kind {
			RepoFileKind::Directory => {
				let taken = self.recoverable(dest.make_directory(path, Some(file.last_modified)).await, path, report)?;
				if taken {
					report.directories += 1;
				}
				Ok(taken)
			}
			RepoFileKind::Symlink { target } => {
				let result = dest.make_symlink(path, target, file.last_modified).await;
				let taken = self.recoverable(result, path, report)?;
				if taken {
					report.symlinks += 1;
				}
				Ok(taken)
			}
			RepoFileKind::NormalFile { .. } => match chunked::sync_file(source, dest, path, change_set).await {
				Ok(FileOutcome::Transferred { bytes, copied }) => {
					report.files_transferred += 1;
					report.bytes_transferred += bytes;
					if copied {
						report.copies += 1;
					}
					self.callbacks.on_file_transferred(path, bytes);
					Ok(true)
				}
				Ok(FileOutcome::Unchanged { copied }) => {
					report.files_unchanged += 1;
					if copied {
						report.copies += 1;
					}
					Ok(true)
				}
				Ok(FileOutcome::Missing) => {
					report.skipped += 1;
					Ok(true)
				}
				Ok(FileOutcome::Aborted) => {
					report.skipped += 1;
					Ok(false)
				}
				Err(e) => self.recoverable(Err(e), path, report),
			},
		}
	}

	/// Ok(true) on success, Ok(false) for a skipped per-item failure
	fn recoverable(&self, result: Result<(), TransportError>, path: &str, report: &mut PhaseReport) -> Result<bool, SyncError> {
		match result {
			Ok(()) => Ok(true),
			Err(e) if e.is_recoverable() => {
				if e.is_collision() {
					report.collisions += 1;
					warn!("Skipping {}: {}", path, e);
				} else {
					report.skipped += 1;
					info!("Skipping {}: {}", path, e);
				}
				self.callbacks.on_skipped(path, &e);
				Ok(false)
			}
			Err(e) => Err(e.into()),
		}
	}
}

// vim: ts=4
