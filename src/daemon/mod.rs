//! Sync daemon
//!
//! Runs at most one session per repository at a time. A request for a
//! repository that is already syncing is queued once and started when the
//! running session ends. Sessions of different repositories run in
//! parallel, bounded by `max_concurrent_syncs`.

pub mod state;

pub use state::{ActivityType, DaemonEvent, RepoSyncActivity, RepoSyncState, Severity, StateHistory, SyncProgress};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::callbacks::{CallbackBuilder, DaemonListener, SyncCallbacks};
use crate::config::Config;
use crate::error::{error_chain, RepoError, SyncError};
use crate::logging::*;
use crate::repo::RepoRegistry;
use crate::sync::RepoToRepoSync;
use crate::transport::TransportRegistry;
use crate::util;

#[derive(Default)]
struct DaemonState {
	running: HashSet<Uuid>,
	/// Repository id -> root of the queued request
	queued: HashMap<Uuid, PathBuf>,
	histories: HashMap<Uuid, StateHistory>,
}

struct Housekeeping {
	stop: watch::Sender<bool>,
	task: JoinHandle<()>,
}

struct Inner {
	registry: RepoRegistry,
	transports: TransportRegistry,
	config: Arc<Config>,
	workers: Arc<Semaphore>,
	state: Mutex<DaemonState>,
	listeners: Mutex<Vec<Arc<dyn DaemonListener>>>,
	/// Number of repositories with a running session
	active: watch::Sender<usize>,
	shutting_down: AtomicBool,
	housekeeping: Mutex<Option<Housekeeping>>,
}

#[derive(Clone)]
pub struct SyncDaemon {
	inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn activity(repository_id: Uuid, activity: ActivityType) -> RepoSyncActivity {
	RepoSyncActivity { local_repository_id: repository_id, activity }
}

/// Publishes the progress of one session to the daemon's listeners
#[derive(Clone)]
struct ProgressSink {
	daemon: SyncDaemon,
	repository_id: Uuid,
	remote_repository_id: Uuid,
}

impl ProgressSink {
	fn emit(&self, progress: SyncProgress) {
		self.daemon.publish(vec![DaemonEvent::Progress {
			repository_id: self.repository_id,
			remote_repository_id: self.remote_repository_id,
			progress,
		}]);
	}

	fn callbacks(self) -> Arc<dyn SyncCallbacks> {
		let (phase, file, skipped) = (self.clone(), self.clone(), self);
		let callbacks = CallbackBuilder::new()
			.on_phase(move |p| phase.emit(SyncProgress::Phase(p)))
			.on_file_transferred(move |path, bytes| {
				file.emit(SyncProgress::FileTransferred { path: path.to_string(), bytes })
			})
			.on_skipped(move |path, error| {
				skipped.emit(SyncProgress::Skipped { path: path.to_string(), reason: error.to_string() })
			})
			.build();
		Arc::from(callbacks)
	}
}

impl SyncDaemon {
	/// Create the daemon and start its housekeeping task. Must be called
	/// inside a tokio runtime.
	pub fn new(registry: RepoRegistry, transports: TransportRegistry) -> Self {
		let config = registry.config();
		let (active, _) = watch::channel(0);
		let daemon = SyncDaemon {
			inner: Arc::new(Inner {
				registry,
				transports,
				workers: Arc::new(Semaphore::new(config.max_concurrent_syncs.max(1))),
				config,
				state: Mutex::new(DaemonState::default()),
				listeners: Mutex::new(Vec::new()),
				active,
				shutting_down: AtomicBool::new(false),
				housekeeping: Mutex::new(None),
			}),
		};
		daemon.start_housekeeping();
		daemon
	}

	fn start_housekeeping(&self) {
		let (stop, mut stopped) = watch::channel(false);
		let registry = self.inner.registry.clone();
		let period = self.inner.config.housekeeping_interval();
		let task = tokio::spawn(async move {
			let mut interval = tokio::time::interval(period);
			interval.tick().await;
			loop {
				tokio::select! {
					_ = interval.tick() => {
						let registry = registry.clone();
						match tokio::task::spawn_blocking(move || registry.evict_idle()).await {
							Ok(0) => {}
							Ok(closed) => debug!("Closed {} idle repositories", closed),
							Err(e) => warn!("Housekeeping failed: {}", e),
						}
					}
					_ = stopped.changed() => break,
				}
			}
		});
		*lock(&self.inner.housekeeping) = Some(Housekeeping { stop, task });
	}

	pub fn registry(&self) -> &RepoRegistry {
		&self.inner.registry
	}

	pub fn add_listener(&self, listener: Arc<dyn DaemonListener>) {
		lock(&self.inner.listeners).push(listener);
	}

	fn publish(&self, events: Vec<DaemonEvent>) {
		if events.is_empty() {
			return;
		}
		let listeners = lock(&self.inner.listeners).clone();
		for event in &events {
			for listener in &listeners {
				listener.on_event(event);
			}
		}
	}

	/// Request a sync of the repository containing `path`; returns its id
	pub async fn start_sync(&self, path: &Path) -> Result<Uuid, SyncError> {
		if self.inner.shutting_down.load(Ordering::SeqCst) {
			return Err(SyncError::ShuttingDown);
		}
		let registry = self.inner.registry.clone();
		let path = path.to_path_buf();
		let (root, repository_id) = tokio::task::spawn_blocking(move || {
			let root = registry.resolve_root(&path)?;
			let id = registry.repository_id(&root)?;
			Ok::<_, RepoError>((root, id))
		})
		.await??;

		let (submit, event) = {
			let mut state = lock(&self.inner.state);
			if state.running.contains(&repository_id) {
				let newly_queued = state.queued.insert(repository_id, root.clone()).is_none();
				let event = newly_queued.then(|| DaemonEvent::ActivitiesChanged {
					repository_id,
					added: vec![activity(repository_id, ActivityType::Queued)],
					removed: vec![],
				});
				(false, event)
			} else {
				state.running.insert(repository_id);
				self.inner.active.send_replace(state.running.len());
				let event = DaemonEvent::ActivitiesChanged {
					repository_id,
					added: vec![activity(repository_id, ActivityType::InProgress)],
					removed: vec![],
				};
				(true, Some(event))
			}
		};
		self.publish(event.into_iter().collect());

		if submit {
			debug!("Starting sync of {}", repository_id);
			let daemon = self.clone();
			tokio::spawn(async move { daemon.run_sessions(repository_id, root).await });
		} else {
			debug!("Sync of {} already running, queued", repository_id);
		}
		Ok(repository_id)
	}

	/// Run the session and then every request queued meanwhile
	async fn run_sessions(&self, repository_id: Uuid, root: PathBuf) {
		let mut root = root;
		loop {
			let states = match self.inner.workers.clone().acquire_owned().await {
				Ok(_permit) => self.session(repository_id, &root).await,
				Err(_) => Vec::new(),
			};
			self.record(repository_id, states);

			let (next, event) = {
				let mut state = lock(&self.inner.state);
				match state.queued.remove(&repository_id) {
					Some(next) => {
						let event = DaemonEvent::ActivitiesChanged {
							repository_id,
							added: vec![],
							removed: vec![activity(repository_id, ActivityType::Queued)],
						};
						(Some(next), event)
					}
					None => {
						state.running.remove(&repository_id);
						self.inner.active.send_replace(state.running.len());
						let event = DaemonEvent::ActivitiesChanged {
							repository_id,
							added: vec![],
							removed: vec![activity(repository_id, ActivityType::InProgress)],
						};
						(None, event)
					}
				}
			};
			self.publish(vec![event]);

			match next {
				Some(next) => root = next,
				None => break,
			}
		}
	}

	/// Sync with every peer that has a URL; one outcome per peer
	async fn session(&self, repository_id: Uuid, root: &Path) -> Vec<RepoSyncState> {
		let registry = self.inner.registry.clone();
		let open_root = root.to_path_buf();
		let remotes = tokio::task::spawn_blocking(move || {
			let handle = registry.open(&open_root)?;
			handle.remote_repositories()
		})
		.await
		.map_err(SyncError::from)
		.and_then(|r| r.map_err(SyncError::from));

		let remotes = match remotes {
			Ok(remotes) => remotes,
			Err(e) => {
				error!("Cannot start sync of {}: {}", root.display(), e);
				let now = util::now_millis();
				return vec![failure_state(repository_id, Uuid::nil(), "", &e, now, now)];
			}
		};

		let mut states = Vec::new();
		for remote in remotes {
			let url = match &remote.remote_root {
				Some(url) => url.clone(),
				None => continue,
			};
			let start = util::now_millis();
			let sink = ProgressSink { daemon: self.clone(), repository_id, remote_repository_id: remote.repository_id };
			let session =
				RepoToRepoSync::new(self.inner.registry.clone(), self.inner.transports.clone(), root, remote.repository_id)
					.with_callbacks(sink.callbacks());
			let state = match session.sync().await {
				Ok(report) => RepoSyncState {
					local_repository_id: repository_id,
					remote_repository_id: remote.repository_id,
					url,
					severity: Severity::Info,
					message: format!(
						"Synced: {} files, {} bytes transferred, {} collisions",
						report.files_transferred(),
						report.bytes_transferred(),
						report.collisions()
					),
					error: None,
					start,
					end: util::now_millis(),
				},
				Err(e) => failure_state(repository_id, remote.repository_id, &url, &e, start, util::now_millis()),
			};
			states.push(state);
		}
		states
	}

	fn record(&self, repository_id: Uuid, states: Vec<RepoSyncState>) {
		if states.is_empty() {
			return;
		}
		let per_peer = self.inner.config.state_history_per_peer;
		let mut removed = Vec::new();
		{
			let mut state = lock(&self.inner.state);
			let history = state.histories.entry(repository_id).or_default();
			for s in &states {
				removed.extend(history.push(s.clone(), per_peer));
			}
		}
		self.publish(vec![DaemonEvent::StatesChanged { repository_id, added: states, removed }]);
	}

	/// Recent outcomes of a repository, oldest first
	pub fn states(&self, repository_id: Uuid) -> Vec<RepoSyncState> {
		let state = lock(&self.inner.state);
		state.histories.get(&repository_id).map(|h| h.states().to_vec()).unwrap_or_default()
	}

	/// Current activities of a repository
	pub fn activities(&self, repository_id: Uuid) -> Vec<RepoSyncActivity> {
		let state = lock(&self.inner.state);
		let mut activities = Vec::new();
		if state.running.contains(&repository_id) {
			activities.push(activity(repository_id, ActivityType::InProgress));
		}
		if state.queued.contains_key(&repository_id) {
			activities.push(activity(repository_id, ActivityType::Queued));
		}
		activities
	}

	/// Wait until no session is running or queued
	pub async fn wait_idle(&self) {
		let mut active = self.inner.active.subscribe();
		let _ = active.wait_for(|count| *count == 0).await;
	}

	/// Stop accepting requests, let running and queued sessions finish,
	/// stop housekeeping and close idle repositories
	pub async fn shutdown(&self) {
		self.inner.shutting_down.store(true, Ordering::SeqCst);
		self.wait_idle().await;

		let housekeeping = lock(&self.inner.housekeeping).take();
		if let Some(housekeeping) = housekeeping {
			let _ = housekeeping.stop.send(true);
			if let Err(e) = housekeeping.task.await {
				warn!("Housekeeping task failed: {}", e);
			}
		}

		let registry = self.inner.registry.clone();
		match tokio::task::spawn_blocking(move || registry.close_all_idle()).await {
			Ok(closed) => debug!("Closed {} repositories on shutdown", closed),
			Err(e) => warn!("Failed to close repositories: {}", e),
		}
		info!("Sync daemon stopped");
	}
}

fn failure_state(
	local_repository_id: Uuid,
	remote_repository_id: Uuid,
	url: &str,
	error: &SyncError,
	start: i64,
	end: i64,
) -> RepoSyncState {
	RepoSyncState {
		local_repository_id,
		remote_repository_id,
		url: url.to_string(),
		severity: Severity::Error,
		message: error.to_string(),
		error: Some(error_chain(error)),
		start,
		end,
	}
}

// vim: ts=4
