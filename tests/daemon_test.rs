//! Sync daemon scheduling and outcome history

mod common;

use std::sync::{Arc, Mutex};

use common::{test_config, Cluster};
use replicr::callbacks::SyncPhase;
use replicr::daemon::{ActivityType, DaemonEvent, Severity, SyncProgress};
use replicr::{Config, SyncDaemon, SyncError};
use uuid::Uuid;

fn daemon(cluster: &Cluster) -> SyncDaemon {
	SyncDaemon::new(cluster.registry.clone(), cluster.transports.clone())
}

#[derive(Default)]
struct Recorder {
	events: Mutex<Vec<DaemonEvent>>,
}

impl Recorder {
	fn listen(daemon: &SyncDaemon) -> Arc<Recorder> {
		let recorder = Arc::new(Recorder::default());
		let sink = recorder.clone();
		daemon.add_listener(Arc::new(move |event: &DaemonEvent| sink.events.lock().unwrap().push(event.clone())));
		recorder
	}

	fn events(&self) -> Vec<DaemonEvent> {
		self.events.lock().unwrap().clone()
	}
}

#[tokio::test]
async fn test_sync_records_outcome_per_peer() {
	let cluster = Cluster::new(test_config());
	let (a, b) = cluster.pair();
	a.write("/note.txt", b"sync me");
	let daemon = daemon(&cluster);

	let id = daemon.start_sync(&a.path("/")).await.unwrap();
	assert_eq!(id, a.id);
	daemon.wait_idle().await;

	let states = daemon.states(a.id);
	assert_eq!(states.len(), 1);
	assert_eq!(states[0].severity, Severity::Info);
	assert_eq!(states[0].remote_repository_id, b.id);
	assert!(states[0].error.is_none());
	assert!(states[0].end >= states[0].start);
	assert_eq!(b.read("/note.txt").as_deref(), Some(&b"sync me"[..]));
	assert!(daemon.activities(a.id).is_empty());
	daemon.shutdown().await;
}

#[tokio::test]
async fn test_session_progress_reaches_listeners() {
	let cluster = Cluster::new(test_config());
	let (a, b) = cluster.pair();
	a.write("/note.txt", b"sync me");
	let daemon = daemon(&cluster);
	let recorder = Recorder::listen(&daemon);

	daemon.start_sync(&a.root).await.unwrap();
	daemon.wait_idle().await;

	let mut phases = Vec::new();
	let mut files = Vec::new();
	for event in recorder.events() {
		if let DaemonEvent::Progress { repository_id, remote_repository_id, progress } = event {
			assert_eq!((repository_id, remote_repository_id), (a.id, b.id));
			match progress {
				SyncProgress::Phase(phase) => phases.push(phase),
				SyncProgress::FileTransferred { path, bytes } => files.push((path, bytes)),
				SyncProgress::Skipped { path, reason } => panic!("unexpected skip of {}: {}", path, reason),
			}
		}
	}
	assert_eq!(
		phases,
		vec![
			SyncPhase::Init,
			SyncPhase::LocalRescan,
			SyncPhase::Download,
			SyncPhase::Upload,
			SyncPhase::Redownload,
			SyncPhase::Done
		]
	);
	assert_eq!(files, vec![("/note.txt".to_string(), 7)]);
	daemon.shutdown().await;
}

#[tokio::test]
async fn test_sync_from_subdirectory_resolves_repository() {
	let cluster = Cluster::new(test_config());
	let (a, _b) = cluster.pair();
	a.write("/deep/er/file.txt", b"x");
	let daemon = daemon(&cluster);

	let id = daemon.start_sync(&a.path("/deep/er")).await.unwrap();
	assert_eq!(id, a.id);
	daemon.shutdown().await;
}

#[tokio::test]
async fn test_sessions_of_one_repository_never_overlap() {
	let cluster = Cluster::new(test_config());
	let (a, _b) = cluster.pair();
	a.write("/file.txt", b"data");
	let daemon = daemon(&cluster);
	let recorder = Recorder::listen(&daemon);

	for _ in 0..3 {
		daemon.start_sync(&a.root).await.unwrap();
	}
	daemon.wait_idle().await;

	let mut running = 0i32;
	let mut queued = 0i32;
	for event in recorder.events() {
		if let DaemonEvent::ActivitiesChanged { added, removed, .. } = event {
			for activity in added {
				match activity.activity {
					ActivityType::InProgress => running += 1,
					ActivityType::Queued => queued += 1,
				}
				assert!(running <= 1, "two sessions of one repository ran at once");
				assert!(queued <= 1, "a repository was queued twice");
			}
			for activity in removed {
				match activity.activity {
					ActivityType::InProgress => running -= 1,
					ActivityType::Queued => queued -= 1,
				}
			}
		}
	}
	assert_eq!((running, queued), (0, 0));

	let sessions = daemon.states(a.id).len();
	assert!((1..=3).contains(&sessions));
	assert!(daemon.activities(a.id).is_empty());
	daemon.shutdown().await;
}

#[tokio::test]
async fn test_history_is_bounded_per_peer() {
	let cluster = Cluster::new(Config { state_history_per_peer: 2, ..test_config() });
	let (a, _b) = cluster.pair();
	let daemon = daemon(&cluster);
	let recorder = Recorder::listen(&daemon);

	for _ in 0..3 {
		daemon.start_sync(&a.root).await.unwrap();
		daemon.wait_idle().await;
	}

	assert_eq!(daemon.states(a.id).len(), 2);
	let evicted: usize = recorder
		.events()
		.iter()
		.map(|event| match event {
			DaemonEvent::StatesChanged { removed, .. } => removed.len(),
			DaemonEvent::ActivitiesChanged { .. } | DaemonEvent::Progress { .. } => 0,
		})
		.sum();
	assert_eq!(evicted, 1);
	daemon.shutdown().await;
}

#[tokio::test]
async fn test_failed_peer_is_recorded_as_error() {
	let cluster = Cluster::new(test_config());
	let a = cluster.peer();
	let peer = Uuid::new_v4();
	cluster
		.registry
		.open(&a.root)
		.unwrap()
		.put_remote_repository(peer, Some("ssh://example.org/repo".to_string()), vec![1; 32], "/")
		.unwrap();
	let daemon = daemon(&cluster);

	daemon.start_sync(&a.root).await.unwrap();
	daemon.wait_idle().await;

	let states = daemon.states(a.id);
	assert_eq!(states.len(), 1);
	assert_eq!(states[0].severity, Severity::Error);
	assert_eq!(states[0].remote_repository_id, peer);
	let chain = states[0].error.clone().unwrap();
	assert!(!chain.is_empty());
	daemon.shutdown().await;
}

#[tokio::test]
async fn test_inbound_only_peers_are_not_synced() {
	let cluster = Cluster::new(test_config());
	let a = cluster.peer();
	cluster.registry.open(&a.root).unwrap().put_remote_repository(Uuid::new_v4(), None, vec![1], "/").unwrap();
	let daemon = daemon(&cluster);

	daemon.start_sync(&a.root).await.unwrap();
	daemon.wait_idle().await;
	assert!(daemon.states(a.id).is_empty());
	daemon.shutdown().await;
}

#[tokio::test]
async fn test_path_outside_repository_is_rejected() {
	let cluster = Cluster::new(test_config());
	let outside = tempfile::TempDir::new().unwrap();
	let daemon = daemon(&cluster);

	let result = daemon.start_sync(outside.path()).await;
	assert!(matches!(result, Err(SyncError::Repo(_))));
	daemon.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_rejects_new_requests() {
	let cluster = Cluster::new(test_config());
	let (a, _b) = cluster.pair();
	let daemon = daemon(&cluster);
	daemon.start_sync(&a.root).await.unwrap();
	daemon.shutdown().await;

	assert!(!daemon.states(a.id).is_empty());
	assert!(matches!(daemon.start_sync(&a.root).await, Err(SyncError::ShuttingDown)));
}

// vim: ts=4
