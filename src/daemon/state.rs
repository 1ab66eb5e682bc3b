//! Outcome history and activity records of the sync daemon

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::callbacks::SyncPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
	Info,
	Error,
}

/// Outcome of syncing one repository with one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSyncState {
	pub local_repository_id: Uuid,
	/// Nil if the session failed before a peer was chosen
	pub remote_repository_id: Uuid,
	pub url: String,
	pub severity: Severity,
	pub message: String,
	/// Error and its causes, outermost first
	pub error: Option<Vec<String>>,
	/// Milliseconds since the Unix epoch
	pub start: i64,
	pub end: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
	Queued,
	InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSyncActivity {
	pub local_repository_id: Uuid,
	pub activity: ActivityType,
}

/// Step reported by a running session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncProgress {
	Phase(SyncPhase),
	FileTransferred { path: String, bytes: u64 },
	Skipped { path: String, reason: String },
}

/// Notification delivered to daemon listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
	StatesChanged { repository_id: Uuid, added: Vec<RepoSyncState>, removed: Vec<RepoSyncState> },
	ActivitiesChanged { repository_id: Uuid, added: Vec<RepoSyncActivity>, removed: Vec<RepoSyncActivity> },
	/// Session with `remote_repository_id` made progress
	Progress { repository_id: Uuid, remote_repository_id: Uuid, progress: SyncProgress },
}

/// Recent outcomes of one repository, bounded per peer
#[derive(Debug, Default)]
pub struct StateHistory {
	states: Vec<RepoSyncState>,
}

impl StateHistory {
	/// Append `state`; returns the entries evicted to keep at most
	/// `per_peer` entries for its peer
	pub fn push(&mut self, state: RepoSyncState, per_peer: usize) -> Vec<RepoSyncState> {
		let peer = state.remote_repository_id;
		self.states.push(state);

		let count = self.states.iter().filter(|s| s.remote_repository_id == peer).count();
		let mut excess = count.saturating_sub(per_peer.max(1));
		let mut evicted = Vec::new();
		self.states.retain(|s| {
			if excess > 0 && s.remote_repository_id == peer {
				excess -= 1;
				evicted.push(s.clone());
				false
			} else {
				true
			}
		});
		evicted
	}

	/// Oldest first
	pub fn states(&self) -> &[RepoSyncState] {
		&self.states
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn state(peer: Uuid, message: &str) -> RepoSyncState {
		RepoSyncState {
			local_repository_id: Uuid::nil(),
			remote_repository_id: peer,
			url: String::new(),
			severity: Severity::Info,
			message: message.to_string(),
			error: None,
			start: 0,
			end: 0,
		}
	}

	#[test]
	fn test_history_evicts_oldest_per_peer() {
		let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
		let mut history = StateHistory::default();
		assert!(history.push(state(a, "a1"), 2).is_empty());
		assert!(history.push(state(b, "b1"), 2).is_empty());
		assert!(history.push(state(a, "a2"), 2).is_empty());

		let evicted = history.push(state(a, "a3"), 2);
		assert_eq!(evicted.len(), 1);
		assert_eq!(evicted[0].message, "a1");

		let messages: Vec<&str> = history.states().iter().map(|s| s.message.as_str()).collect();
		assert_eq!(messages, vec!["b1", "a2", "a3"]);
	}

	#[test]
	fn test_activity_serialization() {
		let json = serde_json::to_string(&ActivityType::InProgress).unwrap();
		assert_eq!(json, "\"IN_PROGRESS\"");
	}
}

// vim: ts=4
