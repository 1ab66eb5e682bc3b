//! Callback traits for session progress and daemon events

use std::fmt;

use crate::daemon::DaemonEvent;
use crate::error::TransportError;

type PhaseFn = dyn Fn(SyncPhase) + Send + Sync;
type FileFn = dyn Fn(&str, u64) + Send + Sync;
type SkipFn = dyn Fn(&str, &TransportError) + Send + Sync;

/// Steps of one sync session, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
	Init,
	LocalRescan,
	Download,
	Upload,
	Redownload,
	Done,
}

impl fmt::Display for SyncPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			SyncPhase::Init => "init",
			SyncPhase::LocalRescan => "local rescan",
			SyncPhase::Download => "download",
			SyncPhase::Upload => "upload",
			SyncPhase::Redownload => "re-download",
			SyncPhase::Done => "done",
		};
		f.write_str(name)
	}
}

/// Observer of one sync session
pub trait SyncCallbacks: Send + Sync {
	/// Called when the session enters a phase
	fn on_phase(&self, _phase: SyncPhase) {}

	/// Called after a file was written to the destination, with the number
	/// of bytes actually transferred
	fn on_file_transferred(&self, _path: &str, _bytes: u64) {}

	/// Called when an operation was skipped (collision, vanished file)
	fn on_skipped(&self, _path: &str, _error: &TransportError) {}
}

/// Default callback implementation that does nothing
pub struct NoCallbacks;

impl SyncCallbacks for NoCallbacks {}

/// Builder for callbacks using function closures
#[derive(Default)]
pub struct CallbackBuilder {
	phase: Option<Box<PhaseFn>>,
	file: Option<Box<FileFn>>,
	skipped: Option<Box<SkipFn>>,
}

impl CallbackBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn on_phase<F>(mut self, callback: F) -> Self
	where
		F: Fn(SyncPhase) + Send + Sync + 'static,
	{
		self.phase = Some(Box::new(callback));
		self
	}

	pub fn on_file_transferred<F>(mut self, callback: F) -> Self
	where
		F: Fn(&str, u64) + Send + Sync + 'static,
	{
		self.file = Some(Box::new(callback));
		self
	}

	pub fn on_skipped<F>(mut self, callback: F) -> Self
	where
		F: Fn(&str, &TransportError) + Send + Sync + 'static,
	{
		self.skipped = Some(Box::new(callback));
		self
	}

	pub fn build(self) -> Box<dyn SyncCallbacks> {
		Box::new(CompositeCallbacks { phase: self.phase, file: self.file, skipped: self.skipped })
	}
}

struct CompositeCallbacks {
	phase: Option<Box<PhaseFn>>,
	file: Option<Box<FileFn>>,
	skipped: Option<Box<SkipFn>>,
}

impl SyncCallbacks for CompositeCallbacks {
	fn on_phase(&self, phase: SyncPhase) {
		if let Some(ref callback) = self.phase {
			callback(phase);
		}
	}

	fn on_file_transferred(&self, path: &str, bytes: u64) {
		if let Some(ref callback) = self.file {
			callback(path, bytes);
		}
	}

	fn on_skipped(&self, path: &str, error: &TransportError) {
		if let Some(ref callback) = self.skipped {
			callback(path, error);
		}
	}
}

/// Observer of daemon state and activity changes
pub trait DaemonListener: Send + Sync {
	fn on_event(&self, event: &DaemonEvent);
}

impl<F> DaemonListener for F
where
	F: Fn(&DaemonEvent) + Send + Sync,
{
	fn on_event(&self, event: &DaemonEvent) {
		self(event)
	}
}


// vim: ts=4
