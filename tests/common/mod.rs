//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

use replicr::sync::{RepoToRepoSync, SyncReport};
use replicr::util;
use replicr::{Config, RepoRegistry, SyncError, TransportRegistry};

pub fn test_config() -> Config {
	Config { lock_timeout_ms: 2_000, idle_close_delay_ms: 60_000, ..Config::default() }
}

pub struct Peer {
	pub dir: TempDir,
	pub root: PathBuf,
	pub id: Uuid,
}

impl Peer {
	pub fn path(&self, path: &str) -> PathBuf {
		util::to_fs_path(&self.root, path)
	}

	pub fn write(&self, path: &str, data: &[u8]) {
		let fs_path = self.path(path);
		if let Some(parent) = fs_path.parent() {
			fs::create_dir_all(parent).unwrap();
		}
		fs::write(fs_path, data).unwrap();
	}

	/// Write and set the modification time `offset_ms` away from now
	pub fn write_at(&self, path: &str, data: &[u8], offset_ms: i64) {
		self.write(path, data);
		let mtime = util::to_file_time(util::now_millis() + offset_ms);
		filetime::set_file_mtime(self.path(path), mtime).unwrap();
	}

	pub fn read(&self, path: &str) -> Option<Vec<u8>> {
		fs::read(self.path(path)).ok()
	}

	pub fn exists(&self, path: &str) -> bool {
		fs::symlink_metadata(self.path(path)).is_ok()
	}

	/// Files and directories below the root, internal entries left out
	pub fn tree(&self) -> BTreeMap<String, Option<Vec<u8>>> {
		let config = Config::default();
		let mut tree = BTreeMap::new();
		collect(&self.root, "", &config, &mut tree);
		tree
	}
}

fn collect(dir: &Path, prefix: &str, config: &Config, tree: &mut BTreeMap<String, Option<Vec<u8>>>) {
	for entry in fs::read_dir(dir).unwrap() {
		let entry = entry.unwrap();
		let name = entry.file_name().to_string_lossy().into_owned();
		if config.is_internal_name(&name) {
			continue;
		}
		let path = format!("{}/{}", prefix, name);
		let file_type = entry.file_type().unwrap();
		if file_type.is_symlink() {
			let target = fs::read_link(entry.path()).unwrap();
			tree.insert(path, Some(target.to_string_lossy().as_bytes().to_vec()));
		} else if file_type.is_dir() {
			tree.insert(path.clone(), None);
			collect(&entry.path(), &path, config, tree);
		} else {
			tree.insert(path, Some(fs::read(entry.path()).unwrap()));
		}
	}
}

pub struct Cluster {
	pub registry: RepoRegistry,
	pub transports: TransportRegistry,
}

impl Cluster {
	pub fn new(config: Config) -> Self {
		let registry = RepoRegistry::new(Arc::new(config));
		let transports = TransportRegistry::with_local(registry.clone());
		Cluster { registry, transports }
	}

	pub fn peer(&self) -> Peer {
		let dir = TempDir::new().unwrap();
		let root = dir.path().canonicalize().unwrap();
		let handle = self.registry.create(&root).unwrap();
		Peer { id: handle.repository_id(), dir, root }
	}

	/// Make `to` a peer of `from`, reachable by its file URL
	pub fn connect(&self, from: &Peer, to: &Peer) {
		let key = self.registry.open(&to.root).unwrap().public_key().unwrap();
		let handle = self.registry.open(&from.root).unwrap();
		handle.put_remote_repository(to.id, Some(util::file_url(&to.root)), key, "/").unwrap();
	}

	/// Two repositories connected both ways
	pub fn pair(&self) -> (Peer, Peer) {
		let (a, b) = (self.peer(), self.peer());
		self.connect(&a, &b);
		self.connect(&b, &a);
		(a, b)
	}

	pub async fn try_sync(&self, local: &Peer, remote_id: Uuid) -> Result<SyncReport, SyncError> {
		RepoToRepoSync::new(self.registry.clone(), self.transports.clone(), &local.root, remote_id).sync().await
	}

	pub async fn sync(&self, local: &Peer, remote: &Peer) -> SyncReport {
		self.try_sync(local, remote.id).await.unwrap()
	}

	pub fn local_revision(&self, peer: &Peer) -> i64 {
		self.registry.open(&peer.root).unwrap().local_revision().unwrap()
	}
}

// vim: ts=4
