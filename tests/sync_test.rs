//! End-to-end sessions between repositories on the local filesystem

mod common;

use common::{test_config, Cluster};
use rand::Rng;
use replicr::transport::LocalRepoTransport;
use replicr::util;
use replicr::{Config, RepoTransport, SyncError, TransportError};
use uuid::Uuid;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
	(0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[tokio::test]
async fn test_initial_sync_replicates_tree() {
	let cluster = Cluster::new(test_config());
	let (a, b) = cluster.pair();
	a.write("/readme.txt", b"hello");
	a.write("/docs/guide.md", b"# Guide");
	a.write("/docs/deep/notes.txt", &pattern(5000, 1));
	std::fs::create_dir_all(a.path("/empty")).unwrap();
	#[cfg(unix)]
	std::os::unix::fs::symlink("readme.txt", a.path("/link")).unwrap();

	let report = cluster.sync(&a, &b).await;

	assert_eq!(report.files_transferred(), 3);
	assert_eq!(report.bytes_transferred(), 5 + 7 + 5000);
	assert_eq!(report.collisions(), 0);
	assert_eq!(a.tree(), b.tree());
}

#[tokio::test]
async fn test_second_sync_transfers_nothing() {
	let cluster = Cluster::new(test_config());
	let (a, b) = cluster.pair();
	a.write("/one.txt", b"one");
	a.write("/dir/two.txt", b"two");
	b.write("/three.txt", b"three");

	let first = cluster.sync(&a, &b).await;
	assert_eq!(first.files_transferred(), 3);

	let second = cluster.sync(&a, &b).await;
	assert_eq!(second.files_transferred(), 0);
	assert_eq!(second.bytes_transferred(), 0);

	let reverse = cluster.sync(&b, &a).await;
	assert_eq!(reverse.files_transferred(), 0);
	assert_eq!(a.tree(), b.tree());
}

#[tokio::test]
async fn test_disjoint_changes_converge() {
	let cluster = Cluster::new(test_config());
	let (a, b) = cluster.pair();
	a.write("/from-a/a.txt", b"written on a");
	b.write("/from-b/b.txt", b"written on b");

	cluster.sync(&a, &b).await;

	assert_eq!(a.read("/from-b/b.txt").as_deref(), Some(&b"written on b"[..]));
	assert_eq!(b.read("/from-a/a.txt").as_deref(), Some(&b"written on a"[..]));
	assert_eq!(a.tree(), b.tree());
}

#[tokio::test]
async fn test_modified_file_transfers_only_changed_chunks() {
	let cluster = Cluster::new(Config { chunk_size: 1024, ..test_config() });
	let (a, b) = cluster.pair();
	let mut data = pattern(8 * KIB, 7);
	a.write("/data.bin", &data);
	cluster.sync(&a, &b).await;

	data[3 * KIB + 10] ^= 0xff;
	a.write_at("/data.bin", &data, 10_000);
	let report = cluster.sync(&a, &b).await;

	assert_eq!(report.files_transferred(), 1);
	assert_eq!(report.bytes_transferred(), 1024);
	assert_eq!(b.read("/data.bin"), Some(data));
}

#[tokio::test]
async fn test_grown_and_shrunk_files() {
	let cluster = Cluster::new(Config { chunk_size: 1024, ..test_config() });
	let (a, b) = cluster.pair();
	a.write("/grow.bin", &pattern(2 * KIB, 1));
	a.write("/shrink.bin", &pattern(4 * KIB, 2));
	cluster.sync(&a, &b).await;

	let grown = pattern(3 * KIB + 100, 1);
	let shrunk = pattern(KIB + 1, 2);
	a.write_at("/grow.bin", &grown, 10_000);
	a.write_at("/shrink.bin", &shrunk, 10_000);
	cluster.sync(&a, &b).await;

	assert_eq!(b.read("/grow.bin"), Some(grown));
	assert_eq!(b.read("/shrink.bin"), Some(shrunk));
}

#[tokio::test]
async fn test_deleted_file_stays_deleted() {
	let cluster = Cluster::new(test_config());
	let (a, b) = cluster.pair();
	a.write("/doc.txt", b"draft");
	a.write("/old/x.txt", b"x");
	a.write("/old/y/z.txt", b"z");
	cluster.sync(&a, &b).await;
	assert!(b.exists("/doc.txt"));

	let mtime = |path: std::path::PathBuf| replicr::util::to_millis(std::fs::metadata(path).unwrap().modified().unwrap());
	assert_eq!(mtime(a.path("/doc.txt")), mtime(b.path("/doc.txt")));

	std::fs::remove_file(a.path("/doc.txt")).unwrap();
	std::fs::remove_dir_all(a.path("/old")).unwrap();
	let report = cluster.sync(&a, &b).await;
	assert!(report.upload.deletes >= 2);
	assert!(!b.exists("/doc.txt"));
	assert!(!b.exists("/old"));

	let handle = cluster.registry.open(&a.root).unwrap();
	let tx = handle.begin().unwrap();
	assert!(tx.modifications_after(b.id, -1).unwrap().is_empty());
	tx.abort().unwrap();
	drop(handle);

	cluster.sync(&a, &b).await;
	cluster.sync(&b, &a).await;
	assert!(!a.exists("/doc.txt"));
	assert!(!a.exists("/old"));
	assert_eq!(a.tree(), b.tree());
}

#[tokio::test]
async fn test_copy_is_replayed_on_destination() {
	let cluster = Cluster::new(test_config());
	let (a, b) = cluster.pair();
	let data = pattern(2 * MIB, 3);
	a.write("/a.bin", &data);
	let first = cluster.sync(&a, &b).await;
	assert_eq!(first.bytes_transferred(), (2 * MIB) as u64);

	std::fs::copy(a.path("/a.bin"), a.path("/b.bin")).unwrap();
	let second = cluster.sync(&a, &b).await;

	assert_eq!(second.bytes_transferred(), 0);
	assert_eq!(b.read("/b.bin"), Some(data));
}

#[tokio::test]
async fn test_copy_hint_within_first_sync() {
	let cluster = Cluster::new(test_config());
	let (a, b) = cluster.pair();
	let mut data = vec![0u8; 2 * MIB];
	rand::thread_rng().fill(&mut data[..]);
	a.write("/a.bin", &data);
	a.write("/b.bin", &data);

	let report = cluster.sync(&a, &b).await;

	assert_eq!(report.bytes_transferred(), (2 * MIB) as u64);
	assert_eq!(report.upload.copies, 1);
	assert_eq!(b.read("/a.bin").as_ref(), Some(&data));
	assert_eq!(b.read("/b.bin").as_ref(), Some(&data));
}

#[tokio::test]
async fn test_concurrent_edits_are_not_overwritten() {
	let cluster = Cluster::new(test_config());
	let (a, b) = cluster.pair();
	a.write("/shared.txt", b"original");
	cluster.sync(&a, &b).await;

	a.write_at("/shared.txt", b"edited on a", 10_000);
	b.write_at("/shared.txt", b"edited on b!", 20_000);
	let report = cluster.sync(&a, &b).await;

	assert!(report.collisions() >= 1);
	assert_eq!(a.read("/shared.txt").as_deref(), Some(&b"edited on a"[..]));
	assert_eq!(b.read("/shared.txt").as_deref(), Some(&b"edited on b!"[..]));
}

#[tokio::test]
async fn test_first_sync_conflict_keeps_both_versions() {
	let cluster = Cluster::new(test_config());
	let (a, b) = cluster.pair();
	a.write("/c.txt", b"version A");
	b.write("/c.txt", b"version B!");

	let report = cluster.sync(&a, &b).await;
	assert!(report.collisions() >= 1);
	assert_eq!(a.read("/c.txt").as_deref(), Some(&b"version A"[..]));
	assert_eq!(b.read("/c.txt").as_deref(), Some(&b"version B!"[..]));

	let again = cluster.sync(&b, &a).await;
	assert!(again.collisions() >= 1);
	assert_eq!(a.read("/c.txt").as_deref(), Some(&b"version A"[..]));
	assert_eq!(b.read("/c.txt").as_deref(), Some(&b"version B!"[..]));
}

#[tokio::test]
async fn test_unfinished_transfer_does_not_hide_local_edit() {
	let cluster = Cluster::new(test_config());
	let (a, b) = cluster.pair();
	a.write("/f.txt", b"original");
	cluster.sync(&a, &b).await;

	let transport = LocalRepoTransport::open(&cluster.registry, &util::file_url(&b.root), a.id).unwrap();
	transport.begin_put_file("/f.txt").await.unwrap();
	transport.close().await.unwrap();

	b.write_at("/f.txt", b"user edit on b", 10_000);
	cluster.sync(&b, &a).await;

	assert_eq!(a.read("/f.txt").as_deref(), Some(&b"user edit on b"[..]));
	assert_eq!(b.read("/f.txt").as_deref(), Some(&b"user edit on b"[..]));
}

#[tokio::test]
async fn test_revisions_only_grow() {
	let cluster = Cluster::new(test_config());
	let (a, b) = cluster.pair();
	let start = cluster.local_revision(&a);

	a.write("/first.txt", b"1");
	cluster.sync(&a, &b).await;
	let after_first = cluster.local_revision(&a);
	assert!(after_first > start);

	b.write("/second.txt", b"2");
	cluster.sync(&a, &b).await;
	let after_second = cluster.local_revision(&a);
	assert!(after_second > after_first);

	let handle = cluster.registry.open(&a.root).unwrap();
	let remote = handle.remote_repository(b.id).unwrap().unwrap();
	assert!(remote.revision >= 0);
	assert!(remote.revision <= cluster.local_revision(&b));
}

#[tokio::test]
async fn test_subdirectory_prefix() {
	let cluster = Cluster::new(test_config());
	let (a, b) = (cluster.peer(), cluster.peer());
	let key_a = cluster.registry.open(&a.root).unwrap().public_key().unwrap();
	let key_b = cluster.registry.open(&b.root).unwrap().public_key().unwrap();
	cluster
		.registry
		.open(&a.root)
		.unwrap()
		.put_remote_repository(b.id, Some(replicr::util::file_url(&b.root)), key_b, "/mirror")
		.unwrap();
	cluster.registry.open(&b.root).unwrap().put_remote_repository(a.id, None, key_a, "/").unwrap();

	a.write("/private.txt", b"stays local");
	a.write("/mirror/shared.txt", b"goes to b");
	b.write("/incoming.txt", b"comes from b");
	cluster.sync(&a, &b).await;

	assert_eq!(b.read("/shared.txt").as_deref(), Some(&b"goes to b"[..]));
	assert!(!b.exists("/private.txt"));
	assert!(!b.exists("/mirror"));
	assert_eq!(a.read("/mirror/incoming.txt").as_deref(), Some(&b"comes from b"[..]));
}

#[tokio::test]
async fn test_identity_mismatch_aborts_session() {
	let cluster = Cluster::new(test_config());
	let (a, c) = (cluster.peer(), cluster.peer());
	let claimed = Uuid::new_v4();
	cluster
		.registry
		.open(&a.root)
		.unwrap()
		.put_remote_repository(claimed, Some(replicr::util::file_url(&c.root)), vec![1; 32], "/")
		.unwrap();
	a.write("/file.txt", b"data");

	let result = cluster.try_sync(&a, claimed).await;

	match result {
		Err(SyncError::Transport(TransportError::IdentityMismatch { expected, actual, .. })) => {
			assert_eq!(expected, claimed);
			assert_eq!(actual, c.id);
		}
		other => panic!("expected identity mismatch, got {:?}", other),
	}
	assert!(!c.exists("/file.txt"));
}

#[tokio::test]
async fn test_unknown_remote() {
	let cluster = Cluster::new(test_config());
	let a = cluster.peer();
	let result = cluster.try_sync(&a, Uuid::new_v4()).await;
	assert!(matches!(result, Err(SyncError::UnknownRemote { .. })));
}

#[tokio::test]
async fn test_three_repositories_converge() {
	let cluster = Cluster::new(test_config());
	let (a, b) = cluster.pair();
	let c = cluster.peer();
	cluster.connect(&b, &c);
	cluster.connect(&c, &b);

	a.write("/a.txt", b"from a");
	c.write("/c.txt", b"from c");
	cluster.sync(&a, &b).await;
	cluster.sync(&c, &b).await;
	cluster.sync(&a, &b).await;

	assert_eq!(a.tree(), b.tree());
	assert_eq!(b.tree(), c.tree());
	assert!(c.exists("/a.txt"));
	assert!(a.exists("/c.txt"));
}

// vim: ts=4
