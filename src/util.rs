//! Small helpers: digests, timestamps, repository paths and file URLs
//!
//! Repository paths are absolute, '/'-separated and rooted at the
//! repository (or at a path prefix of it): "/" is the root, "/a/b" a
//! descendant. They never end with '/' except for the root itself.

use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const ROOT_PATH: &str = "/";

pub fn sha1_hex(buf: &[u8]) -> String {
	let mut hasher = Sha1::new();
	hasher.update(buf);
	hex::encode(hasher.finalize())
}

/// Milliseconds since the Unix epoch (negative before it)
pub fn to_millis(time: SystemTime) -> i64 {
	match time.duration_since(UNIX_EPOCH) {
		Ok(d) => d.as_millis() as i64,
		Err(e) => -(e.duration().as_millis() as i64),
	}
}

pub fn from_millis(millis: i64) -> SystemTime {
	if millis >= 0 {
		UNIX_EPOCH + Duration::from_millis(millis as u64)
	} else {
		UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
	}
}

pub fn now_millis() -> i64 {
	to_millis(SystemTime::now())
}

pub fn to_file_time(millis: i64) -> filetime::FileTime {
	filetime::FileTime::from_system_time(from_millis(millis))
}

/// Canonical form: leading '/', no empty segments, no trailing '/'
pub fn normalize_path(path: &str) -> String {
	let segments: Vec<&str> = segments(path).collect();
	if segments.is_empty() {
		ROOT_PATH.to_string()
	} else {
		format!("/{}", segments.join("/"))
	}
}

pub fn segments(path: &str) -> impl Iterator<Item = &str> {
	path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

pub fn is_root(path: &str) -> bool {
	segments(path).next().is_none()
}

pub fn join_path(parent: &str, name: &str) -> String {
	if is_root(parent) {
		format!("/{}", name)
	} else {
		format!("{}/{}", parent.trim_end_matches('/'), name)
	}
}

/// Split into (parent, name); None for the root
pub fn split_path(path: &str) -> Option<(String, String)> {
	let normalized = normalize_path(path);
	let idx = normalized.rfind('/')?;
	let name = &normalized[idx + 1..];
	if name.is_empty() {
		return None;
	}
	let parent = if idx == 0 { ROOT_PATH.to_string() } else { normalized[..idx].to_string() };
	Some((parent, name.to_string()))
}

/// True if `path` equals `ancestor` or lies below it
pub fn is_same_or_descendant(path: &str, ancestor: &str) -> bool {
	let ancestor: Vec<&str> = segments(ancestor).collect();
	let mut path = segments(path);
	ancestor.iter().all(|a| path.next() == Some(*a))
}

/// Map a path relative to `prefix` to a repository path
pub fn prefix_path(prefix: &str, path: &str) -> String {
	if is_root(prefix) {
		normalize_path(path)
	} else if is_root(path) {
		normalize_path(prefix)
	} else {
		normalize_path(&format!("{}/{}", prefix, path))
	}
}

/// Map a repository path to a path relative to `prefix`, None if outside
pub fn unprefix_path(prefix: &str, path: &str) -> Option<String> {
	if !is_same_or_descendant(path, prefix) {
		return None;
	}
	let skip = segments(prefix).count();
	let rest: Vec<&str> = segments(path).skip(skip).collect();
	if rest.is_empty() {
		Some(ROOT_PATH.to_string())
	} else {
		Some(format!("/{}", rest.join("/")))
	}
}

/// Filesystem location of a repository path
pub fn to_fs_path(root: &Path, path: &str) -> PathBuf {
	let mut result = root.to_path_buf();
	for segment in segments(path) {
		result.push(segment);
	}
	result
}

pub fn file_url(path: &Path) -> String {
	format!("file://{}", path.display())
}

/// Filesystem path of a `file://` URL
pub fn path_from_file_url(url: &str) -> Option<PathBuf> {
	let rest = url.strip_prefix("file://")?;
	if rest.is_empty() {
		return None;
	}
	Some(PathBuf::from(rest))
}

/// Scheme part of a URL ("file" for "file:///tmp")
pub fn url_scheme(url: &str) -> Option<&str> {
	url.split_once("://").map(|(scheme, _)| scheme)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_sha1_hex() {
		assert_eq!(sha1_hex(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
		assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
	}

	#[test]
	fn test_millis_round_trip() {
		let t = from_millis(1_500_000_000_123);
		assert_eq!(to_millis(t), 1_500_000_000_123);
		assert_eq!(to_millis(from_millis(-5)), -5);
	}

	#[test]
	fn test_normalize_and_join() {
		assert_eq!(normalize_path(""), "/");
		assert_eq!(normalize_path("a//b/"), "/a/b");
		assert_eq!(join_path("/", "a"), "/a");
		assert_eq!(join_path("/a", "b"), "/a/b");
		assert_eq!(split_path("/a/b"), Some(("/a".to_string(), "b".to_string())));
		assert_eq!(split_path("/a"), Some(("/".to_string(), "a".to_string())));
		assert_eq!(split_path("/"), None);
	}

	#[test]
	fn test_prefix_mapping() {
		assert_eq!(prefix_path("/", "/x"), "/x");
		assert_eq!(prefix_path("/sub", "/"), "/sub");
		assert_eq!(prefix_path("/sub", "/x/y"), "/sub/x/y");
		assert_eq!(unprefix_path("/sub", "/sub/x"), Some("/x".to_string()));
		assert_eq!(unprefix_path("/sub", "/sub"), Some("/".to_string()));
		assert_eq!(unprefix_path("/sub", "/subway"), None);
		assert_eq!(unprefix_path("/", "/any"), Some("/any".to_string()));
	}

	#[test]
	fn test_descendant() {
		assert!(is_same_or_descendant("/a/b", "/a"));
		assert!(is_same_or_descendant("/a", "/a"));
		assert!(is_same_or_descendant("/a", "/"));
		assert!(!is_same_or_descendant("/ab", "/a"));
		assert!(!is_same_or_descendant("/", "/a"));
	}

	#[test]
	fn test_file_urls() {
		let url = file_url(Path::new("/tmp/repo"));
		assert_eq!(url, "file:///tmp/repo");
		assert_eq!(path_from_file_url(&url), Some(PathBuf::from("/tmp/repo")));
		assert_eq!(url_scheme(&url), Some("file"));
		assert_eq!(path_from_file_url("http://x"), None);
	}
}

// vim: ts=4
