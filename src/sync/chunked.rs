//! Chunk-level transfer of one file between two transports

use crate::change_set::ChangeSet;
use crate::error::TransportError;
use crate::logging::*;
use crate::transport::{FileChunkSet, RepoTransport};
use crate::util;

/// What happened to one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
	/// Destination already had the same length, timestamp and digest, or
	/// got them by copying another of its files
	Unchanged { copied: bool },
	/// Source no longer has the file
	Missing,
	/// Source changed while being read; retried by the next change-set
	Aborted,
	/// Written; carries the number of bytes fetched from the source
	Transferred { bytes: u64, copied: bool },
}

/// Bring `path` on `dest` in line with `path` on `source`
pub async fn sync_file(
	source: &dyn RepoTransport,
	dest: &dyn RepoTransport,
	path: &str,
	change_set: &ChangeSet,
) -> Result<FileOutcome, TransportError> {
	let src = source.file_chunk_set(path, false).await?;
	let sha1 = match (&src.exists, &src.sha1) {
		(true, Some(sha1)) => sha1.clone(),
		_ => {
			debug!("{} vanished from the source, skipping", path);
			return Ok(FileOutcome::Missing);
		}
	};

	let mut dst = dest.file_chunk_set(path, false).await?;
	if src.is_equal_to(&dst) {
		return Ok(FileOutcome::Unchanged { copied: false });
	}

	let mut copied = false;
	if !dst.has_content(&sha1, src.length) {
		if let Some(updated) = apply_copy_hint(dest, path, &sha1, src.length, change_set).await? {
			dst = updated;
			copied = true;
			if src.is_equal_to(&dst) {
				return Ok(FileOutcome::Unchanged { copied });
			}
		}
	}

	dest.begin_put_file(path).await?;
	match put_chunks(source, dest, path, &src, &dst, &sha1).await {
		Ok(Some(bytes)) => {
			debug!("Transferred {} ({} of {} bytes)", path, bytes, src.length);
			Ok(FileOutcome::Transferred { bytes, copied })
		}
		Ok(None) => {
			abort_put(dest, path).await;
			Ok(FileOutcome::Aborted)
		}
		Err(e) => {
			abort_put(dest, path).await;
			Err(e)
		}
	}
}

/// Send the chunks `dst` lacks and finish the file. None if the source
/// changed underneath.
async fn put_chunks(
	source: &dyn RepoTransport,
	dest: &dyn RepoTransport,
	path: &str,
	src: &FileChunkSet,
	dst: &FileChunkSet,
	sha1: &str,
) -> Result<Option<u64>, TransportError> {
	let mut bytes = 0u64;
	for (index, chunk) in src.chunks.iter().enumerate() {
		if chunk_matches(dst, index, chunk.length, &chunk.sha1) {
			continue;
		}
		let data = match source.file_data(path, chunk.offset, chunk.length).await? {
			Some(data) => data,
			None => {
				warn!("{} vanished from the source during transfer", path);
				return Ok(None);
			}
		};
		if data.len() as u64 != chunk.length || util::sha1_hex(&data) != chunk.sha1 {
			warn!(
				"Chunk at offset {} of {} changed while being read ({} of {} bytes), skipping file",
				chunk.offset,
				path,
				data.len(),
				chunk.length
			);
			return Ok(None);
		}
		dest.put_file_data(path, chunk.offset, &data).await?;
		bytes += chunk.length;
	}
	dest.end_put_file(path, src.last_modified, src.length, Some(sha1)).await?;
	Ok(Some(bytes))
}

async fn abort_put(dest: &dyn RepoTransport, path: &str) {
	if let Err(e) = dest.abort_put_file(path).await {
		warn!("Cannot clean up the unfinished transfer of {}: {}", path, e);
	}
}

fn chunk_matches(dst: &FileChunkSet, index: usize, length: u64, sha1: &str) -> bool {
	dst.exists && dst.chunks.get(index).is_some_and(|d| d.length == length && d.sha1 == sha1)
}

/// Copy the content from another path of the destination if a copy
/// modification names one that already holds it
async fn apply_copy_hint(
	dest: &dyn RepoTransport,
	path: &str,
	sha1: &str,
	length: u64,
	change_set: &ChangeSet,
) -> Result<Option<FileChunkSet>, TransportError> {
	for (from_path, hint_sha1, hint_length) in change_set.copies_to(path) {
		if hint_sha1 != sha1 || hint_length != length {
			continue;
		}
		if !dest.file_chunk_set(from_path, true).await?.has_content(sha1, length) {
			continue;
		}
		match dest.copy(from_path, path).await {
			Ok(()) => {
				let updated = dest.file_chunk_set(path, false).await?;
				if updated.has_content(sha1, length) {
					debug!("Copied {} from {} on the destination", path, from_path);
					return Ok(Some(updated));
				}
			}
			Err(e) if e.is_recoverable() => debug!("Copy hint {} -> {} not usable: {}", from_path, path, e),
			Err(e) => return Err(e),
		}
	}
	Ok(None)
}


// vim: ts=4
