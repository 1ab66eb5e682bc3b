//! Fixed-size content fingerprinting
//!
//! A single sequential pass over a file produces the whole-file SHA-1 and
//! one SHA-1 per fixed-size chunk. The last chunk may be shorter; an empty
//! file has no chunks.

use sha1::{Digest, Sha1};
use std::fs;
use std::io::{self, Read};
use std::path::Path;

use crate::config::Config;
use crate::logging::*;
use crate::types::FileChunk;

/// Digests of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
	/// Number of bytes actually read
	pub length: u64,
	pub sha1: String,
	pub chunks: Vec<FileChunk>,
	/// The file grew or shrank while it was read
	pub length_changed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter {
	chunk_size: u64,
	buffer_size: usize,
}

impl Fingerprinter {
	pub fn new(chunk_size: u64, buffer_size: usize) -> Self {
		Fingerprinter { chunk_size: chunk_size.max(1), buffer_size: buffer_size.max(1) }
	}

	pub fn from_config(config: &Config) -> Self {
		Fingerprinter::new(config.chunk_size, config.read_buffer_size)
	}

	pub fn chunk_size(&self) -> u64 {
		self.chunk_size
	}

	/// Hash a stream whose length is expected to be `declared_length`
	pub fn fingerprint<R: Read>(&self, mut reader: R, declared_length: u64) -> io::Result<Fingerprint> {
		let mut buf = vec![0u8; self.buffer_size];
		let mut whole = Sha1::new();
		let mut chunk = Sha1::new();
		let mut chunks = Vec::new();
		let mut chunk_start = 0u64;
		let mut chunk_len = 0u64;
		let mut total = 0u64;

		loop {
			let n = match reader.read(&mut buf) {
				Ok(0) => break,
				Ok(n) => n,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(e),
			};
			whole.update(&buf[..n]);

			let mut pos = 0usize;
			while pos < n {
				let room = (self.chunk_size - chunk_len) as usize;
				let take = room.min(n - pos);
				chunk.update(&buf[pos..pos + take]);
				chunk_len += take as u64;
				pos += take;
				if chunk_len == self.chunk_size {
					chunks.push(FileChunk {
						offset: chunk_start,
						length: chunk_len,
						sha1: hex::encode(std::mem::take(&mut chunk).finalize()),
					});
					chunk_start += chunk_len;
					chunk_len = 0;
				}
			}
			total += n as u64;
		}

		if chunk_len > 0 {
			chunks.push(FileChunk { offset: chunk_start, length: chunk_len, sha1: hex::encode(chunk.finalize()) });
		}

		let length_changed = total != declared_length;
		if length_changed {
			warn!("Length changed while hashing: expected {} bytes, read {}", declared_length, total);
		}

		Ok(Fingerprint { length: total, sha1: hex::encode(whole.finalize()), chunks, length_changed })
	}

	/// Hash a file on disk
	pub fn fingerprint_file(&self, path: &Path) -> io::Result<Fingerprint> {
		let file = fs::File::open(path)?;
		let declared = file.metadata()?.len();
		let result = self.fingerprint(file, declared)?;
		if result.length_changed {
			debug!("File {} was modified while hashing", path.display());
		}
		Ok(result)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util;

	#[test]
	fn test_empty_input() {
		let fp = Fingerprinter::new(4, 2).fingerprint(&b""[..], 0).unwrap();
		assert_eq!(fp.length, 0);
		assert!(fp.chunks.is_empty());
		assert_eq!(fp.sha1, util::sha1_hex(b""));
		assert!(!fp.length_changed);
	}

	#[test]
	fn test_chunk_boundaries() {
		// buffer (3) not aligned with chunk size (4)
		let data = b"0123456789";
		let fp = Fingerprinter::new(4, 3).fingerprint(&data[..], data.len() as u64).unwrap();
		assert_eq!(fp.length, 10);
		assert_eq!(fp.sha1, util::sha1_hex(data));
		let layout: Vec<(u64, u64)> = fp.chunks.iter().map(|c| (c.offset, c.length)).collect();
		assert_eq!(layout, vec![(0, 4), (4, 4), (8, 2)]);
		assert_eq!(fp.chunks[0].sha1, util::sha1_hex(b"0123"));
		assert_eq!(fp.chunks[2].sha1, util::sha1_hex(b"89"));
	}

	#[test]
	fn test_exact_multiple_has_no_trailing_chunk() {
		let data = vec![7u8; 8];
		let fp = Fingerprinter::new(4, 16).fingerprint(&data[..], 8).unwrap();
		assert_eq!(fp.chunks.len(), 2);
		assert_eq!(fp.chunks[1].offset, 4);
	}

	#[test]
	fn test_length_changed_flag() {
		let data = b"abc";
		let fp = Fingerprinter::new(4, 4).fingerprint(&data[..], 5).unwrap();
		assert!(fp.length_changed);
		assert_eq!(fp.length, 3);
	}

	#[test]
	fn test_fingerprint_file_default_sizes() {
		let dir = tempfile::TempDir::new().unwrap();
		let path = dir.path().join("big.bin");
		let data: Vec<u8> = (0..(2 * 1024 * 1024 + 10)).map(|i| (i % 251) as u8).collect();
		fs::write(&path, &data).unwrap();

		let fp = Fingerprinter::from_config(&Config::default()).fingerprint_file(&path).unwrap();
		assert_eq!(fp.length, data.len() as u64);
		assert_eq!(fp.chunks.len(), 3);
		assert_eq!(fp.chunks[2].length, 10);
		assert_eq!(fp.sha1, util::sha1_hex(&data));
	}
}

// vim: ts=4
