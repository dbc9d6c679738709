//! Content-addressed cache for vector (scatter/gather) reads (C3).
//!
//! A vector read is addressed by a double SHA-256 hash: one hash of the
//! remote file's name/URL (used as a directory shard), one of the
//! serialized chunk-list request itself (used as the leaf file name). See
//! `SPEC_FULL.md` §4.3.
//!
//! Grounded on `examples/original_source/.../vector/XrdClVectorCache.hh`.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VectorCacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored payload shorter than its own chunk table declares")]
    Truncated,
}

type Result<T> = std::result::Result<T, VectorCacheError>;

/// One requested sub-range of a vector read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRequest {
    pub offset: u64,
    pub size: u32,
}

/// A single materialized chunk: the requested range plus its data.
#[derive(Debug, Clone)]
pub struct ChunkData {
    pub offset: u64,
    pub data: Vec<u8>,
}

pub struct VectorCache {
    prefix: PathBuf,
}

impl VectorCache {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Hash the remote file identity (URL/path) to a stable 32-byte digest
    /// used as the first path component (directory shard).
    pub fn hash_name(name: &str) -> [u8; 32] {
        Self::sha256(name.as_bytes())
    }

    /// Hash the serialized chunk-request list to a stable 32-byte digest
    /// used as the leaf file name.
    pub fn hash_request(chunks: &[ChunkRequest]) -> [u8; 32] {
        Self::sha256(&serialize_request(chunks))
    }

    pub fn sha256(data: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn path_for(&self, name_hash: &[u8; 32], req_hash: &[u8; 32]) -> PathBuf {
        self.prefix
            .join(hex::encode(name_hash))
            .join(hex::encode(req_hash))
    }

    /// Look up a previously stored vector read. Returns `None` on a miss
    /// (absent file, or any read/format error — treated the same as a miss
    /// per §4.3, since a corrupt cache entry must never fail the request).
    pub fn retrieve(&self, name: &str, chunks: &[ChunkRequest]) -> Option<Vec<ChunkData>> {
        let name_hash = Self::hash_name(name);
        let req_hash = Self::hash_request(chunks);
        let path = self.path_for(&name_hash, &req_hash);

        match std::fs::read(&path) {
            Ok(bytes) => match split_chunks(&bytes, chunks) {
                Ok(result) => {
                    debug!(path = %path.display(), "vector cache hit");
                    Some(result)
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "vector cache entry unreadable, treating as miss");
                    None
                }
            },
            Err(_) => None,
        }
    }

    /// Store a completed vector read, atomically (write-temp, rename). The
    /// file on disk is the exact concatenation of the chunks' payloads, in
    /// request order — no framing, no length table.
    pub fn store(&self, name: &str, chunks: &[ChunkRequest], data: &[ChunkData]) -> Result<()> {
        let name_hash = Self::hash_name(name);
        let req_hash = Self::hash_request(chunks);
        let path = self.path_for(&name_hash, &req_hash);

        Self::ensure_parent_exists(&path)?;

        let dir = path.parent().expect("path_for always nests under prefix/hash");
        let mut tmp = NamedTempFile::new_in(dir)?;
        use std::io::Write;
        for chunk in data {
            tmp.write_all(&chunk.data)?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Ensure the directory shard for `path` exists. Split out as its own
    /// step because it's the one filesystem op worth doing outside the
    /// hot `retrieve` path.
    fn ensure_parent_exists(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Serialize the chunk request list the same way on every call so identical
/// requests hash identically: `(offset, size)` pairs, all LE, no count
/// prefix — `h_req = SHA256(concat(le_u64(offset) || le_u32(size)))`.
fn serialize_request(chunks: &[ChunkRequest]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(chunks.len() * 12);
    for c in chunks {
        buf.extend_from_slice(&c.offset.to_le_bytes());
        buf.extend_from_slice(&c.size.to_le_bytes());
    }
    buf
}

/// Split a raw concatenated payload back into per-chunk data using the
/// expected request list for boundaries — the file itself carries no
/// length table, so `expected` is the only source of truth for where one
/// chunk ends and the next begins.
fn split_chunks(bytes: &[u8], expected: &[ChunkRequest]) -> Result<Vec<ChunkData>> {
    let expected_length: usize = expected.iter().map(|c| c.size as usize).sum();
    if bytes.len() != expected_length {
        return Err(VectorCacheError::Truncated);
    }
    let mut pos = 0;
    let mut out = Vec::with_capacity(expected.len());
    for c in expected {
        let len = c.size as usize;
        out.push(ChunkData {
            offset: c.offset,
            data: bytes[pos..pos + len].to_vec(),
        });
        pos += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_then_retrieve_round_trips() {
        let dir = tempdir().unwrap();
        let cache = VectorCache::new(dir.path());
        let chunks = vec![
            ChunkRequest { offset: 0, size: 4 },
            ChunkRequest { offset: 100, size: 8 },
        ];
        let data = vec![
            ChunkData {
                offset: 0,
                data: vec![1, 2, 3, 4],
            },
            ChunkData {
                offset: 100,
                data: vec![9; 8],
            },
        ];
        cache.store("root://host//path/to/file", &chunks, &data).unwrap();

        let got = cache
            .retrieve("root://host//path/to/file", &chunks)
            .expect("should hit");
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data, vec![1, 2, 3, 4]);
        assert_eq!(got[1].data, vec![9; 8]);
    }

    #[test]
    fn miss_on_unknown_request() {
        let dir = tempdir().unwrap();
        let cache = VectorCache::new(dir.path());
        let chunks = vec![ChunkRequest { offset: 0, size: 4 }];
        assert!(cache.retrieve("root://host//nope", &chunks).is_none());
    }

    #[test]
    fn different_chunk_lists_hash_differently() {
        let a = vec![ChunkRequest { offset: 0, size: 4 }];
        let b = vec![ChunkRequest { offset: 0, size: 8 }];
        assert_ne!(VectorCache::hash_request(&a), VectorCache::hash_request(&b));
    }

    #[test]
    fn same_name_different_path_shards_differ() {
        assert_ne!(
            VectorCache::hash_name("file-a"),
            VectorCache::hash_name("file-b")
        );
    }

    #[test]
    fn retrieve_on_corrupt_entry_is_a_miss_not_an_error() {
        let dir = tempdir().unwrap();
        let cache = VectorCache::new(dir.path());
        let chunks = vec![ChunkRequest { offset: 0, size: 4 }];
        let name_hash = VectorCache::hash_name("corrupt");
        let req_hash = VectorCache::hash_request(&chunks);
        let path = dir
            .path()
            .join(hex::encode(name_hash))
            .join(hex::encode(req_hash));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not a valid serialized chunk list").unwrap();

        assert!(cache.retrieve("corrupt", &chunks).is_none());
    }
}
