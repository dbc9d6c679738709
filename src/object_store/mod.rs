//! S3 object store core: buckets, objects, and multipart uploads backed by a
//! plain POSIX filesystem tree, with per-key metadata in extended attributes.
//!
//! Grounded on `examples/original_source/src/XrdS3/XrdS3ObjectStore.{hh,cc}`.
//! Every filesystem mutation runs under the owning bucket's (uid, gid) via
//! [`fsid::ScopedFsId`], inside `tokio::task::spawn_blocking` (xattr and
//! direct file IO have no async equivalents worth the complexity here — the
//! teacher's own xattr helpers ran the same way).

pub mod bucket;
pub mod fsid;
pub mod listing;
pub mod multipart;
pub mod put;
pub mod xattr;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::types::Owner;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("no such key")]
    NoSuchKey(String),
    #[error("no such bucket")]
    NoSuchBucket(String),
    #[error("no such upload")]
    NoSuchUpload(String),
    #[error("bucket not empty")]
    BucketNotEmpty(String),
    #[error("bucket already exists")]
    BucketAlreadyExists(String),
    #[error("invalid bucket name")]
    InvalidBucketName(String),
    #[error("bad digest")]
    BadDigest,
    #[error("x-amz-content-sha256 mismatch")]
    Sha256Mismatch,
    #[error("entity too large")]
    TooLarge { size: u64, max: u64 },
    #[error("path segment already exists as an object")]
    ObjectExistInObjectPath(String),
    #[error("key already exists as a directory")]
    ObjectExistAsDir(String),
    #[error("invalid part")]
    InvalidPart(String),
    #[error("parts not in ascending order")]
    InvalidPartOrder,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Service-wide PUT size cap (§4.5.1): 5 GB.
pub const MAX_PUT_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum parts accepted by `CompleteMultipartUpload` (§4.5.2).
pub const MAX_PARTS: usize = 10_000;

/// Filesystem layout roots the object store operates under.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    /// Virtual mount point: `⟨vmp⟩/⟨bucket⟩/...` holds object data.
    pub vmp: PathBuf,
    /// `⟨user_map⟩/⟨owner⟩/⟨bucket⟩` holds bucket ownership records.
    pub user_map: PathBuf,
    /// `⟨mtpu⟩/⟨bucket⟩/⟨upload_id⟩/` holds in-progress multipart uploads.
    pub mtpu: PathBuf,
}

/// Process-wide named-mutex map, used to serialize read/modify/write of a
/// multipart upload's `parts` xattr across concurrent `UploadPart` calls.
/// Grounded on `XrdS3ObjectStore::ExclusiveLocker`.
#[derive(Default)]
pub struct ExclusiveLocker {
    map: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ExclusiveLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: &str) -> OwnedLockGuard {
        let mutex = {
            let mut map = self.map.lock();
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = mutex.clone().lock_owned().await;
        OwnedLockGuard { _guard: guard }
    }
}

pub struct OwnedLockGuard {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

/// Core object store handle. Cheap to clone (everything inside is an `Arc`
/// or plain config); intended to live once per process behind `AppState`.
pub struct ObjectStore {
    pub(crate) config: ObjectStoreConfig,
    pub(crate) locker: ExclusiveLocker,
    pub(crate) buckets: SyncMutex<HashMap<String, crate::types::Bucket>>,
}

impl ObjectStore {
    pub fn new(config: ObjectStoreConfig) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.vmp)?;
        std::fs::create_dir_all(&config.user_map)?;
        std::fs::create_dir_all(&config.mtpu)?;
        let store = Self {
            config,
            locker: ExclusiveLocker::new(),
            buckets: SyncMutex::new(HashMap::new()),
        };
        store.load_buckets()?;
        Ok(store)
    }

    /// Scans `user_map` at startup, populating the in-memory bucket registry.
    /// Layout: `⟨user_map⟩/⟨owner_id⟩/⟨bucket_name⟩` (empty marker files).
    fn load_buckets(&self) -> std::io::Result<()> {
        let mut buckets = self.buckets.lock();
        let Ok(owners) = std::fs::read_dir(&self.config.user_map) else {
            return Ok(());
        };
        for owner_entry in owners.flatten() {
            if !owner_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let owner_id = owner_entry.file_name().to_string_lossy().into_owned();
            let Ok(names) = std::fs::read_dir(owner_entry.path()) else {
                continue;
            };
            for name_entry in names.flatten() {
                let bucket_name = name_entry.file_name().to_string_lossy().into_owned();
                let owner = Owner {
                    id: owner_id.clone(),
                    display_name: owner_id.clone(),
                    uid: nix_uid_for(&owner_id),
                    gid: nix_gid_for(&owner_id),
                };
                let path = self.config.vmp.join(&bucket_name);
                buckets.insert(
                    bucket_name.clone(),
                    crate::types::Bucket {
                        name: bucket_name,
                        owner,
                        path,
                    },
                );
            }
        }
        Ok(())
    }

    pub fn bucket(&self, name: &str) -> Result<crate::types::Bucket, ObjectStoreError> {
        self.buckets
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NoSuchBucket(name.to_string()))
    }

    pub fn bucket_exists(&self, name: &str) -> bool {
        self.buckets.lock().contains_key(name)
    }

    pub fn list_bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Resolves an owner id to a uid. In a real deployment this comes from the
/// bucket/credential mapping file (`s3.config`); lacking that here, owners
/// map to the running process's own uid/gid so the scoped-identity switch
/// is a harmless no-op in single-user development setups.
fn nix_uid_for(_owner_id: &str) -> u32 {
    unsafe { libc::geteuid() }
}

fn nix_gid_for(_owner_id: &str) -> u32 {
    unsafe { libc::getegid() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = ObjectStoreConfig {
            vmp: dir.path().join("vmp"),
            user_map: dir.path().join("user_map"),
            mtpu: dir.path().join("mtpu"),
        };
        let store = ObjectStore::new(config).unwrap();
        (dir, store)
    }

    #[test]
    fn new_creates_root_directories() {
        let (dir, _store) = test_store();
        assert!(dir.path().join("vmp").is_dir());
        assert!(dir.path().join("user_map").is_dir());
        assert!(dir.path().join("mtpu").is_dir());
    }

    #[test]
    fn unknown_bucket_errors() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.bucket("nope"),
            Err(ObjectStoreError::NoSuchBucket(_))
        ));
    }

    #[tokio::test]
    async fn exclusive_locker_serializes_same_key() {
        let locker = Arc::new(ExclusiveLocker::new());
        let order = Arc::new(SyncMutex::new(Vec::new()));

        let l1 = locker.lock("upload-1").await;
        let locker2 = locker.clone();
        let order2 = order.clone();
        let handle = tokio::spawn(async move {
            // This lock should block until l1 is dropped.
            let _g = locker2.lock("upload-1").await;
            order2.lock().push(2);
        });
        order.lock().push(1);
        drop(l1);
        handle.await.unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
    }
}
