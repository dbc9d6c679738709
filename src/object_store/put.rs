//! Streaming PUT, GET, HEAD and DELETE for individual objects (§4.5.1).

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest as Md5Digest, Md5};
use sha2::{Digest, Sha256};
use tracing::instrument;

use super::fsid::ScopedFsId;
use super::{xattr, ObjectStore, ObjectStoreError, MAX_PUT_SIZE};
use crate::types::{meta_keys, Bucket, ObjectInfo};

/// Caller-supplied headers that become object metadata / integrity checks.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub user_metadata: BTreeMap<String, String>,
    /// Base64-decoded bytes of the `Content-MD5` header, if supplied.
    pub content_md5: Option<Vec<u8>>,
    /// Hex digest from `x-amz-content-sha256`, if supplied and not a
    /// streaming/unsigned sentinel.
    pub x_amz_content_sha256: Option<String>,
}

/// Hashes `data` in capped slices (mirrors "each buffer slice read is both
/// hashed and written" from the streaming algorithm, even though the whole
/// body already sits in memory by the time axum hands it to us).
fn dual_hash(data: &[u8]) -> ([u8; 16], [u8; 32]) {
    const SLICE: usize = 8 * 1024 * 1024;
    let mut md5 = Md5::new();
    let mut sha = Sha256::new();
    for chunk in data.chunks(SLICE) {
        md5.update(chunk);
        sha.update(chunk);
    }
    (md5.finalize().into(), sha.finalize().into())
}

/// Resolves `bucket_path / prefix / filename`, validating that no
/// intermediate segment is a non-directory and the target isn't a directory.
pub(super) fn resolve_object_path(
    bucket: &Bucket,
    prefix: &str,
    filename: &str,
) -> Result<PathBuf, ObjectStoreError> {
    let mut path = bucket.path.clone();
    if !prefix.is_empty() {
        for segment in prefix.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
            if let Ok(meta) = std::fs::symlink_metadata(&path) {
                if !meta.is_dir() {
                    return Err(ObjectStoreError::ObjectExistInObjectPath(
                        path.display().to_string(),
                    ));
                }
            }
        }
    }
    path.push(filename);
    if let Ok(meta) = std::fs::symlink_metadata(&path) {
        if meta.is_dir() {
            return Err(ObjectStoreError::ObjectExistAsDir(path.display().to_string()));
        }
    }
    Ok(path)
}

pub(crate) fn open_sibling_temp(final_path: &Path) -> std::io::Result<(PathBuf, std::fs::File)> {
    let dir = final_path.parent().unwrap_or_else(|| Path::new("."));
    let leaf = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for _ in 0..8 {
        let name = xattr::tmp_name(&leaf);
        let candidate = dir.join(&name);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(f) => return Ok((candidate, f)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::other("could not allocate a unique temp file name"))
}

fn write_object_metadata(
    path: &Path,
    etag: &str,
    opts: &PutOptions,
) -> std::io::Result<()> {
    xattr::set(path, meta_keys::ETAG, etag)?;
    if let Some(ct) = &opts.content_type {
        xattr::set(path, meta_keys::CONTENT_TYPE, ct)?;
    }
    if let Some(cc) = &opts.cache_control {
        xattr::set(path, meta_keys::CACHE_CONTROL, cc)?;
    }
    if let Some(cd) = &opts.content_disposition {
        xattr::set(path, meta_keys::CONTENT_DISPOSITION, cd)?;
    }
    for (k, v) in &opts.user_metadata {
        xattr::set(path, &format!("{}{}", meta_keys::AMZ_META_PREFIX, k), v)?;
    }
    Ok(())
}

pub(crate) fn read_object_metadata(path: &Path) -> std::io::Result<(Option<String>, Option<String>, Option<String>, BTreeMap<String, String>)> {
    Ok((
        xattr::get(path, meta_keys::CONTENT_TYPE)?,
        xattr::get(path, meta_keys::CACHE_CONTROL)?,
        xattr::get(path, meta_keys::CONTENT_DISPOSITION)?,
        xattr::user_metadata(path)?,
    ))
}

fn to_datetime(t: std::time::SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

impl ObjectStore {
    #[instrument(skip(self, data, opts), fields(bucket = %bucket_name, key = %key, len = data.len()))]
    pub async fn put_object(
        &self,
        bucket_name: &str,
        key: &str,
        data: Bytes,
        opts: PutOptions,
    ) -> Result<ObjectInfo, ObjectStoreError> {
        if data.len() as u64 > MAX_PUT_SIZE {
            return Err(ObjectStoreError::TooLarge {
                size: data.len() as u64,
                max: MAX_PUT_SIZE,
            });
        }

        let bucket = self.bucket(bucket_name)?;
        let object_key = crate::types::ObjectKey::parse(bucket_name, key);

        let uid = bucket.owner.uid;
        let gid = bucket.owner.gid;
        let bucket_for_blocking = bucket.clone();
        let prefix = object_key.prefix.clone();
        let filename = object_key.filename.clone();
        let full_key = object_key.full_key();

        let result = tokio::task::spawn_blocking(move || -> Result<ObjectInfo, ObjectStoreError> {
            let _scope = ScopedFsId::new(uid, gid);

            let final_path = resolve_object_path(&bucket_for_blocking, &prefix, &filename)?;
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let (tmp_path, mut file) = open_sibling_temp(&final_path)?;
            let cleanup = |p: &Path| {
                let _ = std::fs::remove_file(p);
            };

            if let Err(e) = file.write_all(&data) {
                cleanup(&tmp_path);
                return Err(e.into());
            }
            if let Err(e) = file.sync_all() {
                cleanup(&tmp_path);
                return Err(e.into());
            }

            let (md5_bytes, sha_bytes) = dual_hash(&data);
            let md5_hex = hex::encode(md5_bytes);
            let sha_hex = hex::encode(sha_bytes);

            if let Some(expected) = &opts.content_md5 {
                if expected.as_slice() != md5_bytes {
                    cleanup(&tmp_path);
                    return Err(ObjectStoreError::BadDigest);
                }
            }
            if let Some(expected) = &opts.x_amz_content_sha256 {
                if !expected.eq_ignore_ascii_case(&sha_hex) {
                    cleanup(&tmp_path);
                    return Err(ObjectStoreError::Sha256Mismatch);
                }
            }

            let etag = format!("\"{md5_hex}\"");
            if let Err(e) = write_object_metadata(&tmp_path, &etag, &opts) {
                cleanup(&tmp_path);
                return Err(e.into());
            }

            std::fs::rename(&tmp_path, &final_path)?;

            let stat = std::fs::metadata(&final_path)?;
            Ok(ObjectInfo {
                key: full_key,
                size: stat.len(),
                etag,
                last_modified: to_datetime(stat.modified()?),
                content_type: opts.content_type,
                cache_control: opts.cache_control,
                content_disposition: opts.content_disposition,
                user_metadata: opts.user_metadata,
            })
        })
        .await
        .map_err(|_| ObjectStoreError::Other("put_object task panicked".into()))?;

        result
    }

    #[instrument(skip(self), fields(bucket = %bucket_name, key = %key))]
    pub async fn head_object(
        &self,
        bucket_name: &str,
        key: &str,
    ) -> Result<ObjectInfo, ObjectStoreError> {
        let bucket = self.bucket(bucket_name)?;
        let object_key = crate::types::ObjectKey::parse(bucket_name, key);
        let uid = bucket.owner.uid;
        let gid = bucket.owner.gid;
        let prefix = object_key.prefix.clone();
        let filename = object_key.filename.clone();
        let full_key = object_key.full_key();
        let key_for_err = full_key.clone();

        tokio::task::spawn_blocking(move || -> Result<ObjectInfo, ObjectStoreError> {
            let _scope = ScopedFsId::new(uid, gid);
            let path = resolve_object_path(&bucket, &prefix, &filename)?;
            let stat = std::fs::metadata(&path)
                .map_err(|_| ObjectStoreError::NoSuchKey(key_for_err.clone()))?;
            let etag = xattr::get(&path, meta_keys::ETAG)?
                .unwrap_or_else(|| format!("\"{}\"", hex::encode([0u8; 16])));
            let (content_type, cache_control, content_disposition, user_metadata) =
                read_object_metadata(&path)?;
            Ok(ObjectInfo {
                key: full_key,
                size: stat.len(),
                etag,
                last_modified: to_datetime(stat.modified()?),
                content_type,
                cache_control,
                content_disposition,
                user_metadata,
            })
        })
        .await
        .map_err(|_| ObjectStoreError::Other("head_object task panicked".into()))?
    }

    /// Returns the full object body alongside its metadata. Range support is
    /// left to callers slicing the returned bytes (small enough objects in
    /// practice that a streaming read isn't worth the complexity here).
    #[instrument(skip(self), fields(bucket = %bucket_name, key = %key))]
    pub async fn get_object(
        &self,
        bucket_name: &str,
        key: &str,
    ) -> Result<(Bytes, ObjectInfo), ObjectStoreError> {
        let info = self.head_object(bucket_name, key).await?;
        let bucket = self.bucket(bucket_name)?;
        let object_key = crate::types::ObjectKey::parse(bucket_name, key);
        let uid = bucket.owner.uid;
        let gid = bucket.owner.gid;
        let prefix = object_key.prefix.clone();
        let filename = object_key.filename.clone();

        let data = tokio::task::spawn_blocking(move || -> Result<Bytes, ObjectStoreError> {
            let _scope = ScopedFsId::new(uid, gid);
            let path = resolve_object_path(&bucket, &prefix, &filename)?;
            Ok(Bytes::from(std::fs::read(&path)?))
        })
        .await
        .map_err(|_| ObjectStoreError::Other("get_object task panicked".into()))??;

        Ok((data, info))
    }

    #[instrument(skip(self), fields(bucket = %bucket_name, key = %key))]
    pub async fn delete_object(
        &self,
        bucket_name: &str,
        key: &str,
    ) -> Result<(), ObjectStoreError> {
        let bucket = self.bucket(bucket_name)?;
        let object_key = crate::types::ObjectKey::parse(bucket_name, key);
        let uid = bucket.owner.uid;
        let gid = bucket.owner.gid;
        let prefix = object_key.prefix.clone();
        let filename = object_key.filename.clone();

        tokio::task::spawn_blocking(move || -> Result<(), ObjectStoreError> {
            let _scope = ScopedFsId::new(uid, gid);
            let path = resolve_object_path(&bucket, &prefix, &filename)?;
            match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
        .map_err(|_| ObjectStoreError::Other("delete_object task panicked".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::ObjectStoreConfig;
    use crate::types::Owner;

    fn test_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = ObjectStoreConfig {
            vmp: dir.path().join("vmp"),
            user_map: dir.path().join("user_map"),
            mtpu: dir.path().join("mtpu"),
        };
        (dir, ObjectStore::new(config).unwrap())
    }

    fn test_owner() -> Owner {
        Owner {
            id: "alice".into(),
            display_name: "alice".into(),
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
        }
    }

    async fn bucket(store: &ObjectStore, name: &str) {
        store.create_bucket(name, test_owner()).await.unwrap();
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let (_dir, store) = test_store();
        bucket(&store, "b").await;
        let info = store
            .put_object("b", "a/b/c.txt", Bytes::from_static(b"hello world"), PutOptions::default())
            .await
            .unwrap();
        assert_eq!(info.size, 11);
        let (data, info2) = store.get_object("b", "a/b/c.txt").await.unwrap();
        assert_eq!(data, Bytes::from_static(b"hello world"));
        assert_eq!(info.etag, info2.etag);
    }

    #[tokio::test]
    async fn put_rejects_content_md5_mismatch() {
        let (_dir, store) = test_store();
        bucket(&store, "b").await;
        let opts = PutOptions {
            content_md5: Some(vec![0u8; 16]),
            ..Default::default()
        };
        let err = store
            .put_object("b", "x", Bytes::from_static(b"data"), opts)
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::BadDigest));
    }

    #[tokio::test]
    async fn put_fails_when_intermediate_segment_is_a_file() {
        let (_dir, store) = test_store();
        bucket(&store, "b").await;
        store
            .put_object("b", "leaf", Bytes::from_static(b"x"), PutOptions::default())
            .await
            .unwrap();
        let err = store
            .put_object("b", "leaf/child", Bytes::from_static(b"y"), PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::ObjectExistInObjectPath(_)));
    }

    #[tokio::test]
    async fn put_fails_when_target_is_a_directory() {
        let (_dir, store) = test_store();
        bucket(&store, "b").await;
        store
            .put_object("b", "dir/child", Bytes::from_static(b"x"), PutOptions::default())
            .await
            .unwrap();
        let err = store
            .put_object("b", "dir", Bytes::from_static(b"y"), PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::ObjectExistAsDir(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = test_store();
        bucket(&store, "b").await;
        store.delete_object("b", "missing").await.unwrap();
    }

    #[tokio::test]
    async fn head_missing_object_errors() {
        let (_dir, store) = test_store();
        bucket(&store, "b").await;
        let err = store.head_object("b", "missing").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::NoSuchKey(_)));
    }

    #[tokio::test]
    async fn user_metadata_roundtrips() {
        let (_dir, store) = test_store();
        bucket(&store, "b").await;
        let mut meta = BTreeMap::new();
        meta.insert("project".to_string(), "jcache".to_string());
        let opts = PutOptions {
            content_type: Some("text/plain".into()),
            user_metadata: meta.clone(),
            ..Default::default()
        };
        store
            .put_object("b", "k", Bytes::from_static(b"v"), opts)
            .await
            .unwrap();
        let info = store.head_object("b", "k").await.unwrap();
        assert_eq!(info.content_type.as_deref(), Some("text/plain"));
        assert_eq!(info.user_metadata, meta);
    }
}
