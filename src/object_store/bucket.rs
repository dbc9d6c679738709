//! Bucket create/delete/list (§4.5.4).

use std::path::PathBuf;

use tracing::instrument;

use super::{ObjectStore, ObjectStoreError};
use crate::object_store::fsid::ScopedFsId;
use crate::types::{validate_bucket_name, Bucket, Owner};

impl ObjectStore {
    /// Creates a bucket owned by `owner`. Materializes the ownership marker,
    /// the multipart scratch directory, and the backing directory (the last
    /// one under the owner's filesystem identity).
    #[instrument(skip(self, owner), fields(bucket = %name))]
    pub async fn create_bucket(
        &self,
        name: &str,
        owner: Owner,
    ) -> Result<(), ObjectStoreError> {
        if !validate_bucket_name(name) {
            return Err(ObjectStoreError::InvalidBucketName(name.to_string()));
        }
        if self.bucket_exists(name) {
            return Err(ObjectStoreError::BucketAlreadyExists(name.to_string()));
        }

        let user_map_dir = self.config.user_map.join(&owner.id);
        let marker = user_map_dir.join(name);
        let mtpu_dir = self.config.mtpu.join(name);
        let bucket_path = self.config.vmp.join(name);

        let uid = owner.uid;
        let gid = owner.gid;
        let bucket_path_for_blocking = bucket_path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&user_map_dir)?;
            std::fs::write(&marker, b"")?;
            std::fs::create_dir_all(&mtpu_dir)?;
            let _scope = ScopedFsId::new(uid, gid);
            std::fs::create_dir_all(&bucket_path_for_blocking)?;
            Ok(())
        })
        .await
        .map_err(|_| ObjectStoreError::Other("bucket creation task panicked".into()))??;

        self.buckets.lock().insert(
            name.to_string(),
            Bucket {
                name: name.to_string(),
                owner,
                path: bucket_path,
            },
        );
        Ok(())
    }

    /// Refuses non-empty buckets. Removes the backing directory plus the two
    /// auxiliary directories (ownership marker, multipart scratch), then
    /// drops the bucket from the in-memory registry.
    #[instrument(skip(self), fields(bucket = %name))]
    pub async fn delete_bucket(&self, name: &str) -> Result<(), ObjectStoreError> {
        let bucket = self.bucket(name)?;

        let uid = bucket.owner.uid;
        let gid = bucket.owner.gid;
        let path = bucket.path.clone();
        let is_empty = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
            let _scope = ScopedFsId::new(uid, gid);
            match std::fs::read_dir(&path) {
                Ok(mut entries) => Ok(entries.next().is_none()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|_| ObjectStoreError::Other("bucket scan task panicked".into()))??;

        if !is_empty {
            return Err(ObjectStoreError::BucketNotEmpty(name.to_string()));
        }

        let uid = bucket.owner.uid;
        let gid = bucket.owner.gid;
        let bucket_path = bucket.path.clone();
        let marker = self.config.user_map.join(&bucket.owner.id).join(name);
        let mtpu_dir = self.config.mtpu.join(name);
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            {
                let _scope = ScopedFsId::new(uid, gid);
                match std::fs::remove_dir(&bucket_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
            let _ = std::fs::remove_file(&marker);
            let _ = std::fs::remove_dir_all(&mtpu_dir);
            Ok(())
        })
        .await
        .map_err(|_| ObjectStoreError::Other("bucket removal task panicked".into()))??;

        self.buckets.lock().remove(name);
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %name))]
    pub async fn head_bucket(&self, name: &str) -> Result<(), ObjectStoreError> {
        self.bucket(name).map(|_| ())
    }

    /// Bucket names owned by `owner_id`, sorted.
    pub fn list_buckets_for(&self, owner_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .buckets
            .lock()
            .values()
            .filter(|b| b.owner.id == owner_id)
            .map(|b| b.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn bucket_path(&self, name: &str) -> Result<PathBuf, ObjectStoreError> {
        self.bucket(name).map(|b| b.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::ObjectStoreConfig;

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

    #[tokio::test]
    async fn create_then_head_then_delete() {
        let (_dir, store) = test_store();
        store.create_bucket("mybucket", test_owner()).await.unwrap();
        assert!(store.head_bucket("mybucket").await.is_ok());
        store.delete_bucket("mybucket").await.unwrap();
        assert!(store.head_bucket("mybucket").await.is_err());
    }

    #[tokio::test]
    async fn create_rejects_invalid_name() {
        let (_dir, store) = test_store();
        let err = store.create_bucket("A", test_owner()).await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::InvalidBucketName(_)));
    }

    #[tokio::test]
    async fn create_rejects_duplicate() {
        let (_dir, store) = test_store();
        store.create_bucket("dup-bucket", test_owner()).await.unwrap();
        let err = store
            .create_bucket("dup-bucket", test_owner())
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::BucketAlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_refuses_non_empty_bucket() {
        let (_dir, store) = test_store();
        store.create_bucket("full", test_owner()).await.unwrap();
        let path = store.bucket_path("full").unwrap();
        std::fs::write(path.join("obj"), b"x").unwrap();
        let err = store.delete_bucket("full").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::BucketNotEmpty(_)));
    }

    #[tokio::test]
    async fn list_buckets_for_owner_is_sorted() {
        let (_dir, store) = test_store();
        store.create_bucket("zeta", test_owner()).await.unwrap();
        store.create_bucket("alpha", test_owner()).await.unwrap();
        assert_eq!(store.list_buckets_for("alice"), vec!["alpha", "zeta"]);
    }
}
