//! Listing algorithm shared by ListObjects, ListObjectsV2 and
//! ListObjectVersions (§4.5.3): a deque-seeded, depth-first, sorted walk of
//! the bucket's backing directory tree.

use std::collections::VecDeque;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::instrument;

use super::fsid::ScopedFsId;
use super::put::read_object_metadata;
use super::{xattr, ObjectStore, ObjectStoreError};
use crate::types::{Bucket, ListingState, ObjectInfo};

#[derive(Debug, Clone)]
pub struct ListingOptions {
    pub prefix: String,
    pub delimiter: Option<char>,
    pub max_keys: usize,
    /// Continuation point: entries lexicographically at or before this value
    /// are skipped. Covers `marker` (v1), `continuation-token`/`start-after`
    /// (v2) and `key-marker` (versions) — all degenerate to the same cursor
    /// since this store has no real versioning.
    pub marker: Option<String>,
}

fn common_prefix_after(rel_key: &str, prefix: &str, delimiter: char) -> Option<String> {
    let rest = rel_key.strip_prefix(prefix)?;
    let idx = rest.find(delimiter)?;
    Some(format!("{prefix}{}{delimiter}", &rest[..idx]))
}

fn sorted_dir_names(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(path)
        .map(|it| {
            it.flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn build_object_info(path: &Path, rel_key: &str) -> std::io::Result<ObjectInfo> {
    let stat = std::fs::metadata(path)?;
    let etag = xattr::get(path, crate::types::meta_keys::ETAG)?.unwrap_or_default();
    let (content_type, cache_control, content_disposition, user_metadata) =
        read_object_metadata(path)?;
    Ok(ObjectInfo {
        key: rel_key.to_string(),
        size: stat.len(),
        etag,
        last_modified: DateTime::<Utc>::from(stat.modified()?),
        content_type,
        cache_control,
        content_disposition,
        user_metadata,
    })
}

fn list_objects_blocking(
    bucket: &Bucket,
    opts: &ListingOptions,
) -> Result<ListingState, ObjectStoreError> {
    let prefix = opts.prefix.trim_start_matches('/');
    let basedir = match prefix.rfind('/') {
        Some(idx) => &prefix[..idx],
        None => "",
    };
    let base_path = if basedir.is_empty() {
        bucket.path.clone()
    } else {
        bucket.path.join(basedir)
    };

    let mut deque: VecDeque<String> = VecDeque::new();
    for name in sorted_dir_names(&base_path) {
        let rel = if basedir.is_empty() {
            name
        } else {
            format!("{basedir}/{name}")
        };
        deque.push_back(rel);
    }

    let mut state = ListingState::default();
    let marker = opts.marker.as_deref().unwrap_or("");

    while let Some(rel) = deque.pop_front() {
        if rel == "." || rel == ".." {
            continue;
        }
        if !rel.starts_with(prefix) {
            continue;
        }
        if !marker.is_empty() && rel.as_str() <= marker {
            continue;
        }

        if state.objects.len() + state.common_prefixes.len() >= opts.max_keys {
            state.is_truncated = true;
            state.next_marker = Some(rel);
            return Ok(state);
        }

        if let Some(delim) = opts.delimiter {
            if let Some(cp) = common_prefix_after(&rel, prefix, delim) {
                state.common_prefixes.insert(cp);
                continue;
            }
        }

        let abs_path = bucket.path.join(&rel);
        let meta = match std::fs::symlink_metadata(&abs_path) {
            Ok(m) => m,
            Err(_) => continue,
        };

        if meta.is_dir() {
            if opts.delimiter == Some('/') {
                state.common_prefixes.insert(format!("{rel}/"));
            } else {
                for child in sorted_dir_names(&abs_path).into_iter().rev() {
                    deque.push_front(format!("{rel}/{child}"));
                }
            }
        } else {
            match build_object_info(&abs_path, &rel) {
                Ok(info) => state.objects.push(info),
                Err(_) => continue,
            }
        }
    }

    Ok(state)
}

impl ObjectStore {
    #[instrument(skip(self, opts), fields(bucket = %bucket_name, prefix = %opts.prefix))]
    async fn list_objects_common(
        &self,
        bucket_name: &str,
        opts: ListingOptions,
    ) -> Result<ListingState, ObjectStoreError> {
        let bucket = self.bucket(bucket_name)?;
        let uid = bucket.owner.uid;
        let gid = bucket.owner.gid;
        tokio::task::spawn_blocking(move || {
            let _scope = ScopedFsId::new(uid, gid);
            list_objects_blocking(&bucket, &opts)
        })
        .await
        .map_err(|_| ObjectStoreError::Other("list_objects task panicked".into()))?
    }

    /// `GET ?` (ListObjects, v1): cursor is `marker`.
    pub async fn list_objects_v1(
        &self,
        bucket_name: &str,
        prefix: &str,
        marker: Option<String>,
        delimiter: Option<char>,
        max_keys: usize,
    ) -> Result<ListingState, ObjectStoreError> {
        self.list_objects_common(
            bucket_name,
            ListingOptions {
                prefix: prefix.to_string(),
                delimiter,
                max_keys,
                marker,
            },
        )
        .await
    }

    /// `GET ?list-type=2` (ListObjectsV2): cursor is `continuation-token`
    /// (falling back to `start-after` on the first page).
    pub async fn list_objects_v2(
        &self,
        bucket_name: &str,
        prefix: &str,
        continuation_token: Option<String>,
        start_after: Option<String>,
        delimiter: Option<char>,
        max_keys: usize,
    ) -> Result<ListingState, ObjectStoreError> {
        let marker = continuation_token.or(start_after);
        let mut state = self
            .list_objects_common(
                bucket_name,
                ListingOptions {
                    prefix: prefix.to_string(),
                    delimiter,
                    max_keys,
                    marker,
                },
            )
            .await?;
        if state.is_truncated {
            state.next_vid_marker = state.next_marker.clone();
        }
        Ok(state)
    }

    /// `GET ?versions` (ListObjectVersions): degenerate since the store isn't
    /// versioned — every object is its own single "version".
    pub async fn list_object_versions(
        &self,
        bucket_name: &str,
        prefix: &str,
        key_marker: Option<String>,
        delimiter: Option<char>,
        max_keys: usize,
    ) -> Result<ListingState, ObjectStoreError> {
        let mut state = self
            .list_objects_common(
                bucket_name,
                ListingOptions {
                    prefix: prefix.to_string(),
                    delimiter,
                    max_keys,
                    marker: key_marker,
                },
            )
            .await?;
        state.vid_marker = Some("null".to_string());
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::put::PutOptions;
    use crate::object_store::ObjectStoreConfig;
    use crate::types::Owner;
    use bytes::Bytes;

    fn test_owner() -> Owner {
        Owner {
            id: "alice".into(),
            display_name: "alice".into(),
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
        }
    }

    async fn test_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = ObjectStoreConfig {
            vmp: dir.path().join("vmp"),
            user_map: dir.path().join("user_map"),
            mtpu: dir.path().join("mtpu"),
        };
        let store = ObjectStore::new(config).unwrap();
        store.create_bucket("b", test_owner()).await.unwrap();
        for key in ["a.txt", "dir/b.txt", "dir/c.txt", "dir/sub/d.txt", "z.txt"] {
            store
                .put_object("b", key, Bytes::from_static(b"x"), PutOptions::default())
                .await
                .unwrap();
        }
        (dir, store)
    }

    #[tokio::test]
    async fn lists_flat_keys_without_delimiter() {
        let (_dir, store) = test_store().await;
        let state = store
            .list_objects_v1("b", "", None, None, 100)
            .await
            .unwrap();
        let mut keys: Vec<_> = state.objects.iter().map(|o| o.key.clone()).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["a.txt", "dir/b.txt", "dir/c.txt", "dir/sub/d.txt", "z.txt"]
        );
        assert!(state.common_prefixes.is_empty());
    }

    #[tokio::test]
    async fn groups_common_prefixes_with_delimiter() {
        let (_dir, store) = test_store().await;
        let state = store
            .list_objects_v1("b", "", None, Some('/'), 100)
            .await
            .unwrap();
        let keys: Vec<_> = state.objects.iter().map(|o| o.key.clone()).collect();
        assert_eq!(keys, vec!["a.txt", "z.txt"]);
        assert!(state.common_prefixes.contains("dir/"));
    }

    #[tokio::test]
    async fn max_keys_truncates_and_sets_marker() {
        let (_dir, store) = test_store().await;
        let state = store.list_objects_v1("b", "", None, None, 2).await.unwrap();
        assert!(state.is_truncated);
        assert_eq!(state.objects.len(), 2);
        assert!(state.next_marker.is_some());
    }

    #[tokio::test]
    async fn marker_resumes_after_previous_page() {
        let (_dir, store) = test_store().await;
        let first = store.list_objects_v1("b", "", None, None, 2).await.unwrap();
        let second = store
            .list_objects_v1("b", "", first.next_marker.clone(), None, 100)
            .await
            .unwrap();
        let mut all: Vec<String> = first
            .objects
            .iter()
            .chain(second.objects.iter())
            .map(|o| o.key.clone())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn prefix_scopes_to_subdirectory() {
        let (_dir, store) = test_store().await;
        let state = store
            .list_objects_v1("b", "dir/", None, None, 100)
            .await
            .unwrap();
        let keys: Vec<_> = state.objects.iter().map(|o| o.key.clone()).collect();
        assert_eq!(keys, vec!["dir/b.txt", "dir/c.txt", "dir/sub/d.txt"]);
    }
}
