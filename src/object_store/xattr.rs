//! Per-key extended-attribute storage for object and multipart-upload metadata.
//!
//! All object/part/upload metadata (etag, content-type, user metadata,
//! multipart bookkeeping — see `crate::types::meta_keys`) lives in individual
//! xattrs on the backing file, namespaced under `user.s3.`. This generalizes
//! the single-blob xattr pattern the teacher used for its own metadata
//! (`xattr::get`/`set`/`remove` inside `spawn_blocking`) to one xattr per key,
//! which is what lets `ListParts`/`CompleteMultipartUpload` read individual
//! `partN.start`/`partN.etag` fields without deserializing a shared blob.

use std::path::{Path, PathBuf};

const NAMESPACE: &str = "user.s3.";

fn namespaced(key: &str) -> String {
    format!("{NAMESPACE}{key}")
}

/// Reads one xattr as a UTF-8 string. Missing attribute is `Ok(None)`.
pub fn get(path: &Path, key: &str) -> std::io::Result<Option<String>> {
    match xattr::get(path, namespaced(key))? {
        Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        None => Ok(None),
    }
}

pub fn set(path: &Path, key: &str, value: &str) -> std::io::Result<()> {
    xattr::set(path, namespaced(key), value.as_bytes())
}

pub fn remove(path: &Path, key: &str) -> std::io::Result<()> {
    match xattr::remove(path, namespaced(key)) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENODATA) => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn get_u64(path: &Path, key: &str) -> std::io::Result<Option<u64>> {
    Ok(get(path, key)?.and_then(|s| s.parse().ok()))
}

pub fn get_u32(path: &Path, key: &str) -> std::io::Result<Option<u32>> {
    Ok(get(path, key)?.and_then(|s| s.parse().ok()))
}

/// Lists every xattr under our namespace, stripped of the prefix.
pub fn list_keys(path: &Path) -> std::io::Result<Vec<String>> {
    let names = xattr::list(path)?;
    Ok(names
        .filter_map(|n| n.to_str().map(str::to_owned))
        .filter_map(|n| n.strip_prefix(NAMESPACE).map(str::to_owned))
        .collect())
}

/// Reads every `x-amz-meta-*` xattr as the user-metadata map (without the prefix).
pub fn user_metadata(path: &Path) -> std::io::Result<std::collections::BTreeMap<String, String>> {
    let mut out = std::collections::BTreeMap::new();
    for key in list_keys(path)? {
        if let Some(name) = key.strip_prefix(crate::types::meta_keys::AMZ_META_PREFIX) {
            if let Some(value) = get(path, &key)? {
                out.insert(name.to_string(), value);
            }
        }
    }
    Ok(out)
}

/// Parses the multipart `parts` CSV xattr (`"1,2,3"`) into ascending part numbers.
pub fn parse_parts_csv(csv: &str) -> Vec<u32> {
    let mut v: Vec<u32> = csv
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();
    v.sort_unstable();
    v
}

pub fn parts_csv(parts: &[u32]) -> String {
    parts
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Blocking helper run inside `spawn_blocking`: joins a relative xattr read
/// with the rest of a closure so callers don't sprinkle `spawn_blocking`
/// everywhere themselves.
pub async fn run_blocking<F, T>(f: F) -> std::io::Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::other("blocking task panicked")),
    }
}

#[allow(dead_code)]
pub fn tmp_name(prefix: &str) -> String {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let r: u32 = rand::random();
    format!(".{prefix}.{ts}{r:08x}")
}

#[allow(dead_code)]
pub fn tmp_path(dir: &Path, leaf: &str) -> PathBuf {
    dir.join(tmp_name(leaf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"data").unwrap();

        if set(&path, "etag", "\"abc123\"").is_err() {
            // xattrs unsupported on this filesystem (e.g. tmpfs overlay in CI);
            // skip rather than fail spuriously.
            return;
        }
        assert_eq!(get(&path, "etag").unwrap().as_deref(), Some("\"abc123\""));
        remove(&path, "etag").unwrap();
        assert_eq!(get(&path, "etag").unwrap(), None);
    }

    #[test]
    fn parts_csv_roundtrip() {
        let parts = vec![1, 2, 5, 3];
        let csv = parts_csv(&{
            let mut p = parts.clone();
            p.sort_unstable();
            p
        });
        assert_eq!(csv, "1,2,3,5");
        assert_eq!(parse_parts_csv(&csv), vec![1, 2, 3, 5]);
    }

    #[test]
    fn parse_parts_csv_empty() {
        assert_eq!(parse_parts_csv(""), Vec::<u32>::new());
    }
}
