//! Core data-model types for the S3 object store core and JCache.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// xattr key names under the fixed metadata prefix (see `object_store::xattr`).
pub mod meta_keys {
    pub const ETAG: &str = "etag";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CACHE_CONTROL: &str = "cache-control";
    pub const CONTENT_DISPOSITION: &str = "content-disposition";
    pub const AMZ_META_PREFIX: &str = "x-amz-meta-";

    // Multipart upload record xattrs.
    pub const MTPU_KEY: &str = "key";
    pub const MTPU_OPTIMIZED: &str = "optimized";
    pub const MTPU_TMP: &str = "tmp";
    pub const MTPU_PART_SIZE: &str = "part_size";
    pub const MTPU_LAST_PART_SIZE: &str = "last_part_size";
    pub const MTPU_UID: &str = "uid";
    pub const MTPU_GID: &str = "gid";
    pub const MTPU_PARTS: &str = "parts";

    /// Per-part xattrs on the optimized `tmp` file: `partN.start`, `partN.etag`.
    pub fn part_start(n: u32) -> String {
        format!("part{n}.start")
    }
    pub fn part_etag(n: u32) -> String {
        format!("part{n}.etag")
    }
}

/// Errors validating user-provided bucket/key inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValidationError(String);

impl fmt::Display for KeyValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for KeyValidationError {}

/// An S3 object key parsed into a directory prefix and leaf filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub bucket: String,
    pub prefix: String,
    pub filename: String,
}

impl ObjectKey {
    pub fn parse(bucket: &str, key: &str) -> Self {
        let key = key.trim_start_matches('/');
        let (prefix, filename) = match key.rfind('/') {
            Some(idx) => (key[..idx].to_string(), key[idx + 1..].to_string()),
            None => (String::new(), key.to_string()),
        };
        Self {
            bucket: bucket.to_string(),
            prefix,
            filename,
        }
    }

    pub fn full_key(&self) -> String {
        if self.prefix.is_empty() {
            self.filename.clone()
        } else {
            format!("{}/{}", self.prefix, self.filename)
        }
    }

    pub fn validate_object(&self) -> Result<(), KeyValidationError> {
        validate_key_path(&self.prefix, true)?;
        validate_key_path(&self.filename, false)?;
        if self.filename.is_empty() {
            return Err(KeyValidationError(
                "Object key must not be empty".to_string(),
            ));
        }
        if self.filename == "." || self.filename == ".." {
            return Err(KeyValidationError("Invalid object filename".to_string()));
        }
        Ok(())
    }

    pub fn validate_prefix(prefix: &str) -> Result<(), KeyValidationError> {
        validate_key_path(prefix, true)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.full_key())
    }
}

fn validate_key_path(value: &str, allow_slashes: bool) -> Result<(), KeyValidationError> {
    if value.contains('\0') {
        return Err(KeyValidationError(
            "Key must not contain NUL bytes".to_string(),
        ));
    }
    if value.contains('\\') {
        return Err(KeyValidationError(
            "Key must not contain backslashes".to_string(),
        ));
    }
    if !allow_slashes && value.contains('/') {
        return Err(KeyValidationError("Key must not contain '/'".to_string()));
    }
    for segment in value.split('/') {
        if segment == ".." {
            return Err(KeyValidationError(
                "Key must not contain '..' path segments".to_string(),
            ));
        }
    }
    Ok(())
}

/// Bucket name validation per §4.5.4: `^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$`.
pub fn validate_bucket_name(name: &str) -> bool {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").unwrap());
    re.is_match(name)
}

/// A bucket owner, resolved to POSIX ids for filesystem-identity switching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub id: String,
    pub display_name: String,
    pub uid: u32,
    pub gid: u32,
}

/// `{ name, owner, path }` per §3.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub name: String,
    pub owner: Owner,
    pub path: PathBuf,
}

/// Resolved object metadata, as read back from xattrs + file stat.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub user_metadata: BTreeMap<String, String>,
}

impl ObjectInfo {
    pub fn etag_quoted(&self) -> String {
        if self.etag.starts_with('"') {
            self.etag.clone()
        } else {
            format!("\"{}\"", self.etag)
        }
    }
}

/// A multipart upload record, per §3. Mirrors the xattrs stored on the
/// upload directory at `⟨mtpu⟩/⟨bucket⟩/⟨upload_id⟩`.
#[derive(Debug, Clone)]
pub struct MultipartUploadRecord {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub optimized: bool,
    pub tmp: PathBuf,
    pub part_size: u64,
    pub last_part_size: u64,
    pub uid: u32,
    pub gid: u32,
    /// Part numbers accepted so far on the optimized path, ascending.
    pub parts: Vec<u32>,
}

/// One completed or in-progress part, as returned by ListParts.
#[derive(Debug, Clone)]
pub struct PartInfo {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Transient paging state for a listing operation (§3).
#[derive(Debug, Clone, Default)]
pub struct ListingState {
    pub is_truncated: bool,
    pub key_marker: Option<String>,
    pub next_marker: Option<String>,
    pub vid_marker: Option<String>,
    pub next_vid_marker: Option<String>,
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: std::collections::BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_parse() {
        let key = ObjectKey::parse("mybucket", "releases/v1.0.0/app.zip");
        assert_eq!(key.bucket, "mybucket");
        assert_eq!(key.prefix, "releases/v1.0.0");
        assert_eq!(key.filename, "app.zip");
    }

    #[test]
    fn test_object_key_parse_root() {
        let key = ObjectKey::parse("mybucket", "file.zip");
        assert_eq!(key.prefix, "");
        assert_eq!(key.filename, "file.zip");
    }

    #[test]
    fn test_object_key_parse_leading_slash() {
        let key = ObjectKey::parse("mybucket", "/path/to/file.zip");
        assert_eq!(key.prefix, "path/to");
        assert_eq!(key.filename, "file.zip");
    }

    #[test]
    fn test_validate_rejects_path_traversal() {
        let key = ObjectKey::parse("bucket", "../../../etc/passwd");
        assert!(key.validate_object().is_err());
    }

    #[test]
    fn test_validate_rejects_backslash() {
        let key = ObjectKey::parse("bucket", "path\\file");
        assert!(key.validate_object().is_err());
    }

    #[test]
    fn test_validate_rejects_nul_byte() {
        let key = ObjectKey::parse("bucket", "path\0file");
        assert!(key.validate_object().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_filename() {
        let key = ObjectKey::parse("bucket", "prefix/");
        assert!(key.validate_object().is_err());
    }

    #[test]
    fn test_validate_rejects_dot_dot_filename() {
        let key = ObjectKey::parse("bucket", "..");
        assert!(key.validate_object().is_err());
    }

    #[test]
    fn test_validate_prefix_rejects_traversal() {
        assert!(ObjectKey::validate_prefix("../bad").is_err());
    }

    #[test]
    fn test_validate_prefix_allows_normal() {
        assert!(ObjectKey::validate_prefix("releases/v1.0/").is_ok());
    }

    #[test]
    fn bucket_name_validation() {
        assert!(validate_bucket_name("my-bucket.01"));
        assert!(!validate_bucket_name("Ab"));
        assert!(!validate_bucket_name("a"));
        assert!(!validate_bucket_name("-leading-dash"));
    }
}
