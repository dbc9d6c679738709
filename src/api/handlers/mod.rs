//! S3 API request handlers
//!
//! Split into submodules by domain:
//! - `object` — GET, HEAD, PUT, DELETE for individual objects
//! - `bucket` — Bucket CRUD and listing
//! - `multipart` — Multipart upload lifecycle
//! - `status` — Health check and aggregate stats

mod bucket;
mod multipart;
mod object;
mod status;

use super::errors::S3Error;
use crate::api::auth::AuthConfig;
use crate::metrics::Metrics;
use crate::object_store::ObjectStore;
use crate::types::{ObjectInfo, Owner};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use bucket::{
    bucket_get_handler, create_bucket, delete_bucket, head_bucket, list_buckets, BucketGetQuery,
};
pub use multipart::post_object;
pub use object::{delete_object, delete_objects, get_object, head_object, put_object_or_copy};
pub use status::{get_stats, head_root, health_check, HealthResponse, StatsQuery, StatsResponse};

pub(crate) use status::get_peak_rss_bytes;

/// Application state shared across handlers.
pub struct AppState {
    pub store: Arc<ObjectStore>,
    /// `None` disables SigV4 auth entirely (local/dev mode).
    pub auth: Option<Arc<AuthConfig>>,
    pub metrics: Option<Arc<Metrics>>,
    /// Owner attributed to every bucket created through this proxy. There is
    /// no credential-to-owner mapping file yet (see `DESIGN.md` Open Question
    /// 5), so every request is treated as this single owner.
    pub owner: Owner,
}

/// Query parameters for object-level operations (multipart upload).
#[derive(Debug, serde::Deserialize, Default)]
pub struct ObjectQuery {
    /// CreateMultipartUpload (POST with ?uploads)
    pub uploads: Option<String>,
    /// UploadPart / CompleteMultipartUpload (with ?uploadId)
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    /// UploadPart (PUT with ?partNumber)
    #[serde(rename = "partNumber")]
    pub part_number: Option<u32>,
}

// ---------------------------------------------------------------------------
// Shared utility functions used across handler submodules
// ---------------------------------------------------------------------------

/// Build response headers for a GET/HEAD on an object.
fn build_object_headers(info: &ObjectInfo) -> HeaderMap {
    let mut itoa_buf = itoa::Buffer::new();

    let mut headers = HeaderMap::new();
    headers.insert("ETag", hval(&info.etag_quoted()));
    headers.insert("Content-Length", hval(itoa_buf.format(info.size)));
    headers.insert(
        "Content-Type",
        hval(info
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream")),
    );
    headers.insert(
        "Last-Modified",
        hval(&info
            .last_modified
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string()),
    );

    if let Some(cc) = &info.cache_control {
        headers.insert("Cache-Control", hval(cc));
    }
    if let Some(cd) = &info.content_disposition {
        headers.insert("Content-Disposition", hval(cd));
    }

    for (key, value) in &info.user_metadata {
        let header_name = format!("x-amz-meta-{}", key);
        if let Ok(name) = axum::http::header::HeaderName::from_bytes(header_name.as_bytes()) {
            headers.insert(name, hval(value));
        }
    }

    headers
}

fn hval(s: &str) -> HeaderValue {
    HeaderValue::from_bytes(s.as_bytes()).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Build an XML response with correct Content-Type header.
fn xml_response(xml: impl Into<String>) -> Response {
    (
        StatusCode::OK,
        [("Content-Type", "application/xml")],
        xml.into(),
    )
        .into_response()
}

/// Extract Content-Type header as an owned String.
fn extract_content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Parse request body as UTF-8, mapping errors to MalformedXML.
///
/// PERF: Returns a borrowed `&str` into the existing `Bytes` buffer — zero-copy.
/// Do NOT change the return type to `String` or call `body.to_vec()`.
fn body_to_utf8(body: &axum::body::Bytes) -> Result<&str, S3Error> {
    std::str::from_utf8(body).map_err(|_| S3Error::MalformedXML)
}

/// Extract user-provided x-amz-meta-* headers.
fn extract_user_metadata(headers: &HeaderMap) -> BTreeMap<String, String> {
    use crate::types::meta_keys as mk;
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name_str = name.as_str();
            if let Some(suffix) = name_str.strip_prefix(mk::AMZ_META_PREFIX) {
                if let Ok(v) = value.to_str() {
                    return Some((suffix.to_string(), v.to_string()));
                }
            }
            None
        })
        .collect()
}

/// Decode base64 string to bytes (for Content-MD5 validation)
fn base64_decode(input: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(input.trim())
        .ok()
}
