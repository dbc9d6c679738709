//! Health-check and aggregate statistics handlers.

use super::{AppState, S3Error};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Query parameters for /stats endpoint
#[derive(Debug, Deserialize, Default)]
pub struct StatsQuery {
    pub bucket: Option<String>,
}

/// Aggregate storage statistics
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_objects: u64,
    pub total_bytes: u64,
}

/// Stats handler
/// GET /stats — aggregate stats across all buckets
/// GET /stats?bucket=NAME — stats for a specific bucket
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, S3Error> {
    let buckets_to_scan: Vec<String> = if let Some(ref bucket) = query.bucket {
        vec![bucket.clone()]
    } else {
        state.store.list_bucket_names()
    };

    let mut total_objects: u64 = 0;
    let mut total_bytes: u64 = 0;

    for bucket in &buckets_to_scan {
        let page = state
            .store
            .list_objects_v1(bucket, "", None, None, usize::MAX)
            .await?;
        for object in &page.objects {
            total_objects += 1;
            total_bytes += object.size;
        }
    }

    Ok(Json(StatsResponse {
        total_objects,
        total_bytes,
    }))
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub backend: String,
    pub peak_rss_bytes: u64,
}

/// Return the process-lifetime peak RSS (high-water mark) in bytes.
/// Uses `getrusage(RUSAGE_SELF)` which captures even microsecond-lived allocations.
pub(crate) fn get_peak_rss_bytes() -> u64 {
    // SAFETY: `libc::getrusage` is a POSIX syscall that writes into a caller-provided
    // `rusage` struct. We zero-initialise it first, and the call is infallible for
    // RUSAGE_SELF. No aliasing or lifetime issues — `usage` is a local stack variable.
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) == 0 {
            let ru_maxrss = usage.ru_maxrss as u64;
            // macOS reports ru_maxrss in bytes; Linux reports in KB
            if cfg!(target_os = "macos") {
                ru_maxrss
            } else {
                ru_maxrss * 1024
            }
        } else {
            0
        }
    }
}

/// S3 root HEAD handler — connection probe used by Cyberduck and other S3 clients
/// HEAD /
pub async fn head_root() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("server", "jcache-s3store")
        .header("x-amz-request-id", "0")
        .body(Body::empty())
        .unwrap()
}

/// Health check handler
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: "ready".to_string(),
        peak_rss_bytes: get_peak_rss_bytes(),
    })
}
