//! Multipart upload S3 handlers: CreateMultipartUpload, CompleteMultipartUpload.

use super::{body_to_utf8, xml_response, AppState, ObjectQuery, S3Error};
use crate::api::extractors::ValidatedPath;
use crate::api::xml::{
    CompleteMultipartUploadRequest, CompleteMultipartUploadResult, InitiateMultipartUploadResult,
};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// POST object handler — dispatches multipart upload operations by query param.
#[instrument(skip(state, body))]
pub async fn post_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
    _headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    if query.uploads.is_some() {
        initiate_multipart_upload(&state, &bucket, &key).await
    } else if let Some(upload_id) = &query.upload_id {
        complete_multipart_upload(&state, &bucket, &key, upload_id, body).await
    } else {
        Err(S3Error::InvalidRequest(
            "POST on object requires ?uploads or ?uploadId parameter".to_string(),
        ))
    }
}

/// POST /{bucket}/{key}?uploads — CreateMultipartUpload
///
/// The store does not yet accept content-type/user-metadata at creation
/// time (see `DESIGN.md`), so any such headers on this request are not
/// persisted; CompleteMultipartUpload objects always come back with no
/// content-type and no user metadata.
async fn initiate_multipart_upload(
    state: &AppState,
    bucket: &str,
    key: &str,
) -> Result<Response, S3Error> {
    info!("CreateMultipartUpload {}/{}", bucket, key);

    let upload_id = state.store.create_multipart_upload(bucket, key).await?;

    let xml = InitiateMultipartUploadResult {
        bucket: bucket.to_string(),
        key: key.to_string(),
        upload_id,
    }
    .to_xml();
    Ok(xml_response(xml))
}

/// POST /{bucket}/{key}?uploadId=X — CompleteMultipartUpload
async fn complete_multipart_upload(
    state: &AppState,
    bucket: &str,
    key: &str,
    upload_id: &str,
    body: Bytes,
) -> Result<Response, S3Error> {
    info!(
        "CompleteMultipartUpload {}/{} uploadId={}",
        bucket, key, upload_id
    );

    let body_str = body_to_utf8(&body)?;
    let complete_req = CompleteMultipartUploadRequest::from_xml(body_str).map_err(|e| {
        warn!("Failed to parse CompleteMultipartUpload XML: {}", e);
        S3Error::MalformedXML
    })?;

    let requested_parts: Vec<(u32, String)> = complete_req
        .parts
        .iter()
        .map(|p| (p.part_number, p.etag.clone()))
        .collect();

    let info = state
        .store
        .complete_multipart_upload(bucket, upload_id, &requested_parts)
        .await?;

    debug!(
        "CompleteMultipartUpload {}/{} ({} bytes)",
        bucket, key, info.size
    );

    let xml = CompleteMultipartUploadResult {
        location: format!("/{}/{}", bucket, key),
        bucket: bucket.to_string(),
        key: key.to_string(),
        etag: info.etag_quoted(),
    }
    .to_xml();
    Ok(xml_response(xml))
}
