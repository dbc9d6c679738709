//! Object-level S3 handlers: GET, HEAD, PUT (with copy detection), DELETE.

use super::{
    base64_decode, build_object_headers, extract_content_type, extract_user_metadata, xml_response,
    AppState, ObjectQuery, S3Error,
};
use crate::object_store::put::PutOptions;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::api::aws_chunked::{decode_aws_chunked, get_decoded_content_length, is_aws_chunked};
use crate::api::extractors::{ValidatedBucket, ValidatedPath};
use crate::api::xml::{DeleteError, DeleteRequest, DeleteResult, DeletedObject, ListPartsResult};

/// Query parameters for bucket-level POST operations
#[derive(Debug, serde::Deserialize, Default)]
pub struct BucketPostQuery {
    pub delete: Option<String>,
}

fn put_options_from_headers(headers: &HeaderMap) -> PutOptions {
    let content_md5 = headers
        .get("content-md5")
        .and_then(|v| v.to_str().ok())
        .and_then(base64_decode);

    PutOptions {
        content_type: extract_content_type(headers),
        cache_control: headers
            .get("cache-control")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        content_disposition: headers
            .get("content-disposition")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        user_metadata: extract_user_metadata(headers),
        content_md5,
        x_amz_content_sha256: headers
            .get("x-amz-content-sha256")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
    }
}

/// PUT object handler (internal)
/// Called by put_object_or_copy after validation
#[instrument(skip(state, body))]
async fn put_object_inner(
    state: &Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    info!("PUT {}/{} ({} bytes)", bucket, key, body.len());

    let opts = put_options_from_headers(headers);
    let info = state.store.put_object(bucket, key, body, opts).await?;

    debug!("Stored {}/{} ({} bytes)", bucket, key, info.size);

    Ok((StatusCode::OK, [("ETag", info.etag_quoted())], "").into_response())
}

/// COPY object handler (internal)
/// Called by put_object_or_copy after validation
#[instrument(skip(state))]
async fn copy_object_inner(
    state: &Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let copy_source = headers
        .get("x-amz-copy-source")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| S3Error::InvalidRequest("Missing x-amz-copy-source header".to_string()))?;

    let copy_source = urlencoding::decode(copy_source)
        .map_err(|_| S3Error::InvalidArgument("Invalid copy source encoding".to_string()))?;
    let copy_source = copy_source.trim_start_matches('/');

    let (source_bucket, source_key) = copy_source
        .split_once('/')
        .ok_or_else(|| S3Error::InvalidArgument("Copy source must be bucket/key".to_string()))?;

    info!(
        "COPY {}/{} -> {}/{}",
        source_bucket, source_key, bucket, key
    );

    let (data, source_info) = state.store.get_object(source_bucket, source_key).await?;

    let opts = PutOptions {
        content_type: source_info.content_type.clone(),
        cache_control: source_info.cache_control.clone(),
        content_disposition: source_info.content_disposition.clone(),
        user_metadata: source_info.user_metadata.clone(),
        content_md5: None,
        x_amz_content_sha256: None,
    };

    let data_len = data.len();
    let result = state.store.put_object(bucket, key, data, opts).await?;

    debug!(
        "Copied {}/{} -> {}/{} ({} bytes)",
        source_bucket, source_key, bucket, key, data_len
    );

    let copy_result = crate::api::xml::CopyObjectResult {
        etag: result.etag_quoted(),
        last_modified: result.last_modified,
    };
    let xml = copy_result.to_xml();

    Ok(xml_response(xml))
}

/// PUT object handler with copy detection and multipart upload support
/// PUT /{bucket}/{key}
/// Detects x-amz-copy-source header to dispatch to copy operation
/// Detects ?partNumber&uploadId for multipart upload part
#[instrument(skip(state, body))]
pub async fn put_object_or_copy(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    let chunked = is_aws_chunked(&headers);
    let decoded_body = if chunked {
        let expected_len = get_decoded_content_length(&headers);
        debug!(
            "Decoding AWS chunked payload: {} bytes, expected decoded: {:?}",
            body.len(),
            expected_len
        );
        match decode_aws_chunked(&body, expected_len) {
            Some(decoded) => {
                debug!(
                    "Successfully decoded AWS chunked: {} -> {} bytes",
                    body.len(),
                    decoded.len()
                );
                decoded
            }
            None => {
                warn!(
                    "Failed to decode AWS chunked payload, using raw body ({} bytes)",
                    body.len()
                );
                body
            }
        }
    } else {
        body
    };

    // Check if this is a multipart upload part
    if let (Some(part_num), Some(upload_id)) = (&query.part_number, &query.upload_id) {
        info!(
            "UploadPart {}/{} part={} uploadId={}",
            bucket, key, part_num, upload_id
        );

        let etag = state
            .store
            .upload_part(&bucket, upload_id, &key, *part_num, decoded_body, chunked)
            .await?;
        return Ok((StatusCode::OK, [("ETag", etag)], "").into_response());
    }

    // Check if this is a copy operation
    if headers.contains_key("x-amz-copy-source") {
        copy_object_inner(&state, &bucket, &key, &headers).await
    } else {
        put_object_inner(&state, &bucket, &key, &headers, decoded_body).await
    }
}

/// GET object handler
/// GET /{bucket}/{key}
/// GET /{bucket}/{key}?uploadId=X - ListParts
#[instrument(skip(state))]
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
) -> Result<Response, S3Error> {
    // ListParts
    if let Some(upload_id) = &query.upload_id {
        info!("ListParts {}/{} uploadId={}", bucket, key, upload_id);
        let parts = state.store.list_parts(&bucket, upload_id).await?;
        let parts = parts
            .into_iter()
            .map(|p| crate::api::xml::PartInfo {
                part_number: p.part_number,
                etag: p.etag,
                size: p.size,
                last_modified: p.last_modified,
            })
            .collect();
        let result = ListPartsResult {
            bucket: bucket.clone(),
            key: key.clone(),
            upload_id: upload_id.clone(),
            parts,
            max_parts: 1000,
            is_truncated: false,
        };
        let xml = result.to_xml();
        return Ok(xml_response(xml));
    }

    info!("GET {}/{}", bucket, key);

    let (data, info) = state.store.get_object(&bucket, &key).await?;
    debug!("Retrieved {}/{} ({} bytes)", bucket, key, data.len());

    let headers = build_object_headers(&info);
    Ok((StatusCode::OK, headers, data).into_response())
}

/// HEAD object handler
/// HEAD /{bucket}/{key}
#[instrument(skip(state))]
pub async fn head_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
) -> Result<Response, S3Error> {
    info!("HEAD {}/{}", bucket, key);

    let info = state.store.head_object(&bucket, &key).await?;

    let headers = build_object_headers(&info);
    Ok((StatusCode::OK, headers).into_response())
}

/// DELETE object handler
/// DELETE /{bucket}/{key}
/// DELETE /{bucket}/{key}?uploadId=X - AbortMultipartUpload
#[instrument(skip(state))]
pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
) -> Result<Response, S3Error> {
    // AbortMultipartUpload
    if let Some(upload_id) = &query.upload_id {
        info!(
            "AbortMultipartUpload {}/{} uploadId={}",
            bucket, key, upload_id
        );
        state.store.abort_multipart_upload(&bucket, upload_id).await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    info!("DELETE {}/{}", bucket, key);

    state.store.delete_object(&bucket, &key).await?;

    debug!("Deleted {}/{}", bucket, key);

    Ok(StatusCode::NO_CONTENT.into_response())
}

/// DELETE multiple objects handler
/// POST /{bucket}?delete
#[instrument(skip(state, body))]
pub async fn delete_objects(
    State(state): State<Arc<AppState>>,
    ValidatedBucket(bucket): ValidatedBucket,
    Query(query): Query<BucketPostQuery>,
    body: Bytes,
) -> Result<Response, S3Error> {
    use super::body_to_utf8;

    if query.delete.is_none() {
        return Err(S3Error::InvalidRequest(
            "POST requires ?delete query parameter".to_string(),
        ));
    }

    let body_str = body_to_utf8(&body)?;

    let delete_req = DeleteRequest::from_xml(body_str).map_err(|e| {
        warn!("Failed to parse DeleteObjects XML: {}", e);
        S3Error::MalformedXML
    })?;

    info!(
        "DELETE multiple objects in {} ({} objects)",
        bucket,
        delete_req.objects.len()
    );

    let quiet = delete_req.quiet.unwrap_or(false);
    let mut deleted = Vec::new();
    let mut errors = Vec::new();

    for obj in delete_req.objects {
        let key = obj.key.trim_start_matches('/');
        match state.store.delete_object(&bucket, key).await {
            Ok(()) => {
                debug!("Deleted {}/{}", bucket, key);
                deleted.push(DeletedObject {
                    key: obj.key.clone(),
                    version_id: obj.version_id.clone(),
                });
            }
            Err(e) => {
                let s3_err = S3Error::from(e);
                warn!("Failed to delete {}/{}: {}", bucket, key, s3_err);
                errors.push(DeleteError {
                    key: obj.key.clone(),
                    version_id: obj.version_id.clone(),
                    code: s3_err.code().to_string(),
                    message: s3_err.to_string(),
                });
            }
        }
    }

    let result = DeleteResult { deleted, errors };
    let xml = result.to_xml(quiet);

    Ok(xml_response(xml))
}
