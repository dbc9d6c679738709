//! Bucket-level S3 handlers: CREATE, DELETE, HEAD, LIST, and sub-operations
//! (GetBucketLocation, GetBucketVersioning, ListMultipartUploads).

use super::{xml_response, AppState, S3Error};
use crate::api::extractors::ValidatedBucket;
use crate::api::xml::{
    BucketInfo, ListBucketResult, ListBucketsResult, ListMultipartUploadsResult, S3Object,
    UploadInfo,
};
use crate::types::ListingState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument};

/// Query parameters for bucket-level GET operations
#[derive(Debug, serde::Deserialize, Default)]
pub struct BucketGetQuery {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "list-type")]
    pub list_type: Option<u8>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<u32>,
    /// v2 pagination
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
    /// v1 pagination
    pub marker: Option<String>,
    /// start-after (v2)
    #[serde(rename = "start-after")]
    pub start_after: Option<String>,
    /// Encoding type for keys/prefixes in the response (e.g. "url")
    #[serde(rename = "encoding-type")]
    pub encoding_type: Option<String>,
    /// GetBucketLocation query parameter
    pub location: Option<String>,
    /// GetBucketVersioning query parameter
    pub versioning: Option<String>,
    /// ListMultipartUploads query parameter
    pub uploads: Option<String>,
}

/// Bucket-level GET handler - dispatches to appropriate operation based on query params
/// GET /{bucket}?list-type=2&prefix=  -> ListObjectsV2
/// GET /{bucket}?location            -> GetBucketLocation
/// GET /{bucket}?versioning          -> GetBucketVersioning
/// GET /{bucket}?uploads             -> ListMultipartUploads
#[instrument(skip(state))]
pub async fn bucket_get_handler(
    State(state): State<Arc<AppState>>,
    ValidatedBucket(bucket): ValidatedBucket,
    Query(query): Query<BucketGetQuery>,
) -> Result<Response, S3Error> {
    if query.location.is_some() {
        info!("GET bucket location: {}", bucket);
        return get_bucket_location(&bucket).await;
    }

    if query.versioning.is_some() {
        info!("GET bucket versioning: {}", bucket);
        return get_bucket_versioning(&bucket).await;
    }

    if query.uploads.is_some() {
        info!("LIST multipart uploads: {}", bucket);
        let prefix = query.prefix.as_deref();
        return list_multipart_uploads(&state, &bucket, prefix).await;
    }

    let is_v2 = query.list_type == Some(2);
    let prefix = query.prefix.clone().unwrap_or_default();
    let delimiter = query.delimiter.as_ref().and_then(|d| d.chars().next());
    let max_keys = query.max_keys.unwrap_or(1000) as usize;

    info!(
        "LIST {}/{}* (v{})",
        bucket,
        prefix,
        if is_v2 { "2" } else { "1" }
    );

    let page: ListingState = if is_v2 {
        state
            .store
            .list_objects_v2(
                &bucket,
                &prefix,
                query.continuation_token.clone(),
                query.start_after.clone(),
                delimiter,
                max_keys,
            )
            .await?
    } else {
        state
            .store
            .list_objects_v1(&bucket, &prefix, query.marker.clone(), delimiter, max_keys)
            .await?
    };

    let s3_objects: Vec<S3Object> = page
        .objects
        .into_iter()
        .map(|info| S3Object::new(info.key, info.size, info.last_modified, info.etag_quoted()))
        .collect();
    let common_prefixes: Vec<String> = page.common_prefixes.into_iter().collect();

    let xml = if is_v2 {
        ListBucketResult::new_v2(
            bucket,
            prefix,
            query.delimiter,
            max_keys as u32,
            s3_objects,
            common_prefixes,
            query.continuation_token,
            page.next_vid_marker,
            page.is_truncated,
        )
        .to_xml()
    } else {
        ListBucketResult::new_v1(
            bucket,
            prefix,
            query.delimiter,
            max_keys as u32,
            s3_objects,
            common_prefixes,
            query.marker,
            page.next_marker,
            page.is_truncated,
            query.encoding_type,
        )
        .to_xml()
    };

    Ok(xml_response(xml))
}

/// GetBucketLocation handler
/// GET /{bucket}?location
async fn get_bucket_location(_bucket: &str) -> Result<Response, S3Error> {
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<LocationConstraint xmlns="http://s3.amazonaws.com/doc/2006-03-01/">us-east-1</LocationConstraint>"#;
    Ok(xml_response(xml))
}

/// GetBucketVersioning handler
/// GET /{bucket}?versioning
async fn get_bucket_versioning(_bucket: &str) -> Result<Response, S3Error> {
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<VersioningConfiguration xmlns="http://s3.amazonaws.com/doc/2006-03-01/"/>"#;
    Ok(xml_response(xml))
}

/// ListMultipartUploads handler
/// GET /{bucket}?uploads
async fn list_multipart_uploads(
    state: &Arc<AppState>,
    bucket: &str,
    prefix: Option<&str>,
) -> Result<Response, S3Error> {
    let all = state.store.list_multipart_uploads(bucket).await?;
    let prefix = prefix.unwrap_or("");
    // The underlying store keeps only (key, upload_id) pairs, not the
    // initiation time, so `initiated` is stamped at list time rather than
    // recovered from the upload's actual creation.
    let uploads: Vec<UploadInfo> = all
        .into_iter()
        .filter(|(key, _)| key.starts_with(prefix))
        .map(|(key, upload_id)| UploadInfo {
            key,
            upload_id,
            initiated: Utc::now(),
        })
        .collect();

    let result = ListMultipartUploadsResult {
        bucket: bucket.to_string(),
        uploads,
        prefix: prefix.to_string(),
        max_uploads: 1000,
        is_truncated: false,
    };
    Ok(xml_response(result.to_xml()))
}

/// CREATE bucket handler
/// PUT /{bucket}
#[instrument(skip(state))]
pub async fn create_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Result<Response, S3Error> {
    info!("CREATE bucket {}", bucket);

    if bucket.is_empty() {
        return Err(S3Error::InvalidArgument(
            "Bucket name cannot be empty".to_string(),
        ));
    }

    state
        .store
        .create_bucket(&bucket, state.owner.clone())
        .await?;

    Ok((StatusCode::OK, [("Location", format!("/{}", bucket))], "").into_response())
}

/// DELETE bucket handler
/// DELETE /{bucket}
#[instrument(skip(state))]
pub async fn delete_bucket(
    State(state): State<Arc<AppState>>,
    ValidatedBucket(bucket): ValidatedBucket,
) -> Result<Response, S3Error> {
    info!("DELETE bucket {}", bucket);

    state.store.delete_bucket(&bucket).await?;

    Ok(StatusCode::NO_CONTENT.into_response())
}

/// HEAD bucket handler
/// HEAD /{bucket}
#[instrument(skip(state))]
pub async fn head_bucket(
    State(state): State<Arc<AppState>>,
    ValidatedBucket(bucket): ValidatedBucket,
) -> Result<Response, S3Error> {
    info!("HEAD bucket {}", bucket);

    state.store.head_bucket(&bucket).await?;

    Ok((StatusCode::OK, [("x-amz-bucket-region", "us-east-1")]).into_response())
}

/// LIST buckets handler
/// GET /
#[instrument(skip(state))]
pub async fn list_buckets(State(state): State<Arc<AppState>>) -> Result<Response, S3Error> {
    info!("LIST buckets");

    let bucket_list = state.store.list_buckets_for(&state.owner.id);

    let result = ListBucketsResult {
        owner_id: state.owner.id.clone(),
        owner_display_name: state.owner.display_name.clone(),
        buckets: bucket_list
            .into_iter()
            .map(|name| BucketInfo {
                name,
                creation_date: Utc::now(),
            })
            .collect(),
    };
    let xml = result.to_xml();

    Ok(xml_response(xml))
}
