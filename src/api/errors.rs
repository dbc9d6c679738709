//! S3 error types and their XML responses (`S3ErrorMap`, §6/§7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum S3Error {
    #[error("NoSuchKey: The specified key does not exist.")]
    NoSuchKey(String),
    #[error("NoSuchBucket: The specified bucket does not exist.")]
    NoSuchBucket(String),
    #[error("NoSuchUpload: The specified multipart upload does not exist.")]
    NoSuchUpload(String),
    #[error("BucketNotEmpty: The bucket you tried to delete is not empty.")]
    BucketNotEmpty(String),
    #[error("BucketAlreadyExists: The requested bucket name is not available.")]
    BucketAlreadyExists(String),
    #[error("BucketAlreadyOwnedByYou: Your previous request to create the named bucket succeeded and you already own it.")]
    BucketAlreadyOwnedByYou(String),
    #[error("InvalidBucketName: The specified bucket is not valid.")]
    InvalidBucketName(String),
    #[error("AccessDenied: Access Denied.")]
    AccessDenied,
    #[error("SignatureDoesNotMatch: The request signature we calculated does not match the signature you provided.")]
    SignatureDoesNotMatch,
    #[error("InvalidAccessKeyId: The AWS access key Id you provided does not exist in our records.")]
    InvalidAccessKeyId(String),
    #[error("BadDigest: The Content-MD5 or checksum you specified did not match what we received.")]
    BadDigest,
    #[error("XAmzContentSHA256Mismatch: The provided 'x-amz-content-sha256' header does not match what was computed.")]
    XAmzContentSha256Mismatch,
    #[error("PreconditionFailed: At least one of the pre-conditions you specified did not hold.")]
    PreconditionFailed,
    #[error("NotModified: Not Modified")]
    NotModified,
    #[error("InvalidRange: The requested range cannot be satisfied.")]
    InvalidRange,
    #[error("EntityTooLarge: Your proposed upload exceeds the maximum allowed size.")]
    EntityTooLarge { size: u64, max: u64 },
    #[error("MissingContentLength: You must provide the Content-Length HTTP header.")]
    MissingContentLength,
    #[error("IncompleteBody: The request body terminated unexpectedly.")]
    IncompleteBody,
    #[error("InvalidPart: One or more of the specified parts could not be found.")]
    InvalidPart(String),
    #[error("InvalidPartOrder: The list of parts was not in ascending order.")]
    InvalidPartOrder,
    #[error("ObjectExistInObjectPath: An intermediate path segment already exists as an object.")]
    ObjectExistInObjectPath(String),
    #[error("ObjectExistAsDir: The target key already exists as a directory.")]
    ObjectExistAsDir(String),
    #[error("InternalError: We encountered an internal error. Please try again.")]
    InternalError(String),
    #[error("NotImplemented: A header you provided implies functionality that is not implemented.")]
    NotImplemented(String),
    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),
    #[error("InvalidRequest: {0}")]
    InvalidRequest(String),
    #[error("MalformedXML: The XML you provided was not well-formed.")]
    MalformedXML,
}

impl S3Error {
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchKey(_) => "NoSuchKey",
            S3Error::NoSuchBucket(_) => "NoSuchBucket",
            S3Error::NoSuchUpload(_) => "NoSuchUpload",
            S3Error::BucketNotEmpty(_) => "BucketNotEmpty",
            S3Error::BucketAlreadyExists(_) => "BucketAlreadyExists",
            S3Error::BucketAlreadyOwnedByYou(_) => "BucketAlreadyOwnedByYou",
            S3Error::InvalidBucketName(_) => "InvalidBucketName",
            S3Error::AccessDenied => "AccessDenied",
            S3Error::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            S3Error::InvalidAccessKeyId(_) => "InvalidAccessKeyId",
            S3Error::BadDigest => "BadDigest",
            S3Error::XAmzContentSha256Mismatch => "XAmzContentSHA256Mismatch",
            S3Error::PreconditionFailed => "PreconditionFailed",
            S3Error::NotModified => "NotModified",
            S3Error::InvalidRange => "InvalidRange",
            S3Error::EntityTooLarge { .. } => "EntityTooLarge",
            S3Error::MissingContentLength => "MissingContentLength",
            S3Error::IncompleteBody => "IncompleteBody",
            S3Error::InvalidPart(_) => "InvalidPart",
            S3Error::InvalidPartOrder => "InvalidPartOrder",
            S3Error::ObjectExistInObjectPath(_) => "ObjectExistInObjectPath",
            S3Error::ObjectExistAsDir(_) => "ObjectExistAsDir",
            S3Error::InternalError(_) => "InternalError",
            S3Error::NotImplemented(_) => "NotImplemented",
            S3Error::InvalidArgument(_) => "InvalidArgument",
            S3Error::InvalidRequest(_) => "InvalidRequest",
            S3Error::MalformedXML => "MalformedXML",
        }
    }

    /// Per `S3ErrorMap` (§6).
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::NoSuchKey(_) => StatusCode::NOT_FOUND,
            S3Error::NoSuchBucket(_) => StatusCode::NOT_FOUND,
            S3Error::NoSuchUpload(_) => StatusCode::NOT_FOUND,
            S3Error::BucketNotEmpty(_) => StatusCode::CONFLICT,
            S3Error::BucketAlreadyExists(_) => StatusCode::CONFLICT,
            S3Error::BucketAlreadyOwnedByYou(_) => StatusCode::CONFLICT,
            S3Error::InvalidBucketName(_) => StatusCode::BAD_REQUEST,
            S3Error::AccessDenied => StatusCode::FORBIDDEN,
            S3Error::SignatureDoesNotMatch => StatusCode::FORBIDDEN,
            S3Error::InvalidAccessKeyId(_) => StatusCode::FORBIDDEN,
            S3Error::BadDigest => StatusCode::BAD_REQUEST,
            S3Error::XAmzContentSha256Mismatch => StatusCode::BAD_REQUEST,
            S3Error::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            S3Error::NotModified => StatusCode::NOT_MODIFIED,
            S3Error::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            S3Error::EntityTooLarge { .. } => StatusCode::BAD_REQUEST,
            S3Error::MissingContentLength => StatusCode::LENGTH_REQUIRED,
            S3Error::IncompleteBody => StatusCode::BAD_REQUEST,
            S3Error::InvalidPart(_) => StatusCode::BAD_REQUEST,
            S3Error::InvalidPartOrder => StatusCode::BAD_REQUEST,
            S3Error::ObjectExistInObjectPath(_) => StatusCode::CONFLICT,
            S3Error::ObjectExistAsDir(_) => StatusCode::CONFLICT,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            S3Error::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            S3Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            S3Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            S3Error::MalformedXML => StatusCode::BAD_REQUEST,
        }
    }

    pub fn to_xml(&self) -> String {
        let resource = match self {
            S3Error::NoSuchKey(key) => key.clone(),
            S3Error::NoSuchBucket(bucket) => bucket.clone(),
            S3Error::NoSuchUpload(id) => id.clone(),
            _ => String::new(),
        };

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
    <Code>{}</Code>
    <Message>{}</Message>
    <Resource>{}</Resource>
    <RequestId>00000000-0000-0000-0000-000000000000</RequestId>
</Error>"#,
            self.code(),
            self,
            resource
        )
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.to_xml();
        (status, [("Content-Type", "application/xml")], body).into_response()
    }
}

impl From<crate::object_store::ObjectStoreError> for S3Error {
    fn from(err: crate::object_store::ObjectStoreError) -> Self {
        use crate::object_store::ObjectStoreError as E;
        match err {
            E::NoSuchKey(key) => S3Error::NoSuchKey(key),
            E::NoSuchBucket(bucket) => S3Error::NoSuchBucket(bucket),
            E::NoSuchUpload(id) => S3Error::NoSuchUpload(id),
            E::BucketNotEmpty(bucket) => S3Error::BucketNotEmpty(bucket),
            E::BucketAlreadyExists(bucket) => S3Error::BucketAlreadyExists(bucket),
            E::InvalidBucketName(name) => S3Error::InvalidBucketName(name),
            E::BadDigest => S3Error::BadDigest,
            E::Sha256Mismatch => S3Error::XAmzContentSha256Mismatch,
            E::TooLarge { size, max } => S3Error::EntityTooLarge { size, max },
            E::ObjectExistInObjectPath(p) => S3Error::ObjectExistInObjectPath(p),
            E::ObjectExistAsDir(p) => S3Error::ObjectExistAsDir(p),
            E::InvalidPart(p) => S3Error::InvalidPart(p),
            E::InvalidPartOrder => S3Error::InvalidPartOrder,
            E::InvalidRequest(msg) => S3Error::InvalidRequest(msg),
            E::Io(e) => S3Error::InternalError(e.to_string()),
            E::Other(msg) => S3Error::InternalError(msg),
        }
    }
}
