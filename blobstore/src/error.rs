use std::io;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use oci_spec::distribution::{ErrorCode, ErrorInfo, ErrorInfoBuilder, ErrorResponseBuilder};
use serde_json::json;
use thiserror::Error;

use crate::storage::driver::DriverError;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Blob unknown: {0}")]
    BlobUnknown(String), // Contains the digest

    #[error("Blob upload unknown: {0}")]
    BlobUploadUnknown(String), // Contains the upload id

    #[error("Blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    #[error("Blob digest mismatch: expected {expected}, computed {actual}")]
    BlobInvalidDigest { expected: String, actual: String },

    #[error("Blob length mismatch: expected {expected}, written {actual}")]
    BlobInvalidLength { expected: u64, actual: u64 },

    #[error("Digest invalid: {0}")]
    DigestInvalid(String),

    #[error("Invalid repository name: {0}")]
    NameInvalid(String),

    #[error("Invalid path parameters: {0}")]
    InvalidPath(String),

    #[error("Invalid timestamp {value:?} in {path}: {source}")]
    TimestampInvalid {
        path: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("The operation is unsupported")]
    Unsupported,

    #[error("storage driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// True for the conditions a protocol handler reports as "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::BlobUnknown(_) | StorageError::BlobUploadUnknown(_)
        )
    }
}

impl IntoResponse for StorageError {
    fn into_response(self) -> Response {
        tracing::error!("Generating response for StorageError: {:?}", self);

        let (status_code, code, message, detail) = match &self {
            Self::BlobUnknown(digest) => (
                StatusCode::NOT_FOUND,
                ErrorCode::BlobUnknown,
                "blob unknown".to_string(),
                json!({ "digest": digest }),
            ),
            Self::BlobUploadUnknown(id) => (
                StatusCode::NOT_FOUND,
                ErrorCode::BlobUploadUnknown,
                "blob upload unknown".to_string(),
                json!({ "session_id": id }),
            ),
            Self::BlobUploadInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorCode::BlobUploadInvalid,
                msg.clone(),
                json!({}),
            ),
            Self::BlobInvalidDigest { expected, actual } => (
                StatusCode::BAD_REQUEST,
                ErrorCode::DigestInvalid,
                "provided digest did not match uploaded content".to_string(),
                json!({ "expected": expected, "actual": actual }),
            ),
            Self::BlobInvalidLength { expected, actual } => (
                StatusCode::BAD_REQUEST,
                ErrorCode::SizeInvalid,
                "provided length did not match content length".to_string(),
                json!({ "expected": expected, "actual": actual }),
            ),
            Self::DigestInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorCode::DigestInvalid,
                msg.clone(),
                json!({}),
            ),
            Self::NameInvalid(name) => (
                StatusCode::BAD_REQUEST,
                ErrorCode::NameInvalid,
                "invalid repository name".to_string(),
                json!({ "name": name }),
            ),
            Self::Unsupported => (
                StatusCode::METHOD_NOT_ALLOWED,
                ErrorCode::Unsupported,
                "operation is unsupported".to_string(),
                json!({}),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::Unsupported,
                "an internal server error occurred".to_string(),
                json!({}),
            ),
        };

        let body = oci_error(code, message, detail)
            .and_then(|info| ErrorResponseBuilder::default().errors(vec![info]).build().ok());
        match body {
            Some(body) => (status_code, Json(body)).into_response(),
            None => status_code.into_response(),
        }
    }
}

fn oci_error(code: ErrorCode, message: String, detail: serde_json::Value) -> Option<ErrorInfo> {
    ErrorInfoBuilder::default()
        .code(code)
        .message(message)
        .detail(serde_json::to_string_pretty(&detail).ok()?)
        .build()
        .ok()
}
