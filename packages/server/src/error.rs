use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use common::storage::StorageError;
use sea_orm::DbErr;
use serde::Serialize;

/// Structured error response returned by all endpoints on failure.
#[derive(Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    /// Machine-readable error code. One of: `VALIDATION_ERROR`, `TOKEN_MISSING`,
    /// `TOKEN_INVALID`, `INVALID_FILE_TYPE`, `UPLOAD_FAILED`, `SCAN_LIMIT_REACHED`,
    /// `NOT_AUTHORIZED`, `NOT_FOUND`, `CONFLICT`, `INTERNAL_ERROR`.
    #[schema(example = "INVALID_FILE_TYPE")]
    pub code: &'static str,
    /// Human-readable error description.
    #[schema(example = "Only PDF files are accepted")]
    pub message: String,
}

/// Application-level error type.
#[derive(Debug)]
pub enum AppError {
    Validation(String),
    TokenMissing,
    TokenInvalid,
    /// Upload is neither declared as `application/pdf` nor named `*.pdf`.
    InvalidFileType,
    /// Storage or dispatch failed while accepting an upload. Detail is logged only.
    UploadFailed(String),
    /// The owner's plan does not allow another scan.
    ScanLimitReached,
    /// Record exists but belongs to someone else.
    NotAuthorized,
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl AppError {
    fn status_and_body(self) -> (StatusCode, ErrorBody) {
        match self {
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    code: "VALIDATION_ERROR",
                    message: msg,
                },
            ),
            AppError::TokenMissing => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    code: "TOKEN_MISSING",
                    message: "Authentication required".into(),
                },
            ),
            AppError::TokenInvalid => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    code: "TOKEN_INVALID",
                    message: "Invalid or expired token".into(),
                },
            ),
            AppError::InvalidFileType => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    code: "INVALID_FILE_TYPE",
                    message: "Only PDF files are accepted".into(),
                },
            ),
            AppError::UploadFailed(detail) => {
                tracing::error!("Upload failed: {}", detail);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorBody {
                        code: "UPLOAD_FAILED",
                        message: "The receipt could not be stored, please try again".into(),
                    },
                )
            }
            AppError::ScanLimitReached => (
                StatusCode::FORBIDDEN,
                ErrorBody {
                    code: "SCAN_LIMIT_REACHED",
                    message: "Scan limit reached for the current plan".into(),
                },
            ),
            AppError::NotAuthorized => (
                StatusCode::FORBIDDEN,
                ErrorBody {
                    code: "NOT_AUTHORIZED",
                    message: "Not authorized to access this receipt".into(),
                },
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    code: "NOT_FOUND",
                    message: msg,
                },
            ),
            AppError::Conflict(msg) => (
                StatusCode::CONFLICT,
                ErrorBody {
                    code: "CONFLICT",
                    message: msg,
                },
            ),
            AppError::Internal(detail) => {
                tracing::error!("Internal error: {}", detail);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        code: "INTERNAL_ERROR",
                        message: "An unexpected error occurred".into(),
                    },
                )
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        (status, Json(body)).into_response()
    }
}

impl From<DbErr> for AppError {
    fn from(err: DbErr) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(hash) => {
                tracing::warn!(hash = %hash, "Blob referenced by a receipt is missing");
                AppError::NotFound("Receipt file not found".into())
            }
            StorageError::SizeLimitExceeded { limit, .. } => {
                AppError::Validation(format!("File exceeds maximum size of {limit} bytes"))
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}
