use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use common::storage::ContentHash;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use tokio_util::io::ReaderStream;
use tracing::instrument;

use crate::entity::receipt;
use crate::error::{AppError, ErrorBody};
use crate::state::AppState;
use crate::utils::filename::{PDF_MIME, content_disposition_value};
use crate::utils::jwt;

/// A read URL for a stored blob and the moment it stops working.
pub struct DownloadUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Mint a read URL valid for `ttl_secs`. Object stores presign natively; the filesystem
/// backend falls back to a signed token served by [`download_file`].
pub async fn mint_download_url(
    state: &AppState,
    hash: &ContentHash,
    ttl_secs: u64,
) -> Result<DownloadUrl, AppError> {
    let ttl_secs = ttl_secs.max(1);
    let expires_at = Utc::now() + chrono::Duration::seconds(ttl_secs as i64);

    if let Some(url) = state
        .blob_store
        .presigned_get_url(hash, Duration::from_secs(ttl_secs))
        .await?
    {
        return Ok(DownloadUrl { url, expires_at });
    }

    let token = jwt::sign_file_token(
        hash,
        &state.config.storage.download_url_secret,
        chrono::Duration::seconds(ttl_secs as i64),
    )
    .map_err(|e| AppError::Internal(format!("Failed to sign file token: {e}")))?;

    let url = format!(
        "{}/api/v1/files/{}",
        state.config.server.public_base_url.trim_end_matches('/'),
        token
    );
    Ok(DownloadUrl { url, expires_at })
}

#[utoipa::path(
    get,
    path = "/{token}",
    tag = "Files",
    operation_id = "downloadFile",
    summary = "Fetch a stored receipt PDF by signed token",
    description = "Serves the PDF named by a download token minted by `GET /receipts/{id}/download-url` \
        or handed to the extraction pipeline. The token is the only credential; it expires after \
        the configured lifetime. Supports `If-None-Match`.",
    params(("token" = String, Path, description = "Signed download token")),
    responses(
        (status = 200, description = "PDF content", content_type = "application/pdf"),
        (status = 304, description = "Not Modified (ETag match)"),
        (status = 401, description = "Invalid or expired token (TOKEN_INVALID)", body = ErrorBody),
        (status = 404, description = "File no longer exists (NOT_FOUND)", body = ErrorBody),
    ),
)]
#[instrument(skip(state, headers, token))]
pub async fn download_file(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let hash = jwt::verify_file_token(&token, &state.config.storage.download_url_secret)
        .map_err(|_| AppError::TokenInvalid)?;

    // Any receipt still referencing the blob supplies name and size for the headers.
    let receipt = receipt::Entity::find()
        .filter(receipt::Column::FileHash.eq(hash.to_hex()))
        .one(&state.db)
        .await?
        .ok_or_else(|| AppError::NotFound("File not found".into()))?;

    build_blob_response(&state, &hash, &receipt, &headers).await
}

async fn build_blob_response(
    state: &AppState,
    hash: &ContentHash,
    receipt: &receipt::Model,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let etag_value = format!("\"{}\"", hash.to_hex());
    if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH)
        && let Ok(val) = if_none_match.to_str()
        && (val == etag_value || val == "*")
    {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    let reader = state.blob_store.get_stream(hash).await?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let content_type = if receipt.mime_type.is_empty() {
        PDF_MIME
    } else {
        receipt.mime_type.as_str()
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, receipt.size.to_string())
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition_value(&receipt.file_name),
        )
        .header(header::ETAG, &etag_value)
        .header(header::CACHE_CONTROL, "private, max-age=300")
        .body(body)
        .map_err(|e| AppError::Internal(format!("Failed to build response: {e}")))?;

    Ok(response)
}
