use std::path::PathBuf;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use common::ExtractionRequested;
use common::storage::{BlobStore, BoxReader, ContentHash, StorageError};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::file::mint_download_url;
use crate::entitlements::{FEATURE_SCANS, FEATURE_SUMMARY};
use crate::entity::receipt;
use crate::error::{AppError, ErrorBody};
use crate::extractors::auth::AuthUser;
use crate::extractors::query::AppQuery;
use crate::models::receipt::{
    CancelResponse, DownloadUrlResponse, ReceiptListItem, ReceiptListQuery, ReceiptListResponse,
    ReceiptResponse, UploadReceiptResponse,
};
use crate::models::shared::{Pagination, page_bounds};
use crate::state::AppState;
use crate::store::{self, NewReceipt};
use crate::utils::filename::{PDF_MIME, is_pdf_upload, sanitize_upload_name};

/// Multipart overhead allowance on top of the blob size cap.
const MULTIPART_SLACK: u64 = 64 * 1024;

pub fn upload_body_limit(max_blob_size: u64) -> DefaultBodyLimit {
    let limit = max_blob_size.saturating_add(MULTIPART_SLACK);
    DefaultBodyLimit::max(usize::try_from(limit).unwrap_or(usize::MAX))
}

/// A PDF accepted into blob storage but not yet recorded.
struct StoredUpload {
    hash: ContentHash,
    size: i64,
    file_name: String,
    mime_type: String,
    staged: StagedFile,
}

/// Local copy of an upload, removed when dropped.
struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    fn new() -> Self {
        Self {
            path: std::env::temp_dir().join(format!("receipt-upload-{}", Uuid::new_v4())),
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        // Best effort.
        let _ = std::fs::remove_file(&self.path);
    }
}

#[utoipa::path(
    post,
    path = "/",
    tag = "Receipts",
    operation_id = "uploadReceipt",
    summary = "Upload a receipt PDF",
    description = "Stores the PDF in the `file` multipart field, creates a `pending` receipt and \
        starts extraction in the background. Poll `GET /receipts/{id}` until the status is \
        `processed` or `error`. Files are accepted when declared as `application/pdf` or named `*.pdf`.",
    request_body(content_type = "multipart/form-data", description = "PDF upload in the `file` field"),
    responses(
        (status = 201, description = "Receipt created", body = UploadReceiptResponse),
        (status = 400, description = "Not a PDF or bad request (INVALID_FILE_TYPE, VALIDATION_ERROR)", body = ErrorBody),
        (status = 401, description = "Unauthorized (TOKEN_MISSING, TOKEN_INVALID)", body = ErrorBody),
        (status = 403, description = "Plan does not allow more scans (SCAN_LIMIT_REACHED)", body = ErrorBody),
        (status = 502, description = "Storage or dispatch failed (UPLOAD_FAILED)", body = ErrorBody),
    ),
    security(("jwt" = [])),
)]
#[instrument(skip(state, auth_user, multipart), fields(owner_id = %auth_user.owner_id, receipt_id))]
pub async fn upload_receipt(
    auth_user: AuthUser,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let upload = receive_upload(&state, &auth_user.owner_id, &mut multipart).await?;

    let recorded = match store::record_upload(
        &state.db,
        &*state.blob_store,
        NewReceipt {
            owner_id: auth_user.owner_id.clone(),
            file_hash: upload.hash,
            file_name: upload.file_name.clone(),
            size: upload.size,
            mime_type: upload.mime_type.clone(),
        },
    )
    .await
    {
        Ok(recorded) => recorded,
        Err(e) => {
            discard_blob(&state, &upload.hash).await;
            return Err(AppError::UploadFailed(format!("Failed to record receipt: {e:?}")));
        }
    };
    let created = recorded.receipt;
    tracing::Span::current().record("receipt_id", tracing::field::display(created.id));

    if recorded.blob_missing {
        warn!(hash = %upload.hash, "Stored file was released concurrently, storing it again");
        if let Err(e) = restore_blob(&*state.blob_store, &upload).await {
            store::delete_by_id(&state.db, created.id).await;
            return Err(e);
        }
    }

    if let Err(e) = start_extraction(&state, &created).await {
        store::delete_by_id(&state.db, created.id).await;
        discard_blob(&state, &upload.hash).await;
        return Err(AppError::UploadFailed(e));
    }

    info!(size = upload.size, "Receipt uploaded");

    Ok((
        StatusCode::CREATED,
        Json(UploadReceiptResponse {
            receipt_id: created.id.to_string(),
            file_name: upload.file_name,
        }),
    ))
}

/// Read the multipart body into storage. A blob stored before a later part fails is
/// released again.
async fn receive_upload(
    state: &AppState,
    owner_id: &str,
    multipart: &mut Multipart,
) -> Result<StoredUpload, AppError> {
    let mut upload: Option<StoredUpload> = None;
    let result = read_file_field(state, owner_id, multipart, &mut upload).await;

    match (result, upload) {
        (Ok(()), Some(upload)) => Ok(upload),
        (Ok(()), None) => Err(AppError::Validation("Missing 'file' field".into())),
        (Err(e), Some(upload)) => {
            discard_blob(state, &upload.hash).await;
            Err(e)
        }
        (Err(e), None) => Err(e),
    }
}

async fn read_file_field(
    state: &AppState,
    owner_id: &str,
    multipart: &mut Multipart,
    upload: &mut Option<StoredUpload>,
) -> Result<(), AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Multipart error: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        if upload.is_some() {
            return Err(AppError::Validation("Only one 'file' field is allowed".into()));
        }

        let declared_type = field.content_type().map(str::to_owned);
        let raw_name = field.file_name().map(str::to_owned);

        if !is_pdf_upload(declared_type.as_deref(), raw_name.as_deref()) {
            return Err(AppError::InvalidFileType);
        }

        let raw_name = raw_name
            .ok_or_else(|| AppError::Validation("File field must have a filename".into()))?;
        let file_name =
            sanitize_upload_name(&raw_name).map_err(|e| AppError::Validation(e.message().into()))?;

        ensure_scan_allowed(state, owner_id).await?;

        let (hash, size, staged) = stream_field_to_store(
            field,
            &*state.blob_store,
            state.config.storage.max_blob_size,
        )
        .await?;

        *upload = Some(StoredUpload {
            hash,
            size,
            mime_type: upload_mime_type(declared_type.as_deref(), &file_name),
            file_name,
            staged,
        });
    }
    Ok(())
}

/// Store the staged copy again after a concurrent release removed the blob.
async fn restore_blob(blob_store: &dyn BlobStore, upload: &StoredUpload) -> Result<(), AppError> {
    let file = tokio::fs::File::open(&upload.staged.path)
        .await
        .map_err(|e| AppError::UploadFailed(format!("Failed to reopen staged upload: {e}")))?;
    let reader: BoxReader = Box::new(file);
    let hash = blob_store
        .put_stream(reader)
        .await
        .map_err(|e| AppError::UploadFailed(e.to_string()))?;

    if hash != upload.hash {
        return Err(AppError::UploadFailed(format!(
            "Staged upload changed: expected {}, got {hash}",
            upload.hash
        )));
    }
    Ok(())
}

async fn ensure_scan_allowed(state: &AppState, owner_id: &str) -> Result<(), AppError> {
    match state.entitlements.check(owner_id, FEATURE_SCANS).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(AppError::ScanLimitReached),
        Err(e) => {
            // Entitlement outages must not block uploads.
            warn!(error = %e, "Scan entitlement check failed, allowing upload");
            Ok(())
        }
    }
}

fn upload_mime_type(declared: Option<&str>, file_name: &str) -> String {
    let declared_pdf = declared
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|ct| ct.trim().eq_ignore_ascii_case(PDF_MIME));
    if declared_pdf {
        return PDF_MIME.to_string();
    }
    mime_guess::from_path(file_name)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| PDF_MIME.to_string())
}

async fn start_extraction(state: &AppState, created: &receipt::Model) -> Result<(), String> {
    let hash = ContentHash::from_hex(&created.file_hash).map_err(|e| e.to_string())?;
    let download = mint_download_url(state, &hash, state.config.extraction_url_ttl_secs())
        .await
        .map_err(|e| format!("Failed to mint download URL: {e:?}"))?;

    state
        .dispatcher
        .dispatch(ExtractionRequested {
            url: download.url,
            receipt_id: created.id.to_string(),
        })
        .await
        .map_err(|e| format!("Failed to dispatch extraction: {e}"))
}

async fn discard_blob(state: &AppState, hash: &ContentHash) {
    if let Err(e) = store::release_blob(&state.db, &*state.blob_store, hash).await {
        warn!(hash = %hash, error = ?e, "Failed to remove orphaned upload");
    }
}

#[utoipa::path(
    get,
    path = "/",
    tag = "Receipts",
    operation_id = "listReceipts",
    summary = "List the caller's receipts",
    description = "Returns the caller's receipts, newest first. Filter by `status` to find \
        receipts still being processed.",
    params(ReceiptListQuery),
    responses(
        (status = 200, description = "Paginated receipt list", body = ReceiptListResponse),
        (status = 400, description = "Invalid query (VALIDATION_ERROR)", body = ErrorBody),
        (status = 401, description = "Unauthorized (TOKEN_MISSING, TOKEN_INVALID)", body = ErrorBody),
    ),
    security(("jwt" = [])),
)]
#[instrument(skip(state, auth_user, query), fields(owner_id = %auth_user.owner_id))]
pub async fn list_receipts(
    auth_user: AuthUser,
    State(state): State<AppState>,
    AppQuery(query): AppQuery<ReceiptListQuery>,
) -> Result<Json<ReceiptListResponse>, AppError> {
    let (page, per_page) = page_bounds(query.page, query.per_page);

    let (rows, total) =
        store::list_by_owner(&state.db, &auth_user.owner_id, query.status, page, per_page).await?;

    Ok(Json(ReceiptListResponse {
        data: rows.into_iter().map(ReceiptListItem::from).collect(),
        pagination: Pagination::new(page, per_page, total),
    }))
}

#[utoipa::path(
    get,
    path = "/{id}",
    tag = "Receipts",
    operation_id = "getReceipt",
    summary = "Get a receipt",
    description = "Returns the receipt with its extracted fields. `receiptSummary` is only \
        included when the caller's plan has the summary feature.",
    params(("id" = String, Path, description = "Receipt ID")),
    responses(
        (status = 200, description = "Receipt", body = ReceiptResponse),
        (status = 401, description = "Unauthorized (TOKEN_MISSING, TOKEN_INVALID)", body = ErrorBody),
        (status = 403, description = "Owned by someone else (NOT_AUTHORIZED)", body = ErrorBody),
        (status = 404, description = "Receipt not found (NOT_FOUND)", body = ErrorBody),
    ),
    security(("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(owner_id = %auth_user.owner_id))]
pub async fn get_receipt(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ReceiptResponse>, AppError> {
    let id = store::parse_receipt_id(&id)?;
    let receipt = store::find_owned(&state.db, id, &auth_user.owner_id).await?;

    let include_summary = match state
        .entitlements
        .check(&auth_user.owner_id, FEATURE_SUMMARY)
        .await
    {
        Ok(allowed) => allowed,
        Err(e) => {
            warn!(error = %e, "Summary entitlement check failed, hiding summary");
            false
        }
    };

    Ok(Json(ReceiptResponse::new(receipt, include_summary)))
}

#[utoipa::path(
    delete,
    path = "/{id}",
    tag = "Receipts",
    operation_id = "deleteReceipt",
    summary = "Delete a receipt",
    description = "Deletes the receipt. The stored PDF is removed once no other receipt \
        references the same content. An extraction still in flight is abandoned.",
    params(("id" = String, Path, description = "Receipt ID")),
    responses(
        (status = 204, description = "Receipt deleted"),
        (status = 401, description = "Unauthorized (TOKEN_MISSING, TOKEN_INVALID)", body = ErrorBody),
        (status = 403, description = "Owned by someone else (NOT_AUTHORIZED)", body = ErrorBody),
        (status = 404, description = "Receipt not found (NOT_FOUND)", body = ErrorBody),
    ),
    security(("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(owner_id = %auth_user.owner_id))]
pub async fn delete_receipt(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = store::parse_receipt_id(&id)?;
    store::delete_owned(&state.db, &*state.blob_store, id, &auth_user.owner_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/{id}/download-url",
    tag = "Receipts",
    operation_id = "getReceiptDownloadUrl",
    summary = "Get a temporary download URL for the receipt PDF",
    params(("id" = String, Path, description = "Receipt ID")),
    responses(
        (status = 200, description = "Download URL", body = DownloadUrlResponse),
        (status = 401, description = "Unauthorized (TOKEN_MISSING, TOKEN_INVALID)", body = ErrorBody),
        (status = 403, description = "Owned by someone else (NOT_AUTHORIZED)", body = ErrorBody),
        (status = 404, description = "Receipt not found (NOT_FOUND)", body = ErrorBody),
    ),
    security(("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(owner_id = %auth_user.owner_id))]
pub async fn get_download_url(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DownloadUrlResponse>, AppError> {
    let id = store::parse_receipt_id(&id)?;
    let receipt = store::find_owned(&state.db, id, &auth_user.owner_id).await?;

    let hash = ContentHash::from_hex(&receipt.file_hash)
        .map_err(|e| AppError::Internal(format!("Receipt {id} has a bad file hash: {e}")))?;
    if !state.blob_store.exists(&hash).await? {
        return Err(StorageError::NotFound(receipt.file_hash).into());
    }

    let download =
        mint_download_url(&state, &hash, state.config.storage.download_url_ttl_secs).await?;
    Ok(Json(DownloadUrlResponse {
        url: download.url,
        expires_at: download.expires_at,
    }))
}

#[utoipa::path(
    post,
    path = "/{id}/cancel",
    tag = "Receipts",
    operation_id = "cancelReceiptExtraction",
    summary = "Cancel a pending extraction",
    description = "Asks the running extraction to stop. The receipt ends in `error` with \
        `extraction cancelled` once the run observes the request.",
    params(("id" = String, Path, description = "Receipt ID")),
    responses(
        (status = 202, description = "Cancellation requested", body = CancelResponse),
        (status = 401, description = "Unauthorized (TOKEN_MISSING, TOKEN_INVALID)", body = ErrorBody),
        (status = 403, description = "Owned by someone else (NOT_AUTHORIZED)", body = ErrorBody),
        (status = 404, description = "Receipt not found (NOT_FOUND)", body = ErrorBody),
        (status = 409, description = "Extraction already finished (CONFLICT)", body = ErrorBody),
    ),
    security(("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(owner_id = %auth_user.owner_id))]
pub async fn cancel_receipt(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = store::parse_receipt_id(&id)?;
    let receipt = store::request_cancel(&state.db, id, &auth_user.owner_id).await?;
    info!(receipt_id = %receipt.id, "Extraction cancellation requested");

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            receipt_id: receipt.id.to_string(),
            cancel_requested: receipt.cancel_requested,
        }),
    ))
}

/// Stream a multipart field to blob storage via a staged temp file. The staged copy is
/// returned so the upload can be stored again if needed.
async fn stream_field_to_store(
    mut field: axum::extract::multipart::Field<'_>,
    blob_store: &dyn BlobStore,
    max_size: u64,
) -> Result<(ContentHash, i64, StagedFile), AppError> {
    let staged = StagedFile::new();

    let mut temp_file = tokio::fs::File::create(&staged.path)
        .await
        .map_err(|e| AppError::UploadFailed(format!("Failed to create temp file: {e}")))?;

    let mut total_size: u64 = 0;

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| AppError::Validation(format!("Upload read error: {e}")))?
    {
        total_size += chunk.len() as u64;
        if total_size > max_size {
            return Err(AppError::Validation(format!(
                "File exceeds maximum size of {max_size} bytes"
            )));
        }
        temp_file
            .write_all(&chunk)
            .await
            .map_err(|e| AppError::UploadFailed(format!("Temp file write failed: {e}")))?;
    }

    if total_size == 0 {
        return Err(AppError::Validation("Uploaded file is empty".into()));
    }

    temp_file
        .flush()
        .await
        .map_err(|e| AppError::UploadFailed(format!("Temp file flush failed: {e}")))?;
    drop(temp_file);

    let file = tokio::fs::File::open(&staged.path)
        .await
        .map_err(|e| AppError::UploadFailed(format!("Failed to reopen temp file: {e}")))?;
    let reader: BoxReader = Box::new(file);
    let hash = blob_store.put_stream(reader).await.map_err(|e| {
        if e.is_backend_failure() {
            AppError::UploadFailed(e.to_string())
        } else {
            AppError::from(e)
        }
    })?;

    Ok((hash, i64::try_from(total_size).unwrap_or(i64::MAX), staged))
}
