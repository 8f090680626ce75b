//! Record store access for receipts. Owner-facing lookups enforce ownership here so
//! that handlers cannot accidentally return another owner's record.

use chrono::{DateTime, Utc};
use common::ReceiptStatus;
use common::storage::{BlobStore, ContentHash};
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entity::receipt;
use crate::error::AppError;
use crate::extraction::normalize::ExtractedFields;

/// Metadata of a freshly stored upload.
#[derive(Debug, Clone)]
pub struct NewReceipt {
    pub owner_id: String,
    pub file_hash: ContentHash,
    pub file_name: String,
    pub size: i64,
    pub mime_type: String,
}

/// Result of the final write of an extraction run.
#[derive(Debug)]
pub enum PersistOutcome {
    Committed(receipt::Model),
    /// Deleted while the run was in flight.
    Missing,
    /// The owner asked to cancel; the record was marked as failed instead.
    Cancelled,
    /// Another run (or the stuck sweeper) already finished this record.
    AlreadyFinal(ReceiptStatus),
}

/// Held while a blob gains or loses its last reference, so a release never deletes a
/// blob that an upload in this process has just recorded.
static BLOB_REFS: Mutex<()> = Mutex::const_new(());

/// A receipt recorded for an upload, and whether its blob was released in the meantime.
#[derive(Debug)]
pub struct RecordedUpload {
    pub receipt: receipt::Model,
    pub blob_missing: bool,
}

/// Receipt ids are opaque to clients; anything that is not one of ours is simply unknown.
pub fn parse_receipt_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::NotFound("Receipt not found".into()))
}

pub async fn create<C: ConnectionTrait>(
    conn: &C,
    new: NewReceipt,
) -> Result<receipt::Model, DbErr> {
    let model = receipt::ActiveModel {
        id: Set(Uuid::now_v7()),
        owner_id: Set(new.owner_id),
        file_hash: Set(new.file_hash.to_hex()),
        file_display_name: Set(new.file_name.clone()),
        file_name: Set(new.file_name),
        size: Set(new.size),
        mime_type: Set(new.mime_type),
        uploaded_at: Set(Utc::now()),
        status: Set(ReceiptStatus::Pending),
        merchant_name: Set(None),
        merchant_address: Set(None),
        merchant_contact: Set(None),
        transaction_date: Set(None),
        transaction_amount: Set(None),
        currency: Set(None),
        receipt_summary: Set(None),
        items: Set(serde_json::json!([])),
        error_message: Set(None),
        cancel_requested: Set(false),
        processed_at: Set(None),
    };
    model.insert(conn).await
}

/// Record an upload whose bytes are already in `blob_store`.
///
/// A concurrent delete of the last receipt sharing the same content may have removed the
/// blob after it was stored; `blob_missing` tells the caller to store it again.
pub async fn record_upload(
    db: &DatabaseConnection,
    blob_store: &dyn BlobStore,
    new: NewReceipt,
) -> Result<RecordedUpload, AppError> {
    let hash = new.file_hash;
    let _refs = BLOB_REFS.lock().await;

    let receipt = create(db, new).await?;
    let blob_missing = match blob_store.exists(&hash).await {
        Ok(present) => !present,
        Err(e) => {
            delete_by_id(db, receipt.id).await;
            return Err(e.into());
        }
    };

    Ok(RecordedUpload {
        receipt,
        blob_missing,
    })
}

/// Remove a receipt without ownership checks, used to roll back a failed upload.
pub async fn delete_by_id(db: &DatabaseConnection, id: Uuid) {
    if let Err(e) = receipt::Entity::delete_by_id(id).exec(db).await {
        warn!(receipt_id = %id, error = %e, "Failed to roll back receipt");
    }
}

/// Fetch a receipt the caller owns. Missing → `NotFound`, foreign → `NotAuthorized`.
pub async fn find_owned<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    owner_id: &str,
) -> Result<receipt::Model, AppError> {
    let receipt = receipt::Entity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| AppError::NotFound("Receipt not found".into()))?;

    if receipt.owner_id != owner_id {
        warn!(receipt_id = %id, "Receipt access by non-owner denied");
        return Err(AppError::NotAuthorized);
    }
    Ok(receipt)
}

/// One page of an owner's receipts, newest first, plus the total count.
pub async fn list_by_owner(
    db: &DatabaseConnection,
    owner_id: &str,
    status: Option<ReceiptStatus>,
    page: u64,
    per_page: u64,
) -> Result<(Vec<receipt::Model>, u64), AppError> {
    let offset = page
        .saturating_sub(1)
        .checked_mul(per_page)
        .filter(|offset| i64::try_from(*offset).is_ok())
        .ok_or_else(|| AppError::Validation(format!("Page {page} is out of range")))?;

    let mut select = receipt::Entity::find().filter(receipt::Column::OwnerId.eq(owner_id));
    if let Some(status) = status {
        select = select.filter(receipt::Column::Status.eq(status));
    }

    let total = select.clone().paginate(db, per_page).num_items().await?;

    let data = select
        .order_by_desc(receipt::Column::UploadedAt)
        .order_by_desc(receipt::Column::Id)
        .offset(Some(offset))
        .limit(Some(per_page))
        .all(db)
        .await?;

    Ok((data, total))
}

/// Delete a blob once no receipt references it any more.
///
/// Returns `true` when the blob was removed.
pub async fn release_blob<C: ConnectionTrait>(
    conn: &C,
    blob_store: &dyn BlobStore,
    hash: &ContentHash,
) -> Result<bool, AppError> {
    let _refs = BLOB_REFS.lock().await;
    let references = receipt::Entity::find()
        .filter(receipt::Column::FileHash.eq(hash.to_hex()))
        .count(conn)
        .await?;
    if references > 0 {
        return Ok(false);
    }
    Ok(blob_store.delete(hash).await?)
}

/// Delete an owned receipt and, if it was the last reference, its file.
pub async fn delete_owned(
    db: &DatabaseConnection,
    blob_store: &dyn BlobStore,
    id: Uuid,
    owner_id: &str,
) -> Result<(), AppError> {
    let receipt = find_owned(db, id, owner_id).await?;
    receipt::Entity::delete_by_id(receipt.id).exec(db).await?;

    match ContentHash::from_hex(&receipt.file_hash) {
        Ok(hash) => {
            // The record is gone either way; a leftover blob is only wasted space.
            if let Err(e) = release_blob(db, blob_store, &hash).await {
                warn!(receipt_id = %id, hash = %hash, error = ?e, "Failed to delete receipt file");
            }
        }
        Err(e) => warn!(receipt_id = %id, error = %e, "Receipt has a malformed file hash"),
    }

    info!(receipt_id = %id, "Receipt deleted");
    Ok(())
}

/// Flag an in-flight extraction for cancellation.
pub async fn request_cancel(
    db: &DatabaseConnection,
    id: Uuid,
    owner_id: &str,
) -> Result<receipt::Model, AppError> {
    let receipt = find_owned(db, id, owner_id).await?;
    if receipt.status.is_final() {
        return Err(AppError::Conflict(format!(
            "Receipt is already {}",
            receipt.status
        )));
    }

    let update = receipt::ActiveModel {
        id: Set(receipt.id),
        cancel_requested: Set(true),
        ..Default::default()
    };
    Ok(update.update(db).await?)
}

/// Move a still-pending receipt to `Error`. Returns `false` if it was missing or already final.
pub async fn mark_failed<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    message: &str,
) -> Result<bool, DbErr> {
    let result = receipt::Entity::update_many()
        .col_expr(receipt::Column::Status, Expr::value(ReceiptStatus::Error))
        .col_expr(
            receipt::Column::ErrorMessage,
            Expr::value(Some(message.to_string())),
        )
        .col_expr(receipt::Column::ProcessedAt, Expr::value(Some(Utc::now())))
        .filter(receipt::Column::Id.eq(id))
        .filter(receipt::Column::Status.eq(ReceiptStatus::Pending))
        .exec(conn)
        .await?;
    Ok(result.rows_affected > 0)
}

/// Ids of receipts still pending since before `cutoff`.
pub async fn find_stale_pending<C: ConnectionTrait>(
    conn: &C,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Uuid>, DbErr> {
    receipt::Entity::find()
        .select_only()
        .column(receipt::Column::Id)
        .filter(receipt::Column::Status.eq(ReceiptStatus::Pending))
        .filter(receipt::Column::UploadedAt.lt(cutoff))
        .into_tuple()
        .all(conn)
        .await
}

/// The only write that sets `Processed`. Re-reads the record inside the transaction so a
/// concurrent delete, cancellation or earlier completion is honoured.
pub async fn apply_extraction(
    db: &DatabaseConnection,
    id: Uuid,
    fields: &ExtractedFields,
) -> Result<PersistOutcome, DbErr> {
    let txn = db.begin().await?;

    let current = receipt::Entity::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?;

    let Some(current) = current else {
        txn.rollback().await?;
        return Ok(PersistOutcome::Missing);
    };

    if current.status.is_final() {
        txn.rollback().await?;
        return Ok(PersistOutcome::AlreadyFinal(current.status));
    }

    if current.cancel_requested {
        mark_failed(&txn, id, "extraction cancelled").await?;
        txn.commit().await?;
        return Ok(PersistOutcome::Cancelled);
    }

    let items = serde_json::to_value(&fields.items)
        .map_err(|e| DbErr::Custom(format!("failed to encode line items: {e}")))?;

    let update = receipt::ActiveModel {
        id: Set(id),
        file_display_name: Set(fields.file_display_name.clone()),
        merchant_name: Set(fields.merchant_name.clone()),
        merchant_address: Set(fields.merchant_address.clone()),
        merchant_contact: Set(fields.merchant_contact.clone()),
        transaction_date: Set(fields.transaction_date.clone()),
        transaction_amount: Set(fields.transaction_amount.clone()),
        currency: Set(fields.currency.clone()),
        receipt_summary: Set(fields.receipt_summary.clone()),
        items: Set(items),
        status: Set(ReceiptStatus::Processed),
        error_message: Set(None),
        processed_at: Set(Some(Utc::now())),
        ..Default::default()
    };
    let saved = update.update(&txn).await?;
    txn.commit().await?;

    Ok(PersistOutcome::Committed(saved))
}
