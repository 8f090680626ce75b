use chrono::{DateTime, Utc};
use common::ReceiptStatus;
use serde::{Deserialize, Serialize};

pub use super::shared::Pagination;
use crate::entity::receipt::{self, LineItem};

/// Returned by a successful upload.
#[derive(Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceiptResponse {
    /// Receipt ID (UUIDv7).
    #[schema(example = "01936f0e-1234-7abc-8000-000000000001")]
    pub receipt_id: String,
    /// Sanitized upload file name.
    #[schema(example = "grocery-2024-03-02.pdf")]
    pub file_name: String,
}

/// Full receipt record.
#[derive(Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptResponse {
    pub id: String,
    pub file_name: String,
    /// "Merchant – date" once processed, the file name before.
    pub file_display_name: String,
    pub size: i64,
    #[schema(example = "application/pdf")]
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
    pub status: ReceiptStatus,
    pub merchant_name: Option<String>,
    pub merchant_address: Option<String>,
    pub merchant_contact: Option<String>,
    pub transaction_date: Option<String>,
    /// Total with two decimals.
    #[schema(example = "22.00")]
    pub transaction_amount: Option<String>,
    #[schema(example = "USD")]
    pub currency: Option<String>,
    /// Omitted unless the owner's plan includes summaries.
    pub receipt_summary: Option<String>,
    pub items: Vec<LineItem>,
    /// Why extraction failed, when `status` is `error`.
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

impl ReceiptResponse {
    pub fn new(model: receipt::Model, include_summary: bool) -> Self {
        let items = model.line_items();
        Self {
            id: model.id.to_string(),
            file_name: model.file_name,
            file_display_name: model.file_display_name,
            size: model.size,
            mime_type: model.mime_type,
            uploaded_at: model.uploaded_at,
            status: model.status,
            merchant_name: model.merchant_name,
            merchant_address: model.merchant_address,
            merchant_contact: model.merchant_contact,
            transaction_date: model.transaction_date,
            transaction_amount: model.transaction_amount,
            currency: model.currency,
            receipt_summary: model.receipt_summary.filter(|_| include_summary),
            items,
            error_message: model.error_message,
            cancel_requested: model.cancel_requested,
            processed_at: model.processed_at,
        }
    }
}

/// Row of the receipt list.
#[derive(Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptListItem {
    pub id: String,
    pub file_name: String,
    pub file_display_name: String,
    pub size: i64,
    pub uploaded_at: DateTime<Utc>,
    pub status: ReceiptStatus,
    pub merchant_name: Option<String>,
    pub transaction_amount: Option<String>,
    pub currency: Option<String>,
}

impl From<receipt::Model> for ReceiptListItem {
    fn from(model: receipt::Model) -> Self {
        Self {
            id: model.id.to_string(),
            file_name: model.file_name,
            file_display_name: model.file_display_name,
            size: model.size,
            uploaded_at: model.uploaded_at,
            status: model.status,
            merchant_name: model.merchant_name,
            transaction_amount: model.transaction_amount,
            currency: model.currency,
        }
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct ReceiptListResponse {
    pub data: Vec<ReceiptListItem>,
    pub pagination: Pagination,
}

#[derive(Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ReceiptListQuery {
    /// Page number, 1-based. Default: 1.
    pub page: Option<u64>,
    /// Items per page, 1-100. Default: 20.
    pub per_page: Option<u64>,
    /// Only receipts in this status.
    pub status: Option<ReceiptStatus>,
}

/// Time-limited link to the stored PDF.
#[derive(Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DownloadUrlResponse {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Returned when cancellation was requested.
#[derive(Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub receipt_id: String,
    pub cancel_requested: bool,
}
