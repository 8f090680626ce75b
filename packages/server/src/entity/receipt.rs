use common::ReceiptStatus;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One line of a receipt, stored inside the `items` JSON array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    #[schema(example = "Coffee")]
    pub name: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub total_price: f64,
}

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "receipt")]
pub struct Model {
    /// UUIDv7 primary key.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Subject of the uploader's bearer token.
    #[sea_orm(indexed)]
    pub owner_id: String,

    /// SHA-256 of the stored PDF. Several receipts may share one blob.
    #[sea_orm(indexed)]
    pub file_hash: String,
    pub file_name: String,
    /// Starts as the file name; the extraction run replaces it with "merchant – date".
    pub file_display_name: String,
    pub size: i64,
    pub mime_type: String,
    pub uploaded_at: DateTimeUtc,

    #[sea_orm(indexed)]
    pub status: ReceiptStatus,

    pub merchant_name: Option<String>,
    pub merchant_address: Option<String>,
    pub merchant_contact: Option<String>,
    pub transaction_date: Option<String>,
    pub transaction_amount: Option<String>,
    pub currency: Option<String>,
    pub receipt_summary: Option<String>,

    /// JSON array of [`LineItem`]. Empty until processed.
    #[sea_orm(column_type = "Json")]
    pub items: Json,

    pub error_message: Option<String>,
    #[sea_orm(default_value = false)]
    pub cancel_requested: bool,
    pub processed_at: Option<DateTimeUtc>,
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Decoded line items. Malformed rows decode as empty.
    pub fn line_items(&self) -> Vec<LineItem> {
        serde_json::from_value(self.items.clone()).unwrap_or_default()
    }
}
