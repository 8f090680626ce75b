use serde::{Deserialize, Serialize};

/// Event published after a successful upload to start one extraction run.
///
/// Wire shape is `{ "url": "...", "receiptId": "..." }`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRequested {
    /// Time-limited read URL of the stored PDF.
    pub url: String,
    /// ID of the receipt record to fill in.
    pub receipt_id: String,
}

impl ExtractionRequested {
    pub fn new(url: impl Into<String>, receipt_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            receipt_id: receipt_id.into(),
        }
    }
}

/// Usage event emitted once a receipt has been committed as processed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecorded {
    pub owner_id: String,
    pub receipt_id: String,
    /// Metered event name, `"scan"` for completed extractions.
    pub event: String,
}

impl UsageRecorded {
    pub fn scan(owner_id: impl Into<String>, receipt_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            receipt_id: receipt_id.into(),
            event: "scan".into(),
        }
    }
}
