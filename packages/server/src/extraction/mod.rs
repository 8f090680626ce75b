pub mod normalize;
pub mod orchestrator;
pub mod parser;
pub mod schema;

pub use orchestrator::{AbortReason, Orchestrator, ReceiptRecords, RunSettings, RunState};
pub use parser::{AnthropicParser, DocumentParser, InferenceError};

use sea_orm::DbErr;

/// Unrecoverable outcome of an extraction run. The message is stored on the receipt.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("parse failed: {0}")]
    ParseFailed(String),
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}
