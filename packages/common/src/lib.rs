pub mod config;
pub mod extraction_job;
pub mod receipt_status;
pub mod retry;
pub mod storage;

pub use config::{BackoffConfig, MqAppConfig};
pub use extraction_job::{ExtractionRequested, UsageRecorded};
pub use receipt_status::ReceiptStatus;
