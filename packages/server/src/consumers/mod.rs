pub mod extraction;
pub mod metering;

pub use extraction::consume_extraction_requests;
pub use metering::run_metering;
