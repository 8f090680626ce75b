use std::time::Duration;

use chrono::Utc;
use sea_orm::DatabaseConnection;
use tracing::{error, info};

use crate::config::ExtractionConfig;
use crate::store;

pub const STUCK_MESSAGE: &str = "extraction timed out";

/// Run the stuck receipt sweeper as a background task.
pub async fn run_stuck_receipt_sweeper(db: DatabaseConnection, config: ExtractionConfig) {
    let scan_interval = Duration::from_secs(config.stuck_scan_interval_secs.max(1));

    info!(
        timeout_secs = config.stuck_timeout_secs,
        scan_interval_secs = config.stuck_scan_interval_secs,
        "Starting stuck receipt sweeper"
    );

    let mut interval = tokio::time::interval(scan_interval);

    loop {
        interval.tick().await;

        if let Err(e) = sweep_stuck_receipts(&db, config.stuck_timeout_secs).await {
            error!(error = %e, "Stuck receipt sweep failed");
        }
    }
}

/// Mark receipts pending for longer than `timeout_secs` as failed. Returns how many were marked.
pub async fn sweep_stuck_receipts(
    db: &DatabaseConnection,
    timeout_secs: u64,
) -> anyhow::Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::seconds(timeout_secs as i64);
    let stuck = store::find_stale_pending(db, cutoff).await?;

    if stuck.is_empty() {
        return Ok(0);
    }

    info!(count = stuck.len(), "Found stuck receipts");

    let mut marked = 0;
    for receipt_id in stuck {
        // A run may finish between the scan and this update; only pending rows change.
        match store::mark_failed(db, receipt_id, STUCK_MESSAGE).await {
            Ok(true) => {
                marked += 1;
                info!(receipt_id = %receipt_id, "Marked stuck receipt as failed");
            }
            Ok(false) => {}
            Err(e) => error!(receipt_id = %receipt_id, error = %e, "Failed to mark stuck receipt"),
        }
    }

    Ok(marked)
}
