use std::sync::Arc;

use common::UsageRecorded;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::entitlements::Entitlements;

/// Forward usage events to the entitlement service until every sender is dropped.
///
/// Failures are logged and dropped; the receipt has already been committed.
pub async fn run_metering(
    mut events: mpsc::UnboundedReceiver<UsageRecorded>,
    entitlements: Arc<dyn Entitlements>,
) {
    info!("Starting metering consumer");

    while let Some(usage) = events.recv().await {
        match entitlements.track(&usage.owner_id, &usage.event).await {
            Ok(()) => info!(
                owner_id = %usage.owner_id,
                receipt_id = %usage.receipt_id,
                event = %usage.event,
                "Usage recorded"
            ),
            Err(e) => warn!(
                owner_id = %usage.owner_id,
                receipt_id = %usage.receipt_id,
                error = %e,
                "Failed to record usage"
            ),
        }
    }

    info!("Metering consumer stopped");
}
