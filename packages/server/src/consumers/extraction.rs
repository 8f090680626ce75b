use std::sync::Arc;

use common::ExtractionRequested;
use mq::{BroccoliError, BrokerMessage, Mq};
use tracing::{error, info};

use crate::extraction::{Orchestrator, RunState};

/// Consume extraction events from the queue and run each one to completion.
///
/// Every run ends in a recorded terminal state, so messages are always acknowledged.
pub async fn consume_extraction_requests(
    orchestrator: Arc<Orchestrator>,
    mq: Arc<Mq>,
    queue_name: String,
    concurrency: usize,
) {
    info!(queue = %queue_name, concurrency, "Starting extraction consumer");

    let result = mq
        .process_messages(
            &queue_name,
            Some(concurrency.max(1)),
            None,
            move |message: BrokerMessage<ExtractionRequested>| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    let event = message.payload;
                    match orchestrator.run(&event).await {
                        RunState::Done { .. } => {}
                        other => info!(
                            receipt_id = %event.receipt_id,
                            outcome = ?other,
                            "Extraction finished without result"
                        ),
                    }
                    Ok::<(), BroccoliError>(())
                }
            },
        )
        .await;

    if let Err(e) = result {
        error!(error = %e, "Extraction consumer stopped unexpectedly");
    }
}
