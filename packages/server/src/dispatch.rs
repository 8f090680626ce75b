use std::sync::Arc;

use async_trait::async_trait;
use common::ExtractionRequested;
use mq::{Mq, MqError};
use tracing::{Instrument, info, info_span};

use crate::extraction::Orchestrator;

/// Hands an `ExtractionRequested` event to whatever runs extractions.
#[async_trait]
pub trait ExtractionDispatcher: Send + Sync {
    async fn dispatch(&self, event: ExtractionRequested) -> Result<(), MqError>;
}

/// Publishes onto the Redis extraction queue, consumed by
/// [`crate::consumers::consume_extraction_requests`].
pub struct QueueDispatcher {
    mq: Arc<Mq>,
    queue_name: String,
}

impl QueueDispatcher {
    pub fn new(mq: Arc<Mq>, queue_name: impl Into<String>) -> Self {
        Self {
            mq,
            queue_name: queue_name.into(),
        }
    }
}

#[async_trait]
impl ExtractionDispatcher for QueueDispatcher {
    async fn dispatch(&self, event: ExtractionRequested) -> Result<(), MqError> {
        mq::publish(&self.mq, &self.queue_name, &event).await?;
        info!(receipt_id = %event.receipt_id, queue = %self.queue_name, "Extraction queued");
        Ok(())
    }
}

/// Runs each extraction on its own task in this process. Used when no broker is configured.
pub struct InlineDispatcher {
    orchestrator: Arc<Orchestrator>,
}

impl InlineDispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl ExtractionDispatcher for InlineDispatcher {
    async fn dispatch(&self, event: ExtractionRequested) -> Result<(), MqError> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let span = info_span!("inline_extraction", receipt_id = %event.receipt_id);
        tokio::spawn(
            async move {
                orchestrator.run(&event).await;
            }
            .instrument(span),
        );
        Ok(())
    }
}
