pub use broccoli_queue::{
    brokers::broker::BrokerMessage, error::BroccoliError, queue::BroccoliQueue,
};
use serde::Serialize;
use tracing::debug;

use crate::error::MqError;

pub type MqQueue = BroccoliQueue;

pub struct MqConfig {
    pub url: String,
    pub pool_size: u8,
}

pub async fn init_mq(config: MqConfig) -> Result<MqQueue, MqError> {
    BroccoliQueue::builder(&config.url)
        .pool_connections(config.pool_size)
        .build()
        .await
        .map_err(|e| MqError::Connection(e.to_string()))
}

/// Publish one message with default options.
pub async fn publish<T>(mq: &MqQueue, queue: &str, message: &T) -> Result<(), MqError>
where
    T: Serialize + Clone + serde::de::DeserializeOwned + Send + Sync,
{
    mq.publish(queue, None, message, None)
        .await
        .map_err(|e| MqError::Publish {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;
    debug!(queue, "Message published");
    Ok(())
}
