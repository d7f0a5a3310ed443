//! Offer publishing onto the outbound topic
//!
//! Each offer travels in an [`OfferMessage`] envelope serialized as JSON. A
//! publish succeeds only once the transport confirms it; transport failures
//! are retried under the shared backoff policy and then surfaced.

pub mod transport;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::models::OfferMessage;
use crate::utils::error::PublishError;
use crate::utils::retry::{with_retry, RetryPolicy};

pub use transport::{MemoryTransport, RedisStreamTransport, Transport};

/// Publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Outbound topic (Redis stream key)
    pub topic: String,

    /// Approximate cap on stream length
    pub stream_max_len: usize,

    /// Retry policy for transport failures
    pub retry: RetryPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic: "offers".to_string(),
            stream_max_len: 100_000,
            retry: RetryPolicy::with_delays(3, 200, 5_000),
        }
    }
}

/// Transport confirmation of one delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Envelope id
    pub message_id: Uuid,
    /// Transport-assigned id (stream entry id)
    pub transport_id: String,
}

/// Serializes and delivers offer envelopes
pub struct Publisher {
    transport: Arc<dyn Transport>,
    topic: String,
    retry: RetryPolicy,
}

impl Publisher {
    /// Create a publisher over `transport`
    pub fn new(transport: Arc<dyn Transport>, config: &PublisherConfig) -> Self {
        Self {
            transport,
            topic: config.topic.clone(),
            retry: config.retry.clone(),
        }
    }

    /// Outbound topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Deliver one envelope, waiting for transport confirmation
    pub async fn publish(&self, message: &OfferMessage) -> Result<DeliveryReceipt, PublishError> {
        let payload = serde_json::to_string(message)?;
        let topic = self.topic.as_str();
        let transport = self.transport.as_ref();
        let payload_ref = payload.as_str();

        let transport_id = with_retry(&self.retry, || transport.send(topic, payload_ref))
            .await
            .map_err(|e| PublishError::Exhausted {
                attempts: self.retry.max_attempts(),
                last: e.to_string(),
            })?;

        debug!(
            task_key = %message.task_key,
            item_id = %message.offer.item_id,
            transport = transport.name(),
            transport_id = %transport_id,
            "Offer published"
        );

        Ok(DeliveryReceipt {
            message_id: message.message_id,
            transport_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ParsedOffer, TaskParams};
    use serde_json::json;

    fn message() -> OfferMessage {
        let offer = ParsedOffer::from_record(
            &json!({"itemId": "i-1", "title": "Key", "price": {"USD": "99"}}),
            &TaskParams::new("a8db"),
        )
        .unwrap();
        OfferMessage::new("a8db-usd", "instance-1", offer)
    }

    fn publisher(transport: Arc<MemoryTransport>, retries: u32) -> Publisher {
        let config = PublisherConfig {
            retry: RetryPolicy::with_delays(retries, 1, 2).without_jitter(),
            ..Default::default()
        };
        Publisher::new(transport, &config)
    }

    #[tokio::test]
    async fn test_publish_envelope() {
        let transport = Arc::new(MemoryTransport::new());
        let publisher = publisher(Arc::clone(&transport), 2);
        let msg = message();

        let receipt = publisher.publish(&msg).await.unwrap();
        assert_eq!(receipt.message_id, msg.message_id);

        let sent = transport.messages().await;
        assert_eq!(sent[0].0, "offers");
        let decoded: OfferMessage = serde_json::from_str(&sent[0].1).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_publish_retries_transient_failures() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next(2);
        let publisher = publisher(Arc::clone(&transport), 2);

        assert!(publisher.publish(&message()).await.is_ok());
        assert_eq!(transport.len().await, 1);
    }

    #[tokio::test]
    async fn test_publish_exhaustion_surfaces() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next(10);
        let publisher = publisher(Arc::clone(&transport), 2);

        match publisher.publish(&message()).await {
            Err(PublishError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(transport.is_empty().await);
    }
}
