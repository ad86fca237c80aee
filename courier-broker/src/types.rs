use chrono::{DateTime, Utc};
use courier_models::{BrokerMetadata, Message};
use std::time::Duration;

/// Envelope fields sent next to the encoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMetadata {
    pub message_id: String,
    pub key: Option<String>,
    pub priority: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

impl PublishMetadata {
    /// Capture the envelope of a message the producer has already stamped.
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.id().to_string(),
            key: message.key.clone(),
            priority: message.priority(),
            timestamp: message.timestamp().unwrap_or_else(Utc::now),
        }
    }
}

/// Undecoded delivery as handed over by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Topic or queue the message was read from.
    pub source: String,
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
    /// Partition key on the log broker, routing key on the queue broker.
    pub key: Option<String>,
    pub priority: Option<u8>,
    pub metadata: BrokerMetadata,
}

/// Consumer-side knobs shared by every adapter.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Unacknowledged deliveries allowed in flight (queue broker QoS).
    pub prefetch: u16,
    /// Let the broker consider messages settled on delivery.
    pub auto_ack: bool,
    /// Upper bound on a single wait for the next delivery.
    pub receive_timeout: Duration,
    /// How long the broker gets to confirm an ack, requeue or reject.
    pub settle_timeout: Duration,
    /// Stop the loop after this many handled messages.
    pub max_messages: Option<usize>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            prefetch: 1,
            auto_ack: false,
            receive_timeout: Duration::from_secs(1),
            settle_timeout: Duration::from_secs(10),
            max_messages: None,
        }
    }
}
