use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::message::Message;

/// Broker-native coordinates of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BrokerMetadata {
    Log { partition: i32, offset: i64 },
    Queue { delivery_tag: u64 },
}

impl fmt::Display for BrokerMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerMetadata::Log { partition, offset } => {
                write!(f, "partition: {partition}, offset: {offset}")
            }
            BrokerMetadata::Queue { delivery_tag } => write!(f, "delivery tag: {delivery_tag}"),
        }
    }
}

/// Result of one publish attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub message_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_metadata: Option<BrokerMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn delivered(message_id: impl Into<String>, metadata: BrokerMetadata) -> Self {
        Self {
            message_id: message_id.into(),
            success: true,
            broker_metadata: Some(metadata),
            error: None,
        }
    }

    pub fn failed(message_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            success: false,
            broker_metadata: None,
            error: Some(error.into()),
        }
    }
}

/// Aggregate of a batch publish. Per-message outcomes are kept in send order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub outcomes: Vec<DeliveryOutcome>,
    /// Set when the batch could not be started at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchReport {
    pub fn record(&mut self, outcome: DeliveryOutcome) {
        self.total += 1;
        if outcome.success {
            self.success += 1;
        } else {
            self.failed += 1;
        }
        self.outcomes.push(outcome);
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.success)
            .map(|outcome| outcome.message_id.as_str())
            .collect()
    }
}

/// What a consumer handler wants done with a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckDecision {
    Ack,
    Requeue,
    Reject,
}

/// A decoded message together with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub message: Message,
    pub source: String,
    pub metadata: BrokerMetadata,
}

/// A delivery whose payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MalformedMessage {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub metadata: BrokerMetadata,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Success,
    Error,
}

/// Health report produced by a connection test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub status: ConnectionStatus,
    pub message: String,
    #[serde(flatten)]
    pub details: BTreeMap<String, String>,
}

impl ConnectionReport {
    pub fn success(message: impl Into<String>, details: BTreeMap<String, String>) -> Self {
        Self {
            status: ConnectionStatus::Success,
            message: message.into(),
            details,
        }
    }

    pub fn error(message: impl Into<String>, details: BTreeMap<String, String>) -> Self {
        Self {
            status: ConnectionStatus::Error,
            message: message.into(),
            details,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ConnectionStatus::Success
    }
}
