use std::fmt;
use std::time::Duration;

use courier_config::ConfigError;
use thiserror::Error;

/// Underlying cause carried by connection and topology failures.
pub type Cause = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("broker at {endpoint} is unreachable: {cause}")]
    Unreachable {
        endpoint: String,
        #[source]
        cause: Cause,
    },
    #[error("authentication rejected by {endpoint}: {cause}")]
    AuthenticationRejected {
        endpoint: String,
        #[source]
        cause: Cause,
    },
    #[error("security negotiation with {endpoint} failed: {cause}")]
    Negotiation {
        endpoint: String,
        #[source]
        cause: Cause,
    },
    #[error("timed out connecting to {endpoint} after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
}

impl ConnectionError {
    pub fn unreachable(endpoint: impl Into<String>, cause: impl Into<Cause>) -> Self {
        ConnectionError::Unreachable {
            endpoint: endpoint.into(),
            cause: cause.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            ConnectionError::Unreachable { endpoint, .. }
            | ConnectionError::AuthenticationRejected { endpoint, .. }
            | ConnectionError::Negotiation { endpoint, .. }
            | ConnectionError::Timeout { endpoint, .. } => endpoint,
        }
    }
}

/// Sub-step of a topology command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyStep {
    CreateTopic,
    DeleteTopic,
    DeclareExchange,
    DeclareQueue,
    BindQueue,
    DeleteQueue,
}

impl fmt::Display for TopologyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TopologyStep::CreateTopic => "create topic",
            TopologyStep::DeleteTopic => "delete topic",
            TopologyStep::DeclareExchange => "declare exchange",
            TopologyStep::DeclareQueue => "declare queue",
            TopologyStep::BindQueue => "bind queue",
            TopologyStep::DeleteQueue => "delete queue",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("{step} failed for '{unit}': {cause}")]
pub struct TopologyError {
    pub step: TopologyStep,
    pub unit: String,
    #[source]
    pub cause: Cause,
}

impl TopologyError {
    pub fn new(step: TopologyStep, unit: impl Into<String>, cause: impl Into<Cause>) -> Self {
        Self {
            step,
            unit: unit.into(),
            cause: cause.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("message {message_id} could not be encoded: {source}")]
    Serialization {
        message_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("broker did not acknowledge within {0:?}")]
    DeliveryTimeout(Duration),
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
    #[error("{unit} cannot be addressed through the {broker} adapter")]
    UnsupportedUnit { unit: String, broker: &'static str },
    #[error("publish rejected: {0}")]
    Publish(String),
    #[error("consume failed: {0}")]
    Consume(String),
    #[error("delivery not found: {0}")]
    UnknownDelivery(String),
    #[error("operation not implemented: {0}")]
    NotImplemented(&'static str),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("internal broker error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Errors after which a consume loop cannot continue on the same
    /// connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::BrokerUnavailable(_)
        )
    }

    /// Short reason recorded on a failed delivery outcome.
    pub fn outcome_reason(&self) -> String {
        match self {
            BrokerError::DeliveryTimeout(_) => "timeout".to_string(),
            other => other.to_string(),
        }
    }
}
