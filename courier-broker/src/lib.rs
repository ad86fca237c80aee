pub mod adapters;
pub mod codec;
pub mod connection;
pub mod consumer;
mod errors;
pub mod health;
pub mod in_memory;
pub mod producer;
pub mod stop;
pub mod topology;
mod types;

pub use adapters::build_adapter;
pub use connection::{ConnectionManager, ConnectionStrategy, Dialer};
pub use consumer::{ConsumeSummary, Consumer, Fetched};
pub use errors::{BrokerError, Cause, ConnectionError, TopologyError, TopologyStep};
pub use producer::{Producer, ProducerSettings};
pub use stop::StopSignal;
pub use topology::TopologyService;
pub use types::{ConsumerOptions, PublishMetadata, RawMessage};

use async_trait::async_trait;
use courier_models::{AckDecision, AddressableUnit, BrokerMetadata};
use std::collections::BTreeMap;
use std::time::Duration;

/// Capability set implemented once per broker kind.
///
/// Producers, consumers and the topology service only talk to this trait, so
/// anything specific to topics, exchanges or queues stays inside the
/// implementation. Each adapter owns a single connection; give every service
/// its own adapter.
#[async_trait]
pub trait BrokerAdapter: Send + Sync + 'static {
    /// Short name of the broker kind, used in logs and diagnostics.
    fn kind(&self) -> &'static str;

    /// Coordinates worth reporting in health output (hosts, vhost, protocol).
    fn describe(&self) -> BTreeMap<String, String>;

    /// What services should do with the connection after each call.
    fn connection_strategy(&self) -> ConnectionStrategy;

    /// Dial if no live connection is held.
    async fn connect(&self) -> Result<(), ConnectionError>;

    fn is_connected(&self) -> bool;

    async fn close(&self);

    /// Create the unit if it is missing. Existing units are left untouched.
    async fn declare_unit(&self, unit: &AddressableUnit) -> Result<(), BrokerError>;

    async fn list_units(&self) -> Result<Vec<String>, BrokerError>;

    async fn delete_unit(&self, unit: &AddressableUnit) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        unit: &AddressableUnit,
        payload: &[u8],
        metadata: &PublishMetadata,
    ) -> Result<BrokerMetadata, BrokerError>;

    /// Take up to `max_messages` deliveries, waiting at most `timeout`.
    /// Returned messages are considered consumed.
    async fn poll(
        &self,
        units: &[AddressableUnit],
        group: &str,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, BrokerError>;

    async fn subscribe(
        &self,
        units: &[AddressableUnit],
        group: &str,
        options: &ConsumerOptions,
    ) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Server side details such as version or broker list.
    async fn server_info(&self) -> Result<BTreeMap<String, String>, BrokerError>;
}

/// Live stream of deliveries opened by [`BrokerAdapter::subscribe`].
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, or `None` when nothing arrived within `timeout`.
    async fn next(&mut self, timeout: Duration) -> Result<Option<RawMessage>, BrokerError>;

    async fn settle(&mut self, message: &RawMessage, decision: AckDecision)
        -> Result<(), BrokerError>;
}
