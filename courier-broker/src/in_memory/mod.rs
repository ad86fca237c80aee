//! In-process brokers.
//!
//! [`InMemoryLogBroker`] behaves like a partitioned log with consumer-group
//! offsets and [`InMemoryQueueBroker`] like an exchange/queue broker with
//! per-message acknowledgement. Both hand out adapters that go through the
//! same connection lifecycle as the networked ones, and both can be told to
//! become unreachable or slow so failure paths can be exercised without a
//! real cluster.

mod log_broker;
mod queue_broker;

pub use log_broker::{InMemoryLogAdapter, InMemoryLogBroker};
pub use queue_broker::{InMemoryQueueAdapter, InMemoryQueueBroker};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::connection::{ConnectionManager, Dialer};
use crate::errors::{BrokerError, ConnectionError};

/// Failure knobs shared by a broker and every adapter it handed out.
#[derive(Default)]
pub(crate) struct Faults {
    unreachable: AtomicBool,
    dial_delay_ms: AtomicU64,
    ack_delay_ms: AtomicU64,
}

impl Faults {
    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub(crate) fn is_reachable(&self) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }

    pub(crate) fn set_dial_delay(&self, delay: Duration) {
        self.dial_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn set_ack_delay(&self, delay: Duration) {
        self.ack_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn ack_delay(&self) -> Duration {
        Duration::from_millis(self.ack_delay_ms.load(Ordering::SeqCst))
    }

    fn dial_delay(&self) -> Duration {
        Duration::from_millis(self.dial_delay_ms.load(Ordering::SeqCst))
    }

    /// Fails operations on an established connection once the broker went
    /// away.
    pub(crate) fn check(&self, endpoint: &str) -> Result<(), BrokerError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(BrokerError::BrokerUnavailable(format!(
                "lost connection to {endpoint}"
            )))
        }
    }
}

pub(crate) struct MemoryLink {
    open: AtomicBool,
    publish_seq: AtomicU64,
}

impl MemoryLink {
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Confirm sequence number of the next publish on this connection.
    pub(crate) fn next_publish_seq(&self) -> u64 {
        self.publish_seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub(crate) struct MemoryDialer {
    endpoint: &'static str,
    faults: Arc<Faults>,
}

impl MemoryDialer {
    pub(crate) fn new(endpoint: &'static str, faults: Arc<Faults>) -> Self {
        Self { endpoint, faults }
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    type Connection = MemoryLink;

    fn endpoint(&self) -> String {
        self.endpoint.to_string()
    }

    async fn dial(&self) -> Result<MemoryLink, ConnectionError> {
        let delay = self.faults.dial_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.faults.is_reachable() {
            return Err(ConnectionError::unreachable(
                self.endpoint,
                "connection refused",
            ));
        }
        Ok(MemoryLink {
            open: AtomicBool::new(true),
            publish_seq: AtomicU64::new(0),
        })
    }

    fn is_alive(&self, connection: &MemoryLink) -> bool {
        connection.is_open()
    }

    async fn hang_up(&self, connection: Arc<MemoryLink>) {
        connection.open.store(false, Ordering::SeqCst);
    }
}

/// The open connection of an adapter, or a connection error when the caller
/// skipped `connect`.
pub(crate) fn require_link(
    connections: &ConnectionManager<MemoryDialer>,
) -> Result<Arc<MemoryLink>, BrokerError> {
    match connections.current() {
        Some(link) if connections.dialer().is_alive(&link) => {
            connections.dialer().faults.check(connections.dialer().endpoint)?;
            Ok(link)
        }
        _ => Err(ConnectionError::unreachable(
            connections.dialer().endpoint,
            "not connected",
        )
        .into()),
    }
}
