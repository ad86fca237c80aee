use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_models::{AckDecision, AddressableUnit, BrokerMetadata, TopicSpec};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{require_link, Faults, MemoryDialer, MemoryLink};
use crate::connection::{ConnectionManager, ConnectionStrategy};
use crate::errors::{BrokerError, ConnectionError, TopologyError, TopologyStep};
use crate::types::{ConsumerOptions, PublishMetadata, RawMessage};
use crate::{BrokerAdapter, Subscription};

const ENDPOINT: &str = "memory://log";

#[derive(Clone)]
struct Record {
    key: Option<String>,
    payload: Vec<u8>,
    message_id: Option<String>,
    priority: Option<u8>,
}

struct Topic {
    partitions: Vec<Vec<Record>>,
    next_partition: usize,
}

impl Topic {
    fn with_partitions(count: i32) -> Self {
        Self {
            partitions: (0..count.max(1)).map(|_| Vec::new()).collect(),
            next_partition: 0,
        }
    }

    /// Keyed records always land on the same partition; the rest rotate.
    fn partition_for(&mut self, key: Option<&str>) -> usize {
        let count = self.partitions.len();
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            None => {
                let partition = self.next_partition % count;
                self.next_partition = self.next_partition.wrapping_add(1);
                partition
            }
        }
    }
}

type OffsetKey = (String, String, i32);

#[derive(Default)]
struct LogState {
    topics: BTreeMap<String, Topic>,
    committed: HashMap<OffsetKey, i64>,
}

impl LogState {
    fn append(&mut self, topic: &str, record: Record) -> Option<(i32, i64)> {
        let topic = self.topics.get_mut(topic)?;
        let partition = topic.partition_for(record.key.as_deref());
        let log = &mut topic.partitions[partition];
        log.push(record);
        Some((partition as i32, (log.len() - 1) as i64))
    }

    fn committed(&self, group: &str, topic: &str, partition: i32) -> i64 {
        self.committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or(0)
    }

    /// Commits only move forward, like a consumer group's stored offset.
    fn commit(&mut self, group: &str, topic: &str, partition: i32, next_offset: i64) {
        let entry = self
            .committed
            .entry((group.to_string(), topic.to_string(), partition))
            .or_insert(0);
        if next_offset > *entry {
            *entry = next_offset;
        }
    }

    fn record_at(&self, topic: &str, partition: i32, offset: i64) -> Option<RawMessage> {
        let record = self
            .topics
            .get(topic)?
            .partitions
            .get(partition as usize)?
            .get(offset as usize)?;
        Some(RawMessage {
            source: topic.to_string(),
            payload: record.payload.clone(),
            message_id: record.message_id.clone(),
            key: record.key.clone(),
            priority: record.priority,
            metadata: BrokerMetadata::Log { partition, offset },
        })
    }

    fn partition_count(&self, topic: &str) -> i32 {
        self.topics
            .get(topic)
            .map(|topic| topic.partitions.len() as i32)
            .unwrap_or(0)
    }
}

/// Partitioned append-only log with per-group committed offsets.
///
/// Clones share the same log. New consumer groups start from the earliest
/// offset.
#[derive(Clone)]
pub struct InMemoryLogBroker {
    state: Arc<Mutex<LogState>>,
    notify: Arc<Notify>,
    faults: Arc<Faults>,
    auto_create: bool,
    default_partitions: i32,
}

impl Default for InMemoryLogBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLogBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LogState::default())),
            notify: Arc::new(Notify::new()),
            faults: Arc::new(Faults::default()),
            auto_create: true,
            default_partitions: 1,
        }
    }

    /// Partition count for topics declared without one and for auto-created
    /// topics.
    pub fn with_default_partitions(mut self, partitions: i32) -> Self {
        self.default_partitions = partitions.max(1);
        self
    }

    /// Reject publishes to topics nobody declared.
    pub fn without_auto_create(mut self) -> Self {
        self.auto_create = false;
        self
    }

    pub fn adapter(&self) -> InMemoryLogAdapter {
        InMemoryLogAdapter {
            broker: self.clone(),
            connections: ConnectionManager::new(
                MemoryDialer::new(ENDPOINT, Arc::clone(&self.faults)),
                Duration::from_secs(10),
            ),
            strategy: ConnectionStrategy::Persistent,
        }
    }

    /// Simulate the broker going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.faults.set_reachable(reachable);
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        self.faults.set_dial_delay(delay);
    }

    /// Delay acknowledgements. Records are stored before the delay starts.
    pub fn set_ack_delay(&self, delay: Duration) {
        self.faults.set_ack_delay(delay);
    }

    /// Append bytes as a foreign producer would, bypassing the codec.
    pub fn append_raw(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: impl Into<Vec<u8>>,
    ) -> Option<BrokerMetadata> {
        let record = Record {
            key: key.map(str::to_string),
            payload: payload.into(),
            message_id: None,
            priority: None,
        };
        let appended = {
            let mut state = self.state.lock();
            self.ensure_topic(&mut state, topic);
            state.append(topic, record)
        };
        self.notify.notify_waiters();
        appended.map(|(partition, offset)| BrokerMetadata::Log { partition, offset })
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> i64 {
        self.state.lock().committed(group, topic, partition)
    }

    pub fn partition_len(&self, topic: &str, partition: i32) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .and_then(|topic| topic.partitions.get(partition as usize))
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn ensure_topic(&self, state: &mut LogState, topic: &str) {
        if self.auto_create && !state.topics.contains_key(topic) {
            debug!("Auto-creating topic {}", topic);
            state
                .topics
                .insert(topic.to_string(), Topic::with_partitions(self.default_partitions));
        }
    }

    /// Read forward from each partition's committed offset, committing what
    /// was taken.
    fn take_committed(&self, topics: &[String], group: &str, max: usize) -> Vec<RawMessage> {
        let mut state = self.state.lock();
        let mut taken = Vec::new();
        for topic in topics {
            for partition in 0..state.partition_count(topic) {
                let mut offset = state.committed(group, topic, partition);
                while taken.len() < max {
                    match state.record_at(topic, partition, offset) {
                        Some(raw) => {
                            taken.push(raw);
                            offset += 1;
                        }
                        None => break,
                    }
                }
                state.commit(group, topic, partition, offset);
                if taken.len() >= max {
                    return taken;
                }
            }
        }
        taken
    }
}

pub struct InMemoryLogAdapter {
    broker: InMemoryLogBroker,
    connections: ConnectionManager<MemoryDialer>,
    strategy: ConnectionStrategy,
}

impl InMemoryLogAdapter {
    pub fn with_strategy(mut self, strategy: ConnectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connections = ConnectionManager::new(
            MemoryDialer::new(ENDPOINT, Arc::clone(&self.broker.faults)),
            timeout,
        );
        self
    }

    fn topic<'a>(&self, unit: &'a AddressableUnit) -> Result<&'a TopicSpec, BrokerError> {
        match unit {
            AddressableUnit::Topic(spec) => Ok(spec),
            other => Err(BrokerError::UnsupportedUnit {
                unit: other.to_string(),
                broker: self.kind(),
            }),
        }
    }

    fn topic_names(&self, units: &[AddressableUnit]) -> Result<Vec<String>, BrokerError> {
        units
            .iter()
            .map(|unit| self.topic(unit).map(|spec| spec.name.clone()))
            .collect()
    }
}

#[async_trait]
impl BrokerAdapter for InMemoryLogAdapter {
    fn kind(&self) -> &'static str {
        "memory-log"
    }

    fn describe(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("backend".to_string(), self.kind().to_string()),
            ("endpoint".to_string(), ENDPOINT.to_string()),
        ])
    }

    fn connection_strategy(&self) -> ConnectionStrategy {
        self.strategy
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        self.connections.connect().await.map(|_| ())
    }

    fn is_connected(&self) -> bool {
        self.connections.is_connected()
    }

    async fn close(&self) {
        self.connections.close().await;
    }

    async fn declare_unit(&self, unit: &AddressableUnit) -> Result<(), BrokerError> {
        let spec = self.topic(unit)?;
        require_link(&self.connections)?;

        let partitions = spec.partitions.unwrap_or(self.broker.default_partitions);
        if partitions < 1 {
            return Err(TopologyError::new(
                TopologyStep::CreateTopic,
                &spec.name,
                format!("INVALID_PARTITIONS - {partitions} partitions requested"),
            )
            .into());
        }
        if let Some(replication) = spec.replication_factor {
            if replication < 1 {
                return Err(TopologyError::new(
                    TopologyStep::CreateTopic,
                    &spec.name,
                    format!("INVALID_REPLICATION_FACTOR - {replication}"),
                )
                .into());
            }
        }

        let mut state = self.broker.state.lock();
        state
            .topics
            .entry(spec.name.clone())
            .or_insert_with(|| Topic::with_partitions(partitions));
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<String>, BrokerError> {
        require_link(&self.connections)?;
        Ok(self.broker.state.lock().topics.keys().cloned().collect())
    }

    async fn delete_unit(&self, unit: &AddressableUnit) -> Result<(), BrokerError> {
        let spec = self.topic(unit)?;
        require_link(&self.connections)?;

        let mut state = self.broker.state.lock();
        if state.topics.remove(&spec.name).is_none() {
            return Err(TopologyError::new(
                TopologyStep::DeleteTopic,
                &spec.name,
                "UNKNOWN_TOPIC_OR_PART - topic does not exist",
            )
            .into());
        }
        state.committed.retain(|(_, topic, _), _| topic != &spec.name);
        Ok(())
    }

    async fn publish(
        &self,
        unit: &AddressableUnit,
        payload: &[u8],
        metadata: &PublishMetadata,
    ) -> Result<BrokerMetadata, BrokerError> {
        let spec = self.topic(unit)?;
        require_link(&self.connections)?;

        let record = Record {
            key: metadata.key.clone(),
            payload: payload.to_vec(),
            message_id: Some(metadata.message_id.clone()),
            priority: metadata.priority,
        };
        let appended = {
            let mut state = self.broker.state.lock();
            self.broker.ensure_topic(&mut state, &spec.name);
            state.append(&spec.name, record)
        };
        let (partition, offset) = appended.ok_or_else(|| {
            BrokerError::Publish(format!(
                "UNKNOWN_TOPIC_OR_PART - topic {} does not exist",
                spec.name
            ))
        })?;
        self.broker.notify.notify_waiters();

        let delay = self.broker.faults.ack_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(BrokerMetadata::Log { partition, offset })
    }

    async fn poll(
        &self,
        units: &[AddressableUnit],
        group: &str,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        let topics = self.topic_names(units)?;
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            require_link(&self.connections)?;
            let taken = self.broker.take_committed(&topics, group, max_messages);
            if !taken.is_empty() {
                return Ok(taken);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn subscribe(
        &self,
        units: &[AddressableUnit],
        group: &str,
        options: &ConsumerOptions,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let topics = self.topic_names(units)?;
        let link = require_link(&self.connections)?;
        Ok(Box::new(LogSubscription {
            broker: self.broker.clone(),
            link,
            topics,
            group: group.to_string(),
            auto_commit: options.auto_ack,
            positions: HashMap::new(),
        }))
    }

    async fn server_info(&self) -> Result<BTreeMap<String, String>, BrokerError> {
        require_link(&self.connections)?;
        let topics = self.broker.state.lock().topics.len();
        Ok(BTreeMap::from([
            ("brokers".to_string(), "1".to_string()),
            ("topics".to_string(), topics.to_string()),
        ]))
    }
}

struct LogSubscription {
    broker: InMemoryLogBroker,
    link: Arc<MemoryLink>,
    topics: Vec<String>,
    group: String,
    auto_commit: bool,
    /// Local read positions; they run ahead of the committed offsets until
    /// messages are settled.
    positions: HashMap<(String, i32), i64>,
}

impl LogSubscription {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if !self.link.is_open() {
            return Err(ConnectionError::unreachable(ENDPOINT, "connection closed").into());
        }
        self.broker.faults.check(ENDPOINT)
    }

    fn take_next(&mut self) -> Option<RawMessage> {
        let mut state = self.broker.state.lock();
        for topic in &self.topics {
            for partition in 0..state.partition_count(topic) {
                let position = *self
                    .positions
                    .entry((topic.clone(), partition))
                    .or_insert_with(|| state.committed(&self.group, topic, partition));
                if let Some(raw) = state.record_at(topic, partition, position) {
                    self.positions.insert((topic.clone(), partition), position + 1);
                    if self.auto_commit {
                        state.commit(&self.group, topic, partition, position + 1);
                    }
                    return Some(raw);
                }
            }
        }
        None
    }
}

#[async_trait]
impl Subscription for LogSubscription {
    async fn next(&mut self, timeout: Duration) -> Result<Option<RawMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let notify = Arc::clone(&self.broker.notify);

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            if let Some(raw) = self.take_next() {
                return Ok(Some(raw));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn settle(
        &mut self,
        message: &RawMessage,
        decision: AckDecision,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let BrokerMetadata::Log { partition, offset } = message.metadata else {
            return Err(BrokerError::UnknownDelivery(message.metadata.to_string()));
        };

        match decision {
            AckDecision::Ack | AckDecision::Reject => {
                if decision == AckDecision::Reject {
                    warn!(
                        "Skipping past rejected message at {} [{}]",
                        message.source, message.metadata
                    );
                }
                self.broker
                    .state
                    .lock()
                    .commit(&self.group, &message.source, partition, offset + 1);
            }
            AckDecision::Requeue => {
                self.positions
                    .insert((message.source.clone(), partition), offset);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(id: &str, key: Option<&str>) -> PublishMetadata {
        PublishMetadata {
            message_id: id.to_string(),
            key: key.map(str::to_string),
            priority: None,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn keyed_records_share_a_partition() {
        let broker = InMemoryLogBroker::new().with_default_partitions(4);
        let adapter = broker.adapter();
        adapter.connect().await.unwrap();
        let unit = AddressableUnit::topic("orders");
        adapter.declare_unit(&unit).await.unwrap();

        let mut partitions = Vec::new();
        for id in ["a", "b", "c"] {
            match adapter
                .publish(&unit, b"{}", &metadata(id, Some("customer-1")))
                .await
                .unwrap()
            {
                BrokerMetadata::Log { partition, .. } => partitions.push(partition),
                other => panic!("unexpected metadata {other:?}"),
            }
        }
        assert!(partitions.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn poll_commits_what_it_returns() {
        let broker = InMemoryLogBroker::new();
        let adapter = broker.adapter();
        adapter.connect().await.unwrap();
        let unit = AddressableUnit::topic("audit");
        for id in ["1", "2", "3"] {
            adapter.publish(&unit, b"{}", &metadata(id, None)).await.unwrap();
        }

        let first = adapter
            .poll(&[unit.clone()], "g", 2, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(broker.committed_offset("g", "audit", 0), 2);

        let rest = adapter
            .poll(&[unit.clone()], "g", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].message_id.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn poll_times_out_empty() {
        let broker = InMemoryLogBroker::new();
        let adapter = broker.adapter();
        adapter.connect().await.unwrap();
        let started = Instant::now();
        let taken = adapter
            .poll(
                &[AddressableUnit::topic("quiet")],
                "g",
                1,
                Duration::from_millis(80),
            )
            .await
            .unwrap();
        assert!(taken.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn requeue_redelivers_same_offset() {
        let broker = InMemoryLogBroker::new();
        let adapter = broker.adapter();
        adapter.connect().await.unwrap();
        let unit = AddressableUnit::topic("jobs");
        adapter.publish(&unit, b"{}", &metadata("only", None)).await.unwrap();

        let mut subscription = adapter
            .subscribe(&[unit], "workers", &ConsumerOptions::default())
            .await
            .unwrap();
        let first = subscription
            .next(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        subscription.settle(&first, AckDecision::Requeue).await.unwrap();
        assert_eq!(broker.committed_offset("workers", "jobs", 0), 0);

        let again = subscription
            .next(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.metadata, first.metadata);
        subscription.settle(&again, AckDecision::Ack).await.unwrap();
        assert_eq!(broker.committed_offset("workers", "jobs", 0), 1);
    }

    #[tokio::test]
    async fn declare_rejects_zero_partitions() {
        let broker = InMemoryLogBroker::new();
        let adapter = broker.adapter();
        adapter.connect().await.unwrap();
        let err = adapter
            .declare_unit(&TopicSpec::new("bad").partitions(0).into())
            .await
            .unwrap_err();
        match err {
            BrokerError::Topology(err) => assert_eq!(err.step, TopologyStep::CreateTopic),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_connect_is_a_connection_error() {
        let adapter = InMemoryLogBroker::new().adapter();
        let err = adapter
            .publish(&AddressableUnit::topic("t"), b"{}", &metadata("x", None))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn unknown_topic_is_rejected_without_auto_create() {
        let adapter = InMemoryLogBroker::new().without_auto_create().adapter();
        adapter.connect().await.unwrap();
        let err = adapter
            .publish(&AddressableUnit::topic("nope"), b"{}", &metadata("x", None))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Publish(_)));
    }
}
