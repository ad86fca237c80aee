use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_models::{AckDecision, AddressableUnit, BrokerMetadata, ExchangeKind, QueueBinding};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{require_link, Faults, MemoryDialer, MemoryLink};
use crate::connection::{ConnectionManager, ConnectionStrategy};
use crate::errors::{BrokerError, ConnectionError, TopologyError, TopologyStep};
use crate::types::{ConsumerOptions, PublishMetadata, RawMessage};
use crate::{BrokerAdapter, Subscription};

const ENDPOINT: &str = "memory://queue";
const DEFAULT_EXCHANGE: &str = "";

#[derive(Clone)]
struct Envelope {
    payload: Vec<u8>,
    message_id: Option<String>,
    routing_key: String,
    priority: Option<u8>,
}

struct Queue {
    messages: VecDeque<Envelope>,
    dead_letter_exchange: Option<String>,
    max_priority: Option<u8>,
}

impl Queue {
    /// Highest effective priority first when the queue is a priority queue,
    /// FIFO among equals.
    fn pop(&mut self) -> Option<Envelope> {
        let Some(max_priority) = self.max_priority else {
            return self.messages.pop_front();
        };
        let effective = |envelope: &Envelope| envelope.priority.unwrap_or(0).min(max_priority);
        let mut best: Option<(usize, u8)> = None;
        for (index, envelope) in self.messages.iter().enumerate() {
            let priority = effective(envelope);
            if best.map_or(true, |(_, current)| priority > current) {
                best = Some((index, priority));
            }
        }
        best.and_then(|(index, _)| self.messages.remove(index))
    }
}

struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Default)]
struct QueueState {
    exchanges: BTreeMap<String, ExchangeKind>,
    queues: BTreeMap<String, Queue>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, (String, Envelope)>,
    next_tag: u64,
}

impl QueueState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, String> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let kind = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| format!("NOT_FOUND - no exchange '{exchange}' in vhost '/'"))?;
        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Fanout => true,
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, targets: &[String], envelope: &Envelope) {
        for target in targets {
            if let Some(queue) = self.queues.get_mut(target) {
                queue.messages.push_back(envelope.clone());
            }
        }
    }

    /// Pop the next message of `queue`. Unless `auto_ack` is set it stays
    /// outstanding under its delivery tag until settled.
    fn deliver(&mut self, queue_name: &str, auto_ack: bool) -> Option<RawMessage> {
        let envelope = self.queues.get_mut(queue_name)?.pop()?;
        self.next_tag += 1;
        let delivery_tag = self.next_tag;

        let raw = RawMessage {
            source: queue_name.to_string(),
            payload: envelope.payload.clone(),
            message_id: envelope.message_id.clone(),
            key: Some(envelope.routing_key.clone()),
            priority: envelope.priority,
            metadata: BrokerMetadata::Queue { delivery_tag },
        };
        if !auto_ack {
            self.unacked
                .insert(delivery_tag, (queue_name.to_string(), envelope));
        }
        Some(raw)
    }

    fn requeue(&mut self, delivery_tag: u64) -> bool {
        let Some((queue_name, envelope)) = self.unacked.remove(&delivery_tag) else {
            return false;
        };
        if let Some(queue) = self.queues.get_mut(&queue_name) {
            queue.messages.push_front(envelope);
        }
        true
    }

    /// Route a rejected message through its queue's dead-letter exchange, or
    /// drop it when none is configured.
    fn dead_letter(&mut self, queue_name: &str, envelope: Envelope) {
        let Some(exchange) = self
            .queues
            .get(queue_name)
            .and_then(|queue| queue.dead_letter_exchange.clone())
        else {
            debug!("Dropping rejected message from {}", queue_name);
            return;
        };
        match self.route(&exchange, &envelope.routing_key) {
            Ok(targets) => self.enqueue(&targets, &envelope),
            Err(reason) => warn!("Dead-lettering from {} failed: {}", queue_name, reason),
        }
    }
}

/// Does a topic-exchange binding pattern match a routing key? `*` stands for
/// exactly one word and `#` for zero or more.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&first, tail)) => (word == "*" || word == first) && matches(rest, tail),
                None => false,
            },
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

/// Exchange/queue broker with per-message acknowledgement and dead-lettering.
///
/// Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryQueueBroker {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    faults: Arc<Faults>,
}

impl InMemoryQueueBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adapter(&self) -> InMemoryQueueAdapter {
        InMemoryQueueAdapter {
            broker: self.clone(),
            connections: ConnectionManager::new(
                MemoryDialer::new(ENDPOINT, Arc::clone(&self.faults)),
                Duration::from_secs(10),
            ),
            strategy: ConnectionStrategy::PerCall,
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.faults.set_reachable(reachable);
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        self.faults.set_dial_delay(delay);
    }

    /// Delay publisher confirms. Messages are routed before the delay starts.
    pub fn set_ack_delay(&self, delay: Duration) {
        self.faults.set_ack_delay(delay);
    }

    /// Put bytes straight onto a queue as a foreign publisher would.
    pub fn push_raw(&self, queue: &str, payload: impl Into<Vec<u8>>) -> bool {
        let envelope = Envelope {
            payload: payload.into(),
            message_id: None,
            routing_key: queue.to_string(),
            priority: None,
        };
        let pushed = match self.state.lock().queues.get_mut(queue) {
            Some(target) => {
                target.messages.push_back(envelope);
                true
            }
            None => false,
        };
        if pushed {
            self.notify.notify_waiters();
        }
        pushed
    }

    /// Messages ready for delivery, not counting unacknowledged ones.
    pub fn depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.messages.len())
            .unwrap_or(0)
    }

    pub fn unacked(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.state.lock().exchanges.get(exchange).copied()
    }
}

pub struct InMemoryQueueAdapter {
    broker: InMemoryQueueBroker,
    connections: ConnectionManager<MemoryDialer>,
    strategy: ConnectionStrategy,
}

impl InMemoryQueueAdapter {
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

    fn binding<'a>(&self, unit: &'a AddressableUnit) -> Result<&'a QueueBinding, BrokerError> {
        match unit {
            AddressableUnit::Queue(binding) => Ok(binding),
            other => Err(BrokerError::UnsupportedUnit {
                unit: other.to_string(),
                broker: self.kind(),
            }),
        }
    }

    fn queue_names(&self, units: &[AddressableUnit]) -> Result<Vec<String>, BrokerError> {
        let names: Vec<String> = units
            .iter()
            .map(|unit| self.binding(unit).map(|binding| binding.queue.clone()))
            .collect::<Result<_, _>>()?;

        let state = self.broker.state.lock();
        if let Some(missing) = names.iter().find(|name| !state.queues.contains_key(*name)) {
            return Err(BrokerError::Consume(format!(
                "NOT_FOUND - no queue '{missing}' in vhost '/'"
            )));
        }
        Ok(names)
    }

    fn declare_exchange(
        &self,
        state: &mut QueueState,
        binding: &QueueBinding,
    ) -> Result<(), TopologyError> {
        if binding.exchange == DEFAULT_EXCHANGE {
            return Ok(());
        }
        match state.exchanges.get(&binding.exchange) {
            Some(current) if *current != binding.exchange_kind => Err(TopologyError::new(
                TopologyStep::DeclareExchange,
                &binding.exchange,
                format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': \
                     received '{}' but current is '{}'",
                    binding.exchange, binding.exchange_kind, current
                ),
            )),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(binding.exchange.clone(), binding.exchange_kind);
                Ok(())
            }
        }
    }

    fn declare_queue(
        &self,
        state: &mut QueueState,
        binding: &QueueBinding,
    ) -> Result<(), TopologyError> {
        match state.queues.get(&binding.queue) {
            Some(current)
                if current.dead_letter_exchange != binding.dead_letter_exchange
                    || current.max_priority != binding.max_priority =>
            {
                Err(TopologyError::new(
                    TopologyStep::DeclareQueue,
                    &binding.queue,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                        binding.queue
                    ),
                ))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    binding.queue.clone(),
                    Queue {
                        messages: VecDeque::new(),
                        dead_letter_exchange: binding.dead_letter_exchange.clone(),
                        max_priority: binding.max_priority,
                    },
                );
                Ok(())
            }
        }
    }

    fn bind_queue(&self, state: &mut QueueState, binding: &QueueBinding) {
        if binding.exchange == DEFAULT_EXCHANGE {
            return;
        }
        let exists = state.bindings.iter().any(|existing| {
            existing.exchange == binding.exchange
                && existing.queue == binding.queue
                && existing.routing_key == binding.routing_key
        });
        if !exists {
            state.bindings.push(Binding {
                exchange: binding.exchange.clone(),
                queue: binding.queue.clone(),
                routing_key: binding.routing_key.clone(),
            });
        }
    }
}

#[async_trait]
impl BrokerAdapter for InMemoryQueueAdapter {
    fn kind(&self) -> &'static str {
        "memory-queue"
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
        let binding = self.binding(unit)?;
        require_link(&self.connections)?;

        let mut state = self.broker.state.lock();
        self.declare_exchange(&mut state, binding)?;
        self.declare_queue(&mut state, binding)?;
        self.bind_queue(&mut state, binding);
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<String>, BrokerError> {
        require_link(&self.connections)?;
        Ok(self.broker.state.lock().queues.keys().cloned().collect())
    }

    /// Deleting a queue that is already gone succeeds.
    async fn delete_unit(&self, unit: &AddressableUnit) -> Result<(), BrokerError> {
        let binding = self.binding(unit)?;
        require_link(&self.connections)?;

        let mut state = self.broker.state.lock();
        state.queues.remove(&binding.queue);
        state.bindings.retain(|existing| existing.queue != binding.queue);
        Ok(())
    }

    async fn publish(
        &self,
        unit: &AddressableUnit,
        payload: &[u8],
        metadata: &PublishMetadata,
    ) -> Result<BrokerMetadata, BrokerError> {
        let binding = self.binding(unit)?;
        let link = require_link(&self.connections)?;

        let envelope = Envelope {
            payload: payload.to_vec(),
            message_id: Some(metadata.message_id.clone()),
            routing_key: metadata
                .key
                .clone()
                .unwrap_or_else(|| binding.routing_key.clone()),
            priority: metadata.priority,
        };
        {
            let mut state = self.broker.state.lock();
            let targets = state
                .route(&binding.exchange, &envelope.routing_key)
                .map_err(BrokerError::Publish)?;
            if targets.is_empty() {
                debug!(
                    "Message {} to {} matched no queue",
                    metadata.message_id, binding.exchange
                );
            }
            state.enqueue(&targets, &envelope);
        }
        self.broker.notify.notify_waiters();

        let delay = self.broker.faults.ack_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(BrokerMetadata::Queue {
            delivery_tag: link.next_publish_seq(),
        })
    }

    async fn poll(
        &self,
        units: &[AddressableUnit],
        _group: &str,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            require_link(&self.connections)?;
            let queues = self.queue_names(units)?;
            let mut taken = Vec::new();
            {
                let mut state = self.broker.state.lock();
                for queue in &queues {
                    while taken.len() < max_messages {
                        match state.deliver(queue, true) {
                            Some(raw) => taken.push(raw),
                            None => break,
                        }
                    }
                }
            }
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
        _group: &str,
        options: &ConsumerOptions,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let link = require_link(&self.connections)?;
        let queues = self.queue_names(units)?;
        Ok(Box::new(QueueSubscription {
            broker: self.broker.clone(),
            link,
            queues,
            auto_ack: options.auto_ack,
            prefetch: usize::from(options.prefetch.max(1)),
            outstanding: HashSet::new(),
        }))
    }

    async fn server_info(&self) -> Result<BTreeMap<String, String>, BrokerError> {
        require_link(&self.connections)?;
        let state = self.broker.state.lock();
        Ok(BTreeMap::from([
            ("product".to_string(), "in-memory queue broker".to_string()),
            ("exchanges".to_string(), state.exchanges.len().to_string()),
            ("queues".to_string(), state.queues.len().to_string()),
        ]))
    }
}

struct QueueSubscription {
    broker: InMemoryQueueBroker,
    link: Arc<MemoryLink>,
    queues: Vec<String>,
    auto_ack: bool,
    prefetch: usize,
    outstanding: HashSet<u64>,
}

impl QueueSubscription {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if !self.link.is_open() {
            return Err(ConnectionError::unreachable(ENDPOINT, "channel closed").into());
        }
        self.broker.faults.check(ENDPOINT)
    }

    fn take_next(&mut self) -> Option<RawMessage> {
        if !self.auto_ack && self.outstanding.len() >= self.prefetch {
            return None;
        }
        let mut state = self.broker.state.lock();
        for queue in &self.queues {
            if let Some(raw) = state.deliver(queue, self.auto_ack) {
                if let BrokerMetadata::Queue { delivery_tag } = raw.metadata {
                    if !self.auto_ack {
                        self.outstanding.insert(delivery_tag);
                    }
                }
                return Some(raw);
            }
        }
        None
    }
}

#[async_trait]
impl Subscription for QueueSubscription {
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
        let BrokerMetadata::Queue { delivery_tag } = message.metadata else {
            return Err(BrokerError::UnknownDelivery(message.metadata.to_string()));
        };
        if !self.outstanding.remove(&delivery_tag) {
            return Err(BrokerError::UnknownDelivery(format!(
                "delivery tag {delivery_tag}"
            )));
        }

        {
            let mut state = self.broker.state.lock();
            match decision {
                AckDecision::Ack => {
                    state.unacked.remove(&delivery_tag);
                }
                AckDecision::Requeue => {
                    state.requeue(delivery_tag);
                }
                AckDecision::Reject => {
                    if let Some((queue, envelope)) = state.unacked.remove(&delivery_tag) {
                        state.dead_letter(&queue, envelope);
                    }
                }
            }
        }
        if decision != AckDecision::Ack {
            self.broker.notify.notify_waiters();
        }
        Ok(())
    }
}

impl Drop for QueueSubscription {
    /// Unsettled deliveries go back to their queues, as when a consumer's
    /// channel closes.
    fn drop(&mut self) {
        if self.outstanding.is_empty() {
            return;
        }
        {
            let mut state = self.broker.state.lock();
            for delivery_tag in self.outstanding.drain() {
                state.requeue(delivery_tag);
            }
        }
        self.broker.notify.notify_waiters();
    }
}
