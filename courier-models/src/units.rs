use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange routing strategy on the queue broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topic on the log broker. Partition count and replication factor only
/// matter when the topic is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_factor: Option<i32>,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: None,
            replication_factor: None,
        }
    }

    pub fn partitions(mut self, partitions: i32) -> Self {
        self.partitions = Some(partitions);
        self
    }

    pub fn replication_factor(mut self, replication_factor: i32) -> Self {
        self.replication_factor = Some(replication_factor);
        self
    }
}

/// Exchange, queue and the binding between them on the queue broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub exchange_kind: ExchangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_exchange: Option<String>,
    /// Declares the queue as a priority queue (`x-max-priority`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority: Option<u8>,
}

impl QueueBinding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        exchange_kind: ExchangeKind,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            exchange_kind,
            dead_letter_exchange: None,
            max_priority: None,
        }
    }

    pub fn dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = Some(max_priority);
        self
    }
}

/// Named destination or source of messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AddressableUnit {
    Topic(TopicSpec),
    Queue(QueueBinding),
}

impl AddressableUnit {
    pub fn topic(name: impl Into<String>) -> Self {
        AddressableUnit::Topic(TopicSpec::new(name))
    }

    /// Topic name for the log broker, queue name for the queue broker.
    pub fn name(&self) -> &str {
        match self {
            AddressableUnit::Topic(topic) => &topic.name,
            AddressableUnit::Queue(binding) => &binding.queue,
        }
    }
}

impl From<TopicSpec> for AddressableUnit {
    fn from(spec: TopicSpec) -> Self {
        AddressableUnit::Topic(spec)
    }
}

impl From<QueueBinding> for AddressableUnit {
    fn from(binding: QueueBinding) -> Self {
        AddressableUnit::Queue(binding)
    }
}

impl fmt::Display for AddressableUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressableUnit::Topic(topic) => write!(f, "topic {}", topic.name),
            AddressableUnit::Queue(binding) => write!(
                f,
                "{}/{} ({})",
                binding.exchange, binding.queue, binding.routing_key
            ),
        }
    }
}
