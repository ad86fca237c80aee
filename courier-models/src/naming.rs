use serde::{Deserialize, Serialize};
use std::fmt;

use crate::units::{AddressableUnit, ExchangeKind, QueueBinding, TopicSpec};

/// Notification urgency and the broker priority it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationPriority::Low => "low",
            NotificationPriority::Medium => "medium",
            NotificationPriority::High => "high",
            NotificationPriority::Urgent => "urgent",
        }
    }

    pub fn broker_priority(&self) -> u8 {
        match self {
            NotificationPriority::Low => 3,
            NotificationPriority::Medium => 5,
            NotificationPriority::High => 7,
            NotificationPriority::Urgent => 9,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(NotificationPriority::Low),
            "medium" => Some(NotificationPriority::Medium),
            "high" => Some(NotificationPriority::High),
            "urgent" => Some(NotificationPriority::Urgent),
            _ => None,
        }
    }
}

impl Default for NotificationPriority {
    fn default() -> Self {
        NotificationPriority::Medium
    }
}

impl fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event categories published to the log broker, one topic each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserAction,
    SystemEvent,
    ApiCall,
    PageView,
    FileUpload,
    TaskExecution,
    Error,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::UserAction,
        EventType::SystemEvent,
        EventType::ApiCall,
        EventType::PageView,
        EventType::FileUpload,
        EventType::TaskExecution,
        EventType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserAction => "user_action",
            EventType::SystemEvent => "system_event",
            EventType::ApiCall => "api_call",
            EventType::PageView => "page_view",
            EventType::FileUpload => "file_upload",
            EventType::TaskExecution => "task_execution",
            EventType::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default names for topics, exchanges, queues and routing keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConvention {
    pub topic_prefix: String,
    pub exchange: String,
    pub queue_prefix: String,
    pub routing_prefix: String,
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self {
            topic_prefix: "events".into(),
            exchange: "notifications_exchange".into(),
            queue_prefix: "notifications".into(),
            routing_prefix: "notification".into(),
        }
    }
}

impl NamingConvention {
    /// `events.<event_type>`
    pub fn topic_for(&self, event_type: &str) -> String {
        format!("{}.{}", self.topic_prefix, event_type)
    }

    /// `notifications.<priority>`
    pub fn queue_for(&self, priority: NotificationPriority) -> String {
        format!("{}.{}", self.queue_prefix, priority)
    }

    /// `notification.<type>.<priority>`
    pub fn routing_key_for(&self, notification_type: &str, priority: NotificationPriority) -> String {
        format!("{}.{}.{}", self.routing_prefix, notification_type, priority)
    }

    pub fn event_unit(&self, event_type: &str) -> AddressableUnit {
        AddressableUnit::Topic(TopicSpec::new(self.topic_for(event_type)))
    }

    pub fn notification_unit(
        &self,
        notification_type: &str,
        priority: NotificationPriority,
    ) -> AddressableUnit {
        AddressableUnit::Queue(QueueBinding::new(
            self.exchange.clone(),
            self.queue_for(priority),
            self.routing_key_for(notification_type, priority),
            ExchangeKind::Direct,
        ))
    }
}
