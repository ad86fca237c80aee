use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Highest priority accepted by [`Message::with_priority`].
pub const MAX_PRIORITY: u8 = 9;

/// JSON object carried as the body of every message.
pub type MessageBody = Map<String, Value>;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("priority {0} is outside 0..=9")]
    PriorityOutOfRange(u8),
    #[error("message body must be a JSON object, got {0}")]
    BodyNotAnObject(&'static str),
    #[error("message body could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Unit of transmission shared by both broker kinds.
///
/// The identifier is fixed at construction. The timestamp is written by the
/// producer right before the message leaves the process, so whatever value a
/// caller sees before publishing is overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MessageRecord")]
pub struct Message {
    id: String,
    pub body: MessageBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
}

/// Serialized form of a [`Message`], validated before it becomes one.
#[derive(Deserialize)]
struct MessageRecord {
    id: String,
    body: MessageBody,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = MessageError;

    fn try_from(record: MessageRecord) -> Result<Self, Self::Error> {
        let mut message = Message::with_id(record.id, record.body);
        if let Some(priority) = record.priority {
            message = message.with_priority(priority)?;
        }
        message.key = record.key;
        message.timestamp = record.timestamp;
        Ok(message)
    }
}

/// Everything needed to rebuild a message that came back from a broker.
#[derive(Debug, Clone)]
pub struct MessageParts {
    pub id: String,
    pub body: MessageBody,
    pub key: Option<String>,
    pub priority: Option<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Build a message with a freshly generated identifier.
    pub fn new(body: MessageBody) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), body)
    }

    pub fn with_id(id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            id: id.into(),
            body,
            key: None,
            priority: None,
            timestamp: None,
        }
    }

    /// Build a message from any record that serializes to a JSON object.
    pub fn from_serializable<T>(value: &T) -> Result<Self, MessageError>
    where
        T: Serialize,
    {
        match serde_json::to_value(value)? {
            Value::Object(body) => Ok(Self::new(body)),
            other => Err(MessageError::BodyNotAnObject(value_kind(&other))),
        }
    }

    pub fn from_parts(parts: MessageParts) -> Self {
        Self {
            id: parts.id,
            body: parts.body,
            key: parts.key,
            priority: parts.priority.map(|value| value.min(MAX_PRIORITY)),
            timestamp: parts.timestamp,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Result<Self, MessageError> {
        if priority > MAX_PRIORITY {
            return Err(MessageError::PriorityOutOfRange(priority));
        }
        self.priority = Some(priority);
        Ok(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> Option<u8> {
        self.priority
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// Overwrite the send timestamp. Producers call this immediately before
    /// handing the message to a broker.
    pub fn stamp(&mut self, at: DateTime<Utc>) {
        self.timestamp = Some(at);
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> MessageBody {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = Message::new(MessageBody::new());
        let b = Message::new(MessageBody::new());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn priority_above_nine_is_rejected() {
        let err = Message::new(MessageBody::new()).with_priority(10).unwrap_err();
        assert!(matches!(err, MessageError::PriorityOutOfRange(10)));

        let message = Message::new(MessageBody::new()).with_priority(9).unwrap();
        assert_eq!(message.priority(), Some(9));
    }

    #[test]
    fn deserializing_checks_priority_bounds() {
        let err = serde_json::from_str::<Message>(r#"{"id":"x","body":{},"priority":42}"#)
            .unwrap_err();
        assert!(err.to_string().contains("priority 42 is outside 0..=9"), "{err}");

        let message: Message =
            serde_json::from_str(r#"{"id":"x","body":{"a":1},"key":"k","priority":7}"#).unwrap();
        assert_eq!(message.id(), "x");
        assert_eq!(message.priority(), Some(7));
        assert_eq!(message.key.as_deref(), Some("k"));
    }

    #[test]
    fn stamp_overwrites_previous_value() {
        let mut message = Message::with_id("abc", body(json!({"title": "hi"})));
        let first = Utc::now() - chrono::Duration::hours(1);
        message.stamp(first);
        let second = Utc::now();
        message.stamp(second);
        assert_eq!(message.timestamp(), Some(second));
        assert_eq!(message.id(), "abc");
    }

    #[test]
    fn serializable_records_must_be_objects() {
        #[derive(Serialize)]
        struct PageView {
            path: String,
        }

        let message = Message::from_serializable(&PageView {
            path: "/home".into(),
        })
        .unwrap();
        assert_eq!(message.body["path"], json!("/home"));

        let err = Message::from_serializable(&vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, MessageError::BodyNotAnObject("array")));
    }
}
