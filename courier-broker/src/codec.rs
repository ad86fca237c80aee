//! JSON wire format.
//!
//! Bodies travel as UTF-8 JSON objects. The producer injects its timestamp
//! into the object under `timestamp`; decoding lifts it back out so the body a
//! consumer sees matches the body that was published.

use chrono::{DateTime, Utc};
use courier_models::{MalformedMessage, Message, MessageParts, ReceivedMessage};
use serde_json::Value;

use crate::errors::BrokerError;
use crate::types::RawMessage;

pub const TIMESTAMP_FIELD: &str = "timestamp";

pub fn encode(message: &Message) -> Result<Vec<u8>, BrokerError> {
    let mut body = message.body.clone();
    if let Some(timestamp) = message.timestamp() {
        body.insert(
            TIMESTAMP_FIELD.to_string(),
            Value::String(timestamp.to_rfc3339()),
        );
    }
    serde_json::to_vec(&body).map_err(|source| BrokerError::Serialization {
        message_id: message.id().to_string(),
        source,
    })
}

pub fn decode(raw: RawMessage) -> Result<ReceivedMessage, MalformedMessage> {
    let mut body = match serde_json::from_slice::<Value>(&raw.payload) {
        Ok(Value::Object(body)) => body,
        Ok(_) => return Err(malformed(raw, "payload is not a JSON object".into())),
        Err(err) => return Err(malformed(raw, err.to_string())),
    };

    let timestamp = match body.get(TIMESTAMP_FIELD) {
        Some(Value::String(value)) => DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        _ => None,
    };
    // a foreign timestamp we cannot parse stays in the body
    if timestamp.is_some() {
        body.remove(TIMESTAMP_FIELD);
    }

    let id = raw
        .message_id
        .clone()
        .unwrap_or_else(|| format!("{}@{}", raw.source, raw.metadata));

    let message = Message::from_parts(MessageParts {
        id,
        body,
        key: raw.key,
        priority: raw.priority,
        timestamp,
    });

    Ok(ReceivedMessage {
        message,
        source: raw.source,
        metadata: raw.metadata,
    })
}

fn malformed(raw: RawMessage, error: String) -> MalformedMessage {
    MalformedMessage {
        source: raw.source,
        message_id: raw.message_id,
        metadata: raw.metadata,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_models::{BrokerMetadata, MessageBody};
    use serde_json::json;

    fn raw(payload: &[u8], message_id: Option<&str>) -> RawMessage {
        RawMessage {
            source: "events.page_view".into(),
            payload: payload.to_vec(),
            message_id: message_id.map(str::to_string),
            key: Some("user-7".into()),
            priority: None,
            metadata: BrokerMetadata::Log {
                partition: 0,
                offset: 3,
            },
        }
    }

    #[test]
    fn timestamp_is_injected_and_lifted_back_out() {
        let body: MessageBody = json!({"title": "hi", "count": 2})
            .as_object()
            .cloned()
            .unwrap();
        let mut message = Message::with_id("abc", body.clone());
        let now = Utc::now();
        message.stamp(now);

        let bytes = encode(&message).unwrap();
        let wire: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(wire["timestamp"], json!(now.to_rfc3339()));

        let received = decode(raw(&bytes, Some("abc"))).unwrap();
        assert_eq!(received.message.id(), "abc");
        assert_eq!(received.message.body, body);
        assert_eq!(received.message.timestamp(), Some(now));
        assert_eq!(received.message.key.as_deref(), Some("user-7"));
    }

    #[test]
    fn invalid_json_is_reported_not_raised() {
        let err = decode(raw(b"{not json", Some("bad"))).unwrap_err();
        assert_eq!(err.message_id.as_deref(), Some("bad"));
        assert_eq!(err.source, "events.page_view");
    }

    #[test]
    fn non_object_payload_is_malformed() {
        let err = decode(raw(b"[1,2,3]", None)).unwrap_err();
        assert_eq!(err.error, "payload is not a JSON object");
    }

    #[test]
    fn unparseable_timestamp_stays_in_body() {
        let received = decode(raw(br#"{"timestamp": "yesterday"}"#, None)).unwrap();
        assert_eq!(received.message.timestamp(), None);
        assert_eq!(received.message.body["timestamp"], json!("yesterday"));
        assert_eq!(
            received.message.id(),
            "events.page_view@partition: 0, offset: 3"
        );
    }
}
