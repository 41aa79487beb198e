use serde::Serialize;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Kind of an outbound message envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Data,
    Alert,
    Response,
    ResourcesReport,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    Significant,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reliability {
    BestEffort,
    GuaranteedDelivery,
}

/// Alert severity, most severe last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Normal,
    Significant,
    Critical,
}

/// An outbound message envelope. Immutable once constructed; the event time
/// is captured at construction, not at send time.
#[derive(Clone, Debug, Serialize)]
pub struct Message {
    pub id: String,
    pub source: String,
    pub priority: Priority,
    pub reliability: Reliability,
    #[serde(rename = "eventTime")]
    pub event_time: u64,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: Value,
}

impl Message {
    pub(crate) fn new(message_type: MessageType, source: &str, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.to_owned(),
            priority: Priority::Low,
            reliability: Reliability::BestEffort,
            event_time: epoch_millis(),
            message_type,
            payload,
        }
    }

    /// Builds one envelope per payload, in input order.
    pub(crate) fn batch(message_type: MessageType, source: &str, payloads: Vec<Value>) -> Vec<Self> {
        payloads
            .into_iter()
            .map(|payload| Message::new(message_type, source, payload))
            .collect()
    }
}

/// Payload input for the send operations: a single JSON value or an ordered
/// batch, normalized to a batch before envelopes are built.
#[derive(Clone, Debug)]
pub enum Data {
    Single(Value),
    Batch(Vec<Value>),
}

impl Data {
    pub(crate) fn into_items(self) -> Vec<Value> {
        match self {
            Data::Single(value) => vec![value],
            Data::Batch(values) => values,
        }
    }
}

impl From<Value> for Data {
    fn from(value: Value) -> Self {
        Data::Single(value)
    }
}

impl From<Vec<Value>> for Data {
    fn from(values: Vec<Value>) -> Self {
        Data::Batch(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_produces_one_envelope_per_payload() {
        let messages = Message::batch(
            MessageType::Data,
            "AAAA-0001",
            vec![json!({"a": 1}), json!({"a": 2})],
        );

        assert_eq!(messages.len(), 2);
        assert_ne!(messages[0].id, messages[1].id);
        for message in &messages {
            assert_eq!(message.source, "AAAA-0001");
            assert_eq!(message.message_type, MessageType::Data);
            assert_eq!(message.priority, Priority::Low);
            assert_eq!(message.reliability, Reliability::BestEffort);
            assert!(message.event_time > 0);
        }
    }

    #[test]
    fn envelope_serializes_with_wire_field_names() {
        let message = Message::new(MessageType::ResourcesReport, "AAAA-0001", json!({}));
        let wire = serde_json::to_value(&message).unwrap();

        assert_eq!(wire["type"], json!("RESOURCES_REPORT"));
        assert_eq!(wire["priority"], json!("LOW"));
        assert_eq!(wire["reliability"], json!("BEST_EFFORT"));
        assert!(wire["eventTime"].is_u64());
    }

    #[test]
    fn data_normalizes_single_values_to_a_batch() {
        assert_eq!(Data::from(json!({"a": 1})).into_items().len(), 1);
        assert_eq!(
            Data::from(vec![json!(1), json!(2), json!(3)]).into_items().len(),
            3
        );
    }
}
