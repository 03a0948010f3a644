//! Message envelope
//!
//! Every event that crosses the bus is wrapped in an [`Envelope`]. Producers
//! only supply a topic and a payload; the bus stamps the id, timestamp, source
//! and partition key. An envelope cannot be mutated once built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload fields checked, in order, when deriving a partition key.
pub const PARTITION_KEY_FIELDS: [&str; 4] = ["userId", "user_id", "ownerId", "owner_id"];

/// Event envelope exchanged across the bus.
///
/// Serialized form (camelCase JSON):
///
/// ```json
/// {
///   "id": "018f...",
///   "topic": "file.uploaded",
///   "payload": { "fileId": "f1", "userId": "u1" },
///   "timestamp": "2024-05-01T10:00:00Z",
///   "source": "in-process",
///   "partitionKey": "u1"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    id: Uuid,

    #[serde(alias = "eventType")]
    topic: String,

    #[serde(default)]
    payload: serde_json::Value,

    timestamp: DateTime<Utc>,

    source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    partition_key: Option<String>,
}

impl Envelope {
    /// Build an envelope for `topic`, stamped now by `source`.
    ///
    /// The partition key is derived from the payload.
    pub(crate) fn stamp(
        topic: impl Into<String>,
        payload: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        let partition_key = derive_partition_key(&payload);
        Self {
            id: Uuid::now_v7(),
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            source: source.into(),
            partition_key,
        }
    }

    /// Unique event ID, usable as an idempotency key by consumers.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Topic the event was published to (`<resource>.<action>`).
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Producer-supplied payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Time the bus accepted the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Transport or service that emitted the event.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Key pinning related events to one partition, when the payload has one.
    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    /// Parse the payload into a specific type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Serialize to the wire form.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Derive a partition key from a payload.
///
/// Looks at [`PARTITION_KEY_FIELDS`] in order and accepts string or numeric
/// values. Anything else yields `None`.
pub fn derive_partition_key(payload: &serde_json::Value) -> Option<String> {
    let object = payload.as_object()?;
    PARTITION_KEY_FIELDS.iter().find_map(|field| match object.get(*field)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stamp_sets_bus_fields() {
        let before = Utc::now();
        let envelope = Envelope::stamp("file.uploaded", json!({"fileId": "f1"}), "in-process");

        assert_eq!(envelope.topic(), "file.uploaded");
        assert_eq!(envelope.source(), "in-process");
        assert_eq!(envelope.payload()["fileId"], "f1");
        assert!(envelope.timestamp() >= before);
        assert!(envelope.partition_key().is_none());
    }

    #[test]
    fn test_partition_key_from_user() {
        assert_eq!(
            derive_partition_key(&json!({"fileId": "f1", "userId": "u1"})),
            Some("u1".to_string())
        );
        assert_eq!(
            derive_partition_key(&json!({"owner_id": 42})),
            Some("42".to_string())
        );
        // userId wins over ownerId
        assert_eq!(
            derive_partition_key(&json!({"ownerId": "o", "userId": "u"})),
            Some("u".to_string())
        );
        assert_eq!(derive_partition_key(&json!({"userId": ""})), None);
        assert_eq!(derive_partition_key(&json!({"userId": null})), None);
        assert_eq!(derive_partition_key(&json!("not an object")), None);
    }

    #[test]
    fn test_wire_format() {
        let envelope = Envelope::stamp("file.deleted", json!({"userId": "u7"}), "api-1");
        let value: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();

        assert_eq!(value["topic"], "file.deleted");
        assert_eq!(value["source"], "api-1");
        assert_eq!(value["partitionKey"], "u7");
        assert_eq!(value["payload"]["userId"], "u7");
        assert!(value["timestamp"].as_str().unwrap().contains('T'));

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_accepts_event_type_alias() {
        let raw = json!({
            "id": Uuid::now_v7(),
            "eventType": "folder.created",
            "payload": {"folderId": "d1"},
            "timestamp": "2024-05-01T10:00:00Z",
            "source": "legacy"
        });
        let envelope = Envelope::decode(raw.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.topic(), "folder.created");
        assert!(envelope.partition_key().is_none());
    }

    #[test]
    fn test_parse_payload() {
        #[derive(Deserialize)]
        struct Uploaded {
            #[serde(rename = "fileId")]
            file_id: String,
        }

        let envelope = Envelope::stamp("file.uploaded", json!({"fileId": "f9"}), "test");
        let uploaded: Uploaded = envelope.parse_payload().unwrap();
        assert_eq!(uploaded.file_id, "f9");
    }
}
