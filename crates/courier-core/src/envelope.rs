use crate::error::CourierResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The data unit exchanged over a queue.
///
/// An envelope carries only data: an opaque payload, the name of the worker
/// that produced it, string metadata and an optional correlation id. The
/// receiver selects behaviour by its own worker name, never from the envelope.
///
/// Envelopes are immutable once built; the `with_*` builders consume `self`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    message_id: Uuid,
    #[serde(with = "payload_base64")]
    payload: Vec<u8>,
    sender: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl Envelope {
    /// Creates an envelope around raw bytes.
    pub fn new(payload: impl Into<Vec<u8>>, sender: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            payload: payload.into(),
            sender: sender.into(),
            metadata: BTreeMap::new(),
            correlation_id: None,
            created_at: Utc::now(),
        }
    }

    /// Creates an envelope around UTF-8 text content.
    pub fn text(content: impl Into<String>, sender: impl Into<String>) -> Self {
        Self::new(content.into().into_bytes(), sender)
    }

    /// Adds (or replaces) one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Merges a whole metadata map, later entries winning.
    pub fn with_metadata_map(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Tags the envelope with a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Replaces the sender.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    /// Unique id of this envelope.
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// The opaque payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload interpreted as UTF-8, replacing invalid sequences.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Name of the worker (or `"system"`) that produced this envelope.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// String metadata.
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// The correlation id, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Creation timestamp (UTC).
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Serializes the envelope to the JSON wire body.
    pub fn to_bytes(&self) -> CourierResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses an envelope from a JSON wire body.
    pub fn from_bytes(body: &[u8]) -> CourierResult<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_text_envelope() {
        let env = Envelope::text("Latest developments in AI", "system")
            .with_metadata("type", "news_query")
            .with_correlation_id("run-1");
        assert_eq!(env.payload_str(), "Latest developments in AI");
        assert_eq!(env.sender(), "system");
        assert_eq!(env.metadata().get("type").map(String::as_str), Some("news_query"));
        assert_eq!(env.correlation_id(), Some("run-1"));
    }

    #[test]
    fn test_payload_is_base64_on_the_wire() {
        let env = Envelope::new(vec![0u8, 159, 146, 150], "gatherer");
        let body = env.to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["payload"], "AJ+Slg==");
        assert!(json.get("correlation_id").is_none());

        let back = Envelope::from_bytes(&body).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_rejects_garbage_body() {
        assert!(Envelope::from_bytes(b"not an envelope").is_err());
    }

    #[test]
    fn test_metadata_map_merge_overrides() {
        let mut extra = BTreeMap::new();
        extra.insert("type".to_string(), "article_content".to_string());
        let env = Envelope::text("x", "writer")
            .with_metadata("type", "news_query")
            .with_metadata_map(extra);
        assert_eq!(env.metadata()["type"], "article_content");
    }
}
