use crate::error::{CourierError, CourierResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// AMQP limits queue names to a short string.
const MAX_QUEUE_NAME_LEN: usize = 255;

/// Name of a queue. One queue exists per worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Validates and wraps a queue name.
    ///
    /// Names must be non-empty, at most 255 bytes, and must not use the
    /// broker-reserved `amq.` prefix.
    pub fn new(name: impl Into<String>) -> CourierResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CourierError::Config("queue name must not be empty".into()));
        }
        if name.len() > MAX_QUEUE_NAME_LEN {
            return Err(CourierError::Config(format!(
                "queue name exceeds {MAX_QUEUE_NAME_LEN} bytes: {}",
                name.len()
            )));
        }
        if name.starts_with("amq.") {
            return Err(CourierError::Config(format!(
                "queue name '{name}' uses the reserved amq. prefix"
            )));
        }
        Ok(Self(name))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for QueueName {
    type Error = CourierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for QueueName {
    type Error = CourierError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

/// Identifier threading all envelopes of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// A fresh random correlation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_validation() {
        assert!(QueueName::new("gatherer").is_ok());
        assert!(QueueName::new("").is_err());
        assert!(QueueName::new("   ").is_err());
        assert!(QueueName::new("amq.gen-123").is_err());
        assert!(QueueName::new("x".repeat(256)).is_err());
        assert!(QueueName::new("x".repeat(255)).is_ok());
    }

    #[test]
    fn test_queue_name_serde_validates() {
        let name: QueueName = serde_json::from_str("\"writer\"").unwrap();
        assert_eq!(name.as_str(), "writer");
        assert!(serde_json::from_str::<QueueName>("\"\"").is_err());
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }
}
