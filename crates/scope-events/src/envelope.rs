//! Event envelope and metadata
//!
//! Every event travels on the wire wrapped in an [`EventEnvelope`], which
//! pairs the domain event with the metadata generated at publish time.

use crate::bus::{EventBusError, EventBusResult};
use crate::types::AppEvent;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Schema version stamped on envelopes when the caller does not supply one.
pub const DEFAULT_SCHEMA_VERSION: &str = "1.0";

const EVENT_ID_SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Metadata attached to every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Event id, `<unix millis>-<random base36>`
    pub event_id: String,

    /// Correlation ID tying together a chain of related events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// ID of the event that caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// When the event was published
    pub timestamp: DateTime<Utc>,

    /// Name of the publishing service
    pub source: String,

    /// Envelope schema version
    pub version: String,
}

/// Caller-supplied metadata for [`publish`](crate::EventBus::publish).
///
/// Every field set here overrides the value the bus would generate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataOverrides {
    /// Replaces the generated event id
    pub event_id: Option<String>,
    /// Correlation ID to carry on the event
    pub correlation_id: Option<String>,
    /// ID of the causing event
    pub causation_id: Option<String>,
    /// Replaces the publish time
    pub timestamp: Option<DateTime<Utc>>,
    /// Replaces the publishing service's name
    pub source: Option<String>,
    /// Replaces [`DEFAULT_SCHEMA_VERSION`]
    pub version: Option<String>,
}

impl MetadataOverrides {
    /// Overrides carrying only a correlation ID.
    pub fn correlated(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Default::default()
        }
    }

    /// Overrides that continue the chain started by `cause`.
    ///
    /// The new event inherits the cause's correlation ID (or uses the
    /// cause's event id when it has none) and records the cause as its
    /// causation ID.
    pub fn caused_by(cause: &EventMetadata) -> Self {
        Self {
            correlation_id: Some(
                cause
                    .correlation_id
                    .clone()
                    .unwrap_or_else(|| cause.event_id.clone()),
            ),
            causation_id: Some(cause.event_id.clone()),
            ..Default::default()
        }
    }

    /// Set the causation ID.
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

impl EventMetadata {
    /// Build metadata for an event published by `source`.
    ///
    /// # Arguments
    ///
    /// * `source` - Name of the publishing service
    /// * `overrides` - Caller-supplied fields; each one wins over the
    ///   generated id, timestamp, source and version
    pub fn generate(source: &str, overrides: Option<MetadataOverrides>) -> Self {
        let overrides = overrides.unwrap_or_default();
        Self {
            event_id: overrides.event_id.unwrap_or_else(generate_event_id),
            correlation_id: overrides.correlation_id,
            causation_id: overrides.causation_id,
            timestamp: overrides.timestamp.unwrap_or_else(Utc::now),
            source: overrides.source.unwrap_or_else(|| source.to_string()),
            version: overrides
                .version
                .unwrap_or_else(|| DEFAULT_SCHEMA_VERSION.to_string()),
        }
    }
}

/// Generate an event id: millisecond timestamp plus a random base36 suffix.
///
/// Collision-resistant within a deployment, not globally unique.
pub fn generate_event_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..EVENT_ID_SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}-{}", Utc::now().timestamp_millis(), suffix)
}

/// The unit serialized onto the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// The domain event, tagged with its `type`
    pub event: AppEvent,
    /// Metadata generated at publish time
    pub metadata: EventMetadata,
}

impl EventEnvelope {
    /// Pair an event with its metadata.
    pub fn new(event: AppEvent, metadata: EventMetadata) -> Self {
        Self { event, metadata }
    }

    /// Event type of the wrapped event.
    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> EventBusResult<String> {
        serde_json::to_string(self).map_err(|e| EventBusError::SerializationError(e.to_string()))
    }

    /// Serialize to JSON bytes (RabbitMQ message body).
    pub fn to_bytes(&self) -> EventBusResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| EventBusError::SerializationError(e.to_string()))
    }

    /// Parse an envelope received from the wire.
    pub fn from_json(payload: &str) -> EventBusResult<Self> {
        serde_json::from_str(payload).map_err(|e| EventBusError::SerializationError(e.to_string()))
    }

    /// Parse an envelope from a raw message body.
    pub fn from_bytes(payload: &[u8]) -> EventBusResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| EventBusError::SerializationError(e.to_string()))
    }
}
