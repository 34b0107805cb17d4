//! Event records, metadata and read filters.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version reported for a stream with no events.
pub const NO_STREAM: i64 = -1;

// =============================================================================
// Event IDs
// =============================================================================

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Event Metadata
// =============================================================================

/// Tracing and provenance information attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Correlation ID shared by every event of one logical request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// The event (or command) that caused this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// User or service that triggered this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,

    /// Additional context as JSON
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor_id = Some(actor.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

// =============================================================================
// Event
// =============================================================================

/// An immutable fact recorded in a stream.
///
/// `version` is assigned by the store on append; the value supplied by the
/// caller is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub stream_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

impl Event {
    /// New unversioned event for `stream_id`.
    pub fn new(stream_id: impl Into<String>, event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: EventId::new(),
            stream_id: stream_id.into(),
            event_type: event_type.into(),
            version: NO_STREAM,
            timestamp: Utc::now(),
            data,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Decode the payload into a typed value.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.data.clone())
    }
}

// =============================================================================
// Filters
// =============================================================================

/// Cross-stream read and subscription filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<String>,
    /// Inclusive lower version bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_version: Option<i64>,
    /// Inclusive upper version bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_version: Option<i64>,
    /// Inclusive lower time bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_time: Option<DateTime<Utc>>,
    /// Inclusive upper time bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types.push(event_type.into());
        self
    }

    pub fn versions(mut self, from: Option<i64>, to: Option<i64>) -> Self {
        self.from_version = from;
        self.to_version = to;
        self
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from_time = from;
        self.to_time = to;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` passes every predicate. `limit` is not considered.
    pub fn matches(&self, event: &Event) -> bool {
        if self.stream_id.as_ref().is_some_and(|s| *s != event.stream_id) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.iter().any(|t| *t == event.event_type) {
            return false;
        }
        if self.from_version.is_some_and(|v| event.version < v) {
            return false;
        }
        if self.to_version.is_some_and(|v| event.version > v) {
            return false;
        }
        if self.from_time.is_some_and(|t| event.timestamp < t) {
            return false;
        }
        if self.to_time.is_some_and(|t| event.timestamp > t) {
            return false;
        }
        true
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Cached point-in-time state of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub stream_id: String,
    /// Version of the last event folded into `state`.
    pub version: i64,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn new(stream_id: impl Into<String>, version: i64, state: serde_json::Value) -> Self {
        Self {
            stream_id: stream_id.into(),
            version,
            state,
            // stored with microsecond resolution
            created_at: Utc::now().trunc_subsecs(6),
        }
    }
}
