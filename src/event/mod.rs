use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod validation;

pub use validation::{prepare, validate, validate_and_prepare, ValidationError};

/// Kind of a normalized analytics call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Track,
    Identify,
    Group,
    Page,
    Screen,
    Alias,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Track => "track",
            EventType::Identify => "identify",
            EventType::Group => "group",
            EventType::Page => "page",
            EventType::Screen => "screen",
            EventType::Alias => "alias",
        }
    }
}

/// Event represents one normalized analytics event.
///
/// Events are produced by the ingestion pipeline and are immutable once
/// prepared: mappings read from them, nothing writes back. The JSON shape is
/// the usual camelCase envelope (`userId`, `anonymousId`, `messageId`, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Event name for `track` calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    /// Page or screen name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// Previous identity for `alias` calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub traits: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub integrations: Map<String, Value>,

    /// Producer time, filled with the preparation time when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// UUIDv7 identifier, auto-generated if not provided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Top-level keys without a dedicated field (`receivedAt`, `sentAt`,
    /// `channel`, `version`, ...), kept so mappings can still reach them
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Creates a bare event of the given type. Mostly useful in tests and for
    /// synthesizing audience membership calls.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            event: None,
            name: None,
            user_id: None,
            anonymous_id: None,
            group_id: None,
            previous_id: None,
            traits: Map::new(),
            properties: Map::new(),
            context: Map::new(),
            integrations: Map::new(),
            timestamp: None,
            message_id: None,
            extra: Map::new(),
        }
    }

    /// Fills in `messageId` and `timestamp` when they are missing.
    pub fn prepare(&mut self) {
        validation::prepare(self)
    }

    /// Ingestion check: identity and type-specific requirements, then
    /// `prepare`. Dispatch only prepares.
    pub fn validate_and_prepare(&mut self) -> Result<(), ValidationError> {
        validation::validate_and_prepare(self)
    }

    /// JSON view of the event used as the root of every mapping.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
