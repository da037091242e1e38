use super::{Event, EventType};
use chrono::Utc;
use std::fmt;
use uuid::Uuid;

/// Validation errors for Event
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    MissingIdentity,
    MissingEventName,
    MissingGroupId,
    MissingPreviousId,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingIdentity => {
                write!(f, "either userId or anonymousId is required")
            }
            ValidationError::MissingEventName => write!(f, "track events require an event name"),
            ValidationError::MissingGroupId => write!(f, "group events require a groupId"),
            ValidationError::MissingPreviousId => write!(f, "alias events require a previousId"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Checks an Event at ingestion.
///
/// Validation rules:
/// - Identity: a non-empty userId or anonymousId
/// - track: non-empty event name
/// - group: non-empty groupId
/// - alias: non-empty previousId
pub fn validate(event: &Event) -> Result<(), ValidationError> {
    if is_blank(&event.user_id) && is_blank(&event.anonymous_id) {
        return Err(ValidationError::MissingIdentity);
    }

    match event.event_type {
        EventType::Track if is_blank(&event.event) => Err(ValidationError::MissingEventName),
        EventType::Group if is_blank(&event.group_id) => Err(ValidationError::MissingGroupId),
        EventType::Alias if is_blank(&event.previous_id) => Err(ValidationError::MissingPreviousId),
        _ => Ok(()),
    }
}

/// Fills defaults before an Event is mapped.
///
/// - messageId: auto-generated UUIDv7 if missing or empty
/// - timestamp: set to now if missing
pub fn prepare(event: &mut Event) {
    if is_blank(&event.message_id) {
        event.message_id = Some(Uuid::now_v7().to_string());
    }

    if event.timestamp.is_none() {
        event.timestamp = Some(Utc::now());
    }
}

/// `validate`, then `prepare`.
pub fn validate_and_prepare(event: &mut Event) -> Result<(), ValidationError> {
    validate(event)?;
    prepare(event);
    Ok(())
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn test_is_blank() {
        assert!(is_blank(&None));
        assert!(is_blank(&Some(String::new())));
        assert!(is_blank(&Some("   ".to_string())));
        assert!(!is_blank(&Some("user-1".to_string())));
    }
}
