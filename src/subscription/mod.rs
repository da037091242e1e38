//! Subscriptions route events to actions.
//!
//! A subscription pairs a condition written in a small FQL subset with the
//! action it triggers and an optional mapping that overrides the action's
//! field defaults.

pub mod fql;

use crate::mapping::{Mapping, MappingError};
use crate::settings::{Settings, SUBSCRIPTIONS_KEY};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub use fql::{Condition, FqlError, Operator};

/// Subscription as authored in settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub partner_action: String,
    pub subscribe: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionError {
    Malformed(String),
    Condition(FqlError),
    Mapping(MappingError),
}

impl fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionError::Malformed(msg) => write!(f, "malformed subscriptions: {}", msg),
            SubscriptionError::Condition(e) => write!(f, "{}", e),
            SubscriptionError::Mapping(e) => write!(f, "invalid subscription mapping: {}", e),
        }
    }
}

impl std::error::Error for SubscriptionError {}

/// A subscription with its condition and mapping compiled.
#[derive(Clone, Debug)]
pub struct CompiledSubscription {
    pub name: Option<String>,
    pub partner_action: String,
    pub condition: Condition,
    pub mapping: Option<Mapping>,
}

impl CompiledSubscription {
    pub fn matches(&self, event: &Value) -> bool {
        self.condition.matches(event)
    }
}

impl Subscription {
    pub fn compile(&self) -> Result<CompiledSubscription, SubscriptionError> {
        let condition = fql::parse(&self.subscribe).map_err(SubscriptionError::Condition)?;
        let mapping = match &self.mapping {
            Some(raw) => {
                let mapping = Mapping::parse(raw).map_err(SubscriptionError::Mapping)?;
                if !mapping.is_object() {
                    return Err(SubscriptionError::Malformed(format!(
                        "mapping for {} must be an object",
                        self.partner_action
                    )));
                }
                Some(mapping)
            }
            None => None,
        };

        Ok(CompiledSubscription {
            name: self.name.clone(),
            partner_action: self.partner_action.clone(),
            condition,
            mapping,
        })
    }
}

/// Reads and compiles the reserved `subscriptions` settings key.
///
/// A missing key yields no subscriptions.
pub fn from_settings(settings: &Settings) -> Result<Vec<CompiledSubscription>, SubscriptionError> {
    let Some(raw) = settings.get(SUBSCRIPTIONS_KEY) else {
        return Ok(Vec::new());
    };
    let subscriptions: Vec<Subscription> = serde_json::from_value(raw.clone())
        .map_err(|e| SubscriptionError::Malformed(e.to_string()))?;
    subscriptions.iter().map(Subscription::compile).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_settings_compiles_all() {
        let settings: Settings = serde_json::from_value(json!({
            "apiKey": "k",
            "subscriptions": [
                {"partnerAction": "send", "subscribe": "type = \"track\""},
                {
                    "name": "Identify",
                    "partnerAction": "identify",
                    "subscribe": "type = \"identify\"",
                    "mapping": {"email": {"@path": "$.traits.email"}}
                }
            ]
        }))
        .unwrap();

        let subscriptions = from_settings(&settings).unwrap();
        assert_eq!(subscriptions.len(), 2);
        assert!(subscriptions[0].matches(&json!({"type": "track"})));
        assert!(subscriptions[1].mapping.as_ref().unwrap().field("email").is_some());
    }

    #[test]
    fn test_missing_key_means_none() {
        assert!(from_settings(&Settings::new()).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_subscription_is_rejected() {
        let bad_condition = Subscription {
            name: None,
            partner_action: "send".to_string(),
            subscribe: "type ==".to_string(),
            mapping: None,
        };
        assert!(matches!(
            bad_condition.compile(),
            Err(SubscriptionError::Condition(_))
        ));

        let bad_mapping = Subscription {
            mapping: Some(json!({"email": {"@nope": 1}})),
            subscribe: "type = \"track\"".to_string(),
            ..bad_condition.clone()
        };
        assert!(matches!(
            bad_mapping.compile(),
            Err(SubscriptionError::Mapping(_))
        ));

        let not_object = Subscription {
            mapping: Some(json!("x")),
            subscribe: "type = \"track\"".to_string(),
            ..bad_condition
        };
        assert!(matches!(
            not_object.compile(),
            Err(SubscriptionError::Malformed(_))
        ));
    }
}
