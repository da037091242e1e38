//! Destination settings and their fingerprint.
//!
//! Settings are an arbitrary JSON object supplied per customer. Two keys are
//! reserved by the engine: `oauth` (token state for OAuth2 destinations) and
//! `subscriptions`. Neither takes part in the fingerprint, so rotating a token
//! never moves a customer to a different auth session or batch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

pub type Settings = Map<String, Value>;

pub const OAUTH_KEY: &str = "oauth";
pub const SUBSCRIPTIONS_KEY: &str = "subscriptions";

/// Deterministic key derived from the non-reserved settings.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SettingsFingerprint(String);

impl SettingsFingerprint {
    pub fn of(settings: &Settings) -> Self {
        let mut canonical = String::new();
        let mut keys: Vec<&String> = settings
            .keys()
            .filter(|k| k.as_str() != OAUTH_KEY && k.as_str() != SUBSCRIPTIONS_KEY)
            .collect();
        keys.sort();

        canonical.push('{');
        for (i, key) in keys.into_iter().enumerate() {
            if i > 0 {
                canonical.push(',');
            }
            write_canonical(&Value::String(key.clone()), &mut canonical);
            canonical.push(':');
            write_canonical(&settings[key], &mut canonical);
        }
        canonical.push('}');

        Self(sha256_hex(canonical.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for SettingsFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// OAuth2 state carried under the reserved `oauth` settings key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OAuthSettings {
    #[serde(default)]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_url: Option<String>,
    /// Absolute expiry of the access token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl OAuthSettings {
    /// Reads the `oauth` key; absent or malformed yields `None`.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        settings
            .get(OAUTH_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Settings without the reserved keys, as handed to destinations.
pub fn destination_settings(settings: &Settings) -> Settings {
    settings
        .iter()
        .filter(|(k, _)| k.as_str() != OAUTH_KEY && k.as_str() != SUBSCRIPTIONS_KEY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
