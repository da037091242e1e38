//! Encrypted persistence for refreshed OAuth tokens.
//!
//! When an OAuth2 destination rotates its access token, the runtime records
//! the new token state here so a restarted process resumes with the latest
//! token instead of the one frozen in the customer's settings.
//!
//! ```text
//!  AuthSessionStore ──put/get──▶ TokenVault ──seal/open──▶ SQLite
//!                                (destination, fingerprint) → AES-256-GCM blob
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use actionkit::credentials::{StoredTokens, TokenVault};
//! use actionkit::settings::{Settings, SettingsFingerprint};
//!
//! # fn main() -> anyhow::Result<()> {
//! let key = std::env::var("ACTIONKIT_VAULT_KEY")?;
//! let vault = TokenVault::open("tokens.db", &key)?;
//!
//! let fingerprint = SettingsFingerprint::of(&Settings::new());
//! let tokens = StoredTokens {
//!     access_token: "new-access".to_string(),
//!     refresh_token: Some("refresh".to_string()),
//!     expires_at: None,
//! };
//! vault.put("webhook", &fingerprint, &tokens)?;
//! assert!(vault.get("webhook", &fingerprint)?.is_some());
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod encryption;
mod storage;

pub use encryption::{open, parse_key, seal};
pub use storage::TokenVault;

/// Token state persisted per destination and settings fingerprint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}
