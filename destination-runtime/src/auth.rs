//! OAuth2 session cache with single-flight refresh.
//!
//! Sessions are keyed by destination slug plus settings fingerprint. Each key
//! owns one async mutex; a refresh runs while holding it, so concurrent
//! callers that all saw the same expired token queue behind the first one
//! and pick up its result instead of refreshing again. The `generation`
//! counter tells a waiting caller whether the session moved on since it
//! last looked. Slots are never removed; eviction clears the session under
//! the slot's lock and bumps the generation.

use crate::request::{RequestClient, RequestOptions};
use actionkit::credentials::{StoredTokens, TokenVault};
use actionkit::errors::OAUTH_REFRESH_FAILED;
use actionkit::settings::OAuthSettings;
use actionkit::{ActionError, SettingsFingerprint};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Method;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Credentials handed to `perform` and `refresh_access_token`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token_url: Option<String>,
}

/// Result of a token refresh.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Absent when the provider does not rotate refresh tokens
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Cached token state for one session key.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Set when this process obtained the token
    pub issued_at: Option<DateTime<Utc>>,
    /// Bumped on every refresh and eviction
    pub generation: u64,
}

impl AuthSession {
    fn from_settings(oauth: &OAuthSettings, generation: u64) -> Self {
        Self {
            access_token: oauth.access_token.clone(),
            refresh_token: oauth.refresh_token.clone(),
            expires_at: oauth.expires_at,
            issued_at: None,
            generation,
        }
    }

    /// True when the token expires within `skew` and can be refreshed.
    ///
    /// For tokens issued here the skew is capped at half their lifetime, so
    /// a short-lived token is not refreshed on every use.
    pub fn needs_refresh(&self, skew: chrono::Duration) -> bool {
        let (Some(expires_at), Some(_)) = (self.expires_at, &self.refresh_token) else {
            return false;
        };
        let skew = match self.issued_at {
            Some(issued_at) => skew.min((expires_at - issued_at) / 2),
            None => skew,
        };
        expires_at <= Utc::now() + skew
    }

    pub fn tokens(&self, oauth: &OAuthSettings) -> AuthTokens {
        AuthTokens {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            client_id: oauth.client_id.clone(),
            client_secret: oauth.client_secret.clone(),
            refresh_token_url: oauth.refresh_token_url.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub destination: String,
    pub fingerprint: SettingsFingerprint,
}

impl SessionKey {
    pub fn new(destination: impl Into<String>, fingerprint: SettingsFingerprint) -> Self {
        Self {
            destination: destination.into(),
            fingerprint,
        }
    }
}

#[derive(Default)]
struct SessionSlot {
    session: Option<AuthSession>,
    /// Survives eviction so a reseeded session never reuses a number
    generation: u64,
}

type Slot = Arc<Mutex<SessionSlot>>;

pub struct AuthSessionStore {
    sessions: DashMap<SessionKey, Slot>,
    vault: Option<Arc<TokenVault>>,
    refresh_skew: chrono::Duration,
}

impl AuthSessionStore {
    pub fn new(refresh_skew_secs: i64) -> Self {
        Self {
            sessions: DashMap::new(),
            vault: None,
            refresh_skew: chrono::Duration::seconds(refresh_skew_secs),
        }
    }

    /// Persists refreshed tokens to `vault` and seeds new sessions from it.
    pub fn with_vault(mut self, vault: Arc<TokenVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn refresh_skew(&self) -> chrono::Duration {
        self.refresh_skew
    }

    fn slot(&self, key: &SessionKey) -> Slot {
        self.sessions.entry(key.clone()).or_default().value().clone()
    }

    /// Returns the cached session, creating it from the vault or the
    /// settings' `oauth` object on first use.
    pub async fn current(&self, key: &SessionKey, oauth: &OAuthSettings) -> AuthSession {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        if let Some(session) = guard.session.as_ref() {
            return session.clone();
        }
        let session = self.seed(key, oauth, guard.generation);
        guard.session = Some(session.clone());
        session
    }

    /// Refreshes the session unless someone already did since
    /// `seen_generation`.
    ///
    /// At most one `refresh` future runs per key at a time; callers that
    /// waited on it get the refreshed session without calling `refresh`.
    pub async fn refresh<F, Fut>(
        &self,
        key: &SessionKey,
        seen_generation: u64,
        oauth: &OAuthSettings,
        refresh: F,
    ) -> Result<AuthSession, ActionError>
    where
        F: FnOnce(AuthSession) -> Fut,
        Fut: Future<Output = Result<RefreshedToken, ActionError>>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        let current = match guard.session.as_ref() {
            Some(session) => session.clone(),
            None => self.seed(key, oauth, guard.generation),
        };

        if current.generation != seen_generation {
            debug!(
                destination = %key.destination,
                fingerprint = %key.fingerprint.short(),
                generation = current.generation,
                "Reusing token refreshed by a concurrent request"
            );
            guard.session = Some(current.clone());
            return Ok(current);
        }

        info!(
            destination = %key.destination,
            fingerprint = %key.fingerprint.short(),
            "Refreshing OAuth token"
        );

        let refreshed = refresh(current.clone()).await?;
        let issued_at = Utc::now();
        let session = AuthSession {
            access_token: refreshed.access_token,
            // Keep the old refresh token if the provider didn't rotate it
            refresh_token: refreshed.refresh_token.or(current.refresh_token),
            expires_at: refreshed
                .expires_in
                .map(|secs| issued_at + chrono::Duration::seconds(secs)),
            issued_at: Some(issued_at),
            generation: current.generation + 1,
        };

        info!(
            destination = %key.destination,
            fingerprint = %key.fingerprint.short(),
            generation = session.generation,
            expires_at = ?session.expires_at,
            "OAuth token refreshed"
        );

        self.persist(key, &session);
        guard.generation = session.generation;
        guard.session = Some(session.clone());
        Ok(session)
    }

    /// Drops the session and its persisted tokens.
    ///
    /// Callers queued on the slot see a new generation and pick up the
    /// reseeded session instead of refreshing the evicted one.
    pub async fn evict(&self, key: &SessionKey) {
        let slot = self.sessions.get(key).map(|s| s.value().clone());
        if let Some(slot) = slot {
            let mut guard = slot.lock().await;
            guard.session = None;
            guard.generation += 1;
        }
        if let Some(vault) = &self.vault {
            if let Err(e) = vault.remove(&key.destination, &key.fingerprint) {
                warn!(destination = %key.destination, error = %e, "Failed to remove stored tokens");
            }
        }
        info!(
            destination = %key.destination,
            fingerprint = %key.fingerprint.short(),
            "Evicted auth session"
        );
    }

    fn seed(&self, key: &SessionKey, oauth: &OAuthSettings, generation: u64) -> AuthSession {
        if let Some(vault) = &self.vault {
            match vault.get(&key.destination, &key.fingerprint) {
                Ok(Some(stored)) => {
                    debug!(destination = %key.destination, "Loaded tokens from vault");
                    return AuthSession {
                        access_token: stored.access_token,
                        refresh_token: stored.refresh_token.or_else(|| oauth.refresh_token.clone()),
                        expires_at: stored.expires_at,
                        issued_at: None,
                        generation,
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(destination = %key.destination, error = %e, "Failed to read stored tokens");
                }
            }
        }
        AuthSession::from_settings(oauth, generation)
    }

    fn persist(&self, key: &SessionKey, session: &AuthSession) {
        let Some(vault) = &self.vault else {
            return;
        };
        let tokens = StoredTokens {
            access_token: session.access_token.clone(),
            refresh_token: session.refresh_token.clone(),
            expires_at: session.expires_at,
        };
        // In-memory session stays authoritative when the write fails
        if let Err(e) = vault.put(&key.destination, &key.fingerprint, &tokens) {
            warn!(destination = %key.destination, error = %e, "Failed to persist refreshed tokens");
        }
    }
}

/// Standard `grant_type=refresh_token` exchange against
/// `refresh_token_url`.
pub async fn refresh_with_token_endpoint(
    request: &RequestClient,
    tokens: &AuthTokens,
) -> Result<RefreshedToken, ActionError> {
    let url = tokens.refresh_token_url.as_deref().ok_or_else(|| {
        ActionError::invalid_authentication_with_code(
            "No refresh token URL configured",
            OAUTH_REFRESH_FAILED,
        )
    })?;
    let refresh_token = tokens.refresh_token.clone().ok_or_else(|| {
        ActionError::invalid_authentication_with_code("No refresh token available", OAUTH_REFRESH_FAILED)
    })?;

    let mut form = vec![
        ("grant_type".to_string(), "refresh_token".to_string()),
        ("refresh_token".to_string(), refresh_token),
    ];
    if let Some(client_id) = &tokens.client_id {
        form.push(("client_id".to_string(), client_id.clone()));
    }
    if let Some(client_secret) = &tokens.client_secret {
        form.push(("client_secret".to_string(), client_secret.clone()));
    }

    let response = request
        .request(
            url,
            RequestOptions::method(Method::POST)
                .header("Accept", "application/json")
                .form(form),
        )
        .await?;
    response.json()
}
