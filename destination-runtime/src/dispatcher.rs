//! Request dispatcher.
//!
//! Turns an event into a validated payload, then runs the destination's
//! `perform` (or `perform_batch`) under the auth and retry policy:
//!
//! ```text
//! Event ──validate──▶ Payload ──▶ run ─┬─ extend_request + call
//!                                      ├─ 401 → single-flight refresh → replay once
//!                                      └─ other failure → classify → backoff → retry
//! ```
//!
//! Everything up to the payload is synchronous and side-effect free, so a
//! validation failure never costs a network call.

use crate::auth::{AuthSession, AuthSessionStore, AuthTokens, SessionKey};
use crate::batching::{batch_size_of, batching_enabled, BatchCoordinator, BatchKey};
use crate::destination::{AuthScheme, BatchInput, ExecuteInput, LoadedAction, LoadedDestination};
use crate::request::{RequestClient, RequestOptions};
use crate::retry::{classify, RetryPolicy};
use actionkit::config::EngineConfig;
use actionkit::errors::OAUTH_REFRESH_FAILED;
use actionkit::settings::{destination_settings, OAuthSettings};
use actionkit::subscription::{self, CompiledSubscription};
use actionkit::{
    ActionError, ErrorKind, Event, Mapping, Payload, ResolveOptions, Settings, SettingsFingerprint,
};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of a successful dispatch.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Dispatched {
    pub data: Value,
    /// Calls made, replays and retries included
    pub attempts: u32,
}

/// One entry of a batch request.
#[derive(Clone, Debug)]
pub struct BatchItem {
    pub event: Event,
    pub settings: Settings,
    pub mapping: Option<Mapping>,
}

/// Outcome of one matching subscription.
#[derive(Debug)]
pub struct SubscriptionOutcome {
    pub subscription: Option<String>,
    pub action: String,
    pub result: Result<Dispatched, ActionError>,
}

pub struct Dispatcher {
    http: reqwest::Client,
    sessions: Arc<AuthSessionStore>,
    policy: RetryPolicy,
    request_timeout: Duration,
    coordinator: BatchCoordinator,
    resolve_options: ResolveOptions,
}

impl Dispatcher {
    pub fn new(config: &EngineConfig, sessions: Arc<AuthSessionStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            sessions,
            policy: RetryPolicy::from_config(&config.dispatch),
            request_timeout: Duration::from_millis(config.dispatch.request_timeout_ms),
            coordinator: BatchCoordinator::new(config.batching.default_batch_size),
            resolve_options: ResolveOptions::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_resolve_options(mut self, options: ResolveOptions) -> Self {
        self.resolve_options = options;
        self
    }

    pub fn sessions(&self) -> &Arc<AuthSessionStore> {
        &self.sessions
    }

    pub fn resolve_options(&self) -> &ResolveOptions {
        &self.resolve_options
    }

    fn base_client(&self) -> RequestClient {
        RequestClient::new(self.http.clone()).with_defaults(RequestOptions {
            timeout: Some(self.request_timeout),
            ..RequestOptions::default()
        })
    }

    /// Resolves and validates one action payload. No I/O.
    pub fn prepare(
        &self,
        action: &LoadedAction,
        event: &Event,
        mapping: Option<&Mapping>,
    ) -> Result<Payload, ActionError> {
        let data = prepared_event(event);
        action.fields.resolve(mapping, &data, &self.resolve_options)
    }

    /// Runs one action for one event.
    pub async fn execute(
        &self,
        dest: &LoadedDestination,
        action_key: &str,
        event: &Event,
        mapping: Option<&Mapping>,
        settings: &Settings,
    ) -> Result<Dispatched, ActionError> {
        let data = prepared_event(event);
        self.execute_value(dest, action_key, &data, mapping, settings).await
    }

    async fn execute_value(
        &self,
        dest: &LoadedDestination,
        action_key: &str,
        data: &Value,
        mapping: Option<&Mapping>,
        settings: &Settings,
    ) -> Result<Dispatched, ActionError> {
        let action = dest.action(action_key)?;
        let validated = dest.validate_settings(settings)?;
        let payload = action.fields.resolve(mapping, data, &self.resolve_options)?;

        let definition = &action.definition;
        let payload = &payload;
        let validated = &validated;
        let (data, attempts) = self
            .run(dest, settings, action_key, move |request, auth| async move {
                definition
                    .perform(
                        &request,
                        ExecuteInput {
                            payload,
                            settings: validated,
                            auth: auth.as_ref(),
                        },
                    )
                    .await
            })
            .await?;

        info!(
            destination = %dest.slug(),
            action = %action_key,
            attempts,
            "Action delivered"
        );
        Ok(Dispatched { data, attempts })
    }

    /// Runs one action for many events.
    ///
    /// Items whose payload enables batching are grouped by settings
    /// fingerprint and sent through `perform_batch`; a batch succeeds or
    /// fails as a whole. Everything else goes through `perform`. Results
    /// are returned in input order.
    pub async fn execute_batch(
        &self,
        dest: &LoadedDestination,
        action_key: &str,
        items: &[BatchItem],
    ) -> Result<Vec<Result<Dispatched, ActionError>>, ActionError> {
        let action = dest.action(action_key)?;
        let mut results: Vec<Option<Result<Dispatched, ActionError>>> = vec![None; items.len()];
        let mut arrivals = Vec::new();
        let mut singles = Vec::new();

        for (index, item) in items.iter().enumerate() {
            let prepared = dest
                .validate_settings(&item.settings)
                .and_then(|_| self.prepare(action, &item.event, item.mapping.as_ref()));
            match prepared {
                Ok(payload) if action.definition.supports_batch() && batching_enabled(&payload) => {
                    let key = BatchKey {
                        destination: dest.slug().to_string(),
                        action: action_key.to_string(),
                        fingerprint: SettingsFingerprint::of(&item.settings),
                    };
                    arrivals.push((key, (index, payload)));
                }
                Ok(_) => singles.push(index),
                Err(err) => results[index] = Some(Err(err)),
            }
        }

        let dest_size = dest.definition().default_batch_size();
        let batches = self.coordinator.plan(arrivals, |_, (_, payload)| {
            batch_size_of(payload).or(dest_size)
        });

        let batch_runs = batches.into_iter().map(|batch| async move {
            let indexes: Vec<usize> = batch.items.iter().map(|(i, _)| *i).collect();
            let payloads: Vec<Payload> = batch.items.into_iter().map(|(_, p)| p).collect();
            // Every item in the batch shares the fingerprint of the first
            let settings = &items[indexes[0]].settings;
            let outcome = self.perform_batch(dest, action, &payloads, settings).await;
            (indexes, outcome)
        });
        let single_runs = singles.into_iter().map(|index| async move {
            let item = &items[index];
            let outcome = self
                .execute(dest, action_key, &item.event, item.mapping.as_ref(), &item.settings)
                .await;
            (index, outcome)
        });

        let (batch_outcomes, single_outcomes) =
            futures::join!(join_all(batch_runs), join_all(single_runs));

        for (indexes, outcome) in batch_outcomes {
            for index in indexes {
                results[index] = Some(outcome.clone());
            }
        }
        for (index, outcome) in single_outcomes {
            results[index] = Some(outcome);
        }

        Ok(results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| Err(ActionError::retryable("Batch item was not dispatched")))
            })
            .collect())
    }

    async fn perform_batch(
        &self,
        dest: &LoadedDestination,
        action: &LoadedAction,
        payloads: &[Payload],
        settings: &Settings,
    ) -> Result<Dispatched, ActionError> {
        let validated = dest.validate_settings(settings)?;
        let definition = &action.definition;
        let validated = &validated;

        debug!(
            destination = %dest.slug(),
            action = %action.key,
            size = payloads.len(),
            "Dispatching batch"
        );

        let (data, attempts) = self
            .run(dest, settings, &action.key, move |request, auth| async move {
                definition
                    .perform_batch(
                        &request,
                        BatchInput {
                            payloads,
                            settings: validated,
                            auth: auth.as_ref(),
                        },
                    )
                    .await
            })
            .await?;

        info!(
            destination = %dest.slug(),
            action = %action.key,
            size = payloads.len(),
            attempts,
            "Batch delivered"
        );
        Ok(Dispatched { data, attempts })
    }

    /// Runs every subscription whose condition matches the event.
    ///
    /// Subscriptions come from the settings' `subscriptions` key, or from the
    /// actions' default subscriptions when the key is absent. Matching
    /// actions run concurrently and report individually.
    pub async fn on_event(
        &self,
        dest: &LoadedDestination,
        event: &Event,
        settings: &Settings,
    ) -> Result<Vec<SubscriptionOutcome>, ActionError> {
        let subscriptions: Vec<CompiledSubscription> =
            if settings.contains_key(actionkit::settings::SUBSCRIPTIONS_KEY) {
                subscription::from_settings(settings).map_err(|e| {
                    ActionError::integration(e.to_string(), "INVALID_SUBSCRIPTION", 400)
                })?
            } else {
                dest.default_subscriptions()
            };

        let data = prepared_event(event);
        let matching: Vec<&CompiledSubscription> =
            subscriptions.iter().filter(|s| s.matches(&data)).collect();

        debug!(
            destination = %dest.slug(),
            subscriptions = subscriptions.len(),
            matching = matching.len(),
            "Evaluated subscriptions"
        );

        let data = &data;
        let runs = matching.into_iter().map(|sub| async move {
            let result = self
                .execute_value(dest, &sub.partner_action, data, sub.mapping.as_ref(), settings)
                .await;
            SubscriptionOutcome {
                subscription: sub.name.clone(),
                action: sub.partner_action.clone(),
                result,
            }
        });
        Ok(join_all(runs).await)
    }

    /// Calls the destination's credential check.
    pub async fn test_authentication(
        &self,
        dest: &LoadedDestination,
        settings: &Settings,
    ) -> Result<(), ActionError> {
        let validated = dest.validate_settings(settings)?;
        let definition = dest.definition();
        let validated = &validated;
        self.run(dest, settings, "test_authentication", move |request, _auth| async move {
            definition.test_authentication(&request, validated).await
        })
        .await
        .map(|_| ())
    }

    /// Runs `call` with an auth-extended request client until it succeeds,
    /// fails terminally, or runs out of attempts.
    ///
    /// Returns the value and the number of calls made.
    pub async fn run<T, F, Fut>(
        &self,
        dest: &LoadedDestination,
        settings: &Settings,
        operation: &str,
        call: F,
    ) -> Result<(T, u32), ActionError>
    where
        F: Fn(RequestClient, Option<AuthTokens>) -> Fut,
        Fut: Future<Output = Result<T, ActionError>>,
    {
        let plain = destination_settings(settings);
        let key = SessionKey::new(dest.slug(), SettingsFingerprint::of(settings));
        let base = self.base_client();

        let oauth = match dest.scheme() {
            AuthScheme::OAuth2 => Some(OAuthSettings::from_settings(settings).ok_or_else(|| {
                ActionError::invalid_authentication("Missing oauth settings for an OAuth2 destination")
            })?),
            _ => None,
        };

        let mut session = match &oauth {
            Some(oauth) => Some(self.sessions.current(&key, oauth).await),
            None => None,
        };
        let mut refresh_due = session
            .as_ref()
            .map_or(false, |s| s.needs_refresh(self.sessions.refresh_skew()));
        if let Some(current) = session.as_ref().filter(|_| refresh_due) {
            debug!(
                destination = %dest.slug(),
                expires_at = ?current.expires_at,
                "Token expires soon, refreshing before dispatch"
            );
        }

        let mut attempt = 1;
        let mut calls = 0;
        let mut replayed = false;

        loop {
            // A failed refresh is classified like a failed call and shares
            // the attempt budget
            let err = match oauth.as_ref().zip(session.clone()) {
                Some((oauth, current)) if refresh_due => {
                    match self.refresh(dest, &key, &current, oauth, &plain, &base).await {
                        Ok(refreshed) => {
                            session = Some(refreshed);
                            refresh_due = false;
                            continue;
                        }
                        Err(err) => err,
                    }
                }
                _ => {
                    calls += 1;
                    let auth = match (&session, &oauth) {
                        (Some(session), Some(oauth)) => Some(session.tokens(oauth)),
                        _ => None,
                    };

                    let mut extension = dest.definition().extend_request(&plain, auth.as_ref());
                    if dest.scheme() == AuthScheme::Basic {
                        extension.username =
                            plain.get("username").and_then(Value::as_str).map(str::to_string);
                        extension.password =
                            plain.get("password").and_then(Value::as_str).map(str::to_string);
                    }
                    let client = base.with_defaults(extension);

                    let err = match call(client, auth).await {
                        Ok(value) => return Ok((value, calls)),
                        Err(err) => err,
                    };

                    if session.is_some() && is_auth_rejection(&err) {
                        if replayed {
                            self.sessions.evict(&key).await;
                            error!(
                                destination = %dest.slug(),
                                operation = %operation,
                                "Request rejected again after token refresh"
                            );
                            return Err(ActionError::invalid_authentication(format!(
                                "Authentication rejected after token refresh: {}",
                                err.message()
                            )));
                        }
                        replayed = true;
                        refresh_due = true;
                        warn!(
                            destination = %dest.slug(),
                            operation = %operation,
                            "Request unauthorized, refreshing token and replaying"
                        );
                        continue;
                    }
                    err
                }
            };

            let decision = classify(&err, attempt, &self.policy);
            if !decision.should_retry() {
                if decision.retryable {
                    error!(
                        destination = %dest.slug(),
                        operation = %operation,
                        attempts = attempt,
                        error = %err,
                        "Retries exhausted"
                    );
                } else {
                    warn!(
                        destination = %dest.slug(),
                        operation = %operation,
                        error = %err,
                        "Dispatch failed"
                    );
                }
                return Err(err);
            }

            warn!(
                destination = %dest.slug(),
                operation = %operation,
                attempt,
                max_attempts = self.policy.max_attempts,
                backoff_ms = decision.backoff.as_millis() as u64,
                error = %err,
                "Dispatch failed, retrying"
            );
            tokio::time::sleep(decision.backoff).await;
            attempt += 1;
        }
    }

    /// Single-flight refresh. A non-retryable failure evicts the session.
    async fn refresh(
        &self,
        dest: &LoadedDestination,
        key: &SessionKey,
        seen: &AuthSession,
        oauth: &OAuthSettings,
        plain: &Settings,
        base: &RequestClient,
    ) -> Result<AuthSession, ActionError> {
        let definition = dest.definition().clone();
        let result = self
            .sessions
            .refresh(key, seen.generation, oauth, |current| {
                let tokens = current.tokens(oauth);
                async move { definition.refresh_access_token(base, plain, &tokens).await }
            })
            .await;

        match result {
            Ok(session) => Ok(session),
            Err(err) if err.is_retryable() => Err(err),
            Err(err) => {
                self.sessions.evict(key).await;
                error!(destination = %dest.slug(), error = %err, "Token refresh failed");
                Err(ActionError::invalid_authentication_with_code(
                    format!("Failed to refresh access token: {}", err.message()),
                    OAUTH_REFRESH_FAILED,
                ))
            }
        }
    }
}

fn is_auth_rejection(err: &ActionError) -> bool {
    err.status() == 401 && matches!(err.kind(), ErrorKind::Api | ErrorKind::InvalidAuthentication)
}

/// Fills the ids of a copy of the event and returns its JSON view.
pub(crate) fn prepared_event(event: &Event) -> Value {
    let mut event = event.clone();
    event.prepare();
    event.to_value()
}

#[cfg(test)]
mod tests;
