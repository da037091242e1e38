//! Destination Runtime - async engine that delivers events to destinations.
//!
//! A destination declares actions (fields with default mappings plus a
//! `perform` function) and an authentication scheme. The runtime resolves
//! events into validated payloads with the `actionkit` core, then sends them
//! under a shared auth, retry and batching policy.
//!
//! # Architecture
//!
//! ```text
//!  Event + Settings
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       Dispatcher                         │
//! │  - Subscriptions (FQL) pick actions      │
//! │  - Fields resolve + validate (no I/O)    │
//! │  - Batching groups by settings           │
//! └─────────────────────────────────────────┘
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       run (per call)                     │
//! │  - AuthSessionStore (single-flight)      │
//! │  - extend_request + RequestClient        │
//! │  - classify → backoff → retry            │
//! └─────────────────────────────────────────┘
//!          ↓
//!   Destination::perform / perform_batch
//!          ↓
//!      Partner API
//! ```
//!
//! Audience destinations add a lifecycle ([`AudienceLifecycle`]) on top of
//! the same `run` loop.
//!
//! # Core Types
//!
//! - [`Destination`] / [`ActionDefinition`] - contracts destinations implement
//! - [`LoadedDestination`] - a destination with mappings and subscriptions compiled
//! - [`Dispatcher`] - executes actions, batches and subscriptions
//! - [`AuthSessionStore`] - OAuth2 sessions keyed by settings fingerprint
//! - [`RetryPolicy`] / [`classify`] - pure retry decisions
//!
//! # Dispatching an Event
//!
//! ```no_run
//! use actionkit::config::EngineConfig;
//! use actionkit::{Event, EventType, Settings};
//! use destination_runtime::{AuthSessionStore, DestinationRegistry, Dispatcher};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = EngineConfig::default();
//! let sessions = Arc::new(AuthSessionStore::new(config.auth.refresh_skew_secs));
//! let dispatcher = Dispatcher::new(&config, sessions);
//! let registry = DestinationRegistry::builtin()?;
//! let webhook = registry.get("webhook").expect("webhook is built in");
//!
//! let mut event = Event::new(EventType::Track);
//! event.event = Some("Order Completed".to_string());
//! event.user_id = Some("user-1".to_string());
//!
//! let settings = Settings::new();
//! for outcome in dispatcher.on_event(&webhook, &event, &settings).await? {
//!     println!("{}: {:?}", outcome.action, outcome.result);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod audience;
pub mod auth;
pub mod batching;
pub mod connectors;
pub mod destination;
pub mod dispatcher;
pub mod registry;
pub mod request;
pub mod retry;

pub use audience::{AudienceDestination, AudienceLifecycle, MembershipOp};
pub use auth::{AuthSession, AuthSessionStore, AuthTokens, RefreshedToken, SessionKey};
pub use batching::{Batch, BatchCoordinator, BatchKey};
pub use destination::{
    ActionDefinition, AuthScheme, Authentication, BatchInput, Destination, ExecuteInput,
    LoadedDestination, RegistrationError,
};
pub use dispatcher::{BatchItem, Dispatched, Dispatcher, SubscriptionOutcome};
pub use registry::DestinationRegistry;
pub use request::{RequestClient, RequestOptions, Response};
pub use retry::{classify, RetryDecision, RetryPolicy};
