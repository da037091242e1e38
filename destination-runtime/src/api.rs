//! Destination runtime HTTP API.
//!
//! Routes:
//! - `GET /health`
//! - `GET /api/destinations`: registered destinations and their actions
//! - `POST /api/destinations/:slug/events`: run matching subscriptions
//! - `POST /api/destinations/:slug/actions/:action`: run one action
//! - `POST /api/destinations/:slug/actions/:action/batch`: run one action for many events
//! - `POST /api/destinations/:slug/authentication/test`: credentials check
//! - `POST /api/destinations/:slug/audiences`: create (or reuse) an audience
//! - `POST /api/destinations/:slug/audiences/:external_id`: reconcile an audience
//! - `POST /api/destinations/:slug/audience-sync`: sync one membership event
//!
//! Failures answer with the error's status and
//! `{"error": {"kind", "code", "status", "message"}}`.

use crate::audience::{AudienceLifecycle, AudienceRecord, Reconciliation};
use crate::destination::{AuthScheme, LoadedDestination};
use crate::dispatcher::{BatchItem, Dispatched, Dispatcher, SubscriptionOutcome};
use crate::registry::DestinationRegistry;
use actionkit::{ActionError, Event, Mapping, Payload, Settings};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<DestinationRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub audiences: Arc<AudienceLifecycle>,
}

/// Body of the event and audience-sync routes.
#[derive(Deserialize)]
pub struct EventRequest {
    pub event: Event,
    #[serde(default)]
    pub settings: Settings,
}

/// Body of `POST /api/destinations/:slug/actions/:action`.
#[derive(Deserialize)]
pub struct ActionRequest {
    pub event: Event,
    #[serde(default)]
    pub settings: Settings,
    /// Field mappings overriding the action's defaults
    #[serde(default)]
    pub mapping: Option<Value>,
}

#[derive(Deserialize)]
pub struct BatchRequest {
    pub items: Vec<ActionRequest>,
}

#[derive(Deserialize)]
pub struct SettingsRequest {
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAudienceRequest {
    #[serde(default)]
    pub settings: Settings,
    pub audience_name: String,
    #[serde(default)]
    pub audience_settings: Payload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAudienceRequest {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub audience_settings: Payload,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub code: String,
    pub status: u16,
    pub message: String,
}

impl From<&ActionError> for ErrorBody {
    fn from(err: &ActionError) -> Self {
        Self {
            kind: err.kind().to_string(),
            code: err.code(),
            status: err.status(),
            message: err.message().to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

/// Per-item outcome in batch and event responses.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ItemResult {
    Ok { data: Value, attempts: u32 },
    Error { error: ErrorBody },
}

impl From<Result<Dispatched, ActionError>> for ItemResult {
    fn from(result: Result<Dispatched, ActionError>) -> Self {
        match result {
            Ok(d) => ItemResult::Ok {
                data: d.data,
                attempts: d.attempts,
            },
            Err(e) => ItemResult::Error { error: (&e).into() },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    pub action: String,
    #[serde(flatten)]
    pub result: ItemResult,
}

impl From<SubscriptionOutcome> for SubscriptionResult {
    fn from(outcome: SubscriptionOutcome) -> Self {
        Self {
            subscription: outcome.subscription,
            action: outcome.action,
            result: outcome.result.into(),
        }
    }
}

/// A single entry in the `GET /api/destinations` response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationInfo {
    pub slug: String,
    pub name: String,
    pub scheme: AuthScheme,
    pub actions: Vec<ActionInfo>,
    pub audience: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInfo {
    pub key: String,
    pub title: String,
    pub description: String,
    pub supports_batch: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_subscription: Option<String>,
}

// ---------------------------------------------------------------------------
// Business logic (called from HTTP handlers and unit tests)
// ---------------------------------------------------------------------------

pub fn handle_list_destinations(state: &ApiState) -> Vec<DestinationInfo> {
    state
        .registry
        .iter()
        .map(|d| DestinationInfo {
            slug: d.slug().to_string(),
            name: d.name().to_string(),
            scheme: d.scheme(),
            actions: d
                .actions()
                .map(|a| ActionInfo {
                    key: a.key.clone(),
                    title: a.definition.title().to_string(),
                    description: a.definition.description().to_string(),
                    supports_batch: a.definition.supports_batch(),
                    default_subscription: a.definition.default_subscription().map(str::to_string),
                })
                .collect(),
            audience: d.audience().is_some(),
        })
        .collect()
}

fn destination(state: &ApiState, slug: &str) -> Result<Arc<LoadedDestination>, ActionError> {
    state.registry.get(slug).ok_or_else(|| {
        ActionError::integration(
            format!("Destination '{}' is not registered", slug),
            "DESTINATION_NOT_FOUND",
            404,
        )
    })
}

/// Parses a request-supplied mapping; it must be an object keyed by field.
fn parse_mapping(raw: Option<&Value>) -> Result<Option<Mapping>, ActionError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let mapping = Mapping::parse(raw).map_err(|e| {
        ActionError::integration(format!("Invalid mapping: {}", e), "INVALID_MAPPING", 400)
    })?;
    if !mapping.is_object() {
        return Err(ActionError::integration(
            "Invalid mapping: expected an object keyed by field",
            "INVALID_MAPPING",
            400,
        ));
    }
    Ok(Some(mapping))
}

pub async fn handle_event(
    state: &ApiState,
    slug: &str,
    req: EventRequest,
) -> Result<Vec<SubscriptionResult>, ActionError> {
    let dest = destination(state, slug)?;
    let outcomes = state.dispatcher.on_event(&dest, &req.event, &req.settings).await?;
    Ok(outcomes.into_iter().map(SubscriptionResult::from).collect())
}

pub async fn handle_action(
    state: &ApiState,
    slug: &str,
    action: &str,
    req: ActionRequest,
) -> Result<Dispatched, ActionError> {
    let dest = destination(state, slug)?;
    let mapping = parse_mapping(req.mapping.as_ref())?;
    state
        .dispatcher
        .execute(&dest, action, &req.event, mapping.as_ref(), &req.settings)
        .await
}

pub async fn handle_batch(
    state: &ApiState,
    slug: &str,
    action: &str,
    req: BatchRequest,
) -> Result<Vec<ItemResult>, ActionError> {
    let dest = destination(state, slug)?;
    let items = req
        .items
        .into_iter()
        .map(|item| {
            Ok(BatchItem {
                mapping: parse_mapping(item.mapping.as_ref())?,
                event: item.event,
                settings: item.settings,
            })
        })
        .collect::<Result<Vec<_>, ActionError>>()?;

    let results = state.dispatcher.execute_batch(&dest, action, &items).await?;
    info!(
        destination = %slug,
        action = %action,
        items = items.len(),
        failed = results.iter().filter(|r| r.is_err()).count(),
        "Batch request handled"
    );
    Ok(results.into_iter().map(ItemResult::from).collect())
}

pub async fn handle_test_authentication(
    state: &ApiState,
    slug: &str,
    req: SettingsRequest,
) -> Result<(), ActionError> {
    let dest = destination(state, slug)?;
    state.dispatcher.test_authentication(&dest, &req.settings).await
}

pub async fn handle_create_audience(
    state: &ApiState,
    slug: &str,
    req: CreateAudienceRequest,
) -> Result<AudienceRecord, ActionError> {
    let dest = destination(state, slug)?;
    state
        .audiences
        .create_audience(&dest, &req.settings, &req.audience_name, req.audience_settings)
        .await
}

pub async fn handle_get_audience(
    state: &ApiState,
    slug: &str,
    external_id: &str,
    req: GetAudienceRequest,
) -> Result<Reconciliation, ActionError> {
    let dest = destination(state, slug)?;
    state
        .audiences
        .get_audience(&dest, &req.settings, external_id, req.audience_settings)
        .await
}

pub async fn handle_audience_sync(
    state: &ApiState,
    slug: &str,
    req: EventRequest,
) -> Result<Dispatched, ActionError> {
    let dest = destination(state, slug)?;
    state.audiences.sync_event(&dest, &req.event, &req.settings).await
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn list_destinations(State(state): State<Arc<ApiState>>) -> Json<Vec<DestinationInfo>> {
    Json(handle_list_destinations(&state))
}

async fn post_event(
    State(state): State<Arc<ApiState>>,
    Path(slug): Path<String>,
    Json(req): Json<EventRequest>,
) -> Result<Json<Value>, AppError> {
    let results = handle_event(&state, &slug, req).await?;
    Ok(Json(json!({ "results": results })))
}

async fn post_action(
    State(state): State<Arc<ApiState>>,
    Path((slug, action)): Path<(String, String)>,
    Json(req): Json<ActionRequest>,
) -> Result<Json<Dispatched>, AppError> {
    Ok(Json(handle_action(&state, &slug, &action, req).await?))
}

async fn post_batch(
    State(state): State<Arc<ApiState>>,
    Path((slug, action)): Path<(String, String)>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<Value>, AppError> {
    let results = handle_batch(&state, &slug, &action, req).await?;
    Ok(Json(json!({ "results": results })))
}

async fn post_test_authentication(
    State(state): State<Arc<ApiState>>,
    Path(slug): Path<String>,
    Json(req): Json<SettingsRequest>,
) -> Result<StatusCode, AppError> {
    handle_test_authentication(&state, &slug, req).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_audience(
    State(state): State<Arc<ApiState>>,
    Path(slug): Path<String>,
    Json(req): Json<CreateAudienceRequest>,
) -> Result<(StatusCode, Json<AudienceRecord>), AppError> {
    let record = handle_create_audience(&state, &slug, req).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn post_get_audience(
    State(state): State<Arc<ApiState>>,
    Path((slug, external_id)): Path<(String, String)>,
    Json(req): Json<GetAudienceRequest>,
) -> Result<Json<Reconciliation>, AppError> {
    Ok(Json(handle_get_audience(&state, &slug, &external_id, req).await?))
}

async fn post_audience_sync(
    State(state): State<Arc<ApiState>>,
    Path(slug): Path<String>,
    Json(req): Json<EventRequest>,
) -> Result<Json<Dispatched>, AppError> {
    Ok(Json(handle_audience_sync(&state, &slug, req).await?))
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

struct AppError(ActionError);

impl From<ActionError> for AppError {
    fn from(e: ActionError) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(ErrorResponse {
                error: ErrorBody::from(&self.0),
            }),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/destinations", get(list_destinations))
        .route("/api/destinations/:slug/events", post(post_event))
        .route("/api/destinations/:slug/actions/:action", post(post_action))
        .route("/api/destinations/:slug/actions/:action/batch", post(post_batch))
        .route(
            "/api/destinations/:slug/authentication/test",
            post(post_test_authentication),
        )
        .route("/api/destinations/:slug/audiences", post(post_audience))
        .route(
            "/api/destinations/:slug/audiences/:external_id",
            post(post_get_audience),
        )
        .route("/api/destinations/:slug/audience-sync", post(post_audience_sync))
        .with_state(Arc::new(state))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthSessionStore;
    use actionkit::config::EngineConfig;
    use actionkit::ErrorKind;

    fn make_state() -> ApiState {
        let config = EngineConfig::default();
        let sessions = Arc::new(AuthSessionStore::new(config.auth.refresh_skew_secs));
        let dispatcher = Arc::new(Dispatcher::new(&config, sessions));
        ApiState {
            registry: Arc::new(DestinationRegistry::builtin().unwrap()),
            audiences: Arc::new(AudienceLifecycle::new(dispatcher.clone())),
            dispatcher,
        }
    }

    fn action_request(value: Value) -> ActionRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_list_destinations() {
        let list = handle_list_destinations(&make_state());
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].slug, "webhook");
        assert_eq!(list[0].actions[0].key, "send");
        assert!(list[0].actions[0].supports_batch);
        assert!(list[0].audience);
    }

    #[tokio::test]
    async fn test_handle_action_delivers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_body(mockito::Matcher::PartialJson(json!({"event": "Signed Up"})))
            .with_status(200)
            .create_async()
            .await;

        let req = action_request(json!({
            "event": {"type": "track", "event": "Signed Up", "userId": "u-1"},
            "mapping": {"url": format!("{}/hook", server.url())}
        }));
        let dispatched = handle_action(&make_state(), "webhook", "send", req).await.unwrap();
        assert_eq!(dispatched.attempts, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_handle_action_errors() {
        let state = make_state();
        let req = || action_request(json!({"event": {"type": "track", "event": "X", "userId": "u"}}));

        let err = handle_action(&state, "nope", "send", req()).await.unwrap_err();
        assert_eq!(err.code(), "DESTINATION_NOT_FOUND");
        assert_eq!(err.status(), 404);

        let err = handle_action(&state, "webhook", "send", req()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PayloadValidation);
        assert_eq!(err.message(), "The root value is missing the required field 'url'.");

        let bad = action_request(json!({
            "event": {"type": "track", "event": "X", "userId": "u"},
            "mapping": {"url": {"@nope": "x"}}
        }));
        let err = handle_action(&state, "webhook", "send", bad).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_MAPPING");
    }

    #[test]
    fn test_item_result_serialization() {
        let ok = ItemResult::from(Ok(Dispatched {
            data: json!({"id": 1}),
            attempts: 2,
        }));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"status": "ok", "data": {"id": 1}, "attempts": 2})
        );

        let err = ItemResult::from(Err(ActionError::api("Too Many Requests", 429)));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({
                "status": "error",
                "error": {
                    "kind": "APIError",
                    "code": "TOO_MANY_REQUESTS",
                    "status": 429,
                    "message": "Too Many Requests"
                }
            })
        );
    }
}
