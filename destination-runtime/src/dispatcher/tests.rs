use super::*;
use crate::auth::RefreshedToken;
use crate::destination::{ActionDefinition, Authentication, Destination};
use actionkit::{EventType, FieldSchema, Fields};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type Respond = Arc<dyn Fn(usize, Option<&AuthTokens>) -> Result<Value, ActionError> + Send + Sync>;

type Refresh = Arc<dyn Fn(usize) -> Result<RefreshedToken, ActionError> + Send + Sync>;

fn respond<F>(f: F) -> Respond
where
    F: Fn(usize, Option<&AuthTokens>) -> Result<Value, ActionError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Action whose outcome is scripted per call number.
struct ScriptedAction {
    calls: Arc<AtomicUsize>,
    batches: Arc<Mutex<Vec<Vec<Payload>>>>,
    respond: Respond,
}

#[async_trait]
impl ActionDefinition for ScriptedAction {
    fn title(&self) -> &str {
        "Scripted"
    }

    fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(
            "email".to_string(),
            FieldSchema::string("Email")
                .required()
                .default_mapping(json!({"@path": "$.traits.email"})),
        );
        fields.insert(
            "url".to_string(),
            FieldSchema::string("URL").default_mapping(json!({"@path": "$.properties.url"})),
        );
        fields.insert(
            "enable_batching".to_string(),
            FieldSchema::boolean("Batch").default_mapping(json!({"@path": "$.properties.batch"})),
        );
        fields.insert(
            "batch_size".to_string(),
            FieldSchema::integer("Batch Size")
                .default_mapping(json!({"@path": "$.properties.batch_size"})),
        );
        fields
    }

    fn default_subscription(&self) -> Option<&str> {
        Some(r#"type = "track""#)
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn perform(
        &self,
        request: &RequestClient,
        input: ExecuteInput<'_>,
    ) -> Result<Value, ActionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(url) = input.payload.get("url").and_then(Value::as_str) {
            let response = request.request(url, RequestOptions::get()).await?;
            return Ok(response.data());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        (self.respond)(n, input.auth)
    }

    async fn perform_batch(
        &self,
        _request: &RequestClient,
        input: BatchInput<'_>,
    ) -> Result<Value, ActionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.batches.lock().unwrap().push(input.payloads.to_vec());
        (self.respond)(n, input.auth)
    }
}

struct ScriptedDestination {
    scheme: AuthScheme,
    action: Arc<ScriptedAction>,
    refreshes: Arc<AtomicUsize>,
    refresh: Refresh,
}

#[async_trait]
impl Destination for ScriptedDestination {
    fn name(&self) -> &str {
        "Scripted"
    }

    fn slug(&self) -> &str {
        "scripted"
    }

    fn authentication(&self) -> Authentication {
        Authentication::new(self.scheme, Fields::new())
    }

    async fn refresh_access_token(
        &self,
        _request: &RequestClient,
        _settings: &Settings,
        auth: &AuthTokens,
    ) -> Result<RefreshedToken, ActionError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(auth.refresh_token.as_deref(), Some("refresh-1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        (self.refresh)(n)
    }

    fn actions(&self) -> Vec<(String, Arc<dyn ActionDefinition>)> {
        vec![("scripted".to_string(), self.action.clone())]
    }
}

struct Harness {
    dispatcher: Dispatcher,
    dest: LoadedDestination,
    calls: Arc<AtomicUsize>,
    refreshes: Arc<AtomicUsize>,
    batches: Arc<Mutex<Vec<Vec<Payload>>>>,
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        factor: 2,
        max_backoff: Duration::from_millis(10),
    }
}

fn issued(expires_in: i64) -> Result<RefreshedToken, ActionError> {
    Ok(RefreshedToken {
        access_token: "new".to_string(),
        refresh_token: None,
        expires_in: Some(expires_in),
    })
}

fn refresh<F>(f: F) -> Refresh
where
    F: Fn(usize) -> Result<RefreshedToken, ActionError> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn refresh_ok() -> Refresh {
    refresh(|_| issued(3600))
}

fn refresh_rejected() -> Refresh {
    refresh(|_| Err(ActionError::api("Bad Request", 400)))
}

fn harness_with(scheme: AuthScheme, refresh: Refresh, respond: Respond) -> Harness {
    let calls = Arc::new(AtomicUsize::new(0));
    let refreshes = Arc::new(AtomicUsize::new(0));
    let batches = Arc::new(Mutex::new(Vec::new()));
    let action = Arc::new(ScriptedAction {
        calls: calls.clone(),
        batches: batches.clone(),
        respond,
    });
    let dest = LoadedDestination::load(Arc::new(ScriptedDestination {
        scheme,
        action,
        refreshes: refreshes.clone(),
        refresh,
    }))
    .unwrap();

    let sessions = Arc::new(AuthSessionStore::new(90));
    let dispatcher =
        Dispatcher::new(&EngineConfig::default(), sessions).with_policy(fast_policy());

    Harness {
        dispatcher,
        dest,
        calls,
        refreshes,
        batches,
    }
}

fn harness(respond: Respond) -> Harness {
    harness_with(AuthScheme::Custom, refresh_ok(), respond)
}

fn ok() -> Respond {
    respond(|_, _| Ok(json!({"ok": true})))
}

fn event(email: &str, properties: Value) -> Event {
    let mut event = Event::new(EventType::Track);
    event.event = Some("Order Completed".to_string());
    event.user_id = Some("user-1".to_string());
    event.traits.insert("email".to_string(), json!(email));
    if let Value::Object(properties) = properties {
        event.properties = properties;
    }
    event
}

fn settings(value: Value) -> Settings {
    serde_json::from_value(value).unwrap()
}

fn oauth_settings() -> Settings {
    settings(json!({
        "region": "eu",
        "oauth": {"access_token": "old", "refresh_token": "refresh-1"}
    }))
}

fn unauthorized_until_refreshed() -> Respond {
    respond(|_, auth| match auth {
        Some(tokens) if tokens.access_token == "new" => Ok(json!("delivered")),
        _ => Err(ActionError::api("Unauthorized", 401)),
    })
}

#[tokio::test]
async fn test_execute_succeeds_first_try() {
    let h = harness(ok());
    let result = h
        .dispatcher
        .execute(&h.dest, "scripted", &event("a@b.com", json!({})), None, &Settings::new())
        .await
        .unwrap();
    assert_eq!(result.data, json!({"ok": true}));
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn test_validation_failure_makes_no_calls() {
    let h = harness(ok());
    let mut event = event("a@b.com", json!({}));
    event.traits.clear();

    let err = h
        .dispatcher
        .execute(&h.dest, "scripted", &event, None, &Settings::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PayloadValidation);
    assert_eq!(err.message(), "The root value is missing the required field 'email'.");
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_identify_without_ids_is_dispatched() {
    let h = harness(respond(|_, _| Ok(json!("sent"))));
    let event: Event =
        serde_json::from_value(json!({"type": "identify", "traits": {"email": "a@b.com"}}))
            .unwrap();

    let action = h.dest.action("scripted").unwrap();
    let payload = h.dispatcher.prepare(action, &event, None).unwrap();
    assert_eq!(payload, json!({"email": "a@b.com"}).as_object().unwrap().clone());

    let result = h
        .dispatcher
        .execute(&h.dest, "scripted", &event, None, &Settings::new())
        .await
        .unwrap();
    assert_eq!(result.data, json!("sent"));
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mapping_reads_unmodelled_event_keys() {
    let h = harness(ok());
    let event: Event = serde_json::from_value(json!({
        "type": "track",
        "userId": "user-1",
        "receivedAt": "2024-03-01T10:00:00Z",
        "traits": {"email": "a@b.com"}
    }))
    .unwrap();
    let mapping = Mapping::parse(&json!({"url": {"@path": "$.receivedAt"}})).unwrap();

    let action = h.dest.action("scripted").unwrap();
    let payload = h.dispatcher.prepare(action, &event, Some(&mapping)).unwrap();
    assert_eq!(payload["url"], json!("2024-03-01T10:00:00Z"));
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let h = harness(respond(|n, _| {
        if n == 1 {
            Err(ActionError::api("Service Unavailable", 503))
        } else {
            Ok(json!({"ok": true}))
        }
    }));

    let result = h
        .dispatcher
        .execute(&h.dest, "scripted", &event("a@b.com", json!({})), None, &Settings::new())
        .await
        .unwrap();
    assert_eq!(result.attempts, 2);
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let h = harness(respond(|_, _| Err(ActionError::retryable("still flaky"))));

    let err = h
        .dispatcher
        .execute(&h.dest, "scripted", &event("a@b.com", json!({})), None, &Settings::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Retryable);
    assert_eq!(h.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_terminal_failure_is_not_retried() {
    let h = harness(respond(|_, _| {
        Err(ActionError::integration("Currency is invalid", "INVALID_CURRENCY", 400))
    }));

    let err = h
        .dispatcher
        .execute(&h.dest, "scripted", &event("a@b.com", json!({})), None, &Settings::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_CURRENCY");
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_unauthorized_requests_refresh_once() {
    let h = harness_with(AuthScheme::OAuth2, refresh_ok(), unauthorized_until_refreshed());
    let settings = oauth_settings();
    let first = event("a@b.com", json!({}));
    let second = event("c@d.com", json!({}));

    let (a, b) = tokio::join!(
        h.dispatcher.execute(&h.dest, "scripted", &first, None, &settings),
        h.dispatcher.execute(&h.dest, "scripted", &second, None, &settings),
    );

    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.data, json!("delivered"));
    assert_eq!(b.data, json!("delivered"));
    assert_eq!(a.attempts, 2);
    assert_eq!(b.attempts, 2);
    assert_eq!(h.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_second_unauthorized_evicts_session() {
    let h = harness_with(
        AuthScheme::OAuth2,
        refresh_ok(),
        respond(|_, _| Err(ActionError::api("Unauthorized", 401))),
    );
    let settings = oauth_settings();

    let err = h
        .dispatcher
        .execute(&h.dest, "scripted", &event("a@b.com", json!({})), None, &settings)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAuthentication);
    assert_eq!(err.status(), 401);
    assert_eq!(h.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);

    // The evicted session starts over from the settings token
    let key = SessionKey::new("scripted", SettingsFingerprint::of(&settings));
    let oauth = OAuthSettings::from_settings(&settings).unwrap();
    let session = h.dispatcher.sessions().current(&key, &oauth).await;
    assert_eq!(session.access_token, "old");
    assert_eq!(session.generation, 2);
}

#[tokio::test]
async fn test_refresh_failure_is_invalid_authentication() {
    let h = harness_with(AuthScheme::OAuth2, refresh_rejected(), unauthorized_until_refreshed());

    let err = h
        .dispatcher
        .execute(&h.dest, "scripted", &event("a@b.com", json!({})), None, &oauth_settings())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAuthentication);
    assert_eq!(err.code(), OAUTH_REFRESH_FAILED);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_expiring_token_is_refreshed_before_dispatch() {
    let h = harness_with(AuthScheme::OAuth2, refresh_ok(), unauthorized_until_refreshed());
    let expires_at = chrono::Utc::now() + chrono::Duration::seconds(10);
    let settings = settings(json!({
        "oauth": {
            "access_token": "old",
            "refresh_token": "refresh-1",
            "expires_at": expires_at.to_rfc3339()
        }
    }));

    let result = h
        .dispatcher
        .execute(&h.dest, "scripted", &event("a@b.com", json!({})), None, &settings)
        .await
        .unwrap();
    assert_eq!(result.attempts, 1);
    assert_eq!(h.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transient_refresh_failure_is_retried() {
    let h = harness_with(
        AuthScheme::OAuth2,
        refresh(|n| {
            if n == 1 {
                Err(ActionError::api("Service Unavailable", 503))
            } else {
                issued(3600)
            }
        }),
        unauthorized_until_refreshed(),
    );

    let result = h
        .dispatcher
        .execute(&h.dest, "scripted", &event("a@b.com", json!({})), None, &oauth_settings())
        .await
        .unwrap();
    assert_eq!(result.data, json!("delivered"));
    assert_eq!(h.refreshes.load(Ordering::SeqCst), 2);
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_short_lived_token_is_reused() {
    let h = harness_with(
        AuthScheme::OAuth2,
        refresh(|_| issued(60)),
        unauthorized_until_refreshed(),
    );
    let expires_at = chrono::Utc::now() + chrono::Duration::seconds(10);
    let settings = settings(json!({
        "oauth": {
            "access_token": "old",
            "refresh_token": "refresh-1",
            "expires_at": expires_at.to_rfc3339()
        }
    }));

    for _ in 0..4 {
        h.dispatcher
            .execute(&h.dest, "scripted", &event("a@b.com", json!({})), None, &settings)
            .await
            .unwrap();
    }
    assert_eq!(h.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(h.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_oauth_destination_requires_oauth_settings() {
    let h = harness_with(AuthScheme::OAuth2, refresh_ok(), ok());
    let err = h
        .dispatcher
        .execute(&h.dest, "scripted", &event("a@b.com", json!({})), None, &Settings::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAuthentication);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_batch_respects_size_and_order() {
    let h = harness(ok());
    let settings = settings(json!({"apiKey": "k"}));
    let items: Vec<BatchItem> = ["a@b.com", "c@d.com", "e@f.com"]
        .iter()
        .map(|email| BatchItem {
            event: event(email, json!({"batch": true, "batch_size": 2})),
            settings: settings.clone(),
            mapping: None,
        })
        .collect();

    let results = h
        .dispatcher
        .execute_batch(&h.dest, "scripted", &items)
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.is_ok()));

    let batches = h.batches.lock().unwrap();
    let emails: Vec<Vec<&str>> = batches
        .iter()
        .map(|b| b.iter().map(|p| p["email"].as_str().unwrap()).collect())
        .collect();
    assert_eq!(emails, vec![vec!["a@b.com", "c@d.com"], vec!["e@f.com"]]);
}

#[tokio::test]
async fn test_configured_batch_size_applies() {
    let mut h = harness(ok());
    let mut config = EngineConfig::default();
    config.batching.default_batch_size = 2;
    h.dispatcher = Dispatcher::new(&config, Arc::new(AuthSessionStore::new(90)))
        .with_policy(fast_policy());
    let items: Vec<BatchItem> = ["a@b.com", "c@d.com", "e@f.com"]
        .iter()
        .map(|email| BatchItem {
            event: event(email, json!({"batch": true})),
            settings: settings(json!({"apiKey": "k"})),
            mapping: None,
        })
        .collect();

    let results = h
        .dispatcher
        .execute_batch(&h.dest, "scripted", &items)
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.is_ok()));
    let sizes: Vec<usize> = h.batches.lock().unwrap().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 1]);
}

#[tokio::test]
async fn test_batches_never_mix_settings() {
    let h = harness(ok());
    let items: Vec<BatchItem> = [("a@b.com", "k1"), ("c@d.com", "k2"), ("e@f.com", "k1")]
        .iter()
        .map(|(email, key)| BatchItem {
            event: event(email, json!({"batch": true})),
            settings: settings(json!({"apiKey": key})),
            mapping: None,
        })
        .collect();

    h.dispatcher
        .execute_batch(&h.dest, "scripted", &items)
        .await
        .unwrap();

    let mut sizes: Vec<usize> = h.batches.lock().unwrap().iter().map(Vec::len).collect();
    sizes.sort();
    assert_eq!(sizes, vec![1, 2]);
}

#[tokio::test]
async fn test_batch_failure_is_atomic() {
    let h = harness(respond(|_, _| Err(ActionError::api("Bad Request", 400))));
    let settings = Settings::new();
    let mut items: Vec<BatchItem> = ["a@b.com", "c@d.com"]
        .iter()
        .map(|email| BatchItem {
            event: event(email, json!({"batch": true})),
            settings: settings.clone(),
            mapping: None,
        })
        .collect();
    let mut invalid = event("x@y.com", json!({"batch": true}));
    invalid.traits.clear();
    items.push(BatchItem {
        event: invalid,
        settings,
        mapping: None,
    });

    let results = h
        .dispatcher
        .execute_batch(&h.dest, "scripted", &items)
        .await
        .unwrap();
    assert_eq!(results[0].as_ref().unwrap_err().status(), 400);
    assert_eq!(results[1].as_ref().unwrap_err().status(), 400);
    assert_eq!(
        results[2].as_ref().unwrap_err().kind(),
        ErrorKind::PayloadValidation
    );
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unbatched_items_use_perform() {
    let h = harness(ok());
    let items = vec![BatchItem {
        event: event("a@b.com", json!({})),
        settings: Settings::new(),
        mapping: None,
    }];

    let results = h
        .dispatcher
        .execute_batch(&h.dest, "scripted", &items)
        .await
        .unwrap();
    assert_eq!(results[0].as_ref().unwrap().attempts, 1);
    assert!(h.batches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_on_event_uses_default_subscriptions() {
    let h = harness(ok());

    let outcomes = h
        .dispatcher
        .on_event(&h.dest, &event("a@b.com", json!({})), &Settings::new())
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].action, "scripted");
    assert!(outcomes[0].result.is_ok());
}

#[tokio::test]
async fn test_on_event_uses_settings_subscriptions() {
    let h = harness(ok());
    let settings = settings(json!({
        "subscriptions": [{
            "name": "Identify only",
            "partnerAction": "scripted",
            "subscribe": "type = \"identify\""
        }]
    }));

    let outcomes = h
        .dispatcher
        .on_event(&h.dest, &event("a@b.com", json!({})), &settings)
        .await
        .unwrap();
    assert!(outcomes.is_empty());

    let mut identify = event("a@b.com", json!({}));
    identify.event_type = EventType::Identify;
    identify.event = None;
    let outcomes = h
        .dispatcher
        .on_event(&h.dest, &identify, &settings)
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].subscription.as_deref(), Some("Identify only"));
}

#[tokio::test]
async fn test_on_event_subscription_mapping_overrides_default() {
    let h = harness(ok());
    let settings = settings(json!({
        "subscriptions": [{
            "partnerAction": "scripted",
            "subscribe": "type = \"track\"",
            "mapping": {"email": {"@path": "$.properties.contact"}}
        }]
    }));

    let mut event = event("a@b.com", json!({"contact": "p@q.com", "batch": true}));
    event.traits.clear();
    let outcomes = h.dispatcher.on_event(&h.dest, &event, &settings).await.unwrap();
    assert!(outcomes[0].result.is_ok());
}

#[tokio::test]
async fn test_invalid_subscriptions_are_rejected() {
    let h = harness(ok());
    let settings = settings(json!({
        "subscriptions": [{"partnerAction": "scripted", "subscribe": "type ="}]
    }));

    let err = h
        .dispatcher
        .on_event(&h.dest, &event("a@b.com", json!({})), &settings)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_SUBSCRIPTION");
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_timeout_is_retryable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let h = harness(ok());
    let dispatcher = Dispatcher::new(&EngineConfig::default(), Arc::new(AuthSessionStore::new(90)))
        .with_policy(RetryPolicy::none())
        .with_request_timeout(Duration::from_millis(100));

    let err = dispatcher
        .execute(
            &h.dest,
            "scripted",
            &event("a@b.com", json!({"url": format!("http://{}/slow", addr)})),
            None,
            &Settings::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Retryable);
    assert_eq!(err.status(), 408);
}

#[tokio::test]
async fn test_basic_scheme_sends_credentials() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/basic")
        .match_header("authorization", "Basic dXNlcjpwYXNz")
        .with_status(200)
        .with_body("accepted")
        .create_async()
        .await;

    let h = harness_with(AuthScheme::Basic, refresh_ok(), ok());
    let settings = settings(json!({"username": "user", "password": "pass"}));
    let result = h
        .dispatcher
        .execute(
            &h.dest,
            "scripted",
            &event("a@b.com", json!({"url": format!("{}/basic", server.url())})),
            None,
            &settings,
        )
        .await
        .unwrap();
    assert_eq!(result.data, json!("accepted"));
    mock.assert_async().await;
}
