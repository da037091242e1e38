use crate::audience::{
    AudienceDestination, AudienceSyncInput, CreateAudienceInput, GetAudienceInput, RemoteAudience,
};
use crate::request::{RequestClient, RequestOptions};
use actionkit::{ActionError, Settings};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

/// Audiences managed through user-supplied endpoints.
///
/// - create: `POST {audienceName, audienceSettings}` → `{externalId}`
/// - get: `POST {externalId}` → `{externalId, name?}`, 404 when unknown
/// - sync: `POST {externalId, action: "add"|"remove", payload}`
pub struct WebhookAudience;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudienceResponse {
    #[serde(default)]
    external_id: Option<Value>,
    #[serde(default)]
    name: Option<String>,
}

impl AudienceResponse {
    /// Accepts string or numeric ids.
    fn external_id(&self) -> Option<String> {
        match &self.external_id {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

fn endpoint<'a>(settings: &'a Settings, key: &str) -> Result<&'a str, ActionError> {
    settings
        .get(key)
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| {
            ActionError::integration(format!("Missing setting '{}'", key), "MISSING_SETTING", 400)
        })
}

fn invalid_response(message: &str) -> ActionError {
    ActionError::integration(message, "INVALID_RESPONSE", 400)
}

#[async_trait]
impl AudienceDestination for WebhookAudience {
    async fn create_audience(
        &self,
        request: &RequestClient,
        input: CreateAudienceInput<'_>,
    ) -> Result<String, ActionError> {
        let url = endpoint(input.settings, "create_audience_url")?;
        let body = json!({
            "audienceName": input.audience_name,
            "audienceSettings": input.audience_settings,
        });
        let response = request.request(url, RequestOptions::post_json(body)).await?;
        let parsed: AudienceResponse = response.json()?;
        parsed
            .external_id()
            .ok_or_else(|| invalid_response("Create audience response has no externalId"))
    }

    async fn get_audience(
        &self,
        request: &RequestClient,
        input: GetAudienceInput<'_>,
    ) -> Result<Option<RemoteAudience>, ActionError> {
        let url = endpoint(input.settings, "get_audience_url")?;
        let response = request
            .request(
                url,
                RequestOptions::post_json(json!({"externalId": input.external_id}))
                    .allow_http_errors(),
            )
            .await?;

        if response.status == 404 {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(ActionError::api(
                format!("Get audience failed with status {}", response.status),
                response.status,
            ));
        }

        let parsed: AudienceResponse = response.json()?;
        let external_id = parsed
            .external_id()
            .ok_or_else(|| invalid_response("Get audience response has no externalId"))?;
        if external_id != input.external_id {
            return Err(invalid_response("Get audience response is for a different audience"));
        }
        Ok(Some(RemoteAudience {
            external_id,
            name: parsed.name,
        }))
    }

    async fn sync_members(
        &self,
        request: &RequestClient,
        input: AudienceSyncInput<'_>,
    ) -> Result<Value, ActionError> {
        let url = endpoint(input.settings, "sync_audience_url")?;
        let body = json!({
            "externalId": input.external_id,
            "action": input.op.as_str(),
            "payload": input.payload,
        });
        let response = request.request(url, RequestOptions::post_json(body)).await?;
        Ok(response.data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audience::MembershipOp;
    use actionkit::{ErrorKind, Payload};
    use mockito::Matcher;

    fn client() -> RequestClient {
        RequestClient::new(reqwest::Client::new())
    }

    fn settings(server: &mockito::Server) -> Settings {
        serde_json::from_value(json!({
            "create_audience_url": format!("{}/audiences", server.url()),
            "get_audience_url": format!("{}/audiences/get", server.url()),
            "sync_audience_url": format!("{}/audiences/sync", server.url()),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_audience() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/audiences")
            .match_body(Matcher::PartialJson(json!({"audienceName": "VIPs"})))
            .with_status(200)
            .with_body(r#"{"externalId": 42}"#)
            .create_async()
            .await;

        let settings = settings(&server);
        let id = WebhookAudience
            .create_audience(
                &client(),
                CreateAudienceInput {
                    audience_name: "VIPs",
                    settings: &settings,
                    audience_settings: &Payload::new(),
                    auth: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(id, "42");
    }

    #[tokio::test]
    async fn test_create_audience_rejects_missing_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/audiences")
            .with_status(200)
            .with_body(r#"{"ok": true}"#)
            .create_async()
            .await;

        let settings = settings(&server);
        let err = WebhookAudience
            .create_audience(
                &client(),
                CreateAudienceInput {
                    audience_name: "VIPs",
                    settings: &settings,
                    audience_settings: &Payload::new(),
                    auth: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integration);
        assert_eq!(err.code(), "INVALID_RESPONSE");
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_get_audience_missing_returns_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/audiences/get")
            .with_status(404)
            .create_async()
            .await;

        let settings = settings(&server);
        let remote = WebhookAudience
            .get_audience(
                &client(),
                GetAudienceInput {
                    external_id: "aud-1",
                    settings: &settings,
                    audience_settings: &Payload::new(),
                    auth: None,
                },
            )
            .await
            .unwrap();
        assert!(remote.is_none());
    }

    #[tokio::test]
    async fn test_sync_sends_remove() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/audiences/sync")
            .match_body(Matcher::PartialJson(json!({"externalId": "aud-1", "action": "remove"})))
            .with_status(200)
            .create_async()
            .await;

        let settings = settings(&server);
        WebhookAudience
            .sync_members(
                &client(),
                AudienceSyncInput {
                    external_id: "aud-1",
                    op: MembershipOp::Remove,
                    payload: &Payload::new(),
                    settings: &settings,
                    auth: None,
                },
            )
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_endpoint_setting() {
        let err = WebhookAudience
            .sync_members(
                &client(),
                AudienceSyncInput {
                    external_id: "aud-1",
                    op: MembershipOp::Add,
                    payload: &Payload::new(),
                    settings: &Settings::new(),
                    auth: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MISSING_SETTING");
    }
}
