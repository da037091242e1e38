pub mod audience;
pub mod send;

use crate::audience::AudienceDestination;
use crate::auth::AuthTokens;
use crate::destination::{ActionDefinition, AuthScheme, Authentication, Destination};
use crate::request::RequestOptions;
use actionkit::{FieldSchema, FieldType, Fields, Settings};
use serde_json::Value;
use std::sync::Arc;

use self::audience::WebhookAudience;
use self::send::SendAction;

pub const SLUG: &str = "webhook";
pub const SECRET_HEADER: &str = "X-Shared-Secret";

/// Generic webhook destination: forwards events as JSON to any URL and
/// manages audiences through three configurable endpoints.
#[derive(Default)]
pub struct WebhookDestination;

impl WebhookDestination {
    pub fn new() -> Self {
        Self
    }
}

impl Destination for WebhookDestination {
    fn name(&self) -> &str {
        "Webhook"
    }

    fn slug(&self) -> &str {
        SLUG
    }

    fn authentication(&self) -> Authentication {
        let mut fields = Fields::new();
        fields.insert(
            "shared_secret".to_string(),
            FieldSchema::new(FieldType::Password, "Shared Secret")
                .description("Sent with every request in the X-Shared-Secret header."),
        );
        fields.insert(
            "create_audience_url".to_string(),
            FieldSchema::string("Create Audience URL"),
        );
        fields.insert(
            "get_audience_url".to_string(),
            FieldSchema::string("Get Audience URL"),
        );
        fields.insert(
            "sync_audience_url".to_string(),
            FieldSchema::string("Sync Audience URL"),
        );
        Authentication::new(AuthScheme::Custom, fields)
    }

    fn extend_request(&self, settings: &Settings, _auth: Option<&AuthTokens>) -> RequestOptions {
        match settings.get("shared_secret").and_then(Value::as_str) {
            Some(secret) if !secret.is_empty() => {
                RequestOptions::default().header(SECRET_HEADER, secret)
            }
            _ => RequestOptions::default(),
        }
    }

    fn actions(&self) -> Vec<(String, Arc<dyn ActionDefinition>)> {
        vec![("send".to_string(), Arc::new(SendAction))]
    }

    fn audience(&self) -> Option<Arc<dyn AudienceDestination>> {
        Some(Arc::new(WebhookAudience))
    }
}
