use crate::audience::{self, AudienceDestination};
use crate::auth::{refresh_with_token_endpoint, AuthTokens, RefreshedToken};
use crate::request::{RequestClient, RequestOptions};
use actionkit::errors::NOT_IMPLEMENTED;
use actionkit::settings::destination_settings;
use actionkit::subscription::{fql, CompiledSubscription};
use actionkit::{ActionError, CompiledFields, Fields, Payload, Settings};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    /// Opaque credentials from settings, applied by `extend_request`
    Custom,
    /// `settings.username` / `settings.password`
    Basic,
    OAuth2,
}

/// Authentication declared by a destination.
#[derive(Clone, Debug)]
pub struct Authentication {
    pub scheme: AuthScheme,
    /// Settings fields, validated before every dispatch
    pub fields: Fields,
}

impl Authentication {
    pub fn new(scheme: AuthScheme, fields: Fields) -> Self {
        Self { scheme, fields }
    }
}

/// Input to [`ActionDefinition::perform`].
pub struct ExecuteInput<'a> {
    pub payload: &'a Payload,
    pub settings: &'a Settings,
    pub auth: Option<&'a AuthTokens>,
}

/// Input to [`ActionDefinition::perform_batch`]. Payloads are in arrival
/// order and share one settings fingerprint.
pub struct BatchInput<'a> {
    pub payloads: &'a [Payload],
    pub settings: &'a Settings,
    pub auth: Option<&'a AuthTokens>,
}

/// An operation a destination exposes.
///
/// `perform` only ever sees payloads that passed field validation; the
/// `request` client already carries the destination's `extend_request`
/// options and the configured timeout.
#[async_trait]
pub trait ActionDefinition: Send + Sync {
    fn title(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn fields(&self) -> Fields;

    /// FQL condition used when settings carry no subscriptions.
    fn default_subscription(&self) -> Option<&str> {
        None
    }

    fn supports_batch(&self) -> bool {
        false
    }

    async fn perform(
        &self,
        request: &RequestClient,
        input: ExecuteInput<'_>,
    ) -> Result<Value, ActionError>;

    async fn perform_batch(
        &self,
        _request: &RequestClient,
        _input: BatchInput<'_>,
    ) -> Result<Value, ActionError> {
        Err(ActionError::integration(
            format!("{} does not support batching", self.title()),
            NOT_IMPLEMENTED,
            501,
        ))
    }
}

/// A destination: authentication plus a set of actions.
///
/// Destinations are stateless; sessions, retries and batching live in the
/// [`Dispatcher`](crate::Dispatcher).
///
/// # Example
/// ```no_run
/// use actionkit::{ActionError, Fields};
/// use async_trait::async_trait;
/// use destination_runtime::{
///     ActionDefinition, AuthScheme, Authentication, Destination, ExecuteInput, RequestClient,
///     RequestOptions,
/// };
/// use serde_json::Value;
/// use std::sync::Arc;
///
/// struct Ping;
///
/// #[async_trait]
/// impl ActionDefinition for Ping {
///     fn title(&self) -> &str {
///         "Ping"
///     }
///
///     fn fields(&self) -> Fields {
///         Fields::new()
///     }
///
///     async fn perform(
///         &self,
///         request: &RequestClient,
///         input: ExecuteInput<'_>,
///     ) -> Result<Value, ActionError> {
///         let response = request
///             .request("https://api.example.com/ping", RequestOptions::post_json(Value::Object(input.payload.clone())))
///             .await?;
///         Ok(response.data())
///     }
/// }
///
/// struct Example;
///
/// #[async_trait]
/// impl Destination for Example {
///     fn name(&self) -> &str {
///         "Example"
///     }
///
///     fn slug(&self) -> &str {
///         "example"
///     }
///
///     fn authentication(&self) -> Authentication {
///         Authentication::new(AuthScheme::Custom, Fields::new())
///     }
///
///     fn actions(&self) -> Vec<(String, Arc<dyn ActionDefinition>)> {
///         vec![("ping".to_string(), Arc::new(Ping))]
///     }
/// }
/// ```
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    /// Unique lowercase identifier, used in routes, session keys and logs.
    fn slug(&self) -> &str;

    fn authentication(&self) -> Authentication;

    /// Options merged into every outbound request. Called once per request.
    ///
    /// The default sends OAuth2 access tokens as a bearer header.
    fn extend_request(&self, _settings: &Settings, auth: Option<&AuthTokens>) -> RequestOptions {
        match auth {
            Some(tokens) if !tokens.access_token.is_empty() => RequestOptions::default()
                .header("Authorization", format!("Bearer {}", tokens.access_token)),
            _ => RequestOptions::default(),
        }
    }

    async fn refresh_access_token(
        &self,
        request: &RequestClient,
        _settings: &Settings,
        auth: &AuthTokens,
    ) -> Result<RefreshedToken, ActionError> {
        refresh_with_token_endpoint(request, auth).await
    }

    /// Checks credentials; not part of dispatch.
    async fn test_authentication(
        &self,
        _request: &RequestClient,
        _settings: &Settings,
    ) -> Result<(), ActionError> {
        Ok(())
    }

    fn actions(&self) -> Vec<(String, Arc<dyn ActionDefinition>)>;

    fn audience(&self) -> Option<Arc<dyn AudienceDestination>> {
        None
    }

    fn default_batch_size(&self) -> Option<usize> {
        None
    }
}

/// A destination that failed to load.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationError {
    pub destination: String,
    pub context: String,
    pub message: String,
}

impl RegistrationError {
    fn new(destination: &str, context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            destination: destination.to_string(),
            context: context.into(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "destination '{}', {}: {}", self.destination, self.context, self.message)
    }
}

impl std::error::Error for RegistrationError {}

pub struct LoadedAction {
    pub key: String,
    pub definition: Arc<dyn ActionDefinition>,
    pub fields: CompiledFields,
    pub default_subscription: Option<CompiledSubscription>,
}

pub struct LoadedAudience {
    pub definition: Arc<dyn AudienceDestination>,
    pub settings_fields: CompiledFields,
    pub sync_fields: CompiledFields,
}

/// A destination with every mapping and subscription compiled.
///
/// Loading fails on the first invalid default mapping or default
/// subscription, so nothing malformed reaches event time.
pub struct LoadedDestination {
    definition: Arc<dyn Destination>,
    slug: String,
    authentication: Authentication,
    settings_fields: CompiledFields,
    actions: Vec<LoadedAction>,
    audience: Option<LoadedAudience>,
}

impl LoadedDestination {
    pub fn load(definition: Arc<dyn Destination>) -> Result<Self, RegistrationError> {
        let slug = definition.slug().to_string();
        let authentication = definition.authentication();
        let settings_fields = CompiledFields::compile(&authentication.fields)
            .map_err(|e| RegistrationError::new(&slug, "authentication fields", e))?;

        let mut actions: Vec<LoadedAction> = Vec::new();
        for (key, action) in definition.actions() {
            if actions.iter().any(|a| a.key == key) {
                return Err(RegistrationError::new(
                    &slug,
                    format!("action '{}'", key),
                    "declared twice",
                ));
            }
            let fields = CompiledFields::compile(&action.fields())
                .map_err(|e| RegistrationError::new(&slug, format!("action '{}' fields", key), e))?;
            let default_subscription = match action.default_subscription() {
                Some(subscribe) => {
                    let condition = fql::parse(subscribe).map_err(|e| {
                        RegistrationError::new(&slug, format!("action '{}' default subscription", key), e)
                    })?;
                    Some(CompiledSubscription {
                        name: Some(action.title().to_string()),
                        partner_action: key.clone(),
                        condition,
                        mapping: None,
                    })
                }
                None => None,
            };
            actions.push(LoadedAction {
                key,
                definition: action,
                fields,
                default_subscription,
            });
        }

        let audience = match definition.audience() {
            Some(audience) => {
                let settings_fields = CompiledFields::compile(&audience.audience_fields())
                    .map_err(|e| RegistrationError::new(&slug, "audience fields", e))?;
                let sync_fields = CompiledFields::compile(&audience::sync_fields())
                    .map_err(|e| RegistrationError::new(&slug, "audience sync fields", e))?;
                Some(LoadedAudience {
                    definition: audience,
                    settings_fields,
                    sync_fields,
                })
            }
            None => None,
        };

        Ok(Self {
            definition,
            slug,
            authentication,
            settings_fields,
            actions,
            audience,
        })
    }

    pub fn definition(&self) -> &Arc<dyn Destination> {
        &self.definition
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn scheme(&self) -> AuthScheme {
        self.authentication.scheme
    }

    pub fn action(&self, key: &str) -> Result<&LoadedAction, ActionError> {
        self.actions.iter().find(|a| a.key == key).ok_or_else(|| {
            ActionError::integration(
                format!("Action '{}' is not defined for destination '{}'", key, self.slug),
                "ACTION_NOT_FOUND",
                404,
            )
        })
    }

    pub fn actions(&self) -> impl Iterator<Item = &LoadedAction> {
        self.actions.iter()
    }

    pub fn audience(&self) -> Option<&LoadedAudience> {
        self.audience.as_ref()
    }

    /// Validates settings against the authentication fields.
    ///
    /// Returns the coerced settings without the reserved keys.
    pub fn validate_settings(&self, settings: &Settings) -> Result<Settings, ActionError> {
        self.settings_fields.validate(destination_settings(settings))
    }

    /// Subscriptions used when settings carry none.
    pub fn default_subscriptions(&self) -> Vec<CompiledSubscription> {
        self.actions
            .iter()
            .filter_map(|a| a.default_subscription.clone())
            .collect()
    }
}
