//! Audience destinations and their lifecycle.
//!
//! An audience moves through `Unsynced → Created → Syncing → Ready`. Records
//! are kept per (destination, settings fingerprint, audience name);
//! creation checks the record under its lock first, so asking twice for the
//! same audience returns the same external id without a second remote call.

use crate::auth::AuthTokens;
use crate::destination::{LoadedAudience, LoadedDestination};
use crate::dispatcher::{prepared_event, Dispatched, Dispatcher};
use crate::request::RequestClient;
use actionkit::{ActionError, Event, FieldSchema, Fields, Payload, Settings, SettingsFingerprint};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const COMPUTATION_KEY_FIELD: &str = "computation_key";
pub const EXTERNAL_AUDIENCE_ID_FIELD: &str = "external_audience_id";
pub const TRAITS_OR_PROPS_FIELD: &str = "traits_or_props";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudienceMode {
    /// Membership changes are pushed as they happen
    Realtime,
    /// Membership is synced in periodic runs
    Synced,
}

pub struct CreateAudienceInput<'a> {
    pub audience_name: &'a str,
    pub settings: &'a Settings,
    pub audience_settings: &'a Payload,
    pub auth: Option<&'a AuthTokens>,
}

pub struct GetAudienceInput<'a> {
    pub external_id: &'a str,
    pub settings: &'a Settings,
    pub audience_settings: &'a Payload,
    pub auth: Option<&'a AuthTokens>,
}

pub struct AudienceSyncInput<'a> {
    pub external_id: &'a str,
    pub op: MembershipOp,
    pub payload: &'a Payload,
    pub settings: &'a Settings,
    pub auth: Option<&'a AuthTokens>,
}

/// Audience as reported by the partner.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAudience {
    pub external_id: String,
    pub name: Option<String>,
}

#[async_trait]
pub trait AudienceDestination: Send + Sync {
    fn mode(&self) -> AudienceMode {
        AudienceMode::Realtime
    }

    /// Per-audience settings fields
    fn audience_fields(&self) -> Fields {
        Fields::new()
    }

    /// Creates the remote audience and returns its external id.
    async fn create_audience(
        &self,
        request: &RequestClient,
        input: CreateAudienceInput<'_>,
    ) -> Result<String, ActionError>;

    /// `None` when the partner no longer knows the audience.
    async fn get_audience(
        &self,
        request: &RequestClient,
        input: GetAudienceInput<'_>,
    ) -> Result<Option<RemoteAudience>, ActionError>;

    async fn sync_members(
        &self,
        request: &RequestClient,
        input: AudienceSyncInput<'_>,
    ) -> Result<Value, ActionError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipOp {
    Add,
    Remove,
}

impl MembershipOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipOp::Add => "add",
            MembershipOp::Remove => "remove",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudienceState {
    Unsynced,
    Created,
    Syncing,
    Ready,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Drift {
    InSync,
    Renamed { remote_name: String },
    Missing,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudienceRecord {
    pub audience_name: String,
    pub external_id: Option<String>,
    pub state: AudienceState,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    pub external_id: String,
    pub remote: Option<RemoteAudience>,
    pub local: Option<AudienceRecord>,
    pub drift: Drift,
}

/// Reads add vs remove from the payload.
///
/// The value under `traits_or_props[computation_key]` must be a boolean;
/// anything else is rejected instead of guessed.
pub fn membership_op(payload: &Payload) -> Result<MembershipOp, ActionError> {
    let key = payload
        .get(COMPUTATION_KEY_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::payload_validation("Missing audience computation key."))?;
    let membership = payload
        .get(TRAITS_OR_PROPS_FIELD)
        .and_then(Value::as_object)
        .and_then(|values| values.get(key));

    match membership {
        Some(Value::Bool(true)) => Ok(MembershipOp::Add),
        Some(Value::Bool(false)) => Ok(MembershipOp::Remove),
        Some(other) => Err(ActionError::payload_validation(format!(
            "Audience membership '{}' should be a boolean but it was {}.",
            key,
            json_type(other)
        ))),
        None => Err(ActionError::payload_validation(format!(
            "Audience membership '{}' is missing from traits or properties.",
            key
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Fields resolved from an audience event before syncing.
pub fn sync_fields() -> Fields {
    let mut fields = Fields::new();
    fields.insert(
        COMPUTATION_KEY_FIELD.to_string(),
        FieldSchema::string("Audience Key")
            .required()
            .default_mapping(json!({"@path": "$.context.personas.computation_key"})),
    );
    fields.insert(
        EXTERNAL_AUDIENCE_ID_FIELD.to_string(),
        FieldSchema::string("External Audience ID")
            .required()
            .default_mapping(json!({"@path": "$.context.personas.external_audience_id"})),
    );
    fields.insert(
        TRAITS_OR_PROPS_FIELD.to_string(),
        FieldSchema::object("Traits or Properties")
            .required()
            .default_mapping(json!({
                "@if": {
                    "exists": {"@path": "$.traits"},
                    "then": {"@path": "$.traits"},
                    "else": {"@path": "$.properties"}
                }
            })),
    );
    fields.insert(
        "user_id".to_string(),
        FieldSchema::string("User ID").default_mapping(json!({"@path": "$.userId"})),
    );
    fields.insert(
        "email".to_string(),
        FieldSchema::string("Email").default_mapping(json!({
            "@if": {
                "exists": {"@path": "$.traits.email"},
                "then": {"@path": "$.traits.email"},
                "else": {"@path": "$.properties.email"}
            }
        })),
    );
    fields
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct AudienceKey {
    destination: String,
    fingerprint: SettingsFingerprint,
    audience_name: String,
}

type Record = Arc<Mutex<AudienceRecord>>;

/// Tracks audience state and drives the three audience operations through
/// the dispatcher.
pub struct AudienceLifecycle {
    dispatcher: Arc<Dispatcher>,
    records: DashMap<AudienceKey, Record>,
    by_external: DashMap<(String, String), AudienceKey>,
}

impl AudienceLifecycle {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            records: DashMap::new(),
            by_external: DashMap::new(),
        }
    }

    fn record(&self, key: &AudienceKey) -> Record {
        self.records
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(AudienceRecord {
                    audience_name: key.audience_name.clone(),
                    external_id: None,
                    state: AudienceState::Unsynced,
                }))
            })
            .value()
            .clone()
    }

    fn record_for_external(&self, destination: &str, external_id: &str) -> Option<Record> {
        let key = self
            .by_external
            .get(&(destination.to_string(), external_id.to_string()))
            .map(|k| k.value().clone())?;
        self.records.get(&key).map(|r| r.value().clone())
    }

    /// Returns the local record for the audience, if one exists.
    pub async fn state(
        &self,
        dest: &LoadedDestination,
        settings: &Settings,
        audience_name: &str,
    ) -> Option<AudienceRecord> {
        let key = AudienceKey {
            destination: dest.slug().to_string(),
            fingerprint: SettingsFingerprint::of(settings),
            audience_name: audience_name.to_string(),
        };
        let record = self.records.get(&key).map(|r| r.value().clone())?;
        let record = record.lock().await;
        Some(record.clone())
    }

    /// Creates the remote audience unless this audience already has an
    /// external id.
    pub async fn create_audience(
        &self,
        dest: &LoadedDestination,
        settings: &Settings,
        audience_name: &str,
        audience_settings: Payload,
    ) -> Result<AudienceRecord, ActionError> {
        let audience = loaded_audience(dest)?;
        if audience_name.trim().is_empty() {
            return Err(ActionError::payload_validation("Missing audience name value."));
        }
        let validated = dest.validate_settings(settings)?;
        let audience_settings = audience.settings_fields.validate(audience_settings)?;

        let key = AudienceKey {
            destination: dest.slug().to_string(),
            fingerprint: SettingsFingerprint::of(settings),
            audience_name: audience_name.to_string(),
        };
        let slot = self.record(&key);
        let mut record = slot.lock().await;
        if record.external_id.is_some() {
            info!(
                destination = %dest.slug(),
                audience = %audience_name,
                "Audience already exists, reusing external id"
            );
            return Ok(record.clone());
        }

        let definition = &audience.definition;
        let validated = &validated;
        let audience_settings = &audience_settings;
        let (external_id, _) = self
            .dispatcher
            .run(dest, settings, "create_audience", move |request, auth| async move {
                definition
                    .create_audience(
                        &request,
                        CreateAudienceInput {
                            audience_name,
                            settings: validated,
                            audience_settings,
                            auth: auth.as_ref(),
                        },
                    )
                    .await
            })
            .await?;

        if external_id.is_empty() {
            return Err(ActionError::integration(
                "Audience creation returned no external id",
                "INVALID_RESPONSE",
                400,
            ));
        }

        record.external_id = Some(external_id.clone());
        record.state = AudienceState::Created;
        self.by_external
            .insert((dest.slug().to_string(), external_id.clone()), key);

        info!(
            destination = %dest.slug(),
            audience = %audience_name,
            external_id = %external_id,
            "Audience created"
        );
        Ok(record.clone())
    }

    /// Compares the remote audience with the local record.
    ///
    /// A missing remote audience resets the local record to `Unsynced` so
    /// the next create call recreates it.
    pub async fn get_audience(
        &self,
        dest: &LoadedDestination,
        settings: &Settings,
        external_id: &str,
        audience_settings: Payload,
    ) -> Result<Reconciliation, ActionError> {
        let audience = loaded_audience(dest)?;
        let validated = dest.validate_settings(settings)?;
        let audience_settings = audience.settings_fields.validate(audience_settings)?;

        let definition = &audience.definition;
        let validated = &validated;
        let audience_settings = &audience_settings;
        let (remote, _) = self
            .dispatcher
            .run(dest, settings, "get_audience", move |request, auth| async move {
                definition
                    .get_audience(
                        &request,
                        GetAudienceInput {
                            external_id,
                            settings: validated,
                            audience_settings,
                            auth: auth.as_ref(),
                        },
                    )
                    .await
            })
            .await?;

        let local = match self.record_for_external(dest.slug(), external_id) {
            Some(slot) => {
                let mut record = slot.lock().await;
                if remote.is_none() {
                    record.external_id = None;
                    record.state = AudienceState::Unsynced;
                    self.by_external
                        .remove(&(dest.slug().to_string(), external_id.to_string()));
                }
                Some(record.clone())
            }
            None => None,
        };

        let drift = match (&remote, &local) {
            (None, _) => Drift::Missing,
            (Some(RemoteAudience { name: Some(remote_name), .. }), Some(local))
                if *remote_name != local.audience_name =>
            {
                Drift::Renamed {
                    remote_name: remote_name.clone(),
                }
            }
            _ => Drift::InSync,
        };

        if drift != Drift::InSync {
            warn!(
                destination = %dest.slug(),
                external_id = %external_id,
                drift = ?drift,
                "Audience drift detected"
            );
        }

        Ok(Reconciliation {
            external_id: external_id.to_string(),
            remote,
            local,
            drift,
        })
    }

    /// Resolves the sync fields from an audience event and syncs it.
    pub async fn sync_event(
        &self,
        dest: &LoadedDestination,
        event: &Event,
        settings: &Settings,
    ) -> Result<Dispatched, ActionError> {
        let audience = loaded_audience(dest)?;
        let data = prepared_event(event);
        let payload =
            audience
                .sync_fields
                .resolve(None, &data, self.dispatcher.resolve_options())?;
        self.sync(dest, &payload, settings).await
    }

    /// Adds or removes one member.
    pub async fn sync(
        &self,
        dest: &LoadedDestination,
        payload: &Payload,
        settings: &Settings,
    ) -> Result<Dispatched, ActionError> {
        let audience = loaded_audience(dest)?;
        let op = membership_op(payload)?;
        let external_id = payload
            .get(EXTERNAL_AUDIENCE_ID_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::payload_validation("Missing external audience id."))?;
        let validated = dest.validate_settings(settings)?;

        let slot = self.record_for_external(dest.slug(), external_id);
        if let Some(slot) = &slot {
            slot.lock().await.state = AudienceState::Syncing;
        }

        let definition = &audience.definition;
        let validated = &validated;
        let result = self
            .dispatcher
            .run(dest, settings, "sync_audience", move |request, auth| async move {
                definition
                    .sync_members(
                        &request,
                        AudienceSyncInput {
                            external_id,
                            op,
                            payload,
                            settings: validated,
                            auth: auth.as_ref(),
                        },
                    )
                    .await
            })
            .await;

        if let Some(slot) = &slot {
            slot.lock().await.state = match &result {
                Ok(_) => AudienceState::Ready,
                Err(_) => AudienceState::Created,
            };
        }

        let (data, attempts) = result?;
        info!(
            destination = %dest.slug(),
            external_id = %external_id,
            op = op.as_str(),
            "Audience membership synced"
        );
        Ok(Dispatched { data, attempts })
    }
}

fn loaded_audience(dest: &LoadedDestination) -> Result<&LoadedAudience, ActionError> {
    dest.audience().ok_or_else(|| {
        ActionError::integration(
            format!("Destination '{}' does not support audiences", dest.slug()),
            "AUDIENCE_NOT_SUPPORTED",
            400,
        )
    })
}
