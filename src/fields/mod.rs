//! Action field schemas.
//!
//! A [`FieldSchema`] declares the type, requirement and default mapping of
//! one input field. Schemas are compiled into [`CompiledFields`] when a
//! destination is registered; from then on resolving an event into a
//! [`Payload`] is synchronous: each field's mapping is resolved, coerced to
//! the declared type, then checked as a whole so conditional requirements see
//! their resolved siblings.

use crate::errors::ActionError;
use crate::mapping::{Mapping, MappingError, ResolveOptions};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

mod coerce;
mod validate;

pub use coerce::coerce;

/// Fully resolved field values for one event.
pub type Payload = Map<String, Value>;

/// Field declarations keyed by field name.
pub type Fields = BTreeMap<String, FieldSchema>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Text,
    Password,
    Number,
    Integer,
    Boolean,
    Object,
    Datetime,
}

impl FieldType {
    /// Name used in validation messages.
    pub fn describe(&self) -> &'static str {
        match self {
            FieldType::String | FieldType::Text | FieldType::Password => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Datetime => "datetime",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    #[default]
    Never,
    Always,
    When(DependsOn),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Is,
    IsNot,
}

/// One predicate over a sibling field.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldCondition {
    pub field_key: String,
    pub operator: ConditionOperator,
    /// Expected value; an array means "one of". `None` tests for presence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl FieldCondition {
    pub fn is(field_key: impl Into<String>, value: Value) -> Self {
        Self {
            field_key: field_key.into(),
            operator: ConditionOperator::Is,
            value: Some(value),
        }
    }

    pub fn is_not(field_key: impl Into<String>, value: Value) -> Self {
        Self {
            field_key: field_key.into(),
            operator: ConditionOperator::IsNot,
            value: Some(value),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DependsOn {
    #[serde(rename = "match")]
    pub match_mode: MatchMode,
    pub conditions: Vec<FieldCondition>,
}

impl DependsOn {
    pub fn all(conditions: Vec<FieldCondition>) -> Self {
        Self {
            match_mode: MatchMode::All,
            conditions,
        }
    }

    pub fn any(conditions: Vec<FieldCondition>) -> Self {
        Self {
            match_mode: MatchMode::Any,
            conditions,
        }
    }
}

/// Declaration of one action or settings field.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub label: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub required: Requirement,
    pub multiple: bool,
    pub allow_null: bool,
    /// Default mapping, as authored JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Visibility condition: a hidden field is dropped and never required
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Fields>,
    pub additional_properties: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
}

impl FieldSchema {
    pub fn new(field_type: FieldType, label: impl Into<String>) -> Self {
        Self {
            field_type,
            label: label.into(),
            description: String::new(),
            required: Requirement::Never,
            multiple: false,
            allow_null: false,
            default: None,
            depends_on: None,
            choices: None,
            properties: None,
            additional_properties: true,
            minimum: None,
            maximum: None,
        }
    }

    pub fn string(label: impl Into<String>) -> Self {
        Self::new(FieldType::String, label)
    }

    pub fn number(label: impl Into<String>) -> Self {
        Self::new(FieldType::Number, label)
    }

    pub fn integer(label: impl Into<String>) -> Self {
        Self::new(FieldType::Integer, label)
    }

    pub fn boolean(label: impl Into<String>) -> Self {
        Self::new(FieldType::Boolean, label)
    }

    pub fn object(label: impl Into<String>) -> Self {
        Self::new(FieldType::Object, label)
    }

    pub fn datetime(label: impl Into<String>) -> Self {
        Self::new(FieldType::Datetime, label)
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = Requirement::Always;
        self
    }

    pub fn required_when(mut self, condition: DependsOn) -> Self {
        self.required = Requirement::When(condition);
        self
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn allow_null(mut self) -> Self {
        self.allow_null = true;
        self
    }

    pub fn default_mapping(mut self, mapping: Value) -> Self {
        self.default = Some(mapping);
        self
    }

    pub fn depends_on(mut self, condition: DependsOn) -> Self {
        self.depends_on = Some(condition);
        self
    }

    pub fn choices(mut self, choices: Vec<Value>) -> Self {
        self.choices = Some(choices);
        self
    }

    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn strict_properties(mut self) -> Self {
        self.additional_properties = false;
        self
    }

    pub fn range(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }
}

/// A field with its default mapping and nested properties compiled.
#[derive(Clone, Debug)]
pub struct CompiledField {
    pub key: String,
    pub schema: FieldSchema,
    pub default: Option<Mapping>,
    pub properties: Option<CompiledFields>,
}

/// Compiled form of [`Fields`], ready to resolve events.
#[derive(Clone, Debug, Default)]
pub struct CompiledFields {
    fields: Vec<CompiledField>,
}

impl CompiledFields {
    /// Compiles every default mapping, failing on the first invalid one.
    ///
    /// Errors carry the field key in their pointer, e.g.
    /// `/email/default/@path should be a string ...`.
    pub fn compile(fields: &Fields) -> Result<Self, MappingError> {
        let mut compiled = Vec::with_capacity(fields.len());
        for (key, schema) in fields {
            let default = match &schema.default {
                Some(raw) => Some(
                    Mapping::parse(raw).map_err(|err| nested_error(err, key, "default"))?,
                ),
                None => None,
            };
            let properties = match &schema.properties {
                Some(nested) => Some(
                    Self::compile(nested).map_err(|err| nested_error(err, key, "properties"))?,
                ),
                None => None,
            };
            compiled.push(CompiledField {
                key: key.clone(),
                schema: schema.clone(),
                default,
                properties,
            });
        }
        Ok(Self { fields: compiled })
    }

    pub fn get(&self, key: &str) -> Option<&CompiledField> {
        self.fields.iter().find(|f| f.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledField> {
        self.fields.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolves `data` into a validated payload.
    ///
    /// A field's value comes from `overrides` (an object mapping keyed by
    /// field) when it names the field, otherwise from the field's default.
    pub fn resolve(
        &self,
        overrides: Option<&Mapping>,
        data: &Value,
        options: &ResolveOptions,
    ) -> Result<Payload, ActionError> {
        let mut values = Map::new();
        for field in &self.fields {
            let mapping = overrides
                .and_then(|m| m.field(&field.key))
                .or(field.default.as_ref());
            if let Some(value) = mapping.and_then(|m| m.resolve_with(data, options)) {
                values.insert(field.key.clone(), value);
            }
        }
        self.validate(values)
    }

    /// Coerces and validates already-resolved values.
    ///
    /// Keys without a declaration are kept as they are.
    pub fn validate(&self, values: Map<String, Value>) -> Result<Payload, ActionError> {
        let mut errors = Vec::new();
        let payload = validate::check_object(self, values, "", None, &mut errors);
        if errors.is_empty() {
            Ok(payload)
        } else {
            Err(ActionError::payload_validation(errors.join(" ")))
        }
    }
}

fn nested_error(err: MappingError, key: &str, section: &str) -> MappingError {
    let mut path = vec![key.to_string(), section.to_string()];
    path.extend(err.path);
    MappingError {
        path,
        message: err.message,
    }
}
