//! Mapping directives.
//!
//! A mapping is authored as JSON and compiled once, at registration, into a
//! [`Mapping`] tree. Compilation rejects unknown or malformed directives with
//! the JSON pointer of the offending node, so evaluation itself can never
//! fail: it is a pure function from `(mapping, data)` to an optional value,
//! where `None` stands for "undefined".
//!
//! Supported directives:
//!
//! | Directive    | Argument                                        |
//! |--------------|-------------------------------------------------|
//! | `@path`      | path string, or a directive yielding one        |
//! | `@if`        | `{ exists \| blank, then?, else? }`             |
//! | `@template`  | template string, or a directive yielding one    |
//! | `@arrayPath` | `[path, shape?]`                                |
//! | `@json`      | `{ mode: "encode" \| "decode", value }`         |
//! | `@literal`   | any JSON, returned verbatim                     |

use serde_json::{Map, Value};
use std::fmt;

mod path;
mod template;

pub use path::get;
pub use template::render;

/// Compiled directive tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Mapping {
    /// Plain JSON value (scalars, null, `@literal` arguments)
    Literal(Value),
    /// Object whose values are mappings, in authored order
    Object(Vec<(String, Mapping)>),
    Array(Vec<Mapping>),
    Path(Box<Mapping>),
    If(Box<IfDirective>),
    Template(Box<Mapping>),
    ArrayPath(Box<ArrayPathDirective>),
    Json(Box<JsonDirective>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfDirective {
    pub condition: Condition,
    pub then: Option<Mapping>,
    pub otherwise: Option<Mapping>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// Holds when the target is neither undefined nor null
    Exists(Mapping),
    /// Like `Exists`, but the empty string also fails
    Blank(Mapping),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArrayPathDirective {
    pub path: Mapping,
    pub shape: Option<Mapping>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JsonMode {
    Encode,
    Decode,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JsonDirective {
    pub mode: JsonMode,
    pub value: Mapping,
}

/// Options applied while resolving a mapping.
#[derive(Clone, Debug)]
pub struct ResolveOptions {
    /// HTML-escape `{{ }}` template substitutions
    pub escape_templates: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            escape_templates: true,
        }
    }
}

/// Registration-time mapping error.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingError {
    /// Path segments from the mapping root to the offending node
    pub path: Vec<String>,
    pub message: String,
}

impl MappingError {
    fn new(stack: &[String], message: impl Into<String>) -> Self {
        Self {
            path: stack.to_vec(),
            message: message.into(),
        }
    }

    /// JSON pointer of the offending node.
    pub fn pointer(&self) -> String {
        format!("/{}", self.path.join("/"))
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.", self.pointer(), self.message)
    }
}

impl std::error::Error for MappingError {}

impl Mapping {
    /// Compiles authored JSON into a mapping tree.
    pub fn parse(raw: &Value) -> Result<Mapping, MappingError> {
        parse_node(raw, &mut Vec::new())
    }

    /// Resolves against `data` with default options.
    pub fn resolve(&self, data: &Value) -> Option<Value> {
        self.resolve_with(data, &ResolveOptions::default())
    }

    pub fn resolve_with(&self, data: &Value, options: &ResolveOptions) -> Option<Value> {
        match self {
            Mapping::Literal(value) => Some(value.clone()),
            Mapping::Object(entries) => {
                let mut out = Map::new();
                for (key, mapping) in entries {
                    if let Some(value) = mapping.resolve_with(data, options) {
                        out.insert(key.clone(), value);
                    }
                }
                Some(Value::Object(out))
            }
            Mapping::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|item| item.resolve_with(data, options).unwrap_or(Value::Null))
                    .collect(),
            )),
            Mapping::Path(target) => {
                let path = target.resolve_with(data, options)?;
                get(data, path.as_str()?).cloned()
            }
            Mapping::If(directive) => {
                let holds = match &directive.condition {
                    Condition::Exists(target) => match target.resolve_with(data, options) {
                        None | Some(Value::Null) => false,
                        Some(_) => true,
                    },
                    Condition::Blank(target) => match target.resolve_with(data, options) {
                        None | Some(Value::Null) => false,
                        Some(Value::String(s)) => !s.is_empty(),
                        Some(_) => true,
                    },
                };
                let branch = if holds {
                    directive.then.as_ref()
                } else {
                    directive.otherwise.as_ref()
                };
                branch.and_then(|m| m.resolve_with(data, options))
            }
            Mapping::Template(source) => {
                let source = source.resolve_with(data, options)?;
                Some(Value::String(render(
                    source.as_str()?,
                    data,
                    options.escape_templates,
                )))
            }
            Mapping::ArrayPath(directive) => {
                let base = match &directive.path {
                    Mapping::Literal(Value::String(path)) => get(data, path).cloned(),
                    other => other.resolve_with(data, options),
                }?;
                let Some(shape) = &directive.shape else {
                    return Some(base);
                };
                let items = match base {
                    Value::Array(items) => items,
                    Value::Object(_) => vec![base],
                    _ => return None,
                };
                Some(Value::Array(
                    items
                        .iter()
                        .map(|item| shape.resolve_with(item, options).unwrap_or(Value::Null))
                        .collect(),
                ))
            }
            Mapping::Json(directive) => {
                let value = directive.value.resolve_with(data, options)?;
                match directive.mode {
                    JsonMode::Encode => serde_json::to_string(&value).ok().map(Value::String),
                    JsonMode::Decode => match value {
                        Value::String(s) => serde_json::from_str(&s).ok(),
                        other => Some(other),
                    },
                }
            }
        }
    }

    /// Returns the mapping bound to `key` when this is an object mapping.
    pub fn field(&self, key: &str) -> Option<&Mapping> {
        match self {
            Mapping::Object(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, m)| m),
            _ => None,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Mapping::Object(_))
    }
}

/// Compiles and resolves in one step.
pub fn transform(raw: &Value, data: &Value) -> Result<Value, MappingError> {
    Ok(Mapping::parse(raw)?.resolve(data).unwrap_or(Value::Null))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_directive(value: &Value) -> bool {
    value
        .as_object()
        .map_or(false, |obj| obj.keys().any(|k| k.starts_with('@')))
}

fn parse_node(raw: &Value, stack: &mut Vec<String>) -> Result<Mapping, MappingError> {
    match raw {
        Value::Object(obj) if is_directive(raw) => parse_directive(obj, stack),
        Value::Object(obj) => {
            let mut entries = Vec::with_capacity(obj.len());
            for (key, value) in obj {
                stack.push(key.clone());
                let mapping = parse_node(value, stack)?;
                stack.pop();
                entries.push((key.clone(), mapping));
            }
            Ok(Mapping::Object(entries))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                stack.push(i.to_string());
                out.push(parse_node(item, stack)?);
                stack.pop();
            }
            Ok(Mapping::Array(out))
        }
        other => Ok(Mapping::Literal(other.clone())),
    }
}

fn parse_directive(obj: &Map<String, Value>, stack: &mut Vec<String>) -> Result<Mapping, MappingError> {
    let keys: Vec<&String> = obj.keys().filter(|k| k.as_str() != "_metadata").collect();
    if keys.len() != 1 {
        let listed: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        return Err(MappingError::new(
            stack,
            format!(
                "should only have one @-prefixed key but it has {} keys ({})",
                keys.len(),
                listed.join(", ")
            ),
        ));
    }

    let name = keys[0].as_str();
    let arg = &obj[name];
    stack.push(name.to_string());
    let parsed = match name {
        "@path" => string_or_directive(arg, stack).map(|m| Mapping::Path(Box::new(m))),
        "@template" => string_or_directive(arg, stack).map(|m| Mapping::Template(Box::new(m))),
        "@literal" => Ok(Mapping::Literal(arg.clone())),
        "@if" => parse_if(arg, stack),
        "@arrayPath" => parse_array_path(arg, stack),
        "@json" => parse_json(arg, stack),
        _ => {
            stack.pop();
            return Err(MappingError::new(
                stack,
                format!("has an invalid directive: {}", name),
            ));
        }
    };
    stack.pop();
    parsed
}

fn string_or_directive(arg: &Value, stack: &mut Vec<String>) -> Result<Mapping, MappingError> {
    match arg {
        Value::String(s) => Ok(Mapping::Literal(Value::String(s.clone()))),
        Value::Object(obj) if is_directive(arg) => parse_directive(obj, stack),
        other => Err(MappingError::new(
            stack,
            format!(
                "should be a string or a mapping directive but it is {} {}",
                article(type_name(other)),
                type_name(other)
            ),
        )),
    }
}

fn article(word: &str) -> &'static str {
    match word.chars().next() {
        Some('a' | 'e' | 'i' | 'o' | 'u') => "an",
        _ => "a",
    }
}

fn expect_object<'a>(
    arg: &'a Value,
    stack: &[String],
) -> Result<&'a Map<String, Value>, MappingError> {
    arg.as_object().ok_or_else(|| {
        MappingError::new(
            stack,
            format!(
                "should be an object but it is {} {}",
                article(type_name(arg)),
                type_name(arg)
            ),
        )
    })
}

fn optional_field(
    obj: &Map<String, Value>,
    key: &str,
    stack: &mut Vec<String>,
) -> Result<Option<Mapping>, MappingError> {
    match obj.get(key) {
        None => Ok(None),
        Some(value) => {
            stack.push(key.to_string());
            let mapping = parse_node(value, stack)?;
            stack.pop();
            Ok(Some(mapping))
        }
    }
}

fn parse_if(arg: &Value, stack: &mut Vec<String>) -> Result<Mapping, MappingError> {
    let obj = expect_object(arg, stack)?;
    if let Some(unknown) = obj
        .keys()
        .find(|k| !matches!(k.as_str(), "exists" | "blank" | "then" | "else"))
    {
        return Err(MappingError::new(
            stack,
            format!("has an unexpected field: {}", unknown),
        ));
    }

    let condition = match (optional_field(obj, "exists", stack)?, optional_field(obj, "blank", stack)?) {
        (Some(target), None) => Condition::Exists(target),
        (None, Some(target)) => Condition::Blank(target),
        _ => {
            return Err(MappingError::new(
                stack,
                "should have exactly one of the fields: exists, blank",
            ))
        }
    };

    Ok(Mapping::If(Box::new(IfDirective {
        condition,
        then: optional_field(obj, "then", stack)?,
        otherwise: optional_field(obj, "else", stack)?,
    })))
}

fn parse_array_path(arg: &Value, stack: &mut Vec<String>) -> Result<Mapping, MappingError> {
    let items = match arg {
        Value::Array(items) if !items.is_empty() && items.len() <= 2 => items,
        other => {
            return Err(MappingError::new(
                stack,
                format!(
                    "should be an array of one or two elements but it is {} {}",
                    article(type_name(other)),
                    type_name(other)
                ),
            ))
        }
    };

    stack.push("0".to_string());
    let path = string_or_directive(&items[0], stack)?;
    stack.pop();

    let shape = match items.get(1) {
        Some(raw) => {
            stack.push("1".to_string());
            let shape = parse_node(raw, stack)?;
            stack.pop();
            Some(shape)
        }
        None => None,
    };

    Ok(Mapping::ArrayPath(Box::new(ArrayPathDirective { path, shape })))
}

fn parse_json(arg: &Value, stack: &mut Vec<String>) -> Result<Mapping, MappingError> {
    let obj = expect_object(arg, stack)?;

    let mode = match obj.get("mode").and_then(Value::as_str) {
        Some("encode") => JsonMode::Encode,
        Some("decode") => JsonMode::Decode,
        _ => {
            stack.push("mode".to_string());
            let err = MappingError::new(stack, "should be one of: encode, decode");
            stack.pop();
            return Err(err);
        }
    };

    let value = optional_field(obj, "value", stack)?
        .ok_or_else(|| MappingError::new(stack, "should have field value"))?;

    Ok(Mapping::Json(Box::new(JsonDirective { mode, value })))
}
