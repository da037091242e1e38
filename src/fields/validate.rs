use super::{
    coerce, CompiledField, CompiledFields, ConditionOperator, DependsOn, FieldCondition, FieldType,
    MatchMode, Requirement,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};

/// Coerces and checks one object level, appending messages to `errors`.
///
/// `pointer` is the JSON pointer of the object ("" for the root) and `label`
/// its human name, used when reporting missing required fields.
pub(super) fn check_object(
    fields: &CompiledFields,
    values: Map<String, Value>,
    pointer: &str,
    label: Option<&str>,
    errors: &mut Vec<String>,
) -> Map<String, Value> {
    let mut coerced = Map::new();
    for (key, value) in values {
        match fields.get(&key) {
            Some(field) => {
                if let Some(value) = coerce_field(field, value) {
                    coerced.insert(key, value);
                }
            }
            None => {
                coerced.insert(key, value);
            }
        }
    }

    let mut out = Map::new();
    for field in fields.iter() {
        let visible = field
            .schema
            .depends_on
            .as_ref()
            .map_or(true, |condition| condition_holds(condition, &coerced));
        if !visible {
            coerced.remove(&field.key);
            continue;
        }

        let required = match &field.schema.required {
            Requirement::Never => false,
            Requirement::Always => true,
            Requirement::When(condition) => condition_holds(condition, &coerced),
        };

        let field_pointer = format!("{}/{}", pointer, field.key);
        match coerced.remove(&field.key) {
            Some(value) => {
                let value = check_value(field, value, &field_pointer, errors);
                out.insert(field.key.clone(), value);
            }
            None if required => errors.push(format!(
                "{} is missing the required field '{}'.",
                preamble(pointer, label),
                field.key
            )),
            None => {}
        }
    }

    // Undeclared keys
    for (key, value) in coerced {
        out.insert(key, value);
    }
    out
}

fn coerce_field(field: &CompiledField, value: Value) -> Option<Value> {
    if value.is_null() {
        return field.schema.allow_null.then_some(Value::Null);
    }
    let field_type = field.schema.field_type;
    if field.schema.multiple {
        let items = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        Some(Value::Array(
            items.into_iter().map(|v| coerce(v, field_type)).collect(),
        ))
    } else {
        Some(coerce(value, field_type))
    }
}

fn check_value(
    field: &CompiledField,
    value: Value,
    pointer: &str,
    errors: &mut Vec<String>,
) -> Value {
    if value.is_null() {
        return value;
    }
    let label = Some(field.schema.label.as_str()).filter(|l| !l.is_empty());

    if field.schema.multiple {
        let Value::Array(items) = value else {
            return value;
        };
        return Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    let item_pointer = format!("{}/{}", pointer, i);
                    check_single(field, item, &item_pointer, None, errors)
                })
                .collect(),
        );
    }

    check_single(field, value, pointer, label, errors)
}

fn check_single(
    field: &CompiledField,
    value: Value,
    pointer: &str,
    label: Option<&str>,
    errors: &mut Vec<String>,
) -> Value {
    let schema = &field.schema;
    let subject = preamble(pointer, label);

    if !matches_type(&value, schema.field_type) {
        errors.push(type_message(&subject, schema.field_type, &value));
        return value;
    }

    if let Some(choices) = &schema.choices {
        if !choices.contains(&value) {
            let listed: Vec<String> = choices.iter().map(Value::to_string).collect();
            errors.push(format!("{} should be one of: {}.", subject, listed.join(", ")));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.minimum.filter(|min| n < *min) {
            errors.push(format!(
                "{} should be greater than or equal to {} but it was {}.",
                subject, min, value
            ));
        }
        if let Some(max) = schema.maximum.filter(|max| n > *max) {
            errors.push(format!(
                "{} should be less than or equal to {} but it was {}.",
                subject, max, value
            ));
        }
    }

    match (value, &field.properties) {
        (Value::Object(obj), Some(nested)) => {
            let mut checked = check_object(nested, obj, pointer, label, errors);
            if !schema.additional_properties {
                checked.retain(|key, _| nested.get(key).is_some());
            }
            Value::Object(checked)
        }
        (value, _) => value,
    }
}

fn preamble(pointer: &str, label: Option<&str>) -> String {
    match (label, pointer) {
        (Some(label), _) => label.to_string(),
        (None, "") => "The root value".to_string(),
        (None, pointer) => format!("The value at {}", pointer),
    }
}

fn type_message(subject: &str, expected: FieldType, actual: &Value) -> String {
    if expected == FieldType::Datetime && actual.is_string() {
        return format!("{} should be a valid datetime string but it was not.", subject);
    }
    let expected = expected.describe();
    let actual = json_type(actual);
    format!(
        "{} should be {} {} but it was {}.",
        subject,
        article(expected),
        expected,
        if actual == "null" {
            actual.to_string()
        } else {
            format!("{} {}", article(actual), actual)
        }
    )
}

fn article(word: &str) -> &'static str {
    match word.chars().next() {
        Some('a' | 'e' | 'i' | 'o' | 'u') => "an",
        _ => "a",
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(value: &Value, field_type: FieldType) -> bool {
    match field_type {
        FieldType::String | FieldType::Text | FieldType::Password => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Integer => match value.as_f64() {
            Some(n) => value.is_i64() || value.is_u64() || n.fract() == 0.0,
            None => false,
        },
        FieldType::Boolean => value.is_boolean(),
        FieldType::Object => value.is_object(),
        FieldType::Datetime => match value {
            Value::Number(_) => true,
            Value::String(s) => is_date_like(s),
            Value::Object(obj) => obj.contains_key("month") && obj.contains_key("day"),
            _ => false,
        },
    }
}

fn is_date_like(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || DateTime::parse_from_rfc2822(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || (!s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
}

pub(super) fn condition_holds(depends_on: &DependsOn, values: &Map<String, Value>) -> bool {
    let mut results = depends_on
        .conditions
        .iter()
        .map(|condition| single_condition(condition, values));
    match depends_on.match_mode {
        MatchMode::All => results.all(|r| r),
        MatchMode::Any => results.any(|r| r),
    }
}

fn single_condition(condition: &FieldCondition, values: &Map<String, Value>) -> bool {
    let actual = values.get(&condition.field_key);
    let matched = match (&condition.value, actual) {
        (None, actual) => actual.is_some(),
        (Some(_), None) => false,
        (Some(Value::Array(options)), Some(actual)) => options.contains(actual),
        (Some(expected), Some(actual)) => expected == actual,
    };
    match condition.operator {
        ConditionOperator::Is => matched,
        ConditionOperator::IsNot => !matched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_messages() {
        assert_eq!(
            type_message("Email", FieldType::String, &json!(3)),
            "Email should be a string but it was a number."
        );
        assert_eq!(
            type_message("The value at /n", FieldType::Integer, &json!(null)),
            "The value at /n should be an integer but it was null."
        );
        assert_eq!(
            type_message("When", FieldType::Datetime, &json!("soon")),
            "When should be a valid datetime string but it was not."
        );
    }

    #[test]
    fn test_date_like_strings() {
        assert!(is_date_like("2018-01-23T22:28:55.111Z"));
        assert!(is_date_like("2018-01-23"));
        assert!(is_date_like("2018-01-23 10:00:00"));
        assert!(is_date_like("1516746535"));
        assert!(!is_date_like("yesterday"));
        assert!(!is_date_like(""));
    }

    #[test]
    fn test_conditions() {
        let values: Map<String, Value> =
            serde_json::from_value(json!({"mode": "b", "count": 2})).unwrap();

        let is_b = FieldCondition::is("mode", json!("b"));
        let is_not_b = FieldCondition::is_not("mode", json!("b"));
        let one_of = FieldCondition::is("mode", json!(["a", "b"]));
        let missing = FieldCondition::is("other", json!(1));

        assert!(single_condition(&is_b, &values));
        assert!(!single_condition(&is_not_b, &values));
        assert!(single_condition(&one_of, &values));
        assert!(!single_condition(&missing, &values));

        assert!(condition_holds(
            &DependsOn::any(vec![missing.clone(), is_b.clone()]),
            &values
        ));
        assert!(!condition_holds(&DependsOn::all(vec![missing, is_b]), &values));
    }
}
