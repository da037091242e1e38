use super::FieldType;
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::sync::LazyLock;

static NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?(?:0|[1-9]\d*)(\.\d+)?$").expect("valid numeric pattern"));

static DATE_FRAGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(\d{4})-)?(\d{2})-(\d{2})$").expect("valid date fragment pattern")
});

/// Coerces `value` towards `field_type`.
///
/// Coercion never fails: anything that doesn't match a known conversion is
/// returned unchanged and left for validation to report.
pub fn coerce(value: Value, field_type: FieldType) -> Value {
    match (field_type, value) {
        (FieldType::Number | FieldType::Integer, Value::String(s)) => {
            parse_number(&s).unwrap_or(Value::String(s))
        }
        (FieldType::Boolean, Value::String(s)) => match s.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(s),
        },
        (FieldType::String | FieldType::Text | FieldType::Password, Value::Number(n)) => {
            Value::String(n.to_string())
        }
        (FieldType::String | FieldType::Text | FieldType::Password, Value::Bool(b)) => {
            Value::String(b.to_string())
        }
        (FieldType::Datetime, Value::String(s)) => {
            parse_date_fragment(&s).unwrap_or(Value::String(s))
        }
        (_, other) => other,
    }
}

fn parse_number(s: &str) -> Option<Value> {
    let captures = NUMERIC.captures(s)?;
    if captures.get(1).is_none() {
        if let Ok(i) = s.parse::<i64>() {
            return Some(Value::Number(i.into()));
        }
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

/// Parses `YYYY-MM-DD` or `MM-DD` into `{year?, month, day}`.
fn parse_date_fragment(s: &str) -> Option<Value> {
    let captures = DATE_FRAGMENT.captures(s)?;
    let month: u32 = captures.get(2)?.as_str().parse().ok()?;
    let day: u32 = captures.get(3)?.as_str().parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    let mut out = Map::new();
    if let Some(year) = captures.get(1) {
        let year: i64 = year.as_str().parse().ok()?;
        out.insert("year".to_string(), Value::from(year));
    }
    out.insert("month".to_string(), Value::from(month));
    out.insert("day".to_string(), Value::from(day));
    Some(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_strings() {
        assert_eq!(coerce(json!("42"), FieldType::Number), json!(42));
        assert_eq!(coerce(json!("-0.5"), FieldType::Number), json!(-0.5));
        assert_eq!(coerce(json!("0"), FieldType::Integer), json!(0));
        assert_eq!(coerce(json!("3.0"), FieldType::Integer), json!(3.0));
    }

    #[test]
    fn test_non_numeric_strings_pass_through() {
        for raw in ["007", "1e5", "12abc", " 12", "+3", "", "1."] {
            assert_eq!(coerce(json!(raw), FieldType::Number), json!(raw), "{raw}");
        }
    }

    #[test]
    fn test_booleans_and_strings() {
        assert_eq!(coerce(json!("true"), FieldType::Boolean), json!(true));
        assert_eq!(coerce(json!("false"), FieldType::Boolean), json!(false));
        assert_eq!(coerce(json!("yes"), FieldType::Boolean), json!("yes"));
        assert_eq!(coerce(json!(12), FieldType::String), json!("12"));
        assert_eq!(coerce(json!(false), FieldType::Text), json!("false"));
    }

    #[test]
    fn test_date_fragments() {
        assert_eq!(
            coerce(json!("2021-03-04"), FieldType::Datetime),
            json!({"year": 2021, "month": 3, "day": 4})
        );
        assert_eq!(
            coerce(json!("12-25"), FieldType::Datetime),
            json!({"month": 12, "day": 25})
        );
        assert_eq!(
            coerce(json!("2021-13-04"), FieldType::Datetime),
            json!("2021-13-04")
        );
        assert_eq!(
            coerce(json!("2018-01-23T22:28:55.111Z"), FieldType::Datetime),
            json!("2018-01-23T22:28:55.111Z")
        );
    }

    #[test]
    fn test_other_types_are_untouched() {
        assert_eq!(coerce(json!({"a": "1"}), FieldType::Object), json!({"a": "1"}));
        assert_eq!(coerce(json!(["1"]), FieldType::Number), json!(["1"]));
        assert_eq!(coerce(json!(null), FieldType::Number), json!(null));
    }
}
