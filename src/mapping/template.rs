use super::path::get;
use serde_json::Value;

/// Renders a mustache-style template against `data`.
///
/// `{{ path }}` substitutions are HTML-escaped when `escape` is set;
/// `{{{ path }}}` is always emitted raw. Unresolved paths render as the
/// empty string. Text that is not a well-formed tag is copied through.
pub fn render(template: &str, data: &Value, escape: bool) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let (raw, body_start, close) = if after.starts_with('{') {
            (true, 1, "}}}")
        } else {
            (false, 0, "}}")
        };

        let Some(end) = after[body_start..].find(close) else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after[body_start..body_start + end].trim();
        let text = get(data, key).map(display).unwrap_or_default();
        if raw || !escape {
            out.push_str(&text);
        } else {
            out.push_str(&escape_html(&text));
        }

        rest = &after[body_start + end + close.len()..];
    }

    out.push_str(rest);
    out
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '/' => out.push_str("&#x2F;"),
            '`' => out.push_str("&#x60;"),
            '=' => out.push_str("&#x3D;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substitution_and_missing_values() {
        let data = json!({"who": {"name": "World"}});
        assert_eq!(render("Hello, {{who.name}}!", &data, true), "Hello, World!");
        assert_eq!(render("Hello, {{ who.name }}!", &data, true), "Hello, World!");
        assert_eq!(render("Hello, {{who.missing}}!", &data, true), "Hello, !");
    }

    #[test]
    fn test_escaping() {
        let data = json!({"url": "a/b?c=<d>&e"});
        assert_eq!(
            render("{{url}}", &data, true),
            "a&#x2F;b?c&#x3D;&lt;d&gt;&amp;e"
        );
        assert_eq!(render("{{{url}}}", &data, true), "a/b?c=<d>&e");
        assert_eq!(render("{{url}}", &data, false), "a/b?c=<d>&e");
    }

    #[test]
    fn test_non_string_values() {
        let data = json!({"n": 3, "b": true, "z": null, "o": {"k": 1}});
        assert_eq!(render("{{n}} {{b}} [{{z}}] {{{o}}}", &data, true), r#"3 true [] {"k":1}"#);
    }

    #[test]
    fn test_unterminated_tag_is_copied() {
        let data = json!({"a": 1});
        assert_eq!(render("x {{a", &data, true), "x {{a");
    }
}
