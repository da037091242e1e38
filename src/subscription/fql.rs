use crate::mapping::get;
use serde_json::Value;
use std::fmt;

/// Parsed subscription condition.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Compare {
        field: String,
        op: Operator,
        value: Value,
    },
    Contains {
        field: String,
        needle: Value,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FqlError {
    pub position: usize,
    pub message: String,
}

impl fmt::Display for FqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid subscription at {}: {}", self.position, self.message)
    }
}

impl std::error::Error for FqlError {}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    Op(Operator),
    And,
    Or,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, FqlError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((start, Token::Comma));
                i += 1;
            }
            '=' => {
                tokens.push((start, Token::Op(Operator::Eq)));
                i += 1;
            }
            '!' | '<' | '>' => {
                let with_eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, with_eq) {
                    ('!', true) => Operator::Ne,
                    ('<', true) => Operator::Le,
                    ('<', false) => Operator::Lt,
                    ('>', true) => Operator::Ge,
                    ('>', false) => Operator::Gt,
                    _ => {
                        return Err(FqlError {
                            position: start,
                            message: "expected '=' after '!'".to_string(),
                        })
                    }
                };
                tokens.push((start, Token::Op(op)));
                i += if with_eq { 2 } else { 1 };
            }
            '"' => {
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(FqlError {
                                position: start,
                                message: "unterminated string".to_string(),
                            })
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                text.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(other) => {
                            text.push(*other);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Token::Literal(Value::String(text))));
            }
            c if c.is_ascii_digit() || c == '-' => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '-') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text.parse::<f64>().ok().and_then(serde_json::Number::from_f64);
                match number {
                    Some(n) => tokens.push((start, Token::Literal(Value::Number(n)))),
                    None => {
                        return Err(FqlError {
                            position: start,
                            message: format!("invalid number '{}'", text),
                        })
                    }
                }
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '$'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    _ => Token::Ident(word),
                };
                tokens.push((start, token));
            }
            other => {
                return Err(FqlError {
                    position: start,
                    message: format!("unexpected character '{}'", other),
                })
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(p, _)| *p)
    }

    fn error(&self, message: impl Into<String>) -> FqlError {
        FqlError {
            position: self.position(),
            message: message.into(),
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), FqlError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn expression(&mut self) -> Result<Condition, FqlError> {
        let mut left = self.term()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.term()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Condition, FqlError> {
        let mut left = self.factor()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.factor()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Condition, FqlError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) if name == "contains" && self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                let field = self.field()?;
                self.expect(Token::Comma, "','")?;
                let needle = self.literal()?;
                self.expect(Token::RParen, "')'")?;
                Ok(Condition::Contains { field, needle })
            }
            Some(Token::Ident(field)) => {
                let op = match self.next() {
                    Some(Token::Op(op)) => op,
                    _ => {
                        self.pos -= 1;
                        return Err(self.error("expected a comparison operator"));
                    }
                };
                let value = self.literal()?;
                Ok(Condition::Compare { field, op, value })
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected a field or '('"))
            }
        }
    }

    fn field(&mut self) -> Result<String, FqlError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            _ => {
                self.pos -= 1;
                Err(self.error("expected a field"))
            }
        }
    }

    fn literal(&mut self) -> Result<Value, FqlError> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(value),
            _ => {
                self.pos -= 1;
                Err(self.error("expected a string, number, boolean or null"))
            }
        }
    }
}

/// Parses a subscription expression such as
/// `type = "track" and (event = "Order Completed" or properties.total > 100)`.
pub fn parse(input: &str) -> Result<Condition, FqlError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(FqlError {
            position: 0,
            message: "empty subscription".to_string(),
        });
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.chars().count(),
    };
    let condition = parser.expression()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(condition)
}

impl Condition {
    /// Evaluates against the JSON view of an event.
    pub fn matches(&self, event: &Value) -> bool {
        match self {
            Condition::And(a, b) => a.matches(event) && b.matches(event),
            Condition::Or(a, b) => a.matches(event) || b.matches(event),
            Condition::Compare { field, op, value } => {
                let actual = get(event, field).unwrap_or(&Value::Null);
                compare(actual, *op, value)
            }
            Condition::Contains { field, needle } => match (get(event, field), needle) {
                (Some(Value::String(s)), Value::String(n)) => s.contains(n.as_str()),
                (Some(Value::Array(items)), needle) => items.contains(needle),
                _ => false,
            },
        }
    }
}

fn compare(actual: &Value, op: Operator, expected: &Value) -> bool {
    match op {
        Operator::Eq => loosely_equal(actual, expected),
        Operator::Ne => !loosely_equal(actual, expected),
        _ => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => match op {
                Operator::Lt => a < b,
                Operator::Le => a <= b,
                Operator::Gt => a > b,
                Operator::Ge => a >= b,
                Operator::Eq | Operator::Ne => false,
            },
            _ => false,
        },
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> Value {
        json!({
            "type": "track",
            "event": "Order Completed",
            "properties": {"total": 120, "tags": ["vip"], "coupon": "SPRING-10"},
            "context": {"library": {"name": "analytics.js"}}
        })
    }

    #[test]
    fn test_simple_equality() {
        assert!(parse(r#"type = "track""#).unwrap().matches(&event()));
        assert!(!parse(r#"type = "identify""#).unwrap().matches(&event()));
        assert!(parse(r#"type != "identify""#).unwrap().matches(&event()));
    }

    #[test]
    fn test_boolean_combinations() {
        let condition =
            parse(r#"type = "track" and (event = "Signed Up" or event = "Order Completed")"#)
                .unwrap();
        assert!(condition.matches(&event()));

        let condition = parse(r#"type = "identify" or type = "group""#).unwrap();
        assert!(!condition.matches(&event()));
    }

    #[test]
    fn test_numeric_comparisons_and_paths() {
        assert!(parse("properties.total > 100").unwrap().matches(&event()));
        assert!(parse("properties.total <= 120").unwrap().matches(&event()));
        assert!(!parse("properties.total < 100").unwrap().matches(&event()));
        assert!(parse("properties.missing = null").unwrap().matches(&event()));
        assert!(parse(r#"context.library.name = "analytics.js""#)
            .unwrap()
            .matches(&event()));
    }

    #[test]
    fn test_contains() {
        assert!(parse(r#"contains(properties.coupon, "SPRING")"#)
            .unwrap()
            .matches(&event()));
        assert!(parse(r#"contains(properties.tags, "vip")"#)
            .unwrap()
            .matches(&event()));
        assert!(!parse(r#"contains(properties.tags, "new")"#)
            .unwrap()
            .matches(&event()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse(r#"type = "track"#).is_err());
        assert!(parse(r#"type "track""#).is_err());
        assert!(parse(r#"(type = "track""#).is_err());
        assert!(parse(r#"type = "track" event"#).is_err());
        assert!(parse("type # 1").is_err());
    }
}
