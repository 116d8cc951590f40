//! Bound parameter values.
//!
//! Values arrive as JSON from the UI layer, without type information. They
//! are sent to the server in text format, so PostgreSQL parses them against
//! the parameter type it inferred for the statement (the same thing `psql`
//! does with literals). This keeps "42" usable for an `integer` column and
//! "2024-01-01" usable for a `date` column.

use std::error::Error;
use std::fmt::Write as _;

use bytes::{BufMut, BytesMut};
use serde_json::Value;
use tokio_postgres::types::{to_sql_checked, Format, IsNull, Kind, ToSql, Type};

/// A JSON value bound as a statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlValue(pub Value);

impl SqlValue {
    pub fn null() -> Self {
        Self(Value::Null)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// The text the server will receive for a parameter of type `ty`,
    /// or `None` for SQL NULL.
    pub fn render(&self, ty: &Type) -> Option<String> {
        match &self.0 {
            Value::Null => None,
            value if is_json(ty) => Some(render_json(value)),
            Value::Array(items) if matches!(ty.kind(), Kind::Array(_)) => {
                Some(render_array(items))
            }
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self(Value::from(value))
    }
}

impl From<u64> for SqlValue {
    fn from(value: u64) -> Self {
        Self(Value::from(value))
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self.render(ty) {
            Some(text) => {
                if text.contains('\0') {
                    return Err("parameter values cannot contain NUL characters".into());
                }
                out.put_slice(text.as_bytes());
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

fn is_json(ty: &Type) -> bool {
    *ty == Type::JSON || *ty == Type::JSONB
}

/// Strings that already hold JSON text are passed through; anything else
/// is encoded as JSON.
fn render_json(value: &Value) -> String {
    match value {
        Value::String(s) if serde_json::from_str::<Value>(s).is_ok() => s.clone(),
        other => other.to_string(),
    }
}

/// Render a PostgreSQL array literal such as `{1,"a b",NULL}`.
fn render_array(items: &[Value]) -> String {
    let mut out = String::from("{");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match item {
            Value::Null => out.push_str("NULL"),
            Value::Array(nested) => out.push_str(&render_array(nested)),
            Value::Bool(b) => {
                let _ = write!(out, "{b}");
            }
            Value::Number(n) => {
                let _ = write!(out, "{n}");
            }
            Value::String(s) => push_quoted_element(&mut out, s),
            Value::Object(_) => push_quoted_element(&mut out, &item.to_string()),
        }
    }
    out.push('}');
    out
}

fn push_quoted_element(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(v: Value, ty: &Type) -> Option<String> {
        SqlValue(v).render(ty)
    }

    #[test]
    fn test_scalars() {
        assert_eq!(render(json!(42), &Type::INT4).as_deref(), Some("42"));
        assert_eq!(render(json!("42"), &Type::INT4).as_deref(), Some("42"));
        assert_eq!(render(json!(true), &Type::BOOL).as_deref(), Some("true"));
        assert_eq!(render(json!(1.5), &Type::NUMERIC).as_deref(), Some("1.5"));
        assert_eq!(render(json!("O'Brien"), &Type::TEXT).as_deref(), Some("O'Brien"));
        assert_eq!(render(Value::Null, &Type::TEXT), None);
    }

    #[test]
    fn test_json_targets() {
        assert_eq!(render(json!({"a": 1}), &Type::JSONB).as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(render(json!(r#"{"a":1}"#), &Type::JSON).as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(render(json!("plain"), &Type::JSONB).as_deref(), Some(r#""plain""#));
        assert_eq!(render(json!([1, 2]), &Type::JSONB).as_deref(), Some("[1,2]"));
    }

    #[test]
    fn test_array_targets() {
        assert_eq!(render(json!([1, 2, null]), &Type::INT4_ARRAY).as_deref(), Some("{1,2,NULL}"));
        assert_eq!(
            render(json!(["a b", "say \"hi\"", "c:\\"]), &Type::TEXT_ARRAY).as_deref(),
            Some(r#"{"a b","say \"hi\"","c:\\"}"#)
        );
        assert_eq!(render(json!([[1], [2]]), &Type::INT4_ARRAY).as_deref(), Some("{{1},{2}}"));
        assert_eq!(render(json!("{1,2}"), &Type::INT4_ARRAY).as_deref(), Some("{1,2}"));
    }

    #[test]
    fn test_to_sql_writes_text() {
        let mut buf = BytesMut::new();
        let is_null = SqlValue(json!(7)).to_sql(&Type::INT8, &mut buf).unwrap();
        assert!(matches!(is_null, IsNull::No));
        assert_eq!(&buf[..], b"7");
        assert!(matches!(SqlValue(json!("x")).encode_format(&Type::INT8), Format::Text));

        let mut buf = BytesMut::new();
        let is_null = SqlValue::null().to_sql(&Type::INT8, &mut buf).unwrap();
        assert!(matches!(is_null, IsNull::Yes));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_nul_is_rejected() {
        let mut buf = BytesMut::new();
        assert!(SqlValue(json!("a\u{0}b")).to_sql(&Type::TEXT, &mut buf).is_err());
    }
}
