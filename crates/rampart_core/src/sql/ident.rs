//! Identifier and literal quoting.
//!
//! Every table, column, role and policy name interpolated into a statement
//! goes through [`quote_identifier`]. Values never do; they are bound as
//! parameters.

use std::fmt;

use crate::error::{RampartError, RampartResult};

/// PostgreSQL's NAMEDATALEN - 1.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Check that a catalog name can be represented as a quoted identifier.
pub fn validate_identifier(name: &str) -> RampartResult<()> {
    if name.is_empty() {
        return Err(RampartError::invalid_identifier(name, "name is empty"));
    }
    if name.contains('\0') {
        return Err(RampartError::invalid_identifier(name, "name contains a NUL character"));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(RampartError::invalid_identifier(
            name,
            format!("name is {} bytes, the limit is {MAX_IDENTIFIER_LEN}", name.len()),
        ));
    }
    Ok(())
}

/// Wrap a name in double quotes, doubling any embedded quote.
pub fn quote_identifier(name: &str) -> RampartResult<String> {
    validate_identifier(name)?;
    Ok(escape_identifier(name))
}

fn escape_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a string as a SQL literal, for the few places (DDL defaults)
/// where a value cannot be bound as a parameter.
///
/// Backslashes switch to the `E'...'` form so the result is correct
/// regardless of `standard_conforming_strings`.
pub fn quote_literal(value: &str) -> RampartResult<String> {
    if value.contains('\0') {
        return Err(RampartError::invalid_request("Literal values cannot contain NUL characters"));
    }
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        Ok(format!("E'{}'", escaped.replace('\\', "\\\\")))
    } else {
        Ok(format!("'{escaped}'"))
    }
}

/// Render a role name for `TO <roles>`.
///
/// The role keywords stay bare; anything else is a quoted identifier.
pub fn quote_role(role: &str) -> RampartResult<String> {
    let trimmed = role.trim();
    match trimmed.to_ascii_uppercase().as_str() {
        "PUBLIC" => Ok("PUBLIC".to_string()),
        "CURRENT_USER" => Ok("CURRENT_USER".to_string()),
        "CURRENT_ROLE" => Ok("CURRENT_ROLE".to_string()),
        "SESSION_USER" => Ok("SESSION_USER".to_string()),
        _ => quote_identifier(trimmed),
    }
}

/// A validated, schema-qualified table name.
///
/// Renders as `"schema"."name"` through `Display`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    schema: String,
    name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> RampartResult<Self> {
        let schema = schema.into();
        let name = name.into();
        if name.is_empty() {
            return Err(RampartError::missing("tableName"));
        }
        validate_identifier(&schema)?;
        validate_identifier(&name)?;
        Ok(Self { schema, name })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A sibling table in the same schema.
    pub fn sibling(&self, name: &str) -> RampartResult<Self> {
        Self::new(self.schema.clone(), name)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", escape_identifier(&self.schema), escape_identifier(&self.name))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Reverse of quote_identifier, following the server's lexer rules.
    pub(crate) fn unquote_identifier(quoted: &str) -> Option<String> {
        let inner = quoted.strip_prefix('"')?.strip_suffix('"')?;
        let mut out = String::new();
        let mut chars = inner.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '"' {
                // A lone quote would have terminated the identifier.
                if chars.next() != Some('"') {
                    return None;
                }
            }
            out.push(c);
        }
        Some(out)
    }

    #[test]
    fn test_plain_name() {
        assert_eq!(quote_identifier("users").unwrap(), "\"users\"");
        assert_eq!(quote_identifier("Order Items").unwrap(), "\"Order Items\"");
    }

    #[test]
    fn test_embedded_quotes_round_trip() {
        for name in ["a\"b", "\"", "\"\"", "x\"; DROP TABLE users; --", "weird\"name\""] {
            let quoted = quote_identifier(name).unwrap();
            assert_eq!(unquote_identifier(&quoted).as_deref(), Some(name), "{quoted}");
        }
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(matches!(quote_identifier(""), Err(RampartError::InvalidIdentifier { .. })));
        assert!(matches!(quote_identifier("a\0b"), Err(RampartError::InvalidIdentifier { .. })));
        let long = "x".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(matches!(quote_identifier(&long), Err(RampartError::InvalidIdentifier { .. })));
        assert!(quote_identifier(&"x".repeat(MAX_IDENTIFIER_LEN)).is_ok());
    }

    #[test]
    fn test_length_limit_counts_bytes() {
        // 32 two-byte characters = 64 bytes
        let name = "é".repeat(32);
        assert!(quote_identifier(&name).is_err());
    }

    #[test]
    fn test_literals() {
        assert_eq!(quote_literal("it's").unwrap(), "'it''s'");
        assert_eq!(quote_literal("C:\\tmp").unwrap(), "E'C:\\\\tmp'");
        assert!(quote_literal("a\0").is_err());
    }

    #[test]
    fn test_roles() {
        assert_eq!(quote_role("public").unwrap(), "PUBLIC");
        assert_eq!(quote_role("current_user").unwrap(), "CURRENT_USER");
        assert_eq!(quote_role("app_reader").unwrap(), "\"app_reader\"");
        assert!(quote_role("").is_err());
    }

    #[test]
    fn test_table_ref_display() {
        let t = TableRef::new("public", "my\"table").unwrap();
        assert_eq!(t.to_string(), "\"public\".\"my\"\"table\"");
        assert!(matches!(TableRef::new("public", ""), Err(RampartError::MissingParameter { .. })));
    }
}
