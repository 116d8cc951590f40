//! Row selection for SELECT/UPDATE/DELETE.
//!
//! Two ways to pick rows exist and they are kept apart on purpose:
//!
//! - [`RowFilter::Matches`] compares quoted columns against bound values.
//! - [`RowFilter::Raw`] splices caller-written SQL text into the statement.
//!   It can only be built through [`RawCondition::trusted`], so every place
//!   that accepts operator-authored SQL is visible at the call site.

use serde_json::{Map, Value};

use super::ident::quote_identifier;
use super::value::SqlValue;
use crate::error::RampartResult;

/// Operator-authored SQL text, inserted verbatim.
///
/// The database's own permissions are the only guard on what it can do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCondition(String);

impl RawCondition {
    /// Accept SQL text from the operator as-is.
    pub fn trusted(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }

    pub fn as_sql(&self) -> &str {
        self.0.trim()
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

/// Which rows a statement applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum RowFilter {
    /// `"col" = $n AND ...`; JSON null becomes `"col" IS NULL`.
    Matches(Map<String, Value>),
    Raw(RawCondition),
}

impl RowFilter {
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::Raw(RawCondition::trusted(sql))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Matches(map) => map.is_empty(),
            Self::Raw(raw) => raw.is_blank(),
        }
    }

    /// Render the condition text, appending bound values to `params`.
    ///
    /// Placeholders continue numbering after the values already in `params`.
    /// Returns `None` when the filter selects every row. Raw text is wrapped
    /// as `(<raw>\n)` so a trailing `--` comment ends inside the group.
    pub fn render(&self, params: &mut Vec<SqlValue>) -> RampartResult<Option<String>> {
        match self {
            Self::Raw(raw) if raw.is_blank() => Ok(None),
            Self::Raw(raw) => Ok(Some(format!("({}\n)", raw.as_sql()))),
            Self::Matches(map) if map.is_empty() => Ok(None),
            Self::Matches(map) => {
                let mut parts = Vec::with_capacity(map.len());
                for (column, value) in map {
                    let column = quote_identifier(column)?;
                    if value.is_null() {
                        parts.push(format!("{column} IS NULL"));
                    } else {
                        params.push(SqlValue(value.clone()));
                        parts.push(format!("{column} = ${}", params.len()));
                    }
                }
                Ok(Some(parts.join(" AND ")))
            }
        }
    }
}
