//! Schema introspection models.
//!
//! Built fresh from catalog queries on every request and never cached,
//! since the schema can change between calls.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::query::QueryResult;
use crate::error::RampartError;

/// Structure of one table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescriptor {
    pub name: String,
    /// Columns in ordinal order.
    pub columns: Vec<ColumnDescriptor>,
    /// Primary key columns in key order.
    pub primary_keys: Vec<String>,
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A PostgreSQL column.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub name: String,
    /// Type name as rendered by `format_type` (e.g. "integer", "character varying").
    pub data_type: String,
    pub nullable: bool,
    /// Opaque server-side default expression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_expression: Option<String>,
    /// Character length limit for varchar/char columns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i32>,
    /// `GENERATED ... AS IDENTITY` column.
    pub is_identity: bool,
}

impl ColumnDescriptor {
    /// Whether the server fills this column when the caller leaves it out.
    ///
    /// True for identity columns and sequence-backed (`nextval(...)`) defaults.
    pub fn is_auto_generated(&self) -> bool {
        self.is_identity
            || self
                .default_expression
                .as_deref()
                .map(|d| d.trim_start().to_ascii_lowercase().starts_with("nextval("))
                .unwrap_or(false)
    }
}

/// A single-column foreign key edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyDescriptor {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

/// Command a row-level security policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyCommand {
    #[default]
    #[serde(alias = "all")]
    All,
    #[serde(alias = "select")]
    Select,
    #[serde(alias = "insert")]
    Insert,
    #[serde(alias = "update")]
    Update,
    #[serde(alias = "delete")]
    Delete,
}

impl PolicyCommand {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Whether a `USING` clause is meaningful for this command.
    pub fn allows_using(&self) -> bool {
        !matches!(self, Self::Insert)
    }

    /// Whether a `WITH CHECK` clause is meaningful for this command.
    pub fn allows_with_check(&self) -> bool {
        !matches!(self, Self::Select | Self::Delete)
    }
}

impl FromStr for PolicyCommand {
    type Err = RampartError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALL" | "*" => Ok(Self::All),
            "SELECT" | "R" => Ok(Self::Select),
            "INSERT" | "A" => Ok(Self::Insert),
            "UPDATE" | "W" => Ok(Self::Update),
            "DELETE" | "D" => Ok(Self::Delete),
            other => Err(RampartError::invalid_request(format!(
                "Unknown policy command: {other}"
            ))),
        }
    }
}

/// A row-level security policy as read back from `pg_policies`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RlsPolicy {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub permissive: bool,
    pub command: PolicyCommand,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub using_expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_check_expression: Option<String>,
    pub roles: Vec<String>,
}

/// RLS switches of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRlsState {
    pub table: String,
    pub rls_enabled: bool,
    pub rls_forced: bool,
}

/// Result of `listPolicies`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyListing {
    pub policies: Vec<RlsPolicy>,
    pub tables_with_rls: Vec<TableRlsState>,
}

/// Result of `describeTable`: structure, a bounded sample and the row count.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDetails {
    #[serde(flatten)]
    pub descriptor: TableDescriptor,
    pub sample: QueryResult,
    pub total_rows: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(default: Option<&str>, identity: bool) -> ColumnDescriptor {
        ColumnDescriptor {
            name: "id".into(),
            data_type: "integer".into(),
            nullable: false,
            default_expression: default.map(String::from),
            max_length: None,
            is_identity: identity,
        }
    }

    #[test]
    fn test_auto_generated_detection() {
        assert!(column(Some("nextval('users_id_seq'::regclass)"), false).is_auto_generated());
        assert!(column(None, true).is_auto_generated());
        assert!(!column(Some("now()"), false).is_auto_generated());
        assert!(!column(None, false).is_auto_generated());
    }

    #[test]
    fn test_policy_command_parsing() {
        assert_eq!("select".parse::<PolicyCommand>().unwrap(), PolicyCommand::Select);
        assert_eq!("*".parse::<PolicyCommand>().unwrap(), PolicyCommand::All);
        assert!("TRUNCATE".parse::<PolicyCommand>().is_err());

        let cmd: PolicyCommand = serde_json::from_str(r#""update""#).unwrap();
        assert_eq!(cmd, PolicyCommand::Update);
    }

    #[test]
    fn test_clause_applicability() {
        assert!(!PolicyCommand::Insert.allows_using());
        assert!(PolicyCommand::Insert.allows_with_check());
        assert!(!PolicyCommand::Select.allows_with_check());
        assert!(!PolicyCommand::Delete.allows_with_check());
        assert!(PolicyCommand::All.allows_using() && PolicyCommand::All.allows_with_check());
    }

    #[test]
    fn test_descriptor_serializes_camel_case() {
        let table = TableDescriptor {
            name: "users".into(),
            columns: vec![column(Some("nextval('s')"), false)],
            primary_keys: vec!["id".into()],
            foreign_keys: vec![],
        };
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["primaryKeys"][0], "id");
        assert_eq!(json["columns"][0]["defaultExpression"], "nextval('s')");
        assert!(json["columns"][0].get("maxLength").is_none());
    }
}
