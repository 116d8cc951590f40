//! Request payloads for the table, row and policy operations.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::ddl::ColumnDefinition;
use super::schema::PolicyCommand;
use crate::error::{RampartError, RampartResult};
use crate::sql::{RawCondition, RowFilter};

/// Row selection as sent by the UI: either operator SQL or column matches.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowSelection {
    /// Raw SQL boolean expression, spliced in verbatim
    #[serde(default, alias = "filter")]
    pub condition: Option<String>,
    /// Column equality matches, bound as parameters
    #[serde(default)]
    pub matches: Option<Map<String, Value>>,
}

impl RowSelection {
    pub fn raw(condition: impl Into<String>) -> Self {
        Self { condition: Some(condition.into()), matches: None }
    }

    /// Resolve into a filter, or `None` when nothing restricts the rows.
    pub fn into_filter(self) -> RampartResult<Option<RowFilter>> {
        let condition = self.condition.filter(|c| !c.trim().is_empty());
        let matches = self.matches.filter(|m| !m.is_empty());
        match (condition, matches) {
            (Some(_), Some(_)) => Err(RampartError::invalid_request(
                "Provide either a SQL condition or column matches, not both",
            )),
            (Some(sql), None) => Ok(Some(RowFilter::Raw(RawCondition::trusted(sql)))),
            (None, Some(map)) => Ok(Some(RowFilter::Matches(map))),
            (None, None) => Ok(None),
        }
    }

    /// Like `into_filter`, but an unrestricted selection is an error.
    pub fn into_required_filter(self) -> RampartResult<RowFilter> {
        self.into_filter()?.ok_or_else(|| RampartError::missing("condition"))
    }
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

/// `fetchRows` parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRowsRequest {
    /// 1-based page number
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub order_by: Option<String>,
    /// "ASC" or "DESC"
    #[serde(default)]
    pub order_direction: Option<String>,
    #[serde(flatten)]
    pub selection: RowSelection,
}

impl Default for FetchRowsRequest {
    fn default() -> Self {
        Self {
            page: default_page(),
            page_size: default_page_size(),
            order_by: None,
            order_direction: None,
            selection: RowSelection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertRowRequest {
    pub values: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRowsRequest {
    pub values: Map<String, Value>,
    #[serde(flatten)]
    pub selection: RowSelection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRowsRequest {
    #[serde(flatten)]
    pub selection: RowSelection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTableRequest {
    pub columns: Vec<ColumnDefinition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropTableRequest {
    #[serde(default)]
    pub cascade: bool,
}

fn default_permissive() -> bool {
    true
}

/// A policy to create or replace.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDefinition {
    pub name: String,
    /// `false` creates an `AS RESTRICTIVE` policy
    #[serde(default = "default_permissive")]
    pub permissive: bool,
    #[serde(default)]
    pub command: PolicyCommand,
    /// Roles the policy applies to; empty means PUBLIC
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, alias = "using")]
    pub using_expression: Option<String>,
    #[serde(default, alias = "withCheck")]
    pub with_check_expression: Option<String>,
}

impl PolicyDefinition {
    pub fn new(name: impl Into<String>, command: PolicyCommand) -> Self {
        Self {
            name: name.into(),
            permissive: true,
            command,
            roles: Vec::new(),
            using_expression: None,
            with_check_expression: None,
        }
    }

    pub fn using(mut self, expr: impl Into<String>) -> Self {
        self.using_expression = Some(expr.into());
        self
    }

    pub fn with_check(mut self, expr: impl Into<String>) -> Self {
        self.with_check_expression = Some(expr.into());
        self
    }
}

/// Desired row-level security switches; absent fields are left unchanged.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowSecuritySettings {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub forced: Option<bool>,
}
