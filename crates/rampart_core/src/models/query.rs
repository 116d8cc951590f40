//! Query result models returned to the UI layer.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{RampartError, RampartResult};

/// Normalized result of any statement.
///
/// Every row carries exactly the keys listed in `columns`, in that order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Column names in engine order
    pub columns: Vec<String>,
    /// Rows keyed by column name
    pub rows: Vec<Map<String, Value>>,
    /// Rows returned, or rows affected for statements without a result set
    pub row_count: u64,
}

impl QueryResult {
    /// Check if the result has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Get the first row, if any.
    pub fn first(&self) -> Option<&Map<String, Value>> {
        self.rows.first()
    }
}

/// Page bookkeeping for `fetchRows`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    /// 1-based page number
    pub page: u32,
    pub page_size: u32,
    pub total_rows: u64,
    pub total_pages: u64,
}

impl Pagination {
    /// Validate a page request against the size cap.
    pub fn check(page: u32, page_size: u32, max_page_size: u32) -> RampartResult<()> {
        if page == 0 {
            return Err(RampartError::invalid_request_with_hint(
                "Page numbers start at 1",
                "Request page 1 for the first page",
            ));
        }
        if page_size == 0 || page_size > max_page_size {
            return Err(RampartError::invalid_request(format!(
                "Page size must be between 1 and {max_page_size}"
            )));
        }
        Ok(())
    }

    pub fn new(page: u32, page_size: u32, total_rows: u64) -> Self {
        let total_pages = if page_size == 0 { 0 } else { total_rows.div_ceil(page_size as u64) };
        Self { page, page_size, total_rows, total_pages }
    }

    /// Row offset of the first row on this page.
    pub fn offset(page: u32, page_size: u32) -> u64 {
        (page.saturating_sub(1) as u64) * page_size as u64
    }
}

/// Result of `fetchRows`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowsPage {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    pub pagination: Pagination,
}

/// Result of `connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub tables: Vec<String>,
}

/// Result of `testConnection`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResult {
    pub server_version: String,
    pub latency_ms: u64,
}
