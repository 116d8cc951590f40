//! SQL construction.
//!
//! - `ident` - identifier/literal quoting and validated table references
//! - `value` - JSON values bound as text-format parameters
//! - `condition` - row filters, including the raw-SQL trust boundary
//! - `builder` - statement builders for row access, DDL and RLS

pub mod builder;
pub mod condition;
pub mod ident;
pub mod value;

pub use builder::{OrderBy, SortDirection, Statement};
pub use condition::{RawCondition, RowFilter};
pub use ident::{quote_identifier, quote_literal, TableRef};
pub use value::SqlValue;
