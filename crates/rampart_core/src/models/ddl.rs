//! Structured DDL input: column definitions and ALTER TABLE actions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RampartError;

const MAX_CHAR_LENGTH: u32 = 10_485_760;
const MAX_NUMERIC_PRECISION: u16 = 1000;

/// Column types a table can be created with.
///
/// Parsed from the type name the UI sends; anything outside this list is
/// rejected rather than passed through to the DDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    SmallInt,
    Integer,
    BigInt,
    Serial,
    BigSerial,
    Real,
    DoublePrecision,
    Numeric { precision: Option<u16>, scale: Option<u16> },
    Boolean,
    Text,
    Varchar(Option<u32>),
    Char(Option<u32>),
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,
    Uuid,
    Json,
    Jsonb,
    Bytea,
    Inet,
    Array(Box<ColumnType>),
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SmallInt => f.write_str("smallint"),
            Self::Integer => f.write_str("integer"),
            Self::BigInt => f.write_str("bigint"),
            Self::Serial => f.write_str("serial"),
            Self::BigSerial => f.write_str("bigserial"),
            Self::Real => f.write_str("real"),
            Self::DoublePrecision => f.write_str("double precision"),
            Self::Numeric { precision: Some(p), scale: Some(s) } => write!(f, "numeric({p}, {s})"),
            Self::Numeric { precision: Some(p), scale: None } => write!(f, "numeric({p})"),
            Self::Numeric { .. } => f.write_str("numeric"),
            Self::Boolean => f.write_str("boolean"),
            Self::Text => f.write_str("text"),
            Self::Varchar(Some(n)) => write!(f, "varchar({n})"),
            Self::Varchar(None) => f.write_str("varchar"),
            Self::Char(Some(n)) => write!(f, "char({n})"),
            Self::Char(None) => f.write_str("char"),
            Self::Date => f.write_str("date"),
            Self::Time => f.write_str("time"),
            Self::Timestamp => f.write_str("timestamp"),
            Self::TimestampTz => f.write_str("timestamptz"),
            Self::Interval => f.write_str("interval"),
            Self::Uuid => f.write_str("uuid"),
            Self::Json => f.write_str("json"),
            Self::Jsonb => f.write_str("jsonb"),
            Self::Bytea => f.write_str("bytea"),
            Self::Inet => f.write_str("inet"),
            Self::Array(inner) => write!(f, "{inner}[]"),
        }
    }
}

impl FromStr for ColumnType {
    type Err = RampartError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
        let unknown = || {
            RampartError::invalid_request_with_hint(
                format!("Unsupported column type: {s}"),
                "Use one of the listed types, e.g. integer, text, varchar(255), numeric(10, 2)",
            )
        };

        if let Some(inner) = normalized.strip_suffix("[]") {
            let inner: ColumnType = inner.parse()?;
            return match inner {
                Self::Array(_) | Self::Serial | Self::BigSerial => Err(unknown()),
                inner => Ok(Self::Array(Box::new(inner))),
            };
        }

        let (base, args) = match normalized.split_once('(') {
            Some((base, rest)) => {
                let args = rest.strip_suffix(')').ok_or_else(unknown)?;
                let args = args
                    .split(',')
                    .map(|a| a.trim().parse::<u32>().map_err(|_| unknown()))
                    .collect::<Result<Vec<_>, _>>()?;
                (base.trim(), Some(args))
            }
            None => (normalized.as_str(), None),
        };

        let plain = |ty: ColumnType| if args.is_some() { Err(unknown()) } else { Ok(ty) };
        let length = || match args.as_deref() {
            None => Ok(None),
            Some([n]) if (1..=MAX_CHAR_LENGTH).contains(n) => Ok(Some(*n)),
            Some(_) => Err(unknown()),
        };

        match base {
            "smallint" | "int2" => plain(Self::SmallInt),
            "integer" | "int" | "int4" => plain(Self::Integer),
            "bigint" | "int8" => plain(Self::BigInt),
            "serial" | "serial4" => plain(Self::Serial),
            "bigserial" | "serial8" => plain(Self::BigSerial),
            "real" | "float4" => plain(Self::Real),
            "double precision" | "float8" => plain(Self::DoublePrecision),
            "boolean" | "bool" => plain(Self::Boolean),
            "text" => plain(Self::Text),
            "date" => plain(Self::Date),
            "time" | "time without time zone" => plain(Self::Time),
            "timestamp" | "timestamp without time zone" => plain(Self::Timestamp),
            "timestamptz" | "timestamp with time zone" => plain(Self::TimestampTz),
            "interval" => plain(Self::Interval),
            "uuid" => plain(Self::Uuid),
            "json" => plain(Self::Json),
            "jsonb" => plain(Self::Jsonb),
            "bytea" => plain(Self::Bytea),
            "inet" => plain(Self::Inet),
            "varchar" | "character varying" => length().map(Self::Varchar),
            "char" | "character" => length().map(Self::Char),
            "numeric" | "decimal" => match args.as_deref() {
                None => Ok(Self::Numeric { precision: None, scale: None }),
                Some([p]) if valid_precision(*p) => {
                    Ok(Self::Numeric { precision: Some(*p as u16), scale: None })
                }
                Some([p, s]) if valid_precision(*p) && s <= p => {
                    Ok(Self::Numeric { precision: Some(*p as u16), scale: Some(*s as u16) })
                }
                Some(_) => Err(unknown()),
            },
            _ => Err(unknown()),
        }
    }
}

fn valid_precision(p: u32) -> bool {
    (1..=MAX_NUMERIC_PRECISION as u32).contains(&p)
}

impl<'de> Deserialize<'de> for ColumnType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for ColumnType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// ON DELETE / ON UPDATE behaviour of a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }
}

impl FromStr for ReferentialAction {
    type Err = RampartError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "NO ACTION" => Ok(Self::NoAction),
            "RESTRICT" => Ok(Self::Restrict),
            "CASCADE" => Ok(Self::Cascade),
            "SET NULL" => Ok(Self::SetNull),
            "SET DEFAULT" => Ok(Self::SetDefault),
            _ => Err(RampartError::invalid_request(format!("Unknown referential action: {s}"))),
        }
    }
}

impl<'de> Deserialize<'de> for ReferentialAction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Target of a column-level foreign key, in the same schema.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyReference {
    pub table: String,
    pub column: String,
    #[serde(default)]
    pub on_delete: Option<ReferentialAction>,
    #[serde(default)]
    pub on_update: Option<ReferentialAction>,
}

/// Server functions allowed as column defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DefaultFunction {
    Now,
    CurrentTimestamp,
    CurrentDate,
    GenRandomUuid,
}

impl DefaultFunction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Now => "now()",
            Self::CurrentTimestamp => "CURRENT_TIMESTAMP",
            Self::CurrentDate => "CURRENT_DATE",
            Self::GenRandomUuid => "gen_random_uuid()",
        }
    }
}

/// A column default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum DefaultValue {
    /// Rendered as a quoted literal.
    Literal(Value),
    Function(DefaultFunction),
    /// Operator-written SQL expression, inserted verbatim.
    Expression(String),
}

/// One column of a CREATE TABLE or ADD COLUMN.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type", alias = "dataType")]
    pub data_type: ColumnType,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub default: Option<DefaultValue>,
    #[serde(default)]
    pub references: Option<ForeignKeyReference>,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
            primary_key: false,
            unique: false,
            not_null: false,
            default: None,
            references: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ForeignKeyReference {
            table: table.into(),
            column: column.into(),
            on_delete: None,
            on_update: None,
        });
        self
    }
}

/// The single change an ALTER TABLE request makes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum AlterTableAction {
    AddColumn { column: ColumnDefinition },
    DropColumn {
        column: String,
        #[serde(default)]
        cascade: bool,
    },
    RenameColumn { from: String, to: String },
    RenameTable { to: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(s: &str) -> Result<ColumnType, RampartError> {
        s.parse()
    }

    #[test]
    fn test_parses_allow_listed_types() {
        assert_eq!(parse("INT4").unwrap(), ColumnType::Integer);
        assert_eq!(parse("  Double   Precision ").unwrap(), ColumnType::DoublePrecision);
        assert_eq!(parse("varchar(255)").unwrap(), ColumnType::Varchar(Some(255)));
        assert_eq!(
            parse("numeric(10, 2)").unwrap(),
            ColumnType::Numeric { precision: Some(10), scale: Some(2) }
        );
        assert_eq!(parse("text[]").unwrap(), ColumnType::Array(Box::new(ColumnType::Text)));
        assert_eq!(parse("timestamp with time zone").unwrap(), ColumnType::TimestampTz);
    }

    #[test]
    fn test_rejects_freeform_types() {
        for bad in [
            "text; DROP TABLE users",
            "varchar(0)",
            "numeric(2, 5)",
            "integer(4)",
            "serial[]",
            "text[][]",
            "varchar(abc)",
            "geometry",
            "",
        ] {
            assert!(parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_display_is_canonical() {
        assert_eq!(parse("decimal(8,3)").unwrap().to_string(), "numeric(8, 3)");
        assert_eq!(parse("int8[]").unwrap().to_string(), "bigint[]");
        assert_eq!(parse("character varying").unwrap().to_string(), "varchar");
    }

    #[test]
    fn test_referential_actions() {
        assert_eq!("set null".parse::<ReferentialAction>().unwrap(), ReferentialAction::SetNull);
        assert_eq!("SET_DEFAULT".parse::<ReferentialAction>().unwrap(), ReferentialAction::SetDefault);
        assert!("explode".parse::<ReferentialAction>().is_err());
    }

    #[test]
    fn test_column_definition_from_ui() {
        let col: ColumnDefinition = serde_json::from_value(json!({
            "name": "owner_id",
            "type": "bigint",
            "notNull": true,
            "default": {"kind": "literal", "value": 0},
            "references": {"table": "users", "column": "id", "onDelete": "CASCADE"}
        }))
        .unwrap();
        assert_eq!(col.data_type, ColumnType::BigInt);
        assert!(col.not_null && !col.primary_key);
        assert_eq!(col.default, Some(DefaultValue::Literal(json!(0))));
        assert_eq!(col.references.unwrap().on_delete, Some(ReferentialAction::Cascade));
    }

    #[test]
    fn test_alter_actions_from_ui() {
        let action: AlterTableAction =
            serde_json::from_value(json!({"action": "dropColumn", "column": "legacy"})).unwrap();
        assert_eq!(action, AlterTableAction::DropColumn { column: "legacy".into(), cascade: false });

        let action: AlterTableAction =
            serde_json::from_value(json!({"action": "renameTable", "to": "people"})).unwrap();
        assert_eq!(action, AlterTableAction::RenameTable { to: "people".into() });

        let bad = serde_json::from_value::<AlterTableAction>(json!({
            "action": "addColumn",
            "column": {"name": "x", "type": "evil()"}
        }));
        assert!(bad.is_err());
    }
}
