//! Conversion of PostgreSQL rows into JSON values.
//!
//! Columns are read as raw binary and decoded by their reported type through
//! tokio-postgres `FromSql` impls, the `postgres-protocol` wire readers and
//! `rust_decimal`. Types whose binary form is their text come back as
//! strings; anything else comes back as `\x` hex, so an unfamiliar type never
//! fails the whole result.

use std::collections::HashSet;
use std::error::Error;
use std::fmt::Write as _;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use fallible_iterator::FallibleIterator;
use postgres_protocol::types as wire;
use rust_decimal::Decimal;
use serde_json::{Map, Number, Value as JsonValue};
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::Row;

use crate::error::{RampartError, RampartResult};

type BoxError = Box<dyn Error + Sync + Send>;
type DecodeResult = Result<JsonValue, BoxError>;

/// Column bytes exactly as sent by the server.
struct RawColumn<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawColumn<'a> {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(Self(raw))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Unique keys for a result's columns, in column order.
///
/// A repeated name gets a numeric suffix (`id`, `id_2`), skipping suffixes
/// that another column already carries as its own name.
pub fn column_labels<'a, I>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let names: Vec<&str> = names.into_iter().collect();
    let reserved: HashSet<&str> = names.iter().copied().collect();
    let mut used: HashSet<String> = HashSet::with_capacity(names.len());

    names
        .iter()
        .map(|&name| {
            let label = if used.contains(name) {
                (2..)
                    .map(|n| format!("{name}_{n}"))
                    .find(|candidate| {
                        !reserved.contains(candidate.as_str()) && !used.contains(candidate)
                    })
                    .unwrap_or_default()
            } else {
                name.to_string()
            };
            used.insert(label.clone());
            label
        })
        .collect()
}

/// Convert a row to a JSON object keyed by `labels`, in column order.
///
/// `labels` comes from [`column_labels`] over the same columns.
pub fn row_to_json(row: &Row, labels: &[String]) -> RampartResult<Map<String, JsonValue>> {
    let mut object = Map::with_capacity(row.len());
    for (i, (column, label)) in row.columns().iter().zip(labels).enumerate() {
        let raw: Option<RawColumn<'_>> = row.try_get(i)?;
        let value = match raw {
            None => JsonValue::Null,
            Some(RawColumn(bytes)) => decode(column.type_(), bytes).map_err(|e| {
                RampartError::internal(format!("Failed to decode column {}: {e}", column.name()))
            })?,
        };
        object.insert(label.clone(), value);
    }
    Ok(object)
}

fn decode(ty: &Type, raw: &[u8]) -> DecodeResult {
    let value = match *ty {
        Type::BOOL => JsonValue::Bool(bool::from_sql(ty, raw)?),
        Type::CHAR => JsonValue::String(char::from(i8::from_sql(ty, raw)? as u8).to_string()),
        Type::INT2 => i16::from_sql(ty, raw)?.into(),
        Type::INT4 => i32::from_sql(ty, raw)?.into(),
        Type::INT8 => i64::from_sql(ty, raw)?.into(),
        Type::OID => u32::from_sql(ty, raw)?.into(),
        Type::REGPROC
        | Type::REGPROCEDURE
        | Type::REGOPER
        | Type::REGOPERATOR
        | Type::REGCLASS
        | Type::REGTYPE
        | Type::REGCONFIG
        | Type::REGNAMESPACE
        | Type::REGROLE
        | Type::XID
        | Type::CID => wire::oid_from_sql(raw)?.into(),
        Type::FLOAT4 => float(f32::from_sql(ty, raw)? as f64),
        Type::FLOAT8 => float(f64::from_sql(ty, raw)?),
        Type::NUMERIC => decode_numeric(raw)?,
        // Cents; the text form's currency symbol depends on lc_monetary.
        Type::MONEY => JsonValue::String(Decimal::new(wire::int8_from_sql(raw)?, 2).to_string()),
        Type::UUID => JsonValue::String(uuid::Uuid::from_sql(ty, raw)?.to_string()),
        Type::JSON | Type::JSONB => JsonValue::from_sql(ty, raw)?,
        Type::DATE => JsonValue::String(match wire::date_from_sql(raw)? {
            i32::MAX => "infinity".to_string(),
            i32::MIN => "-infinity".to_string(),
            _ => NaiveDate::from_sql(ty, raw)?.to_string(),
        }),
        Type::TIME => JsonValue::String(NaiveTime::from_sql(ty, raw)?.to_string()),
        Type::TIMETZ => JsonValue::String(decode_timetz(raw)?),
        Type::TIMESTAMP => JsonValue::String(match wire::timestamp_from_sql(raw)? {
            i64::MAX => "infinity".to_string(),
            i64::MIN => "-infinity".to_string(),
            _ => NaiveDateTime::from_sql(ty, raw)?.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
        }),
        Type::TIMESTAMPTZ => JsonValue::String(match wire::timestamp_from_sql(raw)? {
            i64::MAX => "infinity".to_string(),
            i64::MIN => "-infinity".to_string(),
            _ => DateTime::<Utc>::from_sql(ty, raw)?.to_rfc3339(),
        }),
        Type::INTERVAL => JsonValue::String(decode_interval(raw)?),
        Type::BYTEA => JsonValue::String(hex(wire::bytea_from_sql(raw))),
        Type::INET | Type::CIDR => {
            let inet = wire::inet_from_sql(raw)?;
            let host_bits = if inet.addr().is_ipv4() { 32 } else { 128 };
            JsonValue::String(if *ty == Type::CIDR || inet.netmask() != host_bits {
                format!("{}/{}", inet.addr(), inet.netmask())
            } else {
                inet.addr().to_string()
            })
        }
        Type::MACADDR => JsonValue::String(colon_hex(&wire::macaddr_from_sql(raw)?)),
        Type::MACADDR8 if raw.len() == 8 => JsonValue::String(colon_hex(raw)),
        Type::POINT => JsonValue::String(point(&wire::point_from_sql(raw)?)),
        Type::BOX => {
            let rect = wire::box_from_sql(raw)?;
            JsonValue::String(format!("{},{}", point(&rect.upper_right()), point(&rect.lower_left())))
        }
        Type::PATH => {
            let path = wire::path_from_sql(raw)?;
            let points: Vec<String> = path.points().map(|p| Ok(point(&p))).collect()?;
            let (open, close) = if path.closed() { ('(', ')') } else { ('[', ']') };
            JsonValue::String(format!("{open}{}{close}", points.join(",")))
        }
        Type::BIT | Type::VARBIT => {
            let bits = wire::varbit_from_sql(raw)?;
            JsonValue::String(
                (0..bits.len())
                    .map(|i| if bits.bytes()[i / 8] & (0x80 >> (i % 8)) != 0 { '1' } else { '0' })
                    .collect(),
            )
        }
        Type::XML => JsonValue::String(wire::text_from_sql(raw)?.to_string()),
        _ => match ty.kind() {
            Kind::Array(member) => decode_array(member, raw)?,
            Kind::Domain(base) => decode(base, raw)?,
            Kind::Enum(_) => JsonValue::String(wire::text_from_sql(raw)?.to_string()),
            _ if <&str as FromSql>::accepts(ty) => {
                JsonValue::String(<&str as FromSql>::from_sql(ty, raw)?.to_string())
            }
            _ => JsonValue::String(hex(raw)),
        },
    };
    Ok(value)
}

fn float(value: f64) -> JsonValue {
    match Number::from_f64(value) {
        Some(n) => JsonValue::Number(n),
        None if value.is_nan() => JsonValue::String("NaN".into()),
        None if value > 0.0 => JsonValue::String("Infinity".into()),
        None => JsonValue::String("-Infinity".into()),
    }
}

fn hex(raw: &[u8]) -> String {
    let mut out = String::with_capacity(2 + raw.len() * 2);
    out.push_str("\\x");
    for byte in raw {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn colon_hex(raw: &[u8]) -> String {
    raw.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

fn point(p: &wire::Point) -> String {
    format!("({},{})", p.x(), p.y())
}

const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Significant digits `Decimal` holds exactly.
const DECIMAL_DIGITS: u32 = 28;

/// Render a `numeric` exactly, keeping its declared scale.
///
/// Values too wide for `Decimal` come back as hex rather than rounded.
fn decode_numeric(raw: &[u8]) -> DecodeResult {
    let header = |at: usize| -> Result<i16, BoxError> {
        wire::int2_from_sql(raw.get(at..at + 2).ok_or("numeric value too short")?)
    };
    let ndigits = header(0)?;
    let weight = header(2)?;
    match header(4)? as u16 {
        NUMERIC_NAN => return Ok("NaN".into()),
        NUMERIC_PINF => return Ok("Infinity".into()),
        NUMERIC_NINF => return Ok("-Infinity".into()),
        _ => {}
    }
    let scale = header(6)?.max(0) as u32;

    // Base-10000 groups; the leading one carries one to four digits.
    let integer_digits = if weight >= 0 && ndigits > 0 {
        weight as u32 * 4 + (header(8)?.max(1) as u32).ilog10() + 1
    } else {
        0
    };
    if integer_digits + scale > DECIMAL_DIGITS {
        tracing::debug!(integer_digits, scale, "numeric wider than Decimal; returning raw bytes");
        return Ok(JsonValue::String(hex(raw)));
    }
    Ok(JsonValue::String(Decimal::from_sql(&Type::NUMERIC, raw)?.to_string()))
}

/// Render a `timetz` as time of day plus UTC offset.
fn decode_timetz(raw: &[u8]) -> Result<String, BoxError> {
    let (time, zone) = raw.split_at_checked(8).ok_or("timetz value too short")?;
    let time = NaiveTime::from_sql(&Type::TIME, time)?;
    // Stored as seconds west of UTC.
    let offset = FixedOffset::west_opt(wire::int4_from_sql(zone)?).ok_or("timetz offset out of range")?;
    Ok(format!("{time}{offset}"))
}

/// Render an `interval` the way psql shows it.
fn decode_interval(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() != 16 {
        return Err("invalid interval length".into());
    }
    let micros = wire::int8_from_sql(&raw[..8])?;
    let days = wire::int4_from_sql(&raw[8..12])?;
    let months = wire::int4_from_sql(&raw[12..])?;

    let unit = |n: i32, singular: &str| {
        if n == 1 {
            format!("{n} {singular}")
        } else {
            format!("{n} {singular}s")
        }
    };

    let mut parts = Vec::new();
    let (years, months) = (months / 12, months % 12);
    if years != 0 {
        parts.push(unit(years, "year"));
    }
    if months != 0 {
        parts.push(unit(months, "mon"));
    }
    if days != 0 {
        parts.push(unit(days, "day"));
    }

    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let total = micros.unsigned_abs();
        let hours = total / 3_600_000_000;
        let minutes = total / 60_000_000 % 60;
        let seconds = total / 1_000_000 % 60;
        let fraction = total % 1_000_000;

        let mut clock = format!("{sign}{hours:02}:{minutes:02}:{seconds:02}");
        if fraction > 0 {
            let digits = format!("{fraction:06}");
            clock.push('.');
            clock.push_str(digits.trim_end_matches('0'));
        }
        parts.push(clock);
    }
    Ok(parts.join(" "))
}

/// Decode an array into (possibly nested) JSON arrays.
fn decode_array(member: &Type, raw: &[u8]) -> DecodeResult {
    let array = wire::array_from_sql(raw)?;
    let dims: Vec<usize> = array.dimensions().map(|d| Ok(d.len.max(0) as usize)).collect()?;
    if dims.is_empty() {
        return Ok(JsonValue::Array(Vec::new()));
    }

    let mut elements: Vec<JsonValue> = array
        .values()
        .map(|value| match value {
            Some(bytes) => decode(member, bytes),
            None => Ok(JsonValue::Null),
        })
        .collect()?;

    // Group innermost dimension first.
    for &dim in dims.iter().skip(1).rev() {
        elements = elements
            .chunks(dim.max(1))
            .map(|chunk| JsonValue::Array(chunk.to_vec()))
            .collect();
    }
    Ok(JsonValue::Array(elements))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn numeric(weight: i16, sign: u16, dscale: u16, digits: &[i16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(digits.len() as i16).to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    #[test]
    fn test_numeric_is_exact() {
        let text = |raw: Vec<u8>| decode(&Type::NUMERIC, &raw).unwrap();
        assert_eq!(text(numeric(1, 0, 2, &[1, 2345, 6700])), json!("12345.67"));
        assert_eq!(text(numeric(-1, 0, 3, &[10])), json!("0.001"));
        assert_eq!(text(numeric(0, 0x4000, 1, &[1, 5000])), json!("-1.5"));
        assert_eq!(text(numeric(0, 0, 0, &[])), json!("0"));
        assert_eq!(text(numeric(2, 0, 0, &[1, 0, 0])), json!("100000000"));
        assert_eq!(text(numeric(0, 0, 2, &[3])), json!("3.00"));
    }

    #[test]
    fn test_numeric_special_and_oversized() {
        assert_eq!(decode(&Type::NUMERIC, &numeric(0, NUMERIC_NAN, 0, &[])).unwrap(), json!("NaN"));
        assert_eq!(decode(&Type::NUMERIC, &numeric(0, NUMERIC_PINF, 0, &[])).unwrap(), json!("Infinity"));
        assert_eq!(decode(&Type::NUMERIC, &numeric(0, NUMERIC_NINF, 0, &[])).unwrap(), json!("-Infinity"));

        // 10^28 has 29 digits
        let wide = numeric(7, 0, 0, &[1]);
        assert_eq!(decode(&Type::NUMERIC, &wide).unwrap(), json!(hex(&wide)));
    }

    #[test]
    fn test_money_and_timetz() {
        assert_eq!(decode(&Type::MONEY, &100i64.to_be_bytes()).unwrap(), json!("1.00"));
        assert_eq!(decode(&Type::MONEY, &(-150i64).to_be_bytes()).unwrap(), json!("-1.50"));

        let mut timetz = 28_800_000_000i64.to_be_bytes().to_vec();
        timetz.extend_from_slice(&(-7200i32).to_be_bytes());
        assert_eq!(decode(&Type::TIMETZ, &timetz).unwrap(), json!("08:00:00+02:00"));
        assert!(decode(&Type::TIMETZ, &timetz[..8]).is_err());
    }

    fn interval(micros: i64, days: i32, months: i32) -> Vec<u8> {
        let mut raw = micros.to_be_bytes().to_vec();
        raw.extend_from_slice(&days.to_be_bytes());
        raw.extend_from_slice(&months.to_be_bytes());
        raw
    }

    #[test]
    fn test_interval_formatting() {
        assert_eq!(decode_interval(&interval(0, 0, 0)).unwrap(), "00:00:00");
        assert_eq!(decode_interval(&interval(0, 3, 14)).unwrap(), "1 year 2 mons 3 days");
        assert_eq!(decode_interval(&interval(14_706_500_000, 1, 0)).unwrap(), "1 day 04:05:06.5");
        assert_eq!(decode_interval(&interval(-60_000_000, -1, 0)).unwrap(), "-1 days -00:01:00");
    }

    #[test]
    fn test_scalars() {
        assert_eq!(decode(&Type::BOOL, &[1]).unwrap(), json!(true));
        assert_eq!(decode(&Type::INT4, &42i32.to_be_bytes()).unwrap(), json!(42));
        assert_eq!(decode(&Type::INT8, &(-7i64).to_be_bytes()).unwrap(), json!(-7));
        assert_eq!(decode(&Type::FLOAT8, &2.5f64.to_be_bytes()).unwrap(), json!(2.5));
        assert_eq!(decode(&Type::FLOAT8, &f64::NAN.to_be_bytes()).unwrap(), json!("NaN"));
        assert_eq!(decode(&Type::REGCLASS, &1259u32.to_be_bytes()).unwrap(), json!(1259));
        assert_eq!(decode(&Type::TEXT, b"hello").unwrap(), json!("hello"));
        assert_eq!(decode(&Type::BYTEA, &[0xde, 0xad]).unwrap(), json!("\\xdead"));
    }

    #[test]
    fn test_only_text_types_read_as_text() {
        let mood = Type::new("mood".into(), 90001, Kind::Enum(vec!["happy".into()]), "public".into());
        assert_eq!(decode(&mood, b"happy").unwrap(), json!("happy"));

        // Valid UTF-8 but not a text type
        let opaque = Type::new("opaque".into(), 90002, Kind::Simple, "public".into());
        assert_eq!(decode(&opaque, b"abc").unwrap(), json!("\\x616263"));
    }

    #[test]
    fn test_network_and_geometry() {
        assert_eq!(decode(&Type::INET, &[2, 32, 0, 4, 10, 0, 0, 1]).unwrap(), json!("10.0.0.1"));
        assert_eq!(decode(&Type::INET, &[2, 24, 0, 4, 10, 0, 0, 1]).unwrap(), json!("10.0.0.1/24"));
        assert_eq!(decode(&Type::CIDR, &[2, 24, 1, 4, 10, 0, 0, 0]).unwrap(), json!("10.0.0.0/24"));
        assert_eq!(
            decode(&Type::MACADDR, &[0x08, 0x00, 0x2b, 0x01, 0x02, 0x03]).unwrap(),
            json!("08:00:2b:01:02:03")
        );

        let mut pt = 1f64.to_be_bytes().to_vec();
        pt.extend_from_slice(&2.5f64.to_be_bytes());
        assert_eq!(decode(&Type::POINT, &pt).unwrap(), json!("(1,2.5)"));

        let mut rect = Vec::new();
        for v in [1f64, 1.0, 0.0, 0.0] {
            rect.extend_from_slice(&v.to_be_bytes());
        }
        assert_eq!(decode(&Type::BOX, &rect).unwrap(), json!("(1,1),(0,0)"));
    }

    #[test]
    fn test_bit_strings() {
        let mut bits = 3i32.to_be_bytes().to_vec();
        bits.push(0b1010_0000);
        assert_eq!(decode(&Type::BIT, &bits).unwrap(), json!("101"));
        assert_eq!(decode(&Type::VARBIT, &0i32.to_be_bytes()).unwrap(), json!(""));
    }

    #[test]
    fn test_dates_and_infinity() {
        // 2000-01-02, one day after the PostgreSQL epoch
        assert_eq!(decode(&Type::DATE, &1i32.to_be_bytes()).unwrap(), json!("2000-01-02"));
        assert_eq!(decode(&Type::DATE, &i32::MAX.to_be_bytes()).unwrap(), json!("infinity"));
        assert_eq!(decode(&Type::TIMESTAMPTZ, &i64::MIN.to_be_bytes()).unwrap(), json!("-infinity"));
        assert_eq!(
            decode(&Type::TIMESTAMP, &1_500_000i64.to_be_bytes()).unwrap(),
            json!("2000-01-01T00:00:01.500")
        );
    }

    fn int4_array(dims: &[i32], values: &[Option<i32>]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(dims.len() as i32).to_be_bytes());
        raw.extend_from_slice(&(values.iter().any(Option::is_none) as i32).to_be_bytes());
        raw.extend_from_slice(&23i32.to_be_bytes());
        for d in dims {
            raw.extend_from_slice(&d.to_be_bytes());
            raw.extend_from_slice(&1i32.to_be_bytes());
        }
        for v in values {
            match v {
                Some(v) => {
                    raw.extend_from_slice(&4i32.to_be_bytes());
                    raw.extend_from_slice(&v.to_be_bytes());
                }
                None => raw.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        raw
    }

    #[test]
    fn test_arrays() {
        let flat = int4_array(&[3], &[Some(1), None, Some(3)]);
        assert_eq!(decode(&Type::INT4_ARRAY, &flat).unwrap(), json!([1, null, 3]));

        let nested = int4_array(&[2, 2], &[Some(1), Some(2), Some(3), Some(4)]);
        assert_eq!(decode(&Type::INT4_ARRAY, &nested).unwrap(), json!([[1, 2], [3, 4]]));

        assert_eq!(decode(&Type::INT4_ARRAY, &int4_array(&[], &[])).unwrap(), json!([]));
    }

    #[test]
    fn test_truncated_value_is_an_error() {
        assert!(decode(&Type::INTERVAL, &[0, 1]).is_err());
        assert!(decode(&Type::INT4_ARRAY, &[0, 0, 0, 1]).is_err());
        assert!(decode(&Type::NUMERIC, &[0, 1, 0]).is_err());
    }

    #[test]
    fn test_duplicate_column_names_get_suffixes() {
        assert_eq!(column_labels(["id", "name", "id"]), vec!["id", "name", "id_2"]);
        assert_eq!(column_labels(["x", "x", "x"]), vec!["x", "x_2", "x_3"]);
        // An existing column named `id_2` keeps its name
        assert_eq!(column_labels(["id", "id", "id_2"]), vec!["id", "id_3", "id_2"]);
        assert_eq!(column_labels(["a", "b"]), vec!["a", "b"]);
    }
}
