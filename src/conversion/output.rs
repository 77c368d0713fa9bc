use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime, TimeDelta};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use uuid::Uuid;

use crate::driver::ColumnType;
use crate::error::SqlEngineError;
use crate::provider::GuidByteOrder;
use crate::types::{DatabaseType, RowValues, ValueFamily, ValueType, parse_timestamp};

/// Rebuild an identifier from a fixed 16-byte block.
#[must_use]
pub fn guid_from_bytes(bytes: &[u8], order: GuidByteOrder) -> Option<Uuid> {
    let block: [u8; 16] = bytes.try_into().ok()?;
    Some(match order {
        GuidByteOrder::BigEndian => Uuid::from_bytes(block),
        GuidByteOrder::MixedEndian => Uuid::from_bytes_le(block),
    })
}

/// Whether a column of `column` type can ever feed a member of `target` type.
///
/// Checked once when a parser is compiled; a `false` here is an
/// `UnsupportedColumnType` error regardless of strictness.
#[must_use]
pub fn column_supports(column: ColumnType, target: ValueType) -> bool {
    use ColumnType as C;

    if column == C::Dynamic {
        return true;
    }
    match target.family() {
        ValueFamily::Integer => matches!(
            column,
            C::Bool
                | C::Int8
                | C::Int16
                | C::Int32
                | C::Int64
                | C::Decimal
                | C::Float32
                | C::Float64
                | C::Text
        ),
        ValueFamily::Float | ValueFamily::Decimal => matches!(
            column,
            C::Int8 | C::Int16 | C::Int32 | C::Int64 | C::Decimal | C::Float32 | C::Float64 | C::Text
        ),
        ValueFamily::Bool => matches!(
            column,
            C::Bool | C::Int8 | C::Int16 | C::Int32 | C::Int64 | C::Text
        ),
        ValueFamily::Text => !matches!(column, C::Binary | C::LongBinary),
        ValueFamily::Date | ValueFamily::DateTime => {
            matches!(column, C::Date | C::DateTime | C::Text)
        }
        ValueFamily::Time => matches!(column, C::Time | C::DateTime | C::Interval | C::Text),
        ValueFamily::Interval => matches!(column, C::Interval | C::Int64 | C::Time),
        ValueFamily::Guid => matches!(column, C::Guid | C::Text | C::Binary),
        ValueFamily::Binary => matches!(column, C::Binary | C::LongBinary | C::Guid | C::Text | C::LongText),
        ValueFamily::Json => matches!(column, C::Json | C::Text | C::LongText),
        ValueFamily::Cursor => matches!(column, C::Text),
    }
}

/// Normalize a raw provider value into the canonical variant for `target`.
///
/// NULL stays NULL. A value that cannot be represented raises under
/// `strict` and becomes NULL (the member default) otherwise.
///
/// # Errors
/// Returns `SqlEngineError::ConversionError` in strict mode when the value
/// cannot be converted.
pub fn convert_output(
    provider: DatabaseType,
    raw: RowValues,
    target: ValueType,
    strict: bool,
) -> Result<RowValues, SqlEngineError> {
    if raw.is_null() {
        return Ok(RowValues::Null);
    }
    if let Some(converted) = canonical(provider, &raw, target) {
        return Ok(converted);
    }
    if strict {
        Err(SqlEngineError::conversion(&raw, target))
    } else {
        tracing::trace!(
            provider = %provider,
            from = raw.type_label(),
            to = ?target,
            "lenient conversion fell back to default"
        );
        Ok(RowValues::Null)
    }
}

fn integer_from(raw: &RowValues) -> Option<i64> {
    match raw {
        RowValues::Int(v) => Some(*v),
        RowValues::Bool(b) => Some(i64::from(*b)),
        RowValues::Decimal(d) if d.fract().is_zero() => d.to_i64(),
        RowValues::Float(f) if f.fract() == 0.0 => f.to_i64(),
        RowValues::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn canonical(provider: DatabaseType, raw: &RowValues, target: ValueType) -> Option<RowValues> {
    match target.family() {
        ValueFamily::Integer => {
            if target == ValueType::U64
                && let RowValues::Decimal(d) = raw
                && d.fract().is_zero()
            {
                return Some(RowValues::Decimal(*d));
            }
            integer_from(raw).map(RowValues::Int)
        }
        ValueFamily::Float => match raw {
            RowValues::Float(f) => Some(RowValues::Float(*f)),
            #[allow(clippy::cast_precision_loss)]
            RowValues::Int(i) => Some(RowValues::Float(*i as f64)),
            RowValues::Decimal(d) => d.to_f64().map(RowValues::Float),
            RowValues::Text(s) => s.trim().parse().ok().map(RowValues::Float),
            _ => None,
        },
        ValueFamily::Decimal => match raw {
            RowValues::Decimal(d) => Some(RowValues::Decimal(*d)),
            RowValues::Int(i) => Some(RowValues::Decimal(Decimal::from(*i))),
            RowValues::Float(f) => Decimal::from_f64(*f).map(RowValues::Decimal),
            RowValues::Text(s) => Decimal::from_str(s.trim()).ok().map(RowValues::Decimal),
            _ => None,
        },
        ValueFamily::Bool => match raw {
            RowValues::Bool(b) => Some(RowValues::Bool(*b)),
            RowValues::Int(i) => Some(RowValues::Bool(*i != 0)),
            RowValues::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "y" | "1" => Some(RowValues::Bool(true)),
                "false" | "f" | "n" | "0" => Some(RowValues::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        ValueFamily::Text | ValueFamily::Cursor => match raw {
            RowValues::Text(s) => Some(RowValues::Text(s.clone())),
            RowValues::Blob(b) => String::from_utf8(b.clone()).ok().map(RowValues::Text),
            RowValues::Timestamp(ts) => Some(RowValues::Text(ts.format("%F %T%.f").to_string())),
            other => Some(RowValues::Text(other.to_string())),
        },
        ValueFamily::Date => match raw {
            RowValues::Date(d) => Some(RowValues::Date(*d)),
            RowValues::Timestamp(ts) => Some(RowValues::Date(ts.date())),
            RowValues::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .ok()
                .or_else(|| parse_timestamp(s.trim()).map(|ts| ts.date()))
                .map(RowValues::Date),
            _ => None,
        },
        ValueFamily::Time => match raw {
            RowValues::Time(t) => Some(RowValues::Time(*t)),
            RowValues::Timestamp(ts) => Some(RowValues::Time(ts.time())),
            RowValues::Interval(d) if *d >= TimeDelta::zero() && *d < TimeDelta::days(1) => {
                Some(RowValues::Time(NaiveTime::MIN + *d))
            }
            RowValues::Text(s) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
                .ok()
                .map(RowValues::Time),
            _ => None,
        },
        ValueFamily::DateTime => match raw {
            RowValues::Timestamp(ts) => Some(RowValues::Timestamp(*ts)),
            RowValues::Date(d) => d.and_hms_opt(0, 0, 0).map(RowValues::Timestamp),
            RowValues::Text(s) => parse_timestamp(s.trim()).map(RowValues::Timestamp),
            _ => None,
        },
        ValueFamily::Interval => match raw {
            RowValues::Interval(d) => Some(RowValues::Interval(*d)),
            RowValues::Int(us) => Some(RowValues::Interval(TimeDelta::microseconds(*us))),
            RowValues::Time(t) => Some(RowValues::Interval(*t - NaiveTime::MIN)),
            _ => None,
        },
        ValueFamily::Guid => match raw {
            RowValues::Guid(g) => Some(RowValues::Guid(*g)),
            RowValues::Text(s) => Uuid::parse_str(s.trim()).ok().map(RowValues::Guid),
            RowValues::Blob(b) => {
                guid_from_bytes(b, GuidByteOrder::for_provider(provider)).map(RowValues::Guid)
            }
            _ => None,
        },
        ValueFamily::Binary => match raw {
            RowValues::Blob(b) => Some(RowValues::Blob(b.clone())),
            RowValues::Text(s) => Some(RowValues::Blob(s.as_bytes().to_vec())),
            RowValues::Guid(g) => Some(RowValues::Blob(g.as_bytes().to_vec())),
            _ => None,
        },
        ValueFamily::Json => match raw {
            RowValues::JSON(j) => Some(RowValues::JSON(j.clone())),
            RowValues::Text(s) => serde_json::from_str(s).ok().map(RowValues::JSON),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_passes_through_regardless_of_target() {
        for target in [ValueType::I32, ValueType::Guid, ValueType::Json] {
            assert_eq!(
                convert_output(DatabaseType::Postgres, RowValues::Null, target, true).unwrap(),
                RowValues::Null
            );
        }
    }

    #[test]
    fn strict_mode_raises_where_lenient_mode_defaults() {
        let raw = RowValues::Text("not a number".into());
        assert!(convert_output(DatabaseType::Sqlite, raw.clone(), ValueType::I32, true).is_err());
        assert_eq!(
            convert_output(DatabaseType::Sqlite, raw, ValueType::I32, false).unwrap(),
            RowValues::Null
        );
    }

    #[test]
    fn identifiers_rebuild_from_bytes_per_provider_order() {
        let id = Uuid::parse_str("00112233-4455-6677-8899-aabbccddeeff").unwrap();
        let le = RowValues::Blob(id.to_bytes_le().to_vec());
        let be = RowValues::Blob(id.as_bytes().to_vec());
        assert_eq!(
            convert_output(DatabaseType::Oracle, le, ValueType::Guid, true).unwrap(),
            RowValues::Guid(id)
        );
        assert_eq!(
            convert_output(DatabaseType::Mssql, be, ValueType::Guid, true).unwrap(),
            RowValues::Guid(id)
        );
        assert!(guid_from_bytes(&[1, 2, 3], GuidByteOrder::BigEndian).is_none());
    }

    #[test]
    fn column_compatibility_is_family_based() {
        assert!(column_supports(ColumnType::Int32, ValueType::I64));
        assert!(column_supports(ColumnType::Binary, ValueType::Guid));
        assert!(column_supports(ColumnType::Dynamic, ValueType::Date));
        assert!(!column_supports(ColumnType::Binary, ValueType::Text));
        assert!(!column_supports(ColumnType::Guid, ValueType::I32));
        assert!(!column_supports(ColumnType::Date, ValueType::Bool));
    }

    #[test]
    fn numeric_widening_and_text_rendering() {
        assert_eq!(
            convert_output(DatabaseType::Mysql, RowValues::Int(3), ValueType::Decimal, true).unwrap(),
            RowValues::Decimal(Decimal::from(3))
        );
        assert_eq!(
            convert_output(DatabaseType::Mysql, RowValues::Int(3), ValueType::Text, true).unwrap(),
            RowValues::Text("3".into())
        );
        assert_eq!(
            convert_output(DatabaseType::Sqlite, RowValues::Int(1), ValueType::Bool, true).unwrap(),
            RowValues::Bool(true)
        );
    }
}
