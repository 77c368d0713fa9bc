use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

use crate::error::SqlEngineError;
use crate::types::{DatabaseType, RowValues, ValueType};

/// Converts an application value into the value a provider binds.
pub type InputConverter = fn(&RowValues) -> Result<RowValues, SqlEngineError>;

/// Sentinel values that stand for "unset" on non-nullable members.
#[must_use]
pub fn is_absent(value: &RowValues) -> bool {
    match value {
        RowValues::Date(d) => *d == NaiveDate::MIN,
        RowValues::Timestamp(ts) => *ts == NaiveDateTime::MIN,
        RowValues::Interval(d) => *d == TimeDelta::MIN,
        RowValues::Guid(g) => g.is_nil(),
        _ => false,
    }
}

/// Input converter for `value_type` on `provider`, if one is needed.
///
/// Types with a direct bind code and no sentinel get `None` and bind as-is.
#[must_use]
pub fn try_input_converter(provider: DatabaseType, value_type: ValueType) -> Option<InputConverter> {
    use DatabaseType::{Mssql, Mysql, Oracle, Postgres, Sqlite};

    let converter: InputConverter = match (provider, value_type) {
        (_, ValueType::LongText) => long_text,

        (Sqlite, ValueType::Date) => date_as_text,
        (Sqlite, ValueType::Time) => time_as_text,
        (Sqlite, ValueType::DateTime) => timestamp_as_text,
        (Sqlite, ValueType::Decimal) => decimal_as_text,
        (Sqlite | Mysql, ValueType::Guid) => guid_as_text,
        (Sqlite | Oracle, ValueType::Bool) => bool_as_int,
        (Sqlite | Mysql | Mssql | Oracle, ValueType::Json) => json_as_text,
        (Sqlite | Mysql | Mssql, ValueType::Interval) => interval_as_micros,
        (Oracle, ValueType::Guid) => guid_as_mixed_endian_bytes,

        (Postgres | Mssql | Oracle | Mysql, ValueType::Date | ValueType::DateTime)
        | (Postgres | Oracle, ValueType::Interval)
        | (Postgres | Mssql, ValueType::Guid) => absent_as_null,

        _ => return None,
    };
    Some(converter)
}

fn absent_as_null(value: &RowValues) -> Result<RowValues, SqlEngineError> {
    if is_absent(value) {
        Ok(RowValues::Null)
    } else {
        Ok(value.clone())
    }
}

fn long_text(value: &RowValues) -> Result<RowValues, SqlEngineError> {
    match value {
        RowValues::Text(s) if s.is_empty() => Ok(RowValues::Null),
        RowValues::Text(_) | RowValues::Null => Ok(value.clone()),
        other => Err(SqlEngineError::conversion(other, ValueType::LongText)),
    }
}

fn date_as_text(value: &RowValues) -> Result<RowValues, SqlEngineError> {
    Ok(match value {
        v if is_absent(v) => RowValues::Null,
        RowValues::Date(d) => RowValues::Text(d.format("%F").to_string()),
        other => other.clone(),
    })
}

fn time_as_text(value: &RowValues) -> Result<RowValues, SqlEngineError> {
    Ok(match value {
        RowValues::Time(t) => RowValues::Text(t.format("%T%.f").to_string()),
        other => other.clone(),
    })
}

fn timestamp_as_text(value: &RowValues) -> Result<RowValues, SqlEngineError> {
    Ok(match value {
        v if is_absent(v) => RowValues::Null,
        RowValues::Timestamp(ts) => RowValues::Text(ts.format("%F %T%.f").to_string()),
        RowValues::Date(d) => RowValues::Text(format!("{} 00:00:00", d.format("%F"))),
        other => other.clone(),
    })
}

fn decimal_as_text(value: &RowValues) -> Result<RowValues, SqlEngineError> {
    Ok(match value {
        RowValues::Decimal(d) => RowValues::Text(d.normalize().to_string()),
        other => other.clone(),
    })
}

fn guid_as_text(value: &RowValues) -> Result<RowValues, SqlEngineError> {
    Ok(match value {
        v if is_absent(v) => RowValues::Null,
        RowValues::Guid(g) => RowValues::Text(g.hyphenated().to_string()),
        other => other.clone(),
    })
}

fn guid_as_mixed_endian_bytes(value: &RowValues) -> Result<RowValues, SqlEngineError> {
    Ok(match value {
        v if is_absent(v) => RowValues::Null,
        RowValues::Guid(g) => RowValues::Blob(g.to_bytes_le().to_vec()),
        other => other.clone(),
    })
}

fn bool_as_int(value: &RowValues) -> Result<RowValues, SqlEngineError> {
    Ok(match value {
        RowValues::Bool(b) => RowValues::Int(i64::from(*b)),
        other => other.clone(),
    })
}

fn json_as_text(value: &RowValues) -> Result<RowValues, SqlEngineError> {
    Ok(match value {
        RowValues::JSON(j) => RowValues::Text(j.to_string()),
        other => other.clone(),
    })
}

fn interval_as_micros(value: &RowValues) -> Result<RowValues, SqlEngineError> {
    match value {
        v if is_absent(v) => Ok(RowValues::Null),
        RowValues::Interval(d) => d
            .num_microseconds()
            .map(RowValues::Int)
            .ok_or_else(|| SqlEngineError::conversion(value, ValueType::I64)),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn convert(provider: DatabaseType, vt: ValueType, value: RowValues) -> RowValues {
        let converter = try_input_converter(provider, vt).expect("converter");
        converter(&value).unwrap()
    }

    #[test]
    fn directly_bindable_types_need_no_converter() {
        assert!(try_input_converter(DatabaseType::Postgres, ValueType::I32).is_none());
        assert!(try_input_converter(DatabaseType::Postgres, ValueType::Json).is_none());
        assert!(try_input_converter(DatabaseType::Sqlite, ValueType::Text).is_none());
        assert!(try_input_converter(DatabaseType::Mssql, ValueType::Bool).is_none());
    }

    #[test]
    fn sentinels_bind_as_null() {
        assert_eq!(
            convert(DatabaseType::Postgres, ValueType::Date, RowValues::Date(NaiveDate::MIN)),
            RowValues::Null
        );
        assert_eq!(
            convert(DatabaseType::Mssql, ValueType::Guid, RowValues::Guid(Uuid::nil())),
            RowValues::Null
        );
        assert_eq!(
            convert(DatabaseType::Oracle, ValueType::Interval, RowValues::Interval(TimeDelta::MIN)),
            RowValues::Null
        );
        assert_eq!(
            convert(DatabaseType::Mysql, ValueType::LongText, RowValues::Text(String::new())),
            RowValues::Null
        );
    }

    #[test]
    fn sqlite_stores_rich_types_as_text() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(
            convert(DatabaseType::Sqlite, ValueType::Date, RowValues::Date(date)),
            RowValues::Text("2024-02-29".into())
        );
        assert_eq!(
            convert(
                DatabaseType::Sqlite,
                ValueType::Decimal,
                RowValues::Decimal(Decimal::new(12_500, 3))
            ),
            RowValues::Text("12.5".into())
        );
        assert_eq!(
            convert(DatabaseType::Sqlite, ValueType::Bool, RowValues::Bool(true)),
            RowValues::Int(1)
        );
    }

    #[test]
    fn oracle_guids_bind_mixed_endian() {
        let id = Uuid::parse_str("00112233-4455-6677-8899-aabbccddeeff").unwrap();
        let RowValues::Blob(bytes) = convert(DatabaseType::Oracle, ValueType::Guid, RowValues::Guid(id))
        else {
            panic!("expected bytes");
        };
        assert_eq!(&bytes[..4], &[0x33, 0x22, 0x11, 0x00]);
        assert_eq!(Uuid::from_bytes_le(bytes.try_into().unwrap()), id);
    }

    #[test]
    fn intervals_become_microseconds_without_native_support() {
        assert_eq!(
            convert(
                DatabaseType::Mysql,
                ValueType::Interval,
                RowValues::Interval(TimeDelta::milliseconds(1500))
            ),
            RowValues::Int(1_500_000)
        );
    }
}
