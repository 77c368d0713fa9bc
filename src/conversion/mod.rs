//! Type Conversion Registry.
//!
//! Input side: [`try_input_converter`] picks the converter that turns an
//! application value into something the provider can bind when the declared
//! type has no direct bind code. Output side: [`convert_output`] normalizes a
//! raw provider value into the canonical [`RowValues`] variant of the
//! requested [`ValueType`], and [`SqlType::from_value`] lifts that into the
//! Rust type.

mod input;
mod output;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::SqlEngineError;
use crate::types::{RowValues, ValueType};

pub use input::{InputConverter, is_absent, try_input_converter};
pub use output::{column_supports, convert_output, guid_from_bytes};

/// A Rust type that binds as a parameter and reads back from a column.
///
/// `from_value` receives the canonical variant for [`SqlType::VALUE_TYPE`]
/// (see [`convert_output`]) or `RowValues::Null`, which maps to `Default`.
pub trait SqlType: Sized + Default + Send + 'static {
    const VALUE_TYPE: ValueType;
    const NULLABLE: bool = false;

    fn to_value(&self) -> RowValues;

    /// # Errors
    /// Returns `SqlEngineError::ConversionError` when the value does not fit.
    fn from_value(value: RowValues) -> Result<Self, SqlEngineError>;
}

/// Text that may exceed a single native read.
///
/// Binds through the long-text converter (empty means absent) and is read
/// back with chunked character reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LongText(pub String);

impl From<String> for LongText {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for LongText {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::ops::Deref for LongText {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

macro_rules! integer_sql_type {
    ($($ty:ty => $vt:ident),* $(,)?) => {
        $(
            impl SqlType for $ty {
                const VALUE_TYPE: ValueType = ValueType::$vt;

                fn to_value(&self) -> RowValues {
                    RowValues::Int(i64::from(*self))
                }

                fn from_value(value: RowValues) -> Result<Self, SqlEngineError> {
                    match value {
                        RowValues::Null => Ok(Self::default()),
                        RowValues::Int(v) => <$ty>::try_from(v)
                            .map_err(|_| SqlEngineError::conversion(&RowValues::Int(v), ValueType::$vt)),
                        other => Err(SqlEngineError::conversion(&other, ValueType::$vt)),
                    }
                }
            }
        )*
    };
}

integer_sql_type!(
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
);

impl SqlType for u64 {
    const VALUE_TYPE: ValueType = ValueType::U64;

    fn to_value(&self) -> RowValues {
        match i64::try_from(*self) {
            Ok(v) => RowValues::Int(v),
            Err(_) => RowValues::Decimal(Decimal::from(*self)),
        }
    }

    fn from_value(value: RowValues) -> Result<Self, SqlEngineError> {
        match &value {
            RowValues::Null => Ok(0),
            RowValues::Int(v) => {
                u64::try_from(*v).map_err(|_| SqlEngineError::conversion(&value, ValueType::U64))
            }
            RowValues::Decimal(d) if d.fract().is_zero() => d
                .to_u64()
                .ok_or_else(|| SqlEngineError::conversion(&value, ValueType::U64)),
            _ => Err(SqlEngineError::conversion(&value, ValueType::U64)),
        }
    }
}

impl SqlType for f64 {
    const VALUE_TYPE: ValueType = ValueType::F64;

    fn to_value(&self) -> RowValues {
        RowValues::Float(*self)
    }

    fn from_value(value: RowValues) -> Result<Self, SqlEngineError> {
        match value {
            RowValues::Null => Ok(0.0),
            RowValues::Float(v) => Ok(v),
            other => Err(SqlEngineError::conversion(&other, ValueType::F64)),
        }
    }
}

impl SqlType for f32 {
    const VALUE_TYPE: ValueType = ValueType::F32;

    fn to_value(&self) -> RowValues {
        RowValues::Float(f64::from(*self))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_value(value: RowValues) -> Result<Self, SqlEngineError> {
        match value {
            RowValues::Null => Ok(0.0),
            RowValues::Float(v) => Ok(v as f32),
            other => Err(SqlEngineError::conversion(&other, ValueType::F32)),
        }
    }
}

/// Implements `SqlType` for types whose canonical value is one variant.
macro_rules! variant_sql_type {
    ($ty:ty, $vt:ident, $variant:ident, |$v:ident| $to:expr) => {
        impl SqlType for $ty {
            const VALUE_TYPE: ValueType = ValueType::$vt;

            fn to_value(&self) -> RowValues {
                let $v = self;
                RowValues::$variant($to)
            }

            fn from_value(value: RowValues) -> Result<Self, SqlEngineError> {
                match value {
                    RowValues::Null => Ok(Self::default()),
                    RowValues::$variant(v) => Ok(v.into()),
                    other => Err(SqlEngineError::conversion(&other, ValueType::$vt)),
                }
            }
        }
    };
}

variant_sql_type!(bool, Bool, Bool, |v| *v);
variant_sql_type!(String, Text, Text, |v| v.clone());
variant_sql_type!(LongText, LongText, Text, |v| v.0.clone());
variant_sql_type!(Decimal, Decimal, Decimal, |v| *v);
variant_sql_type!(NaiveDate, Date, Date, |v| *v);
variant_sql_type!(NaiveTime, Time, Time, |v| *v);
variant_sql_type!(NaiveDateTime, DateTime, Timestamp, |v| *v);
variant_sql_type!(TimeDelta, Interval, Interval, |v| *v);
variant_sql_type!(Uuid, Guid, Guid, |v| *v);
variant_sql_type!(Vec<u8>, Bytes, Blob, |v| v.clone());

impl SqlType for JsonValue {
    const VALUE_TYPE: ValueType = ValueType::Json;

    fn to_value(&self) -> RowValues {
        RowValues::JSON(self.clone())
    }

    fn from_value(value: RowValues) -> Result<Self, SqlEngineError> {
        match value {
            RowValues::Null => Ok(JsonValue::Null),
            RowValues::JSON(v) => Ok(v),
            other => Err(SqlEngineError::conversion(&other, ValueType::Json)),
        }
    }
}

impl<T: SqlType> SqlType for Option<T> {
    const VALUE_TYPE: ValueType = T::VALUE_TYPE;
    const NULLABLE: bool = true;

    fn to_value(&self) -> RowValues {
        match self {
            Some(v) => v.to_value(),
            None => RowValues::Null,
        }
    }

    fn from_value(value: RowValues) -> Result<Self, SqlEngineError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}
