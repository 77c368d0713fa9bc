//! Compiled Row Parser Cache.
//!
//! A target type describes itself once through [`FromRecord`]. For each
//! result shape it meets, [`compile`] matches the reported columns against the
//! target's members and produces a [`CompiledParser`]: a fixed list of column
//! plans (null check, native accessor, chunked large-object read, conversion)
//! that turns one row into one `T`. [`ParserCache`] memoizes parsers per
//! fingerprint, result position and schema.

mod cache;
mod compile;
mod schema;

use std::collections::{HashMap, HashSet};

use crate::conversion::SqlType;
use crate::error::SqlEngineError;
use crate::types::{RowValues, ValueType};

pub use cache::ParserCache;
pub use compile::{CompiledParser, compile, compile_with};
pub use schema::{ResultColumnSchema, SchemaColumn, SchemaKey, schema_signature};

/// Assigns one already-converted column value to a field of `T`.
pub type FieldSetter<T> = fn(&mut T, RowValues) -> Result<(), SqlEngineError>;

/// One mappable member of a target type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberSpec {
    pub name: &'static str,
    /// Column name to match instead of `name`.
    pub alias: Option<&'static str>,
    pub value_type: ValueType,
    pub nullable: bool,
    /// Read through the chunked text accessor even when the driver does not
    /// flag the column as large.
    pub long_text: bool,
}

impl MemberSpec {
    #[must_use]
    pub fn of<V: SqlType>(name: &'static str) -> Self {
        Self {
            name,
            alias: None,
            value_type: V::VALUE_TYPE,
            nullable: V::NULLABLE,
            long_text: V::VALUE_TYPE == ValueType::LongText,
        }
    }

    #[must_use]
    pub fn alias(mut self, alias: &'static str) -> Self {
        self.alias = Some(alias);
        self
    }

    #[must_use]
    pub fn long_text(mut self) -> Self {
        self.long_text = true;
        self
    }

    /// Column name this member binds to.
    #[must_use]
    pub fn column_name(&self) -> &'static str {
        self.alias.unwrap_or(self.name)
    }

    fn matches(&self, column: &str) -> bool {
        self.column_name().eq_ignore_ascii_case(column)
    }
}

/// Per-type column configuration registered outside the type definition.
///
/// Overrides the column a member maps to and flags members as long text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeConfig {
    columns: HashMap<&'static str, &'static str>,
    long_text: HashSet<&'static str>,
}

impl TypeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `member` to the column named `column`.
    #[must_use]
    pub fn column(mut self, member: &'static str, column: &'static str) -> Self {
        self.columns.insert(member, column);
        self
    }

    #[must_use]
    pub fn long_text(mut self, member: &'static str) -> Self {
        self.long_text.insert(member);
        self
    }

    pub(crate) fn apply(&self, members: &mut [MemberSpec]) {
        for member in members.iter_mut() {
            if let Some(column) = self.columns.get(member.name) {
                member.alias = Some(*column);
            }
            if self.long_text.contains(member.name) {
                member.long_text = true;
            }
        }
    }
}

/// How rows materialize into a target type.
pub enum RecordTarget<T> {
    /// Mutable shape: start from `new()` and assign matched members.
    Fields {
        new: Option<fn() -> T>,
        members: Vec<(MemberSpec, FieldSetter<T>)>,
    },
    /// Immutable shape: stage values in declared member order, then call
    /// `build` once.
    Constructor {
        members: Vec<MemberSpec>,
        build: fn(&mut ValueStage) -> Result<T, SqlEngineError>,
    },
    /// Single value read from the first column.
    Scalar {
        value_type: ValueType,
        nullable: bool,
        build: fn(RowValues) -> Result<T, SqlEngineError>,
    },
}

impl<T> RecordTarget<T> {
    pub(crate) fn members(&self) -> Vec<MemberSpec> {
        match self {
            RecordTarget::Fields { members, .. } => members.iter().map(|(m, _)| *m).collect(),
            RecordTarget::Constructor { members, .. } => members.clone(),
            RecordTarget::Scalar {
                value_type,
                nullable,
                ..
            } => vec![MemberSpec {
                name: "",
                alias: None,
                value_type: *value_type,
                nullable: *nullable,
                long_text: *value_type == ValueType::LongText,
            }],
        }
    }
}

/// A type result rows can be materialized into.
///
/// Every [`SqlType`] is a single-column target. Records implement this by
/// hand or through [`record!`](crate::record).
pub trait FromRecord: Sized + Send + 'static {
    fn target() -> RecordTarget<Self>;
}

impl<T: SqlType> FromRecord for T {
    fn target() -> RecordTarget<Self> {
        RecordTarget::Scalar {
            value_type: T::VALUE_TYPE,
            nullable: T::NULLABLE,
            build: T::from_value,
        }
    }
}

/// Values staged for a constructor-shaped target, in declared member order.
#[derive(Debug)]
pub struct ValueStage {
    values: Vec<RowValues>,
    position: usize,
    type_name: &'static str,
}

impl ValueStage {
    pub(crate) fn new(len: usize, type_name: &'static str) -> Self {
        Self {
            values: vec![RowValues::Null; len],
            position: 0,
            type_name,
        }
    }

    pub(crate) fn set(&mut self, slot: usize, value: RowValues) {
        if let Some(staged) = self.values.get_mut(slot) {
            *staged = value;
        }
    }

    /// Take the next staged value as `V`. Unmatched members yield
    /// `V::default()`.
    ///
    /// # Errors
    /// Returns `SqlEngineError::MissingConstructor` when the constructor asks
    /// for more values than members were declared, or the conversion error of
    /// `V::from_value`.
    #[allow(clippy::should_implement_trait)]
    pub fn next<V: SqlType>(&mut self) -> Result<V, SqlEngineError> {
        let value = self
            .values
            .get_mut(self.position)
            .map(|staged| std::mem::replace(staged, RowValues::Null))
            .ok_or(SqlEngineError::MissingConstructor(self.type_name))?;
        self.position += 1;
        V::from_value(value)
    }
}
