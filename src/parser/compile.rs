use std::fmt;

use tracing::debug;

use super::schema::ResultColumnSchema;
use super::{FieldSetter, FromRecord, RecordTarget, TypeConfig, ValueStage};
use crate::conversion::{column_supports, convert_output, guid_from_bytes};
use crate::driver::{ColumnType, NativeAccessor, NativeColumn, RowCursor};
use crate::error::SqlEngineError;
use crate::provider::GuidByteOrder;
use crate::types::{DatabaseType, RowValues, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStrategy {
    Direct,
    ChunkedBytes,
    ChunkedText,
    GuidFromBytes,
}

#[derive(Debug, Clone)]
struct ColumnPlan {
    ordinal: usize,
    name: String,
    accessor: NativeAccessor,
    /// Null reads keep the member default instead of failing.
    nullable: bool,
    strategy: ReadStrategy,
    /// Target of the conversion step, when the column and member disagree.
    convert_to: Option<ValueType>,
    slot: usize,
}

enum Assembly<T> {
    Fields {
        new: fn() -> T,
        setters: Vec<FieldSetter<T>>,
    },
    Constructor {
        slots: usize,
        build: fn(&mut ValueStage) -> Result<T, SqlEngineError>,
    },
    Scalar {
        build: fn(RowValues) -> Result<T, SqlEngineError>,
    },
}

/// Immutable row materializer for one (fingerprint, result position, schema,
/// target type).
pub struct CompiledParser<T> {
    provider: DatabaseType,
    plans: Vec<ColumnPlan>,
    assembly: Assembly<T>,
    strict: bool,
    chunk_size: usize,
    guid_order: GuidByteOrder,
    type_name: &'static str,
    signature: u64,
}

impl<T> fmt::Debug for CompiledParser<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledParser")
            .field("target", &self.type_name)
            .field("provider", &self.provider)
            .field("plans", &self.plans)
            .field("strict", &self.strict)
            .finish_non_exhaustive()
    }
}

fn strategy_for(column: ColumnType, target: ValueType, large: bool) -> ReadStrategy {
    match (column, target) {
        (ColumnType::Binary, ValueType::Guid) => ReadStrategy::GuidFromBytes,
        (ColumnType::Binary | ColumnType::LongBinary, _) if large => ReadStrategy::ChunkedBytes,
        (ColumnType::Text | ColumnType::LongText | ColumnType::Dynamic, _) if large => {
            ReadStrategy::ChunkedText
        }
        _ => ReadStrategy::Direct,
    }
}

/// Compile the parser of `T` for a result reporting `columns`.
///
/// # Errors
/// Returns `SqlEngineError::UnsupportedColumnType` for a column that can
/// never feed its member, and `SqlEngineError::MissingConstructor` when a
/// field-shaped target has no default constructor.
pub fn compile<T: FromRecord>(
    provider: DatabaseType,
    columns: &[NativeColumn],
    strict: bool,
    chunk_size: usize,
) -> Result<CompiledParser<T>, SqlEngineError> {
    compile_with(provider, columns, strict, chunk_size, None)
}

/// [`compile`] with per-type column configuration applied.
///
/// # Errors
/// Same as [`compile`].
pub fn compile_with<T: FromRecord>(
    provider: DatabaseType,
    columns: &[NativeColumn],
    strict: bool,
    chunk_size: usize,
    config: Option<&TypeConfig>,
) -> Result<CompiledParser<T>, SqlEngineError> {
    let type_name = std::any::type_name::<T>();
    let target = T::target();
    let mut members = target.members();
    if let Some(config) = config {
        config.apply(&mut members);
    }
    let positional = matches!(target, RecordTarget::Scalar { .. });
    let schema = ResultColumnSchema::derive(columns, &members, positional);

    let mut plans = Vec::new();
    for (ordinal, column) in schema.matched() {
        let Some(slot) = column.member else {
            continue;
        };
        let member = members[slot];
        if !column_supports(column.source_type, member.value_type) {
            return Err(SqlEngineError::UnsupportedColumnType {
                column: column.name.clone(),
                column_type: column.source_type,
                target: member.value_type,
            });
        }
        let strategy = strategy_for(column.source_type, member.value_type, column.is_large_object);
        let accessor = match strategy {
            ReadStrategy::GuidFromBytes | ReadStrategy::ChunkedBytes => NativeAccessor::Bytes,
            ReadStrategy::ChunkedText => NativeAccessor::String,
            ReadStrategy::Direct => column.source_type.accessor(),
        };
        plans.push(ColumnPlan {
            ordinal,
            name: column.name.clone(),
            accessor,
            nullable: column.allow_null || !strict,
            strategy,
            convert_to: (column.requires_conversion && strategy != ReadStrategy::GuidFromBytes)
                .then_some(member.value_type),
            slot,
        });
    }

    let assembly = match target {
        RecordTarget::Fields { new, members } => {
            let new = new.ok_or(SqlEngineError::MissingConstructor(type_name))?;
            Assembly::Fields {
                new,
                setters: members.into_iter().map(|(_, set)| set).collect(),
            }
        }
        RecordTarget::Constructor { members, build } => Assembly::Constructor {
            slots: members.len(),
            build,
        },
        RecordTarget::Scalar { build, .. } => Assembly::Scalar { build },
    };

    debug!(
        record = type_name,
        provider = %provider,
        columns = columns.len(),
        mapped = plans.len(),
        "compiled row parser"
    );

    Ok(CompiledParser {
        provider,
        plans,
        assembly,
        strict,
        chunk_size: chunk_size.max(1),
        guid_order: GuidByteOrder::for_provider(provider),
        type_name,
        signature: schema.signature(),
    })
}

impl<T> CompiledParser<T> {
    /// Signature of the schema this parser was compiled against.
    #[must_use]
    pub fn signature(&self) -> u64 {
        self.signature
    }

    /// Number of columns that bind to a member.
    #[must_use]
    pub fn mapped_columns(&self) -> usize {
        self.plans.len()
    }

    /// Materialize the row under `row`.
    ///
    /// # Errors
    /// Returns `SqlEngineError::NullValue` for a NULL in a non-nullable column
    /// under strict mapping, conversion errors in strict mode, or driver read
    /// errors.
    pub fn parse(&self, row: &dyn RowCursor) -> Result<T, SqlEngineError> {
        match &self.assembly {
            Assembly::Fields { new, setters } => {
                let mut value = new();
                for plan in &self.plans {
                    if let Some(read) = self.read_column(plan, row)?
                        && let Some(set) = setters.get(plan.slot)
                    {
                        set(&mut value, read)?;
                    }
                }
                Ok(value)
            }
            Assembly::Constructor { slots, build } => {
                let mut stage = ValueStage::new(*slots, self.type_name);
                for plan in &self.plans {
                    if let Some(read) = self.read_column(plan, row)? {
                        stage.set(plan.slot, read);
                    }
                }
                build(&mut stage)
            }
            Assembly::Scalar { build } => {
                let read = match self.plans.first() {
                    Some(plan) => self.read_column(plan, row)?.unwrap_or(RowValues::Null),
                    None => RowValues::Null,
                };
                build(read)
            }
        }
    }

    /// `None` means "keep the member default".
    fn read_column(
        &self,
        plan: &ColumnPlan,
        row: &dyn RowCursor,
    ) -> Result<Option<RowValues>, SqlEngineError> {
        if row.is_null(plan.ordinal) {
            return if plan.nullable {
                Ok(None)
            } else {
                Err(SqlEngineError::NullValue(plan.name.clone()))
            };
        }
        let raw = match plan.strategy {
            ReadStrategy::Direct => row.read(plan.ordinal, plan.accessor)?,
            ReadStrategy::ChunkedText => self.read_text_chunks(plan.ordinal, row)?,
            ReadStrategy::ChunkedBytes => self.read_byte_chunks(plan.ordinal, row)?,
            ReadStrategy::GuidFromBytes => {
                let raw = row.read(plan.ordinal, plan.accessor)?;
                match raw.as_blob().and_then(|b| guid_from_bytes(b, self.guid_order)) {
                    Some(guid) => RowValues::Guid(guid),
                    None if self.strict => {
                        return Err(SqlEngineError::conversion(&raw, ValueType::Guid));
                    }
                    None => return Ok(None),
                }
            }
        };
        let value = match plan.convert_to {
            Some(target) => convert_output(self.provider, raw, target, self.strict)?,
            None => raw,
        };
        Ok((!value.is_null()).then_some(value))
    }

    fn read_text_chunks(&self, ordinal: usize, row: &dyn RowCursor) -> Result<RowValues, SqlEngineError> {
        let mut text = String::new();
        let mut offset = 0;
        loop {
            let read = row.read_chars(ordinal, offset, &mut text, self.chunk_size)?;
            offset += read;
            if read < self.chunk_size {
                break;
            }
        }
        Ok(RowValues::Text(text))
    }

    fn read_byte_chunks(&self, ordinal: usize, row: &dyn RowCursor) -> Result<RowValues, SqlEngineError> {
        let mut bytes = Vec::new();
        let mut chunk = vec![0_u8; self.chunk_size];
        loop {
            let read = row.read_bytes(ordinal, bytes.len(), &mut chunk)?;
            bytes.extend_from_slice(&chunk[..read]);
            if read < self.chunk_size {
                break;
            }
        }
        Ok(RowValues::Blob(bytes))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::*;
    use crate::conversion::LongText;
    use crate::driver::BufferedRow;
    use crate::parser::MemberSpec;

    crate::record! {
        #[derive(Debug, Default, PartialEq)]
        struct Account {
            id: i32,
            name: String,
            balance: Decimal,
            opened: NaiveDateTime,
            active: bool,
            token: Uuid,
            notes: LongText,
            avatar: Vec<u8>,
            closed: Option<NaiveDate>,
        }
    }

    fn account_columns() -> Vec<NativeColumn> {
        vec![
            NativeColumn::new("id", ColumnType::Int64).not_null(),
            NativeColumn::new("name", ColumnType::Text),
            NativeColumn::new("balance", ColumnType::Decimal),
            NativeColumn::new("opened", ColumnType::DateTime),
            NativeColumn::new("active", ColumnType::Int64),
            NativeColumn::new("token", ColumnType::Binary),
            NativeColumn::new("notes", ColumnType::LongText),
            NativeColumn::new("avatar", ColumnType::LongBinary),
            NativeColumn::new("closed", ColumnType::Date),
        ]
    }

    fn opened() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 2, 29)
            .and_then(|d| d.and_hms_opt(13, 45, 0))
            .unwrap()
    }

    #[test]
    fn round_trips_every_source_family() {
        let token = Uuid::new_v4();
        let notes = "n".repeat(50);
        let avatar: Vec<u8> = (0..=40).collect();
        let row = BufferedRow::new(vec![
            RowValues::Int(7),
            RowValues::Text("x".into()),
            RowValues::Decimal(Decimal::new(12_345, 2)),
            RowValues::Timestamp(opened()),
            RowValues::Int(1),
            RowValues::Blob(token.as_bytes().to_vec()),
            RowValues::Text(notes.clone()),
            RowValues::Blob(avatar.clone()),
            RowValues::Null,
        ]);
        let parser =
            compile::<Account>(DatabaseType::Sqlite, &account_columns(), true, 16).unwrap();
        assert_eq!(parser.mapped_columns(), 9);
        let account = parser.parse(&row).unwrap();
        assert_eq!(
            account,
            Account {
                id: 7,
                name: "x".into(),
                balance: Decimal::new(12_345, 2),
                opened: opened(),
                active: true,
                token,
                notes: LongText(notes),
                avatar,
                closed: None,
            }
        );
    }

    #[test]
    fn oracle_guid_bytes_use_mixed_endian_order() {
        let token = Uuid::new_v4();
        let row = BufferedRow::new(vec![RowValues::Blob(token.to_bytes_le().to_vec())]);
        let parser = compile::<Uuid>(
            DatabaseType::Oracle,
            &[NativeColumn::new("token", ColumnType::Binary)],
            true,
            8192,
        )
        .unwrap();
        assert_eq!(parser.parse(&row).unwrap(), token);
    }

    #[test]
    fn nulls_keep_defaults_unless_strict_and_not_nullable() {
        let columns = vec![NativeColumn::new("id", ColumnType::Int64).not_null()];
        let row = BufferedRow::new(vec![RowValues::Null]);

        let lenient = compile::<i64>(DatabaseType::Postgres, &columns, false, 64).unwrap();
        assert_eq!(lenient.parse(&row).unwrap(), 0);

        let strict = compile::<i64>(DatabaseType::Postgres, &columns, true, 64).unwrap();
        assert!(matches!(
            strict.parse(&row),
            Err(SqlEngineError::NullValue(column)) if column == "id"
        ));

        let nullable = vec![NativeColumn::new("id", ColumnType::Int64)];
        let strict = compile::<i64>(DatabaseType::Postgres, &nullable, true, 64).unwrap();
        assert_eq!(strict.parse(&row).unwrap(), 0);
    }

    #[test]
    fn unsupported_pairs_name_the_column() {
        let columns = vec![NativeColumn::new("payload", ColumnType::Binary)];
        let err = compile::<NaiveDate>(DatabaseType::Mysql, &columns, false, 64).unwrap_err();
        assert!(matches!(
            err,
            SqlEngineError::UnsupportedColumnType {
                ref column,
                column_type: ColumnType::Binary,
                target: ValueType::Date,
            } if column == "payload"
        ));
    }

    struct NoDefault;

    impl FromRecord for NoDefault {
        fn target() -> RecordTarget<Self> {
            RecordTarget::Fields {
                new: None,
                members: Vec::new(),
            }
        }
    }

    #[test]
    fn field_targets_need_a_constructor() {
        assert!(matches!(
            compile::<NoDefault>(DatabaseType::Sqlite, &[], false, 64),
            Err(SqlEngineError::MissingConstructor(_))
        ));
    }

    #[derive(Debug, PartialEq)]
    struct Point {
        x: i64,
        label: Option<String>,
    }

    impl FromRecord for Point {
        fn target() -> RecordTarget<Self> {
            RecordTarget::Constructor {
                members: vec![
                    MemberSpec::of::<i64>("x"),
                    MemberSpec::of::<Option<String>>("label"),
                ],
                build: |stage| {
                    Ok(Point {
                        x: stage.next()?,
                        label: stage.next()?,
                    })
                },
            }
        }
    }

    #[test]
    fn constructor_targets_stage_in_declared_order() {
        let columns = vec![
            NativeColumn::new("LABEL", ColumnType::Text),
            NativeColumn::new("x", ColumnType::Text),
        ];
        let parser = compile::<Point>(DatabaseType::Mysql, &columns, false, 64).unwrap();
        let row = BufferedRow::new(vec![RowValues::Text("a".into()), RowValues::Text("12".into())]);
        assert_eq!(
            parser.parse(&row).unwrap(),
            Point {
                x: 12,
                label: Some("a".into())
            }
        );

        let missing = compile::<Point>(DatabaseType::Mysql, &columns[..1], false, 64).unwrap();
        let row = BufferedRow::new(vec![RowValues::Null]);
        assert_eq!(missing.parse(&row).unwrap(), Point { x: 0, label: None });
    }

    #[test]
    fn strict_conversion_failures_surface() {
        let columns = vec![NativeColumn::new("n", ColumnType::Text)];
        let row = BufferedRow::new(vec![RowValues::Text("seven".into())]);
        let lenient = compile::<i32>(DatabaseType::Sqlite, &columns, false, 64).unwrap();
        assert_eq!(lenient.parse(&row).unwrap(), 0);
        let strict = compile::<i32>(DatabaseType::Sqlite, &columns, true, 64).unwrap();
        assert!(matches!(
            strict.parse(&row),
            Err(SqlEngineError::ConversionError { .. })
        ));
    }
}
