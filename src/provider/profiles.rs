use super::{
    Capabilities, CursorStyle, GuidByteOrder, MarkerStyle, PagingStyle, ProviderProfile,
    ProviderTypeCode,
};
use crate::command::ParameterSpec;
use crate::driver::ParameterDirection;
use crate::types::{DatabaseType, ValueType};

fn input_markers(profile: &dyn ProviderProfile, specs: &[ParameterSpec]) -> Vec<String> {
    specs
        .iter()
        .filter(|s| s.direction != ParameterDirection::ReturnValue && !s.is_paging_marker)
        .map(|s| profile.marker(s.bind_name()))
        .collect()
}

/// SQL Server over tiberius (`SqlDbType` codes).
#[derive(Debug)]
pub struct MssqlProfile {
    caps: Capabilities,
}

impl MssqlProfile {
    #[must_use]
    pub fn new() -> Self {
        Self {
            caps: Capabilities {
                supports_prepare: true,
                marker_prefixes: &['@'],
                native_marker: MarkerStyle::AtPNumbered,
                cursor_style: CursorStyle::MultipleResultSets,
                paging_style: PagingStyle::OffsetFetch,
                params_in_anonymous_block: true,
                supports_output_params: true,
                supports_stored_procedures: true,
                guid_byte_order: GuidByteOrder::BigEndian,
            },
        }
    }
}

impl Default for MssqlProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderProfile for MssqlProfile {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mssql
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn type_code(&self, value_type: ValueType) -> Option<ProviderTypeCode> {
        Some(match value_type {
            ValueType::Bool => 2,
            ValueType::I8 | ValueType::I16 => 16,
            ValueType::I32 | ValueType::U16 => 8,
            ValueType::I64 | ValueType::U32 | ValueType::Interval => 0,
            ValueType::U8 => 20,
            ValueType::U64 | ValueType::Decimal => 5,
            ValueType::F32 => 13,
            ValueType::F64 => 6,
            ValueType::Text | ValueType::LongText | ValueType::Json => 12,
            ValueType::Date => 31,
            ValueType::Time => 32,
            ValueType::DateTime => 33,
            ValueType::Guid => 14,
            ValueType::Bytes => 21,
            ValueType::RefCursor => return None,
        })
    }

    fn type_name(
        &self,
        value_type: ValueType,
        size: Option<u32>,
        precision: Option<u8>,
        scale: Option<u8>,
    ) -> String {
        let sized = |base: &str| match size {
            Some(n) if n > 0 && n <= 4000 => format!("{base}({n})"),
            _ => format!("{base}(max)"),
        };
        match value_type {
            ValueType::Bool => "bit".into(),
            ValueType::I8 | ValueType::I16 => "smallint".into(),
            ValueType::I32 | ValueType::U16 => "int".into(),
            ValueType::I64 | ValueType::U32 | ValueType::Interval => "bigint".into(),
            ValueType::U8 => "tinyint".into(),
            ValueType::U64 => "decimal(20,0)".into(),
            ValueType::Decimal => format!(
                "decimal({},{})",
                precision.unwrap_or(18),
                scale.unwrap_or(2)
            ),
            ValueType::F32 => "real".into(),
            ValueType::F64 => "float".into(),
            ValueType::Text => sized("nvarchar"),
            ValueType::LongText | ValueType::Json => "nvarchar(max)".into(),
            ValueType::Date => "date".into(),
            ValueType::Time => "time".into(),
            ValueType::DateTime => "datetime2".into(),
            ValueType::Guid => "uniqueidentifier".into(),
            ValueType::Bytes => sized("varbinary"),
            ValueType::RefCursor => "cursor".into(),
        }
    }

    fn procedure_call(&self, name: &str, specs: &[ParameterSpec]) -> String {
        let mut call = String::from("EXEC ");
        if let Some(ret) = specs
            .iter()
            .find(|s| s.direction == ParameterDirection::ReturnValue)
        {
            call.push_str(&self.marker(ret.bind_name()));
            call.push_str(" = ");
        }
        call.push_str(name);
        let args: Vec<String> = specs
            .iter()
            .filter(|s| s.direction != ParameterDirection::ReturnValue && !s.is_paging_marker)
            .map(|s| {
                let marker = self.marker(s.bind_name());
                if s.direction.is_output() {
                    format!("{marker} = {marker} OUTPUT")
                } else {
                    format!("{marker} = {marker}")
                }
            })
            .collect();
        if !args.is_empty() {
            call.push(' ');
            call.push_str(&args.join(", "));
        }
        call
    }

    fn cancellation_markers(&self) -> &'static [&'static str] {
        &["Operation cancelled by user", "A severe error occurred on the current command"]
    }
}

/// MySQL / MariaDB over mysql_async (`MYSQL_TYPE_*` ids).
#[derive(Debug)]
pub struct MysqlProfile {
    caps: Capabilities,
}

impl MysqlProfile {
    #[must_use]
    pub fn new() -> Self {
        Self {
            caps: Capabilities {
                supports_prepare: true,
                marker_prefixes: &['@', ':'],
                native_marker: MarkerStyle::Anonymous,
                cursor_style: CursorStyle::MultipleResultSets,
                paging_style: PagingStyle::LimitOffset,
                params_in_anonymous_block: false,
                supports_output_params: false,
                supports_stored_procedures: true,
                guid_byte_order: GuidByteOrder::BigEndian,
            },
        }
    }
}

impl Default for MysqlProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderProfile for MysqlProfile {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mysql
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn type_code(&self, value_type: ValueType) -> Option<ProviderTypeCode> {
        Some(match value_type {
            ValueType::Bool | ValueType::I8 => 1,
            ValueType::I16 | ValueType::U8 => 2,
            ValueType::I32 | ValueType::U16 => 3,
            ValueType::I64 | ValueType::U32 | ValueType::Interval => 8,
            ValueType::U64 | ValueType::Decimal => 246,
            ValueType::F32 => 4,
            ValueType::F64 => 5,
            ValueType::Text | ValueType::Guid => 253,
            ValueType::LongText | ValueType::Bytes => 252,
            ValueType::Date => 10,
            ValueType::Time => 11,
            ValueType::DateTime => 12,
            ValueType::Json => 245,
            ValueType::RefCursor => return None,
        })
    }

    fn type_name(
        &self,
        value_type: ValueType,
        size: Option<u32>,
        precision: Option<u8>,
        scale: Option<u8>,
    ) -> String {
        match value_type {
            ValueType::Bool => "tinyint(1)".into(),
            ValueType::I8 => "tinyint".into(),
            ValueType::I16 | ValueType::U8 => "smallint".into(),
            ValueType::I32 | ValueType::U16 => "int".into(),
            ValueType::I64 | ValueType::U32 | ValueType::Interval => "bigint".into(),
            ValueType::U64 => "bigint unsigned".into(),
            ValueType::Decimal => format!(
                "decimal({},{})",
                precision.unwrap_or(18),
                scale.unwrap_or(2)
            ),
            ValueType::F32 => "float".into(),
            ValueType::F64 => "double".into(),
            ValueType::Text => format!("varchar({})", size.unwrap_or(255)),
            ValueType::LongText => "longtext".into(),
            ValueType::Date => "date".into(),
            ValueType::Time => "time(6)".into(),
            ValueType::DateTime => "datetime(6)".into(),
            ValueType::Guid => "char(36)".into(),
            ValueType::Bytes => "longblob".into(),
            ValueType::Json => "json".into(),
            ValueType::RefCursor => "cursor".into(),
        }
    }

    fn procedure_call(&self, name: &str, specs: &[ParameterSpec]) -> String {
        format!("CALL {name}({})", input_markers(self, specs).join(", "))
    }

    fn cancellation_markers(&self) -> &'static [&'static str] {
        &["Query execution was interrupted"]
    }
}

/// PostgreSQL over tokio-postgres (type OIDs).
#[derive(Debug)]
pub struct PostgresProfile {
    caps: Capabilities,
}

impl PostgresProfile {
    #[must_use]
    pub fn new() -> Self {
        Self {
            caps: Capabilities {
                supports_prepare: true,
                marker_prefixes: &['@', ':'],
                native_marker: MarkerStyle::DollarNumbered,
                cursor_style: CursorStyle::RefCursorFetch,
                paging_style: PagingStyle::LimitOffset,
                params_in_anonymous_block: false,
                supports_output_params: false,
                supports_stored_procedures: true,
                guid_byte_order: GuidByteOrder::BigEndian,
            },
        }
    }
}

impl Default for PostgresProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderProfile for PostgresProfile {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn type_code(&self, value_type: ValueType) -> Option<ProviderTypeCode> {
        Some(match value_type {
            ValueType::Bool => 16,
            ValueType::Bytes => 17,
            ValueType::I64 | ValueType::U32 => 20,
            ValueType::I8 | ValueType::I16 | ValueType::U8 => 21,
            ValueType::I32 | ValueType::U16 => 23,
            ValueType::Text | ValueType::LongText => 25,
            ValueType::F32 => 700,
            ValueType::F64 => 701,
            ValueType::Date => 1082,
            ValueType::Time => 1083,
            ValueType::DateTime => 1114,
            ValueType::Interval => 1186,
            ValueType::U64 | ValueType::Decimal => 1700,
            ValueType::RefCursor => 1790,
            ValueType::Guid => 2950,
            ValueType::Json => 3802,
        })
    }

    fn type_name(
        &self,
        value_type: ValueType,
        size: Option<u32>,
        precision: Option<u8>,
        scale: Option<u8>,
    ) -> String {
        match value_type {
            ValueType::Bool => "boolean".into(),
            ValueType::Bytes => "bytea".into(),
            ValueType::I64 | ValueType::U32 => "bigint".into(),
            ValueType::I8 | ValueType::I16 | ValueType::U8 => "smallint".into(),
            ValueType::I32 | ValueType::U16 => "integer".into(),
            ValueType::Text => match size {
                Some(n) => format!("varchar({n})"),
                None => "text".into(),
            },
            ValueType::LongText => "text".into(),
            ValueType::F32 => "real".into(),
            ValueType::F64 => "double precision".into(),
            ValueType::Date => "date".into(),
            ValueType::Time => "time".into(),
            ValueType::DateTime => "timestamp".into(),
            ValueType::Interval => "interval".into(),
            ValueType::U64 => "numeric(20,0)".into(),
            ValueType::Decimal => format!(
                "numeric({},{})",
                precision.unwrap_or(18),
                scale.unwrap_or(2)
            ),
            ValueType::RefCursor => "refcursor".into(),
            ValueType::Guid => "uuid".into(),
            ValueType::Json => "jsonb".into(),
        }
    }

    fn procedure_call(&self, name: &str, specs: &[ParameterSpec]) -> String {
        format!("SELECT * FROM {name}({})", input_markers(self, specs).join(", "))
    }

    fn cancellation_markers(&self) -> &'static [&'static str] {
        &["canceling statement due to user request"]
    }
}

/// Oracle (`OracleDbType` codes). Profile only: no native driver ships in-tree.
#[derive(Debug)]
pub struct OracleProfile {
    caps: Capabilities,
}

impl OracleProfile {
    #[must_use]
    pub fn new() -> Self {
        Self {
            caps: Capabilities {
                supports_prepare: true,
                marker_prefixes: &[':'],
                native_marker: MarkerStyle::ColonNamed,
                cursor_style: CursorStyle::OutputRefCursor,
                paging_style: PagingStyle::OffsetFetch,
                params_in_anonymous_block: true,
                supports_output_params: true,
                supports_stored_procedures: true,
                guid_byte_order: GuidByteOrder::MixedEndian,
            },
        }
    }
}

impl Default for OracleProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderProfile for OracleProfile {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Oracle
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn type_code(&self, value_type: ValueType) -> Option<ProviderTypeCode> {
        Some(match value_type {
            ValueType::Bool | ValueType::I8 | ValueType::I16 | ValueType::U8 => 111,
            ValueType::I32 | ValueType::U16 => 112,
            ValueType::I64 | ValueType::U32 => 113,
            ValueType::U64 | ValueType::Decimal => 107,
            ValueType::F32 => 122,
            ValueType::F64 => 108,
            ValueType::Text => 126,
            ValueType::LongText | ValueType::Json => 105,
            ValueType::Date => 106,
            ValueType::DateTime => 123,
            ValueType::Interval => 114,
            ValueType::Guid => 120,
            ValueType::Bytes => 102,
            ValueType::RefCursor => 121,
            ValueType::Time => return None,
        })
    }

    fn type_name(
        &self,
        value_type: ValueType,
        size: Option<u32>,
        precision: Option<u8>,
        scale: Option<u8>,
    ) -> String {
        match value_type {
            ValueType::Bool | ValueType::I8 | ValueType::U8 => "NUMBER(3)".into(),
            ValueType::I16 | ValueType::U16 => "NUMBER(5)".into(),
            ValueType::I32 | ValueType::U32 => "NUMBER(10)".into(),
            ValueType::I64 => "NUMBER(19)".into(),
            ValueType::U64 => "NUMBER(20)".into(),
            ValueType::Decimal => format!(
                "NUMBER({},{})",
                precision.unwrap_or(18),
                scale.unwrap_or(2)
            ),
            ValueType::F32 => "BINARY_FLOAT".into(),
            ValueType::F64 => "BINARY_DOUBLE".into(),
            ValueType::Text => format!("VARCHAR2({})", size.unwrap_or(4000)),
            ValueType::LongText | ValueType::Json => "CLOB".into(),
            ValueType::Date => "DATE".into(),
            ValueType::Time | ValueType::DateTime => "TIMESTAMP".into(),
            ValueType::Interval => "INTERVAL DAY TO SECOND".into(),
            ValueType::Guid => "RAW(16)".into(),
            ValueType::Bytes => "BLOB".into(),
            ValueType::RefCursor => "SYS_REFCURSOR".into(),
        }
    }

    fn procedure_call(&self, name: &str, specs: &[ParameterSpec]) -> String {
        let mut call = String::from("BEGIN ");
        if let Some(ret) = specs
            .iter()
            .find(|s| s.direction == ParameterDirection::ReturnValue)
        {
            call.push_str(&self.marker(ret.bind_name()));
            call.push_str(" := ");
        }
        call.push_str(name);
        call.push('(');
        call.push_str(&input_markers(self, specs).join(", "));
        call.push_str("); END;");
        call
    }

    fn cancellation_markers(&self) -> &'static [&'static str] {
        &["ORA-01013"]
    }
}

/// Embedded SQLite over rusqlite (storage classes).
#[derive(Debug)]
pub struct SqliteProfile {
    caps: Capabilities,
}

impl SqliteProfile {
    #[must_use]
    pub fn new() -> Self {
        Self {
            caps: Capabilities {
                supports_prepare: true,
                marker_prefixes: &['@', ':', '$'],
                native_marker: MarkerStyle::QuestionNumbered,
                cursor_style: CursorStyle::MultipleResultSets,
                paging_style: PagingStyle::LimitOffset,
                params_in_anonymous_block: false,
                supports_output_params: false,
                supports_stored_procedures: false,
                guid_byte_order: GuidByteOrder::BigEndian,
            },
        }
    }
}

impl Default for SqliteProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderProfile for SqliteProfile {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn type_code(&self, value_type: ValueType) -> Option<ProviderTypeCode> {
        Some(match value_type {
            ValueType::Bool
            | ValueType::I8
            | ValueType::I16
            | ValueType::I32
            | ValueType::I64
            | ValueType::U8
            | ValueType::U16
            | ValueType::U32
            | ValueType::Interval => 1,
            ValueType::F32 | ValueType::F64 => 2,
            ValueType::U64
            | ValueType::Decimal
            | ValueType::Text
            | ValueType::LongText
            | ValueType::Date
            | ValueType::Time
            | ValueType::DateTime
            | ValueType::Guid
            | ValueType::Json => 3,
            ValueType::Bytes => 4,
            ValueType::RefCursor => return None,
        })
    }

    fn type_name(
        &self,
        value_type: ValueType,
        _size: Option<u32>,
        _precision: Option<u8>,
        _scale: Option<u8>,
    ) -> String {
        match self.type_code(value_type) {
            Some(1) => "INTEGER",
            Some(2) => "REAL",
            Some(4) => "BLOB",
            _ => "TEXT",
        }
        .into()
    }

    fn procedure_call(&self, name: &str, _specs: &[ParameterSpec]) -> String {
        name.to_string()
    }

    fn cancellation_markers(&self) -> &'static [&'static str] {
        &["interrupted"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ParameterSpec;

    #[test]
    fn every_profile_covers_the_scalar_types() {
        let profiles: Vec<Box<dyn ProviderProfile>> = vec![
            Box::new(MssqlProfile::new()),
            Box::new(MysqlProfile::new()),
            Box::new(PostgresProfile::new()),
            Box::new(OracleProfile::new()),
            Box::new(SqliteProfile::new()),
        ];
        for profile in &profiles {
            for vt in [ValueType::I32, ValueType::Text, ValueType::Decimal, ValueType::Bytes] {
                assert!(
                    profile.type_code(vt).is_some(),
                    "{} lacks {vt:?}",
                    profile.database_type()
                );
            }
        }
        assert!(OracleProfile::new().type_code(ValueType::Time).is_none());
        assert_eq!(PostgresProfile::new().type_code(ValueType::RefCursor), Some(1790));
    }

    #[test]
    fn procedure_calls_use_caller_markers() {
        let specs = vec![
            ParameterSpec::new("id", ValueType::I32),
            ParameterSpec::new("total", ValueType::Decimal).with_direction(ParameterDirection::Output),
        ];
        assert_eq!(
            MssqlProfile::new().procedure_call("dbo.get_total", &specs),
            "EXEC dbo.get_total @id = @id, @total = @total OUTPUT"
        );
        assert_eq!(
            PostgresProfile::new().procedure_call("get_total", &specs[..1]),
            "SELECT * FROM get_total(@id)"
        );
        assert_eq!(
            OracleProfile::new().procedure_call("pkg.get_total", &specs),
            "BEGIN pkg.get_total(:id, :total); END;"
        );
        assert_eq!(
            MysqlProfile::new().procedure_call("get_total", &specs[..1]),
            "CALL get_total(@id)"
        );
    }

    #[test]
    fn paging_clauses_follow_dialect() {
        assert_eq!(
            SqliteProfile::new().paging_clause("@__offset", "@__limit"),
            " LIMIT @__limit OFFSET @__offset"
        );
        assert_eq!(
            MssqlProfile::new().paging_clause("@__offset", "@__limit"),
            " OFFSET @__offset ROWS FETCH NEXT @__limit ROWS ONLY"
        );
    }

    #[test]
    fn cancellation_messages_are_recognized() {
        assert!(
            PostgresProfile::new()
                .is_cancellation_message("ERROR: canceling statement due to user request")
        );
        assert!(OracleProfile::new().is_cancellation_message("ORA-01013: user requested cancel"));
        assert!(!MysqlProfile::new().is_cancellation_message("Duplicate entry"));
    }
}
