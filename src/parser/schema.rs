use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::MemberSpec;
use crate::driver::{ColumnType, NativeColumn};

/// One result column as the parser sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaColumn {
    pub name: String,
    pub source_type: ColumnType,
    pub allow_null: bool,
    /// The member type differs from the column's natural type.
    pub requires_conversion: bool,
    pub is_large_object: bool,
    pub long_text: bool,
    /// Index of the matched target member.
    pub member: Option<usize>,
}

/// Ordered column list derived once per (result shape, target type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultColumnSchema {
    columns: Vec<SchemaColumn>,
    signature: u64,
}

/// Hash of the names, types and nullability a driver reported.
#[must_use]
pub fn schema_signature(columns: &[NativeColumn]) -> u64 {
    let mut hasher = DefaultHasher::new();
    columns.len().hash(&mut hasher);
    for column in columns {
        column.name.to_ascii_lowercase().hash(&mut hasher);
        column.column_type.hash(&mut hasher);
        column.allow_null.hash(&mut hasher);
    }
    hasher.finish()
}

/// Names (lowercased), types and nullability a driver reported, compared
/// column by column. Used where two schemas must never share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaKey(Arc<[(String, ColumnType, bool)]>);

impl SchemaKey {
    #[must_use]
    pub fn of(columns: &[NativeColumn]) -> Self {
        Self(
            columns
                .iter()
                .map(|c| (c.name.to_ascii_lowercase(), c.column_type, c.allow_null))
                .collect(),
        )
    }
}

impl ResultColumnSchema {
    /// Match reported `columns` against `members`.
    ///
    /// With `positional` set (single-value targets) the first column binds to
    /// the first member regardless of name. Otherwise names match
    /// case-insensitively against each member's alias or name; the first
    /// column wins when a result repeats a name.
    #[must_use]
    pub fn derive(columns: &[NativeColumn], members: &[MemberSpec], positional: bool) -> Self {
        let signature = schema_signature(columns);
        let mut taken = vec![false; members.len()];
        let columns = columns
            .iter()
            .enumerate()
            .map(|(ordinal, column)| {
                let member = if positional {
                    (ordinal == 0 && !members.is_empty()).then_some(0)
                } else {
                    members
                        .iter()
                        .enumerate()
                        .find(|(idx, m)| !taken[*idx] && m.matches(&column.name))
                        .map(|(idx, _)| idx)
                };
                if let Some(idx) = member {
                    taken[idx] = true;
                }
                let spec = member.and_then(|idx| members.get(idx));
                let long_text = column.column_type == ColumnType::LongText
                    || spec.is_some_and(|m| {
                        m.long_text
                            && matches!(column.column_type, ColumnType::Text | ColumnType::Dynamic)
                    });
                SchemaColumn {
                    name: column.name.clone(),
                    source_type: column.column_type,
                    allow_null: column.allow_null,
                    requires_conversion: spec
                        .is_some_and(|m| column.column_type.natural_type() != Some(m.value_type)),
                    is_large_object: column.column_type.is_large_object() || long_text,
                    long_text,
                    member,
                }
            })
            .collect();
        Self { columns, signature }
    }

    #[must_use]
    pub fn columns(&self) -> &[SchemaColumn] {
        &self.columns
    }

    #[must_use]
    pub fn signature(&self) -> u64 {
        self.signature
    }

    /// Columns that bind to a member.
    pub fn matched(&self) -> impl Iterator<Item = (usize, &SchemaColumn)> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.member.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::LongText;

    fn columns() -> Vec<NativeColumn> {
        vec![
            NativeColumn::new("ID", ColumnType::Int32).not_null(),
            NativeColumn::new("name", ColumnType::Text),
            NativeColumn::new("notes", ColumnType::Text),
            NativeColumn::new("extra", ColumnType::Int64),
        ]
    }

    #[test]
    fn members_match_by_name_ignoring_case() {
        let members = [
            MemberSpec::of::<i64>("id"),
            MemberSpec::of::<String>("display").alias("name"),
            MemberSpec::of::<LongText>("notes"),
        ];
        let schema = ResultColumnSchema::derive(&columns(), &members, false);
        let bound: Vec<_> = schema.columns().iter().map(|c| c.member).collect();
        assert_eq!(bound, vec![Some(0), Some(1), Some(2), None]);
        assert!(schema.columns()[0].requires_conversion);
        assert!(!schema.columns()[0].allow_null);
        assert!(!schema.columns()[1].requires_conversion);
        assert!(schema.columns()[2].long_text && schema.columns()[2].is_large_object);
        assert_eq!(schema.matched().count(), 3);
    }

    #[test]
    fn positional_schemas_bind_the_first_column_only() {
        let members = [MemberSpec::of::<i64>("")];
        let schema = ResultColumnSchema::derive(&columns(), &members, true);
        assert_eq!(schema.columns()[0].member, Some(0));
        assert!(schema.columns()[1..].iter().all(|c| c.member.is_none()));
    }

    #[test]
    fn signature_tracks_types_and_nullability() {
        let base = columns();
        let mut retyped = columns();
        retyped[3].column_type = ColumnType::Text;
        let mut nullable = columns();
        nullable[0].allow_null = true;
        assert_eq!(schema_signature(&base), schema_signature(&columns()));
        assert_ne!(schema_signature(&base), schema_signature(&retyped));
        assert_ne!(schema_signature(&base), schema_signature(&nullable));
    }

    #[test]
    fn schema_keys_compare_every_column() {
        let base = columns();
        let mut shouted = columns();
        shouted[1].name = shouted[1].name.to_uppercase();
        let mut reordered = columns();
        reordered.swap(0, 1);
        assert_eq!(SchemaKey::of(&base), SchemaKey::of(&shouted));
        assert_ne!(SchemaKey::of(&base), SchemaKey::of(&reordered));
        assert_ne!(SchemaKey::of(&base), SchemaKey::of(&base[..2]));
    }
}
