//! Declarative mapping macros.
//!
//! `record!` declares a row target, `param_shape!` a filter type whose fields
//! bind as parameters. Both generate the struct plus its trait impl so the
//! member list never drifts from the field list.

/// Declare a struct that result rows materialize into.
///
/// Field-setter shape (needs `Default`):
///
/// ```rust
/// sql_engine::record! {
///     #[derive(Debug, Default)]
///     pub struct User {
///         pub id: i64,
///         pub name: String as "user_name",
///         #[long_text]
///         pub bio: String,
///     }
/// }
/// ```
///
/// Constructor shape: prefix with `new`. Values are staged and the struct is
/// built once, in declared field order.
///
/// ```rust
/// sql_engine::record! {
///     new #[derive(Debug)]
///     pub struct Point {
///         pub x: i64,
///         pub y: i64,
///     }
/// }
/// ```
#[macro_export]
macro_rules! record {
    (@member $field:ident, $ty:ty, [$($attr:ident)*], $($alias:literal)?) => {{
        #[allow(unused_mut)]
        let mut spec = $crate::parser::MemberSpec::of::<$ty>(stringify!($field));
        $( spec = spec.alias($alias); )?
        $( $crate::record!(@attr spec, $attr); )*
        spec
    }};
    (@attr $spec:ident, long_text) => {
        $spec = $spec.long_text();
    };
    (
        new $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$attr:ident])* $fvis:vis $field:ident : $ty:ty $(as $alias:literal)? ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $( $fvis $field: $ty ),*
        }

        impl $crate::parser::FromRecord for $name {
            fn target() -> $crate::parser::RecordTarget<Self> {
                $crate::parser::RecordTarget::Constructor {
                    members: vec![
                        $( $crate::record!(@member $field, $ty, [$($attr)*], $($alias)?) ),*
                    ],
                    build: |stage: &mut $crate::parser::ValueStage| {
                        Ok($name {
                            $( $field: stage.next::<$ty>()? ),*
                        })
                    },
                }
            }
        }
    };
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$attr:ident])* $fvis:vis $field:ident : $ty:ty $(as $alias:literal)? ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $( $fvis $field: $ty ),*
        }

        impl $crate::parser::FromRecord for $name {
            fn target() -> $crate::parser::RecordTarget<Self> {
                $crate::parser::RecordTarget::Fields {
                    new: Some(<$name as ::core::default::Default>::default),
                    members: vec![
                        $( (
                            $crate::record!(@member $field, $ty, [$($attr)*], $($alias)?),
                            (|target: &mut $name, value: $crate::types::RowValues|
                                -> ::core::result::Result<(), $crate::error::SqlEngineError> {
                                target.$field =
                                    <$ty as $crate::conversion::SqlType>::from_value(value)?;
                                Ok(())
                            }) as $crate::parser::FieldSetter<$name>,
                        ) ),*
                    ],
                }
            }
        }
    };
}

/// Declare a filter struct whose fields bind as command parameters.
///
/// Field attributes: `#[output]`, `#[inout]`, `#[return_value]`,
/// `#[size = N]`, `#[precision = N]`, `#[scale = N]`, `#[db_type = N]`.
/// `as "name"` binds the field to a differently named marker.
///
/// ```rust
/// use rust_decimal::Decimal;
///
/// sql_engine::param_shape! {
///     #[derive(Debug, Default)]
///     pub struct Transfer {
///         pub account_id: i64,
///         #[precision = 12]
///         #[scale = 2]
///         pub amount: Decimal,
///         #[output]
///         pub balance: Decimal,
///     }
/// }
/// ```
#[macro_export]
macro_rules! param_shape {
    (@attr $decl:ident, output) => {
        $decl = $decl.direction($crate::driver::ParameterDirection::Output);
    };
    (@attr $decl:ident, inout) => {
        $decl = $decl.direction($crate::driver::ParameterDirection::InputOutput);
    };
    (@attr $decl:ident, return_value) => {
        $decl = $decl.direction($crate::driver::ParameterDirection::ReturnValue);
    };
    (@attr $decl:ident, size = $value:literal) => {
        $decl = $decl.size($value);
    };
    (@attr $decl:ident, precision = $value:literal) => {
        $decl = $decl.precision($value);
    };
    (@attr $decl:ident, scale = $value:literal) => {
        $decl = $decl.scale($value);
    };
    (@attr $decl:ident, db_type = $value:literal) => {
        $decl = $decl.db_type($value);
    };
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$attr:ident $(= $value:literal)?])*
                $fvis:vis $field:ident : $ty:ty $(as $alias:literal)?
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $( $fvis $field: $ty ),*
        }

        impl $crate::command::BindSource for $name {
            fn shape_id(&self) -> $crate::fingerprint::ShapeId {
                $crate::fingerprint::ShapeId::of::<$name>()
            }

            fn describe(&self) -> ::std::vec::Vec<$crate::command::BindMember<Self>> {
                vec![
                    $( {
                        #[allow(unused_mut)]
                        let mut decl = $crate::command::ParamDecl::new(
                            stringify!($field),
                            <$ty as $crate::conversion::SqlType>::VALUE_TYPE,
                        );
                        $( decl = decl.bind_as($alias); )?
                        $( $crate::param_shape!(@attr decl, $attr $(= $value)?); )*
                        let set: ::core::option::Option<$crate::command::Setter<Self>> =
                            if decl.direction.is_output() {
                                Some(::std::sync::Arc::new(
                                    |target: &mut $name, value: $crate::types::RowValues|
                                        -> ::core::result::Result<(), $crate::error::SqlEngineError> {
                                        target.$field =
                                            <$ty as $crate::conversion::SqlType>::from_value(value)?;
                                        Ok(())
                                    },
                                ))
                            } else {
                                None
                            };
                        let get: $crate::command::Accessor<Self> = ::std::sync::Arc::new(
                            |source: &$name| -> $crate::types::RowValues {
                                <$ty as $crate::conversion::SqlType>::to_value(&source.$field)
                            },
                        );
                        $crate::command::BindMember { decl, get, set }
                    } ),*
                ]
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::command::{BindSource, ParamList};
    use crate::driver::{BufferedRow, ColumnType, NativeColumn, ParameterDirection};
    use crate::fingerprint::ShapeId;
    use crate::parser::{FromRecord, RecordTarget, compile};
    use crate::types::{DatabaseType, RowValues, ValueType};

    crate::record! {
        #[derive(Debug, Default, PartialEq)]
        struct Customer {
            id: i64,
            name: String as "customer_name",
            #[long_text]
            notes: String,
        }
    }

    crate::record! {
        new #[derive(Debug, PartialEq)]
        struct Pair {
            left: i32,
            right: Option<String>,
        }
    }

    crate::param_shape! {
        #[derive(Debug, Default)]
        struct Lookup {
            id: i64,
            #[size = 40]
            code: String as "lookup_code",
            #[output]
            total: i32,
        }
    }

    #[test]
    fn record_members_follow_field_attributes() {
        let RecordTarget::Fields { new, members } = Customer::target() else {
            panic!("expected field shape");
        };
        assert!(new.is_some());
        let names: Vec<_> = members.iter().map(|(m, _)| m.column_name()).collect();
        assert_eq!(names, vec!["id", "customer_name", "notes"]);
        assert!(members[2].0.long_text);
    }

    #[test]
    fn record_parses_rows() {
        let columns = vec![
            NativeColumn::new("customer_name", ColumnType::Text),
            NativeColumn::new("id", ColumnType::Int64),
        ];
        let parser = compile::<Customer>(DatabaseType::Sqlite, &columns, false, 8).unwrap();
        let row = BufferedRow::new(vec![RowValues::Text("acme".into()), RowValues::Int(4)]);
        assert_eq!(
            parser.parse(&row).unwrap(),
            Customer {
                id: 4,
                name: "acme".into(),
                notes: String::new(),
            }
        );
    }

    #[test]
    fn constructor_records_build_in_order() {
        let columns = vec![
            NativeColumn::new("right", ColumnType::Text),
            NativeColumn::new("left", ColumnType::Int32),
        ];
        let parser = compile::<Pair>(DatabaseType::Postgres, &columns, false, 8).unwrap();
        let row = BufferedRow::new(vec![RowValues::Null, RowValues::Int(9)]);
        assert_eq!(
            parser.parse(&row).unwrap(),
            Pair {
                left: 9,
                right: None
            }
        );
    }

    #[test]
    fn param_shapes_describe_members() {
        let mut lookup = Lookup {
            id: 3,
            code: "A".into(),
            total: 0,
        };
        assert_eq!(lookup.shape_id(), ShapeId::of::<Lookup>());
        let members = lookup.describe();
        assert_eq!(members[1].decl.bind_name.as_deref(), Some("lookup_code"));
        assert_eq!(members[1].decl.size, Some(40));
        assert_eq!(members[2].decl.direction, ParameterDirection::Output);
        assert_eq!(members[2].decl.value_type, ValueType::I32);
        assert_eq!((members[0].get)(&lookup), RowValues::Int(3));
        let set = members[2].set.clone().unwrap();
        set(&mut lookup, RowValues::Int(11)).unwrap();
        assert_eq!(lookup.total, 11);
        assert!(members[0].set.is_none());
        assert_ne!(lookup.shape_id(), ParamList::new().add("id", 3_i64).shape_id());
    }
}
