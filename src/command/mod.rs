//! Compiled Command Builder Cache.
//!
//! A [`BindSource`] describes its bindable members once; [`compile`] turns
//! that description plus a script and [`Behavior`](crate::fingerprint::Behavior)
//! into an immutable [`CompiledCommand`], and [`CommandCache`] memoizes it per
//! [`OperationFingerprint`](crate::fingerprint::OperationFingerprint).

mod cache;
mod compile;
mod validate;

use std::sync::Arc;

use crate::conversion::{InputConverter, SqlType};
use crate::driver::ParameterDirection;
use crate::error::SqlEngineError;
use crate::fingerprint::{DeclaredSlot, ShapeId};
use crate::provider::ProviderTypeCode;
use crate::types::{RowValues, ValueType};

pub use cache::{CacheStats, CommandCache};
pub use compile::{CompiledCommand, PAGING_LIMIT, PAGING_OFFSET, compile};
pub use validate::{StatementKind, SuppliedParameters, classify, validate};

/// Reads one member value off a bind source.
pub type Accessor<S> = Arc<dyn Fn(&S) -> RowValues + Send + Sync>;

/// Writes an output value (already in canonical form) back onto a bind source.
pub type Setter<S> = Arc<dyn Fn(&mut S, RowValues) -> Result<(), SqlEngineError> + Send + Sync>;

/// Declared configuration of one bindable member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamDecl {
    pub name: String,
    pub value_type: ValueType,
    /// Marker name when it differs from the member name.
    pub bind_name: Option<String>,
    pub size: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub direction: ParameterDirection,
    /// Explicit provider bind code, bypassing the profile table.
    pub db_type: Option<ProviderTypeCode>,
}

impl ParamDecl {
    #[must_use]
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            bind_name: None,
            size: None,
            precision: None,
            scale: None,
            direction: ParameterDirection::Input,
            db_type: None,
        }
    }

    #[must_use]
    pub fn direction(mut self, direction: ParameterDirection) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub fn size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn precision(mut self, precision: u8) -> Self {
        self.precision = Some(precision);
        self
    }

    #[must_use]
    pub fn scale(mut self, scale: u8) -> Self {
        self.scale = Some(scale);
        self
    }

    #[must_use]
    pub fn bind_as(mut self, bind_name: impl Into<String>) -> Self {
        self.bind_name = Some(bind_name.into());
        self
    }

    #[must_use]
    pub fn db_type(mut self, code: ProviderTypeCode) -> Self {
        self.db_type = Some(code);
        self
    }

    fn slot(&self) -> DeclaredSlot {
        DeclaredSlot {
            name: self.name.clone(),
            value_type: self.value_type,
            direction: self.direction,
            size: self.size,
            precision: self.precision,
            scale: self.scale,
            bind_name: self.bind_name.clone(),
            db_type: self.db_type,
        }
    }
}

/// A bindable member: its declaration plus how to read and write it.
pub struct BindMember<S> {
    pub decl: ParamDecl,
    pub get: Accessor<S>,
    pub set: Option<Setter<S>>,
}

impl<S> Clone for BindMember<S> {
    fn clone(&self) -> Self {
        Self {
            decl: self.decl.clone(),
            get: Arc::clone(&self.get),
            set: self.set.clone(),
        }
    }
}

/// Anything that can supply parameter values to a compiled command.
pub trait BindSource: Send + Sync + 'static {
    /// Identity of the parameter shape. Sources with equal shape ids must
    /// describe identical member lists.
    fn shape_id(&self) -> ShapeId;

    fn describe(&self) -> Vec<BindMember<Self>>
    where
        Self: Sized;
}

impl BindSource for () {
    fn shape_id(&self) -> ShapeId {
        ShapeId::Empty
    }

    fn describe(&self) -> Vec<BindMember<Self>> {
        Vec::new()
    }
}

/// One parameter of a compiled command.
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub bind_name: Option<String>,
    pub size: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub direction: ParameterDirection,
    pub value_type: ValueType,
    /// Index of the source member the value comes from.
    pub bound_member: Option<usize>,
    pub type_code: ProviderTypeCode,
    pub converter: Option<InputConverter>,
    pub is_paging_marker: bool,
    pub is_cursor_marker: bool,
}

impl ParameterSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            bind_name: None,
            size: None,
            precision: None,
            scale: None,
            direction: ParameterDirection::Input,
            value_type,
            bound_member: None,
            type_code: 0,
            converter: None,
            is_paging_marker: false,
            is_cursor_marker: false,
        }
    }

    #[must_use]
    pub fn with_direction(mut self, direction: ParameterDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Name used for the marker in the script.
    #[must_use]
    pub fn bind_name(&self) -> &str {
        self.bind_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ParamEntry {
    decl: ParamDecl,
    value: RowValues,
}

/// Caller-declared ordered list of parameter values.
///
/// ```rust
/// use sql_engine::prelude::*;
///
/// let params = ParamList::new()
///     .add("id", 7_i64)
///     .add("name", "x".to_string())
///     .add_output("total", ValueType::Decimal);
/// assert_eq!(params.len(), 3);
/// assert_eq!(params.value("ID"), Some(&RowValues::Int(7)));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamList {
    entries: Vec<ParamEntry>,
}

impl ParamList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Values bound by position, named `p1`, `p2`, ...
    #[must_use]
    pub fn positional(values: impl IntoIterator<Item = RowValues>) -> Self {
        values
            .into_iter()
            .enumerate()
            .fold(Self::new(), |list, (i, v)| list.add_value(format!("p{}", i + 1), v))
    }

    #[must_use]
    pub fn add<T: SqlType>(self, name: impl Into<String>, value: T) -> Self {
        let decl = ParamDecl::new(name, T::VALUE_TYPE);
        self.push(decl, value.to_value())
    }

    /// Add a raw value; its declared type is inferred from the variant.
    #[must_use]
    pub fn add_value(self, name: impl Into<String>, value: RowValues) -> Self {
        let decl = ParamDecl::new(name, value.natural_type());
        self.push(decl, value)
    }

    /// Add a parameter with full control over its declaration.
    #[must_use]
    pub fn add_declared(self, decl: ParamDecl, value: RowValues) -> Self {
        self.push(decl, value)
    }

    #[must_use]
    pub fn add_output(self, name: impl Into<String>, value_type: ValueType) -> Self {
        let decl = ParamDecl::new(name, value_type).direction(ParameterDirection::Output);
        self.push(decl, RowValues::Null)
    }

    #[must_use]
    pub fn add_inout<T: SqlType>(self, name: impl Into<String>, value: T) -> Self {
        let decl =
            ParamDecl::new(name, T::VALUE_TYPE).direction(ParameterDirection::InputOutput);
        self.push(decl, value.to_value())
    }

    #[must_use]
    pub fn add_return(self, name: impl Into<String>, value_type: ValueType) -> Self {
        let decl = ParamDecl::new(name, value_type).direction(ParameterDirection::ReturnValue);
        self.push(decl, RowValues::Null)
    }

    fn push(mut self, decl: ParamDecl, value: RowValues) -> Self {
        self.entries.push(ParamEntry { decl, value });
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current value of `name` (case-insensitive), including loaded outputs.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&RowValues> {
        self.entries
            .iter()
            .find(|e| e.decl.name.eq_ignore_ascii_case(name))
            .map(|e| &e.value)
    }

    /// Typed read of `name`.
    ///
    /// # Errors
    /// Returns `SqlEngineError::ParameterError` if there is no such parameter
    /// or `SqlEngineError::ConversionError` if the value does not fit `T`.
    pub fn get<T: SqlType>(&self, name: &str) -> Result<T, SqlEngineError> {
        let value = self
            .value(name)
            .ok_or_else(|| SqlEngineError::ParameterError(format!("no parameter named '{name}'")))?;
        T::from_value(value.clone())
    }

    /// `name = value` pairs for diagnostics.
    #[must_use]
    pub fn dump(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{} = {}", e.decl.name, e.value))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl BindSource for ParamList {
    fn shape_id(&self) -> ShapeId {
        if self.entries.is_empty() {
            return ShapeId::Empty;
        }
        ShapeId::Declared(self.entries.iter().map(|e| e.decl.slot()).collect())
    }

    fn describe(&self) -> Vec<BindMember<Self>> {
        self.entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                let get: Accessor<Self> = Arc::new(move |list: &ParamList| {
                    list.entries
                        .get(idx)
                        .map_or(RowValues::Null, |e| e.value.clone())
                });
                let set: Option<Setter<Self>> = entry.decl.direction.is_output().then(|| {
                    let setter: Setter<Self> =
                        Arc::new(move |list: &mut ParamList, value: RowValues| {
                            let entry = list.entries.get_mut(idx).ok_or_else(|| {
                                SqlEngineError::ParameterError(format!(
                                    "parameter list has no slot {idx}"
                                ))
                            })?;
                            entry.value = value;
                            Ok(())
                        });
                    setter
                });
                BindMember {
                    decl: entry.decl.clone(),
                    get,
                    set,
                }
            })
            .collect()
    }
}
