use std::any::TypeId;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::driver::{CommandType, ParameterDirection};
use crate::provider::ProviderTypeCode;
use crate::types::{DatabaseType, ValueType};

/// Which native call an operation ends in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallPath {
    NonQuery,
    Scalar,
    #[default]
    Reader,
}

/// Behavior configuration that changes what gets compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Behavior {
    pub command_type: CommandType,
    pub call: CallPath,
    /// Synthetic offset/limit markers are appended.
    pub paging: bool,
    /// Cursors a stored procedure declares as extra result sets.
    pub result_cursors: u8,
    pub prepare: bool,
    pub strict: bool,
}

impl Behavior {
    #[must_use]
    pub fn reader() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn non_query() -> Self {
        Self {
            call: CallPath::NonQuery,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn scalar() -> Self {
        Self {
            call: CallPath::Scalar,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_command_type(mut self, command_type: CommandType) -> Self {
        self.command_type = command_type;
        self
    }

    #[must_use]
    pub fn with_paging(mut self, paging: bool) -> Self {
        self.paging = paging;
        self
    }

    #[must_use]
    pub fn with_result_cursors(mut self, cursors: u8) -> Self {
        self.result_cursors = cursors;
        self
    }

    #[must_use]
    pub fn with_prepare(mut self, prepare: bool) -> Self {
        self.prepare = prepare;
        self
    }

    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// One slot of a caller-declared parameter list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeclaredSlot {
    pub name: String,
    pub value_type: ValueType,
    pub direction: ParameterDirection,
    pub size: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    /// Marker name when it differs from `name`.
    pub bind_name: Option<String>,
    pub db_type: Option<ProviderTypeCode>,
}

/// Identity of a parameter shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShapeId {
    /// No parameters.
    Empty,
    /// A filter type whose bindable members are fixed by its definition.
    Type { id: TypeId, name: &'static str },
    /// A caller-declared ordered value list; values are not part of the shape.
    Declared(Arc<[DeclaredSlot]>),
}

impl ShapeId {
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        ShapeId::Type {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

/// Cache key for compiled commands and parsers.
///
/// Hashing uses the precomputed digest only; equality compares every
/// component, so two operations that happen to share a digest still resolve
/// to different cache entries.
#[derive(Clone)]
pub struct OperationFingerprint {
    provider: DatabaseType,
    script: Arc<str>,
    shape: ShapeId,
    behavior: Behavior,
    digest: u64,
}

impl OperationFingerprint {
    #[must_use]
    pub fn new(provider: DatabaseType, script: &str, shape: ShapeId, behavior: Behavior) -> Self {
        let script: Arc<str> = Arc::from(script);
        let mut hasher = DefaultHasher::new();
        provider.hash(&mut hasher);
        script.hash(&mut hasher);
        shape.hash(&mut hasher);
        behavior.hash(&mut hasher);
        Self {
            provider,
            script,
            shape,
            behavior,
            digest: hasher.finish(),
        }
    }

    #[must_use]
    pub fn provider(&self) -> DatabaseType {
        self.provider
    }

    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    #[must_use]
    pub fn shape(&self) -> &ShapeId {
        &self.shape
    }

    #[must_use]
    pub fn behavior(&self) -> Behavior {
        self.behavior
    }

    #[must_use]
    pub fn digest(&self) -> u64 {
        self.digest
    }
}

impl PartialEq for OperationFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
            && self.provider == other.provider
            && self.behavior == other.behavior
            && self.shape == other.shape
            && self.script == other.script
    }
}

impl Eq for OperationFingerprint {}

impl Hash for OperationFingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.digest);
    }
}

impl fmt::Debug for OperationFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationFingerprint")
            .field("provider", &self.provider)
            .field("digest", &format_args!("{:016x}", self.digest))
            .field("shape", &self.shape)
            .field("behavior", &self.behavior)
            .finish_non_exhaustive()
    }
}
