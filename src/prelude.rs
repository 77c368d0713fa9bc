//! Convenient imports for common functionality.
//!
//! This module re-exports the most commonly used types and functions
//! to make it easier to get started with the library.

pub use crate::blocking::{BlockingDatabase, BlockingTransaction};
pub use crate::command::{BindSource, ParamDecl, ParamList};
pub use crate::config::{EngineOptions, ErrorDetail};
pub use crate::context::EngineContext;
pub use crate::conversion::{LongText, SqlType};
pub use crate::driver::{CommandType, ParameterDirection, connector_from_url};
pub use crate::error::{ErrorKind, SqlEngineError};
pub use crate::executor::{CallOptions, Database, MultiResult, TxFuture};
pub use crate::fingerprint::Behavior;
pub use crate::outcome::{Outcome, OutcomeStatus};
pub use crate::parser::{FromRecord, TypeConfig};
pub use crate::session::{BatchStream, PagedStream};
pub use crate::transaction::Transaction;
pub use crate::types::{DatabaseType, RowValues, ValueType};

pub use tokio_util::sync::CancellationToken;
