//! Compiled-and-cached SQL execution over several database engines.
//!
//! Every call is described by an operation fingerprint (provider, script,
//! parameter shape, result type and behavior). The first call with a given
//! fingerprint compiles a parameter binder and, on first read, a row parser;
//! later calls reuse both from the caches held by the [`context::EngineContext`].
//!
//! ```rust,no_run
//! use sql_engine::prelude::*;
//!
//! sql_engine::record! {
//!     #[derive(Debug, Default)]
//!     pub struct User {
//!         pub id: i64,
//!         pub name: String,
//!     }
//! }
//!
//! # async fn demo() -> Result<(), SqlEngineError> {
//! let db = Database::connect(DatabaseType::Sqlite, "app.db")?;
//! let params = ParamList::new().add("min", 10_i64);
//! let users: Vec<User> = db
//!     .fetch_list("SELECT id, name FROM users WHERE id >= @min", &params, &CallOptions::new())
//!     .await?;
//! # let _ = users;
//! # Ok(()) }
//! ```

pub mod blocking;
pub mod cancel;
pub mod command;
pub mod config;
pub mod context;
pub mod conversion;
pub mod driver;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod macros;
pub mod outcome;
pub mod parser;
pub mod prelude;
pub mod provider;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transaction;
pub mod translation;
pub mod types;

pub use blocking::BlockingDatabase;
pub use config::EngineOptions;
pub use context::EngineContext;
pub use error::SqlEngineError;
pub use executor::{CallOptions, Database};
pub use types::{DatabaseType, RowValues};
