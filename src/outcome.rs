//! Try-style results.
//!
//! The `try_*` façade calls capture execution and cancellation failures into
//! an [`Outcome`] instead of returning `Err`. Configuration and schema errors
//! still surface as `Err`; they are programming errors, not runtime
//! conditions.

use std::fmt;

use crate::config::{EngineOptions, ErrorDetail};
use crate::error::{ErrorKind, SqlEngineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Failed(String),
    Cancelled(String),
}

/// Result of a try-style call.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub value: Option<T>,
    pub status: OutcomeStatus,
}

impl<T> Outcome<T> {
    #[must_use]
    pub fn success(value: T) -> Self {
        Self {
            value: Some(value),
            status: OutcomeStatus::Success,
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            value: None,
            status: OutcomeStatus::Failed(message.into()),
        }
    }

    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            value: None,
            status: OutcomeStatus::Cancelled(message.into()),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.status, OutcomeStatus::Cancelled(_))
    }

    /// Failure or cancellation message.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match &self.status {
            OutcomeStatus::Success => None,
            OutcomeStatus::Failed(m) | OutcomeStatus::Cancelled(m) => Some(m),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: self.value.map(f),
            status: self.status,
        }
    }

    /// Turn the outcome back into a `Result`.
    ///
    /// # Errors
    /// Returns `SqlEngineError::ExecutionError` or `SqlEngineError::Cancelled`
    /// carrying the captured message.
    pub fn into_result(self) -> Result<T, SqlEngineError> {
        match (self.status, self.value) {
            (OutcomeStatus::Success, Some(value)) => Ok(value),
            (OutcomeStatus::Success, None) => {
                Err(SqlEngineError::Other("successful outcome without a value".into()))
            }
            (OutcomeStatus::Failed(m), _) => Err(SqlEngineError::ExecutionError(m)),
            (OutcomeStatus::Cancelled(m), _) => Err(SqlEngineError::Cancelled(m)),
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Success => f.write_str("success"),
            OutcomeStatus::Failed(m) => write!(f, "failed: {m}"),
            OutcomeStatus::Cancelled(m) => write!(f, "cancelled: {m}"),
        }
    }
}

/// Format a failure message for `error` raised while running `script`.
///
/// Minimal detail is the error text alone. Detailed adds the script and,
/// when sensitive data may be logged, the parameter dump.
#[must_use]
pub fn format_message(
    error: &SqlEngineError,
    options: &EngineOptions,
    script: &str,
    parameters: impl FnOnce() -> String,
) -> String {
    match options.error_detail {
        ErrorDetail::Minimal => error.to_string(),
        ErrorDetail::Detailed => {
            let mut message = format!("{error}\nscript: {}", script.trim());
            if options.log_sensitive_data {
                let dump = parameters();
                if !dump.is_empty() {
                    message.push_str("\nparameters: ");
                    message.push_str(&dump);
                }
            }
            message
        }
    }
}

/// Capture `result` per the propagation policy.
///
/// # Errors
/// Configuration and schema errors are returned unchanged.
pub(crate) fn capture<T>(
    result: Result<T, SqlEngineError>,
    options: &EngineOptions,
    script: &str,
    parameters: impl FnOnce() -> String,
) -> Result<Outcome<T>, SqlEngineError> {
    match result {
        Ok(value) => Ok(Outcome::success(value)),
        Err(error) => match error.kind() {
            ErrorKind::Configuration | ErrorKind::Schema => Err(error),
            ErrorKind::Cancellation => Ok(Outcome::cancelled(format_message(
                &error, options, script, parameters,
            ))),
            ErrorKind::Execution => Ok(Outcome::failed(format_message(
                &error, options, script, parameters,
            ))),
        },
    }
}
