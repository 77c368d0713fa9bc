//! Cooperative cancellation.
//!
//! Cancellation is observed, never forced: the session checks the token right
//! after each native await resolves. Drivers that report a cancelled
//! statement as an ordinary error are recognised by the profile's message
//! markers.

use tokio_util::sync::CancellationToken;

use crate::error::SqlEngineError;
use crate::provider::ProviderProfile;

const CANCELLED: &str = "operation was cancelled by the caller";

/// Fail with `Cancelled` if `token` has fired.
///
/// # Errors
/// Returns `SqlEngineError::Cancelled` when the token is cancelled.
pub fn check(token: Option<&CancellationToken>) -> Result<(), SqlEngineError> {
    match token {
        Some(token) if token.is_cancelled() => Err(SqlEngineError::Cancelled(CANCELLED.into())),
        _ => Ok(()),
    }
}

/// Reclassify `error` as a cancellation when the token fired or the driver
/// message says so.
#[must_use]
pub fn classify(
    error: SqlEngineError,
    token: Option<&CancellationToken>,
    profile: &dyn ProviderProfile,
) -> SqlEngineError {
    if error.is_cancelled() {
        return error;
    }
    if token.is_some_and(CancellationToken::is_cancelled) {
        return SqlEngineError::Cancelled(format!("{CANCELLED}: {error}"));
    }
    let message = error.to_string();
    if profile.is_cancellation_message(&message) {
        return SqlEngineError::Cancelled(message);
    }
    error
}

/// Apply the post-await check to the result of a native call.
///
/// # Errors
/// Returns the (reclassified) error of `result`, or `Cancelled` if the token
/// fired while the call was in flight.
pub fn observe<T>(
    result: Result<T, SqlEngineError>,
    token: Option<&CancellationToken>,
    profile: &dyn ProviderProfile,
) -> Result<T, SqlEngineError> {
    match result {
        Ok(value) => {
            check(token)?;
            Ok(value)
        }
        Err(error) => Err(classify(error, token, profile)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MssqlProfile, PostgresProfile};

    #[test]
    fn fired_tokens_turn_success_into_cancellation() {
        let token = CancellationToken::new();
        let profile = PostgresProfile::new();
        assert_eq!(observe(Ok(1), Some(&token), &profile).unwrap(), 1);
        token.cancel();
        assert!(observe(Ok(1), Some(&token), &profile).unwrap_err().is_cancelled());
        assert!(check(None).is_ok());
    }

    #[test]
    fn driver_messages_are_matched_per_provider() {
        let profile = MssqlProfile::new();
        let err = SqlEngineError::ExecutionError("Operation cancelled by user.".into());
        assert!(classify(err, None, &profile).is_cancelled());

        let other = SqlEngineError::ExecutionError("deadlock victim".into());
        assert!(!classify(other, None, &profile).is_cancelled());

        let pg = PostgresProfile::new();
        let err = SqlEngineError::ExecutionError("canceling statement due to user request".into());
        assert!(classify(err, None, &pg).is_cancelled());
    }

    #[test]
    fn generic_failures_under_a_fired_token_are_cancellations() {
        let token = CancellationToken::new();
        token.cancel();
        let err = SqlEngineError::ConnectionError("reset".into());
        let classified = classify(err, Some(&token), &PostgresProfile::new());
        assert!(classified.is_cancelled());
    }
}
