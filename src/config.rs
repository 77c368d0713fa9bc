use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::SqlEngineError;

/// How much context a captured failure message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorDetail {
    /// Driver message only.
    #[default]
    Minimal,
    /// Driver message plus script text and, unless suppressed, parameters.
    Detailed,
}

/// Process-level engine settings.
///
/// ```rust
/// use sql_engine::prelude::*;
///
/// let options = EngineOptions::from_json(r#"{ "strict_mapping": true, "error_detail": "detailed" }"#)
///     .unwrap()
///     .with_lob_chunk_size(4096);
/// assert!(options.strict_mapping);
/// assert_eq!(options.decimal_precision, 18);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Raise on unsupported conversions and nulls in non-nullable members
    /// instead of falling back to defaults.
    pub strict_mapping: bool,
    pub error_detail: ErrorDetail,
    /// Include parameter values in detailed messages and log fields.
    pub log_sensitive_data: bool,
    /// Use the native prepare step where the provider supports it.
    pub prepare_statements: bool,
    pub command_timeout_secs: Option<u64>,
    pub decimal_precision: u8,
    pub decimal_scale: u8,
    /// Size used for text parameters that declare none.
    pub default_text_size: Option<u32>,
    /// Chunk length for large-object reads, in bytes or characters.
    pub lob_chunk_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            strict_mapping: false,
            error_detail: ErrorDetail::Minimal,
            log_sensitive_data: false,
            prepare_statements: true,
            command_timeout_secs: None,
            decimal_precision: 18,
            decimal_scale: 2,
            default_text_size: None,
            lob_chunk_size: 8192,
        }
    }
}

impl EngineOptions {
    /// Parse options from JSON; missing keys keep their defaults.
    ///
    /// # Errors
    /// Returns `SqlEngineError::ConfigError` if the JSON is malformed or a
    /// value fails validation.
    pub fn from_json(json: &str) -> Result<Self, SqlEngineError> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| SqlEngineError::ConfigError(format!("invalid engine options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// # Errors
    /// Returns `SqlEngineError::ConfigError` when a numeric setting is out of range.
    pub fn validate(&self) -> Result<(), SqlEngineError> {
        if self.lob_chunk_size == 0 {
            return Err(SqlEngineError::ConfigError(
                "lob_chunk_size must be greater than zero".into(),
            ));
        }
        if self.decimal_precision == 0 || self.decimal_precision > 38 {
            return Err(SqlEngineError::ConfigError(format!(
                "decimal_precision {} is outside 1..=38",
                self.decimal_precision
            )));
        }
        if self.decimal_scale > self.decimal_precision {
            return Err(SqlEngineError::ConfigError(format!(
                "decimal_scale {} exceeds decimal_precision {}",
                self.decimal_scale, self.decimal_precision
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn with_strict_mapping(mut self, strict: bool) -> Self {
        self.strict_mapping = strict;
        self
    }

    #[must_use]
    pub fn with_error_detail(mut self, detail: ErrorDetail) -> Self {
        self.error_detail = detail;
        self
    }

    #[must_use]
    pub fn with_sensitive_logging(mut self, enabled: bool) -> Self {
        self.log_sensitive_data = enabled;
        self
    }

    #[must_use]
    pub fn with_prepare_statements(mut self, enabled: bool) -> Self {
        self.prepare_statements = enabled;
        self
    }

    #[must_use]
    pub fn with_command_timeout(mut self, secs: Option<u64>) -> Self {
        self.command_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_decimal_defaults(mut self, precision: u8, scale: u8) -> Self {
        self.decimal_precision = precision;
        self.decimal_scale = scale;
        self
    }

    #[must_use]
    pub fn with_lob_chunk_size(mut self, size: usize) -> Self {
        self.lob_chunk_size = size;
        self
    }
}
