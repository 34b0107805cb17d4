//! Error handling for Petri Core.
//!
//! This module provides:
//! - A single crate-wide error type with machine-readable codes
//! - Severity and retryability classification per code
//! - Structured details (entity ids, free-form context)
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use petri_core::error::{PetriError, Result, ErrorCode};
//!
//! match runtime.execute("confirm") {
//!     Err(e) if e.code() == ErrorCode::ActionNotEnabled => { /* ordinary negative result */ }
//!     other => other?,
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::expr::ExprError;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Petri Core operations.
pub type Result<T> = std::result::Result<T, PetriError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by callers for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Expression Errors (1000-1099)
    ExpressionParse,
    ExpressionEvaluation,
    UnknownIdentifier,

    // Runtime Errors (1100-1199)
    ActionNotFound,
    ActionNotEnabled,
    GuardNotSatisfied,
    GuardEvaluation,
    ConstraintViolated,
    ConstraintEvaluation,
    InvalidBinding,

    // Schema Errors (1200-1299)
    SchemaValidation,

    // Store Errors (2000-2099)
    ConcurrencyConflict,
    StreamNotFound,
    StoreClosed,
    DatabaseError,
    DatabaseConnectionFailed,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ExpressionParse => 1000,
            Self::ExpressionEvaluation => 1001,
            Self::UnknownIdentifier => 1002,

            Self::ActionNotFound => 1100,
            Self::ActionNotEnabled => 1101,
            Self::GuardNotSatisfied => 1102,
            Self::GuardEvaluation => 1103,
            Self::ConstraintViolated => 1104,
            Self::ConstraintEvaluation => 1105,
            Self::InvalidBinding => 1106,

            Self::SchemaValidation => 1200,

            Self::ConcurrencyConflict => 2000,
            Self::StreamNotFound => 2001,
            Self::StoreClosed => 2002,
            Self::DatabaseError => 2003,
            Self::DatabaseConnectionFailed => 2004,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable.
    ///
    /// A concurrency conflict is recoverable by reloading the aggregate and
    /// re-running the whole command; nothing else is retried.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict | Self::DatabaseConnectionFailed)
    }

    /// Expected, frequent outcomes of calling `execute*` on state that does not
    /// currently permit the action.
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ActionNotEnabled | Self::GuardNotSatisfied | Self::GuardEvaluation
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "expression",
            1100..=1199 => "runtime",
            1200..=1299 => "schema",
            2000..=2099 => "store",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors and ordinary negative results
    Low,
    /// Operational issues (conflicts, invariant violations)
    Medium,
    /// System errors (storage failures)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ExpressionParse
            | ErrorCode::ExpressionEvaluation
            | ErrorCode::UnknownIdentifier
            | ErrorCode::ActionNotFound
            | ErrorCode::ActionNotEnabled
            | ErrorCode::GuardNotSatisfied
            | ErrorCode::GuardEvaluation
            | ErrorCode::InvalidBinding
            | ErrorCode::SchemaValidation
            | ErrorCode::StreamNotFound => Self::Low,

            ErrorCode::ConstraintViolated
            | ErrorCode::ConstraintEvaluation
            | ErrorCode::ConcurrencyConflict
            | ErrorCode::StoreClosed => Self::Medium,

            ErrorCode::DatabaseError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::DatabaseConnectionFailed | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (action, constraint, stream, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Petri Core.
#[derive(Error, Debug)]
pub struct PetriError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-facing error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for PetriError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl PetriError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-facing message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Id of the entity this error is about, e.g. the violated constraint.
    pub fn entity_id(&self) -> Option<&str> {
        self.details.entity_id.as_deref()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            crate::telemetry::metrics::ERRORS,
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<ExprError> for PetriError {
    fn from(error: ExprError) -> Self {
        let code = match &error {
            ExprError::Parse { .. } | ExprError::MaxDepthExceeded { .. } => ErrorCode::ExpressionParse,
            ExprError::UnknownIdentifier(_) => ErrorCode::UnknownIdentifier,
            _ => ErrorCode::ExpressionEvaluation,
        };
        Self::new(code, error.to_string()).with_source(error)
    }
}

impl From<sqlx::Error> for PetriError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::StreamNotFound, "The requested record was not found"),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for PetriError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for PetriError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An I/O error occurred", error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for PetriError {
    fn from(error: config::ConfigError) -> Self {
        let code = match &error {
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                ErrorCode::InvalidConfiguration
            }
            _ => ErrorCode::ConfigurationError,
        };

        Self::with_internal(code, "Configuration error occurred", error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl PetriError {
    // ─────────────────────────────────────────────────────────────────────────
    // Runtime Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn action_not_found(action_id: impl Into<String>) -> Self {
        let id = action_id.into();
        Self::new(ErrorCode::ActionNotFound, format!("Action not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("action", id))
    }

    pub fn action_not_enabled(action_id: impl Into<String>) -> Self {
        let id = action_id.into();
        Self::new(ErrorCode::ActionNotEnabled, format!("Action not enabled: {}", id))
            .with_details(ErrorDetails::new().with_entity("action", id))
    }

    pub fn guard_not_satisfied(action_id: impl Into<String>, guard: &str) -> Self {
        let id = action_id.into();
        Self::new(
            ErrorCode::GuardNotSatisfied,
            format!("Guard not satisfied for action {}: {}", id, guard),
        )
        .with_details(ErrorDetails::new().with_entity("action", id).with_context("guard", guard))
    }

    pub fn guard_evaluation(action_id: impl Into<String>, source: ExprError) -> Self {
        let id = action_id.into();
        Self::new(
            ErrorCode::GuardEvaluation,
            format!("Guard evaluation failed for action {}: {}", id, source),
        )
        .with_details(ErrorDetails::new().with_entity("action", id))
        .with_source(source)
    }

    pub fn constraint_violated(constraint_id: impl Into<String>, expr: &str) -> Self {
        let id = constraint_id.into();
        Self::new(
            ErrorCode::ConstraintViolated,
            format!("Constraint violated: {} ({})", id, expr),
        )
        .with_details(ErrorDetails::new().with_entity("constraint", id).with_context("expr", expr))
    }

    pub fn constraint_evaluation(constraint_id: impl Into<String>, message: impl Into<String>) -> Self {
        let id = constraint_id.into();
        Self::with_internal(
            ErrorCode::ConstraintEvaluation,
            format!("Constraint could not be evaluated: {}", id),
            message,
        )
        .with_details(ErrorDetails::new().with_entity("constraint", id))
    }

    pub fn invalid_binding(action_id: impl Into<String>, message: impl Into<String>) -> Self {
        let id = action_id.into();
        Self::new(
            ErrorCode::InvalidBinding,
            format!("Invalid binding for action {}: {}", id, message.into()),
        )
        .with_details(ErrorDetails::new().with_entity("action", id))
    }

    pub fn schema_validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SchemaValidation, format!("Invalid schema: {}", message.into()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Store Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn concurrency_conflict(stream_id: impl Into<String>, expected: i64, actual: i64) -> Self {
        let id = stream_id.into();
        counter!(crate::telemetry::metrics::CONCURRENCY_CONFLICTS).increment(1);
        Self::new(
            ErrorCode::ConcurrencyConflict,
            format!(
                "Concurrency conflict on stream {}: expected version {}, actual {}",
                id, expected, actual
            ),
        )
        .with_details(ErrorDetails::new().with_entity("stream", id))
        .with_context("expected_version", expected)
        .with_context("actual_version", actual)
    }

    pub fn stream_not_found(stream_id: impl Into<String>) -> Self {
        let id = stream_id.into();
        Self::new(ErrorCode::StreamNotFound, format!("Stream not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("stream", id))
    }

    pub fn store_closed() -> Self {
        Self::new(ErrorCode::StoreClosed, "Event store is closed")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
