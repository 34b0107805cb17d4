//! Expression language errors.

use thiserror::Error;

/// Errors raised while compiling or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("parse error at {position}: {message}")]
    Parse { message: String, position: usize },

    #[error("expression nesting exceeds maximum depth of {max}")]
    MaxDepthExceeded { max: usize },

    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("{function}: expected {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: String,
        got: usize,
    },

    #[error("expression did not evaluate to a boolean (got {0})")]
    NotBoolean(&'static str),

    #[error("expression did not evaluate to a number (got {0})")]
    NotNumeric(&'static str),
}

impl ExprError {
    pub(crate) fn parse(message: impl Into<String>, position: usize) -> Self {
        Self::Parse {
            message: message.into(),
            position,
        }
    }

    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }

    pub(crate) fn arity(function: &str, expected: impl Into<String>, got: usize) -> Self {
        Self::Arity {
            function: function.to_string(),
            expected: expected.into(),
            got,
        }
    }
}
