//! # Expression Language
//!
//! A small boolean/arithmetic language used for action guards and model
//! invariants, e.g. `balances[from] >= amount && amount > 0`.
//!
//! Expressions are compiled once into a [`CompiledExpr`] and evaluated many
//! times against different [`Bindings`]. Compiled expressions are immutable
//! and can be shared across threads.
//!
//! ```
//! use petri_core::expr::{compile, Bindings, Value};
//!
//! let guard = compile("amount > 0 && balances[from] >= amount").unwrap();
//! let mut bindings = Bindings::new();
//! bindings.insert("amount".into(), Value::from(5));
//! bindings.insert("from".into(), Value::from("alice"));
//! bindings.insert("balances".into(), Value::empty_map());
//! assert!(!guard.evaluate(&bindings, None).unwrap());
//! ```

mod ast;
mod error;
mod evaluator;
mod functions;
mod lexer;
mod parser;
mod value;

use std::fmt;
use std::sync::Arc;

pub use ast::{BinaryOp, Expr, LogicalOp, UnaryOp};
pub use error::ExprError;
pub use evaluator::Evaluator;
pub use functions::{Function, FunctionRegistry};
pub use lexer::{tokenize, Spanned, Token};
pub use parser::{parse, MAX_DEPTH};
pub use value::{bindings_from_json, bindings_to_json, Bindings, Value};

/// A parsed expression ready for repeated evaluation.
#[derive(Clone)]
pub struct CompiledExpr {
    source: Arc<str>,
    ast: Arc<Expr>,
}

impl fmt::Debug for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompiledExpr").field(&self.source).finish()
    }
}

impl fmt::Display for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl CompiledExpr {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Identifiers the expression reads, in first-use order.
    pub fn identifiers(&self) -> Vec<&str> {
        self.ast.identifiers()
    }

    /// Evaluate to any value.
    pub fn evaluate_value(
        &self,
        bindings: &Bindings,
        functions: Option<&FunctionRegistry>,
    ) -> Result<Value, ExprError> {
        Evaluator::new(bindings, functions).eval(&self.ast)
    }

    /// Evaluate as a predicate. Non-boolean results are an error.
    pub fn evaluate(&self, bindings: &Bindings, functions: Option<&FunctionRegistry>) -> Result<bool, ExprError> {
        match self.evaluate_value(bindings, functions)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::NotBoolean(other.type_name())),
        }
    }

    /// Evaluate as a number. Non-numeric results are an error.
    pub fn evaluate_numeric(
        &self,
        bindings: &Bindings,
        functions: Option<&FunctionRegistry>,
    ) -> Result<f64, ExprError> {
        match self.evaluate_value(bindings, functions)? {
            Value::Number(n) => Ok(n),
            other => Err(ExprError::NotNumeric(other.type_name())),
        }
    }
}

/// Parse `text` into a reusable compiled expression.
pub fn compile(text: &str) -> Result<CompiledExpr, ExprError> {
    let ast = parse(text)?;
    Ok(CompiledExpr {
        source: Arc::from(text),
        ast: Arc::new(ast),
    })
}

/// Compile and evaluate a boolean expression in one step.
pub fn evaluate(text: &str, bindings: &Bindings, functions: Option<&FunctionRegistry>) -> Result<bool, ExprError> {
    compile(text)?.evaluate(bindings, functions)
}

/// Compile and evaluate a numeric expression in one step.
pub fn evaluate_numeric(
    text: &str,
    bindings: &Bindings,
    functions: Option<&FunctionRegistry>,
) -> Result<f64, ExprError> {
    compile(text)?.evaluate_numeric(bindings, functions)
}
