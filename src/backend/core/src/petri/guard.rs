//! Guard and constraint evaluation contract.

use std::collections::BTreeMap;
use std::fmt;

use dashmap::DashMap;

use crate::expr::{self, Bindings, CompiledExpr, ExprError, FunctionRegistry, Value};

/// Evaluates guard and constraint expressions for a runtime.
///
/// Implementations must be pure: the same expression and inputs always give
/// the same answer.
pub trait GuardEvaluator: Send + Sync {
    /// Evaluate an action guard against the merged state and call bindings.
    fn evaluate_guard(&self, expr: &str, bindings: &Bindings) -> Result<bool, ExprError>;

    /// Evaluate a model invariant against token counts.
    fn evaluate_constraint(&self, expr: &str, tokens: &BTreeMap<String, i64>) -> Result<bool, ExprError>;
}

/// Default evaluator backed by the expression language.
///
/// Compiled expressions are cached by source text.
#[derive(Default)]
pub struct ExprEvaluator {
    cache: DashMap<String, CompiledExpr>,
    functions: Option<FunctionRegistry>,
}

impl fmt::Debug for ExprEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExprEvaluator")
            .field("cached", &self.cache.len())
            .field("functions", &self.functions)
            .finish()
    }
}

impl ExprEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluator with user functions; they take precedence over built-ins.
    pub fn with_functions(functions: FunctionRegistry) -> Self {
        Self {
            cache: DashMap::new(),
            functions: Some(functions),
        }
    }

    pub fn compiled(&self, source: &str) -> Result<CompiledExpr, ExprError> {
        if let Some(hit) = self.cache.get(source) {
            return Ok(hit.clone());
        }
        let compiled = expr::compile(source)?;
        self.cache.insert(source.to_string(), compiled.clone());
        Ok(compiled)
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

impl GuardEvaluator for ExprEvaluator {
    fn evaluate_guard(&self, source: &str, bindings: &Bindings) -> Result<bool, ExprError> {
        self.compiled(source)?.evaluate(bindings, self.functions.as_ref())
    }

    fn evaluate_constraint(&self, source: &str, tokens: &BTreeMap<String, i64>) -> Result<bool, ExprError> {
        let compiled = self.compiled(source)?;
        let bindings: Bindings = tokens
            .iter()
            .map(|(name, count)| (name.clone(), Value::from(*count)))
            .collect();

        let mut functions = self.functions.clone().unwrap_or_default();
        functions.extend(&FunctionRegistry::aggregates(tokens));
        compiled.evaluate(&bindings, Some(&functions))
    }
}
