//! Tree-walking evaluator.
//!
//! Missing-key policy: indexing an absent map key, an out-of-range list slot
//! or a `nil` value yields numeric zero, or an empty map when the result is
//! itself indexed further (`a[x][y]` with `a[x]` absent). Guards are routinely
//! evaluated against partially populated state and depend on this.

use std::borrow::Cow;

use super::ast::{BinaryOp, Expr, LogicalOp, UnaryOp};
use super::error::ExprError;
use super::functions::FunctionRegistry;
use super::value::{Bindings, Value};

/// Evaluates expression trees against one binding context.
pub struct Evaluator<'a> {
    bindings: &'a Bindings,
    functions: Option<&'a FunctionRegistry>,
}

impl<'a> Evaluator<'a> {
    pub fn new(bindings: &'a Bindings, functions: Option<&'a FunctionRegistry>) -> Self {
        Self { bindings, functions }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, ExprError> {
        self.eval_node(expr, false).map(Cow::into_owned)
    }

    fn eval_node(&self, expr: &Expr, container: bool) -> Result<Cow<'a, Value>, ExprError> {
        match expr {
            Expr::Literal(value) => Ok(Cow::Owned(value.clone())),
            Expr::Ident(name) => self
                .bindings
                .get(name)
                .map(Cow::Borrowed)
                .ok_or_else(|| ExprError::UnknownIdentifier(name.clone())),
            Expr::Unary { op, operand } => {
                let value = self.eval_node(operand, false)?;
                unary(*op, &value).map(Cow::Owned)
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = self.eval_node(lhs, false)?;
                let r = self.eval_node(rhs, false)?;
                binary(*op, &l, &r).map(Cow::Owned)
            }
            Expr::Logical { op, lhs, rhs } => self.logical(*op, lhs, rhs).map(|b| Cow::Owned(Value::Bool(b))),
            Expr::Index { target, index } => {
                let target = self.eval_node(target, true)?;
                let index = self.eval_node(index, false)?;
                index_value(target, &index, container)
            }
            Expr::Field { target, name } => {
                let target = self.eval_node(target, true)?;
                index_value(target, &Value::String(name.clone()), container)
            }
            Expr::Call { function, args } => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                let f = self
                    .functions
                    .and_then(|r| r.get(function))
                    .or_else(|| FunctionRegistry::builtins().get(function))
                    .ok_or_else(|| ExprError::UnknownFunction(function.clone()))?;
                f(&args).map(Cow::Owned)
            }
        }
    }

    fn logical(&self, op: LogicalOp, lhs: &Expr, rhs: &Expr) -> Result<bool, ExprError> {
        let left = self.eval_node(lhs, false)?;
        let left = left
            .as_bool()
            .ok_or_else(|| ExprError::type_error(format!("{:?} expects bool operands, got {}", op, left.type_name())))?;

        match (op, left) {
            (LogicalOp::And, false) => return Ok(false),
            (LogicalOp::Or, true) => return Ok(true),
            _ => {}
        }

        let right = self.eval_node(rhs, false)?;
        right
            .as_bool()
            .ok_or_else(|| ExprError::type_error(format!("{:?} expects bool operands, got {}", op, right.type_name())))
    }
}

fn missing(container: bool) -> Value {
    if container {
        Value::empty_map()
    } else {
        Value::zero()
    }
}

fn index_value<'a>(target: Cow<'a, Value>, index: &Value, container: bool) -> Result<Cow<'a, Value>, ExprError> {
    match target {
        Cow::Borrowed(value) => lookup(value, index).map(|found| match found {
            Some(v) => Cow::Borrowed(v),
            None => Cow::Owned(missing(container)),
        }),
        Cow::Owned(value) => lookup(&value, index).map(|found| {
            Cow::Owned(found.cloned().unwrap_or_else(|| missing(container)))
        }),
    }
}

fn lookup<'v>(target: &'v Value, index: &Value) -> Result<Option<&'v Value>, ExprError> {
    match target {
        Value::Map(map) => {
            let key = index
                .to_key()
                .ok_or_else(|| ExprError::type_error(format!("invalid map key of type {}", index.type_name())))?;
            Ok(map.get(&key))
        }
        Value::List(items) => match index {
            Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 => Ok(items.get(*n as usize)),
            Value::Number(_) => Ok(None),
            other => Err(ExprError::type_error(format!(
                "list index must be a number, got {}",
                other.type_name()
            ))),
        },
        Value::Null => Ok(None),
        other => Err(ExprError::type_error(format!("cannot index into {}", other.type_name()))),
    }
}

fn unary(op: UnaryOp, value: &Value) -> Result<Value, ExprError> {
    match (op, value) {
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, Value::Number(n)) => Ok(Value::Number(-n)),
        (UnaryOp::Not, other) => Err(ExprError::type_error(format!("'!' expects bool, got {}", other.type_name()))),
        (UnaryOp::Neg, other) => Err(ExprError::type_error(format!("'-' expects number, got {}", other.type_name()))),
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (l, r) {
                (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => {
                    return Err(ExprError::type_error(format!(
                        "cannot compare {} {} {}",
                        l.type_name(),
                        op.symbol(),
                        r.type_name()
                    )))
                }
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::Add => match (l, r) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            _ => Err(operand_error(op, l, r)),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let (Value::Number(a), Value::Number(b)) = (l, r) else {
                return Err(operand_error(op, l, r));
            };
            match op {
                BinaryOp::Sub => Ok(Value::Number(a - b)),
                BinaryOp::Mul => Ok(Value::Number(a * b)),
                _ if *b == 0.0 => Err(ExprError::DivisionByZero),
                BinaryOp::Div => Ok(Value::Number(a / b)),
                _ => Ok(Value::Number(a % b)),
            }
        }
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a == b,
        _ => l == r,
    }
}

fn operand_error(op: BinaryOp, l: &Value, r: &Value) -> ExprError {
    ExprError::type_error(format!(
        "'{}' expects numeric operands, got {} and {}",
        op.symbol(),
        l.type_name(),
        r.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parser::parse;
    use std::collections::BTreeMap;

    fn eval(src: &str, bindings: &Bindings) -> Result<Value, ExprError> {
        Evaluator::new(bindings, None).eval(&parse(src).unwrap())
    }

    fn nested() -> Bindings {
        let inner = BTreeMap::from([("bob".to_string(), Value::from(3))]);
        Bindings::from([
            (
                "allowances".to_string(),
                Value::Map(BTreeMap::from([("alice".to_string(), Value::Map(inner))])),
            ),
            ("owner".to_string(), Value::from("alice")),
            ("ghost".to_string(), Value::from("zed")),
        ])
    }

    #[test]
    fn test_arithmetic() {
        let b = Bindings::new();
        assert_eq!(eval("1 + 2 * 3", &b).unwrap(), Value::from(7));
        assert_eq!(eval("(1 + 2) * 3", &b).unwrap(), Value::from(9));
        assert_eq!(eval("7 % 4", &b).unwrap(), Value::from(3));
        assert_eq!(eval("-2 - -3", &b).unwrap(), Value::from(1));
        assert_eq!(eval("'a' + 'b'", &b).unwrap(), Value::from("ab"));
    }

    #[test]
    fn test_type_errors() {
        let b = Bindings::new();
        assert!(matches!(eval("1 + 'a'", &b), Err(ExprError::Type(_))));
        assert!(matches!(eval("'a' - 'b'", &b), Err(ExprError::Type(_))));
        assert!(matches!(eval("!1", &b), Err(ExprError::Type(_))));
        assert!(matches!(eval("1 < 'a'", &b), Err(ExprError::Type(_))));
        assert!(matches!(eval("1 && true", &b), Err(ExprError::Type(_))));
    }

    #[test]
    fn test_division_by_zero() {
        let b = Bindings::new();
        assert_eq!(eval("1 / 0", &b), Err(ExprError::DivisionByZero));
        assert_eq!(eval("1 % 0", &b), Err(ExprError::DivisionByZero));
    }

    #[test]
    fn test_nested_missing_keys() {
        let b = nested();
        assert_eq!(eval("allowances[owner]['bob']", &b).unwrap(), Value::from(3));
        assert_eq!(eval("allowances[owner].bob", &b).unwrap(), Value::from(3));
        assert_eq!(eval("allowances[ghost]['bob']", &b).unwrap(), Value::zero());
        assert_eq!(eval("allowances[ghost]", &b).unwrap(), Value::zero());
        assert_eq!(eval("allowances[ghost][owner][owner]", &b).unwrap(), Value::zero());
    }

    #[test]
    fn test_index_into_nil_is_zero() {
        let b = Bindings::from([("x".to_string(), Value::Null)]);
        assert_eq!(eval("x['k']", &b).unwrap(), Value::zero());
    }

    #[test]
    fn test_index_into_scalar_is_error() {
        let b = Bindings::from([("x".to_string(), Value::from(5))]);
        assert!(matches!(eval("x['k']", &b), Err(ExprError::Type(_))));
    }

    #[test]
    fn test_unknown_function() {
        let b = Bindings::new();
        assert_eq!(eval("nope(1)", &b), Err(ExprError::UnknownFunction("nope".into())));
    }

    #[test]
    fn test_custom_function_overrides_builtin() {
        let mut registry = FunctionRegistry::new();
        registry.register("len", |_| Ok(Value::from(42)));
        let b = Bindings::new();
        let value = Evaluator::new(&b, Some(&registry)).eval(&parse("len('x')").unwrap()).unwrap();
        assert_eq!(value, Value::from(42));
    }
}
