//! Built-in and aggregate functions.
//!
//! Built-ins (`len`, `min`, `max`, `abs`, `contains`, `startsWith`, `endsWith`)
//! are visible to every evaluation. The aggregate family (`sum`, `count`,
//! `tokens`, `minOf`, `maxOf`) is bound to one token-count mapping and only
//! used for whole-model invariant checks.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use super::error::ExprError;
use super::value::Value;

/// A callable exposed to expressions.
pub type Function = Arc<dyn Fn(&[Value]) -> Result<Value, ExprError> + Send + Sync>;

static BUILTINS: OnceLock<FunctionRegistry> = OnceLock::new();

/// Name-to-function table consulted by the evaluator.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Function>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function, replacing any previous one with the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Result<Value, ExprError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    /// Copy every function of `other` into this registry, overriding on name clashes.
    pub fn extend(&mut self, other: &FunctionRegistry) -> &mut Self {
        for (name, function) in &other.functions {
            self.functions.insert(name.clone(), Arc::clone(function));
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// The shared table of built-in functions.
    pub fn builtins() -> &'static FunctionRegistry {
        BUILTINS.get_or_init(|| {
            let mut registry = FunctionRegistry::new();
            registry
                .register("len", builtin_len)
                .register("min", |args| extremum("min", args, f64::min))
                .register("max", |args| extremum("max", args, f64::max))
                .register("abs", builtin_abs)
                .register("contains", builtin_contains)
                .register("startsWith", |args| {
                    let (s, p) = two_strings("startsWith", args)?;
                    Ok(Value::Bool(s.starts_with(p)))
                })
                .register("endsWith", |args| {
                    let (s, p) = two_strings("endsWith", args)?;
                    Ok(Value::Bool(s.ends_with(p)))
                });
            registry
        })
    }

    /// Aggregate functions bound to a snapshot of token counts.
    ///
    /// Each takes one string argument matched against state names either
    /// exactly or as a prefix.
    pub fn aggregates(tokens: &BTreeMap<String, i64>) -> FunctionRegistry {
        let tokens = Arc::new(tokens.clone());
        let mut registry = FunctionRegistry::new();

        let t = Arc::clone(&tokens);
        registry.register("tokens", move |args| {
            let name = one_string("tokens", args)?;
            Ok(Value::from(t.get(name).copied().unwrap_or(0)))
        });

        let t = Arc::clone(&tokens);
        registry.register("sum", move |args| {
            let prefix = one_string("sum", args)?;
            Ok(Value::from(matching(&t, prefix).sum::<i64>()))
        });

        let t = Arc::clone(&tokens);
        registry.register("count", move |args| {
            let prefix = one_string("count", args)?;
            Ok(Value::from(matching(&t, prefix).filter(|n| *n > 0).count()))
        });

        let t = Arc::clone(&tokens);
        registry.register("minOf", move |args| {
            let prefix = one_string("minOf", args)?;
            Ok(Value::from(matching(&t, prefix).min().unwrap_or(0)))
        });

        let t = tokens;
        registry.register("maxOf", move |args| {
            let prefix = one_string("maxOf", args)?;
            Ok(Value::from(matching(&t, prefix).max().unwrap_or(0)))
        });

        registry
    }
}

fn matching<'a>(tokens: &'a BTreeMap<String, i64>, prefix: &'a str) -> impl Iterator<Item = i64> + 'a {
    tokens
        .iter()
        .filter(move |(name, _)| name.starts_with(prefix))
        .map(|(_, count)| *count)
}

fn one_string<'a>(name: &str, args: &'a [Value]) -> Result<&'a str, ExprError> {
    match args {
        [Value::String(s)] => Ok(s),
        [other] => Err(ExprError::type_error(format!(
            "{} expects a string argument, got {}",
            name,
            other.type_name()
        ))),
        _ => Err(ExprError::arity(name, "1", args.len())),
    }
}

fn two_strings<'a>(name: &str, args: &'a [Value]) -> Result<(&'a str, &'a str), ExprError> {
    match args {
        [Value::String(a), Value::String(b)] => Ok((a, b)),
        [a, b] => Err(ExprError::type_error(format!(
            "{} expects two strings, got {} and {}",
            name,
            a.type_name(),
            b.type_name()
        ))),
        _ => Err(ExprError::arity(name, "2", args.len())),
    }
}

fn builtin_len(args: &[Value]) -> Result<Value, ExprError> {
    match args {
        [Value::String(s)] => Ok(Value::from(s.chars().count())),
        [Value::List(items)] => Ok(Value::from(items.len())),
        [Value::Map(map)] => Ok(Value::from(map.len())),
        [Value::Null] => Ok(Value::zero()),
        [other] => Err(ExprError::type_error(format!("len: unsupported type {}", other.type_name()))),
        _ => Err(ExprError::arity("len", "1", args.len())),
    }
}

fn builtin_abs(args: &[Value]) -> Result<Value, ExprError> {
    match args {
        [Value::Number(n)] => Ok(Value::Number(n.abs())),
        [other] => Err(ExprError::type_error(format!("abs: expected number, got {}", other.type_name()))),
        _ => Err(ExprError::arity("abs", "1", args.len())),
    }
}

fn builtin_contains(args: &[Value]) -> Result<Value, ExprError> {
    match args {
        [Value::String(s), Value::String(needle)] => Ok(Value::Bool(s.contains(needle.as_str()))),
        [Value::Map(map), key] => match key.to_key() {
            Some(k) => Ok(Value::Bool(map.contains_key(&k))),
            None => Err(ExprError::type_error(format!(
                "contains: invalid map key type {}",
                key.type_name()
            ))),
        },
        [Value::List(items), needle] => Ok(Value::Bool(items.contains(needle))),
        [Value::Null, _] => Ok(Value::Bool(false)),
        [a, b] => Err(ExprError::type_error(format!(
            "contains: unsupported types {} and {}",
            a.type_name(),
            b.type_name()
        ))),
        _ => Err(ExprError::arity("contains", "2", args.len())),
    }
}

/// `min`/`max` over numeric arguments, or over a single list of numbers.
fn extremum(name: &str, args: &[Value], pick: fn(f64, f64) -> f64) -> Result<Value, ExprError> {
    let values: &[Value] = match args {
        [Value::List(items)] => items,
        _ => args,
    };
    if values.is_empty() {
        return Err(ExprError::arity(name, "at least 1", 0));
    }
    let mut acc: Option<f64> = None;
    for v in values {
        let n = v.as_f64().ok_or_else(|| {
            ExprError::type_error(format!("{}: expected numbers, got {}", name, v.type_name()))
        })?;
        acc = Some(acc.map_or(n, |a| pick(a, n)));
    }
    Ok(Value::Number(acc.unwrap_or(0.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(registry: &FunctionRegistry, name: &str, args: &[Value]) -> Result<Value, ExprError> {
        (registry.get(name).unwrap())(args)
    }

    #[test]
    fn test_builtins_present() {
        let b = FunctionRegistry::builtins();
        for name in ["len", "min", "max", "abs", "contains", "startsWith", "endsWith"] {
            assert!(b.contains(name), "missing {}", name);
        }
        assert!(!b.contains("sum"));
    }

    #[test]
    fn test_min_max_abs() {
        let b = FunctionRegistry::builtins();
        let args = [Value::from(3), Value::from(-2), Value::from(7)];
        assert_eq!(call(b, "min", &args).unwrap(), Value::from(-2));
        assert_eq!(call(b, "max", &args).unwrap(), Value::from(7));
        assert_eq!(call(b, "abs", &[Value::from(-4)]).unwrap(), Value::from(4));
        assert!(call(b, "min", &[]).is_err());
        assert!(call(b, "max", &[Value::from("x")]).is_err());
    }

    #[test]
    fn test_contains_variants() {
        let b = FunctionRegistry::builtins();
        let map = Value::Map(BTreeMap::from([("alice".to_string(), Value::from(1))]));
        assert_eq!(call(b, "contains", &[map.clone(), Value::from("alice")]).unwrap(), Value::Bool(true));
        assert_eq!(call(b, "contains", &[map, Value::from("bob")]).unwrap(), Value::Bool(false));
        assert_eq!(
            call(b, "contains", &[Value::from("hello"), Value::from("ell")]).unwrap(),
            Value::Bool(true)
        );
        let list = Value::List(vec![Value::from(1), Value::from(2)]);
        assert_eq!(call(b, "contains", &[list, Value::from(2)]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_aggregates_prefix_matching() {
        let tokens = BTreeMap::from([
            ("queue_a".to_string(), 2),
            ("queue_b".to_string(), 0),
            ("queue_c".to_string(), 5),
            ("done".to_string(), 1),
        ]);
        let agg = FunctionRegistry::aggregates(&tokens);
        let q = [Value::from("queue_")];
        assert_eq!(call(&agg, "sum", &q).unwrap(), Value::from(7));
        assert_eq!(call(&agg, "count", &q).unwrap(), Value::from(2));
        assert_eq!(call(&agg, "minOf", &q).unwrap(), Value::from(0));
        assert_eq!(call(&agg, "maxOf", &q).unwrap(), Value::from(5));
        assert_eq!(call(&agg, "tokens", &[Value::from("done")]).unwrap(), Value::from(1));
        assert_eq!(call(&agg, "tokens", &[Value::from("missing")]).unwrap(), Value::from(0));
        assert!(call(&agg, "sum", &[Value::from(1)]).is_err());
    }
}
