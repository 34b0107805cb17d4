//! Runtime values for expression evaluation and data-state storage.

use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Named values visible to an expression: call bindings, state data, token counts.
pub type Bindings = HashMap<String, Value>;

/// A dynamically typed value.
///
/// Numbers are `f64`; integral numbers serialize as JSON integers so that
/// persisted payloads round-trip the way callers submitted them.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Numeric zero, the result of indexing a missing key.
    pub const fn zero() -> Self {
        Value::Number(0.0)
    }

    pub fn empty_map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Integral view of a number; fractional parts are truncated.
    pub fn as_i64(&self) -> Option<i64> {
        self.as_f64().map(|n| n as i64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render a scalar as a map key. Integral numbers drop their fraction.
    pub fn to_key(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) if n.fract() == 0.0 => Some(format!("{}", *n as i64)),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                serializer.serialize_i64(*n as i64)
            }
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::String(s) => serializer.serialize_str(s),
            Value::List(items) => items.serialize(serializer),
            Value::Map(map) => map.serialize(serializer),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) if n.fract() == 0.0 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            other => match serde_json::to_string(other) {
                Ok(s) => write!(f, "{}", s),
                Err(_) => write!(f, "<{}>", other.type_name()),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
    }
}

/// Convert a JSON object into bindings; non-object payloads yield no bindings.
pub fn bindings_from_json(json: &serde_json::Value) -> Bindings {
    match json {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect(),
        _ => Bindings::new(),
    }
}

/// Convert bindings into a JSON object with keys in sorted order.
pub fn bindings_to_json(bindings: &Bindings) -> serde_json::Value {
    let sorted: BTreeMap<&String, &Value> = bindings.iter().collect();
    serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integral_numbers_serialize_as_integers() {
        let value = Value::Map(BTreeMap::from([
            ("a".to_string(), Value::Number(5.0)),
            ("b".to_string(), Value::Number(2.5)),
        ]));
        assert_eq!(serde_json::to_value(&value).unwrap(), json!({"a": 5, "b": 2.5}));
    }

    #[test]
    fn test_deserialize_untagged() {
        let value: Value = serde_json::from_value(json!({"x": [1, "two", null, true]})).unwrap();
        let list = value.as_map().unwrap()["x"].clone();
        assert_eq!(
            list,
            Value::List(vec![
                Value::Number(1.0),
                Value::String("two".into()),
                Value::Null,
                Value::Bool(true),
            ])
        );
    }

    #[test]
    fn test_to_key() {
        assert_eq!(Value::Number(3.0).to_key(), Some("3".to_string()));
        assert_eq!(Value::from("alice").to_key(), Some("alice".to_string()));
        assert_eq!(Value::empty_map().to_key(), None);
    }

    #[test]
    fn test_bindings_json_conversion() {
        let bindings = bindings_from_json(&json!({"from": "a", "amount": 5}));
        assert_eq!(bindings["from"], Value::from("a"));
        assert_eq!(bindings["amount"], Value::Number(5.0));
        assert_eq!(bindings_to_json(&bindings), json!({"amount": 5, "from": "a"}));
        assert!(bindings_from_json(&json!([1, 2])).is_empty());
    }
}
