//! Live state of one schema instance.

use std::collections::BTreeMap;
use std::fmt::Write;

use serde::{Deserialize, Serialize};

use super::schema::Schema;
use crate::expr::Value;

/// Token counts and data values of one instance.
///
/// Maps are ordered so that serialized snapshots and reachability keys are
/// stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tokens: BTreeMap<String, i64>,
    pub data: BTreeMap<String, Value>,
}

impl Snapshot {
    /// Initial state: declared token counts and data defaults.
    pub fn from_schema(schema: &Schema) -> Self {
        let mut snapshot = Self::default();
        for state in schema.states() {
            if state.is_token() {
                snapshot.tokens.insert(state.id.clone(), state.initial_tokens());
            } else {
                snapshot.data.insert(state.id.clone(), state.initial_value());
            }
        }
        snapshot
    }

    pub fn tokens(&self, state_id: &str) -> i64 {
        self.tokens.get(state_id).copied().unwrap_or(0)
    }

    pub fn data(&self, state_id: &str) -> Option<&Value> {
        self.data.get(state_id)
    }

    /// Canonical `name=count` listing of every token state.
    pub fn token_key(&self) -> String {
        let mut key = String::new();
        for (i, (name, count)) in self.tokens.iter().enumerate() {
            if i > 0 {
                key.push(',');
            }
            let _ = write!(key, "{}={}", name, count);
        }
        key
    }

    /// Whether every state named in `target` holds exactly that many tokens.
    pub fn matches_tokens(&self, target: &BTreeMap<String, i64>) -> bool {
        target.iter().all(|(name, count)| self.tokens(name) == *count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_schema() {
        let schema = Schema::builder("s")
            .token_state("ready", 2)
            .data_state("owner", "string")
            .data_state("balances", "map[string]int64")
            .build()
            .unwrap();
        let snapshot = Snapshot::from_schema(&schema);
        assert_eq!(snapshot.tokens("ready"), 2);
        assert_eq!(snapshot.tokens("unknown"), 0);
        assert_eq!(snapshot.data("owner"), Some(&Value::from("")));
        assert_eq!(snapshot.data("balances"), Some(&Value::empty_map()));
    }

    #[test]
    fn test_token_key_is_sorted() {
        let snapshot = Snapshot {
            tokens: BTreeMap::from([("b".to_string(), 0), ("a".to_string(), 3)]),
            data: BTreeMap::new(),
        };
        assert_eq!(snapshot.token_key(), "a=3,b=0");
    }

    #[test]
    fn test_json_roundtrip() {
        let mut snapshot = Snapshot::default();
        snapshot.tokens.insert("p".into(), 1);
        snapshot
            .data
            .insert("m".into(), Value::Map(BTreeMap::from([("k".to_string(), Value::from(5))])));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["data"]["m"]["k"], 5);
        let back: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }
}
