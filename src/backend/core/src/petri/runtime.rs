//! Petri-net runtime: enablement, firing and invariant checks over one snapshot.
//!
//! Execution is transactional. The snapshot is captured before any mutation
//! and restored when a data transformation or constraint check fails, so a
//! failed `execute*` call leaves the instance exactly as it found it.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use super::guard::{ExprEvaluator, GuardEvaluator};
use super::schema::{Action, ArcDef, Schema, State};
use super::snapshot::Snapshot;
use crate::error::{PetriError, Result};
use crate::expr::{Bindings, Value};

/// A constraint that does not hold for the current token counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintViolation {
    pub constraint_id: String,
    pub expr: String,
    /// Set when evaluation failed rather than returning `false`.
    pub error: Option<String>,
}

impl ConstraintViolation {
    pub fn is_evaluation_error(&self) -> bool {
        self.error.is_some()
    }

    fn into_error(self) -> PetriError {
        match self.error {
            Some(message) => PetriError::constraint_evaluation(self.constraint_id, message),
            None => PetriError::constraint_violated(self.constraint_id, &self.expr),
        }
    }
}

/// Executes actions of a schema against a live snapshot.
#[derive(Clone)]
pub struct Runtime {
    schema: Arc<Schema>,
    snapshot: Snapshot,
    evaluator: Option<Arc<dyn GuardEvaluator>>,
    check_constraints: bool,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("schema", &self.schema.name())
            .field("snapshot", &self.snapshot)
            .field("has_evaluator", &self.evaluator.is_some())
            .field("check_constraints", &self.check_constraints)
            .finish()
    }
}

impl Runtime {
    /// Fresh instance with the default expression evaluator.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self::with_evaluator(schema, Arc::new(ExprEvaluator::new()))
    }

    pub fn with_evaluator(schema: Arc<Schema>, evaluator: Arc<dyn GuardEvaluator>) -> Self {
        let snapshot = Snapshot::from_schema(&schema);
        Self {
            schema,
            snapshot,
            evaluator: Some(evaluator),
            check_constraints: true,
        }
    }

    /// Instance with no evaluator: guards and constraints are not checked.
    pub fn without_evaluator(schema: Arc<Schema>) -> Self {
        let snapshot = Snapshot::from_schema(&schema);
        Self {
            schema,
            snapshot,
            evaluator: None,
            check_constraints: true,
        }
    }

    pub fn from_snapshot(schema: Arc<Schema>, snapshot: Snapshot, evaluator: Option<Arc<dyn GuardEvaluator>>) -> Self {
        Self {
            schema,
            snapshot,
            evaluator,
            check_constraints: true,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> Snapshot {
        self.snapshot
    }

    pub fn restore(&mut self, snapshot: Snapshot) {
        self.snapshot = snapshot;
    }

    pub fn tokens(&self, state_id: &str) -> i64 {
        self.snapshot.tokens(state_id)
    }

    pub fn data(&self, state_id: &str) -> Option<&Value> {
        self.snapshot.data(state_id)
    }

    pub fn set_evaluator(&mut self, evaluator: Option<Arc<dyn GuardEvaluator>>) {
        self.evaluator = evaluator;
    }

    pub fn set_check_constraints(&mut self, enabled: bool) {
        self.check_constraints = enabled;
    }

    pub fn checks_constraints(&self) -> bool {
        self.check_constraints
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enablement
    // ─────────────────────────────────────────────────────────────────────────

    /// Whether every token input has enough tokens and no inhibitor source is marked.
    ///
    /// Unknown actions are never enabled. Data-state inputs do not affect enablement.
    pub fn enabled(&self, action_id: &str) -> bool {
        if self.schema.action(action_id).is_none() {
            return false;
        }
        self.schema.inputs(action_id).all(|arc| {
            let Some(state) = self.schema.state(&arc.source) else {
                return false;
            };
            if !state.is_token() {
                return true;
            }
            let count = self.snapshot.tokens(&arc.source);
            if arc.inhibitor {
                count == 0
            } else {
                count >= arc.weight
            }
        })
    }

    /// Currently firable actions, in declaration order.
    pub fn enabled_actions(&self) -> Vec<String> {
        self.schema
            .actions()
            .iter()
            .filter(|a| self.enabled(&a.id))
            .map(|a| a.id.clone())
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────

    /// Fire an action moving tokens only. Guards and data arcs are not consulted.
    pub fn execute(&mut self, action_id: &str) -> Result<()> {
        let action = self.action(action_id)?;
        self.fire(&action, None)
    }

    /// Fire an action with call bindings: guard, enablement, tokens, data, constraints.
    pub fn execute_with_bindings(&mut self, action_id: &str, bindings: &Bindings) -> Result<()> {
        let action = self.action(action_id)?;

        if let (Some(guard), Some(evaluator)) = (&action.guard, &self.evaluator) {
            let context = self.guard_context(bindings);
            match evaluator.evaluate_guard(guard, &context) {
                Ok(true) => {}
                Ok(false) => return Err(PetriError::guard_not_satisfied(action_id, guard)),
                Err(e) => return Err(PetriError::guard_evaluation(action_id, e)),
            }
        }

        self.fire(&action, Some(bindings))
    }

    fn action(&self, action_id: &str) -> Result<Action> {
        self.schema
            .action(action_id)
            .cloned()
            .ok_or_else(|| PetriError::action_not_found(action_id))
    }

    /// State data first, then token counts, then call bindings; later entries win.
    fn guard_context(&self, bindings: &Bindings) -> Bindings {
        let mut context = Bindings::with_capacity(self.snapshot.data.len() + self.snapshot.tokens.len() + bindings.len());
        for (name, value) in &self.snapshot.data {
            context.insert(name.clone(), value.clone());
        }
        for (name, count) in &self.snapshot.tokens {
            context.insert(name.clone(), Value::from(*count));
        }
        for (name, value) in bindings {
            context.insert(name.clone(), value.clone());
        }
        context
    }

    fn fire(&mut self, action: &Action, bindings: Option<&Bindings>) -> Result<()> {
        if !self.enabled(&action.id) {
            return Err(PetriError::action_not_enabled(&action.id));
        }

        let before = self.snapshot.clone();
        if let Err(e) = self.apply(action, bindings) {
            self.snapshot = before;
            return Err(e);
        }

        if self.check_constraints {
            if let Some(violation) = self.first_violation() {
                debug!(
                    action = %action.id,
                    constraint = %violation.constraint_id,
                    "constraint failed, rolling back"
                );
                self.snapshot = before;
                return Err(violation.into_error());
            }
        }

        trace!(action = %action.id, tokens = %self.snapshot.token_key(), "action fired");
        Ok(())
    }

    fn apply(&mut self, action: &Action, bindings: Option<&Bindings>) -> Result<()> {
        let schema = Arc::clone(&self.schema);

        for arc in schema.inputs(&action.id) {
            let Some(state) = schema.state(&arc.source) else { continue };
            if state.is_token() {
                if !arc.inhibitor {
                    *self.snapshot.tokens.entry(state.id.clone()).or_insert(0) -= arc.weight;
                }
            } else if let Some(bindings) = bindings {
                self.transform_data(&action.id, state, arc, bindings, false)?;
            }
        }

        for arc in schema.outputs(&action.id) {
            let Some(state) = schema.state(&arc.target) else { continue };
            if state.is_token() {
                *self.snapshot.tokens.entry(state.id.clone()).or_insert(0) += arc.weight;
            } else if let Some(bindings) = bindings {
                self.transform_data(&action.id, state, arc, bindings, true)?;
            }
        }

        Ok(())
    }

    /// Apply one data arc.
    ///
    /// Simple types: outputs assign the bound value, inputs are read-only.
    /// Map types: the bound number is added (output) or subtracted (input) at
    /// the path selected by the arc keys, absent entries counting as zero.
    fn transform_data(
        &mut self,
        action_id: &str,
        state: &State,
        arc: &ArcDef,
        bindings: &Bindings,
        add: bool,
    ) -> Result<()> {
        if !state.is_map() || arc.keys.is_empty() {
            if add {
                let value = bindings.get(&arc.value).ok_or_else(|| {
                    PetriError::invalid_binding(action_id, format!("missing binding '{}'", arc.value))
                })?;
                self.snapshot.data.insert(state.id.clone(), value.clone());
            }
            return Ok(());
        }

        let keys = arc
            .keys
            .iter()
            .map(|name| {
                bindings
                    .get(name)
                    .and_then(Value::to_key)
                    .ok_or_else(|| PetriError::invalid_binding(action_id, format!("key binding '{}' is missing or not a scalar", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        let amount = bindings
            .get(&arc.value)
            .and_then(Value::as_f64)
            .ok_or_else(|| PetriError::invalid_binding(action_id, format!("value binding '{}' is missing or not a number", arc.value)))?;
        let delta = if add { amount } else { -amount };

        let root = self
            .snapshot
            .data
            .entry(state.id.clone())
            .or_insert_with(Value::empty_map);
        if root.is_null() {
            *root = Value::empty_map();
        }

        let mut map = root
            .as_map_mut()
            .ok_or_else(|| PetriError::invalid_binding(action_id, format!("state '{}' does not hold a map", state.id)))?;
        let (last, parents) = keys
            .split_last()
            .ok_or_else(|| PetriError::internal("data arc without keys"))?;
        for key in parents {
            let entry = map.entry(key.clone()).or_insert_with(Value::empty_map);
            if entry.is_null() {
                *entry = Value::empty_map();
            }
            map = entry.as_map_mut().ok_or_else(|| {
                PetriError::invalid_binding(action_id, format!("'{}[{}]' is not a map", state.id, key))
            })?;
        }

        let slot = map.entry(last.clone()).or_insert_with(Value::zero);
        let current = match slot {
            Value::Null => 0.0,
            Value::Number(n) => *n,
            other => {
                return Err(PetriError::invalid_binding(
                    action_id,
                    format!("'{}' holds a {} where a number was expected", state.id, other.type_name()),
                ))
            }
        };
        *slot = Value::Number(current + delta);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Constraints
    // ─────────────────────────────────────────────────────────────────────────

    /// Every constraint that does not currently hold. Empty without an evaluator.
    pub fn constraints(&self) -> Vec<ConstraintViolation> {
        self.violations().collect()
    }

    fn first_violation(&self) -> Option<ConstraintViolation> {
        self.violations().next()
    }

    fn violations(&self) -> impl Iterator<Item = ConstraintViolation> + '_ {
        let evaluator = self.evaluator.as_deref();
        self.schema.constraints().iter().filter_map(move |constraint| {
            let evaluator = evaluator?;
            let error = match evaluator.evaluate_constraint(&constraint.expr, &self.snapshot.tokens) {
                Ok(true) => return None,
                Ok(false) => None,
                Err(e) => Some(e.to_string()),
            };
            Some(ConstraintViolation {
                constraint_id: constraint.id.clone(),
                expr: constraint.expr.clone(),
                error,
            })
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reachability
    // ─────────────────────────────────────────────────────────────────────────

    /// Breadth-first probe: can the token states named in `target` reach those
    /// exact counts within `max_steps` token-only firings?
    ///
    /// States are deduplicated by their canonical token key. Guards and data
    /// arcs are ignored.
    pub fn can_reach(&self, target: &BTreeMap<String, i64>, max_steps: usize) -> bool {
        if self.snapshot.matches_tokens(target) {
            return true;
        }

        let mut probe = Self {
            schema: Arc::clone(&self.schema),
            snapshot: Snapshot {
                tokens: self.snapshot.tokens.clone(),
                data: BTreeMap::new(),
            },
            evaluator: self.evaluator.clone(),
            check_constraints: self.check_constraints,
        };

        let mut visited = HashSet::from([probe.snapshot.token_key()]);
        let mut frontier = VecDeque::from([(probe.snapshot.tokens.clone(), 0usize)]);

        while let Some((tokens, depth)) = frontier.pop_front() {
            if depth >= max_steps {
                continue;
            }
            for action in self.schema.actions() {
                probe.snapshot.tokens = tokens.clone();
                if probe.fire(action, None).is_err() {
                    continue;
                }
                if probe.snapshot.matches_tokens(target) {
                    return true;
                }
                if visited.insert(probe.snapshot.token_key()) {
                    frontier.push_back((probe.snapshot.tokens.clone(), depth + 1));
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn bind(pairs: &[(&str, Value)]) -> Bindings {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn order_runtime() -> Runtime {
        let schema = Schema::builder("order")
            .token_state("pending", 1)
            .token_state("confirmed", 0)
            .action("confirm")
            .flow("pending", "confirm")
            .flow("confirm", "confirmed")
            .build()
            .unwrap();
        Runtime::new(Arc::new(schema))
    }

    #[test]
    fn test_confirm_once() {
        let mut runtime = order_runtime();
        assert!(runtime.enabled("confirm"));
        runtime.execute("confirm").unwrap();
        assert_eq!(runtime.tokens("pending"), 0);
        assert_eq!(runtime.tokens("confirmed"), 1);

        let before = runtime.snapshot().clone();
        let err = runtime.execute("confirm").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ActionNotEnabled);
        assert_eq!(runtime.snapshot(), &before);
    }

    #[test]
    fn test_unknown_action() {
        let mut runtime = order_runtime();
        assert!(!runtime.enabled("ship"));
        assert_eq!(runtime.execute("ship").unwrap_err().code(), ErrorCode::ActionNotFound);
    }

    #[test]
    fn test_weighted_input() {
        let schema = Schema::builder("w")
            .token_state("stock", 5)
            .action("pack")
            .arc(ArcDef::new("stock", "pack").with_weight(3))
            .build()
            .unwrap();
        let mut runtime = Runtime::new(Arc::new(schema));
        runtime.execute("pack").unwrap();
        assert_eq!(runtime.tokens("stock"), 2);
        assert!(!runtime.enabled("pack"));
    }

    #[test]
    fn test_inhibitor_blocks_without_consuming() {
        let schema = Schema::builder("i")
            .token_state("lock", 1)
            .token_state("done", 0)
            .action("work")
            .inhibitor("lock", "work")
            .flow("work", "done")
            .build()
            .unwrap();
        let mut runtime = Runtime::new(Arc::new(schema));
        assert!(!runtime.enabled("work"));

        runtime.restore(Snapshot {
            tokens: BTreeMap::from([("lock".to_string(), 0), ("done".to_string(), 0)]),
            data: BTreeMap::new(),
        });
        runtime.execute("work").unwrap();
        assert_eq!(runtime.tokens("lock"), 0);
        assert_eq!(runtime.tokens("done"), 1);
    }

    fn token_runtime() -> Runtime {
        let schema = Schema::builder("token")
            .data_state("balances", "map[string]int64")
            .guarded_action("transfer", "balances[from] >= amount")
            .arc(ArcDef::new("balances", "transfer").with_keys(["from"]))
            .arc(ArcDef::new("transfer", "balances").with_keys(["to"]))
            .build()
            .unwrap();
        let mut runtime = Runtime::new(Arc::new(schema));
        let mut snapshot = runtime.snapshot().clone();
        snapshot.data.insert(
            "balances".into(),
            Value::Map(BTreeMap::from([("a".to_string(), Value::from(10))])),
        );
        runtime.restore(snapshot);
        runtime
    }

    #[test]
    fn test_guarded_transfer() {
        let mut runtime = token_runtime();
        let bindings = bind(&[("from", "a".into()), ("to", "b".into()), ("amount", 5.into())]);
        runtime.execute_with_bindings("transfer", &bindings).unwrap();

        let balances = runtime.data("balances").unwrap().as_map().unwrap();
        assert_eq!(balances["a"], Value::from(5));
        assert_eq!(balances["b"], Value::from(5));
    }

    #[test]
    fn test_guard_rejects_and_leaves_state() {
        let mut runtime = token_runtime();
        let before = runtime.snapshot().clone();
        let bindings = bind(&[("from", "a".into()), ("to", "b".into()), ("amount", 50.into())]);
        let err = runtime.execute_with_bindings("transfer", &bindings).unwrap_err();
        assert_eq!(err.code(), ErrorCode::GuardNotSatisfied);
        assert_eq!(runtime.snapshot(), &before);
    }

    #[test]
    fn test_guard_unbound_identifier() {
        let mut runtime = token_runtime();
        let err = runtime
            .execute_with_bindings("transfer", &bind(&[("from", "a".into())]))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::GuardEvaluation);
    }

    #[test]
    fn test_missing_key_binding_rolls_back() {
        let mut runtime = token_runtime();
        let before = runtime.snapshot().clone();
        // guard passes, but the output arc has no `to` key
        let err = runtime
            .execute_with_bindings("transfer", &bind(&[("from", "a".into()), ("amount", 1.into())]))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidBinding);
        assert_eq!(runtime.snapshot(), &before);
    }

    #[test]
    fn test_nested_map_arc() {
        let schema = Schema::builder("allowance")
            .data_state("allowances", "map[string]map[string]int64")
            .action("approve")
            .arc(ArcDef::new("approve", "allowances").with_keys(["owner", "spender"]))
            .build()
            .unwrap();
        let mut runtime = Runtime::new(Arc::new(schema));
        let bindings = bind(&[("owner", "o".into()), ("spender", "s".into()), ("amount", 7.into())]);
        runtime.execute_with_bindings("approve", &bindings).unwrap();
        runtime.execute_with_bindings("approve", &bindings).unwrap();

        let allowances = runtime.data("allowances").unwrap().as_map().unwrap();
        assert_eq!(allowances["o"].as_map().unwrap()["s"], Value::from(14));
    }

    #[test]
    fn test_simple_data_arcs() {
        let schema = Schema::builder("owner")
            .data_state("owner", "string")
            .action("claim")
            .action("inspect")
            .arc(ArcDef::new("claim", "owner").with_value("who"))
            .arc(ArcDef::new("owner", "inspect").with_value("who"))
            .build()
            .unwrap();
        let mut runtime = Runtime::new(Arc::new(schema));
        runtime
            .execute_with_bindings("claim", &bind(&[("who", "alice".into())]))
            .unwrap();
        assert_eq!(runtime.data("owner"), Some(&Value::from("alice")));

        runtime
            .execute_with_bindings("inspect", &bind(&[("who", "mallory".into())]))
            .unwrap();
        assert_eq!(runtime.data("owner"), Some(&Value::from("alice")));
    }

    fn guarded_counter() -> Runtime {
        let schema = Schema::builder("bounded")
            .token_state("slots", 2)
            .token_state("used", 0)
            .action("take")
            .flow("slots", "take")
            .flow("take", "used")
            .constraint("max_one", "used <= 1")
            .build()
            .unwrap();
        Runtime::new(Arc::new(schema))
    }

    #[test]
    fn test_constraint_violation_rolls_back() {
        let mut runtime = guarded_counter();
        runtime.execute("take").unwrap();
        let before = runtime.snapshot().clone();

        let err = runtime.execute("take").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConstraintViolated);
        assert_eq!(err.entity_id(), Some("max_one"));
        assert_eq!(runtime.snapshot(), &before);
    }

    #[test]
    fn test_constraint_checking_can_be_disabled() {
        let mut runtime = guarded_counter();
        runtime.set_check_constraints(false);
        runtime.execute("take").unwrap();
        runtime.execute("take").unwrap();
        assert_eq!(runtime.tokens("used"), 2);

        let violations = runtime.constraints();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].constraint_id, "max_one");
        assert!(!violations[0].is_evaluation_error());
    }

    #[test]
    fn test_constraint_evaluation_error() {
        let schema = Schema::builder("broken")
            .token_state("a", 1)
            .action("t")
            .flow("a", "t")
            .constraint("bad", "missing > 0")
            .build()
            .unwrap();
        let mut runtime = Runtime::new(Arc::new(schema));
        assert!(runtime.constraints()[0].is_evaluation_error());
        assert_eq!(runtime.execute("t").unwrap_err().code(), ErrorCode::ConstraintEvaluation);
        assert_eq!(runtime.tokens("a"), 1);
    }

    #[test]
    fn test_without_evaluator_skips_guards() {
        let schema = token_runtime().schema().clone();
        let mut runtime = Runtime::without_evaluator(schema);
        let bindings = bind(&[("from", "a".into()), ("to", "b".into()), ("amount", 3.into())]);
        runtime.execute_with_bindings("transfer", &bindings).unwrap();
        let balances = runtime.data("balances").unwrap().as_map().unwrap();
        assert_eq!(balances["a"], Value::from(-3));
    }

    #[test]
    fn test_enabled_actions_and_reachability() {
        let schema = Schema::builder("pipeline")
            .token_state("todo", 2)
            .token_state("doing", 0)
            .token_state("done", 0)
            .action("start")
            .action("finish")
            .flow("todo", "start")
            .flow("start", "doing")
            .flow("doing", "finish")
            .flow("finish", "done")
            .build()
            .unwrap();
        let runtime = Runtime::new(Arc::new(schema));
        assert_eq!(runtime.enabled_actions(), vec!["start".to_string()]);

        let all_done = BTreeMap::from([("done".to_string(), 2)]);
        assert!(runtime.can_reach(&all_done, 4));
        assert!(!runtime.can_reach(&all_done, 3));
        assert!(!runtime.can_reach(&BTreeMap::from([("done".to_string(), 3)]), 10));
    }
}
