//! Static model definitions: states, actions, arcs and constraints.
//!
//! A [`Schema`] is validated once when it is built and is read-only
//! afterwards. It deserializes from the JSON shape the model bridge emits:
//!
//! ```json
//! {
//!   "name": "token",
//!   "states": [
//!     { "id": "balances", "kind": "data", "type": "map[string]int64" }
//!   ],
//!   "actions": [
//!     { "id": "transfer", "guard": "balances[from] >= amount" }
//!   ],
//!   "arcs": [
//!     { "source": "balances", "target": "transfer", "keys": ["from"] },
//!     { "source": "transfer", "target": "balances", "keys": ["to"] }
//!   ]
//! }
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{PetriError, Result};
use crate::expr::{self, Value};

/// Maximum number of binding keys on a data arc (two-level nested maps).
pub const MAX_ARC_KEYS: usize = 2;

/// Binding name used for a data arc's value when none is declared.
pub const DEFAULT_VALUE_BINDING: &str = "amount";

// ═══════════════════════════════════════════════════════════════════════════════
// States
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    /// Non-negative token count.
    #[default]
    Token,
    /// Typed structured data.
    Data,
}

/// A named place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: String,

    #[serde(default)]
    pub kind: StateKind,

    /// Initial token count for token states, initial value for data states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<Value>,

    /// Type descriptor for data states, e.g. `int64` or `map[string]map[string]int64`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,

    #[serde(default)]
    pub exported: bool,
}

impl State {
    pub fn token(id: impl Into<String>, initial: i64) -> Self {
        Self {
            id: id.into(),
            kind: StateKind::Token,
            initial: Some(Value::from(initial)),
            type_name: None,
            exported: false,
        }
    }

    pub fn data(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: StateKind::Data,
            initial: None,
            type_name: Some(type_name.into()),
            exported: false,
        }
    }

    pub fn with_initial(mut self, initial: impl Into<Value>) -> Self {
        self.initial = Some(initial.into());
        self
    }

    pub fn exported(mut self) -> Self {
        self.exported = true;
        self
    }

    pub fn is_token(&self) -> bool {
        self.kind == StateKind::Token
    }

    pub fn is_data(&self) -> bool {
        self.kind == StateKind::Data
    }

    /// Whether this data state holds a key-value mapping.
    pub fn is_map(&self) -> bool {
        self.is_data()
            && self
                .type_name
                .as_deref()
                .is_some_and(|t| t.trim_start().starts_with("map"))
    }

    /// Initial token count; zero when undeclared.
    pub fn initial_tokens(&self) -> i64 {
        self.initial.as_ref().and_then(Value::as_i64).unwrap_or(0)
    }

    /// Initial data value: the declared one, else the zero value of the type.
    pub fn initial_value(&self) -> Value {
        match &self.initial {
            Some(value) => value.clone(),
            None => zero_value(self.type_name.as_deref().unwrap_or("")),
        }
    }
}

/// Zero value for a type descriptor.
pub fn zero_value(type_name: &str) -> Value {
    let t = type_name.trim();
    if t.starts_with("map") {
        return Value::empty_map();
    }
    if t.starts_with("[]") {
        return Value::List(Vec::new());
    }
    match t {
        "string" => Value::String(String::new()),
        "bool" | "boolean" => Value::Bool(false),
        "int" | "int32" | "int64" | "uint" | "uint32" | "uint64" | "float" | "float32" | "float64"
        | "number" | "integer" => Value::zero(),
        _ => Value::Null,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Actions
// ═══════════════════════════════════════════════════════════════════════════════

/// A declared action parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
}

/// A guarded state transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,

    /// Event type recorded when this action fires. Derived from the id when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

impl Action {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            guard: None,
            bindings: Vec::new(),
            event_type: None,
        }
    }

    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    pub fn with_binding(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.bindings.push(Binding {
            name: name.into(),
            type_name: Some(type_name.into()),
        });
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Arcs
// ═══════════════════════════════════════════════════════════════════════════════

fn default_weight() -> i64 {
    1
}

fn default_value_binding() -> String {
    DEFAULT_VALUE_BINDING.to_string()
}

/// A directed edge between a state and an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcDef {
    pub source: String,
    pub target: String,

    /// Tokens moved along a token arc.
    #[serde(default = "default_weight")]
    pub weight: i64,

    /// Binding names used as map keys on a data arc, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,

    /// Binding name holding the value a data arc writes.
    #[serde(default = "default_value_binding")]
    pub value: String,

    /// Blocks the target action while the source token state is non-empty.
    #[serde(default)]
    pub inhibitor: bool,
}

impl ArcDef {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            weight: default_weight(),
            keys: Vec::new(),
            value: default_value_binding(),
            inhibitor: false,
        }
    }

    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    pub fn inhibitor(mut self) -> Self {
        self.inhibitor = true;
        self
    }
}

/// A named invariant over token counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    pub expr: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schema
// ═══════════════════════════════════════════════════════════════════════════════

/// The serialized form of a schema, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub states: Vec<State>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub arcs: Vec<ArcDef>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

/// A validated, indexed model definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "SchemaDef", into = "SchemaDef")]
pub struct Schema {
    def: SchemaDef,
    states: HashMap<String, usize>,
    actions: HashMap<String, usize>,
    inputs: HashMap<String, Vec<usize>>,
    outputs: HashMap<String, Vec<usize>>,
}

impl TryFrom<SchemaDef> for Schema {
    type Error = PetriError;

    fn try_from(def: SchemaDef) -> Result<Self> {
        Schema::from_def(def)
    }
}

impl From<Schema> for SchemaDef {
    fn from(schema: Schema) -> Self {
        schema.def
    }
}

impl Schema {
    /// Validate a definition and build its indexes.
    pub fn from_def(def: SchemaDef) -> Result<Self> {
        validate(&def)?;

        let states = def.states.iter().enumerate().map(|(i, s)| (s.id.clone(), i)).collect();
        let actions: HashMap<String, usize> =
            def.actions.iter().enumerate().map(|(i, a)| (a.id.clone(), i)).collect();

        let mut inputs: HashMap<String, Vec<usize>> = HashMap::new();
        let mut outputs: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, arc) in def.arcs.iter().enumerate() {
            if actions.contains_key(&arc.target) {
                inputs.entry(arc.target.clone()).or_default().push(i);
            } else {
                outputs.entry(arc.source.clone()).or_default().push(i);
            }
        }

        Ok(Self {
            def,
            states,
            actions,
            inputs,
            outputs,
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let def: SchemaDef = serde_json::from_str(json)?;
        Self::from_def(def)
    }

    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn version(&self) -> Option<&str> {
        self.def.version.as_deref()
    }

    pub fn definition(&self) -> &SchemaDef {
        &self.def
    }

    pub fn states(&self) -> &[State] {
        &self.def.states
    }

    pub fn actions(&self) -> &[Action] {
        &self.def.actions
    }

    pub fn arcs(&self) -> &[ArcDef] {
        &self.def.arcs
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.def.constraints
    }

    pub fn state(&self, id: &str) -> Option<&State> {
        self.states.get(id).map(|&i| &self.def.states[i])
    }

    pub fn action(&self, id: &str) -> Option<&Action> {
        self.actions.get(id).map(|&i| &self.def.actions[i])
    }

    /// Arcs flowing from states into `action_id`, in declaration order.
    pub fn inputs<'a>(&'a self, action_id: &str) -> impl Iterator<Item = &'a ArcDef> + 'a {
        self.arc_slice(&self.inputs, action_id)
    }

    /// Arcs flowing from `action_id` into states, in declaration order.
    pub fn outputs<'a>(&'a self, action_id: &str) -> impl Iterator<Item = &'a ArcDef> + 'a {
        self.arc_slice(&self.outputs, action_id)
    }

    fn arc_slice<'a>(
        &'a self,
        index: &'a HashMap<String, Vec<usize>>,
        action_id: &str,
    ) -> impl Iterator<Item = &'a ArcDef> + 'a {
        index
            .get(action_id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.def.arcs[i])
    }
}

/// Check a definition for structural errors.
pub fn validate(def: &SchemaDef) -> Result<()> {
    let mut states: HashMap<&str, &State> = HashMap::new();
    for state in &def.states {
        if state.id.is_empty() {
            return Err(PetriError::schema_validation("state id must not be empty"));
        }
        if states.insert(state.id.as_str(), state).is_some() {
            return Err(PetriError::schema_validation(format!("duplicate state '{}'", state.id)));
        }
        if state.is_token() {
            match &state.initial {
                None => {}
                Some(Value::Number(n)) if *n >= 0.0 && n.fract() == 0.0 => {}
                Some(other) => {
                    return Err(PetriError::schema_validation(format!(
                        "token state '{}' has invalid initial count {}",
                        state.id, other
                    )))
                }
            }
        }
    }

    let mut actions: HashSet<&str> = HashSet::new();
    for action in &def.actions {
        if action.id.is_empty() {
            return Err(PetriError::schema_validation("action id must not be empty"));
        }
        if states.contains_key(action.id.as_str()) {
            return Err(PetriError::schema_validation(format!(
                "'{}' is declared as both a state and an action",
                action.id
            )));
        }
        if !actions.insert(action.id.as_str()) {
            return Err(PetriError::schema_validation(format!("duplicate action '{}'", action.id)));
        }
        if let Some(guard) = &action.guard {
            expr::compile(guard).map_err(|e| {
                PetriError::schema_validation(format!("guard of action '{}' does not compile: {}", action.id, e))
            })?;
        }
    }

    for arc in &def.arcs {
        let (state_id, into_action) = match (
            states.contains_key(arc.source.as_str()),
            actions.contains(arc.target.as_str()),
            actions.contains(arc.source.as_str()),
            states.contains_key(arc.target.as_str()),
        ) {
            (true, true, _, _) => (arc.source.as_str(), true),
            (_, _, true, true) => (arc.target.as_str(), false),
            _ => {
                return Err(PetriError::schema_validation(format!(
                    "arc {} -> {} must connect a declared state and a declared action",
                    arc.source, arc.target
                )))
            }
        };
        let state = states[state_id];

        if state.is_token() && arc.weight < 1 {
            return Err(PetriError::schema_validation(format!(
                "arc {} -> {} has weight {}, expected at least 1",
                arc.source, arc.target, arc.weight
            )));
        }
        if arc.keys.len() > MAX_ARC_KEYS {
            return Err(PetriError::schema_validation(format!(
                "arc {} -> {} has {} keys, at most {} are supported",
                arc.source,
                arc.target,
                arc.keys.len(),
                MAX_ARC_KEYS
            )));
        }
        if arc.inhibitor && !(into_action && state.is_token()) {
            return Err(PetriError::schema_validation(format!(
                "inhibitor arc {} -> {} must run from a token state into an action",
                arc.source, arc.target
            )));
        }
    }

    let mut constraints: HashSet<&str> = HashSet::new();
    for constraint in &def.constraints {
        if !constraints.insert(constraint.id.as_str()) {
            return Err(PetriError::schema_validation(format!(
                "duplicate constraint '{}'",
                constraint.id
            )));
        }
        expr::compile(&constraint.expr).map_err(|e| {
            PetriError::schema_validation(format!("constraint '{}' does not compile: {}", constraint.id, e))
        })?;
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Fluent construction of a [`Schema`].
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    def: SchemaDef,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            def: SchemaDef {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.def.version = Some(version.into());
        self
    }

    pub fn state(mut self, state: State) -> Self {
        self.def.states.push(state);
        self
    }

    pub fn token_state(self, id: impl Into<String>, initial: i64) -> Self {
        self.state(State::token(id, initial))
    }

    pub fn data_state(self, id: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.state(State::data(id, type_name))
    }

    pub fn action(mut self, action: impl Into<Action>) -> Self {
        self.def.actions.push(action.into());
        self
    }

    pub fn guarded_action(self, id: impl Into<String>, guard: impl Into<String>) -> Self {
        self.action(Action::new(id).with_guard(guard))
    }

    pub fn arc(mut self, arc: impl Into<ArcDef>) -> Self {
        self.def.arcs.push(arc.into());
        self
    }

    pub fn flow(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.arc(ArcDef::new(source, target))
    }

    pub fn inhibitor(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.arc(ArcDef::new(source, target).inhibitor())
    }

    pub fn constraint(mut self, id: impl Into<String>, expr: impl Into<String>) -> Self {
        self.def.constraints.push(Constraint {
            id: id.into(),
            expr: expr.into(),
        });
        self
    }

    pub fn build(self) -> Result<Schema> {
        Schema::from_def(self.def)
    }
}

impl From<&str> for Action {
    fn from(id: &str) -> Self {
        Action::new(id)
    }
}

impl From<String> for Action {
    fn from(id: String) -> Self {
        Action::new(id)
    }
}

impl From<(&str, &str)> for ArcDef {
    fn from((source, target): (&str, &str)) -> Self {
        ArcDef::new(source, target)
    }
}
