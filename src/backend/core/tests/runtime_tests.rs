//! Integration tests for the Petri-net runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use petri_core::error::ErrorCode;
use petri_core::expr::{bindings_from_json, Bindings, Value};
use petri_core::petri::{ArcDef, Runtime, Schema, State};
use serde_json::json;

fn order_schema() -> Arc<Schema> {
    Arc::new(
        Schema::builder("order")
            .token_state("pending", 1)
            .token_state("confirmed", 0)
            .action("confirm")
            .flow("pending", "confirm")
            .flow("confirm", "confirmed")
            .build()
            .unwrap(),
    )
}

fn bank_schema() -> Arc<Schema> {
    let schema = Schema::builder("bank")
        .state(State::data("balances", "map[string]int64").with_initial(json!({"a": 10})))
        .guarded_action("transfer", "balances[from] >= amount")
        .arc(ArcDef::new("balances", "transfer").with_keys(["from"]))
        .arc(ArcDef::new("transfer", "balances").with_keys(["to"]))
        .build()
        .unwrap();
    Arc::new(schema)
}

fn balance(runtime: &Runtime, who: &str) -> Option<f64> {
    runtime
        .data("balances")
        .and_then(Value::as_map)
        .and_then(|m| m.get(who))
        .and_then(Value::as_f64)
}

#[test]
fn test_confirm_scenario() {
    let mut runtime = Runtime::new(order_schema());
    assert!(runtime.enabled("confirm"));

    runtime.execute("confirm").unwrap();
    assert_eq!(runtime.tokens("pending"), 0);
    assert_eq!(runtime.tokens("confirmed"), 1);

    let err = runtime.execute("confirm").unwrap_err();
    assert_eq!(err.code(), ErrorCode::ActionNotEnabled);
}

#[test]
fn test_transfer_scenario() {
    let mut runtime = Runtime::new(bank_schema());
    let bindings = bindings_from_json(&json!({"from": "a", "to": "b", "amount": 5}));

    runtime.execute_with_bindings("transfer", &bindings).unwrap();
    assert_eq!(balance(&runtime, "a"), Some(5.0));
    assert_eq!(balance(&runtime, "b"), Some(5.0));

    let overdraw = bindings_from_json(&json!({"from": "a", "to": "b", "amount": 6}));
    let err = runtime.execute_with_bindings("transfer", &overdraw).unwrap_err();
    assert_eq!(err.code(), ErrorCode::GuardNotSatisfied);
    assert_eq!(balance(&runtime, "a"), Some(5.0));
}

#[test]
fn test_unbound_guard_identifier() {
    let mut runtime = Runtime::new(bank_schema());
    let bindings = bindings_from_json(&json!({"from": "a", "to": "b"}));
    let err = runtime.execute_with_bindings("transfer", &bindings).unwrap_err();
    assert_eq!(err.code(), ErrorCode::GuardEvaluation);
}

#[test]
fn test_token_conservation_with_weights() {
    let schema = Schema::builder("batch")
        .token_state("raw", 7)
        .token_state("packed", 0)
        .action("pack")
        .arc(ArcDef::new("raw", "pack").with_weight(3))
        .arc(ArcDef::new("pack", "packed"))
        .build()
        .unwrap();
    let mut runtime = Runtime::new(Arc::new(schema));

    runtime.execute("pack").unwrap();
    runtime.execute("pack").unwrap();
    assert_eq!(runtime.tokens("raw"), 1);
    assert_eq!(runtime.tokens("packed"), 2);

    let before = runtime.snapshot().clone();
    assert_eq!(runtime.execute("pack").unwrap_err().code(), ErrorCode::ActionNotEnabled);
    assert_eq!(runtime.snapshot(), &before);
    assert_eq!(
        serde_json::to_string(runtime.snapshot()).unwrap(),
        serde_json::to_string(&before).unwrap()
    );
}

#[test]
fn test_simple_type_input_is_read_only() {
    let schema = Schema::builder("settings")
        .state(State::data("limit", "int64").with_initial(10))
        .action("observe")
        .action("set")
        .arc(ArcDef::new("limit", "observe"))
        .arc(ArcDef::new("set", "limit"))
        .build()
        .unwrap();
    let mut runtime = Runtime::new(Arc::new(schema));

    runtime
        .execute_with_bindings("observe", &bindings_from_json(&json!({"amount": 4})))
        .unwrap();
    assert_eq!(runtime.data("limit"), Some(&Value::from(10)));

    runtime
        .execute_with_bindings("set", &bindings_from_json(&json!({"amount": 4})))
        .unwrap();
    assert_eq!(runtime.data("limit"), Some(&Value::from(4)));
}

#[test]
fn test_two_key_map_transform() {
    let schema = Schema::builder("allowances")
        .data_state("allowances", "map[string]map[string]int64")
        .action("approve")
        .arc(ArcDef::new("approve", "allowances").with_keys(["owner", "spender"]))
        .build()
        .unwrap();
    let mut runtime = Runtime::new(Arc::new(schema));
    let bindings = bindings_from_json(&json!({"owner": "alice", "spender": "bob", "amount": 3}));

    runtime.execute_with_bindings("approve", &bindings).unwrap();
    runtime.execute_with_bindings("approve", &bindings).unwrap();

    let nested = runtime.data("allowances").and_then(Value::as_map).unwrap()["alice"].clone();
    assert_eq!(nested.as_map().unwrap()["bob"], Value::from(6));
}

#[test]
fn test_inhibitor_arc() {
    let schema = Schema::builder("gate")
        .token_state("locked", 1)
        .token_state("ready", 1)
        .token_state("done", 0)
        .action("run")
        .action("unlock")
        .inhibitor("locked", "run")
        .flow("ready", "run")
        .flow("run", "done")
        .flow("locked", "unlock")
        .build()
        .unwrap();
    let mut runtime = Runtime::new(Arc::new(schema));

    assert!(!runtime.enabled("run"));
    assert_eq!(runtime.enabled_actions(), vec!["unlock".to_string()]);

    runtime.execute("unlock").unwrap();
    runtime.execute("run").unwrap();
    assert_eq!(runtime.tokens("locked"), 0);
    assert_eq!(runtime.tokens("done"), 1);
}

#[test]
fn test_constraint_violation_rolls_back() {
    let schema = Schema::builder("stock")
        .token_state("items", 2)
        .action("restock")
        .flow("restock", "items")
        .constraint("capacity", "items <= 3")
        .build()
        .unwrap();
    let mut runtime = Runtime::new(Arc::new(schema));

    runtime.execute("restock").unwrap();
    let err = runtime.execute("restock").unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConstraintViolated);
    assert_eq!(err.entity_id(), Some("capacity"));
    assert_eq!(runtime.tokens("items"), 3);
    assert!(runtime.constraints().is_empty());

    runtime.set_check_constraints(false);
    runtime.execute("restock").unwrap();
    let violations = runtime.constraints();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].constraint_id, "capacity");
}

#[test]
fn test_without_evaluator_skips_guards() {
    let mut runtime = Runtime::without_evaluator(bank_schema());
    let bindings = bindings_from_json(&json!({"from": "a", "to": "b", "amount": 50}));
    runtime.execute_with_bindings("transfer", &bindings).unwrap();
    assert_eq!(balance(&runtime, "a"), Some(-40.0));
}

#[test]
fn test_can_reach() {
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

    let all_done = BTreeMap::from([("done".to_string(), 2), ("todo".to_string(), 0)]);
    assert!(runtime.can_reach(&all_done, 4));
    assert!(!runtime.can_reach(&all_done, 3));

    let impossible = BTreeMap::from([("done".to_string(), 3)]);
    assert!(!runtime.can_reach(&impossible, 10));
    // probing leaves the runtime untouched
    assert_eq!(runtime.tokens("todo"), 2);
}

#[test]
fn test_schema_from_json() {
    let schema = Schema::from_json(
        r#"{
            "name": "wallet",
            "version": "1.0.0",
            "states": [
                {"id": "balances", "kind": "data", "type": "map[string]int64", "exported": true},
                {"id": "active", "initial": 1}
            ],
            "actions": [
                {"id": "mint", "guard": "amount > 0", "bindings": [{"name": "to", "type": "string"}]}
            ],
            "arcs": [
                {"source": "active", "target": "mint"},
                {"source": "mint", "target": "active"},
                {"source": "mint", "target": "balances", "keys": ["to"]}
            ],
            "constraints": [{"id": "alive", "expr": "active == 1"}]
        }"#,
    )
    .unwrap();
    assert_eq!(schema.version(), Some("1.0.0"));
    assert_eq!(schema.inputs("mint").count(), 1);
    assert_eq!(schema.outputs("mint").count(), 2);

    let mut runtime = Runtime::new(Arc::new(schema));
    let bindings: Bindings = bindings_from_json(&json!({"to": "z", "amount": 9}));
    runtime.execute_with_bindings("mint", &bindings).unwrap();
    assert_eq!(balance(&runtime, "z"), Some(9.0));
}

#[test]
fn test_invalid_schemas_rejected() {
    let dangling = Schema::builder("bad").action("go").flow("nowhere", "go").build();
    assert_eq!(dangling.unwrap_err().code(), ErrorCode::SchemaValidation);

    let bad_guard = Schema::builder("bad").guarded_action("go", "x >").build();
    assert_eq!(bad_guard.unwrap_err().code(), ErrorCode::SchemaValidation);

    let three_keys = Schema::builder("bad")
        .data_state("m", "map[string]int64")
        .action("go")
        .arc(ArcDef::new("go", "m").with_keys(["a", "b", "c"]))
        .build();
    assert_eq!(three_keys.unwrap_err().code(), ErrorCode::SchemaValidation);
}
