//! Integration tests for the execution engine.

use std::sync::Arc;
use std::time::Duration;

use petri_core::config::EngineConfig;
use petri_core::engine::Engine;
use petri_core::error::ErrorCode;
use petri_core::events::{EventFilter, EventStore, InMemoryEventStore, SqliteEventStore};
use petri_core::expr::{bindings_from_json, Bindings, Value};
use petri_core::petri::{ArcDef, Schema, State};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn wallet_schema() -> Schema {
    Schema::builder("wallet")
        .token_state("active", 1)
        .token_state("frozen", 0)
        .state(State::data("balances", "map[string]int64"))
        .action("mint")
        .guarded_action("transfer", "amount > 0 && balances[from] >= amount")
        .action("freeze")
        .arc(ArcDef::new("active", "mint"))
        .arc(ArcDef::new("mint", "active"))
        .arc(ArcDef::new("mint", "balances").with_keys(["to"]))
        .arc(ArcDef::new("active", "transfer"))
        .arc(ArcDef::new("transfer", "active"))
        .arc(ArcDef::new("balances", "transfer").with_keys(["from"]))
        .arc(ArcDef::new("transfer", "balances").with_keys(["to"]))
        .arc(ArcDef::new("active", "freeze"))
        .arc(ArcDef::new("freeze", "frozen"))
        .build()
        .unwrap()
}

fn b(value: serde_json::Value) -> Bindings {
    bindings_from_json(&value)
}

fn balance(engine_state: &petri_core::engine::AggregateState, who: &str) -> f64 {
    engine_state.snapshot.data["balances"]
        .as_map()
        .and_then(|m| m.get(who))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

#[tokio::test]
async fn test_wallet_lifecycle_on_sqlite() {
    let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::connect("sqlite::memory:").await.unwrap());
    let engine = Engine::new(wallet_schema(), store.clone());

    engine.execute("w-1", "mint", &b(json!({"to": "alice", "amount": 100}))).await.unwrap();
    engine
        .execute("w-1", "transfer", &b(json!({"from": "alice", "to": "bob", "amount": 30})))
        .await
        .unwrap();
    let rejected = engine
        .execute("w-1", "transfer", &b(json!({"from": "bob", "to": "alice", "amount": 31})))
        .await
        .unwrap_err();
    assert_eq!(rejected.code(), ErrorCode::GuardNotSatisfied);

    engine.execute("w-1", "freeze", &Bindings::new()).await.unwrap();
    let frozen = engine
        .execute("w-1", "mint", &b(json!({"to": "bob", "amount": 1})))
        .await
        .unwrap_err();
    assert_eq!(frozen.code(), ErrorCode::ActionNotEnabled);

    let types: Vec<String> = engine
        .events("w-1")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec!["Minted", "Transferred", "Freezed"]);

    let state = engine.state("w-1").await.unwrap();
    assert_eq!(state.version, 2);
    assert_eq!(balance(&state, "alice"), 70.0);
    assert_eq!(balance(&state, "bob"), 30.0);
    assert!(engine.enabled_actions("w-1").await.unwrap().is_empty());

    let replica = Engine::new(wallet_schema(), store);
    assert_eq!(replica.load_state("w-1").await.unwrap(), state);
}

#[tokio::test]
async fn test_aggregates_are_independent() {
    let engine = Engine::new(wallet_schema(), Arc::new(InMemoryEventStore::new()));
    engine.execute("w-1", "freeze", &Bindings::new()).await.unwrap();
    engine.execute("w-2", "mint", &b(json!({"to": "x", "amount": 1}))).await.unwrap();

    assert_eq!(engine.state("w-1").await.unwrap().snapshot.tokens("frozen"), 1);
    assert_eq!(engine.state("w-2").await.unwrap().snapshot.tokens("frozen"), 0);
    assert_eq!(engine.cached(), 2);
}

#[tokio::test]
async fn test_racing_engines_with_retry() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let config = EngineConfig {
        max_retries: 50,
        ..EngineConfig::default()
    };
    let engines: Vec<Arc<Engine>> = (0..4)
        .map(|_| Arc::new(Engine::new(wallet_schema(), store.clone()).with_config(config.clone())))
        .collect();

    let mut handles = Vec::new();
    for (i, engine) in engines.iter().enumerate() {
        let engine = Arc::clone(engine);
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                engine
                    .execute_with_retry("shared", "mint", &b(json!({"to": format!("u{i}"), "amount": 1})))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.stream_version("shared").await.unwrap(), 19);
    let fresh = Engine::new(wallet_schema(), store);
    let state = fresh.load_state("shared").await.unwrap();
    for i in 0..4 {
        assert_eq!(balance(&state, &format!("u{i}")), 5.0);
    }
}

#[tokio::test]
async fn test_engine_events_reach_subscribers() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let mut sub = store
        .subscribe(EventFilter::new().event_type("Minted"), CancellationToken::new())
        .await
        .unwrap();
    let engine = Engine::new(wallet_schema(), store);

    engine.execute("w-1", "freeze", &Bindings::new()).await.unwrap();
    engine.execute("w-2", "mint", &b(json!({"to": "x", "amount": 2}))).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
    assert_eq!(event.stream_id, "w-2");
    assert_eq!(event.data, json!({"to": "x", "amount": 2}));
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_snapshots_on_sqlite_file() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("wallet.db").display());
    let config = EngineConfig {
        snapshot_interval: Some(3),
        ..EngineConfig::default()
    };

    {
        let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::connect(&url).await.unwrap());
        let engine = Engine::new(wallet_schema(), store.clone()).with_config(config.clone());
        for n in 1..=7 {
            engine.execute("w", "mint", &b(json!({"to": "a", "amount": n}))).await.unwrap();
        }
        assert_eq!(store.load_snapshot("w").await.unwrap().unwrap().version, 5);
        store.close().await.unwrap();
    }

    let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::connect(&url).await.unwrap());
    let engine = Engine::new(wallet_schema(), store).with_config(config);
    let state = engine.load_state("w").await.unwrap();
    assert_eq!(state.version, 6);
    assert_eq!(balance(&state, "a"), 28.0);
}
