#![allow(clippy::result_large_err)]
//! # Petri Core
//!
//! Execution substrate for declarative Petri-net models.
//!
//! ## Architecture
//!
//! - **Expressions**: Lexer, parser and evaluator for guard and constraint expressions
//! - **Petri Runtime**: Token and data states, arcs, guards, constraints and reachability
//! - **Event Log**: Append-only streams with optimistic concurrency, subscriptions and
//!   snapshots, backed by memory or SQLite
//! - **Engine**: Event-sourced execution of schema actions per aggregate
//! - **State Machines**: Place/transition aggregates with two-phase fire and apply
//! - **Telemetry**: Structured logging and metric definitions

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod expr;
pub mod petri;
pub mod telemetry;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, PetriError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{open_store, Config, EngineConfig, StoreBackend, StoreConfig};
    pub use crate::engine::{AggregateState, Engine};
    pub use crate::error::{ErrorCode, PetriError, Result};
    pub use crate::events::{
        Aggregate, Event, EventFilter, EventMetadata, EventStore, InMemoryEventStore, SqliteEventStore,
        StateMachine, StateSnapshot, Subscription, Transition, NO_STREAM,
    };
    pub use crate::expr::{bindings_from_json, compile, Bindings, CompiledExpr, FunctionRegistry, Value};
    pub use crate::petri::{Action, ArcDef, ExprEvaluator, GuardEvaluator, Runtime, Schema, Snapshot, State};
}
