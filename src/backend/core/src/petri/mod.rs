//! # Petri-Net Runtime
//!
//! Interprets a [`Schema`] of token and data states over a live [`Snapshot`].
//!
//! - **Token states** count tokens; input arcs consume, output arcs produce.
//! - **Data states** hold scalars or one/two-level maps updated through
//!   keyed data arcs.
//! - **Actions** fire when their token inputs are satisfied, no inhibitor
//!   source is marked and their guard (if any) holds.
//! - **Constraints** are re-checked after every firing; a failure rolls the
//!   snapshot back.

pub mod guard;
pub mod runtime;
pub mod schema;
pub mod snapshot;

pub use guard::{ExprEvaluator, GuardEvaluator};
pub use runtime::{ConstraintViolation, Runtime};
pub use schema::{
    zero_value, Action, ArcDef, Binding, Constraint, Schema, SchemaBuilder, SchemaDef, State, StateKind,
    DEFAULT_VALUE_BINDING, MAX_ARC_KEYS,
};
pub use snapshot::Snapshot;
