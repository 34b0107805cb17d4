//! Append-only event log.
//!
//! Events are grouped into streams, one per aggregate instance. Each stream
//! is versioned from 0 and appends use optimistic concurrency: the caller
//! states the version it last saw and the append fails with
//! `ConcurrencyConflict` if the stream moved on.
//!
//! Two backends implement [`EventStore`]:
//!
//! - [`InMemoryEventStore`] for tests and ephemeral instances
//! - [`SqliteEventStore`] for durable storage
//!
//! Both support live [`Subscription`]s and per-stream [`StateSnapshot`]s.

pub mod aggregate;
pub mod event;
pub mod memory;
pub mod sqlite;
pub mod store;
pub mod subscription;

pub use aggregate::{commit, load, Aggregate, Guard, Handler, StateMachine, Transition};
pub use event::{Event, EventFilter, EventId, EventMetadata, StateSnapshot, NO_STREAM};
pub use memory::InMemoryEventStore;
pub use sqlite::{InstancePage, InstanceSummary, SqliteEventStore, StoreStats};
pub use store::EventStore;
pub use subscription::{Subscription, SubscriptionHub, DEFAULT_SUBSCRIPTION_BUFFER};
