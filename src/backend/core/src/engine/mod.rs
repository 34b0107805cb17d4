//! # Execution Engine
//!
//! Binds a [`Schema`] to an [`EventStore`]. Each aggregate id gets its own
//! [`Runtime`], rebuilt by replaying the aggregate's stream and cached behind
//! a per-aggregate lock.
//!
//! A command runs as replay-then-append: catch the runtime up with the
//! stream tail, execute the action in memory, then append the resulting
//! event expecting the version the runtime was built from. A concurrent
//! writer makes the append fail with `ConcurrencyConflict` and the in-memory
//! change is undone.

pub mod naming;

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{ErrorCode, PetriError, Result};
use crate::events::{Event, EventMetadata, EventStore, StateSnapshot, NO_STREAM};
use crate::expr::{bindings_from_json, bindings_to_json, Bindings};
use crate::petri::{ExprEvaluator, GuardEvaluator, Runtime, Schema, Snapshot};
use crate::telemetry::metrics::{
    ACTIONS_EXECUTED, ACTIONS_REJECTED, ACTION_DURATION, REPLAY_FAILURES, SNAPSHOTS_SAVED,
};

pub use naming::{action_to_event_type, event_type_to_action, EventTypes};

// ═══════════════════════════════════════════════════════════════════════════════
// Aggregate State
// ═══════════════════════════════════════════════════════════════════════════════

/// Point-in-time view of one aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateState {
    pub aggregate_id: String,
    /// Version of the last replayed event, [`NO_STREAM`] for a new aggregate.
    pub version: i64,
    pub snapshot: Snapshot,
}

struct Instance {
    runtime: Runtime,
    version: i64,
    loaded: bool,
}

impl Instance {
    fn view(&self, aggregate_id: &str) -> AggregateState {
        AggregateState {
            aggregate_id: aggregate_id.to_string(),
            version: self.version,
            snapshot: self.runtime.snapshot().clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Event-sourced executor for one schema.
pub struct Engine {
    schema: Arc<Schema>,
    store: Arc<dyn EventStore>,
    evaluator: Arc<dyn GuardEvaluator>,
    event_types: EventTypes,
    aggregates: DashMap<String, Arc<RwLock<Instance>>>,
    config: EngineConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("schema", &self.schema.name())
            .field("store", &self.store.name())
            .field("cached_aggregates", &self.aggregates.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Engine {
    pub fn new(schema: impl Into<Arc<Schema>>, store: Arc<dyn EventStore>) -> Self {
        let schema = schema.into();
        let event_types = EventTypes::from_schema(&schema);
        Self {
            schema,
            store,
            evaluator: Arc::new(ExprEvaluator::new()),
            event_types,
            aggregates: DashMap::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the guard evaluator. Applies to aggregates loaded afterwards.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn GuardEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_types(&self) -> &EventTypes {
        &self.event_types
    }

    /// Number of aggregates with a cached runtime.
    pub fn cached(&self) -> usize {
        self.aggregates.len()
    }

    /// Drop the cached runtime of an aggregate. Returns whether one was cached.
    pub fn evict(&self, aggregate_id: &str) -> bool {
        self.aggregates.remove(aggregate_id).is_some()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading & Replay
    // ─────────────────────────────────────────────────────────────────────────

    fn new_instance(&self) -> Instance {
        let mut runtime = Runtime::with_evaluator(self.schema.clone(), self.evaluator.clone());
        runtime.set_check_constraints(self.config.check_constraints);
        Instance {
            runtime,
            version: NO_STREAM,
            loaded: false,
        }
    }

    fn instance(&self, aggregate_id: &str) -> Arc<RwLock<Instance>> {
        self.aggregates
            .entry(aggregate_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(self.new_instance())))
            .clone()
    }

    fn cached_instance(&self, aggregate_id: &str) -> Option<Arc<RwLock<Instance>>> {
        self.aggregates.get(aggregate_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop a cache entry whose aggregate still has no events.
    async fn forget_if_empty(&self, aggregate_id: &str, handle: &Arc<RwLock<Instance>>) {
        if handle.read().await.version == NO_STREAM {
            self.aggregates
                .remove_if(aggregate_id, |_, cached| Arc::ptr_eq(cached, handle));
        }
    }

    /// Bring an instance up to the stream tail. Returns how many events were replayed.
    async fn sync(&self, aggregate_id: &str, instance: &mut Instance) -> Result<usize> {
        if !instance.loaded {
            if let Some(saved) = self.store.load_snapshot(aggregate_id).await? {
                match serde_json::from_value::<Snapshot>(saved.state) {
                    Ok(snapshot) => {
                        instance.runtime.restore(snapshot);
                        instance.version = saved.version;
                        debug!(aggregate_id, version = saved.version, "restored from snapshot");
                    }
                    Err(e) => warn!(aggregate_id, error = %e, "unreadable snapshot ignored"),
                }
            }
            instance.loaded = true;
        }

        let events = self.store.read(aggregate_id, instance.version + 1).await?;
        if events.is_empty() {
            return Ok(0);
        }

        instance.runtime.set_check_constraints(false);
        for event in &events {
            self.replay(aggregate_id, &mut instance.runtime, event);
            instance.version = event.version;
        }
        instance.runtime.set_check_constraints(self.config.check_constraints);

        debug!(aggregate_id, replayed = events.len(), version = instance.version, "aggregate caught up");
        Ok(events.len())
    }

    /// Re-execute a stored event. Failures are logged and skipped.
    fn replay(&self, aggregate_id: &str, runtime: &mut Runtime, event: &Event) {
        let action_id = self.event_types.action(&event.event_type);
        let bindings = bindings_from_json(&event.data);
        if let Err(e) = runtime.execute_with_bindings(&action_id, &bindings) {
            counter!(REPLAY_FAILURES).increment(1);
            warn!(
                aggregate_id,
                event_type = %event.event_type,
                version = event.version,
                action_id = %action_id,
                error = %e,
                "event replay failed, skipping"
            );
        }
    }

    /// Load or refresh an aggregate from the store and return its state.
    #[instrument(skip(self))]
    pub async fn load_state(&self, aggregate_id: &str) -> Result<AggregateState> {
        match self.cached_instance(aggregate_id) {
            Some(handle) => {
                let mut instance = handle.write().await;
                self.sync(aggregate_id, &mut instance).await?;
                Ok(instance.view(aggregate_id))
            }
            None => self.inspect(aggregate_id, |instance| instance.view(aggregate_id)).await,
        }
    }

    /// Run `f` on the loaded state of an aggregate. Aggregates without
    /// events are built on the fly and not cached.
    async fn inspect<T>(&self, aggregate_id: &str, f: impl FnOnce(&Instance) -> T) -> Result<T> {
        let handle = match self.cached_instance(aggregate_id) {
            Some(handle) => handle,
            None => {
                let mut fresh = self.new_instance();
                self.sync(aggregate_id, &mut fresh).await?;
                if fresh.version == NO_STREAM {
                    return Ok(f(&fresh));
                }
                self.aggregates
                    .entry(aggregate_id.to_string())
                    .or_insert_with(|| Arc::new(RwLock::new(fresh)))
                    .clone()
            }
        };

        let loaded = handle.read().await.loaded;
        if !loaded {
            let mut instance = handle.write().await;
            if !instance.loaded {
                self.sync(aggregate_id, &mut instance).await?;
            }
        }
        let instance = handle.read().await;
        Ok(f(&instance))
    }

    /// Cached state of an aggregate, loading it on first access.
    pub async fn state(&self, aggregate_id: &str) -> Result<AggregateState> {
        self.inspect(aggregate_id, |instance| instance.view(aggregate_id)).await
    }

    /// Actions enabled in the cached state of an aggregate.
    pub async fn enabled_actions(&self, aggregate_id: &str) -> Result<Vec<String>> {
        self.inspect(aggregate_id, |instance| instance.runtime.enabled_actions()).await
    }

    /// Every persisted event of an aggregate.
    pub async fn events(&self, aggregate_id: &str) -> Result<Vec<Event>> {
        self.store.read(aggregate_id, 0).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────

    /// Execute an action and persist its event. Returns the stored event.
    pub async fn execute(&self, aggregate_id: &str, action_id: &str, bindings: &Bindings) -> Result<Event> {
        self.execute_with_metadata(aggregate_id, action_id, bindings, None).await
    }

    #[instrument(skip(self, bindings, metadata))]
    pub async fn execute_with_metadata(
        &self,
        aggregate_id: &str,
        action_id: &str,
        bindings: &Bindings,
        metadata: Option<EventMetadata>,
    ) -> Result<Event> {
        let started = Instant::now();
        if self.schema.action(action_id).is_none() {
            let e = PetriError::action_not_found(action_id);
            e.log();
            return Err(e);
        }

        let handle = self.instance(aggregate_id);
        let result = self
            .execute_on(&handle, aggregate_id, action_id, bindings, metadata)
            .await;

        match &result {
            Ok(event) => {
                counter!(ACTIONS_EXECUTED, "action" => action_id.to_string()).increment(1);
                histogram!(ACTION_DURATION).record(started.elapsed().as_secs_f64());
                debug!(version = event.version, event_type = %event.event_type, "action executed");
            }
            Err(e) => {
                if e.code().is_rejection() {
                    counter!(ACTIONS_REJECTED, "action" => action_id.to_string()).increment(1);
                }
                e.log();
                self.forget_if_empty(aggregate_id, &handle).await;
            }
        }
        result
    }

    async fn execute_on(
        &self,
        handle: &RwLock<Instance>,
        aggregate_id: &str,
        action_id: &str,
        bindings: &Bindings,
        metadata: Option<EventMetadata>,
    ) -> Result<Event> {
        let mut instance = handle.write().await;
        self.sync(aggregate_id, &mut instance).await?;

        if !instance.runtime.enabled(action_id) {
            return Err(PetriError::action_not_enabled(action_id));
        }
        let before = instance.runtime.snapshot().clone();
        instance.runtime.execute_with_bindings(action_id, bindings)?;

        let mut event = Event::new(
            aggregate_id,
            self.event_types.event_type(action_id),
            bindings_to_json(bindings),
        );
        if let Some(metadata) = metadata {
            event = event.with_metadata(metadata);
        }

        let expected = instance.version;
        let version = match self.store.append(aggregate_id, expected, vec![event.clone()]).await {
            Ok(version) => version,
            Err(e) => {
                instance.runtime.restore(before);
                return Err(e);
            }
        };
        event.version = version;
        instance.version = version;

        self.maybe_snapshot(aggregate_id, &instance).await;
        Ok(event)
    }

    /// [`Engine::execute`], reloading and retrying on concurrency conflicts
    /// up to `max_retries` times.
    pub async fn execute_with_retry(&self, aggregate_id: &str, action_id: &str, bindings: &Bindings) -> Result<Event> {
        let mut attempt = 0;
        loop {
            match self.execute(aggregate_id, action_id, bindings).await {
                Err(e) if e.code() == ErrorCode::ConcurrencyConflict && attempt < self.config.max_retries => {
                    attempt += 1;
                    debug!(aggregate_id, action_id, attempt, "concurrency conflict, retrying");
                }
                result => return result,
            }
        }
    }

    async fn maybe_snapshot(&self, aggregate_id: &str, instance: &Instance) {
        let Some(interval) = self.config.snapshot_interval.filter(|n| *n > 0) else {
            return;
        };
        if (instance.version + 1) as u64 % interval != 0 {
            return;
        }

        let state = match serde_json::to_value(instance.runtime.snapshot()) {
            Ok(state) => state,
            Err(e) => {
                warn!(aggregate_id, error = %e, "snapshot serialization failed");
                return;
            }
        };
        match self
            .store
            .save_snapshot(StateSnapshot::new(aggregate_id, instance.version, state))
            .await
        {
            Ok(()) => {
                counter!(SNAPSHOTS_SAVED).increment(1);
                debug!(aggregate_id, version = instance.version, "snapshot saved");
            }
            Err(e) => warn!(aggregate_id, error = %e, "snapshot save failed"),
        }
    }
}
