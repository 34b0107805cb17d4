//! Aggregates and a lightweight Petri-net state machine.
//!
//! [`StateMachine`] gives direct place/transition semantics without the
//! expression language. Firing is split in two so persistence can sit
//! between intent and effect:
//!
//! 1. [`StateMachine::fire`] checks inputs, inhibitors and the guard and
//!    returns an [`Event`] without touching any place.
//! 2. [`StateMachine::apply`] commits the transition's token deltas and runs
//!    the handler registered for the event type.
//!
//! [`commit`] and [`load`] connect any [`Aggregate`] to an [`EventStore`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument};

use super::event::{Event, NO_STREAM};
use super::store::{stamp_batch, EventStore};
use crate::error::{ErrorCode, PetriError, Result};

// =============================================================================
// Aggregate Trait
// =============================================================================

/// A domain object rebuilt by folding the events of one stream.
pub trait Aggregate: Send {
    fn stream_id(&self) -> &str;

    /// Version of the last applied event, [`NO_STREAM`] when none.
    fn version(&self) -> i64;

    /// Fold one event into the aggregate.
    fn apply(&mut self, event: &Event) -> Result<()>;
}

/// Apply every event the aggregate has not seen yet. Returns how many were applied.
#[instrument(skip_all, fields(stream_id = %aggregate.stream_id()))]
pub async fn load<A: Aggregate + ?Sized>(store: &dyn EventStore, aggregate: &mut A) -> Result<usize> {
    let events = store.read(aggregate.stream_id(), aggregate.version() + 1).await?;
    for event in &events {
        aggregate.apply(event)?;
    }
    debug!(applied = events.len(), version = aggregate.version(), "aggregate loaded");
    Ok(events.len())
}

/// Append `events` expecting the aggregate's current version, then apply
/// them. Returns the new version.
#[instrument(skip_all, fields(stream_id = %aggregate.stream_id(), count = events.len()))]
pub async fn commit<A: Aggregate + ?Sized>(
    store: &dyn EventStore,
    aggregate: &mut A,
    events: Vec<Event>,
) -> Result<i64> {
    let stream_id = aggregate.stream_id().to_string();
    let expected = aggregate.version();
    let committed = stamp_batch(&stream_id, expected, events)?;

    let version = store.append(&stream_id, expected, committed.clone()).await?;
    for event in &committed {
        aggregate.apply(event)?;
    }
    Ok(version)
}

// =============================================================================
// Transitions
// =============================================================================

/// Predicate over the machine's user state.
pub type Guard<S> = Arc<dyn Fn(&S) -> bool + Send + Sync>;

/// State update run when an event of a given type is applied. A handler
/// returning `Err` must leave the state as it found it.
pub type Handler<S> = Arc<dyn Fn(&mut S, &Event) -> Result<()> + Send + Sync>;

/// A transition with place-count inputs, outputs and inhibitors.
pub struct Transition<S> {
    pub id: String,
    pub event_type: String,
    pub inputs: BTreeMap<String, i64>,
    pub outputs: BTreeMap<String, i64>,
    /// Places that must be empty for the transition to fire.
    pub inhibitors: Vec<String>,
    guard: Option<Guard<S>>,
}

impl<S> Clone for Transition<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            event_type: self.event_type.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            inhibitors: self.inhibitors.clone(),
            guard: self.guard.clone(),
        }
    }
}

impl<S> fmt::Debug for Transition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("inhibitors", &self.inhibitors)
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

impl<S> Transition<S> {
    pub fn new(id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            inhibitors: Vec::new(),
            guard: None,
        }
    }

    pub fn input(mut self, place: impl Into<String>, tokens: i64) -> Self {
        self.inputs.insert(place.into(), tokens);
        self
    }

    pub fn output(mut self, place: impl Into<String>, tokens: i64) -> Self {
        self.outputs.insert(place.into(), tokens);
        self
    }

    pub fn inhibitor(mut self, place: impl Into<String>) -> Self {
        self.inhibitors.push(place.into());
        self
    }

    pub fn guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&S) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }
}

// =============================================================================
// State Machine
// =============================================================================

/// Places, transitions and a user state `S` fused with event application.
pub struct StateMachine<S> {
    stream_id: String,
    places: BTreeMap<String, i64>,
    transitions: Vec<Transition<S>>,
    by_id: HashMap<String, usize>,
    by_event: HashMap<String, usize>,
    handlers: HashMap<String, Handler<S>>,
    state: S,
    version: i64,
}

impl<S: fmt::Debug> fmt::Debug for StateMachine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("stream_id", &self.stream_id)
            .field("places", &self.places)
            .field("transitions", &self.transitions)
            .field("state", &self.state)
            .field("version", &self.version)
            .finish()
    }
}

impl<S> StateMachine<S> {
    pub fn new(stream_id: impl Into<String>, state: S) -> Self {
        Self {
            stream_id: stream_id.into(),
            places: BTreeMap::new(),
            transitions: Vec::new(),
            by_id: HashMap::new(),
            by_event: HashMap::new(),
            handlers: HashMap::new(),
            state,
            version: NO_STREAM,
        }
    }

    pub fn place(mut self, name: impl Into<String>, tokens: i64) -> Self {
        self.places.insert(name.into(), tokens);
        self
    }

    /// Add a transition, replacing one with the same id.
    pub fn transition(mut self, transition: Transition<S>) -> Self {
        let index = match self.by_id.get(&transition.id) {
            Some(&i) => {
                self.by_event.remove(&self.transitions[i].event_type);
                self.transitions[i] = transition;
                i
            }
            None => {
                self.transitions.push(transition);
                self.transitions.len() - 1
            }
        };
        let t = &self.transitions[index];
        self.by_id.insert(t.id.clone(), index);
        self.by_event.insert(t.event_type.clone(), index);
        self
    }

    /// Register the state update for `event_type`.
    pub fn on<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut S, &Event) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(event_type.into(), Arc::new(handler));
        self
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn places(&self) -> &BTreeMap<String, i64> {
        &self.places
    }

    pub fn tokens(&self, place: &str) -> i64 {
        self.places.get(place).copied().unwrap_or(0)
    }

    pub fn transitions(&self) -> &[Transition<S>] {
        &self.transitions
    }

    fn find(&self, transition_id: &str) -> Result<&Transition<S>> {
        self.by_id
            .get(transition_id)
            .map(|&i| &self.transitions[i])
            .ok_or_else(|| PetriError::action_not_found(transition_id))
    }

    fn marking_allows(&self, transition: &Transition<S>) -> bool {
        transition.inputs.iter().all(|(place, n)| self.tokens(place) >= *n)
            && transition.inhibitors.iter().all(|place| self.tokens(place) == 0)
    }

    /// Whether inputs, inhibitors and guard all allow `transition_id`.
    pub fn can_fire(&self, transition_id: &str) -> bool {
        self.find(transition_id).is_ok_and(|t| {
            self.marking_allows(t) && t.guard.as_ref().map_or(true, |g| g(&self.state))
        })
    }

    pub fn enabled_transitions(&self) -> Vec<&str> {
        self.transitions
            .iter()
            .filter(|t| self.can_fire(&t.id))
            .map(|t| t.id.as_str())
            .collect()
    }

    /// Validate a firing and produce its event. Places are not modified.
    pub fn fire(&self, transition_id: &str, data: serde_json::Value) -> Result<Event> {
        let transition = self.find(transition_id)?;
        if !self.marking_allows(transition) {
            return Err(PetriError::action_not_enabled(transition_id));
        }
        if let Some(guard) = &transition.guard {
            if !guard(&self.state) {
                return Err(PetriError::guard_not_satisfied(transition_id, "state predicate"));
            }
        }

        let mut event = Event::new(self.stream_id.clone(), transition.event_type.clone(), data);
        event.version = self.version + 1;
        Ok(event)
    }

    /// Commit an event: token deltas of the matching transition plus its handler.
    ///
    /// Places and version change only when the handler succeeds, so a failed
    /// apply can be retried by reloading from the store.
    pub fn apply_event(&mut self, event: &Event) -> Result<()> {
        let transition = self.by_event.get(&event.event_type).map(|&i| &self.transitions[i]);
        let handler = self.handlers.get(&event.event_type).cloned();

        if transition.is_none() && handler.is_none() {
            return Err(PetriError::new(
                ErrorCode::ActionNotFound,
                format!("No transition or handler for event type '{}'", event.event_type),
            ));
        }

        let marking = match transition {
            Some(transition) => {
                let mut marking = self.places.clone();
                for (place, n) in &transition.inputs {
                    let tokens = marking.entry(place.clone()).or_insert(0);
                    if *tokens < *n {
                        return Err(PetriError::action_not_enabled(&transition.id)
                            .with_context("event_type", &event.event_type));
                    }
                    *tokens -= n;
                }
                for (place, n) in &transition.outputs {
                    *marking.entry(place.clone()).or_insert(0) += n;
                }
                Some(marking)
            }
            None => None,
        };

        if let Some(handler) = handler {
            handler(&mut self.state, event)?;
        }
        if let Some(marking) = marking {
            self.places = marking;
        }
        self.version = event.version;
        Ok(())
    }
}

impl<S: Send> Aggregate for StateMachine<S> {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &Event) -> Result<()> {
        self.apply_event(event)
    }
}
