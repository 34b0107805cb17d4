//! Process-local event store for tests and ephemeral instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::event::{Event, EventFilter, StateSnapshot, NO_STREAM};
use super::store::{stamp_batch, EventStore};
use super::subscription::{Subscription, SubscriptionHub, DEFAULT_SUBSCRIPTION_BUFFER};
use crate::error::{PetriError, Result};
use crate::telemetry::metrics::EVENTS_APPENDED;

#[derive(Default)]
struct Log {
    /// Every event in append order.
    events: Vec<Event>,
    /// Positions in `events` per stream, in version order.
    streams: HashMap<String, Vec<usize>>,
}

impl Log {
    fn version(&self, stream_id: &str) -> i64 {
        self.streams
            .get(stream_id)
            .map_or(NO_STREAM, |positions| positions.len() as i64 - 1)
    }
}

/// In-memory [`EventStore`]. The version check and the write happen under
/// one write lock.
pub struct InMemoryEventStore {
    log: RwLock<Log>,
    snapshots: DashMap<String, StateSnapshot>,
    hub: SubscriptionHub,
    closed: AtomicBool,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SUBSCRIPTION_BUFFER)
    }

    /// Store whose subscriptions queue up to `buffer` events each.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            log: RwLock::new(Log::default()),
            snapshots: DashMap::new(),
            hub: SubscriptionHub::new(buffer),
            closed: AtomicBool::new(false),
        }
    }

    /// Total number of events held.
    pub fn len(&self) -> usize {
        self.log.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PetriError::store_closed());
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append(&self, stream_id: &str, expected_version: i64, events: Vec<Event>) -> Result<i64> {
        self.ensure_open()?;

        let version = {
            let mut log = self.log.write();
            let current = log.version(stream_id);
            if current != expected_version {
                return Err(PetriError::concurrency_conflict(stream_id, expected_version, current));
            }
            if events.is_empty() {
                return Ok(current);
            }

            let stamped = stamp_batch(stream_id, expected_version, events)?;
            let start = log.events.len();
            log.events.extend(stamped.iter().cloned());
            log.streams
                .entry(stream_id.to_string())
                .or_default()
                .extend(start..start + stamped.len());

            // publish under the write lock so subscribers see each stream in version order
            self.hub.publish(&stamped);
            counter!(EVENTS_APPENDED, "backend" => self.name()).increment(stamped.len() as u64);
            log.version(stream_id)
        };

        debug!(stream_id, version, "events appended");
        Ok(version)
    }

    async fn read(&self, stream_id: &str, from_version: i64) -> Result<Vec<Event>> {
        self.ensure_open()?;
        let log = self.log.read();
        let Some(positions) = log.streams.get(stream_id) else {
            return Ok(Vec::new());
        };
        let from = from_version.max(0) as usize;
        Ok(positions
            .iter()
            .skip(from)
            .map(|&i| log.events[i].clone())
            .collect())
    }

    async fn read_all(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        self.ensure_open()?;
        let log = self.log.read();
        let matching = log.events.iter().filter(|e| filter.matches(e)).cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn stream_version(&self, stream_id: &str) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.log.read().version(stream_id))
    }

    async fn subscribe(&self, filter: EventFilter, cancel: CancellationToken) -> Result<Subscription> {
        self.ensure_open()?;
        Ok(self.hub.subscribe(filter, cancel))
    }

    async fn save_snapshot(&self, snapshot: StateSnapshot) -> Result<()> {
        self.ensure_open()?;
        self.snapshots.insert(snapshot.stream_id.clone(), snapshot);
        Ok(())
    }

    async fn load_snapshot(&self, stream_id: &str) -> Result<Option<StateSnapshot>> {
        self.ensure_open()?;
        Ok(self.snapshots.get(stream_id).map(|s| s.clone()))
    }

    async fn delete_snapshot(&self, stream_id: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.snapshots.remove(stream_id).is_some())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.hub.close_all();
            debug!("in-memory event store closed");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
