//! The append-only event log contract.

use async_trait::async_trait;
use chrono::SubsecRound;
use tokio_util::sync::CancellationToken;

use super::event::{Event, EventFilter, StateSnapshot, NO_STREAM};
use super::subscription::Subscription;
use crate::error::{PetriError, Result};

/// A per-stream, optimistically concurrent event log.
///
/// All operations fail with `StoreClosed` after [`EventStore::close`].
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `events` to `stream_id`, assigning versions `expected_version + 1`
    /// onwards. `expected_version` must equal the stream's current version
    /// ([`NO_STREAM`] for a new stream) or the call fails with
    /// `ConcurrencyConflict`. Returns the new stream version.
    async fn append(&self, stream_id: &str, expected_version: i64, events: Vec<Event>) -> Result<i64>;

    /// Events of one stream with `version >= from_version`, in version order.
    async fn read(&self, stream_id: &str, from_version: i64) -> Result<Vec<Event>>;

    /// Events across streams matching `filter`, in append order.
    async fn read_all(&self, filter: &EventFilter) -> Result<Vec<Event>>;

    /// Current version of a stream, [`NO_STREAM`] when it has no events.
    async fn stream_version(&self, stream_id: &str) -> Result<i64>;

    /// Live feed of events appended after this call that match `filter`.
    /// Ends when `cancel` fires or the store closes.
    async fn subscribe(&self, filter: EventFilter, cancel: CancellationToken) -> Result<Subscription>;

    /// Store or replace the snapshot of a stream.
    async fn save_snapshot(&self, snapshot: StateSnapshot) -> Result<()>;

    async fn load_snapshot(&self, stream_id: &str) -> Result<Option<StateSnapshot>>;

    /// Returns whether a snapshot existed.
    async fn delete_snapshot(&self, stream_id: &str) -> Result<bool>;

    /// Release resources. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Assign stream id and versions to a batch about to be appended.
///
/// Timestamps are truncated to whole microseconds, the resolution the SQLite
/// backend stores, so every backend returns events exactly as stamped.
pub(crate) fn stamp_batch(stream_id: &str, expected_version: i64, events: Vec<Event>) -> Result<Vec<Event>> {
    if expected_version < NO_STREAM {
        return Err(PetriError::concurrency_conflict(stream_id, expected_version, NO_STREAM));
    }
    events
        .into_iter()
        .enumerate()
        .map(|(i, mut event)| {
            let version = i64::try_from(i)
                .ok()
                .and_then(|offset| expected_version.checked_add(1)?.checked_add(offset))
                .ok_or_else(|| PetriError::concurrency_conflict(stream_id, expected_version, NO_STREAM))?;
            event.stream_id = stream_id.to_string();
            event.version = version;
            event.timestamp = event.timestamp.trunc_subsecs(6);
            Ok(event)
        })
        .collect()
}
