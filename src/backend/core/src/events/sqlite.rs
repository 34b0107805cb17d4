//! Durable event store on an embedded SQLite database.
//!
//! Layout:
//!
//! - `events(id, stream_id, type, version, timestamp, data, metadata)` with
//!   `UNIQUE(stream_id, version)`, which makes the optimistic-concurrency
//!   check atomic at the storage layer.
//! - `snapshots(stream_id, version, state, created_at)`.
//!
//! Timestamps are stored as microseconds since the Unix epoch; payloads and
//! metadata as JSON text.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::event::{Event, EventFilter, EventId, EventMetadata, StateSnapshot, NO_STREAM};
use super::store::{stamp_batch, EventStore};
use super::subscription::{Subscription, SubscriptionHub};
use crate::config::StoreConfig;
use crate::error::{ErrorCode, PetriError, Result};
use crate::telemetry::metrics::EVENTS_APPENDED;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id          TEXT    NOT NULL PRIMARY KEY,
        stream_id   TEXT    NOT NULL,
        type        TEXT    NOT NULL,
        version     INTEGER NOT NULL,
        timestamp   INTEGER NOT NULL,
        data        TEXT    NOT NULL,
        metadata    TEXT,
        UNIQUE (stream_id, version)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_stream_version ON events (stream_id, version)",
    "CREATE INDEX IF NOT EXISTS idx_events_type ON events (type)",
    "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        stream_id   TEXT    NOT NULL PRIMARY KEY,
        version     INTEGER NOT NULL,
        state       TEXT    NOT NULL,
        created_at  INTEGER NOT NULL
    )
    "#,
];

const EVENT_COLUMNS: &str = "id, stream_id, type, version, timestamp, data, metadata";

/// Maximum page size accepted by [`SqliteEventStore::list_instances`].
pub const MAX_PAGE_SIZE: u32 = 1000;

// ═══════════════════════════════════════════════════════════════════════════════
// Reporting Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Latest-state summary of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub stream_id: String,
    pub version: i64,
    pub last_event_type: String,
    pub event_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One page of [`InstanceSummary`] values, most recently updated first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancePage {
    pub instances: Vec<InstanceSummary>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

impl InstancePage {
    pub fn total_pages(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        ((self.total as u64 + self.per_page as u64 - 1) / self.per_page as u64) as u32
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages()
    }
}

/// Aggregate usage statistics over the event table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_events: i64,
    pub total_streams: i64,
    pub events_by_type: BTreeMap<String, i64>,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rows
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: String,
    stream_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    version: i64,
    timestamp: i64,
    data: String,
    metadata: Option<String>,
}

impl TryFrom<EventRow> for Event {
    type Error = PetriError;

    fn try_from(row: EventRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id).map_err(|e| {
            PetriError::with_internal(ErrorCode::DeserializationError, "Corrupt event id", e.to_string())
        })?;
        let metadata = row
            .metadata
            .as_deref()
            .map(serde_json::from_str::<EventMetadata>)
            .transpose()?;
        Ok(Event {
            id: EventId(id),
            stream_id: row.stream_id,
            event_type: row.event_type,
            version: row.version,
            timestamp: from_micros(row.timestamp)?,
            data: serde_json::from_str(&row.data)?,
            metadata,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    stream_id: String,
    version: i64,
    state: String,
    created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct InstanceRow {
    stream_id: String,
    version: i64,
    last_event_type: String,
    event_count: i64,
    created_at: i64,
    updated_at: i64,
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_micros(micros).single().ok_or_else(|| {
        PetriError::with_internal(
            ErrorCode::DeserializationError,
            "Corrupt timestamp",
            format!("{} is out of range", micros),
        )
    })
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite-backed [`EventStore`].
pub struct SqliteEventStore {
    pool: SqlitePool,
    hub: SubscriptionHub,
    /// Serializes in-process appends from version check through publish.
    append_lock: Mutex<()>,
    closed: AtomicBool,
}

impl SqliteEventStore {
    /// Open (creating if needed) the database at `url` with default pool settings.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(&StoreConfig {
            url: url.to_string(),
            ..StoreConfig::default()
        })
        .await
    }

    /// Open the database described by `config` and create the tables.
    pub async fn connect_with(config: &StoreConfig) -> Result<Self> {
        let in_memory = is_memory_url(&config.url);
        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // every connection to an in-memory URL opens a separate database
        let max_connections = if in_memory { 1 } else { config.max_connections.max(1) };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(if in_memory { 1 } else { 0 })
            .idle_timeout(if in_memory { None } else { Some(Duration::from_secs(600)) })
            .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| {
                PetriError::with_internal(
                    ErrorCode::DatabaseConnectionFailed,
                    "Failed to open event database",
                    e.to_string(),
                )
                .with_source(e)
            })?;

        let store = Self::from_pool(pool, config.subscription_buffer);
        store.initialize().await?;
        info!(url = %config.url, max_connections, "sqlite event store ready");
        Ok(store)
    }

    /// Wrap an existing pool. Call [`SqliteEventStore::initialize`] before use
    /// if the tables may not exist.
    pub fn from_pool(pool: SqlitePool, subscription_buffer: usize) -> Self {
        Self {
            pool,
            hub: SubscriptionHub::new(subscription_buffer),
            append_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Create tables and indexes if missing.
    pub async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PetriError::store_closed());
        }
        Ok(())
    }

    async fn current_version(&self, stream_id: &str) -> Result<i64> {
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM events WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(version.unwrap_or(NO_STREAM))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reporting
    // ─────────────────────────────────────────────────────────────────────────

    /// Streams grouped from the event table, most recently updated first.
    /// `page` is 1-based.
    #[instrument(skip(self))]
    pub async fn list_instances(&self, page: u32, per_page: u32) -> Result<InstancePage> {
        self.ensure_open()?;
        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_PAGE_SIZE);
        let offset = (page as i64 - 1) * per_page as i64;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT stream_id) FROM events")
            .fetch_one(&self.pool)
            .await?;

        let rows: Vec<InstanceRow> = sqlx::query_as(
            r#"
            SELECT e.stream_id            AS stream_id,
                   MAX(e.version)         AS version,
                   COUNT(*)               AS event_count,
                   MIN(e.timestamp)       AS created_at,
                   MAX(e.timestamp)       AS updated_at,
                   (SELECT l.type FROM events l
                     WHERE l.stream_id = e.stream_id
                     ORDER BY l.version DESC LIMIT 1) AS last_event_type
            FROM events e
            GROUP BY e.stream_id
            ORDER BY updated_at DESC, e.stream_id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(per_page as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let instances = rows
            .into_iter()
            .map(|row| {
                Ok(InstanceSummary {
                    stream_id: row.stream_id,
                    version: row.version,
                    last_event_type: row.last_event_type,
                    event_count: row.event_count,
                    created_at: from_micros(row.created_at)?,
                    updated_at: from_micros(row.updated_at)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(InstancePage {
            instances,
            total,
            page,
            per_page,
        })
    }

    /// Totals, per-type counts and the time span of the event table.
    #[instrument(skip(self))]
    pub async fn stats(&self) -> Result<StoreStats> {
        self.ensure_open()?;

        let (total_events, total_streams, first, last): (i64, i64, Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(DISTINCT stream_id), MIN(timestamp), MAX(timestamp) FROM events",
        )
        .fetch_one(&self.pool)
        .await?;

        let by_type: Vec<(String, i64)> =
            sqlx::query_as("SELECT type, COUNT(*) FROM events GROUP BY type ORDER BY type")
                .fetch_all(&self.pool)
                .await?;

        Ok(StoreStats {
            total_events,
            total_streams,
            events_by_type: by_type.into_iter().collect(),
            first_event_at: first.map(from_micros).transpose()?,
            last_event_at: last.map(from_micros).transpose()?,
        })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append(&self, stream_id: &str, expected_version: i64, events: Vec<Event>) -> Result<i64> {
        self.ensure_open()?;
        let _guard = self.append_lock.lock().await;

        let current = self.current_version(stream_id).await?;
        if current != expected_version {
            return Err(PetriError::concurrency_conflict(stream_id, expected_version, current));
        }
        if events.is_empty() {
            return Ok(current);
        }

        let stamped = stamp_batch(stream_id, expected_version, events)?;
        let mut tx = self.pool.begin().await?;

        // Other processes may append between the check above and this
        // transaction; the unique index rejects stale versions and the
        // predecessor check rejects gaps.
        for event in &stamped {
            let metadata = event.metadata.as_ref().map(serde_json::to_string).transpose()?;
            let inserted = sqlx::query(
                "INSERT INTO events (id, stream_id, type, version, timestamp, data, metadata) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(event.id.0.to_string())
            .bind(&event.stream_id)
            .bind(&event.event_type)
            .bind(event.version)
            .bind(event.timestamp.timestamp_micros())
            .bind(serde_json::to_string(&event.data)?)
            .bind(metadata)
            .execute(&mut *tx)
            .await;

            if let Err(e) = inserted {
                tx.rollback().await?;
                if is_unique_violation(&e) {
                    let actual = self.current_version(stream_id).await?;
                    return Err(PetriError::concurrency_conflict(stream_id, expected_version, actual));
                }
                return Err(e.into());
            }
        }

        if expected_version > NO_STREAM {
            let predecessor: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE stream_id = ? AND version = ?")
                    .bind(stream_id)
                    .bind(expected_version)
                    .fetch_one(&mut *tx)
                    .await?;
            if predecessor == 0 {
                tx.rollback().await?;
                let actual = self.current_version(stream_id).await?;
                return Err(PetriError::concurrency_conflict(stream_id, expected_version, actual));
            }
        }

        tx.commit().await?;

        let version = stamped.last().map_or(current, |e| e.version);
        counter!(EVENTS_APPENDED, "backend" => self.name()).increment(stamped.len() as u64);
        debug!(stream_id, version, "events appended");

        self.hub.publish(&stamped);
        Ok(version)
    }

    async fn read(&self, stream_id: &str, from_version: i64) -> Result<Vec<Event>> {
        self.ensure_open()?;
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM events WHERE stream_id = ? AND version >= ? ORDER BY version ASC",
            EVENT_COLUMNS
        ))
        .bind(stream_id)
        .bind(from_version.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Event::try_from).collect()
    }

    async fn read_all(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        self.ensure_open()?;

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM events WHERE 1 = 1", EVENT_COLUMNS));

        if let Some(stream_id) = &filter.stream_id {
            query.push(" AND stream_id = ").push_bind(stream_id.clone());
        }
        if !filter.event_types.is_empty() {
            query.push(" AND type IN (");
            let mut types = query.separated(", ");
            for event_type in &filter.event_types {
                types.push_bind(event_type.clone());
            }
            types.push_unseparated(")");
        }
        if let Some(from) = filter.from_version {
            query.push(" AND version >= ").push_bind(from);
        }
        if let Some(to) = filter.to_version {
            query.push(" AND version <= ").push_bind(to);
        }
        if let Some(from) = filter.from_time {
            query.push(" AND timestamp >= ").push_bind(from.timestamp_micros());
        }
        if let Some(to) = filter.to_time {
            query.push(" AND timestamp <= ").push_bind(to.timestamp_micros());
        }
        query.push(" ORDER BY rowid ASC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<EventRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Event::try_from).collect()
    }

    async fn stream_version(&self, stream_id: &str) -> Result<i64> {
        self.ensure_open()?;
        self.current_version(stream_id).await
    }

    async fn subscribe(&self, filter: EventFilter, cancel: CancellationToken) -> Result<Subscription> {
        self.ensure_open()?;
        Ok(self.hub.subscribe(filter, cancel))
    }

    async fn save_snapshot(&self, snapshot: StateSnapshot) -> Result<()> {
        self.ensure_open()?;
        sqlx::query(
            r#"
            INSERT INTO snapshots (stream_id, version, state, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (stream_id) DO UPDATE SET
                version = excluded.version,
                state = excluded.state,
                created_at = excluded.created_at
            "#,
        )
        .bind(&snapshot.stream_id)
        .bind(snapshot.version)
        .bind(serde_json::to_string(&snapshot.state)?)
        .bind(snapshot.created_at.timestamp_micros())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_snapshot(&self, stream_id: &str) -> Result<Option<StateSnapshot>> {
        self.ensure_open()?;
        let row: Option<SnapshotRow> =
            sqlx::query_as("SELECT stream_id, version, state, created_at FROM snapshots WHERE stream_id = ?")
                .bind(stream_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|row| {
            Ok(StateSnapshot {
                stream_id: row.stream_id,
                version: row.version,
                state: serde_json::from_str(&row.state)?,
                created_at: from_micros(row.created_at)?,
            })
        })
        .transpose()
    }

    async fn delete_snapshot(&self, stream_id: &str) -> Result<bool> {
        self.ensure_open()?;
        let result = sqlx::query("DELETE FROM snapshots WHERE stream_id = ?")
            .bind(stream_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.hub.close_all();
            self.pool.close().await;
            debug!("sqlite event store closed");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

impl std::fmt::Debug for SqliteEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEventStore")
            .field("pool_size", &self.pool.size())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
