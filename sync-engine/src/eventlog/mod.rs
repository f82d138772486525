//! Append-only, per-aggregate sequenced event store (spec.md §4.4, §6).
//!
//! Grounded on the teacher's `audit/storage.rs`: a single append-lock
//! serializes writers, and the backing table's `UNIQUE(aggregate_id,
//! sequence_number)` constraint is the last line of defense against a
//! concurrency bug in that serialization. Unlike `audit/storage.rs` this
//! uses `sqlx`'s runtime query API (`query`/`query_as`) rather than the
//! compile-time-checked `query!` macro, so `cargo build` does not require a
//! live `DATABASE_URL` — a deliberate deviation, noted in DESIGN.md.

use async_trait::async_trait;
use shared::event::{AggregateType, DomainEvent, DomainEventType, EventPayload};
use shared::ids::ExecutionId;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(
        "concurrency conflict appending to aggregate {aggregate_id}: expected sequence {expected}, actual next sequence is {actual}"
    )]
    ConcurrencyConflict { aggregate_id: String, expected: u64, actual: u64 },
}

impl From<sqlx::Error> for EventLogError {
    fn from(err: sqlx::Error) -> Self {
        EventLogError::Database(err.to_string())
    }
}

/// Decouples the orchestrator from the concrete backend (spec.md §9 Open
/// Question: one production pair — `SqliteEventStore` here — plus an
/// in-memory test double, not two production paths).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist `event` with `sequence_number = max_for_aggregate + 1`. If
    /// `expected_sequence` is supplied and does not equal the computed
    /// sequence, the append is rejected with `ConcurrencyConflict` and
    /// nothing is written.
    async fn append(
        &self,
        event: DomainEvent,
        expected_sequence: Option<u64>,
    ) -> Result<DomainEvent, EventLogError>;

    async fn events_for(
        &self,
        aggregate_id: &str,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> Result<Vec<DomainEvent>, EventLogError>;

    async fn events_for_execution(&self, execution_id: ExecutionId) -> Result<Vec<DomainEvent>, EventLogError>;

    async fn latest_sequence(&self, aggregate_id: &str) -> Result<u64, EventLogError>;

    async fn exists(&self, aggregate_id: &str) -> Result<bool, EventLogError>;
}

/// SQLite-backed production event store (spec.md §6 table shape).
pub struct SqliteEventStore {
    pool: SqlitePool,
    /// Serializes all appends; the per-aggregate max-sequence read and the
    /// subsequent insert must not interleave across tasks.
    append_lock: Arc<Mutex<()>>,
}

impl SqliteEventStore {
    pub async fn connect(database_url: &str) -> Result<Self, EventLogError> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect(database_url).await?;
        let store = Self { pool, append_lock: Arc::new(Mutex::new(())) };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool, append_lock: Arc::new(Mutex::new(())) }
    }

    async fn migrate(&self) -> Result<(), EventLogError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                event_id TEXT PRIMARY KEY,
                aggregate_id TEXT NOT NULL,
                aggregate_type TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_version INTEGER NOT NULL,
                payload TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                UNIQUE(aggregate_id, sequence_number)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS events_execution_idx ON events(execution_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(
        &self,
        mut event: DomainEvent,
        expected_sequence: Option<u64>,
    ) -> Result<DomainEvent, EventLogError> {
        let _guard = self.append_lock.lock().await;

        let current_max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence_number) FROM events WHERE aggregate_id = ?")
                .bind(&event.aggregate_id)
                .fetch_one(&self.pool)
                .await?;
        let next_sequence = current_max.unwrap_or(0) as u64 + 1;

        if let Some(expected) = expected_sequence
            && expected != next_sequence
        {
            return Err(EventLogError::ConcurrencyConflict {
                aggregate_id: event.aggregate_id.clone(),
                expected,
                actual: next_sequence,
            });
        }

        event.sequence = next_sequence;
        let payload_json = serde_json::to_string(&event.payload)?;
        let aggregate_type_json = serde_json::to_string(&event.aggregate_type)?;
        let event_type_json = serde_json::to_string(&event.event_type)?;

        sqlx::query(
            "INSERT INTO events (event_id, aggregate_id, aggregate_type, sequence_number, event_type, \
             event_version, payload, execution_id, occurred_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.event_id.to_string())
        .bind(&event.aggregate_id)
        .bind(aggregate_type_json)
        .bind(event.sequence as i64)
        .bind(event_type_json)
        .bind(event.event_version as i64)
        .bind(payload_json)
        .bind(event.execution_id.to_string())
        .bind(event.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(event)
    }

    async fn events_for(
        &self,
        aggregate_id: &str,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> Result<Vec<DomainEvent>, EventLogError> {
        let from = from_seq.unwrap_or(0) as i64;
        let to = to_seq.unwrap_or(i64::MAX as u64) as i64;
        let rows = sqlx::query(
            "SELECT event_id, aggregate_id, aggregate_type, sequence_number, event_type, event_version, \
             payload, execution_id, occurred_at FROM events \
             WHERE aggregate_id = ? AND sequence_number >= ? AND sequence_number <= ? \
             ORDER BY sequence_number ASC",
        )
        .bind(aggregate_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(row_to_event).collect())
    }

    async fn events_for_execution(&self, execution_id: ExecutionId) -> Result<Vec<DomainEvent>, EventLogError> {
        let rows = sqlx::query(
            "SELECT event_id, aggregate_id, aggregate_type, sequence_number, event_type, event_version, \
             payload, execution_id, occurred_at FROM events \
             WHERE execution_id = ? ORDER BY occurred_at ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(row_to_event).collect())
    }

    async fn latest_sequence(&self, aggregate_id: &str) -> Result<u64, EventLogError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(sequence_number) FROM events WHERE aggregate_id = ?")
            .bind(aggregate_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(max.unwrap_or(0) as u64)
    }

    async fn exists(&self, aggregate_id: &str) -> Result<bool, EventLogError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE aggregate_id = ?")
            .bind(aggregate_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }
}

/// Reconstruct a `DomainEvent` from a row, skipping (with a warning) any row
/// whose `event_type`/`payload` no longer deserializes under the current
/// schema — spec.md §4.4 "unknown event_type during read is skipped with a
/// warning, never crashes the reader".
fn row_to_event(row: sqlx::sqlite::SqliteRow) -> Option<DomainEvent> {
    let event_id: String = row.try_get("event_id").ok()?;
    let aggregate_id: String = row.try_get("aggregate_id").ok()?;
    let aggregate_type_json: String = row.try_get("aggregate_type").ok()?;
    let sequence: i64 = row.try_get("sequence_number").ok()?;
    let event_type_json: String = row.try_get("event_type").ok()?;
    let event_version: i64 = row.try_get("event_version").ok()?;
    let payload_json: String = row.try_get("payload").ok()?;
    let execution_id: String = row.try_get("execution_id").ok()?;
    let occurred_at: String = row.try_get("occurred_at").ok()?;

    let aggregate_type: AggregateType = match serde_json::from_str(&aggregate_type_json) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(aggregate_id, error = %e, "skipping event with unreadable aggregate_type");
            return None;
        }
    };
    let event_type: DomainEventType = match serde_json::from_str(&event_type_json) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(aggregate_id, error = %e, "skipping event with unknown event_type");
            return None;
        }
    };
    let payload: EventPayload = match serde_json::from_str(&payload_json) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(aggregate_id, error = %e, "skipping event with unreadable payload");
            return None;
        }
    };
    let event_id = uuid::Uuid::parse_str(&event_id).ok()?;
    let occurred_at = chrono::DateTime::parse_from_rfc3339(&occurred_at).ok()?.with_timezone(&chrono::Utc);
    let execution_id: uuid::Uuid = execution_id.parse().ok()?;

    Some(DomainEvent {
        event_id,
        sequence: sequence as u64,
        aggregate_id,
        aggregate_type,
        event_type,
        event_version: event_version as u32,
        occurred_at,
        execution_id: ExecutionId::from_uuid(execution_id),
        payload,
    })
}

/// In-memory event store used only in tests, so aggregate/orchestrator unit
/// tests don't need a SQLite file (spec.md §9 Open Question resolution: this
/// is a test double, not a second production backend).
#[cfg(test)]
pub struct InMemoryEventStore {
    events: Mutex<std::collections::HashMap<String, Vec<DomainEvent>>>,
}

#[cfg(test)]
impl InMemoryEventStore {
    pub fn new() -> Self {
        Self { events: Mutex::new(std::collections::HashMap::new()) }
    }
}

#[cfg(test)]
impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        mut event: DomainEvent,
        expected_sequence: Option<u64>,
    ) -> Result<DomainEvent, EventLogError> {
        let mut events = self.events.lock().await;
        let stream = events.entry(event.aggregate_id.clone()).or_default();
        let next_sequence = stream.last().map(|e| e.sequence).unwrap_or(0) + 1;
        if let Some(expected) = expected_sequence
            && expected != next_sequence
        {
            return Err(EventLogError::ConcurrencyConflict {
                aggregate_id: event.aggregate_id.clone(),
                expected,
                actual: next_sequence,
            });
        }
        event.sequence = next_sequence;
        stream.push(event.clone());
        Ok(event)
    }

    async fn events_for(
        &self,
        aggregate_id: &str,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> Result<Vec<DomainEvent>, EventLogError> {
        let events = self.events.lock().await;
        let from = from_seq.unwrap_or(0);
        let to = to_seq.unwrap_or(u64::MAX);
        Ok(events
            .get(aggregate_id)
            .map(|stream| stream.iter().filter(|e| e.sequence >= from && e.sequence <= to).cloned().collect())
            .unwrap_or_default())
    }

    async fn events_for_execution(&self, execution_id: ExecutionId) -> Result<Vec<DomainEvent>, EventLogError> {
        let events = self.events.lock().await;
        let mut matched: Vec<DomainEvent> =
            events.values().flatten().filter(|e| e.execution_id == execution_id).cloned().collect();
        matched.sort_by_key(|e| e.occurred_at);
        Ok(matched)
    }

    async fn latest_sequence(&self, aggregate_id: &str) -> Result<u64, EventLogError> {
        let events = self.events.lock().await;
        Ok(events.get(aggregate_id).and_then(|s| s.last()).map(|e| e.sequence).unwrap_or(0))
    }

    async fn exists(&self, aggregate_id: &str) -> Result<bool, EventLogError> {
        let events = self.events.lock().await;
        Ok(events.get(aggregate_id).is_some_and(|s| !s.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::event::{AggregateType, DomainEventType, EventPayload};
    use shared::ids::ExecutionId;

    async fn temp_store() -> SqliteEventStore {
        SqliteEventStore::connect("sqlite::memory:").await.unwrap()
    }

    fn status_event(sequence: u64, aggregate_id: &str, execution_id: ExecutionId) -> DomainEvent {
        DomainEvent::new(
            sequence,
            aggregate_id.to_string(),
            AggregateType::Order,
            execution_id,
            DomainEventType::OrderStatusChanged,
            EventPayload::OrderStatusChanged {
                from: shared::order::OrderStatus::Pending,
                to: shared::order::OrderStatus::Shipped,
            },
        )
    }

    #[tokio::test]
    async fn append_assigns_sequential_numbers_and_round_trips() {
        let store = temp_store().await;
        let execution_id = ExecutionId::new();
        store.append(status_event(1, "order-1", execution_id), None).await.unwrap();
        store.append(status_event(0, "order-1", execution_id), None).await.unwrap();

        let events = store.events_for("order-1", None, None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 1);
        assert_eq!(events[1].sequence, 2);
        assert_eq!(store.latest_sequence("order-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_append_with_stale_expected_sequence_conflicts() {
        let store = temp_store().await;
        let execution_id = ExecutionId::new();
        store.append(status_event(0, "order-1", execution_id), Some(1)).await.unwrap();

        let result = store.append(status_event(0, "order-1", execution_id), Some(1)).await;
        assert!(matches!(result, Err(EventLogError::ConcurrencyConflict { .. })));
    }

    #[tokio::test]
    async fn events_for_execution_spans_aggregates() {
        let store = temp_store().await;
        let execution_id = ExecutionId::new();
        store.append(status_event(0, "order-1", execution_id), None).await.unwrap();
        store.append(status_event(0, "order-2", execution_id), None).await.unwrap();
        store.append(status_event(0, "order-3", ExecutionId::new()), None).await.unwrap();

        let events = store.events_for_execution(execution_id).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn in_memory_store_matches_sqlite_semantics() {
        let store = InMemoryEventStore::new();
        let execution_id = ExecutionId::new();
        store.append(status_event(0, "order-1", execution_id), None).await.unwrap();
        let conflict = store.append(status_event(0, "order-1", execution_id), Some(5)).await;
        assert!(matches!(conflict, Err(EventLogError::ConcurrencyConflict { .. })));
    }
}
