//! Offline Queue Module - durable storage of pending actions
//!
//! Actions that could not reach the server are persisted here until the
//! orchestrator delivers or abandons them.
//!
//! Features:
//! - SQLite-backed persistent queue (survives restarts)
//! - Upsert by action id; every mutation is a single transaction
//! - Capacity policy: evicts low/medium work, never critical/high
//! - Indexed candidate selection (status, priority, entity, enqueue time)
//! - Queue statistics for status indicators

use super::models::{
    ActionFilter, ActionKind, ActionPayload, ActionPriority, ActionStatus, ActionTarget,
    OfflineAction,
};
use crate::db::{Database, DbError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, types::Value, Row};
use std::collections::BTreeMap;
use std::sync::Arc;

// ============================================================================
// Constants
// ============================================================================

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

const SELECT_COLUMNS: &str = r#"
    id, kind, entity, payload, target, priority, enqueued_at,
    attempts, max_attempts, status, last_error, next_attempt_at, updated_at
"#;

// ============================================================================
// Store Contract
// ============================================================================

/// Result of a `put`
#[derive(Debug, Clone, Default)]
pub struct PutOutcome {
    /// `false` when an existing id was overwritten
    pub inserted: bool,
    /// Actions removed by the capacity policy to make room
    pub evicted: Vec<OfflineAction>,
    /// Eviction victims that could no longer be decoded
    pub corrupt: Vec<CorruptAction>,
}

/// A stored row that no longer decodes into an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptAction {
    pub id: String,
    pub entity: String,
    pub details: String,
}

/// Counts used by queue status reporting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total: usize,
    pub queued: usize,
    pub syncing: usize,
    pub by_priority: BTreeMap<ActionPriority, usize>,
    pub by_entity: BTreeMap<String, usize>,
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
}

/// Durable key-value store of queued actions, keyed by action id.
///
/// Every method is atomic per call: a crash leaves either the old or the
/// new row, never a partial one.
#[async_trait]
pub trait ActionStore: Send + Sync {
    /// Upsert by id, applying the capacity policy to new ids
    async fn put(&self, action: &OfflineAction) -> Result<PutOutcome, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<OfflineAction>, StoreError>;

    /// Matching actions in dispatch order (priority, then enqueue time).
    /// Rows that fail to decode are logged and left out.
    async fn get_all(&self, filter: &ActionFilter) -> Result<Vec<OfflineAction>, StoreError>;

    /// Overwrite an existing action; returns `false` (and writes nothing)
    /// if the id is no longer present
    async fn update(&self, action: &OfflineAction) -> Result<bool, StoreError>;

    /// Atomically move a ready queued action to `Syncing` and return the
    /// stored row. `None` if it is gone, already claimed or backing off.
    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<OfflineAction>, StoreError>;

    /// Idempotent delete; returns whether a row was removed
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn clear(&self) -> Result<usize, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Return actions stuck in `Syncing` (interrupted pass) to `Queued`
    async fn reset_in_flight(&self) -> Result<usize, StoreError>;

    /// Make every queued action eligible immediately
    async fn reschedule_all(&self) -> Result<usize, StoreError>;

    /// Remove and return queued actions enqueued before `cutoff`
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<OfflineAction>, StoreError>;

    /// Delete every row that no longer decodes and report what was dropped
    async fn remove_corrupt(&self) -> Result<Vec<CorruptAction>, StoreError>;
}

// ============================================================================
// SQLite Store
// ============================================================================

/// SQLite implementation of `ActionStore`
pub struct SqliteActionStore {
    db: Arc<Database>,
    max_size: usize,
}

impl SqliteActionStore {
    /// Create store with the default capacity
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_capacity(db, DEFAULT_MAX_QUEUE_SIZE)
    }

    pub fn with_capacity(db: Arc<Database>, max_size: usize) -> Self {
        Self {
            db,
            max_size: max_size.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    fn select_where(&self, clause: &str, params: Vec<Value>) -> Result<Vec<RawAction>, StoreError> {
        let sql = format!(
            "SELECT {} FROM offline_actions {} ORDER BY priority ASC, enqueued_at ASC, seq ASC",
            SELECT_COLUMNS, clause
        );

        Ok(self.db.query(&sql, params_from_iter(params), row_to_raw)?)
    }
}

/// Decode each row on its own so one bad row does not hide the rest
fn decode_healthy(rows: Vec<RawAction>) -> Vec<OfflineAction> {
    rows.into_iter()
        .filter_map(|raw| match raw.decode() {
            Ok(action) => Some(action),
            Err(corrupt) => {
                log::error!("Skipping corrupted action {}: {}", corrupt.id, corrupt.details);
                None
            }
        })
        .collect()
}

#[async_trait]
impl ActionStore for SqliteActionStore {
    async fn put(&self, action: &OfflineAction) -> Result<PutOutcome, StoreError> {
        let payload = to_json(&action.payload)?;
        let target = to_json(&action.target)?;
        let max_size = self.max_size;

        let outcome = self.db.with_transaction(|tx| -> Result<PutOutcome, StoreError> {
            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM offline_actions WHERE id = ?1)",
                    [&action.id],
                    |row| row.get(0),
                )
                .map_err(DbError::from)?;

            let mut evicted = Vec::new();
            let mut corrupt = Vec::new();

            if !exists {
                let count: i64 = tx
                    .query_row("SELECT COUNT(*) FROM offline_actions", [], |row| row.get(0))
                    .map_err(DbError::from)?;
                let overflow = (count + 1 - max_size as i64).max(0);

                if overflow > 0 {
                    // Lowest tier first, oldest first within a tier
                    let sql = format!(
                        "SELECT {} FROM offline_actions WHERE priority >= ?1 \
                         ORDER BY priority DESC, enqueued_at ASC, seq ASC LIMIT ?2",
                        SELECT_COLUMNS
                    );
                    let mut stmt = tx.prepare(&sql).map_err(DbError::from)?;
                    let victims = stmt
                        .query_map(params![ActionPriority::Medium.rank(), overflow], row_to_raw)
                        .map_err(DbError::from)?
                        .collect::<rusqlite::Result<Vec<RawAction>>>()
                        .map_err(DbError::from)?;

                    if (victims.len() as i64) < overflow {
                        return Err(StoreError::QueueFull { capacity: max_size });
                    }

                    for victim in victims {
                        tx.execute("DELETE FROM offline_actions WHERE id = ?1", [&victim.id])
                            .map_err(DbError::from)?;
                        match victim.decode() {
                            Ok(action) => evicted.push(action),
                            Err(bad) => corrupt.push(bad),
                        }
                    }
                }
            }

            tx.execute(
                r#"
                INSERT INTO offline_actions (
                    id, kind, entity, payload, target, priority, enqueued_at,
                    attempts, max_attempts, status, last_error, next_attempt_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    entity = excluded.entity,
                    payload = excluded.payload,
                    target = excluded.target,
                    priority = excluded.priority,
                    enqueued_at = excluded.enqueued_at,
                    attempts = excluded.attempts,
                    max_attempts = excluded.max_attempts,
                    status = excluded.status,
                    last_error = excluded.last_error,
                    next_attempt_at = excluded.next_attempt_at,
                    updated_at = excluded.updated_at
                "#,
                params![
                    action.id,
                    action.kind.as_str(),
                    action.entity,
                    payload,
                    target,
                    action.priority.rank(),
                    action.enqueued_at.timestamp_millis(),
                    action.attempts,
                    action.max_attempts,
                    action.status.as_str(),
                    action.last_error,
                    action.next_attempt_at.map(|t| t.timestamp_millis()),
                    action.updated_at.timestamp_millis(),
                ],
            )
            .map_err(DbError::from)?;

            Ok(PutOutcome {
                inserted: !exists,
                evicted,
                corrupt,
            })
        })?;

        for victim in &outcome.evicted {
            log::warn!(
                "Queue at capacity ({}): evicted {} action {} ({})",
                self.max_size,
                victim.priority.as_str(),
                victim.id,
                victim.entity
            );
        }
        for bad in &outcome.corrupt {
            log::error!(
                "Queue at capacity ({}): evicted corrupted action {}: {}",
                self.max_size,
                bad.id,
                bad.details
            );
        }

        Ok(outcome)
    }

    async fn get(&self, id: &str) -> Result<Option<OfflineAction>, StoreError> {
        let found = self.select_where("WHERE id = ?1", vec![Value::Text(id.to_string())])?;
        found.into_iter().next().map(RawAction::into_action).transpose()
    }

    async fn get_all(&self, filter: &ActionFilter) -> Result<Vec<OfflineAction>, StoreError> {
        let mut conditions: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(status) = filter.status {
            values.push(Value::Text(status.as_str().to_string()));
            conditions.push(format!("status = ?{}", values.len()));
        }
        if let Some(priority) = filter.priority {
            values.push(Value::Integer(priority.rank()));
            conditions.push(format!("priority = ?{}", values.len()));
        }
        if let Some(entity) = &filter.entity {
            values.push(Value::Text(entity.clone()));
            conditions.push(format!("entity = ?{}", values.len()));
        }
        if let Some(now) = filter.ready_at {
            values.push(Value::Integer(now.timestamp_millis()));
            conditions.push(format!(
                "(next_attempt_at IS NULL OR next_attempt_at <= ?{})",
                values.len()
            ));
        }

        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        Ok(decode_healthy(self.select_where(&clause, values)?))
    }

    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<OfflineAction>, StoreError> {
        let now_ms = now.timestamp_millis();

        self.db.with_transaction(|tx| -> Result<Option<OfflineAction>, StoreError> {
            let changed = tx
                .execute(
                    r#"
                    UPDATE offline_actions
                    SET status = 'syncing', updated_at = ?2
                    WHERE id = ?1 AND status = 'queued'
                      AND (next_attempt_at IS NULL OR next_attempt_at <= ?2)
                    "#,
                    params![id, now_ms],
                )
                .map_err(DbError::from)?;

            if changed == 0 {
                return Ok(None);
            }

            let sql = format!("SELECT {} FROM offline_actions WHERE id = ?1", SELECT_COLUMNS);
            let raw = tx.query_row(&sql, [id], row_to_raw).map_err(DbError::from)?;

            // Undecodable rows roll back to `queued`
            raw.into_action().map(Some)
        })
    }

    async fn update(&self, action: &OfflineAction) -> Result<bool, StoreError> {
        let updated = self.db.execute(
            r#"
            UPDATE offline_actions
            SET attempts = ?1, max_attempts = ?2, status = ?3, last_error = ?4,
                next_attempt_at = ?5, updated_at = ?6, priority = ?7
            WHERE id = ?8
            "#,
            params![
                action.attempts,
                action.max_attempts,
                action.status.as_str(),
                action.last_error,
                action.next_attempt_at.map(|t| t.timestamp_millis()),
                action.updated_at.timestamp_millis(),
                action.priority.rank(),
                action.id,
            ],
        )?;

        Ok(updated > 0)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .db
            .execute("DELETE FROM offline_actions WHERE id = ?1", params![id])?;

        if deleted > 0 {
            log::debug!("Deleted queued action {}", id);
        }
        Ok(deleted > 0)
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let deleted = self.db.execute("DELETE FROM offline_actions", [])?;
        log::info!("Cleared {} queued actions", deleted);
        Ok(deleted)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM offline_actions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = self.db.query_row(
            r#"
            SELECT
                COUNT(*),
                SUM(CASE WHEN status = 'queued' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'syncing' THEN 1 ELSE 0 END),
                MIN(enqueued_at)
            FROM offline_actions
            "#,
            [],
            |row| {
                Ok(StoreStats {
                    total: row.get::<_, i64>(0)? as usize,
                    queued: row.get::<_, Option<i64>>(1)?.unwrap_or(0) as usize,
                    syncing: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as usize,
                    oldest_enqueued_at: row.get::<_, Option<i64>>(3)?.and_then(millis_to_datetime),
                    ..StoreStats::default()
                })
            },
        )?;

        let by_priority = self.db.query(
            "SELECT priority, COUNT(*) FROM offline_actions GROUP BY priority",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        for (rank, count) in by_priority {
            if let Some(priority) = ActionPriority::from_rank(rank) {
                stats.by_priority.insert(priority, count as usize);
            }
        }

        let by_entity = self.db.query(
            "SELECT entity, COUNT(*) FROM offline_actions GROUP BY entity",
            [],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;
        stats.by_entity = by_entity
            .into_iter()
            .map(|(entity, count)| (entity, count as usize))
            .collect();

        Ok(stats)
    }

    async fn reset_in_flight(&self) -> Result<usize, StoreError> {
        let reset = self.db.execute(
            "UPDATE offline_actions SET status = 'queued', updated_at = ?1 WHERE status = 'syncing'",
            params![Utc::now().timestamp_millis()],
        )?;

        if reset > 0 {
            log::warn!("Recovered {} actions interrupted mid-sync", reset);
        }
        Ok(reset)
    }

    async fn reschedule_all(&self) -> Result<usize, StoreError> {
        let updated = self.db.execute(
            r#"
            UPDATE offline_actions
            SET next_attempt_at = NULL, updated_at = ?1
            WHERE status = 'queued' AND next_attempt_at IS NOT NULL
            "#,
            params![Utc::now().timestamp_millis()],
        )?;

        Ok(updated)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<OfflineAction>, StoreError> {
        let cutoff_ms = cutoff.timestamp_millis();

        let expired = self.db.with_transaction(|tx| -> Result<Vec<RawAction>, StoreError> {
            let sql = format!(
                "SELECT {} FROM offline_actions WHERE status = 'queued' AND enqueued_at < ?1 \
                 ORDER BY priority ASC, enqueued_at ASC, seq ASC",
                SELECT_COLUMNS
            );
            let mut stmt = tx.prepare(&sql).map_err(DbError::from)?;
            let rows = stmt
                .query_map([cutoff_ms], row_to_raw)
                .map_err(DbError::from)?
                .collect::<rusqlite::Result<Vec<RawAction>>>()
                .map_err(DbError::from)?;

            tx.execute(
                "DELETE FROM offline_actions WHERE status = 'queued' AND enqueued_at < ?1",
                [cutoff_ms],
            )
            .map_err(DbError::from)?;

            Ok(rows)
        })?;

        Ok(decode_healthy(expired))
    }

    async fn remove_corrupt(&self) -> Result<Vec<CorruptAction>, StoreError> {
        let removed = self.db.with_transaction(|tx| -> Result<Vec<CorruptAction>, StoreError> {
            let sql = format!("SELECT {} FROM offline_actions ORDER BY seq ASC", SELECT_COLUMNS);
            let mut stmt = tx.prepare(&sql).map_err(DbError::from)?;
            let rows = stmt
                .query_map([], row_to_raw)
                .map_err(DbError::from)?
                .collect::<rusqlite::Result<Vec<RawAction>>>()
                .map_err(DbError::from)?;

            let mut removed = Vec::new();
            for raw in rows {
                if let Err(bad) = raw.decode() {
                    tx.execute("DELETE FROM offline_actions WHERE id = ?1", [&bad.id])
                        .map_err(DbError::from)?;
                    removed.push(bad);
                }
            }
            Ok(removed)
        })?;

        for bad in &removed {
            log::error!("Removed corrupted action {} ({}): {}", bad.id, bad.entity, bad.details);
        }
        Ok(removed)
    }
}

// ============================================================================
// Row Mapping
// ============================================================================

/// Row as stored; JSON columns are decoded outside the rusqlite callback
struct RawAction {
    id: String,
    kind: String,
    entity: String,
    payload: String,
    target: String,
    priority: i64,
    enqueued_at: i64,
    attempts: u32,
    max_attempts: u32,
    status: String,
    last_error: Option<String>,
    next_attempt_at: Option<i64>,
    updated_at: i64,
}

fn row_to_raw(row: &Row<'_>) -> rusqlite::Result<RawAction> {
    Ok(RawAction {
        id: row.get(0)?,
        kind: row.get(1)?,
        entity: row.get(2)?,
        payload: row.get(3)?,
        target: row.get(4)?,
        priority: row.get(5)?,
        enqueued_at: row.get(6)?,
        attempts: row.get(7)?,
        max_attempts: row.get(8)?,
        status: row.get(9)?,
        last_error: row.get(10)?,
        next_attempt_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl RawAction {
    fn decode(self) -> Result<OfflineAction, CorruptAction> {
        let id = self.id.clone();
        let entity = self.entity.clone();

        self.into_action().map_err(|e| CorruptAction {
            id,
            entity,
            details: match e {
                StoreError::Corrupt { details, .. } => details,
                other => other.to_string(),
            },
        })
    }

    fn into_action(self) -> Result<OfflineAction, StoreError> {
        let corrupt = |field: &str| StoreError::Corrupt {
            id: self.id.clone(),
            details: format!("invalid {}", field),
        };

        let kind = ActionKind::parse(&self.kind).ok_or_else(|| corrupt("kind"))?;
        let priority = ActionPriority::from_rank(self.priority).ok_or_else(|| corrupt("priority"))?;
        let enqueued_at = millis_to_datetime(self.enqueued_at).ok_or_else(|| corrupt("enqueued_at"))?;
        let updated_at = millis_to_datetime(self.updated_at).ok_or_else(|| corrupt("updated_at"))?;
        let status = ActionStatus::parse(&self.status).ok_or_else(|| corrupt("status"))?;
        let payload: ActionPayload = serde_json::from_str(&self.payload).map_err(|e| StoreError::Corrupt {
            id: self.id.clone(),
            details: format!("payload: {}", e),
        })?;
        let target: ActionTarget = serde_json::from_str(&self.target).map_err(|e| StoreError::Corrupt {
            id: self.id.clone(),
            details: format!("target: {}", e),
        })?;

        Ok(OfflineAction {
            kind,
            entity: self.entity,
            payload,
            target,
            priority,
            enqueued_at,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            status,
            last_error: self.last_error,
            next_attempt_at: self.next_attempt_at.and_then(millis_to_datetime),
            updated_at,
            id: self.id,
        })
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Database(DbError::Serialization(e.to_string())))
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Queue is full ({capacity} actions) and holds only critical/high priority work")]
    QueueFull { capacity: usize },

    #[error("Stored action {id} is corrupted: {details}")]
    Corrupt { id: String, details: String },
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::NewAction;
    use chrono::Duration;
    use serde_json::json;

    fn create_test_store(capacity: usize) -> SqliteActionStore {
        let db = Arc::new(Database::in_memory().expect("Failed to create test DB"));
        SqliteActionStore::with_capacity(db, capacity)
    }

    fn action(entity: &str, priority: ActionPriority, age_secs: i64) -> OfflineAction {
        let mut action = OfflineAction::new(
            NewAction::new(
                ActionKind::Create,
                entity,
                ActionPayload::json(json!({"title": entity})),
                ActionTarget::post("https://desk.example.com/api/tickets"),
            )
            .with_priority(priority),
            3,
        );
        action.enqueued_at = Utc::now() - Duration::seconds(age_secs);
        action
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = create_test_store(10);
        let original = action("ticket", ActionPriority::High, 0);

        let outcome = store.put(&original).await.unwrap();
        assert!(outcome.inserted);
        assert!(outcome.evicted.is_empty());

        let loaded = store.get(&original.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.entity, "ticket");
        assert_eq!(loaded.payload, original.payload);
        assert_eq!(loaded.target, original.target);
        assert_eq!(loaded.status, ActionStatus::Queued);
        assert_eq!(
            loaded.enqueued_at.timestamp_millis(),
            original.enqueued_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_put_is_upsert() {
        let store = create_test_store(10);
        let mut a = action("ticket", ActionPriority::Medium, 0);
        store.put(&a).await.unwrap();

        a.attempts = 2;
        a.last_error = Some("HTTP 503".to_string());
        let outcome = store.put(&a).await.unwrap();

        assert!(!outcome.inserted);
        assert_eq!(store.count().await.unwrap(), 1);
        let loaded = store.get(&a.id).await.unwrap().unwrap();
        assert_eq!(loaded.attempts, 2);
        assert_eq!(loaded.last_error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn test_get_all_orders_by_priority_then_age() {
        let store = create_test_store(10);
        let low = action("a", ActionPriority::Low, 40);
        let critical_old = action("b", ActionPriority::Critical, 30);
        let medium = action("c", ActionPriority::Medium, 20);
        let critical_new = action("d", ActionPriority::Critical, 10);

        for a in [&low, &critical_old, &medium, &critical_new] {
            store.put(a).await.unwrap();
        }

        let ids: Vec<String> = store
            .get_all(&ActionFilter::all())
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec![critical_old.id, critical_new.id, medium.id, low.id]);
    }

    #[tokio::test]
    async fn test_get_all_filters() {
        let store = create_test_store(10);
        let ticket = action("ticket", ActionPriority::High, 0);
        let comment = action("comment", ActionPriority::Low, 0);
        let mut backing_off = action("ticket", ActionPriority::Low, 0);
        backing_off.next_attempt_at = Some(Utc::now() + Duration::minutes(5));

        for a in [&ticket, &comment, &backing_off] {
            store.put(a).await.unwrap();
        }

        let tickets = store
            .get_all(&ActionFilter::all().with_entity("ticket"))
            .await
            .unwrap();
        assert_eq!(tickets.len(), 2);

        let low = store
            .get_all(&ActionFilter::all().with_priority(ActionPriority::Low))
            .await
            .unwrap();
        assert_eq!(low.len(), 2);

        let ready = store.get_all(&ActionFilter::ready(Utc::now())).await.unwrap();
        assert_eq!(ready.len(), 2);
        assert!(ready.iter().all(|a| a.id != backing_off.id));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = create_test_store(10);
        let a = action("ticket", ActionPriority::High, 0);
        store.put(&a).await.unwrap();

        assert!(store.delete(&a.id).await.unwrap());
        assert!(!store.delete(&a.id).await.unwrap());
        assert!(!store.delete("never-existed").await.unwrap());
        assert!(store.get(&a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_does_not_resurrect() {
        let store = create_test_store(10);
        let mut a = action("ticket", ActionPriority::High, 0);
        store.put(&a).await.unwrap();
        store.clear().await.unwrap();

        a.attempts = 1;
        assert!(!store.update(&a).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_eviction_prefers_oldest_low() {
        let store = create_test_store(3);
        let oldest = action("ticket", ActionPriority::Low, 30);
        let middle = action("ticket", ActionPriority::Low, 20);
        let newest = action("ticket", ActionPriority::Low, 10);
        for a in [&oldest, &middle, &newest] {
            store.put(a).await.unwrap();
        }

        let incoming = action("ticket", ActionPriority::Low, 0);
        let outcome = store.put(&incoming).await.unwrap();

        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].id, oldest.id);
        assert_eq!(store.count().await.unwrap(), 3);
        assert!(store.get(&oldest.id).await.unwrap().is_none());
        assert!(store.get(&incoming.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_eviction_skips_protected_work() {
        let store = create_test_store(3);
        let critical = action("ticket", ActionPriority::Critical, 50);
        let medium = action("comment", ActionPriority::Medium, 5);
        let high = action("ticket", ActionPriority::High, 40);
        for a in [&critical, &medium, &high] {
            store.put(a).await.unwrap();
        }

        let outcome = store
            .put(&action("ticket", ActionPriority::Critical, 0))
            .await
            .unwrap();

        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].id, medium.id);
        assert!(store.get(&critical.id).await.unwrap().is_some());
        assert!(store.get(&high.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_full_of_protected_work_rejects() {
        let store = create_test_store(2);
        store.put(&action("ticket", ActionPriority::Critical, 20)).await.unwrap();
        store.put(&action("ticket", ActionPriority::High, 10)).await.unwrap();

        let rejected = store.put(&action("ticket", ActionPriority::Critical, 0)).await;
        assert!(matches!(rejected, Err(StoreError::QueueFull { capacity: 2 })));

        let rejected = store.put(&action("comment", ActionPriority::Low, 0)).await;
        assert!(matches!(rejected, Err(StoreError::QueueFull { .. })));

        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = create_test_store(10);
        let mut in_flight = action("attachment", ActionPriority::High, 30);
        in_flight.status = ActionStatus::Syncing;
        store.put(&in_flight).await.unwrap();
        store.put(&action("ticket", ActionPriority::High, 20)).await.unwrap();
        store.put(&action("ticket", ActionPriority::Low, 10)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.syncing, 1);
        assert_eq!(stats.by_priority.get(&ActionPriority::High), Some(&2));
        assert_eq!(stats.by_priority.get(&ActionPriority::Low), Some(&1));
        assert_eq!(stats.by_entity.get("ticket"), Some(&2));
        assert_eq!(
            stats.oldest_enqueued_at.map(|t| t.timestamp_millis()),
            Some(in_flight.enqueued_at.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn test_empty_stats() {
        let store = create_test_store(10);
        let stats = store.stats().await.unwrap();

        assert_eq!(stats, StoreStats::default());
    }

    #[tokio::test]
    async fn test_reset_in_flight_and_reschedule() {
        let store = create_test_store(10);
        let mut stuck = action("ticket", ActionPriority::High, 0);
        stuck.status = ActionStatus::Syncing;
        let mut waiting = action("comment", ActionPriority::Low, 0);
        waiting.next_attempt_at = Some(Utc::now() + Duration::hours(1));
        store.put(&stuck).await.unwrap();
        store.put(&waiting).await.unwrap();

        assert_eq!(store.reset_in_flight().await.unwrap(), 1);
        assert_eq!(store.get_all(&ActionFilter::ready(Utc::now())).await.unwrap().len(), 1);

        assert_eq!(store.reschedule_all().await.unwrap(), 1);
        assert_eq!(store.get_all(&ActionFilter::ready(Utc::now())).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_purge_older_than() {
        let store = create_test_store(10);
        let stale = action("ticket", ActionPriority::Medium, 3600);
        let fresh = action("ticket", ActionPriority::Medium, 10);
        store.put(&stale).await.unwrap();
        store.put(&fresh).await.unwrap();

        let purged = store
            .purge_older_than(Utc::now() - Duration::minutes(30))
            .await
            .unwrap();

        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].id, stale.id);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_reported() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = SqliteActionStore::new(db.clone());
        let a = action("ticket", ActionPriority::High, 0);
        store.put(&a).await.unwrap();

        db.execute(
            "UPDATE offline_actions SET payload = 'not json' WHERE id = ?1",
            params![a.id],
        )
        .unwrap();

        let result = store.get(&a.id).await;
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = create_test_store(10);
        let mut a = action("ticket", ActionPriority::High, 0);
        a.attempts = 1;
        store.put(&a).await.unwrap();

        let claimed = store.claim(&a.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.status, ActionStatus::Syncing);
        assert_eq!(claimed.attempts, 1);

        // A second claimer sees it in flight
        assert!(store.claim(&a.id, Utc::now()).await.unwrap().is_none());
        assert!(store.claim("never-existed", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_backoff() {
        let store = create_test_store(10);
        let mut a = action("ticket", ActionPriority::Low, 0);
        a.next_attempt_at = Some(Utc::now() + Duration::seconds(60));
        store.put(&a).await.unwrap();

        assert!(store.claim(&a.id, Utc::now()).await.unwrap().is_none());
        assert_eq!(
            store.get(&a.id).await.unwrap().unwrap().status,
            ActionStatus::Queued
        );

        let later = Utc::now() + Duration::seconds(61);
        assert!(store.claim(&a.id, later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_claim_of_corrupt_row_leaves_it_queued() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = SqliteActionStore::new(db.clone());
        let a = action("ticket", ActionPriority::High, 0);
        store.put(&a).await.unwrap();
        db.execute(
            "UPDATE offline_actions SET target = '{' WHERE id = ?1",
            params![a.id],
        )
        .unwrap();

        let result = store.claim(&a.id, Utc::now()).await;
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));

        let status: String = db
            .query_row(
                "SELECT status FROM offline_actions WHERE id = ?1",
                params![a.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "queued");
    }

    #[tokio::test]
    async fn test_unknown_status_is_corrupt() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = SqliteActionStore::new(db.clone());
        let a = action("ticket", ActionPriority::High, 0);
        store.put(&a).await.unwrap();

        db.execute(
            "UPDATE offline_actions SET status = 'bogus' WHERE id = ?1",
            params![a.id],
        )
        .unwrap();

        match store.get(&a.id).await {
            Err(StoreError::Corrupt { id, details }) => {
                assert_eq!(id, a.id);
                assert!(details.contains("status"));
            }
            other => panic!("expected corrupt status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_all_skips_corrupt_rows() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = SqliteActionStore::new(db.clone());
        let critical = action("ticket", ActionPriority::Critical, 10);
        let low = action("comment", ActionPriority::Low, 20);
        store.put(&critical).await.unwrap();
        store.put(&low).await.unwrap();

        db.execute(
            "UPDATE offline_actions SET payload = 'not json' WHERE id = ?1",
            params![low.id],
        )
        .unwrap();

        let ready = store.get_all(&ActionFilter::ready(Utc::now())).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, critical.id);
        // Still stored until removed explicitly
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_remove_corrupt() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = SqliteActionStore::new(db.clone());
        let healthy = action("ticket", ActionPriority::High, 0);
        let broken = action("comment", ActionPriority::Low, 0);
        store.put(&healthy).await.unwrap();
        store.put(&broken).await.unwrap();

        db.execute(
            "UPDATE offline_actions SET payload = 'not json' WHERE id = ?1",
            params![broken.id],
        )
        .unwrap();

        let removed = store.remove_corrupt().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, broken.id);
        assert_eq!(removed[0].entity, "comment");
        assert!(removed[0].details.starts_with("payload"));

        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.remove_corrupt().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_eviction_of_corrupt_victim() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = SqliteActionStore::with_capacity(db.clone(), 2);
        let broken = action("comment", ActionPriority::Low, 30);
        store.put(&broken).await.unwrap();
        store.put(&action("ticket", ActionPriority::High, 20)).await.unwrap();

        db.execute(
            "UPDATE offline_actions SET payload = 'not json' WHERE id = ?1",
            params![broken.id],
        )
        .unwrap();

        let incoming = action("ticket", ActionPriority::Medium, 0);
        let outcome = store.put(&incoming).await.unwrap();

        assert!(outcome.evicted.is_empty());
        assert_eq!(outcome.corrupt.len(), 1);
        assert_eq!(outcome.corrupt[0].id, broken.id);
        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.get(&incoming.id).await.unwrap().is_some());
    }
}
