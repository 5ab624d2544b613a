//! Append-only audit store: activity records and field-version records.
//!
//! Lives in its own database file with its own lifetime. Writes come only
//! from the activity logger's worker thread; everything else reads or prunes.

use crate::activity::{ActivityAction, AuditRequest, ResourceType, AUDIT_FAILURE_TARGET};
use crate::clock::{from_db_timestamp, to_db_timestamp};
use crate::contract::UserId;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("audit store io error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Record Types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ActivityLogEntry {
    pub id: i64,
    pub user_id: UserId,
    pub action: ActivityAction,
    pub resource_type: ResourceType,
    pub resource_id: Option<i64>,
    pub resource_title: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ActivityLogEntry {
    /// One-line description, e.g. `Viewed contract 'Lease'`.
    pub fn summary(&self) -> String {
        let mut line = format!("{} {}", self.action.verb(), self.resource_type.as_str());
        if let Some(title) = &self.resource_title {
            line.push_str(&format!(" '{title}'"));
        }
        if !self.success {
            line.push_str(" (failed)");
        }
        line
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldVersionEntry {
    pub id: i64,
    pub contract_id: i64,
    pub user_id: UserId,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewCount {
    pub resource_id: i64,
    pub resource_title: Option<String>,
    pub view_count: i64,
}

/// Outcome of one prune. Each table is pruned on its own; a step that failed
/// leaves its count `None` and its message in `errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub activity_deleted: Option<usize>,
    pub versions_deleted: Option<usize>,
    pub errors: Vec<String>,
}

impl PruneReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditCounts {
    pub activity_logs: i64,
    pub contract_versions: i64,
}

// ── Store ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AuditStore {
    conn: Arc<Mutex<Connection>>,
}

impl AuditStore {
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        info!("Opening audit database at {}", path.display());
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, AuditError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AuditError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS activity_logs (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id         INTEGER NOT NULL,
                action          TEXT NOT NULL,
                resource_type   TEXT NOT NULL,
                resource_id     INTEGER,
                resource_title  TEXT,
                success         INTEGER NOT NULL DEFAULT 1,
                error_message   TEXT,
                ip_address      TEXT,
                user_agent      TEXT,
                timestamp       TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS contract_versions (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                contract_id     INTEGER NOT NULL,
                user_id         INTEGER NOT NULL,
                field_name      TEXT NOT NULL,
                old_value       TEXT,
                new_value       TEXT,
                timestamp       TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_activity_user_time
                ON activity_logs(user_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_activity_resource
                ON activity_logs(resource_type, resource_id);
            CREATE INDEX IF NOT EXISTS idx_activity_action
                ON activity_logs(action);
            CREATE INDEX IF NOT EXISTS idx_activity_time
                ON activity_logs(timestamp);
            CREATE INDEX IF NOT EXISTS idx_versions_contract
                ON contract_versions(contract_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_versions_time
                ON contract_versions(timestamp);
            ",
        )?;
        debug!("Audit schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Synchronous insert for the writer thread. Must not be called from
    /// inside an async task.
    pub(crate) fn write_blocking(&self, request: &AuditRequest) -> Result<(), AuditError> {
        let conn = self.conn.blocking_lock();
        match request {
            AuditRequest::Activity { event, at } => {
                conn.execute(
                    "INSERT INTO activity_logs
                     (user_id, action, resource_type, resource_id, resource_title,
                      success, error_message, ip_address, user_agent, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        event.user_id,
                        event.action.as_str(),
                        event.resource_type.as_str(),
                        event.resource_id,
                        event.resource_title,
                        event.success,
                        event.error_message,
                        event.ip_address,
                        event.user_agent,
                        to_db_timestamp(at),
                    ],
                )?;
            }
            AuditRequest::FieldVersion { change, at } => {
                conn.execute(
                    "INSERT INTO contract_versions
                     (contract_id, user_id, field_name, old_value, new_value, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        change.contract_id,
                        change.user_id,
                        change.field_name,
                        change.old_value,
                        change.new_value,
                        to_db_timestamp(at),
                    ],
                )?;
            }
        }
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────

    /// Most recent activity of one user, newest first.
    pub async fn recent_activity(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<ActivityLogEntry>, AuditError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activity_logs
             WHERE user_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user_id, limit as i64], activity_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Activity recorded against one resource, newest first.
    pub async fn activity_for_resource(
        &self,
        resource_type: ResourceType,
        resource_id: i64,
        limit: usize,
    ) -> Result<Vec<ActivityLogEntry>, AuditError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activity_logs
             WHERE resource_type = ?1 AND resource_id = ?2
             ORDER BY timestamp DESC, id DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![resource_type.as_str(), resource_id, limit as i64],
            activity_from_row,
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Field-level version history of a contract, newest first.
    pub async fn contract_history(
        &self,
        contract_id: i64,
        limit: usize,
    ) -> Result<Vec<FieldVersionEntry>, AuditError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, contract_id, user_id, field_name, old_value, new_value, timestamp
             FROM contract_versions
             WHERE contract_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![contract_id, limit as i64], |row| {
            Ok(FieldVersionEntry {
                id: row.get(0)?,
                contract_id: row.get(1)?,
                user_id: row.get(2)?,
                field_name: row.get(3)?,
                old_value: row.get(4)?,
                new_value: row.get(5)?,
                timestamp: timestamp_column(row, 6)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Resources of one type ranked by view count since `since`.
    pub async fn most_viewed(
        &self,
        resource_type: ResourceType,
        limit: usize,
        since: DateTime<Utc>,
    ) -> Result<Vec<ViewCount>, AuditError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT resource_id, resource_title, COUNT(id) AS view_count
             FROM activity_logs
             WHERE action = ?1 AND resource_type = ?2
               AND timestamp >= ?3 AND resource_id IS NOT NULL
             GROUP BY resource_id, resource_title
             ORDER BY view_count DESC, resource_id ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                ActivityAction::View.as_str(),
                resource_type.as_str(),
                to_db_timestamp(&since),
                limit as i64
            ],
            |row| {
                Ok(ViewCount {
                    resource_id: row.get(0)?,
                    resource_title: row.get(1)?,
                    view_count: row.get(2)?,
                })
            },
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub async fn counts(&self) -> Result<AuditCounts, AuditError> {
        let conn = self.conn.lock().await;
        Ok(AuditCounts {
            activity_logs: conn.query_row("SELECT COUNT(*) FROM activity_logs", [], |r| r.get(0))?,
            contract_versions: conn.query_row("SELECT COUNT(*) FROM contract_versions", [], |r| {
                r.get(0)
            })?,
        })
    }

    pub async fn count_activity_before(&self, cutoff: DateTime<Utc>) -> Result<i64, AuditError> {
        let conn = self.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM activity_logs WHERE timestamp < ?1",
            params![to_db_timestamp(&cutoff)],
            |r| r.get(0),
        )?)
    }

    pub async fn count_versions_before(&self, cutoff: DateTime<Utc>) -> Result<i64, AuditError> {
        let conn = self.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM contract_versions WHERE timestamp < ?1",
            params![to_db_timestamp(&cutoff)],
            |r| r.get(0),
        )?)
    }

    // ── Retention ───────────────────────────────────────────────

    /// Delete activity older than `activity_cutoff` and versions older than
    /// `version_cutoff`, `batch_size` rows per lock acquisition. A failure in
    /// one table does not stop the other.
    pub async fn prune(
        &self,
        activity_cutoff: DateTime<Utc>,
        version_cutoff: DateTime<Utc>,
        batch_size: usize,
    ) -> PruneReport {
        let mut report = PruneReport::default();
        match self
            .delete_in_batches("activity_logs", activity_cutoff, batch_size)
            .await
        {
            Ok(n) => report.activity_deleted = Some(n),
            Err(e) => {
                error!(target: AUDIT_FAILURE_TARGET, "Activity log prune failed: {e}");
                report.errors.push(format!("activity_logs: {e}"));
            }
        }
        match self
            .delete_in_batches("contract_versions", version_cutoff, batch_size)
            .await
        {
            Ok(n) => report.versions_deleted = Some(n),
            Err(e) => {
                error!(target: AUDIT_FAILURE_TARGET, "Contract version prune failed: {e}");
                report.errors.push(format!("contract_versions: {e}"));
            }
        }
        report
    }

    async fn delete_in_batches(
        &self,
        table: &'static str,
        cutoff: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<usize, AuditError> {
        let sql = format!(
            "DELETE FROM {table} WHERE id IN
             (SELECT id FROM {table} WHERE timestamp < ?1 ORDER BY id LIMIT ?2)"
        );
        let cutoff = to_db_timestamp(&cutoff);
        let mut total = 0;
        loop {
            let deleted = {
                let conn = self.conn.lock().await;
                conn.execute(&sql, params![cutoff, batch_size.max(1) as i64])?
            };
            total += deleted;
            if deleted < batch_size.max(1) {
                break;
            }
            tokio::task::yield_now().await;
        }
        Ok(total)
    }

    #[cfg(test)]
    pub(crate) async fn drop_table(&self, table: &str) -> Result<(), AuditError> {
        self.conn
            .lock()
            .await
            .execute_batch(&format!("DROP TABLE {table};"))?;
        Ok(())
    }
}

const ACTIVITY_COLUMNS: &str = "id, user_id, action, resource_type, resource_id, resource_title, \
     success, error_message, ip_address, user_agent, timestamp";

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<ActivityLogEntry> {
    let action: String = row.get(2)?;
    let resource_type: String = row.get(3)?;
    Ok(ActivityLogEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        action: ActivityAction::parse(&action)
            .ok_or_else(|| bad_column(2, format!("unknown action {action}")))?,
        resource_type: ResourceType::parse(&resource_type)
            .ok_or_else(|| bad_column(3, format!("unknown resource type {resource_type}")))?,
        resource_id: row.get(4)?,
        resource_title: row.get(5)?,
        success: row.get(6)?,
        error_message: row.get(7)?,
        ip_address: row.get(8)?,
        user_agent: row.get(9)?,
        timestamp: timestamp_column(row, 10)?,
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    from_db_timestamp(&raw).map_err(|e| bad_column(idx, e.to_string()))
}

fn bad_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityEvent, Actor, FieldVersionChange};
    use chrono::{Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn activity(
        user: UserId,
        action: ActivityAction,
        resource: Option<(i64, &str)>,
        at: DateTime<Utc>,
    ) -> AuditRequest {
        let mut event = ActivityEvent::new(&Actor::user(user), action, ResourceType::Contract);
        if let Some((id, title)) = resource {
            event = event.resource(id, title);
        }
        AuditRequest::Activity { event, at }
    }

    fn version(contract_id: i64, field: &str, at: DateTime<Utc>) -> AuditRequest {
        AuditRequest::FieldVersion {
            change: FieldVersionChange {
                contract_id,
                user_id: 1,
                field_name: field.into(),
                old_value: Some("a".into()),
                new_value: Some("b".into()),
            },
            at,
        }
    }

    // The writer path uses blocking_lock, so drive it off the runtime.
    async fn write_all(store: &AuditStore, requests: Vec<AuditRequest>) {
        let store = store.clone();
        tokio::task::spawn_blocking(move || {
            for request in &requests {
                store.write_blocking(request).unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_recent_activity_newest_first() {
        let store = AuditStore::open_in_memory().unwrap();
        write_all(
            &store,
            vec![
                activity(1, ActivityAction::Create, Some((1, "A")), base()),
                activity(1, ActivityAction::View, Some((1, "A")), base() + Duration::minutes(1)),
                activity(2, ActivityAction::View, Some((1, "A")), base() + Duration::minutes(2)),
            ],
        )
        .await;

        let recent = store.recent_activity(1, 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, ActivityAction::View);
        assert_eq!(recent[1].action, ActivityAction::Create);
        assert_eq!(recent[0].summary(), "Viewed contract 'A'");
    }

    #[tokio::test]
    async fn test_most_viewed_ranks_views_in_window() {
        let store = AuditStore::open_in_memory().unwrap();
        let now = base();
        write_all(
            &store,
            vec![
                activity(1, ActivityAction::View, Some((1, "A")), now - Duration::days(1)),
                activity(2, ActivityAction::View, Some((2, "B")), now - Duration::days(1)),
                activity(3, ActivityAction::View, Some((2, "B")), now - Duration::days(2)),
                activity(3, ActivityAction::View, Some((1, "A")), now - Duration::days(40)),
                activity(3, ActivityAction::Update, Some((1, "A")), now),
                activity(3, ActivityAction::View, None, now),
            ],
        )
        .await;

        let ranked = store
            .most_viewed(ResourceType::Contract, 10, now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(
            ranked,
            vec![
                ViewCount {
                    resource_id: 2,
                    resource_title: Some("B".into()),
                    view_count: 2
                },
                ViewCount {
                    resource_id: 1,
                    resource_title: Some("A".into()),
                    view_count: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_prune_respects_separate_cutoffs() {
        let store = AuditStore::open_in_memory().unwrap();
        let now = base();
        write_all(
            &store,
            vec![
                activity(1, ActivityAction::View, Some((1, "A")), now - Duration::days(31)),
                activity(1, ActivityAction::View, Some((1, "A")), now - Duration::days(29)),
                version(1, "title", now - Duration::days(60)),
                version(1, "title", now - Duration::days(91)),
            ],
        )
        .await;

        let report = store
            .prune(now - Duration::days(30), now - Duration::days(90), 1)
            .await;
        assert_eq!(
            report,
            PruneReport {
                activity_deleted: Some(1),
                versions_deleted: Some(1),
                errors: vec![],
            }
        );
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.activity_logs, 1);
        assert_eq!(counts.contract_versions, 1);
    }

    #[tokio::test]
    async fn test_prune_continues_past_failed_activity_step() {
        let store = AuditStore::open_in_memory().unwrap();
        let now = base();
        write_all(
            &store,
            vec![
                version(1, "title", now - Duration::days(91)),
                version(1, "title", now - Duration::days(10)),
            ],
        )
        .await;
        store.drop_table("activity_logs").await.unwrap();

        let report = store
            .prune(now - Duration::days(30), now - Duration::days(90), 10)
            .await;
        assert!(!report.is_complete());
        assert_eq!(report.activity_deleted, None);
        assert_eq!(report.versions_deleted, Some(1));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("activity_logs"));
        assert_eq!(store.contract_history(1, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_contract_history_filters_by_contract() {
        let store = AuditStore::open_in_memory().unwrap();
        write_all(
            &store,
            vec![
                version(1, "title", base()),
                version(2, "title", base()),
                version(1, "status", base() + Duration::seconds(1)),
            ],
        )
        .await;

        let history = store.contract_history(1, 10).await.unwrap();
        let fields: Vec<_> = history.iter().map(|v| v.field_name.as_str()).collect();
        assert_eq!(fields, vec!["status", "title"]);
    }
}
