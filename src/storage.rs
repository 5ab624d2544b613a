//! SQLite-backed primary store: clients, contracts, status history,
//! documents, and signature envelopes.
//!
//! Every mutation runs through [`Storage::write`], which wraps the closure in
//! one transaction: either everything it did commits, or nothing does.

use crate::clock::{from_db_date, from_db_timestamp, to_db_date, to_db_timestamp};
use crate::contract::*;
use crate::documents::{DocumentRecord, DocumentType, NewDocument};
use crate::error::{Error, Result};
use crate::signature::{EnvelopeStatus, SignatureEnvelope};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

// ── Persistent Store ────────────────────────────────────────────────

#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS clients (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                name            TEXT NOT NULL,
                organization    TEXT,
                email           TEXT,
                phone           TEXT,
                address         TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS contracts (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                title           TEXT NOT NULL,
                description     TEXT,
                client_id       INTEGER NOT NULL REFERENCES clients(id),
                contract_type   TEXT NOT NULL,
                status          TEXT NOT NULL DEFAULT 'draft',
                contract_value  TEXT,
                effective_date  TEXT,
                expiration_date TEXT,
                renewal_date    TEXT,
                file_path       TEXT,
                file_name       TEXT,
                file_size       INTEGER,
                mime_type       TEXT,
                extracted_text  TEXT,
                created_by      INTEGER NOT NULL,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                deleted_at      TEXT
            );

            CREATE TABLE IF NOT EXISTS contract_status_history (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                contract_id     INTEGER NOT NULL REFERENCES contracts(id) ON DELETE CASCADE,
                old_status      TEXT,
                new_status      TEXT NOT NULL,
                changed_by      INTEGER NOT NULL,
                reason          TEXT,
                changed_at      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS contract_documents (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                contract_id         INTEGER NOT NULL REFERENCES contracts(id) ON DELETE CASCADE,
                file_path           TEXT NOT NULL,
                file_name           TEXT NOT NULL,
                original_filename   TEXT NOT NULL,
                file_size           INTEGER NOT NULL,
                mime_type           TEXT NOT NULL,
                extracted_text      TEXT,
                document_type       TEXT NOT NULL DEFAULT 'contract',
                description         TEXT,
                uploaded_by         INTEGER NOT NULL,
                uploaded_at         TEXT NOT NULL,
                is_primary          INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS signature_envelopes (
                contract_id     INTEGER PRIMARY KEY REFERENCES contracts(id) ON DELETE CASCADE,
                envelope_id     TEXT NOT NULL UNIQUE,
                status          TEXT NOT NULL,
                sent_at         TEXT NOT NULL,
                completed_at    TEXT,
                recipient_email TEXT NOT NULL,
                recipient_name  TEXT,
                document_id     INTEGER REFERENCES contract_documents(id) ON DELETE SET NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_contracts_status
                ON contracts(status);
            CREATE INDEX IF NOT EXISTS idx_contracts_client
                ON contracts(client_id);
            CREATE INDEX IF NOT EXISTS idx_contracts_deleted
                ON contracts(deleted_at);
            CREATE INDEX IF NOT EXISTS idx_contracts_expiration
                ON contracts(expiration_date);
            CREATE INDEX IF NOT EXISTS idx_status_history_contract
                ON contract_status_history(contract_id, changed_at);
            CREATE INDEX IF NOT EXISTS idx_documents_contract
                ON contract_documents(contract_id, uploaded_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_one_primary
                ON contract_documents(contract_id) WHERE is_primary = 1;
            ",
        )?;

        debug!("Database schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside a transaction; commit if it returns `Ok`.
    pub async fn write<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let value = f(&Tx { conn: &tx })?;
        tx.commit()?;
        Ok(value)
    }

    pub async fn read<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().await;
        f(&Tx { conn: &conn })
    }

    // Synchronous write for code running inside a blocking collaborator.
    // Fails instead of waiting if the connection is held.
    #[cfg(test)]
    pub(crate) fn write_now<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let Ok(mut conn) = self.conn.try_lock() else {
            return Err(Error::Validation("primary store connection is busy".into()));
        };
        let tx = conn.transaction()?;
        let value = f(&Tx { conn: &tx })?;
        tx.commit()?;
        Ok(value)
    }
}

/// Statement-level access to the primary store, valid for one
/// [`Storage::write`] or [`Storage::read`] call.
pub struct Tx<'a> {
    conn: &'a Connection,
}

impl Tx<'_> {
    // ── Clients ─────────────────────────────────────────────────

    pub fn insert_client(&self, client: &NewClient, now: DateTime<Utc>) -> Result<ClientRecord> {
        let now_str = to_db_timestamp(&now);
        self.conn.execute(
            "INSERT INTO clients (name, organization, email, phone, address, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                client.name.trim(),
                client.organization,
                client.email,
                client.phone,
                client.address,
                now_str
            ],
        )?;
        self.require_client(self.conn.last_insert_rowid())
    }

    pub fn get_client(&self, id: i64) -> Result<Option<ClientRecord>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"),
                params![id],
                client_from_row,
            )
            .optional()?)
    }

    pub fn require_client(&self, id: i64) -> Result<ClientRecord> {
        self.get_client(id)?
            .ok_or_else(|| Error::not_found("client", id))
    }

    pub fn list_clients(&self) -> Result<Vec<ClientSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CLIENT_COLUMNS},
                    (SELECT COUNT(*) FROM contracts c
                     WHERE c.client_id = clients.id AND c.deleted_at IS NULL)
             FROM clients ORDER BY name COLLATE NOCASE, id"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(ClientSummary {
                client: client_from_row(row)?,
                contract_count: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ── Contracts ───────────────────────────────────────────────

    pub fn insert_contract(
        &self,
        contract: &NewContract,
        created_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<ContractRecord> {
        self.require_client(contract.client_id)?;
        let now_str = to_db_timestamp(&now);
        let legacy = contract.legacy_document.as_ref();
        self.conn.execute(
            "INSERT INTO contracts
             (title, description, client_id, contract_type, status, contract_value,
              effective_date, expiration_date, renewal_date,
              file_path, file_name, file_size, mime_type, extracted_text,
              created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)",
            params![
                contract.title.trim(),
                contract.description,
                contract.client_id,
                contract.contract_type,
                contract.status.as_str(),
                contract.contract_value.map(|v| v.to_string()),
                contract.effective_date.as_ref().map(to_db_date),
                contract.expiration_date.as_ref().map(to_db_date),
                contract.renewal_date.as_ref().map(to_db_date),
                legacy.map(|l| l.file_path.as_str()),
                legacy.map(|l| l.file_name.as_str()),
                legacy.and_then(|l| l.file_size),
                legacy.and_then(|l| l.mime_type.as_deref()),
                legacy.and_then(|l| l.extracted_text.as_deref()),
                created_by,
                now_str,
            ],
        )?;
        self.require_contract(self.conn.last_insert_rowid())
    }

    pub fn load_contract(&self, id: i64) -> Result<Option<ContractRecord>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {CONTRACT_COLUMNS} FROM contracts WHERE id = ?1"),
                params![id],
                contract_from_row,
            )
            .optional()?)
    }

    pub fn require_contract(&self, id: i64) -> Result<ContractRecord> {
        self.load_contract(id)?
            .ok_or_else(|| Error::not_found("contract", id))
    }

    /// Persist every mutable column of `contract`.
    pub fn save_contract(&self, contract: &ContractRecord) -> Result<()> {
        self.require_client(contract.client_id)?;
        let changed = self.conn.execute(
            "UPDATE contracts SET
                title = ?1, description = ?2, client_id = ?3, contract_type = ?4,
                status = ?5, contract_value = ?6, effective_date = ?7,
                expiration_date = ?8, renewal_date = ?9, updated_at = ?10, deleted_at = ?11
             WHERE id = ?12",
            params![
                contract.title,
                contract.description,
                contract.client_id,
                contract.contract_type,
                contract.status.as_str(),
                contract.contract_value.map(|v| v.to_string()),
                contract.effective_date.as_ref().map(to_db_date),
                contract.expiration_date.as_ref().map(to_db_date),
                contract.renewal_date.as_ref().map(to_db_date),
                to_db_timestamp(&contract.updated_at),
                contract.deleted_at.as_ref().map(to_db_timestamp),
                contract.id,
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found("contract", contract.id));
        }
        Ok(())
    }

    pub fn list_contracts(
        &self,
        include_deleted: bool,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ContractRecord>> {
        let filter = if include_deleted {
            ""
        } else {
            "WHERE deleted_at IS NULL"
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONTRACT_COLUMNS} FROM contracts {filter}
             ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], contract_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Search live contracts. Title matches rank ahead of matches on
    /// description or document text.
    pub fn search_contracts(&self, query: &ContractQuery, today: NaiveDate) -> Result<Vec<ContractRecord>> {
        let mut sql = format!("SELECT {CONTRACT_COLUMNS} FROM contracts c WHERE c.deleted_at IS NULL");
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut order = String::from(" ORDER BY");

        if let Some(term) = query.term.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let n = param_values.len() + 1;
            sql.push_str(&format!(
                " AND (LOWER(c.title) LIKE ?{n}
                       OR LOWER(COALESCE(c.description, '')) LIKE ?{n}
                       OR LOWER(COALESCE(c.extracted_text, '')) LIKE ?{n}
                       OR EXISTS (SELECT 1 FROM contract_documents d
                                  WHERE d.contract_id = c.id
                                    AND LOWER(COALESCE(d.extracted_text, '')) LIKE ?{n}))"
            ));
            order.push_str(&format!(" CASE WHEN LOWER(c.title) LIKE ?{n} THEN 0 ELSE 1 END,"));
            param_values.push(Box::new(format!("%{}%", term.to_lowercase())));
        }

        if let Some(status) = query.status {
            sql.push_str(&format!(" AND c.status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.as_str()));
        }

        if let Some(client_id) = query.client_id {
            sql.push_str(&format!(" AND c.client_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(client_id));
        }

        if let Some(contract_type) = &query.contract_type {
            sql.push_str(&format!(" AND c.contract_type = ?{}", param_values.len() + 1));
            param_values.push(Box::new(contract_type.clone()));
        }

        if let Some(days) = query.expiring_within_days {
            let n = param_values.len() + 1;
            sql.push_str(&format!(
                " AND c.status = 'active' AND c.expiration_date IS NOT NULL
                  AND c.expiration_date >= ?{n} AND c.expiration_date <= ?{}",
                n + 1
            ));
            param_values.push(Box::new(to_db_date(&today)));
            param_values.push(Box::new(to_db_date(&(today + chrono::Duration::days(days)))));
        }

        sql.push_str(&order);
        sql.push_str(&format!(
            " c.created_at DESC, c.id DESC LIMIT ?{}",
            param_values.len() + 1
        ));
        param_values.push(Box::new(query.limit.unwrap_or(100) as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params_ref.as_slice(), contract_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Live, active contracts whose expiration date falls in `[from, until]`.
    pub fn expiring_contracts(&self, from: NaiveDate, until: NaiveDate) -> Result<Vec<ContractRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONTRACT_COLUMNS} FROM contracts
             WHERE deleted_at IS NULL AND status = 'active'
               AND expiration_date IS NOT NULL
               AND expiration_date >= ?1 AND expiration_date <= ?2
             ORDER BY expiration_date ASC, id ASC"
        ))?;
        let rows = stmt.query_map(
            params![to_db_date(&from), to_db_date(&until)],
            contract_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Live contracts per lifecycle status, in lifecycle order.
    pub fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM contracts
             WHERE deleted_at IS NULL GROUP BY status",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut raw = Vec::new();
        for row in rows {
            raw.push(row?);
        }
        Ok(ContractStatus::ALL
            .into_iter()
            .map(|status| StatusCount {
                status,
                count: raw
                    .iter()
                    .find(|(s, _)| s == status.as_str())
                    .map_or(0, |(_, n)| *n),
            })
            .collect())
    }

    pub fn deleted_count(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM contracts WHERE deleted_at IS NOT NULL",
            [],
            |r| r.get(0),
        )?)
    }

    // ── Status History ──────────────────────────────────────────

    pub fn append_history(&self, entry: &StatusHistoryEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO contract_status_history
             (contract_id, old_status, new_status, changed_by, reason, changed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.contract_id,
                entry.old_status.map(|s| s.as_str()),
                entry.new_status.as_str(),
                entry.changed_by,
                entry.reason,
                to_db_timestamp(&entry.changed_at),
            ],
        )?;
        Ok(())
    }

    /// Status changes of one contract, newest first.
    pub fn status_history(&self, contract_id: i64, limit: usize) -> Result<Vec<StatusHistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT contract_id, old_status, new_status, changed_by, reason, changed_at
             FROM contract_status_history WHERE contract_id = ?1
             ORDER BY changed_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![contract_id, limit as i64], history_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn count_status_history(&self, contract_id: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM contract_status_history WHERE contract_id = ?1",
            params![contract_id],
            |r| r.get(0),
        )?)
    }

    // ── Reporting ───────────────────────────────────────────────

    /// Contracts created in `[from, until)`, deleted ones included.
    pub fn count_created_between(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM contracts WHERE created_at >= ?1 AND created_at < ?2",
            params![to_db_timestamp(&from), to_db_timestamp(&until)],
            |r| r.get(0),
        )?)
    }

    /// Live contracts whose expiration date falls in `[from, until]`, any status.
    pub fn count_expiring_between(&self, from: NaiveDate, until: NaiveDate) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM contracts
             WHERE deleted_at IS NULL AND expiration_date IS NOT NULL
               AND expiration_date >= ?1 AND expiration_date <= ?2",
            params![to_db_date(&from), to_db_date(&until)],
            |r| r.get(0),
        )?)
    }

    /// Status changes in `[from, until)` across all contracts, oldest first,
    /// with the contract title and client name.
    pub fn status_changes_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<(StatusHistoryEntry, String, Option<String>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT h.contract_id, h.old_status, h.new_status, h.changed_by, h.reason,
                    h.changed_at, c.title, cl.name
             FROM contract_status_history h
             JOIN contracts c ON c.id = h.contract_id
             LEFT JOIN clients cl ON cl.id = c.client_id
             WHERE h.changed_at >= ?1 AND h.changed_at < ?2
             ORDER BY h.changed_at ASC, h.id ASC",
        )?;
        let rows = stmt.query_map(
            params![to_db_timestamp(&from), to_db_timestamp(&until)],
            |row| Ok((history_from_row(row)?, row.get(6)?, row.get(7)?)),
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Sum of the values of live contracts that have one.
    pub fn total_contract_value(&self) -> Result<Decimal> {
        let mut stmt = self.conn.prepare(
            "SELECT contract_value FROM contracts
             WHERE deleted_at IS NULL AND contract_value IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut total = Decimal::ZERO;
        for raw in rows {
            let raw = raw?;
            let value = raw
                .parse::<Decimal>()
                .map_err(|e| bad_column(0, e.to_string()))?;
            total += value;
        }
        Ok(total)
    }

    // ── Documents ───────────────────────────────────────────────

    /// Insert a document row. A primary upload first demotes the current
    /// primary in the same transaction.
    pub fn insert_document(&self, doc: &NewDocument) -> Result<DocumentRecord> {
        if doc.is_primary {
            self.clear_primary(doc.contract_id)?;
        }
        self.conn.execute(
            "INSERT INTO contract_documents
             (contract_id, file_path, file_name, original_filename, file_size, mime_type,
              extracted_text, document_type, description, uploaded_by, uploaded_at, is_primary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                doc.contract_id,
                doc.file_path,
                doc.file_name,
                doc.original_filename,
                doc.file_size,
                doc.mime_type,
                doc.extracted_text,
                doc.document_type.as_str(),
                doc.description,
                doc.uploaded_by,
                to_db_timestamp(&doc.uploaded_at),
                doc.is_primary,
            ],
        )?;
        self.require_document(self.conn.last_insert_rowid())
    }

    pub fn get_document(&self, id: i64) -> Result<Option<DocumentRecord>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM contract_documents WHERE id = ?1"),
                params![id],
                document_from_row,
            )
            .optional()?)
    }

    pub fn require_document(&self, id: i64) -> Result<DocumentRecord> {
        self.get_document(id)?
            .ok_or_else(|| Error::not_found("document", id))
    }

    /// Primary first, then newest upload first.
    pub fn list_documents(&self, contract_id: i64) -> Result<Vec<DocumentRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM contract_documents WHERE contract_id = ?1
             ORDER BY is_primary DESC, uploaded_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![contract_id], document_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn primary_document(&self, contract_id: i64) -> Result<Option<DocumentRecord>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM contract_documents
                     WHERE contract_id = ?1 AND is_primary = 1"
                ),
                params![contract_id],
                document_from_row,
            )
            .optional()?)
    }

    pub fn newest_document(&self, contract_id: i64) -> Result<Option<DocumentRecord>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM contract_documents WHERE contract_id = ?1
                     ORDER BY uploaded_at DESC, id DESC LIMIT 1"
                ),
                params![contract_id],
                document_from_row,
            )
            .optional()?)
    }

    pub fn count_documents(&self, contract_id: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM contract_documents WHERE contract_id = ?1",
            params![contract_id],
            |r| r.get(0),
        )?)
    }

    pub fn clear_primary(&self, contract_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE contract_documents SET is_primary = 0
             WHERE contract_id = ?1 AND is_primary = 1",
            params![contract_id],
        )?;
        Ok(())
    }

    /// Make `document_id` the only primary of its contract.
    pub fn mark_primary(&self, contract_id: i64, document_id: i64) -> Result<()> {
        self.clear_primary(contract_id)?;
        let changed = self.conn.execute(
            "UPDATE contract_documents SET is_primary = 1 WHERE id = ?1 AND contract_id = ?2",
            params![document_id, contract_id],
        )?;
        if changed == 0 {
            return Err(Error::not_found("document", document_id));
        }
        Ok(())
    }

    pub fn delete_document_row(&self, id: i64) -> Result<bool> {
        Ok(self
            .conn
            .execute("DELETE FROM contract_documents WHERE id = ?1", params![id])?
            > 0)
    }

    /// Contracts that still carry legacy single-document fields and have no
    /// document rows yet.
    pub fn contracts_with_legacy_documents(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id FROM contracts c
             WHERE c.file_path IS NOT NULL AND c.file_name IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM contract_documents d WHERE d.contract_id = c.id)
             ORDER BY c.id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ── Envelopes ───────────────────────────────────────────────

    pub fn load_envelope(&self, contract_id: i64) -> Result<Option<SignatureEnvelope>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {ENVELOPE_COLUMNS} FROM signature_envelopes WHERE contract_id = ?1"),
                params![contract_id],
                envelope_from_row,
            )
            .optional()?)
    }

    pub fn envelope_by_id(&self, envelope_id: &str) -> Result<Option<SignatureEnvelope>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {ENVELOPE_COLUMNS} FROM signature_envelopes WHERE envelope_id = ?1"),
                params![envelope_id],
                envelope_from_row,
            )
            .optional()?)
    }

    /// Insert or replace the envelope of a contract.
    pub fn save_envelope(&self, envelope: &SignatureEnvelope, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO signature_envelopes
             (contract_id, envelope_id, status, sent_at, completed_at,
              recipient_email, recipient_name, document_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(contract_id) DO UPDATE SET
                envelope_id = excluded.envelope_id,
                status = excluded.status,
                sent_at = excluded.sent_at,
                completed_at = excluded.completed_at,
                recipient_email = excluded.recipient_email,
                recipient_name = excluded.recipient_name,
                document_id = excluded.document_id,
                updated_at = excluded.updated_at",
            params![
                envelope.contract_id,
                envelope.envelope_id,
                envelope.status.as_str(),
                to_db_timestamp(&envelope.sent_at),
                envelope.completed_at.as_ref().map(to_db_timestamp),
                envelope.recipient_email,
                envelope.recipient_name,
                envelope.document_id,
                to_db_timestamp(&now),
            ],
        )?;
        Ok(())
    }

    // ── Purge ───────────────────────────────────────────────────

    /// Ids of contracts soft-deleted before `cutoff`, oldest first.
    pub fn soft_deleted_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM contracts
             WHERE deleted_at IS NOT NULL AND deleted_at < ?1
             ORDER BY deleted_at ASC, id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![to_db_timestamp(&cutoff), limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn count_soft_deleted_before(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM contracts WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
            params![to_db_timestamp(&cutoff)],
            |r| r.get(0),
        )?)
    }

    /// Every stored file belonging to a contract, legacy path included.
    pub fn document_paths(&self, contract_id: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_path FROM contract_documents WHERE contract_id = ?1
             UNION
             SELECT file_path FROM contracts WHERE id = ?1 AND file_path IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![contract_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Remove a contract row for good. History, documents and the envelope
    /// go with it.
    pub fn hard_delete_contract(&self, id: i64) -> Result<bool> {
        Ok(self
            .conn
            .execute("DELETE FROM contracts WHERE id = ?1", params![id])?
            > 0)
    }
}

// ── Row Mapping ─────────────────────────────────────────────────────

const CLIENT_COLUMNS: &str =
    "id, name, organization, email, phone, address, created_at, updated_at";

const CONTRACT_COLUMNS: &str = "id, title, description, client_id, contract_type, status, \
     contract_value, effective_date, expiration_date, renewal_date, \
     file_path, file_name, file_size, mime_type, extracted_text, \
     created_by, created_at, updated_at, deleted_at";

const DOCUMENT_COLUMNS: &str = "id, contract_id, file_path, file_name, original_filename, \
     file_size, mime_type, extracted_text, document_type, description, \
     uploaded_by, uploaded_at, is_primary";

const ENVELOPE_COLUMNS: &str = "envelope_id, contract_id, status, sent_at, completed_at, \
     recipient_email, recipient_name, document_id";

fn client_from_row(row: &Row<'_>) -> rusqlite::Result<ClientRecord> {
    Ok(ClientRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        organization: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        address: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
        updated_at: timestamp_column(row, 7)?,
    })
}

// Columns: contract_id, old_status, new_status, changed_by, reason, changed_at.
fn history_from_row(row: &Row<'_>) -> rusqlite::Result<StatusHistoryEntry> {
    let old: Option<String> = row.get(1)?;
    let new: String = row.get(2)?;
    Ok(StatusHistoryEntry {
        contract_id: row.get(0)?,
        old_status: match old {
            Some(s) => Some(
                RecordState::parse(&s)
                    .ok_or_else(|| bad_column(1, format!("unknown status {s}")))?,
            ),
            None => None,
        },
        new_status: RecordState::parse(&new)
            .ok_or_else(|| bad_column(2, format!("unknown status {new}")))?,
        changed_by: row.get(3)?,
        reason: row.get(4)?,
        changed_at: timestamp_column(row, 5)?,
    })
}

fn contract_from_row(row: &Row<'_>) -> rusqlite::Result<ContractRecord> {
    let status: String = row.get(5)?;
    let value: Option<String> = row.get(6)?;
    let file_path: Option<String> = row.get(10)?;
    let file_name: Option<String> = row.get(11)?;

    let legacy_document = match (file_path, file_name) {
        (Some(file_path), Some(file_name)) => Some(LegacyDocument {
            file_path,
            file_name,
            file_size: row.get(12)?,
            mime_type: row.get(13)?,
            extracted_text: row.get(14)?,
        }),
        _ => None,
    };

    Ok(ContractRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        client_id: row.get(3)?,
        contract_type: row.get(4)?,
        status: ContractStatus::parse(&status).map_err(|e| bad_column(5, e.to_string()))?,
        contract_value: match value {
            Some(v) => Some(
                v.parse::<Decimal>()
                    .map_err(|e| bad_column(6, e.to_string()))?,
            ),
            None => None,
        },
        effective_date: date_column(row, 7)?,
        expiration_date: date_column(row, 8)?,
        renewal_date: date_column(row, 9)?,
        legacy_document,
        created_by: row.get(15)?,
        created_at: timestamp_column(row, 16)?,
        updated_at: timestamp_column(row, 17)?,
        deleted_at: optional_timestamp_column(row, 18)?,
    })
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<DocumentRecord> {
    let document_type: String = row.get(8)?;
    Ok(DocumentRecord {
        id: row.get(0)?,
        contract_id: row.get(1)?,
        file_path: row.get(2)?,
        file_name: row.get(3)?,
        original_filename: row.get(4)?,
        file_size: row.get(5)?,
        mime_type: row.get(6)?,
        extracted_text: row.get(7)?,
        document_type: DocumentType::parse(&document_type).unwrap_or(DocumentType::Other),
        description: row.get(9)?,
        uploaded_by: row.get(10)?,
        uploaded_at: timestamp_column(row, 11)?,
        is_primary: row.get(12)?,
    })
}

fn envelope_from_row(row: &Row<'_>) -> rusqlite::Result<SignatureEnvelope> {
    let status: String = row.get(2)?;
    Ok(SignatureEnvelope {
        envelope_id: row.get(0)?,
        contract_id: row.get(1)?,
        status: EnvelopeStatus::parse(&status)
            .ok_or_else(|| bad_column(2, format!("unknown envelope status {status}")))?,
        sent_at: timestamp_column(row, 3)?,
        completed_at: optional_timestamp_column(row, 4)?,
        recipient_email: row.get(5)?,
        recipient_name: row.get(6)?,
        document_id: row.get(7)?,
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    from_db_timestamp(&raw).map_err(|e| bad_column(idx, e.to_string()))
}

fn optional_timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| from_db_timestamp(&s).map_err(|e| bad_column(idx, e.to_string())))
        .transpose()
}

fn date_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| from_db_date(&s).map_err(|e| bad_column(idx, e.to_string())))
        .transpose()
}

fn bad_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}
