//! Contract records, clients, and the contract status state machine.
//!
//! Business status and existence are tracked separately: `status` only ever
//! holds a lifecycle value, while `deleted_at` marks a soft delete. The
//! combined [`RecordState`] is what status history records.

use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use std::fmt;

pub type UserId = i64;

// ── Status ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Draft,
    UnderReview,
    Active,
    Expired,
    Terminated,
    Renewed,
}

impl ContractStatus {
    pub const ALL: [ContractStatus; 6] = [
        Self::Draft,
        Self::UnderReview,
        Self::Active,
        Self::Expired,
        Self::Terminated,
        Self::Renewed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::UnderReview => "under_review",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Terminated => "terminated",
            Self::Renewed => "renewed",
        }
    }

    /// Parse a lifecycle status. `"deleted"` is not one: deletion goes
    /// through [`ContractRecord::soft_delete`].
    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| match s {
                "deleted" => Error::InvalidStatus("deleted (use soft delete instead)".into()),
                other => Error::InvalidStatus(other.to_string()),
            })
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a status history entry records: either a live lifecycle status or
/// the soft-deleted marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Live(ContractStatus),
    Deleted,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live(status) => status.as_str(),
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deleted" => Some(Self::Deleted),
            other => ContractStatus::parse(other).ok().map(Self::Live),
        }
    }
}

impl Serialize for RecordState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// What a restore does with the lifecycle status held before deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePolicy {
    #[default]
    ResetToDraft,
    PreserveStatus,
}

impl RestorePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reset_to_draft" => Some(Self::ResetToDraft),
            "preserve_status" => Some(Self::PreserveStatus),
            _ => None,
        }
    }
}

// ── Clients ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ClientRecord {
    pub id: i64,
    pub name: String,
    pub organization: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewClient {
    pub name: String,
    pub organization: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

impl NewClient {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("client name is required".into()));
        }
        if let Some(email) = &self.email {
            if !email.contains('@') {
                return Err(Error::Validation(format!("invalid client email: {email}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSummary {
    #[serde(flatten)]
    pub client: ClientRecord,
    /// Contracts that are not soft-deleted.
    pub contract_count: i64,
}

// ── Contracts ───────────────────────────────────────────────────────

/// Single-document fields carried by contracts created before document
/// sets existed. Only read by legacy migration.
#[derive(Debug, Clone, Serialize)]
pub struct LegacyDocument {
    pub file_path: String,
    pub file_name: String,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub extracted_text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContractRecord {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub client_id: i64,
    pub contract_type: String,
    pub status: ContractStatus,
    pub contract_value: Option<Decimal>,
    pub effective_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
    pub renewal_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_document: Option<LegacyDocument>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One status change, written in the same transaction as the change itself.
#[derive(Debug, Clone, Serialize)]
pub struct StatusHistoryEntry {
    pub contract_id: i64,
    pub old_status: Option<RecordState>,
    pub new_status: RecordState,
    pub changed_by: UserId,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// A tracked field whose stringified value changed during an edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field_name: &'static str,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewContract {
    pub title: String,
    pub description: Option<String>,
    pub client_id: i64,
    pub contract_type: String,
    pub status: ContractStatus,
    pub contract_value: Option<Decimal>,
    pub effective_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
    pub renewal_date: Option<NaiveDate>,
    pub legacy_document: Option<LegacyDocument>,
}

impl NewContract {
    pub fn new(title: impl Into<String>, client_id: i64, contract_type: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            client_id,
            contract_type: contract_type.into(),
            status: ContractStatus::Draft,
            contract_value: None,
            effective_date: None,
            expiration_date: None,
            renewal_date: None,
            legacy_document: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::Validation("contract title is required".into()));
        }
        if self.contract_type.trim().is_empty() {
            return Err(Error::Validation("contract type is required".into()));
        }
        Ok(())
    }
}

/// Field edits. `None` leaves a field alone; for nullable fields
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct ContractUpdate {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub client_id: Option<i64>,
    pub contract_type: Option<String>,
    pub contract_value: Option<Option<Decimal>>,
    pub effective_date: Option<Option<NaiveDate>>,
    pub expiration_date: Option<Option<NaiveDate>>,
    pub renewal_date: Option<Option<NaiveDate>>,
}

/// Filters for contract search. Deleted contracts never match.
#[derive(Debug, Clone, Default)]
pub struct ContractQuery {
    /// Case-insensitive match on title, description, or document text.
    pub term: Option<String>,
    pub status: Option<ContractStatus>,
    pub client_id: Option<i64>,
    pub contract_type: Option<String>,
    /// Active contracts expiring between today and today + N days.
    pub expiring_within_days: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContractStatistics {
    pub total: i64,
    pub by_status: Vec<StatusCount>,
    pub expiring_within_30_days: i64,
    pub soft_deleted: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub status: ContractStatus,
    pub count: i64,
}

impl ContractRecord {
    pub fn state(&self) -> RecordState {
        if self.deleted_at.is_some() {
            RecordState::Deleted
        } else {
            RecordState::Live(self.status)
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Change the lifecycle status from its string form.
    pub fn update_status(
        &mut self,
        new_status: &str,
        changed_by: UserId,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<StatusHistoryEntry> {
        let status = ContractStatus::parse(new_status)?;
        self.transition_to(status, changed_by, reason.map(str::to_string), now)
    }

    pub fn transition_to(
        &mut self,
        status: ContractStatus,
        changed_by: UserId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<StatusHistoryEntry> {
        if self.is_deleted() {
            return Err(Error::ContractDeleted(self.id));
        }
        let old = self.state();
        self.status = status;
        self.updated_at = now;
        Ok(self.history(Some(old), changed_by, reason, now))
    }

    pub fn soft_delete(&mut self, deleted_by: UserId, now: DateTime<Utc>) -> Result<StatusHistoryEntry> {
        if self.is_deleted() {
            return Err(Error::AlreadyDeleted(self.id));
        }
        let old = self.state();
        self.deleted_at = Some(now);
        self.updated_at = now;
        Ok(self.history(Some(old), deleted_by, Some("soft deleted".into()), now))
    }

    pub fn restore(
        &mut self,
        restored_by: UserId,
        now: DateTime<Utc>,
        policy: RestorePolicy,
    ) -> Result<StatusHistoryEntry> {
        if !self.is_deleted() {
            return Err(Error::NotDeleted(self.id));
        }
        self.deleted_at = None;
        if policy == RestorePolicy::ResetToDraft {
            self.status = ContractStatus::Draft;
        }
        self.updated_at = now;
        Ok(self.history(
            Some(RecordState::Deleted),
            restored_by,
            Some("restored from deletion".into()),
            now,
        ))
    }

    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiration_date.is_some_and(|date| date < today)
    }

    pub fn days_until_expiration(&self, today: NaiveDate) -> Option<i64> {
        self.expiration_date.map(|date| (date - today).num_days())
    }

    /// Active contracts past their expiration date become expired whenever
    /// they are persisted.
    pub fn enforce_expiry(&mut self, changed_by: UserId, now: DateTime<Utc>) -> Option<StatusHistoryEntry> {
        if self.is_deleted() || self.status != ContractStatus::Active || !self.is_expired(now.date_naive()) {
            return None;
        }
        self.transition_to(
            ContractStatus::Expired,
            changed_by,
            Some("expiration date passed".into()),
            now,
        )
        .ok()
    }

    /// Apply field edits and report which tracked fields actually changed.
    pub fn apply_update(&mut self, update: &ContractUpdate, now: DateTime<Utc>) -> Result<Vec<FieldChange>> {
        if self.is_deleted() {
            return Err(Error::ContractDeleted(self.id));
        }
        if let Some(title) = &update.title {
            if title.trim().is_empty() {
                return Err(Error::Validation("contract title is required".into()));
            }
        }
        if let Some(contract_type) = &update.contract_type {
            if contract_type.trim().is_empty() {
                return Err(Error::Validation("contract type is required".into()));
            }
        }

        let before = self.tracked_values();
        if let Some(title) = &update.title {
            self.title = title.clone();
        }
        if let Some(description) = &update.description {
            self.description = description.clone();
        }
        if let Some(client_id) = update.client_id {
            self.client_id = client_id;
        }
        if let Some(contract_type) = &update.contract_type {
            self.contract_type = contract_type.clone();
        }
        if let Some(value) = update.contract_value {
            self.contract_value = value;
        }
        if let Some(date) = update.effective_date {
            self.effective_date = date;
        }
        if let Some(date) = update.expiration_date {
            self.expiration_date = date;
        }
        if let Some(date) = update.renewal_date {
            self.renewal_date = date;
        }
        let after = self.tracked_values();

        let changes: Vec<FieldChange> = before
            .into_iter()
            .zip(after)
            .filter(|((_, old), (_, new))| old != new)
            .map(|((field_name, old_value), (_, new_value))| FieldChange {
                field_name,
                old_value,
                new_value,
            })
            .collect();
        if !changes.is_empty() {
            self.updated_at = now;
        }
        Ok(changes)
    }

    pub fn has_legacy_document(&self) -> bool {
        self.legacy_document.is_some()
    }

    fn tracked_values(&self) -> [(&'static str, Option<String>); 8] {
        [
            ("title", Some(self.title.clone())),
            ("description", self.description.clone()),
            ("client_id", Some(self.client_id.to_string())),
            ("contract_type", Some(self.contract_type.clone())),
            ("contract_value", self.contract_value.map(|v| v.to_string())),
            ("effective_date", self.effective_date.map(|d| d.to_string())),
            ("expiration_date", self.expiration_date.map(|d| d.to_string())),
            ("renewal_date", self.renewal_date.map(|d| d.to_string())),
        ]
    }

    fn history(
        &self,
        old_status: Option<RecordState>,
        changed_by: UserId,
        reason: Option<String>,
        changed_at: DateTime<Utc>,
    ) -> StatusHistoryEntry {
        StatusHistoryEntry {
            contract_id: self.id,
            old_status,
            new_status: self.state(),
            changed_by,
            reason,
            changed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn record() -> ContractRecord {
        ContractRecord {
            id: 1,
            title: "Supply agreement".into(),
            description: None,
            client_id: 10,
            contract_type: "service".into(),
            status: ContractStatus::Draft,
            contract_value: None,
            effective_date: None,
            expiration_date: None,
            renewal_date: None,
            legacy_document: None,
            created_by: 5,
            created_at: now(),
            updated_at: now(),
            deleted_at: None,
        }
    }

    #[test]
    fn test_update_status_records_old_and_new() {
        let mut c = record();
        let entry = c.update_status("under_review", 5, Some("ready"), now()).unwrap();
        assert_eq!(c.status, ContractStatus::UnderReview);
        assert_eq!(entry.old_status, Some(RecordState::Live(ContractStatus::Draft)));
        assert_eq!(entry.new_status, RecordState::Live(ContractStatus::UnderReview));
        assert_eq!(entry.reason.as_deref(), Some("ready"));
    }

    #[test]
    fn test_invalid_status_leaves_state_unchanged() {
        let mut c = record();
        let err = c.update_status("archived", 5, None, now()).unwrap_err();
        assert!(matches!(err, Error::InvalidStatus(_)));
        assert_eq!(c.status, ContractStatus::Draft);

        let err = c.update_status("deleted", 5, None, now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!c.is_deleted());
    }

    #[test]
    fn test_soft_delete_and_restore_keep_marker_consistent() {
        let mut c = record();
        c.update_status("active", 5, None, now()).unwrap();

        let deleted = c.soft_delete(7, now()).unwrap();
        assert_eq!(deleted.new_status, RecordState::Deleted);
        assert_eq!(c.state(), RecordState::Deleted);
        assert!(c.deleted_at.is_some());

        let restored = c.restore(7, now(), RestorePolicy::ResetToDraft).unwrap();
        assert_eq!(restored.old_status, Some(RecordState::Deleted));
        assert_eq!(restored.new_status, RecordState::Live(ContractStatus::Draft));
        assert!(c.deleted_at.is_none());
    }

    #[test]
    fn test_restore_preserving_status() {
        let mut c = record();
        c.update_status("active", 5, None, now()).unwrap();
        c.soft_delete(7, now()).unwrap();
        c.restore(7, now(), RestorePolicy::PreserveStatus).unwrap();
        assert_eq!(c.state(), RecordState::Live(ContractStatus::Active));
    }

    #[test]
    fn test_restore_requires_deleted() {
        let mut c = record();
        let err = c.restore(7, now(), RestorePolicy::ResetToDraft).unwrap_err();
        assert!(matches!(err, Error::NotDeleted(1)));
    }

    #[test]
    fn test_deleted_contract_rejects_status_change() {
        let mut c = record();
        c.soft_delete(7, now()).unwrap();
        assert!(matches!(c.soft_delete(7, now()), Err(Error::AlreadyDeleted(1))));
        assert!(matches!(
            c.update_status("active", 7, None, now()),
            Err(Error::ContractDeleted(1))
        ));
    }

    #[test]
    fn test_expiration_helpers() {
        let mut c = record();
        let today = now().date_naive();
        assert!(!c.is_expired(today));
        assert_eq!(c.days_until_expiration(today), None);

        c.expiration_date = NaiveDate::from_ymd_opt(2024, 5, 30);
        assert!(c.is_expired(today));
        assert_eq!(c.days_until_expiration(today), Some(-2));

        c.expiration_date = NaiveDate::from_ymd_opt(2024, 6, 11);
        assert_eq!(c.days_until_expiration(today), Some(10));
    }

    #[test]
    fn test_enforce_expiry_only_for_active() {
        let mut c = record();
        c.expiration_date = NaiveDate::from_ymd_opt(2024, 1, 1);
        assert!(c.enforce_expiry(5, now()).is_none());

        c.status = ContractStatus::Active;
        let entry = c.enforce_expiry(5, now()).unwrap();
        assert_eq!(c.status, ContractStatus::Expired);
        assert_eq!(entry.new_status, RecordState::Live(ContractStatus::Expired));
        assert!(c.enforce_expiry(5, now()).is_none());
    }

    #[test]
    fn test_apply_update_reports_only_changed_fields() {
        let mut c = record();
        let update = ContractUpdate {
            title: Some("Supply agreement".into()),
            contract_value: Some(Some(Decimal::new(125_050, 2))),
            expiration_date: Some(NaiveDate::from_ymd_opt(2025, 1, 31)),
            ..ContractUpdate::default()
        };
        let changes = c.apply_update(&update, now()).unwrap();
        assert_eq!(
            changes,
            vec![
                FieldChange {
                    field_name: "contract_value",
                    old_value: None,
                    new_value: Some("1250.50".into()),
                },
                FieldChange {
                    field_name: "expiration_date",
                    old_value: None,
                    new_value: Some("2025-01-31".into()),
                },
            ]
        );
    }

    #[test]
    fn test_apply_update_clears_nullable_field() {
        let mut c = record();
        c.description = Some("old".into());
        let update = ContractUpdate {
            description: Some(None),
            ..ContractUpdate::default()
        };
        let changes = c.apply_update(&update, now()).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_value.as_deref(), Some("old"));
        assert_eq!(changes[0].new_value, None);
        assert!(c.description.is_none());
    }

    #[test]
    fn test_apply_update_rejects_blank_title() {
        let mut c = record();
        let update = ContractUpdate {
            title: Some("  ".into()),
            ..ContractUpdate::default()
        };
        assert!(matches!(c.apply_update(&update, now()), Err(Error::Validation(_))));
        assert_eq!(c.title, "Supply agreement");
    }

    #[test]
    fn test_record_state_round_trips_legacy_strings() {
        assert_eq!(RecordState::parse("deleted"), Some(RecordState::Deleted));
        assert_eq!(
            RecordState::parse("under_review"),
            Some(RecordState::Live(ContractStatus::UnderReview))
        );
        assert_eq!(RecordState::parse("bogus"), None);
    }
}
