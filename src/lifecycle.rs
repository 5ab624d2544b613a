//! Contract and client operations.
//!
//! Each mutation loads the record, applies the state machine, and writes the
//! record plus its status history in one transaction. Audit entries are
//! handed to the activity logger only after the transaction has committed.

use crate::activity::{ActivityAction, ActivityEvent, ActivityLogger, Actor, ResourceType};
use crate::clock::SharedClock;
use crate::contract::*;
use crate::error::{Error, Result};
use crate::storage::Storage;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ContractService {
    store: Storage,
    logger: Arc<ActivityLogger>,
    clock: SharedClock,
    restore_policy: RestorePolicy,
}

impl ContractService {
    pub fn new(
        store: Storage,
        logger: Arc<ActivityLogger>,
        clock: SharedClock,
        restore_policy: RestorePolicy,
    ) -> Self {
        Self {
            store,
            logger,
            clock,
            restore_policy,
        }
    }

    // ── Clients ─────────────────────────────────────────────────

    pub async fn create_client(&self, client: NewClient, actor: &Actor) -> Result<ClientRecord> {
        let now = self.clock.now();
        let result = match client.validate() {
            Ok(()) => self.store.write(|tx| tx.insert_client(&client, now)).await,
            Err(e) => Err(e),
        };
        self.logger.record(Some(actor), &result, |a| {
            let event = ActivityEvent::new(a, ActivityAction::Create, ResourceType::Client);
            match &result {
                Ok(c) => event.resource(c.id, c.name.clone()),
                Err(_) => event,
            }
        });
        if let Ok(c) = &result {
            info!(client_id = c.id, "Client created");
        }
        result
    }

    pub async fn get_client(&self, id: i64, actor: Option<&Actor>) -> Result<ClientRecord> {
        let result = self.store.read(|tx| tx.require_client(id)).await;
        self.logger.record(actor, &result, |a| {
            let event = ActivityEvent::new(a, ActivityAction::View, ResourceType::Client);
            match &result {
                Ok(c) => event.resource(c.id, c.name.clone()),
                Err(_) => event.resource_id(id),
            }
        });
        result
    }

    pub async fn list_clients(&self) -> Result<Vec<ClientSummary>> {
        self.store.read(|tx| tx.list_clients()).await
    }

    // ── Contracts ───────────────────────────────────────────────

    /// Create a contract (draft unless the caller says otherwise). Creation
    /// itself writes no status history.
    pub async fn create(&self, new: NewContract, actor: &Actor) -> Result<ContractRecord> {
        let now = self.clock.now();
        let user_id = actor.user_id;
        let result = match new.validate() {
            Ok(()) => {
                self.store
                    .write(|tx| {
                        let mut contract = tx.insert_contract(&new, user_id, now)?;
                        if let Some(entry) = contract.enforce_expiry(user_id, now) {
                            tx.save_contract(&contract)?;
                            tx.append_history(&entry)?;
                        }
                        Ok(contract)
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        self.logger.record(Some(actor), &result, |a| {
            let event = ActivityEvent::new(a, ActivityAction::Create, ResourceType::Contract);
            match &result {
                Ok(c) => event.resource(c.id, c.title.clone()),
                Err(_) => event,
            }
        });
        if let Ok(c) = &result {
            info!(contract_id = c.id, client_id = c.client_id, "Contract created");
        }
        result
    }

    /// Fetch one contract. Soft-deleted contracts are only returned with
    /// `include_deleted`.
    pub async fn get(
        &self,
        id: i64,
        include_deleted: bool,
        actor: Option<&Actor>,
    ) -> Result<ContractRecord> {
        let result = self
            .store
            .read(|tx| {
                let contract = tx.require_contract(id)?;
                if contract.is_deleted() && !include_deleted {
                    return Err(Error::not_found("contract", id));
                }
                Ok(contract)
            })
            .await;
        self.logger.record(actor, &result, |a| {
            contract_event(a, ActivityAction::View, id, &result)
        });
        result
    }

    /// Newest first. `page` starts at 1.
    pub async fn list(
        &self,
        include_deleted: bool,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<ContractRecord>> {
        let per_page = per_page.clamp(1, 500);
        let offset = page.saturating_sub(1) * per_page;
        self.store
            .read(|tx| tx.list_contracts(include_deleted, per_page, offset))
            .await
    }

    pub async fn search(&self, query: &ContractQuery) -> Result<Vec<ContractRecord>> {
        let today = self.clock.today();
        self.store.read(|tx| tx.search_contracts(query, today)).await
    }

    /// Active contracts expiring within the next `days` days.
    pub async fn expiring(&self, days: i64) -> Result<Vec<ContractRecord>> {
        if days < 0 {
            return Err(Error::Validation("days must not be negative".into()));
        }
        let today = self.clock.today();
        self.store
            .read(|tx| tx.expiring_contracts(today, today + chrono::Duration::days(days)))
            .await
    }

    pub async fn statistics(&self) -> Result<ContractStatistics> {
        let today = self.clock.today();
        self.store
            .read(|tx| {
                let by_status = tx.status_counts()?;
                let expiring = tx.expiring_contracts(today, today + chrono::Duration::days(30))?;
                Ok(ContractStatistics {
                    total: by_status.iter().map(|s| s.count).sum(),
                    by_status,
                    expiring_within_30_days: expiring.len() as i64,
                    soft_deleted: tx.deleted_count()?,
                })
            })
            .await
    }

    /// Status changes of a contract, newest first.
    pub async fn status_history(
        &self,
        id: i64,
        limit: usize,
        actor: Option<&Actor>,
    ) -> Result<Vec<StatusHistoryEntry>> {
        let result = self
            .store
            .read(|tx| {
                tx.require_contract(id)?;
                tx.status_history(id, limit)
            })
            .await;
        self.logger.record(actor, &result, |a| {
            ActivityEvent::new(a, ActivityAction::View, ResourceType::Contract).resource_id(id)
        });
        result
    }

    /// Edit tracked fields. Each changed field is recorded as a version entry.
    pub async fn update(
        &self,
        id: i64,
        update: ContractUpdate,
        actor: &Actor,
    ) -> Result<ContractRecord> {
        let now = self.clock.now();
        let user_id = actor.user_id;
        let result = self
            .store
            .write(|tx| {
                let mut contract = tx.require_contract(id)?;
                let before = contract.status;
                let changes = contract.apply_update(&update, now)?;
                let expired = contract.enforce_expiry(user_id, now);
                if !changes.is_empty() || expired.is_some() {
                    tx.save_contract(&contract)?;
                }
                if let Some(entry) = &expired {
                    tx.append_history(entry)?;
                }
                Ok((contract, changes, before))
            })
            .await;

        let result = result.map(|(contract, changes, before)| {
            for change in &changes {
                self.logger.log_field_change(
                    id,
                    user_id,
                    change.field_name,
                    change.old_value.as_deref(),
                    change.new_value.as_deref(),
                );
            }
            self.log_status_field(id, user_id, before, contract.status);
            debug!(contract_id = id, changed = changes.len(), "Contract fields updated");
            contract
        });
        self.logger.record(Some(actor), &result, |a| {
            contract_event(a, ActivityAction::Update, id, &result)
        });
        result
    }

    /// Change the lifecycle status. Unknown values (and `"deleted"`) fail
    /// with `InvalidStatus` and change nothing.
    pub async fn update_status(
        &self,
        id: i64,
        new_status: &str,
        reason: Option<&str>,
        actor: &Actor,
    ) -> Result<ContractRecord> {
        let now = self.clock.now();
        let user_id = actor.user_id;
        let result = self
            .store
            .write(|tx| {
                let mut contract = tx.require_contract(id)?;
                let before = contract.status;
                let entry = contract.update_status(new_status, user_id, reason, now)?;
                let expired = contract.enforce_expiry(user_id, now);
                tx.save_contract(&contract)?;
                tx.append_history(&entry)?;
                if let Some(entry) = &expired {
                    tx.append_history(entry)?;
                }
                Ok((contract, before))
            })
            .await;

        let result = result.map(|(contract, before)| {
            self.log_status_field(id, user_id, before, contract.status);
            info!(
                contract_id = id,
                from = %before,
                to = %contract.status,
                "Contract status changed"
            );
            contract
        });
        self.logger.record(Some(actor), &result, |a| {
            contract_event(a, ActivityAction::Update, id, &result)
        });
        result
    }

    /// Mark the contract deleted. It stays in storage until the retention
    /// sweeper purges it.
    pub async fn soft_delete(&self, id: i64, actor: &Actor) -> Result<ContractRecord> {
        let now = self.clock.now();
        let user_id = actor.user_id;
        let result = self
            .store
            .write(|tx| {
                let mut contract = tx.require_contract(id)?;
                let entry = contract.soft_delete(user_id, now)?;
                tx.save_contract(&contract)?;
                tx.append_history(&entry)?;
                Ok(contract)
            })
            .await;
        if result.is_ok() {
            info!(contract_id = id, "Contract soft-deleted");
        }
        self.logger.record(Some(actor), &result, |a| {
            contract_event(a, ActivityAction::Delete, id, &result)
        });
        result
    }

    pub async fn restore(&self, id: i64, actor: &Actor) -> Result<ContractRecord> {
        let now = self.clock.now();
        let user_id = actor.user_id;
        let policy = self.restore_policy;
        let result = self
            .store
            .write(|tx| {
                let mut contract = tx.require_contract(id)?;
                let entry = contract.restore(user_id, now, policy)?;
                let expired = contract.enforce_expiry(user_id, now);
                tx.save_contract(&contract)?;
                tx.append_history(&entry)?;
                if let Some(entry) = &expired {
                    tx.append_history(entry)?;
                }
                Ok(contract)
            })
            .await;
        if let Ok(c) = &result {
            info!(contract_id = id, status = %c.status, "Contract restored");
        }
        self.logger.record(Some(actor), &result, |a| {
            contract_event(a, ActivityAction::Restore, id, &result)
        });
        result
    }

    fn log_status_field(&self, id: i64, user_id: UserId, before: ContractStatus, after: ContractStatus) {
        self.logger
            .log_field_change(id, user_id, "status", Some(before.as_str()), Some(after.as_str()));
    }
}

fn contract_event(
    actor: &Actor,
    action: ActivityAction,
    id: i64,
    result: &Result<ContractRecord>,
) -> ActivityEvent {
    let event = ActivityEvent::new(actor, action, ResourceType::Contract);
    match result {
        Ok(c) => event.resource(id, c.title.clone()),
        Err(_) => event.resource_id(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditStore;
    use crate::clock::{Clock, ManualClock};
    use crate::config::AuditConfig;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::time::Duration;

    struct Harness {
        service: ContractService,
        logger: Arc<ActivityLogger>,
        clock: Arc<ManualClock>,
        client_id: i64,
    }

    async fn harness_with(policy: RestorePolicy) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let config = AuditConfig {
            poll_interval: Duration::from_millis(10),
            ..AuditConfig::default()
        };
        let logger = Arc::new(ActivityLogger::new(
            AuditStore::open_in_memory().unwrap(),
            clock.clone(),
            config,
        ));
        logger.start().unwrap();
        let service = ContractService::new(
            Storage::open_in_memory().unwrap(),
            Arc::clone(&logger),
            clock.clone(),
            policy,
        );
        let client = service
            .create_client(
                NewClient {
                    name: "Acme".into(),
                    ..NewClient::default()
                },
                &Actor::user(1),
            )
            .await
            .unwrap();
        Harness {
            service,
            logger,
            clock,
            client_id: client.id,
        }
    }

    async fn harness() -> Harness {
        harness_with(RestorePolicy::ResetToDraft).await
    }

    fn actor() -> Actor {
        Actor::user(7).with_ip("10.0.0.1")
    }

    #[tokio::test]
    async fn test_create_defaults_to_draft_without_history() {
        let h = harness().await;
        let c = h
            .service
            .create(NewContract::new("Lease", h.client_id, "lease"), &actor())
            .await
            .unwrap();
        assert_eq!(c.status, ContractStatus::Draft);
        assert_eq!(c.created_by, 7);
        let history = h.service.status_history(c.id, 10, None).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_create_with_unknown_client_fails() {
        let h = harness().await;
        let err = h
            .service
            .create(NewContract::new("Lease", 404, "lease"), &actor())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { resource: "client", .. }));

        assert!(h.logger.flush(Duration::from_secs(5)));
        let recent = h.logger.store().recent_activity(7, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert!(!recent[0].success);
        assert!(recent[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("client not found"));
    }

    #[tokio::test]
    async fn test_deleted_marker_consistent_across_operations() {
        let h = harness().await;
        let a = actor();
        let c = h
            .service
            .create(NewContract::new("Lease", h.client_id, "lease"), &a)
            .await
            .unwrap();

        let mut successful = 0;
        let steps: Vec<&str> = vec![
            "under_review", "delete", "delete", "restore", "restore", "active", "bogus",
            "delete", "terminated", "restore", "renewed",
        ];
        for step in steps {
            let outcome = match step {
                "delete" => h.service.soft_delete(c.id, &a).await,
                "restore" => h.service.restore(c.id, &a).await,
                status => h.service.update_status(c.id, status, None, &a).await,
            };
            if outcome.is_ok() {
                successful += 1;
            }
            let current = h.service.get(c.id, true, None).await.unwrap();
            assert_eq!(
                current.state() == RecordState::Deleted,
                current.deleted_at.is_some()
            );
        }

        let history = h.service.status_history(c.id, 100, None).await.unwrap();
        assert_eq!(history.len(), successful);
        // Repeated delete/restore, "bogus", and a status change while deleted all fail.
        assert_eq!(successful, 7);
    }

    #[tokio::test]
    async fn test_soft_deleted_hidden_from_default_reads() {
        let h = harness().await;
        let c = h
            .service
            .create(NewContract::new("Lease", h.client_id, "lease"), &actor())
            .await
            .unwrap();
        h.service.soft_delete(c.id, &actor()).await.unwrap();

        assert!(matches!(
            h.service.get(c.id, false, None).await,
            Err(Error::NotFound { .. })
        ));
        assert!(h.service.list(false, 1, 50).await.unwrap().is_empty());
        assert_eq!(h.service.list(true, 1, 50).await.unwrap().len(), 1);
        let found = h
            .service
            .search(&ContractQuery {
                term: Some("lease".into()),
                ..ContractQuery::default()
            })
            .await
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(h.service.statistics().await.unwrap().soft_deleted, 1);
    }

    #[tokio::test]
    async fn test_restore_resets_to_draft_by_default() {
        let h = harness().await;
        let c = h
            .service
            .create(NewContract::new("Lease", h.client_id, "lease"), &actor())
            .await
            .unwrap();
        h.service.update_status(c.id, "active", None, &actor()).await.unwrap();
        h.service.soft_delete(c.id, &actor()).await.unwrap();
        let restored = h.service.restore(c.id, &actor()).await.unwrap();
        assert_eq!(restored.state(), RecordState::Live(ContractStatus::Draft));

        let history = h.service.status_history(c.id, 10, None).await.unwrap();
        assert_eq!(history[0].old_status, Some(RecordState::Deleted));
        assert_eq!(history[0].reason.as_deref(), Some("restored from deletion"));
        assert_eq!(history[1].new_status, RecordState::Deleted);
    }

    #[tokio::test]
    async fn test_restore_can_preserve_status() {
        let h = harness_with(RestorePolicy::PreserveStatus).await;
        let c = h
            .service
            .create(NewContract::new("Lease", h.client_id, "lease"), &actor())
            .await
            .unwrap();
        h.service.update_status(c.id, "active", None, &actor()).await.unwrap();
        h.service.soft_delete(c.id, &actor()).await.unwrap();
        let restored = h.service.restore(c.id, &actor()).await.unwrap();
        assert_eq!(restored.status, ContractStatus::Active);
    }

    #[tokio::test]
    async fn test_restore_live_contract_is_conflict() {
        let h = harness().await;
        let c = h
            .service
            .create(NewContract::new("Lease", h.client_id, "lease"), &actor())
            .await
            .unwrap();
        let err = h.service.restore(c.id, &actor()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_invalid_status_rolls_back_nothing_written() {
        let h = harness().await;
        let c = h
            .service
            .create(NewContract::new("Lease", h.client_id, "lease"), &actor())
            .await
            .unwrap();
        let err = h
            .service
            .update_status(c.id, "deleted", None, &actor())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStatus(_)));
        let current = h.service.get(c.id, false, None).await.unwrap();
        assert_eq!(current.status, ContractStatus::Draft);
        assert!(h.service.status_history(c.id, 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persisting_expired_active_contract_expires_it() {
        let h = harness().await;
        let mut new = NewContract::new("Lease", h.client_id, "lease");
        new.expiration_date = NaiveDate::from_ymd_opt(2024, 6, 10);
        let c = h.service.create(new, &actor()).await.unwrap();
        h.service.update_status(c.id, "active", None, &actor()).await.unwrap();

        h.clock.advance(chrono::Duration::days(10));
        let update = ContractUpdate {
            description: Some(Some("renegotiated".into())),
            ..ContractUpdate::default()
        };
        let updated = h.service.update(c.id, update, &actor()).await.unwrap();
        assert_eq!(updated.status, ContractStatus::Expired);

        let history = h.service.status_history(c.id, 10, None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].new_status, RecordState::Live(ContractStatus::Expired));
        assert_eq!(history[0].reason.as_deref(), Some("expiration date passed"));
    }

    #[tokio::test]
    async fn test_update_logs_one_version_per_changed_field() {
        let h = harness().await;
        let c = h
            .service
            .create(NewContract::new("Lease", h.client_id, "lease"), &actor())
            .await
            .unwrap();
        let update = ContractUpdate {
            title: Some("Lease".into()),
            description: Some(Some("five years".into())),
            contract_type: Some("property".into()),
            ..ContractUpdate::default()
        };
        h.service.update(c.id, update, &actor()).await.unwrap();

        assert!(h.logger.flush(Duration::from_secs(5)));
        let versions = h.logger.store().contract_history(c.id, 10).await.unwrap();
        let mut fields: Vec<_> = versions.iter().map(|v| v.field_name.clone()).collect();
        fields.sort();
        assert_eq!(fields, vec!["contract_type", "description"]);

        let activity = h
            .logger
            .store()
            .activity_for_resource(ResourceType::Contract, c.id, 10)
            .await
            .unwrap();
        assert_eq!(activity[0].action, ActivityAction::Update);
        assert_eq!(activity[0].ip_address.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_anonymous_reads_are_not_logged() {
        let h = harness().await;
        let c = h
            .service
            .create(NewContract::new("Lease", h.client_id, "lease"), &actor())
            .await
            .unwrap();
        h.service.get(c.id, false, None).await.unwrap();
        h.service.get(c.id, false, Some(&Actor::user(9))).await.unwrap();

        assert!(h.logger.flush(Duration::from_secs(5)));
        let views = h
            .logger
            .store()
            .most_viewed(ResourceType::Contract, 10, h.clock.now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].view_count, 1);
    }

    #[tokio::test]
    async fn test_expiring_and_statistics() {
        let h = harness().await;
        for (title, days) in [("Soon", 5), ("Later", 45)] {
            let mut new = NewContract::new(title, h.client_id, "lease");
            new.status = ContractStatus::Active;
            new.expiration_date = Some(h.clock.today() + chrono::Duration::days(days));
            h.service.create(new, &actor()).await.unwrap();
        }
        let expiring = h.service.expiring(30).await.unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].title, "Soon");
        assert_eq!(expiring[0].days_until_expiration(h.clock.today()), Some(5));

        let stats = h.service.statistics().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.expiring_within_30_days, 1);
        let active = stats
            .by_status
            .iter()
            .find(|s| s.status == ContractStatus::Active)
            .unwrap();
        assert_eq!(active.count, 2);
    }
}
