//! Signature envelopes: send a contract document for e-signature, follow
//! the envelope through the provider, void it.
//!
//! Envelope states: `sent -> delivered -> {completed, declined}`, and any
//! non-completed envelope can be voided. Sending moves a draft contract to
//! under review; completion moves an under-review contract to active.

use crate::activity::{ActivityAction, ActivityEvent, ActivityLogger, Actor, ResourceType};
use crate::clock::SharedClock;
use crate::contract::{ContractRecord, ContractStatus};
use crate::error::{Error, Result};
use crate::storage::{Storage, Tx};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

// ── Envelopes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Sent,
    Delivered,
    Completed,
    Declined,
    Voided,
}

impl EnvelopeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Completed => "completed",
            Self::Declined => "declined",
            Self::Voided => "voided",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "completed" => Some(Self::Completed),
            "declined" => Some(Self::Declined),
            "voided" => Some(Self::Voided),
            _ => None,
        }
    }

    /// No provider update can move an envelope out of these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Declined | Self::Voided)
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Sent => "Document has been sent to recipient",
            Self::Delivered => "Recipient has received the document",
            Self::Completed => "Document has been signed and completed",
            Self::Declined => "Recipient has declined to sign",
            Self::Voided => "Document has been voided",
        }
    }
}

impl std::fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The signature request attached to a contract. A contract has at most one;
/// sending again replaces it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignatureEnvelope {
    pub envelope_id: String,
    pub contract_id: i64,
    pub status: EnvelopeStatus,
    pub sent_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    /// `None` when the contract's legacy single document was sent.
    pub document_id: Option<i64>,
}

// ── Provider ────────────────────────────────────────────────────────

/// What the provider is asked to deliver.
#[derive(Debug, Clone)]
pub struct OutgoingEnvelope {
    pub contract_id: i64,
    pub contract_title: String,
    pub recipient_email: String,
    pub recipient_name: String,
    pub document_path: String,
    pub document_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReceipt {
    pub envelope_id: String,
    pub status: EnvelopeStatus,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ProviderError(pub String);

pub trait SignatureProvider: Send + Sync {
    fn send(&self, envelope: &OutgoingEnvelope) -> Result<ProviderReceipt, ProviderError>;

    fn check_status(&self, envelope: &SignatureEnvelope) -> Result<EnvelopeStatus, ProviderError>;

    fn void(&self, envelope_id: &str) -> Result<(), ProviderError>;
}

/// Stand-in provider that progresses envelopes on elapsed time.
///
/// A sent envelope is delivered once more than two minutes have passed since
/// sending, and a delivered one completes after more than five.
pub struct MockSignatureProvider {
    clock: SharedClock,
    fail_next_send: AtomicBool,
    fail_next_check: AtomicBool,
    forced: Mutex<HashMap<String, EnvelopeStatus>>,
    voided: Mutex<Vec<String>>,
}

pub const MOCK_ENVELOPE_PREFIX: &str = "mock-ds-";

impl MockSignatureProvider {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            fail_next_send: AtomicBool::new(false),
            fail_next_check: AtomicBool::new(false),
            forced: Mutex::new(HashMap::new()),
            voided: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `send` fail as a transient outage.
    pub fn fail_next_send(&self) {
        self.fail_next_send.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_check(&self) {
        self.fail_next_check.store(true, Ordering::SeqCst);
    }

    /// Report `status` for `envelope_id` on every later check.
    pub fn force_status(&self, envelope_id: &str, status: EnvelopeStatus) {
        self.forced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(envelope_id.to_string(), status);
    }

    /// Envelope ids voided at the provider, oldest first.
    pub fn voided(&self) -> Vec<String> {
        self.voided
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SignatureProvider for MockSignatureProvider {
    fn send(&self, envelope: &OutgoingEnvelope) -> Result<ProviderReceipt, ProviderError> {
        if self.fail_next_send.swap(false, Ordering::SeqCst) {
            warn!(contract_id = envelope.contract_id, "Mock signature provider send failure");
            return Err(ProviderError(
                "signature service temporarily unavailable".into(),
            ));
        }
        let hex = uuid::Uuid::new_v4().simple().to_string();
        let envelope_id = format!("{MOCK_ENVELOPE_PREFIX}{}", &hex[..16]);
        debug!(
            contract_id = envelope.contract_id,
            envelope_id = %envelope_id,
            document = %envelope.document_name,
            "Mock envelope sent"
        );
        Ok(ProviderReceipt {
            envelope_id,
            status: EnvelopeStatus::Sent,
        })
    }

    fn check_status(&self, envelope: &SignatureEnvelope) -> Result<EnvelopeStatus, ProviderError> {
        if self.fail_next_check.swap(false, Ordering::SeqCst) {
            return Err(ProviderError("signature service timed out".into()));
        }
        if !envelope.envelope_id.starts_with(MOCK_ENVELOPE_PREFIX) {
            return Err(ProviderError(format!(
                "invalid envelope id format: {}",
                envelope.envelope_id
            )));
        }
        if let Some(status) = self
            .forced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&envelope.envelope_id)
        {
            return Ok(*status);
        }
        let minutes = (self.clock.now() - envelope.sent_at).num_seconds() as f64 / 60.0;
        Ok(match envelope.status {
            EnvelopeStatus::Sent if minutes > 2.0 => EnvelopeStatus::Delivered,
            EnvelopeStatus::Delivered if minutes > 5.0 => EnvelopeStatus::Completed,
            current => current,
        })
    }

    fn void(&self, envelope_id: &str) -> Result<(), ProviderError> {
        debug!(envelope_id, "Mock envelope voided");
        self.voided
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(envelope_id.to_string());
        Ok(())
    }
}

// ── Workflow ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    pub document_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCheck {
    pub envelope: SignatureEnvelope,
    pub previous: EnvelopeStatus,
    pub changed: bool,
    pub contract_status: ContractStatus,
    pub message: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkSendOutcome {
    pub contract_id: i64,
    pub envelope_id: Option<String>,
    pub error: Option<String>,
}

pub struct SignatureWorkflow {
    store: Storage,
    provider: Arc<dyn SignatureProvider>,
    logger: Arc<ActivityLogger>,
    clock: SharedClock,
}

// Document chosen for sending: a document row, or the legacy file.
struct Selected {
    document_id: Option<i64>,
    path: String,
    name: String,
}

impl SignatureWorkflow {
    pub fn new(
        store: Storage,
        provider: Arc<dyn SignatureProvider>,
        logger: Arc<ActivityLogger>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            provider,
            logger,
            clock,
        }
    }

    /// Send a contract document for signature. Without a document id the
    /// primary document is used, then the newest one, then the legacy file.
    pub async fn send(
        &self,
        contract_id: i64,
        request: SendRequest,
        actor: &Actor,
    ) -> Result<SignatureEnvelope> {
        let result = self.send_inner(contract_id, &request, actor).await;
        self.logger.record(Some(actor), &result, |a| {
            let event = ActivityEvent::new(a, ActivityAction::DocusignSend, ResourceType::Contract);
            match &result {
                Ok(env) => event.resource(contract_id, envelope_title(&env.title, &env.envelope.envelope_id)),
                Err(_) => event.resource_id(contract_id),
            }
        });
        result.map(|sent| sent.envelope)
    }

    async fn send_inner(
        &self,
        contract_id: i64,
        request: &SendRequest,
        actor: &Actor,
    ) -> Result<SentEnvelope> {
        let email = request.recipient_email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(Error::Validation("valid recipient email is required".into()));
        }

        let (contract, client_name, selected) = self
            .store
            .read(|tx| {
                let contract = tx.require_contract(contract_id)?;
                if contract.is_deleted() {
                    return Err(Error::ContractDeleted(contract_id));
                }
                let client_name = tx.require_client(contract.client_id)?.name;
                let selected = select_document(tx, &contract, request.document_id)?;
                Ok((contract, client_name, selected))
            })
            .await?;

        let recipient_name = request
            .recipient_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(client_name);
        let receipt = self
            .provider
            .send(&OutgoingEnvelope {
                contract_id,
                contract_title: contract.title.clone(),
                recipient_email: email.to_string(),
                recipient_name: recipient_name.clone(),
                document_path: selected.path.clone(),
                document_name: selected.name.clone(),
            })
            .map_err(|e| Error::SendFailed(e.to_string()))?;

        let now = self.clock.now();
        let envelope = SignatureEnvelope {
            envelope_id: receipt.envelope_id,
            contract_id,
            status: receipt.status,
            sent_at: now,
            completed_at: None,
            recipient_email: email.to_string(),
            recipient_name: Some(recipient_name),
            document_id: selected.document_id,
        };
        // The contract may have been deleted while the provider was busy.
        let saved = self
            .store
            .write(|tx| {
                let mut contract = tx.require_contract(contract_id)?;
                if contract.is_deleted() {
                    return Err(Error::ContractDeleted(contract_id));
                }
                if contract.status == ContractStatus::Draft {
                    let entry = contract.transition_to(
                        ContractStatus::UnderReview,
                        actor.user_id,
                        Some("sent for signature".into()),
                        now,
                    )?;
                    tx.save_contract(&contract)?;
                    tx.append_history(&entry)?;
                }
                tx.save_envelope(&envelope, now)?;
                Ok(contract.title)
            })
            .await;
        let title = match saved {
            Ok(title) => title,
            Err(e) => {
                warn!(
                    contract_id,
                    envelope_id = %envelope.envelope_id,
                    "Envelope sent but not recorded, voiding: {e}"
                );
                self.void_at_provider(&envelope.envelope_id);
                return Err(e);
            }
        };

        info!(
            contract_id,
            envelope_id = %envelope.envelope_id,
            document = %selected.name,
            "Contract sent for signature"
        );
        Ok(SentEnvelope { envelope, title })
    }

    /// Poll the provider and persist any change. Terminal envelopes are not
    /// polled.
    pub async fn check_status(
        &self,
        envelope_id: &str,
        actor: Option<&Actor>,
    ) -> Result<StatusCheck> {
        let result = self.check_inner(envelope_id, actor).await;
        if let Ok(check) = &result {
            if check.changed {
                self.logger.record(actor, &result, |a| {
                    ActivityEvent::new(a, ActivityAction::DocusignStatusChange, ResourceType::Contract)
                        .resource(check.envelope.contract_id, self.short_title(check))
                });
            }
        }
        self.logger.record(actor, &result, |a| {
            let event =
                ActivityEvent::new(a, ActivityAction::DocusignCheck, ResourceType::Contract);
            match &result {
                Ok(check) => event.resource(check.envelope.contract_id, self.short_title(check)),
                Err(_) => event,
            }
        });
        result
    }

    fn short_title(&self, check: &StatusCheck) -> String {
        format!(
            "{} -> {} (Envelope: {})",
            check.previous,
            check.envelope.status,
            short_id(&check.envelope.envelope_id)
        )
    }

    async fn check_inner(&self, envelope_id: &str, actor: Option<&Actor>) -> Result<StatusCheck> {
        let (envelope, contract) = self.load(envelope_id).await?;
        let previous = envelope.status;
        if previous.is_terminal() {
            return Ok(StatusCheck {
                message: previous.message(),
                envelope,
                previous,
                changed: false,
                contract_status: contract.status,
            });
        }

        let reported = self
            .provider
            .check_status(&envelope)
            .map_err(|e| Error::ProviderUnavailable(e.to_string()))?;
        if reported == previous {
            return Ok(StatusCheck {
                message: previous.message(),
                envelope,
                previous,
                changed: false,
                contract_status: contract.status,
            });
        }

        let now = self.clock.now();
        let changed_by = actor.map_or(contract.created_by, |a| a.user_id);
        let (envelope, contract_status) = self
            .store
            .write(|tx| {
                let mut envelope = envelope;
                let mut contract = tx.require_contract(envelope.contract_id)?;
                envelope.status = reported;
                if reported == EnvelopeStatus::Completed && envelope.completed_at.is_none() {
                    envelope.completed_at = Some(now);
                    if contract.status == ContractStatus::UnderReview && !contract.is_deleted() {
                        let entry = contract.transition_to(
                            ContractStatus::Active,
                            changed_by,
                            Some("signature completed".into()),
                            now,
                        )?;
                        tx.save_contract(&contract)?;
                        tx.append_history(&entry)?;
                    }
                }
                tx.save_envelope(&envelope, now)?;
                Ok((envelope, contract.status))
            })
            .await?;

        info!(
            envelope_id = %envelope.envelope_id,
            contract_id = envelope.contract_id,
            from = %previous,
            to = %envelope.status,
            "Envelope status updated"
        );
        Ok(StatusCheck {
            message: envelope.status.message(),
            envelope,
            previous,
            changed: true,
            contract_status,
        })
    }

    /// Void an envelope. Completed envelopes cannot be voided; voiding a
    /// voided envelope changes nothing.
    pub async fn void(&self, envelope_id: &str, actor: &Actor) -> Result<SignatureEnvelope> {
        let result = match self.void_inner(envelope_id).await {
            Ok((envelope, false)) => {
                debug!(envelope_id, "Envelope already voided");
                return Ok(envelope);
            }
            Ok((envelope, true)) => {
                self.void_at_provider(&envelope.envelope_id);
                Ok(envelope)
            }
            Err(e) => Err(e),
        };
        self.logger.record(Some(actor), &result, |a| {
            let event = ActivityEvent::new(a, ActivityAction::DocusignVoid, ResourceType::Contract);
            match &result {
                Ok(env) => event.resource(
                    env.contract_id,
                    format!("Envelope: {}", short_id(&env.envelope_id)),
                ),
                Err(_) => event,
            }
        });
        result
    }

    fn void_at_provider(&self, envelope_id: &str) {
        if let Err(e) = self.provider.void(envelope_id) {
            warn!(envelope_id, "Provider did not void envelope: {e}");
        }
    }

    // The flag is false when the envelope was already voided.
    async fn void_inner(&self, envelope_id: &str) -> Result<(SignatureEnvelope, bool)> {
        let now = self.clock.now();
        self.store
            .write(|tx| {
                let mut envelope = tx
                    .envelope_by_id(envelope_id)?
                    .ok_or_else(|| Error::not_found("envelope", envelope_id))?;
                match envelope.status {
                    EnvelopeStatus::Completed => {
                        return Err(Error::AlreadyCompleted(envelope_id.to_string()))
                    }
                    EnvelopeStatus::Voided => return Ok((envelope, false)),
                    _ => {}
                }
                envelope.status = EnvelopeStatus::Voided;
                tx.save_envelope(&envelope, now)?;
                info!(envelope_id, contract_id = envelope.contract_id, "Envelope voided");
                Ok((envelope, true))
            })
            .await
    }

    /// Current envelope of a contract, if one was ever sent.
    pub async fn envelope(&self, contract_id: i64) -> Result<Option<SignatureEnvelope>> {
        self.store
            .read(|tx| {
                tx.require_contract(contract_id)?;
                tx.load_envelope(contract_id)
            })
            .await
    }

    /// Send several contracts, one recipient each, named after each
    /// contract's client. Failures are reported per contract and do not stop
    /// the batch.
    pub async fn send_many(
        &self,
        targets: &[(i64, String)],
        actor: &Actor,
    ) -> Vec<BulkSendOutcome> {
        let mut outcomes = Vec::with_capacity(targets.len());
        for (contract_id, email) in targets {
            let request = SendRequest {
                recipient_email: email.clone(),
                recipient_name: None,
                document_id: None,
            };
            let outcome = match self.send(*contract_id, request, actor).await {
                Ok(env) => BulkSendOutcome {
                    contract_id: *contract_id,
                    envelope_id: Some(env.envelope_id),
                    error: None,
                },
                Err(e) => BulkSendOutcome {
                    contract_id: *contract_id,
                    envelope_id: None,
                    error: Some(e.to_string()),
                },
            };
            outcomes.push(outcome);
        }
        let sent = outcomes.iter().filter(|o| o.error.is_none()).count();
        info!(sent, attempted = targets.len(), "Bulk send finished");
        outcomes
    }

    async fn load(&self, envelope_id: &str) -> Result<(SignatureEnvelope, ContractRecord)> {
        self.store
            .read(|tx| {
                let envelope = tx
                    .envelope_by_id(envelope_id)?
                    .ok_or_else(|| Error::not_found("envelope", envelope_id))?;
                let contract = tx.require_contract(envelope.contract_id)?;
                Ok((envelope, contract))
            })
            .await
    }
}

struct SentEnvelope {
    envelope: SignatureEnvelope,
    title: String,
}

fn select_document(
    tx: &Tx<'_>,
    contract: &ContractRecord,
    document_id: Option<i64>,
) -> Result<Selected> {
    let doc = match document_id {
        Some(id) => match tx.get_document(id)? {
            Some(doc) if doc.contract_id == contract.id => Some(doc),
            _ => {
                return Err(Error::InvalidDocument(format!(
                    "document {id} not found or does not belong to contract {}",
                    contract.id
                )))
            }
        },
        None => match tx.primary_document(contract.id)? {
            Some(doc) => Some(doc),
            None => tx.newest_document(contract.id)?,
        },
    };
    if let Some(doc) = doc {
        return Ok(Selected {
            document_id: Some(doc.id),
            path: doc.file_path,
            name: doc.original_filename,
        });
    }
    match &contract.legacy_document {
        Some(legacy) => Ok(Selected {
            document_id: None,
            path: legacy.file_path.clone(),
            name: legacy.file_name.clone(),
        }),
        None => Err(Error::InvalidDocument("no documents available to send".into())),
    }
}

fn short_id(envelope_id: &str) -> String {
    let head: String = envelope_id.chars().take(8).collect();
    format!("{head}...")
}

fn envelope_title(title: &str, envelope_id: &str) -> String {
    format!("{title} (Envelope: {})", short_id(envelope_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditStore;
    use crate::clock::{Clock, ManualClock};
    use crate::config::AuditConfig;
    use crate::contract::{NewClient, NewContract, RecordState};
    use crate::documents::{DocumentType, NewDocument};
    use chrono::TimeZone;
    use std::time::Duration;

    struct Harness {
        workflow: SignatureWorkflow,
        provider: Arc<MockSignatureProvider>,
        store: Storage,
        logger: Arc<ActivityLogger>,
        clock: Arc<ManualClock>,
        contract_id: i64,
        doc_id: i64,
    }

    async fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let logger = Arc::new(ActivityLogger::new(
            AuditStore::open_in_memory().unwrap(),
            clock.clone(),
            AuditConfig {
                poll_interval: Duration::from_millis(10),
                ..AuditConfig::default()
            },
        ));
        logger.start().unwrap();
        let store = Storage::open_in_memory().unwrap();
        let now = clock.now();
        let (contract_id, doc_id) = store
            .write(|tx| {
                let client = tx.insert_client(
                    &NewClient {
                        name: "Acme Corp".into(),
                        ..NewClient::default()
                    },
                    now,
                )?;
                let contract =
                    tx.insert_contract(&NewContract::new("Supply", client.id, "supply"), 1, now)?;
                let doc = tx.insert_document(&NewDocument {
                    contract_id: contract.id,
                    file_path: "2024/06/supply.pdf".into(),
                    file_name: "supply.pdf".into(),
                    original_filename: "supply.pdf".into(),
                    file_size: 2048,
                    mime_type: "application/pdf".into(),
                    extracted_text: None,
                    document_type: DocumentType::Contract,
                    description: None,
                    uploaded_by: 1,
                    uploaded_at: now,
                    is_primary: true,
                })?;
                Ok((contract.id, doc.id))
            })
            .await
            .unwrap();
        let provider = Arc::new(MockSignatureProvider::new(clock.clone()));
        Harness {
            workflow: SignatureWorkflow::new(
                store.clone(),
                provider.clone(),
                Arc::clone(&logger),
                clock.clone(),
            ),
            provider,
            store,
            logger,
            clock,
            contract_id,
            doc_id,
        }
    }

    fn request(email: &str, document_id: Option<i64>) -> SendRequest {
        SendRequest {
            recipient_email: email.into(),
            recipient_name: None,
            document_id,
        }
    }

    async fn contract_status(h: &Harness) -> ContractStatus {
        h.store
            .read(|tx| tx.require_contract(h.contract_id))
            .await
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_send_complete_then_void_is_rejected() {
        let h = harness().await;
        let actor = Actor::user(1);
        let env = h
            .workflow
            .send(h.contract_id, request("a@b.com", Some(h.doc_id)), &actor)
            .await
            .unwrap();
        assert_eq!(env.status, EnvelopeStatus::Sent);
        assert!(env.envelope_id.starts_with(MOCK_ENVELOPE_PREFIX));
        assert_eq!(env.recipient_name.as_deref(), Some("Acme Corp"));
        assert_eq!(contract_status(&h).await, ContractStatus::UnderReview);

        h.provider.force_status(&env.envelope_id, EnvelopeStatus::Completed);
        let check = h.workflow.check_status(&env.envelope_id, Some(&actor)).await.unwrap();
        assert!(check.changed);
        assert_eq!(check.envelope.status, EnvelopeStatus::Completed);
        assert_eq!(check.envelope.completed_at, Some(h.clock.now()));
        assert_eq!(contract_status(&h).await, ContractStatus::Active);

        let err = h.workflow.void(&env.envelope_id, &actor).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyCompleted(_)));
        let stored = h.workflow.envelope(h.contract_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EnvelopeStatus::Completed);

        let history = h
            .store
            .read(|tx| tx.status_history(h.contract_id, 10))
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].new_status, RecordState::Live(ContractStatus::Active));
    }

    #[tokio::test]
    async fn test_mock_progression_follows_elapsed_time() {
        let h = harness().await;
        let actor = Actor::user(1);
        let env = h
            .workflow
            .send(h.contract_id, request("a@b.com", None), &actor)
            .await
            .unwrap();
        assert_eq!(env.document_id, Some(h.doc_id));

        h.clock.advance(chrono::Duration::minutes(2));
        let check = h.workflow.check_status(&env.envelope_id, None).await.unwrap();
        assert!(!check.changed);

        h.clock.advance(chrono::Duration::seconds(1));
        let check = h.workflow.check_status(&env.envelope_id, None).await.unwrap();
        assert_eq!(check.envelope.status, EnvelopeStatus::Delivered);
        assert_eq!(contract_status(&h).await, ContractStatus::UnderReview);

        h.clock.advance(chrono::Duration::minutes(3));
        let check = h.workflow.check_status(&env.envelope_id, None).await.unwrap();
        assert_eq!(check.envelope.status, EnvelopeStatus::Completed);
        assert_eq!(check.contract_status, ContractStatus::Active);
    }

    #[tokio::test]
    async fn test_send_only_moves_draft_contracts() {
        let h = harness().await;
        let now = h.clock.now();
        h.store
            .write(|tx| {
                let mut c = tx.require_contract(h.contract_id)?;
                c.transition_to(ContractStatus::Active, 1, None, now)?;
                tx.save_contract(&c)
            })
            .await
            .unwrap();
        let env = h
            .workflow
            .send(h.contract_id, request("a@b.com", None), &Actor::user(1))
            .await
            .unwrap();
        assert_eq!(contract_status(&h).await, ContractStatus::Active);

        h.provider.force_status(&env.envelope_id, EnvelopeStatus::Completed);
        h.workflow.check_status(&env.envelope_id, None).await.unwrap();
        assert_eq!(contract_status(&h).await, ContractStatus::Active);
        let history = h
            .store
            .read(|tx| tx.count_status_history(h.contract_id))
            .await
            .unwrap();
        assert_eq!(history, 0);
    }

    #[tokio::test]
    async fn test_send_validation() {
        let h = harness().await;
        let actor = Actor::user(1);
        let err = h
            .workflow
            .send(h.contract_id, request("not-an-email", None), &actor)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = h
            .workflow
            .send(h.contract_id, request("a@b.com", Some(h.doc_id + 100)), &actor)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)));
        assert_eq!(contract_status(&h).await, ContractStatus::Draft);
    }

    #[tokio::test]
    async fn test_send_without_any_document_fails() {
        let h = harness().await;
        let now = h.clock.now();
        let bare = h
            .store
            .write(|tx| Ok(tx.insert_contract(&NewContract::new("Bare", 1, "nda"), 1, now)?.id))
            .await
            .unwrap();
        let err = h
            .workflow
            .send(bare, request("a@b.com", None), &Actor::user(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn test_provider_failure_is_retriable_and_changes_nothing() {
        let h = harness().await;
        h.provider.fail_next_send();
        let err = h
            .workflow
            .send(h.contract_id, request("a@b.com", None), &Actor::user(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SendFailed(_)));
        assert!(err.is_retriable());
        assert_eq!(contract_status(&h).await, ContractStatus::Draft);
        assert!(h.workflow.envelope(h.contract_id).await.unwrap().is_none());

        assert!(h
            .workflow
            .send(h.contract_id, request("a@b.com", None), &Actor::user(1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_void_sent_envelope() {
        let h = harness().await;
        let actor = Actor::user(1);
        let env = h
            .workflow
            .send(h.contract_id, request("a@b.com", None), &actor)
            .await
            .unwrap();
        let voided = h.workflow.void(&env.envelope_id, &actor).await.unwrap();
        assert_eq!(voided.status, EnvelopeStatus::Voided);
        assert!(h.workflow.void(&env.envelope_id, &actor).await.is_ok());

        h.clock.advance(chrono::Duration::hours(1));
        let check = h.workflow.check_status(&env.envelope_id, None).await.unwrap();
        assert!(!check.changed);
        assert_eq!(check.envelope.status, EnvelopeStatus::Voided);
    }

    #[tokio::test]
    async fn test_each_transition_logged() {
        let h = harness().await;
        let actor = Actor::user(9);
        let env = h
            .workflow
            .send(h.contract_id, request("a@b.com", None), &actor)
            .await
            .unwrap();
        h.provider.force_status(&env.envelope_id, EnvelopeStatus::Declined);
        h.workflow.check_status(&env.envelope_id, Some(&actor)).await.unwrap();
        h.workflow.void(&env.envelope_id, &actor).await.unwrap();

        assert!(h.logger.flush(Duration::from_secs(5)));
        let actions: Vec<_> = h
            .logger
            .store()
            .recent_activity(9, 10)
            .await
            .unwrap()
            .into_iter()
            .rev()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                ActivityAction::DocusignSend,
                ActivityAction::DocusignStatusChange,
                ActivityAction::DocusignCheck,
                ActivityAction::DocusignVoid,
            ]
        );
    }

    #[tokio::test]
    async fn test_send_many_reports_per_contract() {
        let h = harness().await;
        let outcomes = h
            .workflow
            .send_many(
                &[(h.contract_id, "a@b.com".into()), (h.contract_id + 50, "c@d.com".into())],
                &Actor::user(1),
            )
            .await;
        assert!(outcomes[0].envelope_id.is_some());
        assert!(outcomes[1].error.is_some());
        let env = h.workflow.envelope(h.contract_id).await.unwrap().unwrap();
        assert_eq!(env.recipient_name.as_deref(), Some("Acme Corp"));
    }

    #[tokio::test]
    async fn test_send_many_continues_after_provider_failure() {
        let h = harness().await;
        let now = h.clock.now();
        let second = h
            .store
            .write(|tx| {
                let contract = tx.insert_contract(&NewContract::new("Lease", 1, "lease"), 1, now)?;
                tx.insert_document(&NewDocument {
                    contract_id: contract.id,
                    file_path: "2024/06/lease.pdf".into(),
                    file_name: "lease.pdf".into(),
                    original_filename: "lease.pdf".into(),
                    file_size: 512,
                    mime_type: "application/pdf".into(),
                    extracted_text: None,
                    document_type: DocumentType::Contract,
                    description: None,
                    uploaded_by: 1,
                    uploaded_at: now,
                    is_primary: true,
                })?;
                Ok(contract.id)
            })
            .await
            .unwrap();

        h.provider.fail_next_send();
        let outcomes = h
            .workflow
            .send_many(
                &[(h.contract_id, "a@b.com".into()), (second, "c@d.com".into())],
                &Actor::user(1),
            )
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].envelope_id.is_none());
        assert!(outcomes[0].error.as_deref().unwrap().contains("temporarily unavailable"));
        assert!(outcomes[1].error.is_none());
        assert!(h.workflow.envelope(h.contract_id).await.unwrap().is_none());
        assert_eq!(contract_status(&h).await, ContractStatus::Draft);
        let sent = h.workflow.envelope(second).await.unwrap().unwrap();
        assert_eq!(Some(sent.envelope_id), outcomes[1].envelope_id);
        assert_eq!(sent.recipient_name.as_deref(), Some("Acme Corp"));
    }

    #[tokio::test]
    async fn test_repeated_void_logs_once() {
        let h = harness().await;
        let actor = Actor::user(3);
        let env = h
            .workflow
            .send(h.contract_id, request("a@b.com", None), &actor)
            .await
            .unwrap();
        h.workflow.void(&env.envelope_id, &actor).await.unwrap();
        let again = h.workflow.void(&env.envelope_id, &actor).await.unwrap();
        assert_eq!(again.status, EnvelopeStatus::Voided);
        assert_eq!(h.provider.voided(), vec![env.envelope_id.clone()]);

        assert!(h.logger.flush(Duration::from_secs(5)));
        let voids = h
            .logger
            .store()
            .recent_activity(3, 10)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.action == ActivityAction::DocusignVoid)
            .count();
        assert_eq!(voids, 1);
    }

    // Soft-deletes the contract while the envelope is in flight.
    struct DeletingProvider {
        inner: MockSignatureProvider,
        store: Storage,
        contract_id: i64,
        at: DateTime<Utc>,
    }

    impl SignatureProvider for DeletingProvider {
        fn send(&self, envelope: &OutgoingEnvelope) -> Result<ProviderReceipt, ProviderError> {
            self.store
                .write_now(|tx| {
                    let mut contract = tx.require_contract(self.contract_id)?;
                    let entry = contract.soft_delete(2, self.at)?;
                    tx.save_contract(&contract)?;
                    tx.append_history(&entry)
                })
                .unwrap();
            self.inner.send(envelope)
        }

        fn check_status(&self, envelope: &SignatureEnvelope) -> Result<EnvelopeStatus, ProviderError> {
            self.inner.check_status(envelope)
        }

        fn void(&self, envelope_id: &str) -> Result<(), ProviderError> {
            self.inner.void(envelope_id)
        }
    }

    #[tokio::test]
    async fn test_contract_deleted_during_send_voids_envelope() {
        let h = harness().await;
        let provider = Arc::new(DeletingProvider {
            inner: MockSignatureProvider::new(h.clock.clone()),
            store: h.store.clone(),
            contract_id: h.contract_id,
            at: h.clock.now(),
        });
        let workflow = SignatureWorkflow::new(
            h.store.clone(),
            provider.clone(),
            Arc::clone(&h.logger),
            h.clock.clone(),
        );

        let err = workflow
            .send(h.contract_id, request("a@b.com", None), &Actor::user(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ContractDeleted(id) if id == h.contract_id));
        assert_eq!(provider.inner.voided().len(), 1);

        let (envelope, history) = h
            .store
            .read(|tx| {
                Ok((
                    tx.load_envelope(h.contract_id)?,
                    tx.count_status_history(h.contract_id)?,
                ))
            })
            .await
            .unwrap();
        assert!(envelope.is_none());
        assert_eq!(history, 1);
    }
}
