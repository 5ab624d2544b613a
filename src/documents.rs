//! Documents attached to a contract, at most one of them primary.
//!
//! Blob storage and text extraction sit behind [`DocumentStore`]; the rows
//! (and the primary flag) live in the primary store.

use crate::activity::{ActivityAction, ActivityEvent, ActivityLogger, Actor, ResourceType};
use crate::clock::SharedClock;
use crate::config::UploadConfig;
use crate::contract::UserId;
use crate::error::{Error, Result};
use crate::storage::{Storage, Tx};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

// ── Records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    #[default]
    Contract,
    Amendment,
    Attachment,
    Addendum,
    Schedule,
    Exhibit,
    Other,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contract => "contract",
            Self::Amendment => "amendment",
            Self::Attachment => "attachment",
            Self::Addendum => "addendum",
            Self::Schedule => "schedule",
            Self::Exhibit => "exhibit",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "contract" => Some(Self::Contract),
            "amendment" => Some(Self::Amendment),
            "attachment" => Some(Self::Attachment),
            "addendum" => Some(Self::Addendum),
            "schedule" => Some(Self::Schedule),
            "exhibit" => Some(Self::Exhibit),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub contract_id: i64,
    pub file_path: String,
    pub file_name: String,
    pub original_filename: String,
    pub file_size: i64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    pub document_type: DocumentType,
    pub description: Option<String>,
    pub uploaded_by: UserId,
    pub uploaded_at: DateTime<Utc>,
    pub is_primary: bool,
}

impl DocumentRecord {
    pub fn size_human(&self) -> String {
        let size = self.file_size;
        if size < 1024 {
            format!("{size} bytes")
        } else if size < 1_048_576 {
            format!("{:.1} KB", size as f64 / 1024.0)
        } else {
            format!("{:.1} MB", size as f64 / 1_048_576.0)
        }
    }
}

/// Row to insert. Built by [`DocumentSet`] from an upload or a legacy contract.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub contract_id: i64,
    pub file_path: String,
    pub file_name: String,
    pub original_filename: String,
    pub file_size: i64,
    pub mime_type: String,
    pub extracted_text: Option<String>,
    pub document_type: DocumentType,
    pub description: Option<String>,
    pub uploaded_by: UserId,
    pub uploaded_at: DateTime<Utc>,
    pub is_primary: bool,
}

// ── Blob Storage ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FileBlob {
    pub original_filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Path relative to the store root.
    pub path: String,
    pub file_name: String,
    pub size: i64,
    pub mime_type: String,
}

pub trait DocumentStore: Send + Sync {
    fn save(&self, blob: &FileBlob, now: DateTime<Utc>) -> Result<StoredFile>;

    /// Best-effort: returns an empty string when nothing can be extracted.
    fn extract_text(&self, stored: &StoredFile) -> String;

    fn delete(&self, path: &str) -> std::io::Result<()>;
}

/// Files under a root directory, grouped by upload year and month.
pub struct LocalDocumentStore {
    root: PathBuf,
    max_bytes: u64,
    allowed_extensions: Vec<String>,
}

impl LocalDocumentStore {
    pub fn new(root: impl Into<PathBuf>, uploads: &UploadConfig) -> Self {
        Self {
            root: root.into(),
            max_bytes: uploads.max_bytes,
            allowed_extensions: uploads.allowed_extensions.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn check(&self, blob: &FileBlob) -> Result<String> {
        let name = blob.original_filename.trim();
        if name.is_empty() {
            return Err(Error::InvalidDocument("no file selected".into()));
        }
        let ext = extension_of(name)
            .filter(|ext| self.allowed_extensions.iter().any(|a| a == ext))
            .ok_or_else(|| {
                Error::InvalidDocument(format!(
                    "file type not allowed; allowed types: {}",
                    self.allowed_extensions.join(", ")
                ))
            })?;
        if blob.bytes.len() as u64 > self.max_bytes {
            return Err(Error::InvalidDocument(format!(
                "file exceeds the {} byte upload limit",
                self.max_bytes
            )));
        }
        Ok(ext)
    }
}

impl DocumentStore for LocalDocumentStore {
    fn save(&self, blob: &FileBlob, now: DateTime<Utc>) -> Result<StoredFile> {
        let ext = self.check(blob)?;
        let stem = blob
            .original_filename
            .rsplit_once('.')
            .map_or(blob.original_filename.as_str(), |(stem, _)| stem);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let file_name = format!(
            "{}_{}_{}.{ext}",
            secure_stem(stem),
            now.format("%Y-%m-%d_%H%M%S"),
            &suffix[..8]
        );
        let relative = format!("{}/{file_name}", now.format("%Y/%m"));
        let full = self.resolve(&relative);
        if let Some(dir) = full.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&full, &blob.bytes)?;
        info!(path = %relative, bytes = blob.bytes.len(), "Stored uploaded file");

        let mime_type = blob
            .content_type
            .clone()
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| mime_for_extension(&ext).to_string());
        Ok(StoredFile {
            path: relative,
            file_name,
            size: blob.bytes.len() as i64,
            mime_type,
        })
    }

    fn extract_text(&self, stored: &StoredFile) -> String {
        let is_rtf = stored.mime_type.contains("rtf") || stored.file_name.ends_with(".rtf");
        if !stored.mime_type.starts_with("text/") && !is_rtf {
            return String::new();
        }
        match std::fs::read(self.resolve(&stored.path)) {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes);
                if is_rtf {
                    strip_rtf(&content)
                } else {
                    content.trim().to_string()
                }
            }
            Err(e) => {
                warn!(path = %stored.path, "Text extraction failed: {e}");
                String::new()
            }
        }
    }

    fn delete(&self, path: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.resolve(path))
    }
}

fn extension_of(name: &str) -> Option<String> {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty())
}

fn secure_stem(stem: &str) -> String {
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '_');
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned.to_string()
    }
}

fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "doc" => "application/msword",
        "txt" => "text/plain",
        "rtf" => "application/rtf",
        _ => "application/octet-stream",
    }
}

// Control-word and whitespace patterns, compiled once.
static RTF_PATTERNS: OnceLock<Option<(Regex, Regex)>> = OnceLock::new();

// Drops control words and group braces, then collapses whitespace.
fn strip_rtf(content: &str) -> String {
    let patterns = RTF_PATTERNS.get_or_init(|| {
        Some((
            Regex::new(r"\\[a-z]+-?\d*").ok()?,
            Regex::new(r"\s+").ok()?,
        ))
    });
    let Some((control, space)) = patterns else {
        return content.trim().to_string();
    };
    let text = control.replace_all(content, "");
    let text = text.replace(['{', '}'], "");
    space.replace_all(&text, " ").trim().to_string()
}

// ── Document Set ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub blob: FileBlob,
    pub document_type: DocumentType,
    pub description: Option<String>,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentDeletion {
    pub removed: DocumentRecord,
    /// Set when the removed document was primary and another took its place.
    pub promoted: Option<DocumentRecord>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub migrated: Vec<i64>,
    pub skipped: usize,
    pub failed: usize,
}

pub struct DocumentSet {
    store: Storage,
    files: Arc<dyn DocumentStore>,
    logger: Arc<ActivityLogger>,
    clock: SharedClock,
}

impl DocumentSet {
    pub fn new(
        store: Storage,
        files: Arc<dyn DocumentStore>,
        logger: Arc<ActivityLogger>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            files,
            logger,
            clock,
        }
    }

    /// Store the blob, then insert its row. A primary upload demotes the
    /// previous primary in the same transaction.
    pub async fn upload(
        &self,
        contract_id: i64,
        request: UploadRequest,
        actor: &Actor,
    ) -> Result<DocumentRecord> {
        let result = self.upload_inner(contract_id, &request, actor.user_id).await;
        self.logger.record(Some(actor), &result, |a| {
            let event = ActivityEvent::new(a, ActivityAction::DocumentUpload, ResourceType::Document);
            match &result {
                Ok(doc) => event.resource(doc.id, doc.original_filename.clone()),
                Err(_) => event,
            }
        });
        result
    }

    async fn upload_inner(
        &self,
        contract_id: i64,
        request: &UploadRequest,
        uploaded_by: UserId,
    ) -> Result<DocumentRecord> {
        self.store.read(|tx| require_live_contract(tx, contract_id)).await?;

        let now = self.clock.now();
        let stored = self.files.save(&request.blob, now)?;
        let text = self.files.extract_text(&stored);
        let new = NewDocument {
            contract_id,
            file_path: stored.path.clone(),
            file_name: stored.file_name.clone(),
            original_filename: request.blob.original_filename.clone(),
            file_size: stored.size,
            mime_type: stored.mime_type.clone(),
            extracted_text: (!text.is_empty()).then_some(text),
            document_type: request.document_type,
            description: request.description.clone(),
            uploaded_by,
            uploaded_at: now,
            is_primary: request.is_primary,
        };

        let result = self
            .store
            .write(|tx| {
                require_live_contract(tx, contract_id)?;
                tx.insert_document(&new)
            })
            .await;
        match &result {
            Ok(doc) => info!(
                contract_id,
                document_id = doc.id,
                primary = doc.is_primary,
                "Document uploaded"
            ),
            Err(_) => self.discard_blob(&stored.path),
        }
        result
    }

    /// Delete a document. With `contract_id`, the document must belong to
    /// that contract. Deleting the primary promotes the newest remaining one.
    pub async fn delete(
        &self,
        document_id: i64,
        contract_id: Option<i64>,
        actor: &Actor,
    ) -> Result<DocumentDeletion> {
        let result = self
            .store
            .write(|tx| {
                let removed = tx.require_document(document_id)?;
                if let Some(expected) = contract_id {
                    if removed.contract_id != expected {
                        return Err(Error::OwnershipMismatch {
                            document_id,
                            contract_id: expected,
                        });
                    }
                }
                tx.delete_document_row(document_id)?;
                let promoted = if removed.is_primary {
                    match tx.newest_document(removed.contract_id)? {
                        Some(next) => {
                            tx.mark_primary(removed.contract_id, next.id)?;
                            Some(tx.require_document(next.id)?)
                        }
                        None => None,
                    }
                } else {
                    None
                };
                Ok(DocumentDeletion { removed, promoted })
            })
            .await;

        if let Ok(deletion) = &result {
            self.discard_blob(&deletion.removed.file_path);
            info!(
                document_id,
                contract_id = deletion.removed.contract_id,
                promoted = ?deletion.promoted.as_ref().map(|d| d.id),
                "Document deleted"
            );
        }
        self.logger.record(Some(actor), &result, |a| {
            let event = ActivityEvent::new(a, ActivityAction::DocumentDelete, ResourceType::Document);
            match &result {
                Ok(d) => event.resource(document_id, d.removed.original_filename.clone()),
                Err(_) => event.resource_id(document_id),
            }
        });
        result
    }

    /// Make `document_id` the contract's only primary document.
    pub async fn set_primary(
        &self,
        document_id: i64,
        contract_id: i64,
        actor: &Actor,
    ) -> Result<DocumentRecord> {
        let result = self
            .store
            .write(|tx| {
                match tx.get_document(document_id)? {
                    Some(doc) if doc.contract_id == contract_id => {}
                    _ => return Err(Error::not_found("document", document_id)),
                }
                tx.mark_primary(contract_id, document_id)?;
                tx.require_document(document_id)
            })
            .await;
        if result.is_ok() {
            debug!(contract_id, document_id, "Primary document changed");
        }
        self.logger.record(Some(actor), &result, |a| {
            let event =
                ActivityEvent::new(a, ActivityAction::DocumentSetPrimary, ResourceType::Document);
            match &result {
                Ok(doc) => event.resource(doc.id, doc.original_filename.clone()),
                Err(_) => event.resource_id(document_id),
            }
        });
        result
    }

    /// Primary first, then newest first.
    pub async fn list(&self, contract_id: i64) -> Result<Vec<DocumentRecord>> {
        self.store
            .read(|tx| {
                tx.require_contract(contract_id)?;
                tx.list_documents(contract_id)
            })
            .await
    }

    pub async fn get(&self, document_id: i64) -> Result<DocumentRecord> {
        self.store.read(|tx| tx.require_document(document_id)).await
    }

    /// Look up a document for download and record that it was fetched.
    pub async fn download(&self, document_id: i64, actor: Option<&Actor>) -> Result<DocumentRecord> {
        let result = self.get(document_id).await;
        self.logger.record(actor, &result, |a| {
            let event =
                ActivityEvent::new(a, ActivityAction::DocumentDownload, ResourceType::Document);
            match &result {
                Ok(doc) => event.resource(doc.id, doc.original_filename.clone()),
                Err(_) => event.resource_id(document_id),
            }
        });
        result
    }

    /// Turn a contract's legacy single-document fields into a primary
    /// document. Does nothing if there are no legacy fields or the contract
    /// already has documents.
    pub async fn migrate_legacy(
        &self,
        contract_id: i64,
        actor: Option<&Actor>,
    ) -> Result<Option<DocumentRecord>> {
        let result = self
            .store
            .write(|tx| {
                let contract = tx.require_contract(contract_id)?;
                let Some(legacy) = &contract.legacy_document else {
                    return Ok(None);
                };
                if tx.count_documents(contract_id)? > 0 {
                    return Ok(None);
                }
                let doc = tx.insert_document(&NewDocument {
                    contract_id,
                    file_path: legacy.file_path.clone(),
                    file_name: legacy.file_name.clone(),
                    original_filename: legacy.file_name.clone(),
                    file_size: legacy.file_size.unwrap_or(0),
                    mime_type: legacy
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    extracted_text: legacy.extracted_text.clone(),
                    document_type: DocumentType::Contract,
                    description: Some("Migrated from legacy single document".into()),
                    uploaded_by: contract.created_by,
                    uploaded_at: contract.created_at,
                    is_primary: true,
                })?;
                Ok(Some(doc))
            })
            .await;

        if let Ok(Some(doc)) = &result {
            info!(contract_id, document_id = doc.id, "Migrated legacy document");
            self.logger.record(actor, &result, |a| {
                ActivityEvent::new(a, ActivityAction::DocumentMigrate, ResourceType::Document)
                    .resource(doc.id, doc.original_filename.clone())
            });
        }
        result
    }

    /// Migrate every contract that still has only legacy document fields.
    pub async fn migrate_all_legacy(&self, actor: Option<&Actor>) -> Result<MigrationReport> {
        let candidates = self
            .store
            .read(|tx| tx.contracts_with_legacy_documents())
            .await?;
        let mut report = MigrationReport::default();
        for contract_id in candidates {
            match self.migrate_legacy(contract_id, actor).await {
                Ok(Some(_)) => report.migrated.push(contract_id),
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(contract_id, "Legacy document migration failed: {e}");
                }
            }
        }
        info!(
            migrated = report.migrated.len(),
            skipped = report.skipped,
            failed = report.failed,
            "Legacy document migration finished"
        );
        Ok(report)
    }

    fn discard_blob(&self, path: &str) {
        if let Err(e) = self.files.delete(path) {
            warn!(path, "Failed to delete stored file: {e}");
        }
    }
}

fn require_live_contract(tx: &Tx<'_>, contract_id: i64) -> Result<()> {
    let contract = tx.require_contract(contract_id)?;
    if contract.is_deleted() {
        return Err(Error::ContractDeleted(contract_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditStore;
    use crate::clock::{Clock, ManualClock};
    use crate::config::AuditConfig;
    use crate::contract::{LegacyDocument, NewClient, NewContract};
    use chrono::TimeZone;
    use std::time::Duration;

    struct Harness {
        docs: DocumentSet,
        store: Storage,
        clock: Arc<ManualClock>,
        logger: Arc<ActivityLogger>,
        contract_id: i64,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
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
        let contract_id = store
            .write(|tx| {
                let client = tx.insert_client(
                    &NewClient {
                        name: "Acme".into(),
                        ..NewClient::default()
                    },
                    now,
                )?;
                Ok(tx
                    .insert_contract(&NewContract::new("Lease", client.id, "lease"), 1, now)?
                    .id)
            })
            .await
            .unwrap();
        let files = Arc::new(LocalDocumentStore::new(dir.path(), &UploadConfig::default()));
        Harness {
            docs: DocumentSet::new(store.clone(), files, Arc::clone(&logger), clock.clone()),
            store,
            clock,
            logger,
            contract_id,
            _dir: dir,
        }
    }

    fn upload(name: &str, is_primary: bool) -> UploadRequest {
        UploadRequest {
            blob: FileBlob {
                original_filename: name.into(),
                content_type: None,
                bytes: format!("contents of {name}").into_bytes(),
            },
            document_type: DocumentType::Contract,
            description: None,
            is_primary,
        }
    }

    async fn primaries(h: &Harness) -> Vec<String> {
        h.docs
            .list(h.contract_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|d| d.is_primary)
            .map(|d| d.original_filename)
            .collect()
    }

    #[tokio::test]
    async fn test_second_primary_upload_takes_over() {
        let h = harness().await;
        let actor = Actor::user(3);
        let doc1 = h.docs.upload(h.contract_id, upload("one.txt", true), &actor).await.unwrap();
        let doc2 = h.docs.upload(h.contract_id, upload("two.txt", true), &actor).await.unwrap();

        assert!(!h.docs.get(doc1.id).await.unwrap().is_primary);
        assert!(h.docs.get(doc2.id).await.unwrap().is_primary);
        assert_eq!(primaries(&h).await, vec!["two.txt"]);
    }

    #[tokio::test]
    async fn test_upload_stores_file_and_extracts_text() {
        let h = harness().await;
        let doc = h
            .docs
            .upload(h.contract_id, upload("Master Agreement.txt", false), &Actor::user(3))
            .await
            .unwrap();
        assert_eq!(doc.mime_type, "text/plain");
        assert_eq!(doc.extracted_text.as_deref(), Some("contents of Master Agreement.txt"));
        assert!(doc.file_path.starts_with("2024/06/Master_Agreement_2024-06-01_090000_"));
        assert_eq!(doc.size_human(), "32 bytes");
    }

    #[tokio::test]
    async fn test_disallowed_extension_rejected_without_row() {
        let h = harness().await;
        let err = h
            .docs
            .upload(h.contract_id, upload("payload.exe", false), &Actor::user(3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)));
        assert!(h.docs.list(h.contract_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleting_primary_promotes_newest_remaining() {
        let h = harness().await;
        let actor = Actor::user(3);
        let older = h.docs.upload(h.contract_id, upload("a.txt", false), &actor).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(1));
        let newer = h.docs.upload(h.contract_id, upload("b.txt", false), &actor).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(1));
        let primary = h.docs.upload(h.contract_id, upload("c.txt", true), &actor).await.unwrap();

        let deletion = h
            .docs
            .delete(primary.id, Some(h.contract_id), &actor)
            .await
            .unwrap();
        assert_eq!(deletion.promoted.as_ref().map(|d| d.id), Some(newer.id));
        assert_eq!(primaries(&h).await, vec!["b.txt"]);

        h.docs.delete(newer.id, None, &actor).await.unwrap();
        assert_eq!(primaries(&h).await, vec!["a.txt"]);

        let last = h.docs.delete(older.id, None, &actor).await.unwrap();
        assert!(last.promoted.is_none());
        assert!(primaries(&h).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_checks_ownership() {
        let h = harness().await;
        let actor = Actor::user(3);
        let doc = h.docs.upload(h.contract_id, upload("a.txt", true), &actor).await.unwrap();
        let err = h
            .docs
            .delete(doc.id, Some(h.contract_id + 1), &actor)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OwnershipMismatch { .. }));
        assert_eq!(h.docs.list(h.contract_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_survives_missing_blob() {
        let h = harness().await;
        let actor = Actor::user(3);
        let doc = h.docs.upload(h.contract_id, upload("a.txt", false), &actor).await.unwrap();
        std::fs::remove_file(h._dir.path().join(&doc.file_path)).unwrap();
        assert!(h.docs.delete(doc.id, None, &actor).await.is_ok());
    }

    #[tokio::test]
    async fn test_set_primary_requires_matching_contract() {
        let h = harness().await;
        let actor = Actor::user(3);
        let a = h.docs.upload(h.contract_id, upload("a.txt", true), &actor).await.unwrap();
        let b = h.docs.upload(h.contract_id, upload("b.txt", false), &actor).await.unwrap();

        let err = h
            .docs
            .set_primary(b.id, h.contract_id + 1, &actor)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        h.docs.set_primary(b.id, h.contract_id, &actor).await.unwrap();
        assert!(!h.docs.get(a.id).await.unwrap().is_primary);
        assert_eq!(primaries(&h).await, vec!["b.txt"]);
    }

    #[tokio::test]
    async fn test_primary_invariant_over_mixed_sequence() {
        let h = harness().await;
        let actor = Actor::user(3);
        let mut ids = Vec::new();
        for (i, primary) in [true, false, true, false, true].into_iter().enumerate() {
            h.clock.advance(chrono::Duration::seconds(1));
            let doc = h
                .docs
                .upload(h.contract_id, upload(&format!("d{i}.txt"), primary), &actor)
                .await
                .unwrap();
            ids.push(doc.id);
            assert!(primaries(&h).await.len() <= 1);
        }
        h.docs.set_primary(ids[1], h.contract_id, &actor).await.unwrap();
        assert_eq!(primaries(&h).await.len(), 1);
        for id in [ids[1], ids[4], ids[0]] {
            h.docs.delete(id, Some(h.contract_id), &actor).await.unwrap();
            assert_eq!(primaries(&h).await.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_migrate_legacy_is_idempotent() {
        let h = harness().await;
        let now = h.clock.now();
        let legacy_id = h
            .store
            .write(|tx| {
                let mut new = NewContract::new("Old lease", 1, "lease");
                new.legacy_document = Some(LegacyDocument {
                    file_path: "legacy/old.pdf".into(),
                    file_name: "old.pdf".into(),
                    file_size: None,
                    mime_type: None,
                    extracted_text: Some("old terms".into()),
                });
                Ok(tx.insert_contract(&new, 5, now)?.id)
            })
            .await
            .unwrap();

        let report = h.docs.migrate_all_legacy(Some(&Actor::user(1))).await.unwrap();
        assert_eq!(report.migrated, vec![legacy_id]);

        let docs = h.docs.list(legacy_id).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].is_primary);
        assert_eq!(docs[0].file_size, 0);
        assert_eq!(docs[0].mime_type, "application/octet-stream");
        assert_eq!(docs[0].uploaded_by, 5);
        assert_eq!(docs[0].uploaded_at, now);

        assert!(h.docs.migrate_legacy(legacy_id, None).await.unwrap().is_none());
        assert!(h.docs.migrate_legacy(h.contract_id, None).await.unwrap().is_none());
        assert_eq!(h.docs.list(legacy_id).await.unwrap().len(), 1);

        assert!(h.logger.flush(Duration::from_secs(5)));
        let recent = h.logger.store().recent_activity(1, 10).await.unwrap();
        assert_eq!(recent[0].action, ActivityAction::DocumentMigrate);
    }

    #[test]
    fn test_rtf_markup_is_stripped() {
        let text = strip_rtf(r"{\rtf1\ansi {\b Payment} terms\par net 30}");
        assert_eq!(text, "Payment terms net 30");
        // Second call reuses the compiled patterns.
        assert_eq!(strip_rtf(r"{\rtf1 Term\tab one}"), "Term one");
        assert!(RTF_PATTERNS.get().is_some_and(Option::is_some));
    }

    #[test]
    fn test_secure_stem() {
        assert_eq!(secure_stem("../../etc/passwd"), "etcpasswd");
        assert_eq!(secure_stem("Q3 report (final)"), "Q3_report_final");
        assert_eq!(secure_stem("???"), "document");
    }
}
