//! Application context: owns both stores, the activity logger, and the
//! services built on them.

use crate::activity::{ActivityLogger, ResourceType};
use crate::audit::{ActivityLogEntry, AuditCounts, AuditError, AuditStore, FieldVersionEntry, ViewCount};
use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::contract::UserId;
use crate::documents::{DocumentSet, DocumentStore, LocalDocumentStore};
use crate::lifecycle::ContractService;
use crate::notifications::Notifier;
use crate::retention::RetentionSweeper;
use crate::signature::{MockSignatureProvider, SignatureProvider, SignatureWorkflow};
use crate::storage::Storage;
use std::sync::Arc;
use tracing::info;

pub type StartupError = Box<dyn std::error::Error + Send + Sync>;

pub struct App {
    pub contracts: ContractService,
    pub documents: DocumentSet,
    pub signatures: SignatureWorkflow,
    pub notifications: Notifier,
    pub sweeper: Arc<RetentionSweeper>,
    pub logger: Arc<ActivityLogger>,
    audit: AuditStore,
    clock: SharedClock,
}

impl App {
    /// Open the stores under the configured data directory. The logger is
    /// created but not started.
    pub fn open(config: &Config) -> Result<Self, StartupError> {
        let store = Storage::open(&config.contracts_db_path())?;
        let audit = AuditStore::open(&config.audit_db_path())?;
        let clock: SharedClock = Arc::new(SystemClock);
        let files = Arc::new(LocalDocumentStore::new(config.upload_dir(), &config.uploads));
        let provider = Arc::new(MockSignatureProvider::new(Arc::clone(&clock)));
        info!(data_dir = %config.data_dir.display(), "Stores opened");
        Ok(Self::with_parts(config, store, audit, clock, files, provider))
    }

    pub fn with_parts(
        config: &Config,
        store: Storage,
        audit: AuditStore,
        clock: SharedClock,
        files: Arc<dyn DocumentStore>,
        provider: Arc<dyn SignatureProvider>,
    ) -> Self {
        let logger = Arc::new(ActivityLogger::new(
            audit.clone(),
            Arc::clone(&clock),
            config.audit.clone(),
        ));
        Self {
            contracts: ContractService::new(
                store.clone(),
                Arc::clone(&logger),
                Arc::clone(&clock),
                config.restore_policy,
            ),
            documents: DocumentSet::new(
                store.clone(),
                Arc::clone(&files),
                Arc::clone(&logger),
                Arc::clone(&clock),
            ),
            signatures: SignatureWorkflow::new(
                store.clone(),
                provider,
                Arc::clone(&logger),
                Arc::clone(&clock),
            ),
            notifications: Notifier::new(store.clone(), Arc::clone(&clock)),
            sweeper: Arc::new(RetentionSweeper::new(
                store,
                audit.clone(),
                files,
                Arc::clone(&clock),
                config.retention.clone(),
            )),
            logger,
            audit,
            clock,
        }
    }

    pub fn today(&self) -> chrono::NaiveDate {
        self.clock.today()
    }

    // ── Audit Queries ───────────────────────────────────────────

    pub async fn recent_activity(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<ActivityLogEntry>, AuditError> {
        self.audit.recent_activity(user_id, limit).await
    }

    pub async fn contract_history(
        &self,
        contract_id: i64,
        limit: usize,
    ) -> Result<Vec<FieldVersionEntry>, AuditError> {
        self.audit.contract_history(contract_id, limit).await
    }

    /// Most viewed resources over the last `since_days` days.
    pub async fn most_viewed(
        &self,
        resource_type: ResourceType,
        limit: usize,
        since_days: i64,
    ) -> Result<Vec<ViewCount>, AuditError> {
        let since = self.clock.now() - chrono::Duration::days(since_days.max(0));
        self.audit.most_viewed(resource_type, limit, since).await
    }

    pub async fn audit_counts(&self) -> Result<AuditCounts, AuditError> {
        self.audit.counts().await
    }
}
