//! Fire-and-forget activity logging.
//!
//! Callers hand [`AuditRequest`]s to a bounded in-process queue; one named
//! writer thread drains it into the [`AuditStore`]. Nothing on this path
//! ever returns an error to the caller. When the queue is full the newest
//! request is dropped and counted.

use crate::audit::AuditStore;
use crate::clock::SharedClock;
use crate::config::AuditConfig;
use crate::contract::UserId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Target for audit-path failures. This is the only place they surface.
pub const AUDIT_FAILURE_TARGET: &str = "contract_records_mcp::audit";

// ── Actions & Resources ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    View,
    Create,
    Update,
    Delete,
    Restore,
    DocusignSend,
    DocusignCheck,
    DocusignVoid,
    DocusignStatusChange,
    DocumentUpload,
    DocumentDelete,
    DocumentDownload,
    DocumentSetPrimary,
    DocumentMigrate,
}

impl ActivityAction {
    pub const ALL: [ActivityAction; 14] = [
        Self::View,
        Self::Create,
        Self::Update,
        Self::Delete,
        Self::Restore,
        Self::DocusignSend,
        Self::DocusignCheck,
        Self::DocusignVoid,
        Self::DocusignStatusChange,
        Self::DocumentUpload,
        Self::DocumentDelete,
        Self::DocumentDownload,
        Self::DocumentSetPrimary,
        Self::DocumentMigrate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Restore => "restore",
            Self::DocusignSend => "docusign_send",
            Self::DocusignCheck => "docusign_check",
            Self::DocusignVoid => "docusign_void",
            Self::DocusignStatusChange => "docusign_status_change",
            Self::DocumentUpload => "document_upload",
            Self::DocumentDelete => "document_delete",
            Self::DocumentDownload => "document_download",
            Self::DocumentSetPrimary => "document_set_primary",
            Self::DocumentMigrate => "document_migrate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == s)
    }

    /// Verb used in human-readable activity summaries.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::View => "Viewed",
            Self::Create => "Created",
            Self::Update => "Updated",
            Self::Delete => "Deleted",
            Self::Restore => "Restored",
            Self::DocusignSend => "Sent for signature",
            Self::DocusignCheck => "Checked signature status of",
            Self::DocusignVoid => "Voided signature request for",
            Self::DocusignStatusChange => "Signature status changed for",
            Self::DocumentUpload => "Uploaded",
            Self::DocumentDelete => "Deleted",
            Self::DocumentDownload => "Downloaded",
            Self::DocumentSetPrimary => "Set primary",
            Self::DocumentMigrate => "Migrated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Contract,
    Client,
    User,
    Document,
    Docusign,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contract => "contract",
            Self::Client => "client",
            Self::User => "user",
            Self::Document => "document",
            Self::Docusign => "docusign",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "contract" => Some(Self::Contract),
            "client" => Some(Self::Client),
            "user" => Some(Self::User),
            "document" => Some(Self::Document),
            "docusign" => Some(Self::Docusign),
            _ => None,
        }
    }
}

// ── Requests ────────────────────────────────────────────────────────

/// Who is acting, plus the request metadata recorded alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl Actor {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEvent {
    pub user_id: UserId,
    pub action: ActivityAction,
    pub resource_type: ResourceType,
    pub resource_id: Option<i64>,
    pub resource_title: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ActivityEvent {
    pub fn new(actor: &Actor, action: ActivityAction, resource_type: ResourceType) -> Self {
        Self {
            user_id: actor.user_id,
            action,
            resource_type,
            resource_id: None,
            resource_title: None,
            success: true,
            error_message: None,
            ip_address: actor.ip_address.clone(),
            user_agent: actor.user_agent.clone(),
        }
    }

    pub fn resource(mut self, id: i64, title: impl Into<String>) -> Self {
        self.resource_id = Some(id);
        self.resource_title = Some(title.into());
        self
    }

    pub fn resource_id(mut self, id: i64) -> Self {
        self.resource_id = Some(id);
        self
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldVersionChange {
    pub contract_id: i64,
    pub user_id: UserId,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// One unit of work for the writer thread. The timestamp is taken at
/// submission so that queue latency never reorders history.
#[derive(Debug, Clone)]
pub enum AuditRequest {
    Activity {
        event: ActivityEvent,
        at: DateTime<Utc>,
    },
    FieldVersion {
        change: FieldVersionChange,
        at: DateTime<Utc>,
    },
}

impl AuditRequest {
    fn describe(&self) -> String {
        match self {
            Self::Activity { event, .. } => format!(
                "{} {} {:?} by user {}",
                event.action.as_str(),
                event.resource_type.as_str(),
                event.resource_id,
                event.user_id
            ),
            Self::FieldVersion { change, .. } => format!(
                "field {} of contract {} by user {}",
                change.field_name, change.contract_id, change.user_id
            ),
        }
    }
}

// ── Logger ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoggerStats {
    /// Accepted into the queue.
    pub enqueued: u64,
    /// Persisted to the audit store.
    pub written: u64,
    /// Dequeued but the store write failed.
    pub failed: u64,
    /// Rejected at submission (queue full or logger stopped).
    pub dropped: u64,
    /// Still queued when the worker shut down.
    pub discarded: u64,
}

impl LoggerStats {
    pub fn pending(&self) -> u64 {
        self.enqueued
            .saturating_sub(self.written + self.failed + self.discarded)
    }
}

struct Worker {
    running: Arc<AtomicBool>,
    done: Receiver<()>,
    thread: JoinHandle<()>,
}

struct Queue {
    sender: Option<SyncSender<AuditRequest>>,
    // Held until `start` hands it to the worker.
    pending: Option<Mutex<Receiver<AuditRequest>>>,
}

pub struct ActivityLogger {
    store: AuditStore,
    clock: SharedClock,
    config: AuditConfig,
    queue: RwLock<Queue>,
    worker: Mutex<Option<Worker>>,
    counters: Arc<Counters>,
}

impl ActivityLogger {
    /// Requests submitted before [`start`](Self::start) are buffered (up to
    /// the queue capacity) and written once the worker runs.
    pub fn new(store: AuditStore, clock: SharedClock, config: AuditConfig) -> Self {
        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity.max(1));
        Self {
            store,
            clock,
            config,
            queue: RwLock::new(Queue {
                sender: Some(sender),
                pending: Some(Mutex::new(receiver)),
            }),
            worker: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn store(&self) -> &AuditStore {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawn the writer thread. Calling it while already running is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Ok(());
        }

        let receiver = {
            let mut queue = self.queue.write().unwrap_or_else(PoisonError::into_inner);
            match (queue.sender.is_some(), queue.pending.take()) {
                (true, Some(receiver)) => receiver.into_inner().unwrap_or_else(PoisonError::into_inner),
                _ => {
                    let (sender, receiver) = mpsc::sync_channel(self.config.queue_capacity.max(1));
                    queue.sender = Some(sender);
                    receiver
                }
            }
        };

        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = mpsc::channel();
        let store = self.store.clone();
        let counters = Arc::clone(&self.counters);
        let poll = self.config.poll_interval;
        let flag = Arc::clone(&running);

        let thread = thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || {
                writer_loop(&store, &receiver, &flag, &counters, poll);
                let _ = done_tx.send(());
            })?;

        info!(
            capacity = self.config.queue_capacity,
            "Activity logger started"
        );
        *worker = Some(Worker {
            running,
            done: done_rx,
            thread,
        });
        Ok(())
    }

    /// Signal the worker and wait (bounded) for it to exit. Requests still
    /// queued are discarded. Returns `false` if the worker did not stop in
    /// time and was detached.
    pub fn stop(&self) -> bool {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.queue
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .sender = None;

        let Some(worker) = worker else {
            return true;
        };
        worker.running.store(false, Ordering::Release);

        match worker.done.recv_timeout(self.config.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.thread.join();
                info!("Activity logger stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = self.config.stop_timeout.as_millis() as u64,
                    "Activity logger did not stop in time; detaching writer thread"
                );
                false
            }
        }
    }

    /// Log the outcome of a primary operation on behalf of `actor`. Failed
    /// operations are logged with `success = false`; anonymous callers are
    /// not logged at all.
    pub fn record<T, E: fmt::Display>(
        &self,
        actor: Option<&Actor>,
        result: &Result<T, E>,
        build: impl FnOnce(&Actor) -> ActivityEvent,
    ) {
        let Some(actor) = actor else {
            return;
        };
        let event = build(actor);
        let event = match result {
            Ok(_) => event,
            Err(e) => event.failed(e.to_string()),
        };
        self.log_activity(event);
    }

    pub fn log_activity(&self, event: ActivityEvent) {
        let at = self.clock.now();
        self.submit(AuditRequest::Activity { event, at });
    }

    /// Record a field edit. Unchanged values are not logged.
    pub fn log_field_change(
        &self,
        contract_id: i64,
        user_id: UserId,
        field_name: &str,
        old_value: Option<&str>,
        new_value: Option<&str>,
    ) {
        if old_value == new_value {
            return;
        }
        let at = self.clock.now();
        self.submit(AuditRequest::FieldVersion {
            change: FieldVersionChange {
                contract_id,
                user_id,
                field_name: field_name.to_string(),
                old_value: old_value.map(str::to_string),
                new_value: new_value.map(str::to_string),
            },
            at,
        });
    }

    pub fn stats(&self) -> LoggerStats {
        LoggerStats {
            enqueued: self.counters.enqueued.load(Ordering::Acquire),
            written: self.counters.written.load(Ordering::Acquire),
            failed: self.counters.failed.load(Ordering::Acquire),
            dropped: self.counters.dropped.load(Ordering::Acquire),
            discarded: self.counters.discarded.load(Ordering::Acquire),
        }
    }

    /// Block until everything accepted so far has been dequeued, or the
    /// timeout elapses. Returns whether the queue drained.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stats().pending() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn submit(&self, request: AuditRequest) {
        let queue = self.queue.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = queue.sender.as_ref() else {
            self.counters.dropped.fetch_add(1, Ordering::AcqRel);
            debug!(request = %request.describe(), "Activity logger stopped; dropping audit request");
            return;
        };

        self.counters.enqueued.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                self.counters.enqueued.fetch_sub(1, Ordering::AcqRel);
                self.counters.dropped.fetch_add(1, Ordering::AcqRel);
                warn!(
                    target: AUDIT_FAILURE_TARGET,
                    request = %request.describe(),
                    "Audit queue full; dropping newest request"
                );
            }
            Err(TrySendError::Disconnected(request)) => {
                self.counters.enqueued.fetch_sub(1, Ordering::AcqRel);
                self.counters.dropped.fetch_add(1, Ordering::AcqRel);
                warn!(
                    target: AUDIT_FAILURE_TARGET,
                    request = %request.describe(),
                    "Audit writer gone; dropping request"
                );
            }
        }
    }
}

impl Drop for ActivityLogger {
    fn drop(&mut self) {
        self.stop();
    }
}

fn writer_loop(
    store: &AuditStore,
    receiver: &Receiver<AuditRequest>,
    running: &AtomicBool,
    counters: &Counters,
    poll: Duration,
) {
    while running.load(Ordering::Acquire) {
        match receiver.recv_timeout(poll) {
            Ok(request) => match store.write_blocking(&request) {
                Ok(()) => {
                    counters.written.fetch_add(1, Ordering::AcqRel);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::AcqRel);
                    error!(
                        target: AUDIT_FAILURE_TARGET,
                        request = %request.describe(),
                        "Failed to persist audit record: {e}"
                    );
                }
            },
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let leftover = receiver.try_iter().count() as u64;
    if leftover > 0 {
        counters.discarded.fetch_add(leftover, Ordering::AcqRel);
        warn!(
            target: AUDIT_FAILURE_TARGET,
            leftover, "Audit writer exiting with unprocessed requests"
        );
    }
}
