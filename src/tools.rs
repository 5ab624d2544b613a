//! MCP tool definitions and call handlers.

use crate::activity::{Actor, ResourceType};
use crate::app::App;
use crate::contract::*;
use crate::documents::{DocumentType, FileBlob, UploadRequest};
use crate::error::Error;
use crate::protocol::*;
use crate::signature::SendRequest;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::warn;

/// Return all tool definitions for tools/list.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        // ── Clients ─────────────────────────────────────────────
        tool(
            "client_create",
            "Register a client that contracts can be attached to.",
            json!({
                "required": ["name", "user_id"],
                "properties": {
                    "name": { "type": "string" },
                    "organization": { "type": "string" },
                    "email": { "type": "string" },
                    "phone": { "type": "string" },
                    "address": { "type": "string" }
                }
            }),
            Hints::WRITE,
        ),
        tool(
            "client_get",
            "Fetch one client by id.",
            json!({
                "required": ["client_id"],
                "properties": { "client_id": { "type": "integer" } }
            }),
            Hints::READ,
        ),
        tool(
            "client_list",
            "List clients with the number of live contracts each has.",
            json!({ "properties": {} }),
            Hints::READ,
        ),
        // ── Contracts ───────────────────────────────────────────
        tool(
            "contract_create",
            "Create a contract for an existing client. New contracts start as draft \
             unless 'status' says otherwise.",
            json!({
                "required": ["title", "client_id", "contract_type", "user_id"],
                "properties": {
                    "title": { "type": "string" },
                    "client_id": { "type": "integer" },
                    "contract_type": { "type": "string" },
                    "description": { "type": "string" },
                    "status": { "type": "string", "enum": status_names() },
                    "contract_value": { "type": ["string", "number"], "description": "Decimal amount" },
                    "effective_date": { "type": "string", "description": "YYYY-MM-DD" },
                    "expiration_date": { "type": "string", "description": "YYYY-MM-DD" },
                    "renewal_date": { "type": "string", "description": "YYYY-MM-DD" }
                }
            }),
            Hints::WRITE,
        ),
        tool(
            "contract_get",
            "Fetch one contract. Soft-deleted contracts are hidden unless include_deleted is set.",
            json!({
                "required": ["contract_id"],
                "properties": {
                    "contract_id": { "type": "integer" },
                    "include_deleted": { "type": "boolean" }
                }
            }),
            Hints::READ,
        ),
        tool(
            "contract_list",
            "List contracts, newest first.",
            json!({
                "properties": {
                    "include_deleted": { "type": "boolean" },
                    "page": { "type": "integer", "minimum": 1 },
                    "per_page": { "type": "integer", "minimum": 1 }
                }
            }),
            Hints::READ,
        ),
        tool(
            "contract_search",
            "Search live contracts by text (title, description, document text) and filters. \
             Title matches rank first.",
            json!({
                "properties": {
                    "term": { "type": "string" },
                    "status": { "type": "string", "enum": status_names() },
                    "client_id": { "type": "integer" },
                    "contract_type": { "type": "string" },
                    "expiring_within_days": { "type": "integer" },
                    "limit": { "type": "integer" }
                }
            }),
            Hints::READ,
        ),
        tool(
            "contract_expiring",
            "Active contracts whose expiration date falls within the next N days.",
            json!({
                "properties": { "days": { "type": "integer", "description": "Default 30" } }
            }),
            Hints::READ,
        ),
        tool(
            "contract_statistics",
            "Contract totals per status, expiring soon, and soft-deleted.",
            json!({ "properties": {} }),
            Hints::READ,
        ),
        tool(
            "contract_update",
            "Edit contract fields. Pass null to clear an optional field. \
             Every changed field is recorded in the version history.",
            json!({
                "required": ["contract_id", "user_id"],
                "properties": {
                    "contract_id": { "type": "integer" },
                    "title": { "type": "string" },
                    "description": { "type": ["string", "null"] },
                    "client_id": { "type": "integer" },
                    "contract_type": { "type": "string" },
                    "contract_value": { "type": ["string", "number", "null"] },
                    "effective_date": { "type": ["string", "null"] },
                    "expiration_date": { "type": ["string", "null"] },
                    "renewal_date": { "type": ["string", "null"] }
                }
            }),
            Hints::WRITE_IDEMPOTENT,
        ),
        tool(
            "contract_update_status",
            "Move a contract to another lifecycle status. Use contract_delete to delete.",
            json!({
                "required": ["contract_id", "status", "user_id"],
                "properties": {
                    "contract_id": { "type": "integer" },
                    "status": { "type": "string", "enum": status_names() },
                    "reason": { "type": "string" }
                }
            }),
            Hints::WRITE,
        ),
        tool(
            "contract_delete",
            "Soft-delete a contract. It can be restored until the retention sweep purges it.",
            json!({
                "required": ["contract_id", "user_id"],
                "properties": { "contract_id": { "type": "integer" } }
            }),
            Hints::DESTRUCTIVE,
        ),
        tool(
            "contract_restore",
            "Restore a soft-deleted contract.",
            json!({
                "required": ["contract_id", "user_id"],
                "properties": { "contract_id": { "type": "integer" } }
            }),
            Hints::WRITE,
        ),
        tool(
            "contract_status_history",
            "Status changes of a contract, newest first.",
            json!({
                "required": ["contract_id"],
                "properties": {
                    "contract_id": { "type": "integer" },
                    "limit": { "type": "integer" }
                }
            }),
            Hints::READ,
        ),
        // ── Documents ───────────────────────────────────────────
        tool(
            "document_upload",
            "Attach a document to a contract. Provide the file either as 'content' (text) \
             or as 'source_path' (a local file to copy in).",
            json!({
                "required": ["contract_id", "file_name", "user_id"],
                "properties": {
                    "contract_id": { "type": "integer" },
                    "file_name": { "type": "string" },
                    "content": { "type": "string" },
                    "source_path": { "type": "string" },
                    "content_type": { "type": "string" },
                    "document_type": {
                        "type": "string",
                        "enum": ["contract", "amendment", "attachment", "addendum", "schedule", "exhibit", "other"]
                    },
                    "description": { "type": "string" },
                    "is_primary": { "type": "boolean" }
                }
            }),
            Hints::WRITE,
        ),
        tool(
            "document_list",
            "Documents of a contract, primary first.",
            json!({
                "required": ["contract_id"],
                "properties": { "contract_id": { "type": "integer" } }
            }),
            Hints::READ,
        ),
        tool(
            "document_get",
            "Fetch a document record for download.",
            json!({
                "required": ["document_id"],
                "properties": { "document_id": { "type": "integer" } }
            }),
            Hints::READ,
        ),
        tool(
            "document_delete",
            "Delete a document and its stored file. If it was primary, the newest remaining \
             document becomes primary.",
            json!({
                "required": ["document_id", "user_id"],
                "properties": {
                    "document_id": { "type": "integer" },
                    "contract_id": { "type": "integer", "description": "Expected owner" }
                }
            }),
            Hints::DESTRUCTIVE,
        ),
        tool(
            "document_set_primary",
            "Make a document the primary document of its contract.",
            json!({
                "required": ["document_id", "contract_id", "user_id"],
                "properties": {
                    "document_id": { "type": "integer" },
                    "contract_id": { "type": "integer" }
                }
            }),
            Hints::WRITE_IDEMPOTENT,
        ),
        tool(
            "document_migrate_legacy",
            "Convert legacy single-document fields into document records. Without \
             contract_id, every contract still carrying legacy fields is migrated.",
            json!({
                "properties": { "contract_id": { "type": "integer" } }
            }),
            Hints::WRITE_IDEMPOTENT,
        ),
        // ── Signatures ──────────────────────────────────────────
        tool(
            "signature_send",
            "Send a contract document for e-signature. A draft contract moves to under_review. \
             Without document_id the primary (or newest) document is sent.",
            json!({
                "required": ["contract_id", "recipient_email", "user_id"],
                "properties": {
                    "contract_id": { "type": "integer" },
                    "recipient_email": { "type": "string" },
                    "recipient_name": { "type": "string" },
                    "document_id": { "type": "integer" }
                }
            }),
            Hints::WRITE,
        ),
        tool(
            "signature_bulk_send",
            "Send several contracts for signature, one recipient email each.",
            json!({
                "required": ["contract_ids", "recipient_emails", "user_id"],
                "properties": {
                    "contract_ids": { "type": "array", "items": { "type": "integer" } },
                    "recipient_emails": { "type": "array", "items": { "type": "string" } }
                }
            }),
            Hints::WRITE,
        ),
        tool(
            "signature_check_status",
            "Ask the signature provider for the envelope's status. Completion moves an \
             under_review contract to active.",
            json!({
                "properties": {
                    "envelope_id": { "type": "string" },
                    "contract_id": { "type": "integer", "description": "Used when envelope_id is omitted" }
                }
            }),
            Hints::WRITE_IDEMPOTENT,
        ),
        tool(
            "signature_void",
            "Void an envelope. Completed envelopes cannot be voided.",
            json!({
                "required": ["envelope_id", "user_id"],
                "properties": { "envelope_id": { "type": "string" } }
            }),
            Hints::DESTRUCTIVE,
        ),
        tool(
            "signature_envelope",
            "Current signature envelope of a contract.",
            json!({
                "required": ["contract_id"],
                "properties": { "contract_id": { "type": "integer" } }
            }),
            Hints::READ,
        ),
        // ── Audit ───────────────────────────────────────────────
        tool(
            "audit_recent_activity",
            "Most recent activity of one user.",
            json!({
                "required": ["target_user_id"],
                "properties": {
                    "target_user_id": { "type": "integer" },
                    "limit": { "type": "integer" }
                }
            }),
            Hints::READ,
        ),
        tool(
            "audit_contract_history",
            "Field-level edit history of a contract.",
            json!({
                "required": ["contract_id"],
                "properties": {
                    "contract_id": { "type": "integer" },
                    "limit": { "type": "integer" }
                }
            }),
            Hints::READ,
        ),
        tool(
            "audit_most_viewed",
            "Most viewed resources over the last N days.",
            json!({
                "properties": {
                    "resource_type": { "type": "string", "enum": ["contract", "client", "user", "document", "docusign"] },
                    "limit": { "type": "integer" },
                    "days": { "type": "integer" }
                }
            }),
            Hints::READ,
        ),
        tool(
            "audit_stats",
            "Row counts of the audit tables and the activity logger's queue counters.",
            json!({ "properties": {} }),
            Hints::READ,
        ),
        // ── Notifications ───────────────────────────────────────
        tool(
            "notifications_expiring",
            "Expiration notices for active contracts expiring within N days (default 30).",
            json!({
                "properties": { "days": { "type": "integer" } }
            }),
            Hints::READ,
        ),
        tool(
            "notifications_status_changes",
            "Status changes across all contracts in the last N hours (default 24).",
            json!({
                "properties": { "since_hours": { "type": "integer" } }
            }),
            Hints::READ,
        ),
        tool(
            "report_daily_summary",
            "Today's totals: contracts, new contracts, status changes, contracts expiring soon, total value.",
            json!({ "properties": {} }),
            Hints::READ,
        ),
        tool(
            "report_weekly",
            "This week's new contracts, contracts expiring, and status changes.",
            json!({ "properties": {} }),
            Hints::READ,
        ),
        // ── Retention ───────────────────────────────────────────
        tool(
            "retention_statistics",
            "Deleted contracts ready for purge or still recoverable, and old audit rows.",
            json!({ "properties": {} }),
            Hints::READ,
        ),
        tool(
            "retention_run",
            "Run the retention sweep now.",
            json!({ "properties": {} }),
            Hints::DESTRUCTIVE,
        ),
    ]
}

struct Hints {
    read_only: bool,
    destructive: bool,
    idempotent: bool,
}

impl Hints {
    const READ: Hints = Hints { read_only: true, destructive: false, idempotent: true };
    const WRITE: Hints = Hints { read_only: false, destructive: false, idempotent: false };
    const WRITE_IDEMPOTENT: Hints = Hints { read_only: false, destructive: false, idempotent: true };
    const DESTRUCTIVE: Hints = Hints { read_only: false, destructive: true, idempotent: false };
}

// Every tool also accepts the caller identity used for the audit trail.
fn tool(name: &str, description: &str, mut schema: Value, hints: Hints) -> ToolDefinition {
    if let Some(obj) = schema.as_object_mut() {
        obj.insert("type".into(), json!("object"));
        let props = obj
            .entry("properties")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(props) = props.as_object_mut() {
            props.insert(
                "user_id".into(),
                json!({ "type": "integer", "description": "Acting user; omit for anonymous reads" }),
            );
            props.insert("ip_address".into(), json!({ "type": "string" }));
            props.insert("user_agent".into(), json!({ "type": "string" }));
        }
    }
    ToolDefinition {
        name: name.into(),
        description: description.into(),
        input_schema: schema,
        annotations: Some(ToolAnnotations {
            read_only_hint: Some(hints.read_only),
            destructive_hint: Some(hints.destructive),
            idempotent_hint: Some(hints.idempotent),
        }),
    }
}

fn status_names() -> Vec<&'static str> {
    ContractStatus::ALL.iter().map(|s| s.as_str()).collect()
}

/// Handle a tool call and return a ToolResult.
pub async fn handle_tool_call(name: &str, args: &Value, app: &App) -> ToolResult {
    let outcome = match name {
        "client_create" => handle_client_create(args, app).await,
        "client_get" => handle_client_get(args, app).await,
        "client_list" => reply(app.contracts.list_clients().await),
        "contract_create" => handle_contract_create(args, app).await,
        "contract_get" => handle_contract_get(args, app).await,
        "contract_list" => handle_contract_list(args, app).await,
        "contract_search" => handle_contract_search(args, app).await,
        "contract_expiring" => handle_contract_expiring(args, app).await,
        "contract_statistics" => reply(app.contracts.statistics().await),
        "contract_update" => handle_contract_update(args, app).await,
        "contract_update_status" => handle_contract_update_status(args, app).await,
        "contract_delete" => handle_contract_delete(args, app).await,
        "contract_restore" => handle_contract_restore(args, app).await,
        "contract_status_history" => handle_status_history(args, app).await,
        "document_upload" => handle_document_upload(args, app).await,
        "document_list" => handle_document_list(args, app).await,
        "document_get" => handle_document_get(args, app).await,
        "document_delete" => handle_document_delete(args, app).await,
        "document_set_primary" => handle_document_set_primary(args, app).await,
        "document_migrate_legacy" => handle_migrate_legacy(args, app).await,
        "signature_send" => handle_signature_send(args, app).await,
        "signature_bulk_send" => handle_bulk_send(args, app).await,
        "signature_check_status" => handle_signature_check(args, app).await,
        "signature_void" => handle_signature_void(args, app).await,
        "signature_envelope" => handle_signature_envelope(args, app).await,
        "audit_recent_activity" => handle_recent_activity(args, app).await,
        "audit_contract_history" => handle_contract_history(args, app).await,
        "audit_most_viewed" => handle_most_viewed(args, app).await,
        "audit_stats" => handle_audit_stats(app).await,
        "notifications_expiring" => {
            reply(app.notifications.expiring_contracts(opt_i64(args, "days").unwrap_or(30)).await)
        }
        "notifications_status_changes" => {
            reply(app.notifications.status_changes(opt_i64(args, "since_hours").unwrap_or(24)).await)
        }
        "report_daily_summary" => reply(app.notifications.daily_summary().await),
        "report_weekly" => reply(app.notifications.weekly_report().await),
        "retention_statistics" => reply(app.sweeper.cleanup_statistics().await),
        "retention_run" => Ok(json_result(&app.sweeper.run_once().await)),
        _ => Err(ToolResult::error(format!("Unknown tool: {name}"))),
    };
    outcome.unwrap_or_else(|err| err)
}

type Handled = Result<ToolResult, ToolResult>;

// ── Tool Handlers ───────────────────────────────────────────────────

async fn handle_client_create(args: &Value, app: &App) -> Handled {
    let actor = require_actor(args)?;
    let client = NewClient {
        name: required_str(args, "name")?.to_string(),
        organization: opt_string(args, "organization"),
        email: opt_string(args, "email"),
        phone: opt_string(args, "phone"),
        address: opt_string(args, "address"),
    };
    reply(app.contracts.create_client(client, &actor).await)
}

async fn handle_client_get(args: &Value, app: &App) -> Handled {
    let id = required_i64(args, "client_id")?;
    reply(app.contracts.get_client(id, actor(args).as_ref()).await)
}

async fn handle_contract_create(args: &Value, app: &App) -> Handled {
    let actor = require_actor(args)?;
    let mut new = NewContract::new(
        required_str(args, "title")?,
        required_i64(args, "client_id")?,
        required_str(args, "contract_type")?,
    );
    new.description = opt_string(args, "description");
    if let Some(status) = opt_str(args, "status") {
        new.status = ContractStatus::parse(status).map_err(|e| error_result(&e))?;
    }
    new.contract_value = decimal_arg(args, "contract_value")?.flatten();
    new.effective_date = date_arg(args, "effective_date")?.flatten();
    new.expiration_date = date_arg(args, "expiration_date")?.flatten();
    new.renewal_date = date_arg(args, "renewal_date")?.flatten();
    reply(app.contracts.create(new, &actor).await)
}

async fn handle_contract_get(args: &Value, app: &App) -> Handled {
    let id = required_i64(args, "contract_id")?;
    let include_deleted = opt_bool(args, "include_deleted").unwrap_or(false);
    let contract = app
        .contracts
        .get(id, include_deleted, actor(args).as_ref())
        .await
        .map_err(|e| error_result(&e))?;
    let documents = app.documents.list(id).await.map_err(|e| error_result(&e))?;
    let envelope = app.signatures.envelope(id).await.map_err(|e| error_result(&e))?;
    Ok(ToolResult::json(&json!({
        "days_until_expiration": contract.days_until_expiration(app.today()),
        "contract": contract,
        "documents": documents,
        "envelope": envelope,
    })))
}

async fn handle_contract_list(args: &Value, app: &App) -> Handled {
    let include_deleted = opt_bool(args, "include_deleted").unwrap_or(false);
    let page = opt_i64(args, "page").unwrap_or(1).max(1) as usize;
    let per_page = opt_i64(args, "per_page").unwrap_or(20).max(1) as usize;
    let contracts = app
        .contracts
        .list(include_deleted, page, per_page)
        .await
        .map_err(|e| error_result(&e))?;
    if contracts.is_empty() {
        return Ok(ToolResult::text(
            "No contracts found. Use contract_create to add one.",
        ));
    }
    Ok(ToolResult::json(&json!({
        "contracts": contracts,
        "page": page,
        "per_page": per_page,
    })))
}

async fn handle_contract_search(args: &Value, app: &App) -> Handled {
    let status = match opt_str(args, "status") {
        Some(s) => Some(ContractStatus::parse(s).map_err(|e| error_result(&e))?),
        None => None,
    };
    let query = ContractQuery {
        term: opt_string(args, "term"),
        status,
        client_id: opt_i64(args, "client_id"),
        contract_type: opt_string(args, "contract_type"),
        expiring_within_days: opt_i64(args, "expiring_within_days"),
        limit: opt_i64(args, "limit").map(|l| l.max(1) as usize),
    };
    let results = app.contracts.search(&query).await.map_err(|e| error_result(&e))?;
    Ok(ToolResult::json(&json!({
        "results": results,
        "total": results.len(),
    })))
}

async fn handle_contract_expiring(args: &Value, app: &App) -> Handled {
    let days = opt_i64(args, "days").unwrap_or(30);
    reply(app.contracts.expiring(days).await)
}

async fn handle_contract_update(args: &Value, app: &App) -> Handled {
    let actor = require_actor(args)?;
    let id = required_i64(args, "contract_id")?;
    let update = ContractUpdate {
        title: opt_string(args, "title"),
        description: nullable_string(args, "description"),
        client_id: opt_i64(args, "client_id"),
        contract_type: opt_string(args, "contract_type"),
        contract_value: decimal_arg(args, "contract_value")?,
        effective_date: date_arg(args, "effective_date")?,
        expiration_date: date_arg(args, "expiration_date")?,
        renewal_date: date_arg(args, "renewal_date")?,
    };
    reply(app.contracts.update(id, update, &actor).await)
}

async fn handle_contract_update_status(args: &Value, app: &App) -> Handled {
    let actor = require_actor(args)?;
    let id = required_i64(args, "contract_id")?;
    let status = required_str(args, "status")?;
    reply(
        app.contracts
            .update_status(id, status, opt_str(args, "reason"), &actor)
            .await,
    )
}

async fn handle_contract_delete(args: &Value, app: &App) -> Handled {
    let actor = require_actor(args)?;
    let id = required_i64(args, "contract_id")?;
    app.contracts
        .soft_delete(id, &actor)
        .await
        .map_err(|e| error_result(&e))?;
    Ok(ToolResult::text(format!(
        "Contract {id} deleted. It can be restored until the retention sweep purges it."
    )))
}

async fn handle_contract_restore(args: &Value, app: &App) -> Handled {
    let actor = require_actor(args)?;
    let id = required_i64(args, "contract_id")?;
    reply(app.contracts.restore(id, &actor).await)
}

async fn handle_status_history(args: &Value, app: &App) -> Handled {
    let id = required_i64(args, "contract_id")?;
    let limit = opt_i64(args, "limit").unwrap_or(50).max(1) as usize;
    reply(app.contracts.status_history(id, limit, actor(args).as_ref()).await)
}

async fn handle_document_upload(args: &Value, app: &App) -> Handled {
    let actor = require_actor(args)?;
    let contract_id = required_i64(args, "contract_id")?;
    let file_name = required_str(args, "file_name")?;
    let bytes = match (opt_str(args, "content"), opt_str(args, "source_path")) {
        (Some(text), _) => text.as_bytes().to_vec(),
        (None, Some(path)) => std::fs::read(path)
            .map_err(|e| ToolResult::error(format!("Cannot read '{path}': {e}")))?,
        (None, None) => {
            return Err(ToolResult::error("Either 'content' or 'source_path' is required"))
        }
    };
    let document_type = match opt_str(args, "document_type") {
        Some(t) => DocumentType::parse(t)
            .ok_or_else(|| ToolResult::error(format!("Unknown document_type: {t}")))?,
        None => DocumentType::default(),
    };
    let request = UploadRequest {
        blob: FileBlob {
            original_filename: file_name.to_string(),
            content_type: opt_string(args, "content_type"),
            bytes,
        },
        document_type,
        description: opt_string(args, "description"),
        is_primary: opt_bool(args, "is_primary").unwrap_or(false),
    };
    let doc = app
        .documents
        .upload(contract_id, request, &actor)
        .await
        .map_err(|e| error_result(&e))?;
    Ok(ToolResult::json(&json!({
        "document": doc,
        "size": doc.size_human(),
    })))
}

async fn handle_document_list(args: &Value, app: &App) -> Handled {
    let contract_id = required_i64(args, "contract_id")?;
    reply(app.documents.list(contract_id).await)
}

async fn handle_document_get(args: &Value, app: &App) -> Handled {
    let id = required_i64(args, "document_id")?;
    reply(app.documents.download(id, actor(args).as_ref()).await)
}

async fn handle_document_delete(args: &Value, app: &App) -> Handled {
    let actor = require_actor(args)?;
    let id = required_i64(args, "document_id")?;
    reply(
        app.documents
            .delete(id, opt_i64(args, "contract_id"), &actor)
            .await,
    )
}

async fn handle_document_set_primary(args: &Value, app: &App) -> Handled {
    let actor = require_actor(args)?;
    let id = required_i64(args, "document_id")?;
    let contract_id = required_i64(args, "contract_id")?;
    reply(app.documents.set_primary(id, contract_id, &actor).await)
}

async fn handle_migrate_legacy(args: &Value, app: &App) -> Handled {
    let actor = actor(args);
    match opt_i64(args, "contract_id") {
        Some(id) => {
            let migrated = app
                .documents
                .migrate_legacy(id, actor.as_ref())
                .await
                .map_err(|e| error_result(&e))?;
            match migrated {
                Some(doc) => Ok(json_result(&doc)),
                None => Ok(ToolResult::text(format!(
                    "Contract {id} has no legacy document to migrate."
                ))),
            }
        }
        None => reply(app.documents.migrate_all_legacy(actor.as_ref()).await),
    }
}

async fn handle_signature_send(args: &Value, app: &App) -> Handled {
    let actor = require_actor(args)?;
    let contract_id = required_i64(args, "contract_id")?;
    let request = SendRequest {
        recipient_email: required_str(args, "recipient_email")?.to_string(),
        recipient_name: opt_string(args, "recipient_name"),
        document_id: opt_i64(args, "document_id"),
    };
    let envelope = app
        .signatures
        .send(contract_id, request, &actor)
        .await
        .map_err(|e| error_result(&e))?;
    Ok(ToolResult::json(&json!({
        "envelope": envelope,
        "message": format!(
            "Contract successfully sent to {} for signature",
            envelope.recipient_email
        ),
    })))
}

async fn handle_bulk_send(args: &Value, app: &App) -> Handled {
    let actor = require_actor(args)?;
    let ids: Vec<i64> = array_arg(args, "contract_ids")?
        .iter()
        .filter_map(Value::as_i64)
        .collect();
    let emails: Vec<String> = array_arg(args, "recipient_emails")?
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    let targets: Vec<(i64, String)> = ids.into_iter().zip(emails).collect();
    let outcomes = app.signatures.send_many(&targets, &actor).await;
    let sent = outcomes.iter().filter(|o| o.error.is_none()).count();
    Ok(ToolResult::json(&json!({
        "total_sent": sent,
        "total_attempted": targets.len(),
        "results": outcomes,
    })))
}

async fn handle_signature_check(args: &Value, app: &App) -> Handled {
    let envelope_id = match (opt_str(args, "envelope_id"), opt_i64(args, "contract_id")) {
        (Some(id), _) => id.to_string(),
        (None, Some(contract_id)) => app
            .signatures
            .envelope(contract_id)
            .await
            .map_err(|e| error_result(&e))?
            .map(|env| env.envelope_id)
            .ok_or_else(|| {
                ToolResult::error(format!("No signature envelope found for contract {contract_id}"))
            })?,
        (None, None) => return Err(ToolResult::error("'envelope_id' or 'contract_id' is required")),
    };
    reply(
        app.signatures
            .check_status(&envelope_id, actor(args).as_ref())
            .await,
    )
}

async fn handle_signature_void(args: &Value, app: &App) -> Handled {
    let actor = require_actor(args)?;
    let envelope_id = required_str(args, "envelope_id")?;
    reply(app.signatures.void(envelope_id, &actor).await)
}

async fn handle_signature_envelope(args: &Value, app: &App) -> Handled {
    let contract_id = required_i64(args, "contract_id")?;
    match app
        .signatures
        .envelope(contract_id)
        .await
        .map_err(|e| error_result(&e))?
    {
        Some(env) => Ok(ToolResult::json(&json!({
            "envelope": env,
            "message": env.status.message(),
        }))),
        None => Ok(ToolResult::text(format!(
            "Contract {contract_id} has not been sent for signature."
        ))),
    }
}

async fn handle_recent_activity(args: &Value, app: &App) -> Handled {
    let user_id = required_i64(args, "target_user_id")?;
    let limit = opt_i64(args, "limit").unwrap_or(10).max(1) as usize;
    let entries = app
        .recent_activity(user_id, limit)
        .await
        .map_err(|e| ToolResult::error(format!("Audit database error: {e}")))?;
    let summaries: Vec<String> = entries.iter().map(|e| e.summary()).collect();
    Ok(ToolResult::json(&json!({
        "activity": entries,
        "summaries": summaries,
    })))
}

async fn handle_contract_history(args: &Value, app: &App) -> Handled {
    let contract_id = required_i64(args, "contract_id")?;
    let limit = opt_i64(args, "limit").unwrap_or(50).max(1) as usize;
    let history = app
        .contract_history(contract_id, limit)
        .await
        .map_err(|e| ToolResult::error(format!("Audit database error: {e}")))?;
    if history.is_empty() {
        return Ok(ToolResult::text(format!(
            "No field changes recorded for contract {contract_id}."
        )));
    }
    Ok(json_result(&history))
}

async fn handle_most_viewed(args: &Value, app: &App) -> Handled {
    let resource_type = match opt_str(args, "resource_type") {
        Some(t) => ResourceType::parse(t)
            .ok_or_else(|| ToolResult::error(format!("Unknown resource_type: {t}")))?,
        None => ResourceType::Contract,
    };
    let limit = opt_i64(args, "limit").unwrap_or(10).max(1) as usize;
    let days = opt_i64(args, "days").unwrap_or(30);
    let views = app
        .most_viewed(resource_type, limit, days)
        .await
        .map_err(|e| ToolResult::error(format!("Audit database error: {e}")))?;
    Ok(ToolResult::json(&json!({
        "resource_type": resource_type,
        "days": days,
        "most_viewed": views,
    })))
}

async fn handle_audit_stats(app: &App) -> Handled {
    let counts = app
        .audit_counts()
        .await
        .map_err(|e| ToolResult::error(format!("Audit database error: {e}")))?;
    Ok(ToolResult::json(&json!({
        "tables": counts,
        "logger": app.logger.stats(),
        "logger_running": app.logger.is_running(),
    })))
}

// ── Argument Helpers ────────────────────────────────────────────────

/// The caller's identity, if the call carries a `user_id`.
fn actor(args: &Value) -> Option<Actor> {
    let user_id = args.get("user_id").and_then(|v| v.as_i64())?;
    let mut actor = Actor::user(user_id);
    if let Some(ip) = opt_str(args, "ip_address") {
        actor = actor.with_ip(ip);
    }
    if let Some(agent) = opt_str(args, "user_agent") {
        actor = actor.with_user_agent(agent);
    }
    Some(actor)
}

fn require_actor(args: &Value) -> Result<Actor, ToolResult> {
    actor(args).ok_or_else(|| ToolResult::error("'user_id' is required for this operation"))
}

fn opt_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

fn opt_string(args: &Value, key: &str) -> Option<String> {
    opt_str(args, key).map(str::to_string)
}

fn opt_i64(args: &Value, key: &str) -> Option<i64> {
    args.get(key).and_then(|v| v.as_i64())
}

fn opt_bool(args: &Value, key: &str) -> Option<bool> {
    args.get(key).and_then(|v| v.as_bool())
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolResult> {
    opt_str(args, key).ok_or_else(|| ToolResult::error(format!("'{key}' is required")))
}

fn required_i64(args: &Value, key: &str) -> Result<i64, ToolResult> {
    opt_i64(args, key).ok_or_else(|| ToolResult::error(format!("'{key}' is required (integer)")))
}

fn array_arg<'a>(args: &'a Value, key: &str) -> Result<&'a Vec<Value>, ToolResult> {
    args.get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| ToolResult::error(format!("'{key}' must be an array")))
}

// Absent: leave alone. Null: clear. String: set.
fn nullable_string(args: &Value, key: &str) -> Option<Option<String>> {
    match args.get(key)? {
        Value::Null => Some(None),
        v => Some(v.as_str().map(str::to_string)),
    }
}

fn date_arg(args: &Value, key: &str) -> Result<Option<Option<NaiveDate>>, ToolResult> {
    match args.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(v) => {
            let raw = v.as_str().unwrap_or_default();
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(|d| Some(Some(d)))
                .map_err(|_| ToolResult::error(format!("'{key}' must be a date (YYYY-MM-DD)")))
        }
    }
}

fn decimal_arg(args: &Value, key: &str) -> Result<Option<Option<Decimal>>, ToolResult> {
    let raw = match args.get(key) {
        None => return Ok(None),
        Some(Value::Null) => return Ok(Some(None)),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(v) => v.to_string(),
    };
    raw.parse::<Decimal>()
        .map(|d| Some(Some(d)))
        .map_err(|_| ToolResult::error(format!("'{key}' must be a decimal amount")))
}

// ── Results ─────────────────────────────────────────────────────────

fn reply<T: Serialize>(result: crate::error::Result<T>) -> Handled {
    result.map(|v| json_result(&v)).map_err(|e| error_result(&e))
}

fn json_result<T: Serialize>(value: &T) -> ToolResult {
    match serde_json::to_value(value) {
        Ok(v) => ToolResult::json(&v),
        Err(e) => ToolResult::error(format!("Serialization error: {e}")),
    }
}

/// Errors carry their kind so callers can tell retriable provider failures
/// from everything else.
fn error_result(err: &Error) -> ToolResult {
    if err.kind() == crate::error::ErrorKind::Storage {
        warn!("Storage error in tool call: {err}");
    }
    let body = json!({
        "error": err.to_string(),
        "kind": err.kind(),
        "retriable": err.is_retriable(),
    });
    ToolResult::error(serde_json::to_string_pretty(&body).unwrap_or_else(|_| err.to_string()))
}
