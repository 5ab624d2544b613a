//! contract-records-mcp: contract record keeping over MCP.
//!
//! Serves the contract, document, signature and audit APIs as MCP tools on
//! stdio. The activity logger and the retention sweeper run in the
//! background for the lifetime of the process.
//!
//! ## Usage
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "contracts": {
//!       "command": "contract-records-mcp",
//!       "env": { "CONTRACTS_DATA_DIR": "/var/lib/contracts" }
//!     }
//!   }
//! }
//! ```

use contract_records_mcp::app::App;
use contract_records_mcp::config::Config;
use contract_records_mcp::protocol::*;
use contract_records_mcp::tools;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::filter::{Directive, LevelFilter};

#[tokio::main]
async fn main() {
    // Log to stderr (MCP requirement: stdout is for JSON-RPC only)
    let directive = "contract_records_mcp=info"
        .parse::<Directive>()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("{SERVER_NAME} v{SERVER_VERSION} starting...");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let app = match App::open(&config) {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to open stores: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = app.logger.start() {
        error!("Failed to start activity logger: {e}");
        std::process::exit(1);
    }
    let sweeper = Arc::clone(&app.sweeper).spawn();

    let outcome = run_stdio_loop(&app).await;

    sweeper.stop().await;
    if !app.logger.stop() {
        warn!("Activity logger did not stop in time; unwritten entries are lost");
    }
    let stats = app.logger.stats();
    info!(
        written = stats.written,
        dropped = stats.dropped,
        discarded = stats.discarded,
        "Activity logger stopped"
    );

    if let Err(e) = outcome {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

/// Main stdio loop: read JSON-RPC messages from stdin, write responses to stdout.
async fn run_stdio_loop(app: &App) -> Result<(), Box<dyn std::error::Error>> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let reader = BufReader::new(stdin);
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        debug!("← {line}");

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                let err_response =
                    JsonRpcResponse::error(None, -32700, format!("Parse error: {e}"));
                write_response(&mut stdout, &err_response).await?;
                continue;
            }
        };

        if !request.has_valid_version() {
            let err_response = JsonRpcResponse::invalid_request(
                request.id.clone(),
                &format!("unsupported jsonrpc version '{}'", request.jsonrpc),
            );
            write_response(&mut stdout, &err_response).await?;
            continue;
        }

        let response = handle_request(&request, app).await;

        // Notifications (no id) don't get a response
        if request.id.is_none() {
            debug!("Notification '{}' handled (no response)", request.method);
            continue;
        }

        if let Some(response) = response {
            write_response(&mut stdout, &response).await?;
        }
    }

    info!("stdin closed, shutting down.");
    Ok(())
}

async fn handle_request(request: &JsonRpcRequest, app: &App) -> Option<JsonRpcResponse> {
    let id = request.id.clone();

    match request.method.as_str() {
        // ── Lifecycle ───────────────────────────────────────────
        "initialize" => {
            info!("Client connected, initializing...");
            Some(success(id, &InitializeResult::for_server()))
        }

        "notifications/initialized" => {
            info!("Client initialized successfully.");
            None
        }

        // ── Tools ───────────────────────────────────────────────
        "tools/list" => Some(success(
            id,
            &ToolsListResult {
                tools: tools::tool_definitions(),
            },
        )),

        "tools/call" => {
            let params: ToolCallParams = match request
                .params
                .as_ref()
                .and_then(|p| serde_json::from_value(p.clone()).ok())
            {
                Some(p) => p,
                None => {
                    return Some(JsonRpcResponse::error(
                        id,
                        -32602,
                        "Invalid params: expected {name, arguments}",
                    ))
                }
            };

            let args = params
                .arguments
                .unwrap_or(Value::Object(Default::default()));
            info!("Tool call: {}", params.name);

            let result = tools::handle_tool_call(&params.name, &args, app).await;
            Some(success(id, &result))
        }

        // ── Ping ────────────────────────────────────────────────
        "ping" => Some(JsonRpcResponse::success(id, json!({}))),

        // ── Unknown ─────────────────────────────────────────────
        other => {
            debug!("Unknown method: {other}");
            Some(JsonRpcResponse::method_not_found(id, other))
        }
    }
}

fn success(id: Option<Value>, result: &impl serde::Serialize) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(id, -32603, format!("Internal error: {e}")),
    }
}

async fn write_response(
    stdout: &mut io::Stdout,
    response: &JsonRpcResponse,
) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string(response)?;
    debug!("→ {json}");
    stdout.write_all(json.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
