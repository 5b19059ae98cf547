// orchestrator-service-rs/src/main.rs
// Entry point: wires the tool servers, the fallback store and the
// orchestrator, then serves newline-delimited JSON requests on stdin

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use dynamic_sql::{DynamicSqlServer, EXECUTE_GENERATED_SQL, TEXT2SQL};
use error_handling_rs::{init_logging, LoggingConfig};
use mcp_client::{EnhancedClient, HttpToolServer, ToolCallRequest};
use orchestrator_service::{FallbackHandler, Orchestrator, OrchestratorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    config_rs::load_dotenv();

    let logging = LoggingConfig {
        level: config_rs::get_env_string("LOG_LEVEL", "info"),
        service_name: "orchestrator-service".to_string(),
        json_format: config_rs::get_env_bool("LOG_JSON", false),
        log_dir: config_rs::get_env_optional("LOG_DIR"),
    };
    if let Err(e) = init_logging(Some(logging)) {
        eprintln!("Logging init failed: {}", e);
    }

    let config = OrchestratorConfig::from_env();
    config.validate().context("invalid orchestrator configuration")?;

    // Primary tool server over HTTP
    let primary = HttpToolServer::with_options(
        config.primary_server_id.clone(),
        config.primary_url.clone(),
        config.api_key.clone(),
        config.call_timeout,
    )
    .context("failed to build the primary tool server")?;
    info!(server_id = %config.primary_server_id, url = %config.primary_url, "Primary tool server configured");

    // Dynamic SQL server runs in-process against the same database
    let dynamic_db = config_rs::get_env_optional("MCP_DYNAMIC_DB_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| config.fallback_db_path.clone());
    let dynamic = DynamicSqlServer::sqlite(
        config.dynamic_server_id.clone(),
        &dynamic_db,
        config.dynamic_sql_config(),
    );
    let preview_sweeper = dynamic.previews().spawn_sweeper();
    info!(db = %dynamic_db.display(), "Dynamic SQL server configured");

    let client = Arc::new(
        EnhancedClient::builder()
            .config(config.client_config())
            .server(Arc::new(primary))
            .server(Arc::new(dynamic))
            .route(TEXT2SQL, config.dynamic_server_id.clone())
            .route(EXECUTE_GENERATED_SQL, config.dynamic_server_id.clone())
            .build(),
    );

    let fallback = FallbackHandler::sqlite(&config.fallback_db_path).with_timeout(config.fallback_timeout);
    info!(db = %config.fallback_db_path.display(), operations = ?fallback.operations(), "Fallback handler configured");

    let orchestrator = Arc::new(Orchestrator::new(config, client, fallback)?);
    let mode = orchestrator.initialize().await;
    orchestrator.start();
    info!(mode = %mode, "Orchestrator service ready, reading requests from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = handle_line(&orchestrator, line).await;
        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.flush().await?;
    }

    preview_sweeper.abort();
    orchestrator.shutdown().await;
    Ok(())
}

async fn handle_line(orchestrator: &Orchestrator, line: &str) -> Value {
    if line.eq_ignore_ascii_case("status") {
        return serde_json::to_value(orchestrator.status().await)
            .unwrap_or_else(|e| json!({"error": format!("status unavailable: {}", e)}));
    }

    let request: ToolCallRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected malformed request line");
            return json!({
                "success": false,
                "error": {"kind": "invalid_argument", "message": format!("malformed request: {}", e)},
            });
        }
    };

    debug!(tool = request.tool_name(), "Executing request");
    let result = orchestrator.execute(&request).await;
    serde_json::to_value(&result)
        .unwrap_or_else(|e| json!({"success": false, "error": {"kind": "unknown", "message": e.to_string()}}))
}
