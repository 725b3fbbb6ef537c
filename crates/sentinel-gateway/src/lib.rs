//! Client for the MCP remediation gateway.
//!
//! The gateway fronts the actual remediation tools behind its own capability
//! boundary; this client only discovers what is offered and invokes it. A
//! session is established once (`initialize`, which must hand back an
//! `Mcp-Session-Id` header), the tool catalog is cached from `tools/list`,
//! and every `tools/call` echoes the session header. Responses come back
//! SSE-framed; the interesting tool result is a JSON document nested in
//! `result.content[0].text`.
//!
//! `execute_fix` never returns an error: policy refusals, unknown tools, and
//! transport failures all become structured [`FixExecutionResult`] failures
//! so the pipeline can account for them uniformly.

mod sse;

use sentinel_config::GatewaySettings;
use sentinel_types::{FixAction, FixExecutionResult};
use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";
const CLIENT_NAME: &str = "sre-sentinel";

/// Cadence and budget for container health polling after fixes.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_HEALTH_WAIT: Duration = Duration::from_secs(30);

/// Tool used for post-fix container probing, when the gateway advertises it.
const HEALTH_CHECK_TOOL: &str = "health_check";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("gateway returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("no session ID received from MCP Gateway")]
    MissingSessionId,
    #[error("no tools data found in response")]
    NoTools,
}

/// One advertised remediation tool.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDescriptor {
    fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            name: value.get("name")?.as_str()?.to_string(),
            description: value
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            input_schema: value.get("inputSchema").cloned().unwrap_or(Value::Null),
        })
    }

    /// Properties object from the input schema, when present.
    fn properties(&self) -> Option<&Map<String, Value>> {
        self.input_schema.get("properties")?.as_object()
    }
}

struct Session {
    id: String,
    tools: Vec<ToolDescriptor>,
}

/// Session-oriented gateway client. Safe to share behind an `Arc`; tool
/// calls open independent HTTP requests carrying the shared session id.
pub struct McpGateway {
    http: reqwest::Client,
    mcp_url: String,
    auto_heal_enabled: bool,
    session: RwLock<Option<Session>>,
}

impl McpGateway {
    pub fn new(settings: &GatewaySettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            mcp_url: format!("{}/mcp", settings.gateway_url.trim_end_matches('/')),
            auto_heal_enabled: settings.auto_heal_enabled,
            session: RwLock::new(None),
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Establish a session and discover the tool catalog. Must succeed
    /// before any fix can run; a gateway that hands out no session id is
    /// unusable and this surfaces that at startup rather than mid-incident.
    pub async fn initialize(&self) -> Result<(), GatewayError> {
        debug!(url = %self.mcp_url, "initializing MCP Gateway session");

        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION")},
            },
        });

        let response = self.http.post(&self.mcp_url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let session_id = response
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
            .ok_or(GatewayError::MissingSessionId)?;

        let tools = self.discover_tools(&session_id).await?;
        info!(session = %session_id, tools = tools.len(), "connected to MCP Gateway");

        *self.session.write().await = Some(Session {
            id: session_id,
            tools,
        });
        Ok(())
    }

    async fn discover_tools(&self, session_id: &str) -> Result<Vec<ToolDescriptor>, GatewayError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/list",
            "params": {},
        });

        let body = self.post_with_session(session_id, &payload).await?;
        for envelope in sse::data_payloads(&body) {
            if let Some(raw_tools) = envelope
                .get("result")
                .and_then(|result| result.get("tools"))
                .and_then(Value::as_array)
            {
                let tools: Vec<ToolDescriptor> =
                    raw_tools.iter().filter_map(ToolDescriptor::from_value).collect();
                return Ok(tools);
            }
        }
        Err(GatewayError::NoTools)
    }

    async fn post_with_session(
        &self,
        session_id: &str,
        payload: &Value,
    ) -> Result<String, GatewayError> {
        let response = self
            .http
            .post(&self.mcp_url)
            .header("Mcp-Session-Id", session_id)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    /// Gateway is healthy when a session exists and it advertised at least
    /// one tool. Attempts initialization if none has happened yet.
    pub async fn verify_gateway_health(&self) -> bool {
        if !self.is_initialized().await {
            if let Err(err) = self.initialize().await {
                warn!(error = %err, "MCP Gateway health check failed to initialize");
                return false;
            }
        }
        let session = self.session.read().await;
        match session.as_ref() {
            Some(session) if !session.tools.is_empty() => true,
            Some(_) => {
                warn!("MCP Gateway advertised no tools");
                false
            }
            None => false,
        }
    }

    /// Execute one suggested fix. Always returns a structured result; the
    /// tool name sent to the gateway is exactly `fix.action`.
    pub async fn execute_fix(&self, fix: &FixAction) -> FixExecutionResult {
        info!(action = %fix.action, target = %fix.target, priority = fix.priority, "executing fix");

        if !self.auto_heal_enabled {
            debug!("auto-heal disabled, skipping execution");
            return FixExecutionResult {
                success: false,
                message: Some("Auto-heal disabled".to_string()),
                ..FixExecutionResult::default()
            };
        }

        if !self.is_initialized().await {
            if let Err(err) = self.initialize().await {
                return FixExecutionResult::failure(format!("MCP Gateway not connected: {err}"));
            }
        }

        let tool = {
            let session = self.session.read().await;
            session
                .as_ref()
                .and_then(|session| session.tools.iter().find(|tool| tool.name == fix.action))
                .cloned()
        };
        let Some(tool) = tool else {
            return FixExecutionResult::failure(format!(
                "Tool {} not found in MCP Gateway",
                fix.action
            ));
        };

        let args = build_arguments(&tool, fix);
        self.call_tool(&fix.action, args).await
    }

    /// Invoke a tool by name. Transport problems and malformed responses are
    /// structured failures, never panics or errors.
    pub async fn call_tool(&self, name: &str, args: Map<String, Value>) -> FixExecutionResult {
        let session_id = {
            let session = self.session.read().await;
            match session.as_ref() {
                Some(session) => session.id.clone(),
                None => return FixExecutionResult::failure("MCP Gateway not connected"),
            }
        };

        let payload = json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {"name": name, "arguments": args},
        });

        let body = match self.post_with_session(&session_id, &payload).await {
            Ok(body) => body,
            Err(GatewayError::Status { status, body }) => {
                return FixExecutionResult {
                    success: false,
                    message: Some(format!("HTTP {status}")),
                    error: Some(body),
                    ..FixExecutionResult::default()
                };
            }
            Err(err) => return FixExecutionResult::failure(err.to_string()),
        };

        parse_tool_result(&body)
    }

    /// Poll the gateway's `health_check` tool until the container reports
    /// healthy or the budget runs out.
    pub async fn verify_container_health(&self, container_name: &str, max_wait: Duration) -> bool {
        debug!(container = container_name, "verifying container health");
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let mut args = Map::new();
            args.insert(
                "container_name".to_string(),
                Value::String(container_name.to_string()),
            );
            let result = self.call_tool(HEALTH_CHECK_TOOL, args).await;

            if health_probe_satisfied(&result) {
                info!(container = container_name, "container is healthy");
                return true;
            }

            if tokio::time::Instant::now() + HEALTH_CHECK_INTERVAL > deadline {
                warn!(
                    container = container_name,
                    waited_secs = max_wait.as_secs(),
                    "container did not become healthy in time"
                );
                return false;
            }
            tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
        }
    }

    /// Render the discovered catalog for the analyzer prompt:
    /// `- name: description` plus parameter hints.
    pub async fn tool_catalog(&self) -> String {
        let session = self.session.read().await;
        let Some(session) = session.as_ref() else {
            return String::new();
        };

        let mut blocks = Vec::with_capacity(session.tools.len());
        for tool in &session.tools {
            let mut block = format!("- {}: {}\n", tool.name, tool.description);
            if let Some(required) = tool
                .input_schema
                .get("required")
                .and_then(Value::as_array)
            {
                let required: Vec<&str> =
                    required.iter().filter_map(Value::as_str).collect();
                if !required.is_empty() {
                    block.push_str(&format!("  Required parameters: {}\n", required.join(", ")));
                }
            }
            if let Some(properties) = tool.properties() {
                for (param, info) in properties {
                    if let Some(desc) = info.get("description").and_then(Value::as_str) {
                        block.push_str(&format!("  - {param}: {desc}\n"));
                    }
                }
            }
            blocks.push(block);
        }
        blocks.join("\n")
    }
}

/// Arguments for a tool call: the fix's `details` when it parses as a JSON
/// object, otherwise whatever the tool's schema lets us supply.
fn build_arguments(tool: &ToolDescriptor, fix: &FixAction) -> Map<String, Value> {
    if let Ok(Value::Object(args)) = serde_json::from_str::<Value>(&fix.details) {
        return args;
    }

    let mut args = Map::new();
    if let Some(properties) = tool.properties() {
        if properties.contains_key("container_name") {
            args.insert(
                "container_name".to_string(),
                Value::String(fix.target.clone()),
            );
        }
        if properties.contains_key("details") {
            args.insert("details".to_string(), Value::String(fix.details.clone()));
        }
    }
    args
}

/// Unwrap `result.content[0].text` and parse it as the tool's own result
/// document.
fn parse_tool_result(body: &str) -> FixExecutionResult {
    let Some(envelope) = sse::first_payload(body) else {
        return FixExecutionResult {
            success: false,
            message: Some("Invalid response from MCP Gateway".to_string()),
            ..FixExecutionResult::default()
        };
    };

    let text = envelope
        .get("result")
        .and_then(|result| result.get("content"))
        .and_then(|content| content.get(0))
        .and_then(|first| first.get("text"))
        .and_then(Value::as_str);

    let Some(text) = text else {
        return FixExecutionResult {
            success: false,
            message: Some("Invalid response from MCP Gateway".to_string()),
            ..FixExecutionResult::default()
        };
    };

    let Ok(tool_result) = serde_json::from_str::<Value>(text) else {
        return FixExecutionResult {
            success: false,
            message: Some("Tool returned a non-JSON result".to_string()),
            error: Some(text.to_string()),
            ..FixExecutionResult::default()
        };
    };

    let success = tool_result
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let message = tool_result
        .get("message")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let status = tool_result
        .get("status")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    if success {
        FixExecutionResult {
            success: true,
            message,
            error: None,
            status,
            details: Some(tool_result.to_string()),
        }
    } else {
        let error = tool_result
            .get("error")
            .and_then(Value::as_str)
            .map_or_else(|| "Unknown error".to_string(), ToString::to_string);
        FixExecutionResult {
            success: false,
            message,
            error: Some(error),
            status,
            details: Some(tool_result.to_string()),
        }
    }
}

/// An explicit success satisfies the probe; so does a result document whose
/// `status` or `health` reads healthy/running.
fn health_probe_satisfied(result: &FixExecutionResult) -> bool {
    if result.success {
        return true;
    }
    let Some(details) = &result.details else {
        return false;
    };
    let Ok(parsed) = serde_json::from_str::<Value>(details) else {
        return false;
    };
    ["status", "health"].iter().any(|field| {
        parsed
            .get(field)
            .and_then(Value::as_str)
            .is_some_and(|value| {
                let lowered = value.to_lowercase();
                lowered == "healthy" || lowered == "running"
            })
    })
}
