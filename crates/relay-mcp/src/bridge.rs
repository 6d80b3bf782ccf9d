//! Connection management for one external tool-provider session.

use std::time::Duration;

use rmcp::{
    model::{CallToolRequestParams, CallToolResult, Tool},
    service::RunningService,
    transport::{StreamableHttpClientTransport, TokioChildProcess},
    RoleClient, ServiceExt,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell};

pub const DEFAULT_TOOL_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool server {0:?} is not configured with a usable transport")]
    InvalidTransport(String),
    #[error("failed to connect to tool server {name:?}: {reason}")]
    Connect { name: String, reason: String },
    #[error("tool server {0:?} not initialized")]
    NotInitialized(String),
    #[error("tool call failed on {name:?}: {reason}")]
    Rpc { name: String, reason: String },
    #[error("max retries reached, failed to execute tool {0:?}")]
    MaxRetries(String),
}

/// How to reach the tool provider: a local child process speaking over a
/// pipe, or a remote streaming endpoint.
#[derive(Debug, Clone)]
pub enum ToolTransport {
    ChildProcess { command: String, args: String },
    StreamableHttp { url: String },
}

/// One entry of the tool catalog.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl From<Tool> for ToolInfo {
    fn from(tool: Tool) -> Self {
        ToolInfo {
            name: tool.name.to_string(),
            description: tool
                .description
                .as_deref()
                .unwrap_or_default()
                .to_string(),
            input_schema: tool.schema_as_json_value(),
        }
    }
}

impl ToolInfo {
    /// Render the tool description the way it is shown to a model.
    pub fn format_for_llm(&self) -> String {
        let mut args_desc = Vec::new();
        if let Some(properties) = self.input_schema.get("properties").and_then(Value::as_object) {
            let required: Vec<&str> = self
                .input_schema
                .get("required")
                .and_then(Value::as_array)
                .map(|r| r.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            for (param, info) in properties {
                let description = info
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("No description");
                let mut line = format!("- {}: {}", param, description);
                if required.contains(&param.as_str()) {
                    line.push_str(" (required)");
                }
                args_desc.push(line);
            }
        }
        format!(
            "Tool: {}\nDescription: {}\nArguments:\n{}",
            self.name,
            self.description,
            args_desc.join("\n")
        )
    }
}

/// One tool-provider session. The running service is lock-guarded so that
/// concurrent cleanup calls cannot double-release it, and the tool catalog
/// is fetched once and memoized.
pub struct ToolServer {
    name: String,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
    catalog: OnceCell<Vec<ToolInfo>>,
}

impl ToolServer {
    /// Establish the session. A connection failure cleans up whatever was
    /// spawned and re-raises.
    pub async fn connect(name: &str, transport: ToolTransport) -> Result<Self, ToolError> {
        let service = match transport {
            ToolTransport::ChildProcess { command, args } => {
                if command.is_empty() {
                    return Err(ToolError::InvalidTransport(name.to_string()));
                }
                let args = shell_words::split(&args).map_err(|e| ToolError::Connect {
                    name: name.to_string(),
                    reason: format!("bad argument string: {}", e),
                })?;
                let mut cmd = Command::new(&command);
                cmd.args(args);
                let transport = TokioChildProcess::new(cmd).map_err(|e| ToolError::Connect {
                    name: name.to_string(),
                    reason: format!("failed to spawn {:?}: {}", command, e),
                })?;
                ().serve(transport).await.map_err(|e| ToolError::Connect {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?
            }
            ToolTransport::StreamableHttp { url } => {
                let transport = StreamableHttpClientTransport::from_uri(url);
                ().serve(transport).await.map_err(|e| ToolError::Connect {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?
            }
        };
        tracing::info!("connected to tool server {:?}", name);
        Ok(ToolServer {
            name: name.to_string(),
            service: Mutex::new(Some(service)),
            catalog: OnceCell::new(),
        })
    }

    /// The memoized tool catalog.
    pub async fn list_tools(&self) -> Result<&[ToolInfo], ToolError> {
        let catalog = self
            .catalog
            .get_or_try_init(|| async {
                let guard = self.service.lock().await;
                let service = guard
                    .as_ref()
                    .ok_or_else(|| ToolError::NotInitialized(self.name.clone()))?;
                let tools = service.peer().list_all_tools().await.map_err(|e| {
                    ToolError::Rpc {
                        name: self.name.clone(),
                        reason: e.to_string(),
                    }
                })?;
                tracing::info!(tool_count = tools.len(), "listed tools from {:?}", self.name);
                Ok(tools.into_iter().map(ToolInfo::from).collect::<Vec<_>>())
            })
            .await?;
        Ok(catalog)
    }

    /// Execute a tool with bounded retry: up to `retries` attempts with a
    /// fixed delay in between, then a max-retries error.
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        arguments: Map<String, Value>,
        retries: u32,
        delay: Duration,
    ) -> Result<CallToolResult, ToolError> {
        let mut attempt = 0;
        loop {
            let params =
                CallToolRequestParams::new(tool_name.to_string()).with_arguments(arguments.clone());
            let result = {
                let guard = self.service.lock().await;
                let service = guard
                    .as_ref()
                    .ok_or_else(|| ToolError::NotInitialized(self.name.clone()))?;
                tracing::info!("executing {}...", tool_name);
                service.peer().call_tool(params).await
            };
            match result {
                Ok(result) => return Ok(result),
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(
                        "error executing tool: {}. Attempt {} of {}.",
                        e,
                        attempt,
                        retries
                    );
                    if attempt < retries {
                        tracing::info!("retrying in {:?}...", delay);
                        tokio::time::sleep(delay).await;
                    } else {
                        tracing::error!("max retries reached, failing");
                        return Err(ToolError::MaxRetries(tool_name.to_string()));
                    }
                }
            }
        }
    }

    /// Release the session. Safe to call any number of times, from
    /// concurrent tasks.
    pub async fn cleanup(&self) {
        let mut guard = self.service.lock().await;
        if let Some(service) = guard.take() {
            if let Err(e) = service.cancel().await {
                tracing::warn!("error during cleanup of tool server {:?}: {}", self.name, e);
            }
        }
    }
}
