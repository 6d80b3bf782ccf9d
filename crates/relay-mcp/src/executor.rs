//! The tool-bridge backend: one tool-provider session per request.

use async_stream::try_stream;
use async_trait::async_trait;
use relay::chunk::{Chunk, LogLevel, EXIT_COMPLETE, EXIT_INCOMPLETE};
use relay::executor::{ChunkStream, Executor};
use relay::history::ChatHistory;
use relay::modelfile::Modelfile;

use crate::bridge::{ToolServer, ToolTransport, DEFAULT_RETRY_DELAY, DEFAULT_TOOL_RETRIES};
use crate::parse::parse_tool_call;

pub struct McpExecutor {
    transport: ToolTransport,
}

impl McpExecutor {
    pub fn new(transport: ToolTransport) -> Self {
        McpExecutor { transport }
    }

    /// Per-request parameters override the configured transport.
    fn request_transport(&self, modelfile: &Modelfile) -> ToolTransport {
        let mcp_params = modelfile.parameters.namespace("mcp_");
        if let Some(url) = mcp_params.get_str("url") {
            return ToolTransport::StreamableHttp {
                url: url.to_string(),
            };
        }
        if let Some(command) = mcp_params.get_str("cmd") {
            return ToolTransport::ChildProcess {
                command: command.to_string(),
                args: mcp_params.get_str("args").unwrap_or_default().to_string(),
            };
        }
        self.transport.clone()
    }
}

/// Run one turn against the tool server. Collected into a chunk list so the
/// caller can release the session before anything is streamed out.
async fn serve_tools(server: &ToolServer, history: &ChatHistory) -> anyhow::Result<Vec<Chunk>> {
    let user_query = history
        .last()
        .map(|record| record.content.trim())
        .unwrap_or_default();
    let tools = server.list_tools().await?;

    if user_query == "/list" {
        return Ok(tools
            .iter()
            .map(|tool| Chunk::text(format!("{}\n\n", tool.format_for_llm())))
            .collect());
    }

    let Some(call) = parse_tool_call(user_query) else {
        // Not a tool call at all: the text passes through untouched.
        return Ok(vec![Chunk::text(user_query)]);
    };
    tracing::debug!("parsed tool call: {:?}", call);

    if !tools.iter().any(|tool| tool.name == call.tool) {
        anyhow::bail!(
            "no tool named {:?} found in server, use \"/list\" to list available tools",
            call.tool
        );
    }

    tracing::info!("executing tool {:?} with {} arguments", call.tool, call.arguments.len());
    match server
        .execute_tool(&call.tool, call.arguments, DEFAULT_TOOL_RETRIES, DEFAULT_RETRY_DELAY)
        .await
    {
        Ok(result) => {
            let text = result
                .content
                .iter()
                .filter_map(|content| content.as_text().map(|t| t.text.clone()))
                .collect::<Vec<_>>()
                .join("\n");
            let failed = result.is_error.unwrap_or(false);
            let exit_code = if failed { EXIT_INCOMPLETE } else { EXIT_COMPLETE };
            Ok(vec![
                Chunk::text(format!("Tool execution result: {}", text)),
                Chunk::exit_code(exit_code),
            ])
        }
        Err(e) => {
            // Retry exhaustion is an error chunk, not a request failure; the
            // INCOMPLETE code lets a surrounding flow route back and retry.
            tracing::error!("error executing tool: {}", e);
            Ok(vec![
                Chunk::log(format!("Error executing tool: {}", e), LogLevel::Error),
                Chunk::exit_code(EXIT_INCOMPLETE),
            ])
        }
    }
}

#[async_trait]
impl Executor for McpExecutor {
    async fn llm_compute(&self, history: ChatHistory, modelfile: Modelfile) -> ChunkStream {
        let transport = self.request_transport(&modelfile);
        let server_name = modelfile
            .parameters
            .namespace("mcp_")
            .get_str("server_name")
            .unwrap_or("default_server")
            .to_string();

        Box::pin(try_stream! {
            let server = ToolServer::connect(&server_name, transport).await?;
            let outcome = serve_tools(&server, &history).await;
            server.cleanup().await;
            tracing::debug!("tool session {:?} finished", server_name);
            for chunk in outcome? {
                yield chunk;
            }
        })
    }
}
