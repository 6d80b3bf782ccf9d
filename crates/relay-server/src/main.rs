use std::sync::Arc;

use clap::Parser;
use relay::agent::AgentExecutor;
use relay::Executor;
use relay_mcp::{McpExecutor, ToolTransport};
use relay_server::configuration::{BackendCommand, Cli};
use relay_server::{commands, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::setup_logging(&cli.settings.log);

    let executor: Arc<dyn Executor> = match &cli.backend {
        BackendCommand::Agent {
            api_base_url,
            api_key,
        } => Arc::new(AgentExecutor::new(api_base_url.clone(), api_key.clone())),
        BackendCommand::Mcp {
            server_cmd,
            server_args,
            server_url,
        } => {
            let transport = match server_url {
                Some(url) => ToolTransport::StreamableHttp { url: url.clone() },
                None => ToolTransport::ChildProcess {
                    command: server_cmd.clone(),
                    args: server_args.clone(),
                },
            };
            Arc::new(McpExecutor::new(transport))
        }
    };

    commands::run(cli.settings, executor).await
}
