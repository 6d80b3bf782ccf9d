//! The agent backend: turns a request into a flow run over chained bots.

use std::sync::Arc;

use async_trait::async_trait;

use crate::chunk::Chunk;
use crate::client::BotClient;
use crate::executor::{ChunkStream, Executor};
use crate::flow::{AgentFlow, FlowOptions, DEFAULT_MAX_STEPS};
use crate::history::ChatHistory;
use crate::lang::{notice, Notice};
use crate::modelfile::Modelfile;

pub struct AgentExecutor {
    flow: Arc<AgentFlow>,
    api_base_url: String,
    api_key: Option<String>,
}

impl AgentExecutor {
    pub fn new(api_base_url: String, api_key: Option<String>) -> Self {
        AgentExecutor {
            flow: Arc::new(AgentFlow::new()),
            api_base_url,
            api_key,
        }
    }
}

fn single_chunk(chunk: Chunk) -> ChunkStream {
    Box::pin(futures::stream::once(async move { Ok(chunk) }))
}

#[async_trait]
impl Executor for AgentExecutor {
    async fn llm_compute(&self, mut history: ChatHistory, modelfile: Modelfile) -> ChunkStream {
        let params = &modelfile.parameters;
        let lang = params.get_str("_lang").map(str::to_string);

        if modelfile.has_no_bots() {
            return single_chunk(Chunk::text(notice(lang.as_deref(), Notice::NoInputBot)));
        }

        // The first entry of the upstream list wins; the configured base URL
        // is the fallback for direct (kernel-less) invocations.
        let base_url = params
            .get_str("_upstream_base_urls")
            .and_then(|urls| urls.split(';').next())
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(&self.api_base_url)
            .to_string();
        let auth_token = params
            .get_str("_user_token")
            .map(str::to_string)
            .or_else(|| self.api_key.clone());

        let agent_params = params.namespace("agent_");
        let options = FlowOptions {
            show_step_log: agent_params.get_bool("show_step_log", false),
            max_steps: agent_params
                .get_i64("max_steps", DEFAULT_MAX_STEPS as i64)
                .clamp(0, u32::MAX as i64) as u32,
            lang: lang.clone(),
        };

        let client = match BotClient::new(&base_url) {
            Ok(client) => client.with_auth_token(auth_token).with_lang(lang),
            Err(e) => {
                tracing::error!("invalid upstream base url {:?}: {}", base_url, e);
                return Box::pin(futures::stream::once(async move {
                    Err(anyhow::anyhow!("invalid upstream base url: {}", e))
                }));
            }
        };

        if let Some(last) = history.last_mut() {
            last.content = format!(
                "{}{}{}",
                modelfile.before_prompt, last.content, modelfile.after_prompt
            );
        }

        let instructions = modelfile.instructions();
        self.flow
            .clone()
            .run_flow(Arc::new(client), history, instructions, options)
    }

    async fn abort(&self) -> Option<String> {
        Some(self.flow.abort().await)
    }
}
