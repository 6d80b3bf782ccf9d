//! Client for chained calls to other executors.
//!
//! A bot is a named chat service reachable through the upstream base URL;
//! it may itself be another instance of this server. The client posts one
//! chat turn and decodes the framed event stream back into chunks.

use std::io;
use std::time::Duration;

use async_stream::try_stream;
use futures::TryStreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::chunk::Chunk;
use crate::executor::ChunkStream;
use crate::history::{ChatMessage, Role};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum BotError {
    #[error("bot not found: {0}")]
    NotFound(String),
    #[error("upstream call failed: {0}")]
    Upstream(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("invalid upstream url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// One framed event of the chunked response protocol.
#[derive(Debug, Deserialize)]
struct WireEvent {
    finish_reason: Option<String>,
    #[serde(default)]
    delta: Vec<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct BotClient {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
    lang: Option<String>,
}

impl BotClient {
    pub fn new(base_url: &str) -> Result<Self, BotError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(BotError::Network)?;
        Ok(BotClient {
            client,
            base_url: Url::parse(base_url)?,
            auth_token: None,
            lang: None,
        })
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn with_lang(mut self, lang: Option<String>) -> Self {
        self.lang = lang;
        self
    }

    /// Stream one chat turn against the named bot.
    ///
    /// A 404 surfaces as [`BotError::NotFound`] before any chunk is
    /// produced. Cancelling the token stops the stream at the next frame
    /// boundary and drops the connection.
    pub async fn chat_complete(
        &self,
        bot: &str,
        history: &[ChatMessage],
        cancel: CancellationToken,
    ) -> Result<ChunkStream, BotError> {
        let records: Vec<serde_json::Value> = history
            .iter()
            .map(|m| {
                json!({
                    "actor": if m.role == Role::Assistant { "bot" } else { "user" },
                    "text": m.content,
                })
            })
            .collect();
        let form = [
            ("input", serde_json::to_string(&records).unwrap_or_default()),
            ("modelfile", "[]".to_string()),
            ("model", bot.to_string()),
        ];

        let url = self.base_url.join("chat")?;
        let mut request = self.client.post(url).form(&form);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(lang) = &self.lang {
            request = request.header("Accept-Language", lang);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Err(BotError::NotFound(bot.to_string())),
            status if !status.is_success() => {
                return Err(BotError::Upstream(format!(
                    "bot {:?} answered {}",
                    bot, status
                )))
            }
            _ => {}
        }

        let bot = bot.to_string();
        let byte_stream = response.bytes_stream().map_err(io::Error::other);
        Ok(Box::pin(try_stream! {
            let reader = StreamReader::new(byte_stream);
            let mut lines = FramedRead::new(reader, LinesCodec::new());
            while let Some(line) = lines.next().await {
                if cancel.is_cancelled() {
                    break;
                }
                let line = line.map_err(|e| anyhow::anyhow!("stream decode error: {}", e))?;
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let event: WireEvent = serde_json::from_str(data)
                    .map_err(|e| anyhow::anyhow!("malformed frame from bot {:?}: {}", bot, e))?;
                for value in &event.delta {
                    if let Some(chunk) = Chunk::from_wire(value) {
                        yield chunk;
                    } else {
                        tracing::debug!("dropping unrecognized chunk from bot {:?}", bot);
                    }
                }
                match event.finish_reason.as_deref() {
                    Some("stop") => break,
                    Some("exception") => {
                        Err(anyhow::anyhow!("bot {:?} reported an exception", bot))?;
                    }
                    _ => {}
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::EXIT_OK;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn frame(finish_reason: Option<&str>, delta: Vec<serde_json::Value>) -> String {
        let event = json!({
            "finish_reason": finish_reason,
            "delta": delta,
            "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
        });
        format!("data: {}\n\n", event)
    }

    #[tokio::test]
    async fn test_chat_complete_decodes_frames() {
        let server = MockServer::start().await;
        let body = [
            frame(None, vec![Chunk::text("he").to_wire()]),
            frame(None, vec![Chunk::text("llo").to_wire()]),
            frame(Some("stop"), vec![Chunk::exit_code(EXIT_OK).to_wire()]),
        ]
        .concat();
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = BotClient::new(&server.uri()).unwrap();
        let mut stream = client
            .chat_complete("botA", &[ChatMessage::user("hi")], CancellationToken::new())
            .await
            .unwrap();
        let mut chunks = Vec::new();
        while let Some(item) = stream.next().await {
            chunks.push(item.unwrap());
        }
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].as_text(), Some("he"));
        assert_eq!(chunks[1].as_text(), Some("llo"));
        assert_eq!(chunks[2].as_exit_code(), Some(EXIT_OK));
    }

    #[tokio::test]
    async fn test_chat_complete_maps_404_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = BotClient::new(&server.uri()).unwrap();
        let result = client
            .chat_complete("ghost", &[ChatMessage::user("hi")], CancellationToken::new())
            .await;
        assert!(matches!(result, Err(BotError::NotFound(name)) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_chat_complete_surfaces_exception_frames() {
        let server = MockServer::start().await;
        let body = frame(Some("exception"), vec![]);
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = BotClient::new(&server.uri()).unwrap();
        let mut stream = client
            .chat_complete("botA", &[ChatMessage::user("hi")], CancellationToken::new())
            .await
            .unwrap();
        let item = stream.next().await.unwrap();
        assert!(item.is_err());
    }
}
