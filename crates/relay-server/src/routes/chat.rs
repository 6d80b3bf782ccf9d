//! The chat-turn route: decode, dispatch to the backend, and re-frame the
//! chunk stream as protocol events.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::Stream;
use relay::chunk::{Chunk, LogLevel, EXIT_FAILURE, EXIT_OK};
use relay::history::{from_wire_records, rectify, ChatHistory, WireRecord};
use relay::lang::{notice, Notice};
use relay::modelfile::{Modelfile, ParamValue};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::state::{AdmissionPermit, AppState};

pub fn routes(state: Arc<AppState>, executor_path: &str) -> Router {
    let abort_path = format!("{}/abort", executor_path.trim_end_matches('/'));
    Router::new()
        .route(executor_path, post(chat))
        .route(&abort_path, get(abort))
        .with_state(state)
}

pub struct SseResponse {
    rx: ReceiverStream<String>,
}

impl SseResponse {
    fn new(rx: ReceiverStream<String>) -> Self {
        Self { rx }
    }
}

impl Stream for SseResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx)
            .poll_next(cx)
            .map(|opt| opt.map(|s| Ok(Bytes::from(s))))
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> axum::response::Response {
        let body = axum::body::Body::from_stream(self);
        http::Response::builder()
            .header("Content-Type", "text/event-stream; charset=utf-8")
            .header("Cache-Control", "no-cache")
            .body(body)
            .unwrap()
    }
}

fn format_event(finish_reason: Option<&str>, delta: &[Chunk], usage: Option<u64>) -> String {
    let mut event = json!({
        "finish_reason": finish_reason,
        "delta": delta.iter().map(Chunk::to_wire).collect::<Vec<_>>(),
    });
    if let Some(completion) = usage {
        event["usage"] = json!({
            "prompt_tokens": 0,
            "completion_tokens": completion,
            "total_tokens": completion,
        });
    }
    format!("data: {}\n\n", event)
}

/// Decode the wire payload into a rectified history plus a modelfile, folding
/// request metadata and unrecognized fields into the parameter map.
fn decode_request(
    fields: &HashMap<String, String>,
    headers: &HeaderMap,
) -> anyhow::Result<(ChatHistory, Modelfile)> {
    let records: Vec<WireRecord> =
        serde_json::from_str(fields.get("input").map(String::as_str).unwrap_or("[]"))?;
    let history = rectify(from_wire_records(records));

    let mut modelfile =
        Modelfile::from_json(fields.get("modelfile").map(String::as_str).unwrap_or("[]"));

    if let Some(lang) = headers.get("accept-language").and_then(|v| v.to_str().ok()) {
        modelfile
            .parameters
            .insert("_lang", ParamValue::Str(lang.to_string()));
    }
    if let Some(urls) = headers
        .get("x-upstream-base-urls")
        .and_then(|v| v.to_str().ok())
    {
        modelfile
            .parameters
            .insert("_upstream_base_urls", ParamValue::Str(urls.to_string()));
    }
    for (key, value) in fields {
        if key == "input" || key == "modelfile" {
            continue;
        }
        modelfile
            .parameters
            .insert(format!("_{}", key), ParamValue::Str(value.clone()));
    }

    Ok((history, modelfile))
}

async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(fields): Form<HashMap<String, String>>,
) -> axum::response::Response {
    if fields.is_empty() {
        tracing::debug!("received empty request");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"msg": "Received empty request!"})),
        )
            .into_response();
    }
    let Some(permit) = state.admission.try_acquire() else {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"msg": "Processing another request."})),
        )
            .into_response();
    };

    let (tx, rx) = mpsc::channel(100);
    tokio::spawn(serve_request(state, headers, fields, tx, permit));
    SseResponse::new(ReceiverStream::new(rx)).into_response()
}

/// Drive the backend and frame its chunks. The admission permit is released
/// on drop no matter how this task ends.
async fn serve_request(
    state: Arc<AppState>,
    headers: HeaderMap,
    fields: HashMap<String, String>,
    tx: mpsc::Sender<String>,
    permit: AdmissionPermit,
) {
    let _permit = permit;
    state.metrics.set_busy(true);
    let start = Instant::now();
    let lang = headers
        .get("accept-language")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut total_cost: u64 = 0;
    let mut final_exit = EXIT_OK;

    let outcome: anyhow::Result<()> = async {
        let (history, modelfile) = decode_request(&fields, &headers)?;
        tracing::debug!("history: {:?}", history);
        tracing::debug!("modelfile: {:?}", modelfile);

        let mut chunks = state.executor.llm_compute(history, modelfile).await;
        while let Some(item) = chunks.next().await {
            let chunk = item?;
            if let Some(code) = chunk.as_exit_code() {
                final_exit = code;
            }
            total_cost += chunk.cost() as u64;
            if tx
                .send(format_event(None, std::slice::from_ref(&chunk), None))
                .await
                .is_err()
            {
                tracing::info!("client disconnected, stopping generation");
                break;
            }
            // Yield so a concurrent abort request can run between events.
            tokio::task::yield_now().await;
        }
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => {
            state.metrics.observe(start.elapsed(), total_cost);
            let summary = [Chunk::exit_code(final_exit)];
            let _ = tx
                .send(format_event(Some("stop"), &summary, Some(total_cost)))
                .await;
        }
        Err(e) => {
            // The full failure always lands in the server log; the client
            // sees a generic message unless the server runs in debug mode.
            tracing::error!("error occurred during generation: {:#}", e);
            state.metrics.record_failure();
            let mut delta = vec![
                Chunk::log(notice(lang.as_deref(), Notice::GenericFailure), LogLevel::Error),
                Chunk::exit_code(EXIT_FAILURE),
            ];
            if state.debug {
                delta.push(Chunk::log(format!("\n{:?}", e), LogLevel::Error));
            }
            let _ = tx
                .send(format_event(Some("exception"), &delta, Some(total_cost)))
                .await;
        }
    }
    state.metrics.set_busy(false);
}

async fn abort(State(state): State<Arc<AppState>>) -> axum::response::Response {
    match state.executor.abort().await {
        Some(msg) => Json(json!({"msg": msg})).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"msg": "No abort method configured"})),
        )
            .into_response(),
    }
}
