//! Streaming transport for chat completions.
//!
//! A spawned task reads the SSE byte stream, splits it into lines, and
//! forwards decoded events over an unbounded channel. One channel serves
//! one turn; the engine drops the receiver (or cancels the token) to tear
//! the stream down.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;

use crate::api::{ChatRequest, ChatResponse};
use crate::core::constants::DEFAULT_ERROR_MESSAGE;
use crate::utils::url::construct_api_url;

#[derive(Clone, Debug)]
pub enum StreamEvent {
    Chunk(String),
    ToolCall(ToolCallDelta),
    Error(String),
    End,
}

/// One fragment of a streamed tool call; fragments for the same `index`
/// accumulate into a single call.
#[derive(Clone, Debug, Default)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct PendingToolCall {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

pub fn accumulate_tool_call_delta(
    pending: &mut BTreeMap<u32, PendingToolCall>,
    delta: ToolCallDelta,
) {
    let entry = pending.entry(delta.index).or_default();
    if delta.id.is_some() {
        entry.id = delta.id;
    }
    if delta.name.is_some() {
        entry.name = delta.name;
    }
    if let Some(arguments) = delta.arguments {
        entry.arguments.push_str(&arguments);
    }
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

fn handle_data_payload(payload: &str, tx: &mpsc::UnboundedSender<StreamEvent>) -> bool {
    if payload == "[DONE]" {
        let _ = tx.send(StreamEvent::End);
        return true;
    }

    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => {
            if let Some(choice) = response.choices.first() {
                if let Some(content) = &choice.delta.content {
                    if !content.is_empty() {
                        let _ = tx.send(StreamEvent::Chunk(content.clone()));
                    }
                }
                if let Some(tool_calls) = &choice.delta.tool_calls {
                    for call in tool_calls {
                        let _ = tx.send(StreamEvent::ToolCall(ToolCallDelta {
                            index: call.index.unwrap_or(0),
                            id: call.id.clone(),
                            name: call.function.as_ref().and_then(|f| f.name.clone()),
                            arguments: call
                                .function
                                .as_ref()
                                .and_then(|f| f.arguments.clone()),
                        }));
                    }
                }
            }
            false
        }
        Err(_) => {
            if payload.trim().is_empty() {
                return false;
            }

            let _ = tx.send(StreamEvent::Error(format_api_error(payload)));
            let _ = tx.send(StreamEvent::End);
            true
        }
    }
}

fn process_sse_line(line: &str, tx: &mpsc::UnboundedSender<StreamEvent>) -> bool {
    extract_data_payload(line)
        .map(|payload| handle_data_payload(payload, tx))
        .unwrap_or(false)
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

/// Pick the richest available detail: structured error body, else the raw
/// text, else the fixed default.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return DEFAULT_ERROR_MESSAGE.to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&json_value) {
            if !summary.is_empty() {
                return summary;
            }
        }
    }

    trimmed.to_string()
}

/// Turn-by-turn completion source. The production implementation streams
/// from OpenRouter; tests script the channel directly.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn begin(&self, request: ChatRequest) -> mpsc::UnboundedReceiver<StreamEvent>;
}

pub struct OpenRouterBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    cancel_token: tokio_util::sync::CancellationToken,
}

impl OpenRouterBackend {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            cancel_token: tokio_util::sync::CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> tokio_util::sync::CancellationToken {
        self.cancel_token.clone()
    }
}

#[async_trait]
impl CompletionBackend for OpenRouterBackend {
    async fn begin(&self, request: ChatRequest) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let chat_url = construct_api_url(&self.base_url, "chat/completions");
        let api_key = self.api_key.clone();
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = async {
                    let http_request = client
                        .post(chat_url)
                        .header("Content-Type", "application/json")
                        .header("Authorization", format!("Bearer {api_key}"));

                    match http_request.json(&request).send().await {
                        Ok(response) => {
                            if !response.status().is_success() {
                                let error_text = response
                                    .text()
                                    .await
                                    .unwrap_or_else(|_| "<no body>".to_string());
                                let _ = tx.send(StreamEvent::Error(format_api_error(&error_text)));
                                let _ = tx.send(StreamEvent::End);
                                return;
                            }

                            let mut stream = response.bytes_stream();
                            let mut buffer: Vec<u8> = Vec::new();

                            while let Some(chunk) = stream.next().await {
                                if cancel_token.is_cancelled() {
                                    return;
                                }

                                if let Ok(chunk_bytes) = chunk {
                                    buffer.extend_from_slice(&chunk_bytes);

                                    while let Some(newline_pos) = memchr(b'\n', &buffer) {
                                        let line_str = match std::str::from_utf8(&buffer[..newline_pos]) {
                                            Ok(s) => s.trim().to_string(),
                                            Err(_) => {
                                                buffer.drain(..=newline_pos);
                                                continue;
                                            }
                                        };

                                        let should_end = process_sse_line(&line_str, &tx);
                                        buffer.drain(..=newline_pos);
                                        if should_end {
                                            return;
                                        }
                                    }
                                }
                            }

                            let _ = tx.send(StreamEvent::End);
                        }
                        Err(e) => {
                            let _ = tx.send(StreamEvent::Error(format_api_error(&e.to_string())));
                            let _ = tx.send(StreamEvent::End);
                        }
                    }
                } => {}
                _ = cancel_token.cancelled() => {}
            }
        });

        rx
    }
}
