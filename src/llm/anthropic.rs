//! Anthropic Claude provider implementation (streaming Messages API)

use super::types::{LlmMessage, LlmRequest, TokenStream};
use super::{LlmError, ModelClient};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Undelimited SSE data held before the stream is aborted
const MAX_FRAME_BUF: usize = 16 * 1024 * 1024; // 16 MiB

/// Anthropic service implementation
pub struct AnthropicService {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicService {
    pub fn new(api_key: String, model: String, gateway: Option<&str>) -> Result<Self, LlmError> {
        let base_url = match gateway {
            Some(gw) => format!("{}/_/gateway/anthropic/v1/messages", gw.trim_end_matches('/')),
            None => "https://api.anthropic.com/v1/messages".to_string(),
        };

        // No overall timeout: streams are long-lived, the coordinator bounds them
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LlmError::unknown(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url,
        })
    }

    fn translate_request(&self, request: &LlmRequest) -> AnthropicRequest {
        let system = request
            .system
            .iter()
            .map(|s| AnthropicSystemBlock {
                r#type: "text".to_string(),
                text: s.text.clone(),
                cache_control: if s.cache {
                    Some(CacheControl {
                        r#type: "ephemeral".to_string(),
                    })
                } else {
                    None
                },
            })
            .collect();

        AnthropicRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages: request.messages.iter().map(translate_message).collect(),
            stream: true,
        }
    }
}

fn translate_message(msg: &LlmMessage) -> AnthropicMessage {
    AnthropicMessage {
        role: msg.role.as_str().to_string(),
        content: vec![AnthropicContentBlock {
            r#type: "text".to_string(),
            text: msg.content.clone(),
        }],
    }
}

#[async_trait]
impl ModelClient for AnthropicService {
    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream, LlmError> {
        let anthropic_request = self.translate_request(request);

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&anthropic_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network(format!("Request timeout: {e}"))
                } else if e.is_connect() {
                    LlmError::network(format!("Connection failed: {e}"))
                } else {
                    LlmError::unknown(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), &body));
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| LlmError::network(format!("Stream interrupted: {e}"))));

        Ok(decode_event_stream(bytes))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Turn a raw SSE byte stream into text tokens
fn decode_event_stream<S, B>(bytes: S) -> TokenStream
where
    S: futures::Stream<Item = Result<B, LlmError>> + Send + Sync + 'static,
    B: AsRef<[u8]> + Send,
{
    struct DecodeState<S> {
        bytes: std::pin::Pin<Box<S>>,
        decoder: SseDecoder,
        ready: VecDeque<Result<String, LlmError>>,
        finished: bool,
    }

    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::default(),
        ready: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                if item.is_err() {
                    state.finished = true;
                    state.ready.clear();
                }
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let payloads = match state.decoder.push(chunk.as_ref()) {
                        Ok(payloads) => payloads,
                        Err(e) => {
                            state.ready.push_back(Err(e));
                            continue;
                        }
                    };
                    for data in payloads {
                        match parse_stream_event(&data) {
                            StreamItem::Token(text) => state.ready.push_back(Ok(text)),
                            StreamItem::Stop => state.finished = true,
                            StreamItem::Failed(err) => state.ready.push_back(Err(err)),
                            StreamItem::Ignore => {}
                        }
                        if state.finished {
                            break;
                        }
                    }
                }
                Some(Err(e)) => state.ready.push_back(Err(e)),
                None => state.finished = true,
            }
        }
    }))
}

/// Accumulates bytes and yields the `data:` payload of each complete event
#[derive(Default)]
struct SseDecoder {
    buffer: String,
    pending: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, LlmError> {
        // Hold back incomplete UTF-8 sequences split across chunks
        self.pending.extend_from_slice(chunk);
        if self.pending.len() + self.buffer.len() > MAX_FRAME_BUF {
            self.pending.clear();
            self.buffer.clear();
            return Err(LlmError::unknown("SSE stream buffer exceeded 16 MiB"));
        }
        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(s) => s.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let rest = self.pending.split_off(valid_up_to);
        let decoded = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        self.buffer.push_str(&decoded.replace("\r\n", "\n"));

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim_start)
                .collect();
            if !data.is_empty() {
                payloads.push(data.join("\n"));
            }
        }
        Ok(payloads)
    }
}

enum StreamItem {
    Token(String),
    Stop,
    Failed(LlmError),
    Ignore,
}

fn parse_stream_event(data: &str) -> StreamItem {
    let Ok(event) = serde_json::from_str::<AnthropicStreamEvent>(data) else {
        tracing::debug!(data = %data, "Skipping unparseable stream event");
        return StreamItem::Ignore;
    };

    match event {
        AnthropicStreamEvent::ContentBlockDelta {
            delta: AnthropicDelta::TextDelta { text },
        } => StreamItem::Token(text),
        AnthropicStreamEvent::MessageStop => StreamItem::Stop,
        AnthropicStreamEvent::Error { error } => {
            let err = match error.r#type.as_str() {
                "overloaded_error" | "api_error" => LlmError::server_error(error.message),
                "rate_limit_error" => LlmError::rate_limit(error.message),
                "authentication_error" | "permission_error" => LlmError::auth(error.message),
                "invalid_request_error" => LlmError::invalid_request(error.message),
                _ => LlmError::unknown(error.message),
            };
            StreamItem::Failed(err)
        }
        AnthropicStreamEvent::ContentBlockDelta {
            delta: AnthropicDelta::Other,
        }
        | AnthropicStreamEvent::Other => StreamItem::Ignore,
    }
}

// Anthropic API types

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    system: Vec<AnthropicSystemBlock>,
    messages: Vec<AnthropicMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicSystemBlock {
    r#type: String,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    r#type: String,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Serialize)]
struct AnthropicContentBlock {
    r#type: String,
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    ContentBlockDelta {
        delta: AnthropicDelta,
    },
    MessageStop,
    Error {
        error: AnthropicErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    r#type: String,
    message: String,
}
