//! Streaming client for an OpenAI-compatible chat-completions endpoint.

use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use crate::error::CoreErr;
use crate::error::Result;
use crate::flags::MODEL_API_KEY;
use crate::flags::MODEL_BASE_URL;
use crate::flags::MODEL_NAME;
use crate::flags::MODEL_REQUEST_MAX_RETRIES;
use crate::flags::MODEL_STREAM_IDLE_TIMEOUT_MS;
use crate::util::backoff;

use super::models::ResponseItem;

/// API request payload for a single model turn.
#[derive(Default, Debug, Clone)]
pub struct Prompt {
    /// System instructions, sent as the first message.
    pub instructions: String,
    /// Conversation context input items.
    pub input: Vec<ResponseItem>,
    /// Tool definitions in chat-completions wire shape.
    pub tools: Vec<serde_json::Value>,
}

#[derive(Debug)]
pub enum ResponseEvent {
    OutputItemDone(ResponseItem),
    Completed,
}

pub struct ResponseStream {
    rx_event: mpsc::Receiver<Result<ResponseEvent>>,
}

impl Stream for ResponseStream {
    type Item = Result<ResponseEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_event.poll_recv(cx)
    }
}

#[derive(Clone)]
pub struct ModelClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl ModelClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        }
    }

    pub fn from_flags() -> Self {
        Self::new(
            *MODEL_BASE_URL,
            MODEL_API_KEY.map(str::to_string),
            *MODEL_NAME,
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Open one streaming completion. Retries the HTTP handshake on 429 and
    /// 5xx with exponential backoff, honoring `Retry-After`.
    pub async fn stream(&self, prompt: &Prompt) -> Result<ResponseStream> {
        let mut messages = Vec::<serde_json::Value>::new();
        messages.push(json!({"role": "system", "content": prompt.instructions}));

        for item in &prompt.input {
            match item {
                ResponseItem::Message { role, content } => {
                    messages.push(json!({"role": role, "content": content}));
                }
                ResponseItem::FunctionCall {
                    name,
                    arguments,
                    call_id,
                } => {
                    messages.push(json!({
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": call_id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": arguments,
                            }
                        }]
                    }));
                }
                ResponseItem::FunctionCallOutput { call_id, output } => {
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": call_id,
                        "content": output,
                    }));
                }
            }
        }

        let payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "tools": prompt.tools,
        });

        let url = format!("{}/chat/completions", self.base_url);
        debug!("POST to {url}");

        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut req_builder = self.client.post(&url);
            if let Some(api_key) = &self.api_key {
                req_builder = req_builder.bearer_auth(api_key.clone());
            }
            let res = req_builder
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(&payload)
                .send()
                .await;

            match res {
                Ok(resp) if resp.status().is_success() => {
                    let (tx_event, rx_event) = mpsc::channel::<Result<ResponseEvent>>(16);
                    let stream = resp.bytes_stream().map_err(CoreErr::Reqwest);
                    tokio::spawn(process_chat_sse(
                        stream,
                        tx_event,
                        *MODEL_STREAM_IDLE_TIMEOUT_MS,
                    ));
                    return Ok(ResponseStream { rx_event });
                }
                Ok(res) => {
                    let status = res.status();
                    if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                        let body = res.text().await.unwrap_or_default();
                        return Err(CoreErr::UnexpectedStatus(status, body));
                    }

                    if attempt > *MODEL_REQUEST_MAX_RETRIES {
                        return Err(CoreErr::RetryLimit(status));
                    }

                    let retry_after_secs = res
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok());

                    let delay = retry_after_secs
                        .map(|s| Duration::from_millis(s * 1_000))
                        .unwrap_or_else(|| backoff(attempt));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempt > *MODEL_REQUEST_MAX_RETRIES {
                        return Err(e.into());
                    }
                    let delay = backoff(attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Decode the chat-completions SSE wire format into [`ResponseEvent`]s so
/// the rest of the pipeline stays agnostic of the transport.
async fn process_chat_sse<S>(
    stream: S,
    tx_event: mpsc::Sender<Result<ResponseEvent>>,
    idle_timeout: Duration,
) where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();

    // A function call may be split over many delta events: the pieces are
    // collected here and forwarded as one item once the chunk carrying
    // `finish_reason: tool_calls` arrives.
    #[derive(Default)]
    struct FunctionCallState {
        name: Option<String>,
        arguments: String,
        call_id: Option<String>,
        active: bool,
    }

    let mut fn_call_state = FunctionCallState::default();

    loop {
        let sse = match timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(ev))) => ev,
            Ok(Some(Err(e))) => {
                let _ = tx_event.send(Err(CoreErr::Stream(e.to_string()))).await;
                return;
            }
            Ok(None) => {
                // Stream closed gracefully.
                let _ = tx_event.send(Ok(ResponseEvent::Completed)).await;
                return;
            }
            Err(_) => {
                let _ = tx_event
                    .send(Err(CoreErr::Stream("idle timeout waiting for SSE".into())))
                    .await;
                return;
            }
        };

        if sse.data.trim() == "[DONE]" {
            let _ = tx_event.send(Ok(ResponseEvent::Completed)).await;
            return;
        }

        let chunk: serde_json::Value = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(_) => continue,
        };
        trace!("received SSE chunk: {chunk:?}");

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            continue;
        };

        // Assistant content tokens.
        if let Some(content) = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
        {
            if !content.is_empty() {
                let item = ResponseItem::Message {
                    role: "assistant".to_string(),
                    content: content.to_string(),
                };
                let _ = tx_event.send(Ok(ResponseEvent::OutputItemDone(item))).await;
            }
        }

        // Streaming function / tool calls.
        if let Some(tool_calls) = choice
            .get("delta")
            .and_then(|d| d.get("tool_calls"))
            .and_then(|tc| tc.as_array())
        {
            if let Some(tool_call) = tool_calls.first() {
                fn_call_state.active = true;

                if let Some(id) = tool_call.get("id").and_then(|v| v.as_str()) {
                    fn_call_state.call_id.get_or_insert_with(|| id.to_string());
                }

                if let Some(function) = tool_call.get("function") {
                    if let Some(name) = function.get("name").and_then(|n| n.as_str()) {
                        fn_call_state.name.get_or_insert_with(|| name.to_string());
                    }
                    if let Some(args_fragment) = function.get("arguments").and_then(|a| a.as_str())
                    {
                        fn_call_state.arguments.push_str(args_fragment);
                    }
                }
            }
        }

        // End of turn.
        if let Some(finish_reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            if finish_reason == "tool_calls" && fn_call_state.active {
                let item = ResponseItem::FunctionCall {
                    name: fn_call_state.name.clone().unwrap_or_default(),
                    arguments: fn_call_state.arguments.clone(),
                    call_id: fn_call_state.call_id.clone().unwrap_or_default(),
                };
                let _ = tx_event.send(Ok(ResponseEvent::OutputItemDone(item))).await;
            }

            let _ = tx_event.send(Ok(ResponseEvent::Completed)).await;
            return;
        }
    }
}
