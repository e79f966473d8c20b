//! The inference endpoint client (§4.6): a thin HTTP client wrapping the
//! remote completion endpoint, with unary and server-sent-event streaming
//! paths and the retry/backoff policy for transient failures.

use agentica_protocol::Delta;
use agentica_protocol::EndReason;
use agentica_protocol::Role;
use agentica_protocol::Usage;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::error::AgenticaError;
use crate::error::Result;
use crate::util::backoff;

const SSE_DONE: &str = "[DONE]";

/// A completion request sent to the inference endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip)]
    pub streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// The minimal chat-message shape the endpoint accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    id: Option<String>,
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<WireDelta>,
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

fn end_reason_from(finish_reason: Option<&str>) -> Option<EndReason> {
    match finish_reason {
        None => None,
        Some("stop") => Some(EndReason::Stop),
        Some("length") => Some(EndReason::Length),
        Some("content_filter") => Some(EndReason::ContentFilter),
        Some("tool_calls") => Some(EndReason::ToolCalls),
        Some(other) => {
            warn!(finish_reason = other, "unrecognized finish_reason, treating as Stop");
            Some(EndReason::Stop)
        }
    }
}

fn delta_from_choice(id: String, choice: &CompletionChoice, streamed: bool) -> Delta {
    let wire = if streamed {
        choice.delta.as_ref()
    } else {
        choice.message.as_ref()
    };
    let mut delta = Delta::new(id, wire.and_then(|w| w.role).unwrap_or(Role::Agent));
    if let Some(wire) = wire {
        if let Some(content) = &wire.content {
            delta = delta.with_content(content.clone());
        }
        delta.reasoning_content = wire.reasoning_content.clone();
        delta.refusal = wire.refusal.clone();
    }
    delta.end_reason = end_reason_from(choice.finish_reason.as_deref());
    delta
}

/// A shared client for the remote inference endpoint.
#[derive(Clone)]
pub struct InferenceEndpoint {
    client: reqwest::Client,
    base_url: String,
    token: String,
    max_retries: u32,
    backoff_base_ms: u64,
}

impl InferenceEndpoint {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
            max_retries: 4,
            backoff_base_ms: 200,
        }
    }

    pub fn with_retry_policy(mut self, max_retries: u32, backoff_base_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.backoff_base_ms = backoff_base_ms;
        self
    }

    fn endpoint_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Unary completion with rate-limit retry/backoff (§4.6, §9).
    pub async fn complete(&self, request: CompletionRequest) -> Result<Delta> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.complete_once(&request).await {
                Ok(delta) => return Ok(delta),
                Err(AgenticaError::RateLimit) if attempt <= self.max_retries => {
                    let delay = backoff(self.backoff_base_ms, attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after rate limit");
                    tokio::time::sleep(delay).await;
                }
                Err(AgenticaError::RateLimit) => {
                    return Err(AgenticaError::RetryLimit(attempt - 1));
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn complete_once(&self, request: &CompletionRequest) -> Result<Delta> {
        let response = self
            .client
            .post(self.endpoint_url())
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgenticaError::from_status(status, body));
        }

        let parsed: CompletionResponse = response.json().await.map_err(map_transport_error)?;
        let id = parsed.id.unwrap_or_default();
        let choice = parsed
            .choices
            .first()
            .ok_or_else(|| AgenticaError::InternalServer("completion response had no choices".into()))?;
        let mut delta = delta_from_choice(id, choice, false);
        if let Some(usage) = parsed.usage {
            delta.usage = Some(Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            });
        }
        Ok(delta)
    }

    /// Server-sent-event streaming completion. The initial request (through
    /// the response-status check) shares `complete()`'s rate-limit
    /// retry/backoff policy (§4.6, §9); once the SSE body starts, individual
    /// events are not retried. Each yielded [`Delta`] is a partial; the
    /// caller (see `sequencer::run_model_inference`) fuses them into a
    /// single logical delta.
    pub async fn stream(&self, request: CompletionRequest) -> Result<impl Stream<Item = Result<Delta>> + Send> {
        let mut request = request;
        request.streaming = true;

        let mut attempt = 0u32;
        let response = loop {
            attempt += 1;
            match self.stream_once(&request).await {
                Ok(response) => break response,
                Err(AgenticaError::RateLimit) if attempt <= self.max_retries => {
                    let delay = backoff(self.backoff_base_ms, attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying stream request after rate limit");
                    tokio::time::sleep(delay).await;
                }
                Err(AgenticaError::RateLimit) => return Err(AgenticaError::RetryLimit(attempt - 1)),
                Err(other) => return Err(other),
            }
        };

        let bytes_stream = response.bytes_stream().map(|r| r.map_err(std::io::Error::other));
        let events = bytes_stream.eventsource();
        Ok(events.filter_map(|event| async move {
            let event = match event {
                Ok(event) => event,
                Err(e) => return Some(Err(AgenticaError::InternalServer(e.to_string()))),
            };
            if event.data == SSE_DONE {
                return None;
            }
            match serde_json::from_str::<CompletionResponse>(&event.data) {
                Ok(parsed) => {
                    let id = parsed.id.unwrap_or_default();
                    let choice = parsed.choices.first()?;
                    let mut delta = delta_from_choice(id, choice, true);
                    if let Some(usage) = parsed.usage {
                        delta.usage = Some(Usage {
                            prompt_tokens: usage.prompt_tokens,
                            completion_tokens: usage.completion_tokens,
                            total_tokens: usage.total_tokens,
                        });
                    }
                    Some(Ok(delta))
                }
                Err(e) => Some(Err(AgenticaError::Json(e))),
            }
        }))
    }

    async fn stream_once(&self, request: &CompletionRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint_url())
            .bearer_auth(&self.token)
            .json(&StreamingRequest { inner: request })
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgenticaError::from_status(status, body));
        }
        Ok(response)
    }
}

#[derive(Serialize)]
struct StreamingRequest<'a> {
    #[serde(flatten)]
    inner: &'a CompletionRequest,
}

fn map_transport_error(e: reqwest::Error) -> AgenticaError {
    if e.is_timeout() {
        AgenticaError::ApiTimeout
    } else if e.is_connect() {
        AgenticaError::ApiConnection(e.to_string())
    } else {
        AgenticaError::Reqwest(e)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "gpt-4.1".into(),
            messages: vec![WireMessage {
                role: Role::User,
                content: "hi".into(),
            }],
            streaming: false,
            max_tokens: None,
            temperature: None,
        }
    }

    #[tokio::test]
    async fn complete_parses_a_successful_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "resp-1",
                "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
            })))
            .mount(&server)
            .await;

        let endpoint = InferenceEndpoint::new(reqwest::Client::new(), server.uri(), "test-token");
        let delta = endpoint.complete(request()).await.expect("completion succeeds");
        assert_eq!(delta.content.as_deref(), Some("hello"));
        assert_eq!(delta.end_reason, Some(EndReason::Stop));
    }

    #[tokio::test]
    async fn complete_maps_429_to_rate_limit_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let endpoint = InferenceEndpoint::new(reqwest::Client::new(), server.uri(), "test-token")
            .with_retry_policy(1, 1);
        let err = endpoint.complete(request()).await.unwrap_err();
        assert!(matches!(err, AgenticaError::RetryLimit(1)));
    }

    #[tokio::test]
    async fn stream_retries_429_before_giving_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let endpoint = InferenceEndpoint::new(reqwest::Client::new(), server.uri(), "test-token")
            .with_retry_policy(1, 1);
        let err = endpoint.stream(request()).await.unwrap_err();
        assert!(matches!(err, AgenticaError::RetryLimit(1)));
    }

    #[tokio::test]
    async fn stream_succeeds_after_a_retried_429() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"id\":\"resp-1\",\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"hi\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let endpoint = InferenceEndpoint::new(reqwest::Client::new(), server.uri(), "test-token")
            .with_retry_policy(2, 1);
        let mut stream = endpoint.stream(request()).await.expect("stream establishes after retry");
        let first = stream.next().await.expect("one partial").expect("ok");
        assert_eq!(first.content.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn complete_maps_402_to_insufficient_credits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(402))
            .mount(&server)
            .await;

        let endpoint = InferenceEndpoint::new(reqwest::Client::new(), server.uri(), "test-token");
        let err = endpoint.complete(request()).await.unwrap_err();
        assert!(matches!(err, AgenticaError::InsufficientCredits));
    }
}
