use super::{endpoint, error_detail};
use crate::config::GenerationConfig;
use crate::error::{RagError, Result};
use crate::models::{Generation, GenerationRequest, Role, TokenUsage};
use crate::traits::{TextGenerator, TextStream};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::{Display, Write as _};
use tracing::{debug, error, warn};
use url::Url;

const CONTEXT_HEADER: &str = "The following is contextual information related to the query:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// System preamble, prior turns, then the user turn. Context chunks are
/// numbered in rank order; without context the user turn is the bare query.
pub fn build_messages(request: &GenerationRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(request.history.len() + 2);
    messages.push(ChatMessage::new("system", request.preamble.as_str()));

    for turn in &request.history {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        messages.push(ChatMessage::new(role, turn.content.as_str()));
    }

    if request.context_chunks.is_empty() {
        messages.push(ChatMessage::new("user", request.query.as_str()));
        return messages;
    }

    let mut content = format!("{CONTEXT_HEADER}\n\n");
    for (position, chunk) in request.context_chunks.iter().enumerate() {
        let _ = write!(content, "Context {}:\n{}\n\n", position + 1, chunk);
    }
    let _ = write!(
        content,
        "Here is my query:\n{}\n\nPlease answer based on the provided context.",
        request.query
    );
    messages.push(ChatMessage::new("user", content));
    messages
}

pub struct OpenAiChatGenerator {
    client: reqwest::Client,
    url: Url,
    api_key: Option<String>,
    model: String,
}

impl OpenAiChatGenerator {
    pub fn new(config: &GenerationConfig, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            url: endpoint("generation.base_url", &config.base_url, "chat/completions")?,
            api_key: api_key.filter(|key| !key.is_empty()),
            model: config.model.clone(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn send(&self, request: &GenerationRequest, stream: bool) -> Result<reqwest::Response> {
        let body = ChatRequest {
            model: &self.model,
            messages: build_messages(request),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
        };
        debug!(
            model = %self.model,
            messages = body.messages.len(),
            context_chunks = request.context_chunks.len(),
            stream,
            "requesting chat completion"
        );

        let mut http = self.client.post(self.url.clone()).json(&body);
        if let Some(api_key) = &self.api_key {
            http = http.bearer_auth(api_key);
        }

        let response = http.send().await.map_err(|error| {
            error!(error = %error, url = %self.url, "chat completion request failed");
            RagError::GenerationFailed(format!("request failed: {error}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, "generation server returned an error");
            return Err(RagError::GenerationFailed(format!(
                "server returned {status}: {}",
                error_detail(body)
            )));
        }
        Ok(response)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

fn into_generation(response: ChatResponse) -> Result<Generation> {
    let text = response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or_else(|| RagError::GenerationFailed("response carried no choices".to_string()))?;
    Ok(Generation {
        text,
        model: response.model,
        usage: response.usage,
    })
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Splits a server-sent event body into the payloads of its `data:` lines.
/// Bytes are held until a blank line closes the event, so multi-byte
/// characters split across network reads survive.
#[derive(Debug, Default)]
struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(end) = find_event_end(&self.pending) {
            let event: Vec<u8> = self.pending.drain(..end.0).collect();
            self.pending.drain(..end.1);
            let event = String::from_utf8_lossy(&event);
            let data: Vec<&str> = event
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|data| data.strip_prefix(' ').unwrap_or(data))
                .collect();
            if !data.is_empty() {
                payloads.push(data.join("\n"));
            }
        }
        payloads
    }
}

/// Offset of the first blank line and the length of the separator.
fn find_event_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|pair| pair == b"\n\n").map(|at| (at, 2));
    let crlf = buffer
        .windows(4)
        .position(|quad| quad == b"\r\n\r\n")
        .map(|at| (at, 4));
    match (lf, crlf) {
        (Some(lf), Some(crlf)) => Some(if crlf.0 < lf.0 { crlf } else { lf }),
        (lf, crlf) => lf.or(crlf),
    }
}

enum StreamEvent {
    Delta(String),
    Done,
    Nothing,
}

fn decode_payload(data: &str) -> StreamEvent {
    if data.trim() == "[DONE]" {
        return StreamEvent::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map_or(StreamEvent::Nothing, StreamEvent::Delta),
        Err(error) => {
            warn!(error = %error, "ignoring unreadable stream event");
            StreamEvent::Nothing
        }
    }
}

/// Turns a chat-completions event stream into text deltas, ending at
/// `[DONE]` or when the body closes.
fn decode_stream<S, B, E>(body: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + Unpin,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let state = (body, SseDecoder::default(), VecDeque::new(), false);
    stream::unfold(state, |(mut body, mut decoder, mut deltas, mut finished)| async move {
        loop {
            if let Some(delta) = deltas.pop_front() {
                return Some((Ok(delta), (body, decoder, deltas, finished)));
            }
            if finished {
                return None;
            }
            match body.next().await {
                Some(Ok(bytes)) => {
                    for payload in decoder.push(bytes.as_ref()) {
                        match decode_payload(&payload) {
                            StreamEvent::Delta(delta) => deltas.push_back(delta),
                            StreamEvent::Done => {
                                finished = true;
                                break;
                            }
                            StreamEvent::Nothing => {}
                        }
                    }
                }
                Some(Err(error)) => {
                    finished = true;
                    let error = RagError::GenerationFailed(format!("stream interrupted: {error}"));
                    return Some((Err(error), (body, decoder, deltas, finished)));
                }
                None => finished = true,
            }
        }
    })
}

#[async_trait]
impl TextGenerator for OpenAiChatGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let response = self.send(request, false).await?;
        let parsed: ChatResponse = response.json().await.map_err(|error| {
            RagError::GenerationFailed(format!("unreadable chat response: {error}"))
        })?;
        into_generation(parsed)
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream> {
        let response = self.send(request, true).await?;
        Ok(Box::pin(decode_stream(response.bytes_stream())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatTurn;

    fn request(context_chunks: Vec<&str>) -> GenerationRequest {
        GenerationRequest {
            preamble: "Be brief.".to_string(),
            context_chunks: context_chunks.into_iter().map(String::from).collect(),
            query: "What sleeps?".to_string(),
            history: Vec::new(),
            temperature: 0.2,
            max_tokens: 64,
        }
    }

    #[test]
    fn context_is_numbered_in_rank_order() {
        let messages = build_messages(&request(vec!["The lazy dog sleeps.", "The quick brown fox."]));

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], ChatMessage::new("system", "Be brief."));
        let user = &messages[1].content;
        let first = user.find("Context 1:\nThe lazy dog sleeps.").unwrap();
        let second = user.find("Context 2:\nThe quick brown fox.").unwrap();
        assert!(first < second);
        assert!(user.contains("What sleeps?"));
    }

    #[test]
    fn no_context_sends_the_bare_query() {
        let messages = build_messages(&request(Vec::new()));
        assert_eq!(messages[1], ChatMessage::new("user", "What sleeps?"));
    }

    #[test]
    fn history_sits_between_system_and_user() {
        let mut request = request(Vec::new());
        request.history = vec![
            ChatTurn {
                role: Role::User,
                content: "hi".to_string(),
            },
            ChatTurn {
                role: Role::Assistant,
                content: "hello".to_string(),
            },
        ];
        let roles: Vec<String> = build_messages(&request)
            .into_iter()
            .map(|message| message.role)
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
    }

    #[test]
    fn response_text_model_and_usage_are_read() {
        let response: ChatResponse = serde_json::from_str(
            r#"{
                "model": "qwen",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "The dog."}}],
                "usage": {"prompt_tokens": 30, "completion_tokens": 3, "total_tokens": 33}
            }"#,
        )
        .unwrap();

        let generation = into_generation(response).unwrap();
        assert_eq!(generation.text, "The dog.");
        assert_eq!(generation.model.as_deref(), Some("qwen"));
        assert_eq!(generation.usage.map(|usage| usage.total_tokens), Some(33));
    }

    #[test]
    fn empty_choices_fail_generation() {
        let response: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        let error = into_generation(response).unwrap_err();
        assert!(matches!(error, RagError::GenerationFailed(_)));
    }

    #[test]
    fn endpoint_is_chat_completions() {
        let generator = OpenAiChatGenerator::new(&GenerationConfig::default(), None).unwrap();
        assert_eq!(
            generator.url().as_str(),
            "http://127.0.0.1:60002/v1/chat/completions"
        );
    }

    type Read = std::result::Result<&'static [u8], &'static str>;

    async fn collect(reads: Vec<Read>) -> Vec<Result<String>> {
        decode_stream(stream::iter(reads)).collect().await
    }

    async fn deltas(reads: Vec<Read>) -> Vec<String> {
        collect(reads)
            .await
            .into_iter()
            .map(|delta| delta.unwrap())
            .collect()
    }

    fn event(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"index": 0, "delta": {"content": content}}]})
        )
    }

    #[tokio::test]
    async fn deltas_survive_arbitrary_read_boundaries() {
        let body = format!(
            "{}{}{}data: [DONE]\n\n",
            event("Der "),
            event("Hund "),
            event("schläft.")
        );
        let bytes: &'static [u8] = Box::leak(body.into_bytes().into_boxed_slice());
        // split inside a frame and inside the two-byte "ä"
        let umlaut = bytes.iter().position(|&byte| byte == 0xC3).unwrap();
        let reads = vec![
            Ok(&bytes[..7]),
            Ok(&bytes[7..umlaut + 1]),
            Ok(&bytes[umlaut + 1..]),
        ];

        assert_eq!(deltas(reads).await, vec!["Der ", "Hund ", "schläft."]);
    }

    #[tokio::test]
    async fn done_marker_ends_the_stream() {
        let body = format!("{}data: [DONE]\n\n{}", event("kept"), event("dropped"));
        let bytes: &'static [u8] = Box::leak(body.into_bytes().into_boxed_slice());

        assert_eq!(deltas(vec![Ok(bytes)]).await, vec!["kept"]);
    }

    #[tokio::test]
    async fn comments_role_only_chunks_and_garbage_are_ignored() {
        let body = concat!(
            ": keep-alive\r\n\r\n",
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: not json\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n",
        );
        assert_eq!(deltas(vec![Ok(body.as_bytes())]).await, vec!["ok"]);
    }

    #[tokio::test]
    async fn broken_body_surfaces_as_generation_failure() {
        let first: &'static [u8] = Box::leak(event("partial").into_bytes().into_boxed_slice());
        let items = collect(vec![Ok(first), Err("connection reset")]).await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().ok(), Some("partial"));
        assert!(matches!(items[1], Err(RagError::GenerationFailed(_))));
    }

    #[tokio::test]
    async fn unreachable_server_fails_before_streaming() {
        let config = GenerationConfig {
            base_url: "http://127.0.0.1:9/v1".to_string(),
            ..GenerationConfig::default()
        };
        let generator = OpenAiChatGenerator::new(&config, None).unwrap();
        let error = match generator.generate_stream(&request(Vec::new())).await {
            Ok(_) => panic!("expected the request to fail"),
            Err(error) => error,
        };
        assert!(matches!(error, RagError::GenerationFailed(_)));
    }
}
