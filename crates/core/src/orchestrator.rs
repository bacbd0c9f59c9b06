use crate::conversation::{ConversationLog, DEFAULT_HISTORY_TURNS, DEFAULT_MAX_CLIENTS};
use crate::error::{RagError, Result};
use crate::models::{CompletionRequest, CompletionResponse, GenerationRequest, RetrievalResult};
use crate::resilience::CallPolicy;
use crate::retriever::Retriever;
use crate::traits::{TextGenerator, TextStream};
use async_stream::try_stream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer the question using the provided context. If the context does not contain the answer, say that you do not know.";

/// Defaults applied when a request leaves a knob unset.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    pub system_prompt: String,
    pub similarity_threshold: f32,
    pub top_k: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub history_turns: usize,
    pub history_clients: usize,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            similarity_threshold: 0.7,
            top_k: 5,
            temperature: 0.7,
            max_tokens: 512,
            history_turns: DEFAULT_HISTORY_TURNS,
            history_clients: DEFAULT_MAX_CLIENTS,
        }
    }
}

/// A completion whose answer arrives as text deltas. Retrieval has already
/// happened, so grounding and context are known up front.
pub struct CompletionStream {
    pub grounded: bool,
    pub context: Option<RetrievalResult>,
    pub deltas: TextStream,
}

/// Everything settled before the generator is called.
struct Prepared {
    generation: GenerationRequest,
    context: RetrievalResult,
    grounded: bool,
    deadline: Option<Instant>,
}

pub struct CompletionOrchestrator {
    retriever: Retriever,
    generator: Arc<dyn TextGenerator>,
    settings: CompletionSettings,
    policy: CallPolicy,
    conversations: Arc<ConversationLog>,
}

impl CompletionOrchestrator {
    pub fn new(
        retriever: Retriever,
        generator: Arc<dyn TextGenerator>,
        settings: CompletionSettings,
    ) -> Self {
        let conversations = ConversationLog::new(settings.history_turns, settings.history_clients);
        Self {
            retriever,
            generator,
            settings,
            policy: CallPolicy::default(),
            conversations: Arc::new(conversations),
        }
    }

    pub fn with_policy(mut self, policy: CallPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn settings(&self) -> &CompletionSettings {
        &self.settings
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn conversations(&self) -> &ConversationLog {
        &self.conversations
    }

    /// Retrieves context, generates an answer and records the exchange.
    /// `request.timeout` bounds the whole call, retries included.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let prepared = self.prepare(request).await?;

        let generator = self.generator.as_ref();
        let generation_request = &prepared.generation;
        let generation = self
            .policy
            .run_until("generate", prepared.deadline, move || {
                generator.generate(generation_request)
            })
            .await
            .map_err(as_generation_error)?;

        if let Some(client_id) = request.client_id.as_deref() {
            self.conversations
                .record_exchange(client_id, &request.query, &generation.text);
        }

        info!(
            grounded = prepared.grounded,
            context_chunks = prepared.context.len(),
            model = generation.model.as_deref().unwrap_or("unknown"),
            "completion generated"
        );

        Ok(CompletionResponse {
            completion: generation.text,
            grounded: prepared.grounded,
            model: generation.model,
            usage: generation.usage,
            context: request.return_context.then_some(prepared.context),
        })
    }

    /// Like [`CompletionOrchestrator::complete`], but hands back the answer
    /// as it is generated. The exchange is recorded once the stream ends
    /// cleanly; a failed or abandoned stream leaves the history untouched.
    pub async fn complete_stream(&self, request: &CompletionRequest) -> Result<CompletionStream> {
        let started = Instant::now();
        let prepared = self.prepare(request).await?;
        let deadline = prepared.deadline;

        let generator = self.generator.as_ref();
        let generation_request = &prepared.generation;
        let mut upstream = self
            .policy
            .run_until("generate", deadline, move || {
                generator.generate_stream(generation_request)
            })
            .await
            .map_err(as_generation_error)?;

        let conversations = Arc::clone(&self.conversations);
        let client_id = request.client_id.clone();
        let query = request.query.clone();
        let grounded = prepared.grounded;
        let deltas = try_stream! {
            let mut answer = String::new();
            loop {
                let next = match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, upstream.next())
                        .await
                        .map_err(|_| RagError::Timeout {
                            operation: "generate",
                            after: started.elapsed(),
                        })?,
                    None => upstream.next().await,
                };
                match next {
                    Some(delta) => {
                        let delta = delta.map_err(as_generation_error)?;
                        answer.push_str(&delta);
                        yield delta;
                    }
                    None => break,
                }
            }

            if let Some(client_id) = client_id.as_deref() {
                conversations.record_exchange(client_id, &query, &answer);
            }
            info!(grounded, answer_chars = answer.chars().count(), "streamed completion finished");
        };

        Ok(CompletionStream {
            grounded,
            context: request.return_context.then_some(prepared.context),
            deltas: Box::pin(deltas),
        })
    }

    async fn prepare(&self, request: &CompletionRequest) -> Result<Prepared> {
        let threshold = request
            .similarity_threshold
            .unwrap_or(self.settings.similarity_threshold);
        let top_k = request.top_k.unwrap_or(self.settings.top_k);
        let temperature = request.temperature.unwrap_or(self.settings.temperature);
        let max_tokens = request.max_tokens.unwrap_or(self.settings.max_tokens);
        validate_overrides(threshold, temperature, max_tokens, request.timeout)?;

        let deadline = request.timeout.map(|timeout| Instant::now() + timeout);

        let context = if request.query.trim().is_empty() {
            RetrievalResult::default()
        } else {
            self.retriever
                .retrieve_until(&request.query, threshold, top_k, deadline)
                .await?
        };

        let grounded = !context.is_empty();
        if !grounded {
            warn!(threshold, top_k, "no chunk cleared the threshold, answering ungrounded");
        }

        let history = match request.client_id.as_deref() {
            Some(client_id) => self
                .conversations
                .recent(client_id, self.settings.history_turns),
            None => Vec::new(),
        };

        Ok(Prepared {
            generation: GenerationRequest {
                preamble: self.settings.system_prompt.clone(),
                context_chunks: context.texts(),
                query: request.query.clone(),
                history,
                temperature,
                max_tokens,
            },
            context,
            grounded,
            deadline,
        })
    }
}

fn as_generation_error(error: RagError) -> RagError {
    match error {
        RagError::Timeout { .. } | RagError::GenerationFailed(_) => error,
        other => RagError::GenerationFailed(other.to_string()),
    }
}

fn validate_overrides(
    threshold: f32,
    temperature: f32,
    max_tokens: u32,
    timeout: Option<Duration>,
) -> Result<()> {
    if !threshold.is_finite() {
        return Err(RagError::InvalidRequest(
            "similarity_threshold must be finite".to_string(),
        ));
    }
    if !temperature.is_finite() || temperature < 0.0 {
        return Err(RagError::InvalidRequest(
            "temperature must be a non-negative number".to_string(),
        ));
    }
    if max_tokens == 0 {
        return Err(RagError::InvalidRequest(
            "max_tokens must be greater than zero".to_string(),
        ));
    }
    if timeout.is_some_and(|timeout| timeout.is_zero()) {
        return Err(RagError::InvalidRequest(
            "timeout must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
