//! AI chat channel management.
//!
//! This module owns the chat side of the session core: non-streaming and
//! streaming requests against the configured chat endpoint, a registry of
//! cancellable in-flight chats keyed by caller-supplied ids, bearer-token
//! caching, and model discovery.

pub mod api;
pub mod sse;
pub mod token;

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SettingsHandle};
use api::{
    normalize_messages, resolve_model, ChatCompletionResponse, ChatRequest, DEFAULT_MAX_TOKENS,
    DEFAULT_TEMPERATURE,
};
use sse::SseDecoder;

pub use api::{ChatMessage, ChatOptions, ChatResponse};
pub use token::TokenCache;

/// Errors surfaced by chat operations.
///
/// `Unauthorized` is kept distinct from `Upstream` so the caller can decide
/// whether to prompt for re-authentication, and `Cancelled` is a first-class
/// outcome, never conflated with an error or normal completion.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The request carried no messages. Precondition, checked before any
    /// network traffic.
    #[error("chat request requires at least one message")]
    EmptyMessages,

    /// The AI channel is disabled or has no credential configured.
    #[error("AI provider is not configured")]
    NotConfigured,

    /// The endpoint rejected the credential (HTTP 401). Terminal,
    /// non-retryable with the current credential.
    #[error("credential rejected by chat endpoint")]
    Unauthorized,

    /// Any other non-success response from the endpoint.
    #[error("chat endpoint error (HTTP {status}): {message}")]
    Upstream { status: u16, message: String },

    /// Transport-level failure.
    #[error("chat network error: {0}")]
    Network(String),

    /// The chat was cancelled through `cancel_chat`.
    #[error("chat cancelled")]
    Cancelled,
}

/// Lazy stream of content deltas produced by [`ChatManager::chat_stream`].
pub type ChatDeltaStream = BoxStream<'static, Result<String, ChatError>>;

/// Removes the chat-registry entry when the request or stream winds down,
/// including when a consumer drops the stream early.
struct ChatSessionGuard {
    chats: Arc<DashMap<String, CancellationToken>>,
    chat_id: String,
}

impl Drop for ChatSessionGuard {
    fn drop(&mut self) {
        self.chats.remove(&self.chat_id);
    }
}

/// Manager for AI chat channels.
pub struct ChatManager {
    http: reqwest::Client,
    settings: SettingsHandle,
    tokens: TokenCache,
    chats: Arc<DashMap<String, CancellationToken>>,
}

impl ChatManager {
    /// Creates a new manager over the shared settings handle.
    pub fn new(settings: SettingsHandle) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
            tokens: TokenCache::new(),
            chats: Arc::new(DashMap::new()),
        }
    }

    /// Applies a settings mutation and synchronously invalidates the token
    /// cache, so no later read can observe a token minted from the previous
    /// credential.
    pub fn update_settings<F>(&self, mutate: F)
    where
        F: FnOnce(&mut Config),
    {
        self.settings.update(mutate);
        self.tokens.invalidate();
    }

    /// Returns the token cache. The cache re-checks the credential
    /// fingerprint on every read, so this is safe to expose for status UI.
    pub fn token_cache(&self) -> &TokenCache {
        &self.tokens
    }

    /// Issues a non-streaming chat request.
    pub async fn chat(&self, chat_id: &str, options: ChatOptions) -> Result<ChatResponse, ChatError> {
        if options.messages.is_empty() {
            return Err(ChatError::EmptyMessages);
        }

        let ai = self.settings.ai();
        let token = self.tokens.get_token(&ai)?;
        let model = resolve_model(options.model.as_deref(), &ai.default_model);
        let messages = normalize_messages(&options.messages);

        let cancel = self.register_chat(chat_id);
        let _guard = ChatSessionGuard {
            chats: Arc::clone(&self.chats),
            chat_id: chat_id.to_string(),
        };

        let request = ChatRequest {
            model: &model,
            messages: &messages,
            temperature: options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            stream: false,
        };

        let url = format!("{}/chat/completions", ai.base_url.trim_end_matches('/'));
        let pending = self
            .authed(reqwest::Method::POST, &url, &token, &ai.org_id)
            .json(&request)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            response = pending => response.map_err(|e| ChatError::Network(e.to_string()))?,
        };

        let response = check_status(response).await?;
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            body = response.json::<ChatCompletionResponse>() => {
                body.map_err(|e| ChatError::Network(e.to_string()))?
            }
        };

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        Ok(ChatResponse {
            content,
            model: body.model.unwrap_or(model),
        })
    }

    /// Issues a streaming chat request and returns a lazy, finite,
    /// non-restartable sequence of content deltas.
    ///
    /// A cancellation handle is registered under `chat_id` for the duration
    /// and removed when the stream ends or is dropped. Overlapping calls
    /// with the same id are allowed; the newest handle wins the registry
    /// slot.
    pub async fn chat_stream(
        &self,
        chat_id: &str,
        options: ChatOptions,
    ) -> Result<ChatDeltaStream, ChatError> {
        if options.messages.is_empty() {
            return Err(ChatError::EmptyMessages);
        }

        let ai = self.settings.ai();
        let token = self.tokens.get_token(&ai)?;
        let model = resolve_model(options.model.as_deref(), &ai.default_model);
        let messages = normalize_messages(&options.messages);

        let cancel = self.register_chat(chat_id);
        let guard = ChatSessionGuard {
            chats: Arc::clone(&self.chats),
            chat_id: chat_id.to_string(),
        };

        let request = ChatRequest {
            model: &model,
            messages: &messages,
            temperature: options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            stream: true,
        };

        let url = format!("{}/chat/completions", ai.base_url.trim_end_matches('/'));
        let pending = self
            .authed(reqwest::Method::POST, &url, &token, &ai.org_id)
            .json(&request)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            response = pending => response.map_err(|e| ChatError::Network(e.to_string()))?,
        };
        let response = check_status(response).await?;

        let state = StreamState {
            body: response.bytes_stream().boxed(),
            decoder: SseDecoder::new(),
            queue: VecDeque::new(),
            cancel,
            finished: false,
            _guard: guard,
        };

        Ok(futures_util::stream::unfold(state, drive_stream).boxed())
    }

    /// Triggers the cancellation handle registered under `chat_id`.
    ///
    /// A no-op when no chat is in flight under that id. The consumer of the
    /// matching stream observes a distinct `Cancelled` outcome promptly, not
    /// on the next natural chunk boundary.
    pub fn cancel_chat(&self, chat_id: &str) {
        if let Some(entry) = self.chats.get(chat_id) {
            tracing::debug!(chat_id, "cancelling chat");
            entry.value().cancel();
        }
    }

    /// Queries the endpoint for available model identifiers.
    pub async fn list_models(&self) -> Result<Vec<String>, ChatError> {
        let ai = self.settings.ai();
        let token = self.tokens.get_token(&ai)?;

        let url = format!("{}/models", ai.base_url.trim_end_matches('/'));
        let response = self
            .authed(reqwest::Method::GET, &url, &token, &ai.org_id)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;
        let response = check_status(response).await?;

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        Ok(api::extract_model_ids(&value))
    }

    /// Registers a fresh cancellation token under the chat id.
    fn register_chat(&self, chat_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.chats.insert(chat_id.to_string(), token.clone());
        token
    }

    fn authed(
        &self,
        method: reqwest::Method,
        url: &str,
        token: &str,
        org_id: &str,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header("accept", "application/json");
        if !org_id.is_empty() {
            builder = builder.header("x-org-id", org_id);
        }
        builder
    }
}

/// State threaded through the lazy delta stream.
struct StreamState {
    body: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: SseDecoder,
    queue: VecDeque<String>,
    cancel: CancellationToken,
    finished: bool,
    _guard: ChatSessionGuard,
}

/// Produces the next stream item: queued deltas first, then the next body
/// chunk, with cancellation checked ahead of the chunk wait so a cancel
/// unblocks the consumer within one scheduling step.
async fn drive_stream(mut state: StreamState) -> Option<(Result<String, ChatError>, StreamState)> {
    loop {
        if let Some(delta) = state.queue.pop_front() {
            return Some((Ok(delta), state));
        }
        if state.finished {
            return None;
        }

        tokio::select! {
            biased;
            _ = state.cancel.cancelled() => {
                // Dropping the body stream tears down the connection.
                state.finished = true;
                state.queue.clear();
                return Some((Err(ChatError::Cancelled), state));
            }
            chunk = state.body.next() => match chunk {
                Some(Ok(bytes)) => {
                    let deltas = state.decoder.feed(&bytes);
                    state.queue.extend(deltas);
                    if state.decoder.is_done() {
                        state.finished = true;
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(ChatError::Network(e.to_string())), state));
                }
                None => {
                    let deltas = state.decoder.finish();
                    state.queue.extend(deltas);
                    state.finished = true;
                }
            },
        }
    }
}

/// Maps a non-success response to the typed error taxonomy.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status.as_u16() == 401 {
        return Err(ChatError::Unauthorized);
    }

    let message = response.text().await.unwrap_or_default();
    Err(ChatError::Upstream {
        status: status.as_u16(),
        message,
    })
}
