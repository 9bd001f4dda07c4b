//! Wire types for the chat endpoint.
//!
//! The endpoint speaks the common chat-completions shape: JSON request with
//! a message list, JSON response with choices, and a `data:`-framed stream
//! of delta chunks when streaming is enabled.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hardcoded fallback model when neither the request nor the configuration
/// names one.
pub const DEFAULT_MODEL: &str = "glm-4-flash";

/// Sampling defaults applied when the request leaves them unset.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Options for a chat request.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Conversation history, oldest first. Must not be empty.
    pub messages: Vec<ChatMessage>,
    /// Explicit model override.
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Completion length cap.
    pub max_tokens: Option<u32>,
}

/// A completed (non-streaming) chat response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Assistant reply text.
    pub content: String,
    /// Model that produced the reply.
    pub model: String,
}

/// Request body for both streaming and non-streaming calls.
#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

/// Non-streaming response body.
#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompletionChoice {
    pub message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// One decoded chunk of a streaming response.
#[derive(Debug, Deserialize)]
pub(crate) struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

/// Resolves the model identifier: explicit option, then the configured
/// default, then the hardcoded fallback.
pub(crate) fn resolve_model(explicit: Option<&str>, configured: &str) -> String {
    match explicit {
        Some(model) if !model.is_empty() => model.to_string(),
        _ if !configured.is_empty() => configured.to_string(),
        _ => DEFAULT_MODEL.to_string(),
    }
}

/// Normalizes a message list before dispatch: unknown roles collapse to
/// `user` so the endpoint never rejects a whole request over a typo'd role.
pub(crate) fn normalize_messages(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|message| {
            let role = match message.role.as_str() {
                "system" | "user" | "assistant" => message.role.clone(),
                _ => "user".to_string(),
            };
            ChatMessage {
                role,
                content: message.content.clone(),
            }
        })
        .collect()
}

/// Extracts model identifiers from a models listing.
///
/// Accepts either a bare array or a `{data: [...]}` envelope; each entry may
/// be a string or an object carrying an `id`, `model`, or `name` field.
/// The result is de-duplicated and sorted.
pub(crate) fn extract_model_ids(value: &Value) -> Vec<String> {
    let entries = if let Some(array) = value.as_array() {
        array.as_slice()
    } else if let Some(array) = value.get("data").and_then(Value::as_array) {
        array.as_slice()
    } else {
        return Vec::new();
    };

    let mut ids: Vec<String> = entries
        .iter()
        .filter_map(|entry| {
            if let Some(id) = entry.as_str() {
                return Some(id.to_string());
            }
            ["id", "model", "name"]
                .iter()
                .find_map(|key| entry.get(key).and_then(Value::as_str))
                .map(str::to_string)
        })
        .collect();

    ids.sort();
    ids.dedup();
    ids
}
