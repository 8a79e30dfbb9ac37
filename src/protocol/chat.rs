use serde::{Deserialize, Serialize};

use crate::config::SamplingConfig;

/// Chat Completions request wire type, restricted to the fields this client sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
}

impl ChatCompletionRequest {
    /// Build a streaming request carrying a single user message.
    #[must_use]
    pub fn streaming(model: &str, prompt: String, sampling: &SamplingConfig) -> Self {
        Self {
            model: model.to_owned(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt,
            }],
            stream: true,
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
            top_p: sampling.top_p,
            frequency_penalty: sampling.frequency_penalty,
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// One `data:` payload of a streamed chat completion.
///
/// Every field is optional on the wire; usage-only or keep-alive payloads
/// decode to an empty `choices` list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatStreamChunk {
    #[serde(default)]
    pub choices: Vec<ChatStreamChoice>,
}

/// A choice within a stream chunk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatStreamChoice {
    #[serde(default)]
    pub delta: Option<ChatDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Delta content within a stream choice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
}
