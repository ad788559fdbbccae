//! RKServe wire types
//!
//! Request and response bodies of the `/rkllm_chat` endpoint. The shapes follow
//! the chat-completion layout clients of the board already speak, with
//! `message` in aggregate responses and `delta` in stream frames.

use serde::{Deserialize, Serialize};

/// Object tag carried by every response and frame
pub const CHAT_OBJECT: &str = "rkllm_chat";

/// Role attached to generated text
pub const ASSISTANT_ROLE: &str = "assistant";

fn default_role() -> String {
    "user".to_string()
}

/// Incoming chat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub stream: bool,
}

/// A role-tagged message; only `content` reaches the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    #[serde(default = "default_role")]
    pub role: String,

    pub content: String,
}

impl ChatMessage {
    /// Assistant message carrying generated text
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ASSISTANT_ROLE.to_string(),
            content: content.into(),
        }
    }
}

/// Why a choice stopped producing text
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Error,
}

/// Token accounting; the native engine does not report counts
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

/// One choice of an aggregate response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: ChatMessage,
    pub logprobs: Option<Vec<f32>>,
    pub finish_reason: FinishReason,
}

/// Aggregate (non-streaming) response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl ChatCompletion {
    /// Empty response envelope
    pub fn new(id: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            object: CHAT_OBJECT.to_string(),
            created,
            choices: Vec::new(),
            usage: Usage::default(),
        }
    }

    /// Append the choice for the next message
    pub fn push_choice(&mut self, content: String, finish_reason: FinishReason) {
        let index = self.choices.len();
        self.choices.push(Choice {
            index,
            message: ChatMessage::assistant(content),
            logprobs: None,
            finish_reason,
        });
    }
}

/// One choice of a stream frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaChoice {
    pub index: usize,
    pub delta: ChatMessage,
    pub logprobs: Option<Vec<f32>>,
    pub finish_reason: Option<FinishReason>,
}

/// A single frame of a streaming response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub choices: Vec<DeltaChoice>,
    pub usage: Usage,
}

impl ChatChunk {
    /// Frame carrying one fragment of message `index`
    pub fn delta(id: &str, created: i64, index: usize, content: String) -> Self {
        Self::with_choice(id, created, index, content, None)
    }

    /// Frame closing message `index`
    pub fn finish(id: &str, created: i64, index: usize, reason: FinishReason) -> Self {
        Self::with_choice(id, created, index, String::new(), Some(reason))
    }

    fn with_choice(
        id: &str,
        created: i64,
        index: usize,
        content: String,
        finish_reason: Option<FinishReason>,
    ) -> Self {
        Self {
            id: id.to_string(),
            object: CHAT_OBJECT.to_string(),
            created,
            choices: vec![DeltaChoice {
                index,
                delta: ChatMessage::assistant(content),
                logprobs: None,
                finish_reason,
            }],
            usage: Usage::default(),
        }
    }
}

/// Error body returned with 4xx/5xx statuses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEnvelope {
    pub status: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }
}
