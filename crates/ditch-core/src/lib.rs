use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifies one independent dialog thread: who is talking, and where.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId {
    subject_id: String,
    channel_id: String,
}

impl ConversationId {
    pub fn new(subject_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            channel_id: channel_id.into(),
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.subject_id, self.channel_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// One message in a conversation together with the tokens it holds against
/// the dialog budget.
///
/// `token_cost` is signed: a user turn's cost is derived from the difference
/// between the remote prompt size and the dialog total, and that difference
/// is kept as reported even when it comes out negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogTurn {
    pub role: Role,
    pub content: String,
    pub token_cost: i64,
    pub created_at: DateTime<Utc>,
}

impl DialogTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            token_cost: 0,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, token_cost: i64) -> Self {
        Self::new(Role::Assistant, content).with_cost(token_cost)
    }

    pub fn with_cost(mut self, token_cost: i64) -> Self {
        self.token_cost = token_cost;
        self
    }

    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

/// Why the remote model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Other(String),
}

impl FinishReason {
    /// Only a natural stop counts as a complete reply.
    pub fn is_normal(&self) -> bool {
        matches!(self, FinishReason::Stop)
    }
}

impl From<&str> for FinishReason {
    fn from(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::Stop => f.write_str("stop"),
            FinishReason::Length => f.write_str("length"),
            FinishReason::ContentFilter => f.write_str("content_filter"),
            FinishReason::ToolCalls => f.write_str("tool_calls"),
            FinishReason::Other(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    /// Upper bound on the tokens the reply may use.
    pub max_tokens: u32,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub message: ChatMessage,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
}

#[derive(Error, Debug)]
pub enum BanterError {
    #[error("Completion request failed: {0}")]
    Transient(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Unexpected finish reason '{reason}', expecting 'stop'")]
    AbnormalCompletion { reason: FinishReason },

    #[error("Completion response contained no message")]
    EmptyResponse,

    #[error("Failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<BanterError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl BanterError {
    /// The innermost error, looking through retry exhaustion.
    pub fn root_cause(&self) -> &BanterError {
        match self {
            BanterError::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether another attempt at the same completion call may succeed.
    ///
    /// Every failure that crosses the completion boundary is retried; local
    /// configuration, io and serialization errors and cancellation are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            BanterError::Transient(_)
            | BanterError::RateLimited(_)
            | BanterError::AuthError(_)
            | BanterError::AbnormalCompletion { .. }
            | BanterError::EmptyResponse => true,
            BanterError::RetryExhausted { .. }
            | BanterError::Cancelled
            | BanterError::ConfigError(_)
            | BanterError::IoError(_)
            | BanterError::SerializationError(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BanterError>;

/// A stateless chat-completion endpoint.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    async fn create_completion(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Short provider name used in logs and usage accounting.
    fn provider(&self) -> &'static str;
}
