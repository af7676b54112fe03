use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
/// Enumerates supported `CollaboratorError` values.
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("collaborator call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("collaborator rate limited")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

impl CollaboratorError {
    /// Transient faults worth retrying; everything else fails the call
    /// immediately and must not trip the circuit breaker.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout { .. } | Self::RateLimited { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `WriteMode` values.
pub enum WriteMode {
    Create,
    Overwrite,
    Append,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A vault search hit.
pub struct NoteMatch {
    pub path: String,
    pub snippet: String,
    pub score: f64,
}

/// The note/vault storage backend consumed by the vault-manager agent.
#[async_trait]
pub trait VaultStore: Send + Sync {
    async fn read_note(&self, path: &str) -> Result<String, CollaboratorError>;

    async fn write_note(
        &self,
        path: &str,
        content: &str,
        mode: WriteMode,
    ) -> Result<(), CollaboratorError>;

    async fn delete_note(&self, path: &str) -> Result<(), CollaboratorError>;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<NoteMatch>, CollaboratorError>;

    async fn update_frontmatter(
        &self,
        path: &str,
        key: &str,
        value: Value,
    ) -> Result<(), CollaboratorError>;

    async fn update_tags(
        &self,
        path: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A ranked document returned by the retrieval engine.
pub struct RankedDocument {
    pub id: String,
    pub content: String,
    pub score: f64,
}

/// The retrieval/RAG engine consumed by the retrieval and context agents.
#[async_trait]
pub trait RetrievalEngine: Send + Sync {
    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<RankedDocument>, CollaboratorError>;

    async fn generate(&self, query: &str, use_context: bool)
        -> Result<String, CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `PromptRole` values.
pub enum PromptRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Public struct `PromptMessage` used across Quill components.
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Public struct `GenerationRequest` used across Quill components.
pub struct GenerationRequest {
    pub messages: Vec<PromptMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl GenerationRequest {
    pub fn from_messages(messages: Vec<PromptMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Public struct `GenerationResponse` used across Quill components.
pub struct GenerationResponse {
    pub text: String,
    pub finish_reason: Option<String>,
}

/// The text-generation provider consumed by the planner agent.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One stored conversation turn.
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
    pub timestamp_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Public struct `ConversationSummary` used across Quill components.
pub struct ConversationSummary {
    pub conversation_id: String,
    pub title: String,
    pub message_count: usize,
    pub created_at_unix_ms: u64,
}

/// The conversation/memory persistence backend consumed by the memory agent.
///
/// In-memory, JSONL, and SQLite implementations sit behind this one trait;
/// the orchestration core treats all of them identically.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, title: &str) -> Result<String, CollaboratorError>;

    async fn store_message(
        &self,
        conversation_id: &str,
        message: &ConversationMessage,
    ) -> Result<(), CollaboratorError>;

    async fn retrieve_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, CollaboratorError>;

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, CollaboratorError>;
}
