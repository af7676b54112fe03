//! Narrow interfaces over the external collaborators consumed by Quill
//! agents, plus the guard applied at every collaborator-call boundary:
//! bounded exponential backoff with jitter and a three-state circuit
//! breaker.
//!
//! Collaborator internals (chunking, ranking, prompt construction) live
//! behind these traits and are out of scope for the orchestration core.

mod breaker;
mod conversation;
mod guard;
mod retry;
mod traits;

pub use breaker::{BreakerDecision, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use conversation::{
    resolve_conversation_backend, ConversationBackend, InMemoryConversationStore,
    JsonlConversationStore, SqliteConversationStore,
};
pub use guard::{CollaboratorGuard, GuardPolicy};
pub use retry::{backoff_delay_ms, next_backoff_ms, next_backoff_ms_with_jitter, BASE_BACKOFF_MS};
pub use traits::{
    CollaboratorError, ConversationMessage, ConversationStore, ConversationSummary,
    GenerationRequest, GenerationResponse, NoteMatch, PromptMessage, PromptRole, RankedDocument,
    RetrievalEngine, TextGenerator, VaultStore, WriteMode,
};
