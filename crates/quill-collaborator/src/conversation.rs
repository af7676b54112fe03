//! Conversation persistence backends behind the [`ConversationStore`] trait.
//!
//! Three implementations with identical semantics: an in-memory map for
//! tests and ephemeral runs, an append-only JSONL directory, and a SQLite
//! database for durable installs.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use quill_core::{current_unix_timestamp_ms, write_text_atomic};

use crate::traits::{
    CollaboratorError, ConversationMessage, ConversationStore, ConversationSummary,
};

const CONVERSATION_RECORD_SCHEMA_VERSION: u32 = 1;

static CONVERSATION_COUNTER: AtomicU64 = AtomicU64::new(1);

fn new_conversation_id() -> String {
    let millis = current_unix_timestamp_ms();
    let count = CONVERSATION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("quill-conv-{millis}-{count}")
}

fn conversation_record_schema_version() -> u32 {
    CONVERSATION_RECORD_SCHEMA_VERSION
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `ConversationBackend` values.
pub enum ConversationBackend {
    InMemory,
    Jsonl,
    Sqlite,
}

/// Resolve the conversation backend from a storage path hint.
///
/// `None` selects the in-memory backend; `.jsonl` selects JSONL;
/// `.sqlite`/`.db` selects SQLite.
pub fn resolve_conversation_backend(
    path: Option<&Path>,
) -> Result<ConversationBackend, CollaboratorError> {
    let Some(path) = path else {
        return Ok(ConversationBackend::InMemory);
    };
    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase());
    match extension.as_deref() {
        Some("jsonl") => Ok(ConversationBackend::Jsonl),
        Some("sqlite" | "db") => Ok(ConversationBackend::Sqlite),
        _ => Err(CollaboratorError::InvalidRequest(format!(
            "unsupported conversation store path '{}' (expected .jsonl, .sqlite, or .db)",
            path.display()
        ))),
    }
}

#[derive(Debug, Default)]
struct StoredConversation {
    title: String,
    created_at_unix_ms: u64,
    messages: Vec<ConversationMessage>,
}

/// In-memory conversation store; contents are lost on drop.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    conversations: Mutex<BTreeMap<String, StoredConversation>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create_conversation(&self, title: &str) -> Result<String, CollaboratorError> {
        let conversation_id = new_conversation_id();
        let mut conversations = lock_or_recover(&self.conversations);
        conversations.insert(
            conversation_id.clone(),
            StoredConversation {
                title: title.to_string(),
                created_at_unix_ms: current_unix_timestamp_ms(),
                messages: Vec::new(),
            },
        );
        Ok(conversation_id)
    }

    async fn store_message(
        &self,
        conversation_id: &str,
        message: &ConversationMessage,
    ) -> Result<(), CollaboratorError> {
        let mut conversations = lock_or_recover(&self.conversations);
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| CollaboratorError::NotFound(conversation_id.to_string()))?;
        conversation.messages.push(message.clone());
        Ok(())
    }

    async fn retrieve_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, CollaboratorError> {
        let conversations = lock_or_recover(&self.conversations);
        let conversation = conversations
            .get(conversation_id)
            .ok_or_else(|| CollaboratorError::NotFound(conversation_id.to_string()))?;
        Ok(tail_messages(&conversation.messages, limit))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, CollaboratorError> {
        let conversations = lock_or_recover(&self.conversations);
        Ok(conversations
            .iter()
            .map(|(conversation_id, conversation)| ConversationSummary {
                conversation_id: conversation_id.clone(),
                title: conversation.title.clone(),
                message_count: conversation.messages.len(),
                created_at_unix_ms: conversation.created_at_unix_ms,
            })
            .collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationMessageRecord {
    #[serde(default = "conversation_record_schema_version")]
    schema_version: u32,
    role: String,
    content: String,
    timestamp_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ConversationIndex {
    #[serde(default = "conversation_record_schema_version")]
    schema_version: u32,
    #[serde(default)]
    conversations: BTreeMap<String, ConversationIndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationIndexEntry {
    title: String,
    created_at_unix_ms: u64,
    message_count: usize,
}

/// JSONL conversation store: one append-only file per conversation plus an
/// atomically rewritten index snapshot.
pub struct JsonlConversationStore {
    root: PathBuf,
    index: Mutex<ConversationIndex>,
}

impl JsonlConversationStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CollaboratorError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|error| {
            CollaboratorError::Backend(format!("failed to create {}: {error}", root.display()))
        })?;
        let index_path = root.join("conversations.json");
        let index = if index_path.exists() {
            let raw = std::fs::read_to_string(&index_path).map_err(|error| {
                CollaboratorError::Backend(format!(
                    "failed to read {}: {error}",
                    index_path.display()
                ))
            })?;
            serde_json::from_str::<ConversationIndex>(&raw)?
        } else {
            ConversationIndex {
                schema_version: CONVERSATION_RECORD_SCHEMA_VERSION,
                conversations: BTreeMap::new(),
            }
        };
        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    fn conversation_path(&self, conversation_id: &str) -> PathBuf {
        self.root.join(format!("{conversation_id}.jsonl"))
    }

    fn persist_index(&self, index: &ConversationIndex) -> Result<(), CollaboratorError> {
        let rendered = serde_json::to_string_pretty(index)?;
        write_text_atomic(&self.root.join("conversations.json"), &rendered)
            .map_err(|error| CollaboratorError::Backend(error.to_string()))
    }
}

#[async_trait]
impl ConversationStore for JsonlConversationStore {
    async fn create_conversation(&self, title: &str) -> Result<String, CollaboratorError> {
        let conversation_id = new_conversation_id();
        let mut index = lock_or_recover(&self.index);
        index.conversations.insert(
            conversation_id.clone(),
            ConversationIndexEntry {
                title: title.to_string(),
                created_at_unix_ms: current_unix_timestamp_ms(),
                message_count: 0,
            },
        );
        self.persist_index(&index)?;
        Ok(conversation_id)
    }

    async fn store_message(
        &self,
        conversation_id: &str,
        message: &ConversationMessage,
    ) -> Result<(), CollaboratorError> {
        let mut index = lock_or_recover(&self.index);
        let entry = index
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| CollaboratorError::NotFound(conversation_id.to_string()))?;

        let record = ConversationMessageRecord {
            schema_version: CONVERSATION_RECORD_SCHEMA_VERSION,
            role: message.role.clone(),
            content: message.content.clone(),
            timestamp_unix_ms: message.timestamp_unix_ms,
        };
        let line = serde_json::to_string(&record)?;
        let path = self.conversation_path(conversation_id);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|error| {
                CollaboratorError::Backend(format!("failed to open {}: {error}", path.display()))
            })?;
        writeln!(file, "{line}").map_err(|error| {
            CollaboratorError::Backend(format!("failed to append {}: {error}", path.display()))
        })?;

        entry.message_count = entry.message_count.saturating_add(1);
        self.persist_index(&index)?;
        Ok(())
    }

    async fn retrieve_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, CollaboratorError> {
        {
            let index = lock_or_recover(&self.index);
            if !index.conversations.contains_key(conversation_id) {
                return Err(CollaboratorError::NotFound(conversation_id.to_string()));
            }
        }

        let path = self.conversation_path(conversation_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path).map_err(|error| {
            CollaboratorError::Backend(format!("failed to read {}: {error}", path.display()))
        })?;
        let mut messages = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            let record = serde_json::from_str::<ConversationMessageRecord>(line)?;
            messages.push(ConversationMessage {
                role: record.role,
                content: record.content,
                timestamp_unix_ms: record.timestamp_unix_ms,
            });
        }
        Ok(tail_messages(&messages, limit))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, CollaboratorError> {
        let index = lock_or_recover(&self.index);
        Ok(index
            .conversations
            .iter()
            .map(|(conversation_id, entry)| ConversationSummary {
                conversation_id: conversation_id.clone(),
                title: entry.title.clone(),
                message_count: entry.message_count,
                created_at_unix_ms: entry.created_at_unix_ms,
            })
            .collect())
    }
}

/// SQLite-backed conversation store.
pub struct SqliteConversationStore {
    connection: Mutex<Connection>,
}

impl SqliteConversationStore {
    pub fn open(path: &Path) -> Result<Self, CollaboratorError> {
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| {
                CollaboratorError::Backend(format!(
                    "failed to create {}: {error}",
                    parent.display()
                ))
            })?;
        }
        let connection = Connection::open(path).map_err(sqlite_error)?;
        connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS conversations (
                    conversation_id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    created_at_unix_ms INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS conversation_messages (
                    conversation_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    timestamp_unix_ms INTEGER NOT NULL,
                    FOREIGN KEY (conversation_id)
                        REFERENCES conversations (conversation_id)
                );",
            )
            .map_err(sqlite_error)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn create_conversation(&self, title: &str) -> Result<String, CollaboratorError> {
        let conversation_id = new_conversation_id();
        let connection = lock_or_recover(&self.connection);
        connection
            .execute(
                "INSERT INTO conversations (conversation_id, title, created_at_unix_ms)
                 VALUES (?1, ?2, ?3)",
                params![conversation_id, title, current_unix_timestamp_ms()],
            )
            .map_err(sqlite_error)?;
        Ok(conversation_id)
    }

    async fn store_message(
        &self,
        conversation_id: &str,
        message: &ConversationMessage,
    ) -> Result<(), CollaboratorError> {
        let connection = lock_or_recover(&self.connection);
        let known: bool = connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM conversations WHERE conversation_id = ?1)",
                params![conversation_id],
                |row| row.get(0),
            )
            .map_err(sqlite_error)?;
        if !known {
            return Err(CollaboratorError::NotFound(conversation_id.to_string()));
        }
        connection
            .execute(
                "INSERT INTO conversation_messages
                     (conversation_id, role, content, timestamp_unix_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    conversation_id,
                    message.role,
                    message.content,
                    message.timestamp_unix_ms
                ],
            )
            .map_err(sqlite_error)?;
        Ok(())
    }

    async fn retrieve_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, CollaboratorError> {
        let connection = lock_or_recover(&self.connection);
        let known: bool = connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM conversations WHERE conversation_id = ?1)",
                params![conversation_id],
                |row| row.get(0),
            )
            .map_err(sqlite_error)?;
        if !known {
            return Err(CollaboratorError::NotFound(conversation_id.to_string()));
        }

        let mut statement = connection
            .prepare(
                "SELECT role, content, timestamp_unix_ms
                 FROM conversation_messages
                 WHERE conversation_id = ?1
                 ORDER BY rowid",
            )
            .map_err(sqlite_error)?;
        let rows = statement
            .query_map(params![conversation_id], |row| {
                Ok(ConversationMessage {
                    role: row.get(0)?,
                    content: row.get(1)?,
                    timestamp_unix_ms: row.get(2)?,
                })
            })
            .map_err(sqlite_error)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.map_err(sqlite_error)?);
        }
        Ok(tail_messages(&messages, limit))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, CollaboratorError> {
        let connection = lock_or_recover(&self.connection);
        let mut statement = connection
            .prepare(
                "SELECT c.conversation_id, c.title, c.created_at_unix_ms,
                        (SELECT COUNT(*) FROM conversation_messages m
                         WHERE m.conversation_id = c.conversation_id)
                 FROM conversations c
                 ORDER BY c.conversation_id",
            )
            .map_err(sqlite_error)?;
        let rows = statement
            .query_map([], |row| {
                Ok(ConversationSummary {
                    conversation_id: row.get(0)?,
                    title: row.get(1)?,
                    created_at_unix_ms: row.get(2)?,
                    message_count: row.get::<_, i64>(3)?.max(0) as usize,
                })
            })
            .map_err(sqlite_error)?;
        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row.map_err(sqlite_error)?);
        }
        Ok(summaries)
    }
}

fn sqlite_error(error: rusqlite::Error) -> CollaboratorError {
    CollaboratorError::Backend(error.to_string())
}

fn tail_messages(messages: &[ConversationMessage], limit: usize) -> Vec<ConversationMessage> {
    if limit == 0 || limit >= messages.len() {
        return messages.to_vec();
    }
    messages[messages.len() - limit..].to_vec()
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
