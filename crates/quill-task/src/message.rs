use serde::{Deserialize, Serialize};
use serde_json::Value;

use quill_core::{current_unix_timestamp_ms, new_message_id};

use crate::AgentType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A point-to-point or broadcast note between agents.
///
/// Messages carry non-blocking notifications, never task results. A message
/// is created by its sender, consumed once by the receiving agent's inbox,
/// then discarded.
pub struct AgentMessage {
    pub id: String,
    pub from_agent: AgentType,
    /// `None` broadcasts to every registered agent except the sender.
    #[serde(default)]
    pub to_agent: Option<AgentType>,
    pub content: Value,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub timestamp_unix_ms: u64,
}

impl AgentMessage {
    pub fn direct(from_agent: AgentType, to_agent: AgentType, content: Value) -> Self {
        Self {
            id: new_message_id(),
            from_agent,
            to_agent: Some(to_agent),
            content,
            metadata: serde_json::Map::new(),
            timestamp_unix_ms: current_unix_timestamp_ms(),
        }
    }

    pub fn broadcast(from_agent: AgentType, content: Value) -> Self {
        Self {
            id: new_message_id(),
            from_agent,
            to_agent: None,
            content,
            metadata: serde_json::Map::new(),
            timestamp_unix_ms: current_unix_timestamp_ms(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns true when the message should land in `agent_type`'s inbox.
    pub fn addressed_to(&self, agent_type: AgentType) -> bool {
        match self.to_agent {
            Some(target) => target == agent_type,
            None => self.from_agent != agent_type,
        }
    }
}
