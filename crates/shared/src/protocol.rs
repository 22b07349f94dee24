use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::{
    AgentKind, ChildId, ConversationId, ConversationType, MessageId, Sender, UserId,
};

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// List responses come either bare or wrapped in an object keyed by the
/// collection name.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ListEnvelope<T> {
    Bare(Vec<T>),
    Wrapped {
        #[serde(
            alias = "children",
            alias = "conversations",
            alias = "messages",
            alias = "data"
        )]
        items: Vec<T>,
    },
}

impl<T> ListEnvelope<T> {
    pub fn into_items(self) -> Vec<T> {
        match self {
            Self::Bare(items) | Self::Wrapped { items } => items,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildSummary {
    pub id: ChildId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, alias = "child_id")]
    pub child_id: Option<ChildId>,
    #[serde(default, alias = "last_message")]
    pub last_message: Option<String>,
    #[serde(default, alias = "updated_at")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Absent on records written before routing metadata existed.
    #[serde(default, alias = "conversation_type")]
    pub conversation_type: Option<ConversationType>,
    /// Display name of the primary agent, as stored by the backend.
    #[serde(default, alias = "primary_agent_type")]
    pub primary_agent_type: Option<String>,
    /// Stored entries may be identifiers or display names.
    #[serde(default, alias = "enabled_agents", deserialize_with = "null_as_default")]
    pub enabled_agents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub content: String,
    pub sender: Sender,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Display name of the agent that produced an AI message.
    #[serde(default, alias = "agent_type", alias = "agentType")]
    pub agent: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub references: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub query: String,
    pub child_id: Option<ChildId>,
    pub conversation_id: Option<ConversationId>,
    pub manual_agent: Option<AgentKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    pub response: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    pub conversation_id: ConversationId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub memories: Vec<Value>,
}

impl ChatResponse {
    /// Display name of the responding agent, mapping identifiers through the
    /// agent table and passing unknown labels through untouched.
    pub fn agent_display_name(&self) -> Option<String> {
        let raw = self.agent_type.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        Some(
            AgentKind::lookup(raw)
                .map(|agent| agent.display_name().to_string())
                .unwrap_or_else(|| raw.to_string()),
        )
    }

    pub fn references(&self) -> Vec<String> {
        self.memories.iter().filter_map(memory_reference).collect()
    }
}

fn memory_reference(memory: &Value) -> Option<String> {
    match memory {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Object(fields) => ["content", "text", "memory", "summary"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .or_else(|| Some(memory.to_string())),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateMetadataRequest {
    pub conversation_type: ConversationType,
    pub enabled_agents: Vec<AgentKind>,
    pub primary_agent_type: Option<String>,
}
