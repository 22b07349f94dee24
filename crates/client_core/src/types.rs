use chrono::Utc;
use shared::{
    domain::{ChildId, ConversationRef, MessageId, Sender},
    protocol::{ChatMessage, ConversationSummary},
};
use uuid::Uuid;

use crate::selection::{AgentSelection, SelectionError};

const TITLE_MAX_CHARS: usize = 50;

/// The conversation currently shown in the chat pane.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveConversation {
    pub reference: ConversationRef,
    pub title: String,
    pub child_id: Option<ChildId>,
    pub messages: Vec<ChatMessage>,
}

impl ActiveConversation {
    pub fn draft(child_id: Option<ChildId>) -> Self {
        Self {
            reference: ConversationRef::pending(),
            title: String::new(),
            child_id,
            messages: Vec::new(),
        }
    }

    pub fn from_summary(summary: &ConversationSummary, messages: Vec<ChatMessage>) -> Self {
        Self {
            reference: ConversationRef::Confirmed(summary.id.clone()),
            title: summary.title.clone(),
            child_id: summary.child_id.clone(),
            messages,
        }
    }

    pub fn has_messages(&self) -> bool {
        !self.messages.is_empty()
    }

    pub fn summary(&self, selection: &AgentSelection) -> Option<ConversationSummary> {
        let id = self.reference.server_id()?.clone();
        let last = self.messages.last();
        let update = selection.metadata_update();
        Some(ConversationSummary {
            id,
            title: self.title.clone(),
            child_id: self.child_id.clone(),
            last_message: last.map(|message| message.content.clone()),
            updated_at: last.map(|message| message.timestamp),
            conversation_type: Some(update.conversation_type),
            primary_agent_type: update.primary_agent_type,
            enabled_agents: update
                .enabled_agents
                .iter()
                .map(|agent| agent.id().to_string())
                .collect(),
        })
    }
}

pub(crate) fn title_from_query(query: &str) -> String {
    let mut title: String = query.chars().take(TITLE_MAX_CHARS).collect();
    if query.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    title
}

pub(crate) fn local_message(
    sender: Sender,
    content: impl Into<String>,
    agent: Option<String>,
    references: Vec<String>,
) -> ChatMessage {
    ChatMessage {
        id: MessageId::new(format!("local-{}", Uuid::new_v4())),
        content: content.into(),
        sender,
        timestamp: Utc::now(),
        agent,
        confidence: None,
        references,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persistence {
    Synced,
    /// Conversation has no server id yet; the selection travels with the
    /// first message instead.
    LocalOnly,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionUpdate {
    Applied(Persistence),
    Declined,
    Refused(SelectionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionStatus {
    pub selection: AgentSelection,
    /// Differs from the state last persisted to the backend.
    pub dirty: bool,
    /// The last metadata push failed.
    pub unsynced: bool,
}
