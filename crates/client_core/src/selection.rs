//! Agent routing state for the active conversation.
//!
//! The controller owns the current selection, the snapshot of what the
//! backend last held, and the rules deciding when a change must be confirmed
//! by the user before it takes effect.

use shared::{
    domain::{AgentKind, ConversationType},
    protocol::{ConversationSummary, UpdateMetadataRequest},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("{0} is the only enabled agent and cannot be disabled")]
    LastEnabledAgent(AgentKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSelection {
    auto_mode: bool,
    enabled: Vec<AgentKind>,
}

impl Default for AgentSelection {
    fn default() -> Self {
        Self {
            auto_mode: true,
            enabled: AgentKind::ALL.to_vec(),
        }
    }
}

impl AgentSelection {
    pub fn manual(agents: impl IntoIterator<Item = AgentKind>) -> Self {
        let mut enabled = Vec::new();
        for agent in agents {
            if !enabled.contains(&agent) {
                enabled.push(agent);
            }
        }
        if enabled.is_empty() {
            enabled = AgentKind::ALL.to_vec();
        }
        Self {
            auto_mode: false,
            enabled,
        }
    }

    /// Rebuilds the selection stored in a conversation's metadata.
    pub fn restore(summary: &ConversationSummary) -> Self {
        let was_manual = match summary.conversation_type {
            Some(kind) => kind == ConversationType::AgentSpecific,
            None => !summary.enabled_agents.is_empty(),
        };
        if !was_manual {
            return Self::default();
        }

        let mut agents: Vec<AgentKind> = summary
            .enabled_agents
            .iter()
            .filter_map(|entry| AgentKind::lookup(entry))
            .collect();

        if agents.is_empty() {
            if let Some(primary) = summary
                .primary_agent_type
                .as_deref()
                .and_then(AgentKind::lookup)
            {
                agents.push(primary);
            }
        }

        let unknown: Vec<&str> = summary
            .enabled_agents
            .iter()
            .map(String::as_str)
            .filter(|entry| AgentKind::lookup(entry).is_none())
            .collect();
        if !unknown.is_empty() {
            warn!(
                conversation_id = %summary.id,
                ?unknown,
                "selection: ignoring unknown stored agents"
            );
        }

        if agents.is_empty() {
            debug!(
                conversation_id = %summary.id,
                "selection: no usable stored agents, enabling all"
            );
        }

        Self::manual(agents)
    }

    pub fn auto_mode(&self) -> bool {
        self.auto_mode
    }

    pub fn enabled_agents(&self) -> &[AgentKind] {
        &self.enabled
    }

    pub fn is_enabled(&self, agent: AgentKind) -> bool {
        self.enabled.contains(&agent)
    }

    fn sorted_agents(&self) -> Vec<AgentKind> {
        let mut agents = self.enabled.clone();
        agents.sort();
        agents
    }

    /// Order-insensitive comparison of mode and enabled set.
    pub fn same_as(&self, other: &AgentSelection) -> bool {
        self.auto_mode == other.auto_mode && self.sorted_agents() == other.sorted_agents()
    }

    /// Agent forced onto the backend for the next message, if any.
    pub fn manual_agent(&self) -> Option<AgentKind> {
        match self.enabled.as_slice() {
            [only] if !self.auto_mode => Some(*only),
            _ => None,
        }
    }

    pub fn primary_agent(&self) -> Option<AgentKind> {
        match self.enabled.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    pub fn conversation_type(&self) -> ConversationType {
        if self.auto_mode {
            ConversationType::General
        } else {
            ConversationType::AgentSpecific
        }
    }

    pub fn metadata_update(&self) -> UpdateMetadataRequest {
        UpdateMetadataRequest {
            conversation_type: self.conversation_type(),
            enabled_agents: self.enabled.clone(),
            primary_agent_type: self
                .primary_agent()
                .map(|agent| agent.display_name().to_string()),
        }
    }

    fn apply(&mut self, change: SelectionChange) -> Result<(), SelectionError> {
        match change {
            SelectionChange::SetAutoMode(auto_mode) => {
                self.auto_mode = auto_mode;
                if auto_mode {
                    self.enabled = AgentKind::ALL.to_vec();
                }
            }
            SelectionChange::SetAgentEnabled {
                agent,
                enabled: true,
            } => {
                if !self.enabled.contains(&agent) {
                    self.enabled.push(agent);
                }
            }
            SelectionChange::SetAgentEnabled {
                agent,
                enabled: false,
            } => {
                self.check_can_disable(agent)?;
                self.enabled.retain(|existing| *existing != agent);
            }
        }
        Ok(())
    }

    fn check_can_disable(&self, agent: AgentKind) -> Result<(), SelectionError> {
        if self.enabled.as_slice() == [agent] {
            return Err(SelectionError::LastEnabledAgent(agent));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionChange {
    SetAutoMode(bool),
    SetAgentEnabled { agent: AgentKind, enabled: bool },
}

impl SelectionChange {
    pub fn confirmation(self) -> ConfirmationRequest {
        let (title, message) = match self {
            Self::SetAutoMode(true) => (
                "Switch to Auto mode?".to_string(),
                "ParenZing will pick the best agent for each question. Future replies in this \
                 conversation may come from any agent."
                    .to_string(),
            ),
            Self::SetAutoMode(false) => (
                "Switch to Manual mode?".to_string(),
                "You choose which agents may answer. Future replies in this conversation will \
                 only come from the agents you enable."
                    .to_string(),
            ),
            Self::SetAgentEnabled {
                agent,
                enabled: true,
            } => (
                format!("Enable {agent}?"),
                format!("{agent} will be able to answer future messages in this conversation."),
            ),
            Self::SetAgentEnabled {
                agent,
                enabled: false,
            } => (
                format!("Disable {agent}?"),
                format!("{agent} will no longer answer messages in this conversation."),
            ),
        };
        ConfirmationRequest {
            title,
            message,
            change: self,
        }
    }
}

/// What the user is asked before a change on a conversation with history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRequest {
    pub title: String,
    pub message: String,
    pub change: SelectionChange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    Applied(SelectionChange),
    NeedsConfirmation(ConfirmationRequest),
    Refused(SelectionError),
}

#[derive(Debug, Clone, Default)]
pub struct SelectionController {
    current: AgentSelection,
    snapshot: Option<AgentSelection>,
    unsynced: bool,
}

impl SelectionController {
    /// Defaults for a new chat; nothing has been persisted yet.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn restore(&mut self, summary: &ConversationSummary) {
        let restored = AgentSelection::restore(summary);
        debug!(
            conversation_id = %summary.id,
            auto_mode = restored.auto_mode,
            agents = ?restored.enabled,
            "selection: restored from metadata"
        );
        self.snapshot = Some(restored.clone());
        self.current = restored;
        self.unsynced = false;
    }

    pub fn current(&self) -> &AgentSelection {
        &self.current
    }

    pub fn snapshot(&self) -> Option<&AgentSelection> {
        self.snapshot.as_ref()
    }

    /// True when the current state differs from what the backend holds. With
    /// no snapshot the backend is assumed to hold the defaults.
    pub fn has_changes(&self) -> bool {
        match &self.snapshot {
            Some(snapshot) => !snapshot.same_as(&self.current),
            None => !AgentSelection::default().same_as(&self.current),
        }
    }

    pub fn is_unsynced(&self) -> bool {
        self.unsynced
    }

    fn requires_confirmation(&self, has_messages: bool) -> bool {
        has_messages && self.snapshot.is_some()
    }

    pub fn request_auto_mode_toggle(&mut self, has_messages: bool) -> ToggleOutcome {
        let change = SelectionChange::SetAutoMode(!self.current.auto_mode);
        self.request(change, has_messages)
    }

    pub fn request_agent_toggle(&mut self, agent: AgentKind, has_messages: bool) -> ToggleOutcome {
        let change = SelectionChange::SetAgentEnabled {
            agent,
            enabled: !self.current.is_enabled(agent),
        };
        self.request(change, has_messages)
    }

    /// Requests a specific change rather than a flip of the current value.
    pub fn request(&mut self, change: SelectionChange, has_messages: bool) -> ToggleOutcome {
        if let SelectionChange::SetAgentEnabled {
            agent,
            enabled: false,
        } = change
        {
            if let Err(err) = self.current.check_can_disable(agent) {
                debug!(agent = agent.id(), "selection: refusing to disable last agent");
                return ToggleOutcome::Refused(err);
            }
        }

        if self.requires_confirmation(has_messages) {
            return ToggleOutcome::NeedsConfirmation(change.confirmation());
        }

        match self.current.apply(change) {
            Ok(()) => ToggleOutcome::Applied(change),
            Err(err) => ToggleOutcome::Refused(err),
        }
    }

    /// Applies a change the user accepted.
    pub fn confirm(&mut self, change: SelectionChange) -> Result<(), SelectionError> {
        self.current.apply(change)
    }

    /// Records that the backend now holds the current state.
    pub fn mark_synced(&mut self) {
        self.snapshot = Some(self.current.clone());
        self.unsynced = false;
    }

    pub fn mark_unsynced(&mut self) {
        self.unsynced = true;
    }

    /// Seeds the snapshot for a conversation the server has just created
    /// with default metadata.
    pub fn adopt_default_snapshot(&mut self) {
        if self.snapshot.is_none() {
            self.snapshot = Some(AgentSelection::default());
        }
    }
}

#[cfg(test)]
#[path = "tests/selection_tests.rs"]
mod tests;
