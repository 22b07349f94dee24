use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{AgentKind, ChildId, ConversationId, ConversationRef, LocalConversationId, Sender},
    protocol::{
        ChatMessage, ChatRequest, ChatResponse, ChildSummary, ConversationSummary, UserProfile,
    },
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

pub mod error;
pub mod selection;
pub mod session;
pub mod sidebar;
pub mod transport;
pub mod types;

pub use error::ClientError;
pub use selection::{
    AgentSelection, ConfirmationRequest, SelectionChange, SelectionController, SelectionError,
    ToggleOutcome,
};
pub use session::{FileSessionStore, MemorySessionStore, Session, SessionContext, SessionStore};
pub use sidebar::{group_conversations, ChildGroup, Sidebar};
pub use transport::{HttpApi, ParenZingApi, DEFAULT_REQUEST_TIMEOUT};
pub use types::{ActiveConversation, Persistence, SelectionStatus, SelectionUpdate};

use types::{local_message, title_from_query};

const CHAT_FAILURE_REPLY: &str =
    "Sorry, I couldn't get a response right now. Please try sending your message again.";

/// The dialog shown before a routing change on a conversation with history.
#[async_trait]
pub trait ConfirmationPrompt: Send + Sync {
    async fn confirm(&self, request: &ConfirmationRequest) -> bool;
}

pub struct AutoApprove;

#[async_trait]
impl ConfirmationPrompt for AutoApprove {
    async fn confirm(&self, _request: &ConfirmationRequest) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    RedirectToLogin,
    ConversationsLoaded {
        count: usize,
    },
    ConversationOpened {
        conversation_id: ConversationId,
    },
    MessageAppended {
        conversation: ConversationRef,
        message: ChatMessage,
    },
    ConversationRebound {
        local: LocalConversationId,
        server: ConversationId,
    },
    SelectionChanged(AgentSelection),
    MetadataSynced {
        conversation_id: ConversationId,
    },
    MetadataSyncFailed {
        conversation_id: ConversationId,
        error: String,
    },
    StaleResponseDiscarded {
        conversation: ConversationRef,
    },
}

#[derive(Default)]
struct ChatState {
    user: Option<UserProfile>,
    children: Vec<ChildSummary>,
    conversations: Vec<ConversationSummary>,
    active: Option<ActiveConversation>,
    selection: SelectionController,
    /// Bumped whenever the active conversation changes; responses carrying
    /// an older value are dropped.
    load_generation: u64,
}

impl ChatState {
    fn has_messages(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(ActiveConversation::has_messages)
    }

    fn active_server_id(&self) -> Option<ConversationId> {
        self.active
            .as_ref()
            .and_then(|active| active.reference.server_id().cloned())
    }

    fn upsert_summary(&mut self, summary: ConversationSummary) {
        match self
            .conversations
            .iter_mut()
            .find(|existing| existing.id == summary.id)
        {
            Some(existing) => *existing = summary,
            None => self.conversations.insert(0, summary),
        }
    }

    fn sync_active_summary(&mut self) {
        let summary = self
            .active
            .as_ref()
            .and_then(|active| active.summary(self.selection.current()));
        if let Some(summary) = summary {
            self.upsert_summary(summary);
        }
    }
}

pub struct ChatClient {
    api: Arc<dyn ParenZingApi>,
    session: Arc<SessionContext>,
    prompt: Arc<dyn ConfirmationPrompt>,
    inner: Mutex<ChatState>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(api: Arc<dyn ParenZingApi>, session: Arc<SessionContext>) -> Arc<Self> {
        Self::new_with_prompt(api, session, Arc::new(AutoApprove))
    }

    pub fn new_with_prompt(
        api: Arc<dyn ParenZingApi>,
        session: Arc<SessionContext>,
        prompt: Arc<dyn ConfirmationPrompt>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            api,
            session,
            prompt,
            inner: Mutex::new(ChatState::default()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Auth check plus the initial children and conversation lists. Any
    /// failure sends the user back to the login screen.
    pub async fn bootstrap(&self) -> Result<UserProfile, ClientError> {
        let loaded = async {
            let user = self.api.current_user().await?;
            let children = self.api.list_children().await?;
            let conversations = self.api.list_conversations().await?;
            Ok::<_, ClientError>((user, children, conversations))
        }
        .await;

        let (user, children, conversations) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(error = %err, "chat: initial load failed");
                self.redirect_to_login(err.is_unauthorized()).await;
                return Err(err);
            }
        };

        if let Some(email) = &user.email {
            if let Err(err) = self.session.set_user_email(Some(email.clone())).await {
                warn!(error = %err, "chat: failed to persist user email");
            }
        }

        let count = conversations.len();
        {
            let mut guard = self.inner.lock().await;
            guard.user = Some(user.clone());
            guard.children = children;
            guard.conversations = conversations;
        }
        info!(conversations = count, "chat: bootstrap complete");
        self.emit(ClientEvent::ConversationsLoaded { count });
        Ok(user)
    }

    pub async fn refresh_conversations(&self) -> Result<usize, ClientError> {
        let conversations = self.guard_auth(self.api.list_conversations().await).await?;
        let count = conversations.len();
        self.inner.lock().await.conversations = conversations;
        self.emit(ClientEvent::ConversationsLoaded { count });
        Ok(count)
    }

    async fn redirect_to_login(&self, invalidate: bool) {
        if invalidate {
            if let Err(err) = self.session.invalidate().await {
                warn!(error = %err, "chat: failed to clear session");
            }
        }
        {
            let mut guard = self.inner.lock().await;
            let generation = guard.load_generation + 1;
            *guard = ChatState {
                load_generation: generation,
                ..ChatState::default()
            };
        }
        self.emit(ClientEvent::RedirectToLogin);
    }

    async fn guard_auth<T>(&self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if matches!(result, Err(ClientError::Unauthorized)) {
            self.redirect_to_login(true).await;
        }
        result
    }

    /// Starts an empty conversation with default routing.
    pub async fn new_chat(&self, child_id: Option<ChildId>) -> ActiveConversation {
        let draft = ActiveConversation::draft(child_id);
        let selection = {
            let mut guard = self.inner.lock().await;
            guard.load_generation += 1;
            guard.active = Some(draft.clone());
            guard.selection.reset();
            guard.selection.current().clone()
        };
        debug!(conversation = %draft.reference, "chat: new conversation");
        self.emit(ClientEvent::SelectionChanged(selection));
        draft
    }

    pub async fn open_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ActiveConversation, ClientError> {
        let generation = {
            let mut guard = self.inner.lock().await;
            guard.load_generation += 1;
            guard.load_generation
        };

        let messages = self
            .guard_auth(self.api.list_messages(conversation_id).await)
            .await?;

        let (active, selection) = {
            let mut guard = self.inner.lock().await;
            if guard.load_generation != generation {
                drop(guard);
                debug!(%conversation_id, "chat: discarding stale message load");
                self.emit(ClientEvent::StaleResponseDiscarded {
                    conversation: ConversationRef::Confirmed(conversation_id.clone()),
                });
                return Err(ClientError::Superseded(conversation_id.clone()));
            }

            let summary = guard
                .conversations
                .iter()
                .find(|summary| summary.id == *conversation_id)
                .cloned()
                .unwrap_or_else(|| {
                    debug!(%conversation_id, "chat: opening conversation missing from list");
                    ConversationSummary {
                        id: conversation_id.clone(),
                        title: String::new(),
                        child_id: None,
                        last_message: None,
                        updated_at: None,
                        conversation_type: None,
                        primary_agent_type: None,
                        enabled_agents: Vec::new(),
                    }
                });

            let active = ActiveConversation::from_summary(&summary, messages);
            guard.active = Some(active.clone());
            guard.selection.restore(&summary);
            (active, guard.selection.current().clone())
        };

        info!(
            %conversation_id,
            messages = active.messages.len(),
            auto_mode = selection.auto_mode(),
            "chat: conversation opened"
        );
        self.emit(ClientEvent::ConversationOpened {
            conversation_id: conversation_id.clone(),
        });
        self.emit(ClientEvent::SelectionChanged(selection));
        Ok(active)
    }

    pub async fn toggle_auto_mode(&self) -> Result<SelectionUpdate, ClientError> {
        let (generation, outcome) = {
            let mut guard = self.inner.lock().await;
            let has_messages = guard.has_messages();
            let outcome = guard.selection.request_auto_mode_toggle(has_messages);
            (guard.load_generation, outcome)
        };
        self.resolve_toggle(generation, outcome).await
    }

    pub async fn toggle_agent(&self, agent: AgentKind) -> Result<SelectionUpdate, ClientError> {
        let (generation, outcome) = {
            let mut guard = self.inner.lock().await;
            let has_messages = guard.has_messages();
            let outcome = guard.selection.request_agent_toggle(agent, has_messages);
            (guard.load_generation, outcome)
        };
        self.resolve_toggle(generation, outcome).await
    }

    /// Moves the selection to an explicit value rather than flipping it.
    pub async fn request_change(
        &self,
        change: SelectionChange,
    ) -> Result<SelectionUpdate, ClientError> {
        let (generation, outcome) = {
            let mut guard = self.inner.lock().await;
            let has_messages = guard.has_messages();
            let outcome = guard.selection.request(change, has_messages);
            (guard.load_generation, outcome)
        };
        self.resolve_toggle(generation, outcome).await
    }

    async fn resolve_toggle(
        &self,
        generation: u64,
        outcome: ToggleOutcome,
    ) -> Result<SelectionUpdate, ClientError> {
        match outcome {
            ToggleOutcome::Refused(err) => {
                info!(error = %err, "chat: selection change refused");
                Ok(SelectionUpdate::Refused(err))
            }
            ToggleOutcome::Applied(change) => {
                debug!(?change, "chat: selection change applied");
                self.after_selection_change().await
            }
            ToggleOutcome::NeedsConfirmation(request) => {
                if !self.prompt.confirm(&request).await {
                    info!(change = ?request.change, "chat: selection change declined");
                    return Ok(SelectionUpdate::Declined);
                }
                {
                    let mut guard = self.inner.lock().await;
                    if guard.load_generation != generation {
                        info!("chat: conversation changed while confirming; dropping change");
                        return Ok(SelectionUpdate::Declined);
                    }
                    if let Err(err) = guard.selection.confirm(request.change) {
                        return Ok(SelectionUpdate::Refused(err));
                    }
                }
                debug!(change = ?request.change, "chat: selection change confirmed");
                self.after_selection_change().await
            }
        }
    }

    async fn after_selection_change(&self) -> Result<SelectionUpdate, ClientError> {
        let selection = self.inner.lock().await.selection.current().clone();
        self.emit(ClientEvent::SelectionChanged(selection));
        Ok(SelectionUpdate::Applied(self.push_metadata().await?))
    }

    /// Re-sends the current selection if the previous push failed.
    pub async fn retry_metadata_sync(&self) -> Result<Persistence, ClientError> {
        if !self.inner.lock().await.selection.is_unsynced() {
            return Ok(Persistence::Synced);
        }
        self.push_metadata().await
    }

    async fn push_metadata(&self) -> Result<Persistence, ClientError> {
        let (generation, conversation_id, update) = {
            let guard = self.inner.lock().await;
            let Some(conversation_id) = guard.active_server_id() else {
                return Ok(Persistence::LocalOnly);
            };
            (
                guard.load_generation,
                conversation_id,
                guard.selection.current().metadata_update(),
            )
        };

        match self.api.update_metadata(&conversation_id, &update).await {
            Ok(()) => {
                {
                    let mut guard = self.inner.lock().await;
                    if guard.load_generation == generation {
                        guard.selection.mark_synced();
                        guard.sync_active_summary();
                    }
                }
                info!(
                    %conversation_id,
                    conversation_type = ?update.conversation_type,
                    agents = ?update.enabled_agents,
                    "chat: metadata synced"
                );
                self.emit(ClientEvent::MetadataSynced { conversation_id });
                Ok(Persistence::Synced)
            }
            Err(ClientError::Unauthorized) => {
                self.redirect_to_login(true).await;
                Err(ClientError::Unauthorized)
            }
            Err(err) => {
                warn!(%conversation_id, error = %err, "chat: metadata update failed");
                {
                    let mut guard = self.inner.lock().await;
                    if guard.load_generation == generation {
                        guard.selection.mark_unsynced();
                    }
                }
                let error = err.to_string();
                self.emit(ClientEvent::MetadataSyncFailed {
                    conversation_id,
                    error: error.clone(),
                });
                Ok(Persistence::Failed(error))
            }
        }
    }

    /// Sends a user message and returns the reply appended to the
    /// conversation. Backend failures come back as a synthesized AI reply.
    pub async fn send_message(&self, text: &str) -> Result<ChatMessage, ClientError> {
        let query = text.trim();
        if query.is_empty() {
            return Err(ClientError::EmptyMessage);
        }

        let (generation, sent, selection, request, user_message) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            if state.active.is_none() {
                state.load_generation += 1;
                state.selection.reset();
            }
            let selection = state.selection.current().clone();
            let manual_agent = selection.manual_agent();
            let active = state
                .active
                .get_or_insert_with(|| ActiveConversation::draft(None));
            if active.title.is_empty() {
                active.title = title_from_query(query);
            }

            let user_message = local_message(Sender::User, query, None, Vec::new());
            active.messages.push(user_message.clone());
            let request = ChatRequest {
                query: query.to_string(),
                child_id: active.child_id.clone(),
                conversation_id: active.reference.server_id().cloned(),
                manual_agent,
            };
            (
                state.load_generation,
                active.clone(),
                selection,
                request,
                user_message,
            )
        };
        self.emit(ClientEvent::MessageAppended {
            conversation: sent.reference.clone(),
            message: user_message,
        });
        debug!(
            conversation = %sent.reference,
            manual_agent = request.manual_agent.map(AgentKind::id),
            "chat: sending message"
        );

        let result = self.api.send_chat(&request).await;

        let reply = match &result {
            Ok(response) => local_message(
                Sender::Ai,
                response.response.clone(),
                response.agent_display_name(),
                response.references(),
            ),
            Err(err) => {
                warn!(conversation = %sent.reference, error = %err, "chat: send failed");
                local_message(Sender::Ai, CHAT_FAILURE_REPLY, None, Vec::new())
            }
        };

        let (reference, rebound, sync_new_conversation) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let active = match state.active.as_mut() {
                Some(active) if state.load_generation == generation => active,
                _ => {
                    drop(guard);
                    self.settle_background_reply(sent, &selection, &result, &reply).await;
                    if matches!(result, Err(ClientError::Unauthorized)) {
                        self.redirect_to_login(true).await;
                    }
                    return Ok(reply);
                }
            };

            let rebound = bind_reply(active, &result, &reply);
            let mut sync_new_conversation = false;
            if rebound.is_some() {
                state.selection.adopt_default_snapshot();
                sync_new_conversation = state.selection.has_changes();
            }
            let summary = active.summary(state.selection.current());
            let reference = active.reference.clone();
            if let Some(mut summary) = summary {
                summary.updated_at = Some(Utc::now());
                state.upsert_summary(summary);
            }
            (reference, rebound, sync_new_conversation)
        };

        if let Some((local, server)) = rebound {
            info!(%local, %server, "chat: conversation rebound to server id");
            self.emit(ClientEvent::ConversationRebound { local, server });
        }
        self.emit(ClientEvent::MessageAppended {
            conversation: reference,
            message: reply.clone(),
        });

        if matches!(result, Err(ClientError::Unauthorized)) {
            self.redirect_to_login(true).await;
        } else if sync_new_conversation {
            self.push_metadata().await?;
        }
        Ok(reply)
    }

    /// Handles a reply for a conversation the user has since left. The chat
    /// pane is untouched, but a conversation the server just created still
    /// gets its sidebar entry and the routing chosen when the message went out.
    async fn settle_background_reply(
        &self,
        mut conversation: ActiveConversation,
        selection: &AgentSelection,
        result: &Result<ChatResponse, ClientError>,
        reply: &ChatMessage,
    ) {
        debug!(
            conversation = %conversation.reference,
            "chat: reply arrived after leaving conversation"
        );
        self.emit(ClientEvent::StaleResponseDiscarded {
            conversation: conversation.reference.clone(),
        });
        if result.is_err() {
            return;
        }

        let rebound = bind_reply(&mut conversation, result, reply);
        let Some(mut summary) = conversation.summary(selection) else {
            return;
        };
        summary.updated_at = Some(Utc::now());
        let conversation_id = summary.id.clone();
        self.inner.lock().await.upsert_summary(summary);

        let Some((local, server)) = rebound else {
            return;
        };
        info!(%local, %server, "chat: background conversation rebound to server id");
        self.emit(ClientEvent::ConversationRebound { local, server });
        if selection.same_as(&AgentSelection::default()) {
            return;
        }

        let update = selection.metadata_update();
        match self.api.update_metadata(&conversation_id, &update).await {
            Ok(()) => {
                info!(%conversation_id, "chat: background metadata synced");
                self.emit(ClientEvent::MetadataSynced { conversation_id });
            }
            Err(ClientError::Unauthorized) => self.redirect_to_login(true).await,
            Err(err) => {
                warn!(%conversation_id, error = %err, "chat: background metadata update failed");
                self.emit(ClientEvent::MetadataSyncFailed {
                    conversation_id,
                    error: err.to_string(),
                });
            }
        }
    }

    pub async fn sidebar(&self) -> Sidebar {
        let guard = self.inner.lock().await;
        group_conversations(&guard.conversations, &guard.children)
    }

    pub async fn active_conversation(&self) -> Option<ActiveConversation> {
        self.inner.lock().await.active.clone()
    }

    pub async fn selection_status(&self) -> SelectionStatus {
        let guard = self.inner.lock().await;
        SelectionStatus {
            selection: guard.selection.current().clone(),
            dirty: guard.selection.has_changes(),
            unsynced: guard.selection.is_unsynced(),
        }
    }

    pub async fn user(&self) -> Option<UserProfile> {
        self.inner.lock().await.user.clone()
    }

    pub async fn children(&self) -> Vec<ChildSummary> {
        self.inner.lock().await.children.clone()
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.inner.lock().await.conversations.clone()
    }
}

/// Appends the reply and binds a pending conversation to the id the server
/// assigned. A reply naming some other conversation keeps the current id.
fn bind_reply(
    conversation: &mut ActiveConversation,
    result: &Result<ChatResponse, ClientError>,
    reply: &ChatMessage,
) -> Option<(LocalConversationId, ConversationId)> {
    let mut rebound = None;
    if let Ok(response) = result {
        match conversation.reference.rebind(response.conversation_id.clone()) {
            Ok(local) => {
                rebound = local.map(|local| (local, response.conversation_id.clone()));
            }
            Err(err) => warn!(
                error = %err,
                "chat: reply names another conversation; keeping current id"
            ),
        }
    }
    conversation.messages.push(reply.clone());
    rebound
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
