mod config;

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Args as ClapArgs, Parser, Subcommand};
use client_core::{
    ChatClient, ClientError, ClientEvent, ConfirmationPrompt, ConfirmationRequest,
    FileSessionStore, HttpApi, Persistence, SelectionChange, SelectionUpdate, SessionContext,
    Sidebar,
};
use shared::{
    domain::{AgentKind, ChildId, ConversationId, Sender},
    protocol::{ChatMessage, ConversationSummary},
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin},
    sync::Mutex,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{load_settings, normalize_base_url};

#[derive(Parser, Debug)]
#[command(name = "parenzing", about = "Terminal client for the ParenZing parenting assistant")]
struct Args {
    /// Backend base url; overrides config file and environment.
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    session_file: Option<PathBuf>,
    /// Accept routing confirmations without asking.
    #[arg(short = 'y', long, global = true)]
    yes: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Whoami,
    Login {
        #[arg(long)]
        token: String,
        #[arg(long)]
        email: Option<String>,
    },
    Logout,
    Conversations,
    Show {
        id: String,
    },
    Chat(ChatArgs),
    Agents(AgentsArgs),
}

#[derive(ClapArgs, Debug)]
struct ChatArgs {
    /// Continue an existing conversation instead of starting a new one.
    #[arg(long)]
    conversation: Option<String>,
    #[arg(long)]
    child: Option<String>,
    /// Restrict routing to these agents (id or display name).
    #[arg(long = "agent")]
    agents: Vec<AgentKind>,
    #[arg(long)]
    manual: bool,
    #[arg(required = true, trailing_var_arg = true)]
    text: Vec<String>,
}

#[derive(ClapArgs, Debug)]
struct AgentsArgs {
    id: String,
    #[arg(long, conflicts_with = "manual")]
    auto: bool,
    #[arg(long)]
    manual: bool,
    #[arg(long)]
    enable: Vec<AgentKind>,
    #[arg(long)]
    disable: Vec<AgentKind>,
}

/// Asks on the terminal. One reader is kept for the whole run so answers
/// piped in ahead of time are not lost between prompts.
struct StdinPrompt<R = BufReader<Stdin>> {
    input: Mutex<R>,
}

impl StdinPrompt {
    fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> StdinPrompt<R> {
    fn new(input: R) -> Self {
        Self {
            input: Mutex::new(input),
        }
    }
}

#[async_trait]
impl<R> ConfirmationPrompt for StdinPrompt<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn confirm(&self, request: &ConfirmationRequest) -> bool {
        let question = format!("{}\n{}\n[y/N] ", request.title, request.message);
        let mut stdout = tokio::io::stdout();
        if stdout.write_all(question.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            return false;
        }

        let mut answer = String::new();
        match self.input.lock().await.read_line(&mut answer).await {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(err) => {
                warn!(error = %err, "cli: failed to read confirmation");
                false
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(api_url) = &args.api_url {
        settings.api_base_url = normalize_base_url(api_url)?;
    }
    if let Some(session_file) = &args.session_file {
        settings.session_path = session_file.clone();
    }
    debug!(api = %settings.api_base_url, session = %settings.session_path.display(), "cli: settings loaded");

    let session = Arc::new(
        SessionContext::open(FileSessionStore::new(settings.session_path.clone()))
            .with_context(|| format!("failed to open session '{}'", settings.session_path.display()))?,
    );

    match args.command {
        Command::Login { token, email } => {
            session.set_auth_token(Some(token)).await?;
            session.set_user_email(email).await?;
            println!("Session saved to {}", settings.session_path.display());
            return Ok(());
        }
        Command::Logout => {
            session.invalidate().await?;
            println!("Signed out");
            return Ok(());
        }
        _ => {}
    }

    let api = HttpApi::new(&settings.api_base_url, session.clone(), settings.request_timeout())?;
    let prompt: Arc<dyn ConfirmationPrompt> = if args.yes {
        Arc::new(client_core::AutoApprove)
    } else {
        Arc::new(StdinPrompt::stdin())
    };
    let client = ChatClient::new_with_prompt(Arc::new(api), session, prompt);
    spawn_event_logger(&client);

    match client.bootstrap().await {
        Ok(_) => {}
        Err(ClientError::Unauthorized) => {
            bail!("not signed in; run `parenzing login --token <TOKEN>` first")
        }
        Err(err) => return Err(err).context("failed to load account"),
    }

    match args.command {
        Command::Whoami => whoami(&client).await,
        Command::Conversations => {
            print_sidebar(&client.sidebar().await);
            Ok(())
        }
        Command::Show { id } => show(&client, ConversationId::new(id)).await,
        Command::Chat(chat_args) => chat(&client, chat_args).await,
        Command::Agents(agents_args) => agents(&client, agents_args).await,
        Command::Login { .. } | Command::Logout => Ok(()),
    }
}

fn spawn_event_logger(client: &Arc<ChatClient>) {
    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::MetadataSyncFailed {
                    conversation_id,
                    error,
                } => warn!(%conversation_id, %error, "cli: routing not saved"),
                ClientEvent::RedirectToLogin => warn!("cli: session rejected by backend"),
                other => debug!(event = ?other, "cli: event"),
            }
        }
    });
}

async fn whoami(client: &ChatClient) -> Result<()> {
    let user = client.user().await.context("no user after bootstrap")?;
    let name = user.name.as_deref().unwrap_or("(no name)");
    let email = user.email.as_deref().unwrap_or("(no email)");
    println!("{name} <{email}>");
    if let Some(id) = &user.id {
        println!("id: {id}");
    }
    println!(
        "{} children, {} conversations",
        client.children().await.len(),
        client.conversations().await.len()
    );
    Ok(())
}

async fn show(client: &ChatClient, id: ConversationId) -> Result<()> {
    let conversation = client.open_conversation(&id).await?;
    println!("# {} [{}]", display_title(&conversation.title), conversation.reference);
    print_routing(client).await;
    println!();
    for message in &conversation.messages {
        print_message(message);
    }
    Ok(())
}

async fn chat(client: &ChatClient, args: ChatArgs) -> Result<()> {
    match &args.conversation {
        Some(id) => {
            client.open_conversation(&ConversationId::new(id.as_str())).await?;
        }
        None => {
            client.new_chat(args.child.map(ChildId::new)).await;
        }
    }

    if args.manual || !args.agents.is_empty() {
        let agents = if args.agents.is_empty() {
            AgentKind::ALL.to_vec()
        } else {
            args.agents.clone()
        };
        if !route_to(client, Some(false), &agents, &complement(&agents)).await? {
            println!("Routing unchanged; message not sent");
            return Ok(());
        }
    }

    let reply = client.send_message(&args.text.join(" ")).await?;
    print_message(&reply);
    if let Some(active) = client.active_conversation().await {
        debug!(conversation = %active.reference, "cli: reply received");
    }
    Ok(())
}

async fn agents(client: &ChatClient, args: AgentsArgs) -> Result<()> {
    client.open_conversation(&ConversationId::new(args.id)).await?;

    let auto_mode = match (args.auto, args.manual) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    };
    route_to(client, auto_mode, &args.enable, &args.disable).await?;

    if client.selection_status().await.unsynced {
        match client.retry_metadata_sync().await? {
            Persistence::Failed(error) => warn!(%error, "cli: routing still not saved"),
            other => debug!(?other, "cli: retried routing sync"),
        }
    }
    print_routing(client).await;
    Ok(())
}

/// Applies a routing change step by step. Returns false when the user
/// declined a confirmation.
async fn route_to(
    client: &ChatClient,
    auto_mode: Option<bool>,
    enable: &[AgentKind],
    disable: &[AgentKind],
) -> Result<bool> {
    let mut changes = Vec::new();
    if let Some(auto_mode) = auto_mode {
        changes.push(SelectionChange::SetAutoMode(auto_mode));
    }
    changes.extend(enable.iter().map(|&agent| SelectionChange::SetAgentEnabled {
        agent,
        enabled: true,
    }));
    changes.extend(disable.iter().map(|&agent| SelectionChange::SetAgentEnabled {
        agent,
        enabled: false,
    }));

    for change in changes {
        if is_noop(&client.selection_status().await.selection, change) {
            continue;
        }
        match client.request_change(change).await? {
            SelectionUpdate::Applied(Persistence::Failed(error)) => {
                eprintln!("warning: routing change kept locally but not saved: {error}");
            }
            SelectionUpdate::Applied(_) => {}
            SelectionUpdate::Declined => return Ok(false),
            SelectionUpdate::Refused(err) => eprintln!("warning: {err}"),
        }
    }
    Ok(true)
}

fn is_noop(selection: &client_core::AgentSelection, change: SelectionChange) -> bool {
    match change {
        SelectionChange::SetAutoMode(auto_mode) => selection.auto_mode() == auto_mode,
        SelectionChange::SetAgentEnabled { agent, enabled } => {
            selection.is_enabled(agent) == enabled
        }
    }
}

fn complement(agents: &[AgentKind]) -> Vec<AgentKind> {
    AgentKind::ALL
        .iter()
        .copied()
        .filter(|agent| !agents.contains(agent))
        .collect()
}

async fn print_routing(client: &ChatClient) {
    let status = client.selection_status().await;
    let selection = &status.selection;
    if selection.auto_mode() {
        println!("routing: auto");
    } else {
        let names: Vec<&str> = selection
            .enabled_agents()
            .iter()
            .map(|agent| agent.display_name())
            .collect();
        println!("routing: manual ({})", names.join(", "));
    }
    if status.unsynced {
        println!("routing: not saved to server");
    }
}

fn print_sidebar(sidebar: &Sidebar) {
    println!("General");
    print_conversations(&sidebar.general);
    for group in &sidebar.by_child {
        println!("{} ({})", display_title(&group.child.name), group.child.id);
        print_conversations(&group.conversations);
    }
}

fn print_conversations(conversations: &[ConversationSummary]) {
    if conversations.is_empty() {
        println!("  (none)");
    }
    for conversation in conversations {
        let updated = conversation
            .updated_at
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "  {:>6}  {:<16}  {}",
            conversation.id.as_str(),
            updated,
            display_title(&conversation.title)
        );
    }
}

fn print_message(message: &ChatMessage) {
    let who = match message.sender {
        Sender::User => "You".to_string(),
        Sender::Ai => message
            .agent
            .as_deref()
            .map(|agent| {
                AgentKind::lookup(agent)
                    .map(|kind| kind.display_name().to_string())
                    .unwrap_or_else(|| agent.to_string())
            })
            .unwrap_or_else(|| "ParenZing".to_string()),
    };
    println!("{who}: {}", message.content);
    if !message.references.is_empty() {
        println!("  sources: {}", message.references.join("; "));
    }
}

fn display_title(title: &str) -> &str {
    if title.trim().is_empty() {
        "Untitled"
    } else {
        title
    }
}

#[cfg(test)]
mod tests {
    use client_core::AgentSelection;

    use super::*;

    #[test]
    fn complement_keeps_table_order() {
        assert_eq!(
            complement(&[AgentKind::ChildDevelopment]),
            vec![
                AgentKind::ParentingStyle,
                AgentKind::CrisisIntervention,
                AgentKind::CommunityConnector
            ]
        );
        assert!(complement(&AgentKind::ALL).is_empty());
    }

    #[test]
    fn skips_changes_that_match_current_routing() {
        let auto = AgentSelection::default();
        assert!(is_noop(&auto, SelectionChange::SetAutoMode(true)));
        assert!(!is_noop(&auto, SelectionChange::SetAutoMode(false)));

        let manual = AgentSelection::manual([AgentKind::CrisisIntervention]);
        assert!(is_noop(
            &manual,
            SelectionChange::SetAgentEnabled {
                agent: AgentKind::CrisisIntervention,
                enabled: true,
            }
        ));
        assert!(!is_noop(
            &manual,
            SelectionChange::SetAgentEnabled {
                agent: AgentKind::ParentingStyle,
                enabled: true,
            }
        ));
    }

    #[tokio::test]
    async fn piped_answers_are_read_one_per_prompt() {
        let prompt = StdinPrompt::new(BufReader::new(&b"y\nno\nYes\n"[..]));
        let request = SelectionChange::SetAutoMode(true).confirmation();

        assert!(prompt.confirm(&request).await);
        assert!(!prompt.confirm(&request).await);
        assert!(prompt.confirm(&request).await);
        assert!(!prompt.confirm(&request).await);
    }

    #[test]
    fn parses_chat_command_with_agent_names() {
        let args = Args::try_parse_from([
            "parenzing",
            "chat",
            "--agent",
            "crisis-intervention",
            "--agent",
            "Community Connector",
            "how",
            "do",
            "I",
            "help?",
        ])
        .expect("parse");
        match args.command {
            Command::Chat(chat) => {
                assert_eq!(
                    chat.agents,
                    vec![AgentKind::CrisisIntervention, AgentKind::CommunityConnector]
                );
                assert_eq!(chat.text.join(" "), "how do I help?");
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(Args::try_parse_from(["parenzing", "agents", "12", "--auto", "--manual"]).is_err());
    }
}
