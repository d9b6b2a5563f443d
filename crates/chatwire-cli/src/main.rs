//! # chatwire
//!
//! Command-line client for the chatwire realtime engine: tail live events,
//! send a message, list online users or conversations, or page through
//! history.

#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chatwire_core::{EventPayload, InboundEvent, Message, MessageId, UserId, init_subscriber};
use chatwire_realtime::{
    AuthFailureHook, ConnectionState, HttpChatApi, RealtimeSession, SessionDeps, StaticToken,
    TokenProvider,
};
use chatwire_settings::ChatwireSettings;
use clap::{Parser, Subcommand};
use tokio::sync::{Notify, broadcast};

/// How long `send` waits for the socket and then for the server echo.
const SEND_WAIT: Duration = Duration::from_secs(10);

/// Chatwire realtime client.
#[derive(Parser, Debug)]
#[command(name = "chatwire", about = "Chatwire realtime client")]
struct Cli {
    /// Auth token for the socket, stream and REST endpoints.
    #[arg(long, env = "CHATWIRE_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Override the REST base URL from settings.
    #[arg(long, global = true)]
    api_base_url: Option<String>,

    /// Override the socket URL from settings.
    #[arg(long, global = true)]
    socket_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect both channels and print every inbound event until ctrl-c.
    Watch {
        /// Local user id.
        #[arg(long)]
        user_id: i64,
    },
    /// Send one message and wait for the server to confirm it.
    Send {
        /// Local user id.
        #[arg(long)]
        user_id: i64,
        /// Recipient user id.
        #[arg(long)]
        to: i64,
        /// Message text.
        body: String,
    },
    /// Print the ids of users currently online.
    Online,
    /// Print conversation summaries, most recent first.
    Conversations,
    /// Print one page of history with a peer.
    History {
        /// Peer user id.
        #[arg(long)]
        peer: i64,
        /// Page number, starting at 1.
        #[arg(long, default_value = "1")]
        page: u32,
    },
}

impl Cli {
    fn apply_overrides(&self, settings: &mut ChatwireSettings) {
        if let Some(url) = &self.api_base_url {
            settings.server.api_base_url.clone_from(url);
        }
        if let Some(url) = &self.socket_url {
            settings.server.socket_url.clone_from(url);
        }
    }

    fn tokens(&self) -> Arc<dyn TokenProvider> {
        match &self.token {
            Some(token) => Arc::new(StaticToken::new(token.clone())),
            None => Arc::new(StaticToken::none()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = chatwire_settings::load_settings().context("Failed to load settings")?;
    cli.apply_overrides(&mut settings);
    chatwire_settings::validate(&settings).context("Invalid settings")?;

    init_subscriber(&settings.logging.level, settings.logging.json);

    match &cli.command {
        Command::Watch { user_id } => watch(&settings, cli.tokens(), UserId::new(*user_id)).await,
        Command::Send { user_id, to, body } => {
            send(&settings, cli.tokens(), UserId::new(*user_id), UserId::new(*to), body).await
        }
        Command::Online => online(&settings, cli.tokens()).await,
        Command::Conversations => conversations(&settings, cli.tokens()).await,
        Command::History { peer, page } => {
            history(&settings, cli.tokens(), UserId::new(*peer), *page).await
        }
    }
}

fn start_session(
    settings: &ChatwireSettings,
    tokens: Arc<dyn TokenProvider>,
    self_id: UserId,
) -> Result<(RealtimeSession, Arc<Notify>)> {
    let rejected = Arc::new(Notify::new());
    let hook: AuthFailureHook = {
        let rejected = Arc::clone(&rejected);
        Arc::new(move || rejected.notify_one())
    };
    let deps = SessionDeps::live(&settings.server, tokens, Some(hook))
        .context("Failed to build HTTP client")?;
    Ok((RealtimeSession::start(settings, self_id, deps, true), rejected))
}

async fn watch(
    settings: &ChatwireSettings,
    tokens: Arc<dyn TokenProvider>,
    self_id: UserId,
) -> Result<()> {
    let api = HttpChatApi::new(settings.server.api_base_url.clone(), Arc::clone(&tokens))
        .context("Failed to build HTTP client")?;
    let (session, rejected) = start_session(settings, tokens, self_id)?;
    let mut events = session.dispatcher().subscribe();
    let mut state = session.connection().subscribe_state();
    match api.conversations().await {
        Ok(rows) => session.upsert_conversations(rows),
        Err(err) => tracing::warn!(error = %err, "conversation list unavailable"),
    }
    tracing::info!(
        user = %self_id,
        conversations = session.conversations().len(),
        "watching, ctrl-c to stop"
    );

    let outcome = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                break signal.context("Failed to listen for ctrl-c");
            }
            () = rejected.notified() => {
                break Err(anyhow::anyhow!("server rejected the auth token"));
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = *state.borrow_and_update();
                eprintln!("[{}]", indicator_label(current));
            }
            received = events.recv() => match received {
                Ok(event) => println!("{}", describe(&event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event printer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };

    tracing::info!("Shutting down...");
    session.shutdown();
    outcome
}

async fn send(
    settings: &ChatwireSettings,
    tokens: Arc<dyn TokenProvider>,
    self_id: UserId,
    peer: UserId,
    body: &str,
) -> Result<()> {
    let (session, rejected) = start_session(settings, tokens, self_id)?;
    let mut events = session.dispatcher().subscribe();
    let mut state = session.connection().subscribe_state();

    let opened = tokio::time::timeout(SEND_WAIT, async {
        tokio::select! {
            () = rejected.notified() => false,
            result = state.wait_for(|s| *s == ConnectionState::Open) => result.is_ok(),
        }
    })
    .await;
    if !matches!(opened, Ok(true)) {
        let indicator = session.indicator();
        session.shutdown();
        bail!("socket did not open: {indicator:?}");
    }

    let receipt = session.send_message(peer, body);
    if !receipt.sent {
        let _ = session.discard_pending(&receipt.pending);
        session.shutdown();
        bail!("socket closed before the message could be sent");
    }

    let confirmed = tokio::time::timeout(SEND_WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(id) = echo_of(&event, self_id, peer) {
                        return Some(id);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;

    if !matches!(confirmed, Ok(Some(_))) {
        let _ = session.discard_pending(&receipt.pending);
    }
    session.shutdown();
    match confirmed {
        Ok(Some(id)) => {
            println!("sent {id} (was {})", receipt.pending);
            Ok(())
        }
        _ => bail!("no confirmation for {} within {SEND_WAIT:?}", receipt.pending),
    }
}

async fn online(settings: &ChatwireSettings, tokens: Arc<dyn TokenProvider>) -> Result<()> {
    let api = HttpChatApi::new(settings.server.api_base_url.clone(), tokens)
        .context("Failed to build HTTP client")?;
    let ids = api
        .online_user_ids()
        .await
        .context("Failed to fetch online users")?;
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

async fn conversations(settings: &ChatwireSettings, tokens: Arc<dyn TokenProvider>) -> Result<()> {
    let api = HttpChatApi::new(settings.server.api_base_url.clone(), tokens)
        .context("Failed to build HTTP client")?;
    let rows = api
        .conversations()
        .await
        .context("Failed to fetch conversations")?;
    for row in &rows {
        let at = row
            .last_message_at
            .map_or_else(|| "-".to_owned(), |at| at.format("%Y-%m-%d %H:%M:%S").to_string());
        println!(
            "{} {at} unread={} {}",
            row.other_user_id, row.unread_count, row.last_message_preview
        );
    }
    Ok(())
}

async fn history(
    settings: &ChatwireSettings,
    tokens: Arc<dyn TokenProvider>,
    peer: UserId,
    page: u32,
) -> Result<()> {
    let api = HttpChatApi::new(settings.server.api_base_url.clone(), tokens)
        .context("Failed to build HTTP client")?;
    let page = api
        .conversation_messages(peer, page)
        .await
        .with_context(|| format!("Failed to fetch history with {peer}"))?;
    for message in &page.results {
        println!("{}", describe_message(message));
    }
    if page.next.is_some() {
        eprintln!("(more pages available)");
    }
    Ok(())
}

/// Server id of a confirmed message `self_id` sent to `peer`.
fn echo_of(event: &InboundEvent, self_id: UserId, peer: UserId) -> Option<MessageId> {
    match &event.payload {
        EventPayload::MessageSent(message) | EventPayload::Message(message)
            if message.sender_id == self_id && message.receiver_id == peer =>
        {
            message.confirmed_id()
        }
        _ => None,
    }
}

fn indicator_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Idle => "idle",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Open => "connected",
        ConnectionState::Reconnecting => "reconnecting",
        ConnectionState::Closed => "disconnected",
    }
}

fn describe_message(message: &Message) -> String {
    let id = message
        .confirmed_id()
        .map_or_else(|| "pending".to_owned(), |id| id.to_string());
    format!(
        "{} #{id} {} -> {}: {}",
        message.timestamp.format("%Y-%m-%d %H:%M:%S"),
        message.sender_id,
        message.receiver_id,
        message.preview()
    )
}

fn describe(event: &InboundEvent) -> String {
    let detail = match &event.payload {
        EventPayload::Message(message) | EventPayload::MessageSent(message) => {
            describe_message(message)
        }
        EventPayload::Typing(typing) => format!(
            "{} {}",
            typing.sender_id,
            if typing.is_typing { "is typing" } else { "stopped typing" }
        ),
        EventPayload::ReadReceipt(receipt) if receipt.message_ids.is_empty() => {
            format!("{} read everything", receipt.reader_id)
        }
        EventPayload::ReadReceipt(receipt) => {
            format!("{} read {} message(s)", receipt.reader_id, receipt.message_ids.len())
        }
        EventPayload::ServerError { message } => format!("server error: {message}"),
        EventPayload::Notification(value)
        | EventPayload::Connected(value)
        | EventPayload::Heartbeat(value)
        | EventPayload::Disconnected(value)
        | EventPayload::Other(value) => serde_json::to_string(value).unwrap_or_default(),
    };
    format!("{:?} {}: {detail}", event.channel, event.discriminator)
}
