//! Startup helpers for the terminal chat client.
//!
//! Reads the bearer token from `GALAXY_TOKEN` and opens the order thread
//! named by `GALAXY_ORDER_ID`, or the conversation list when it is unset.
//! Lines typed on stdin are sent; lines starting with `/` are commands.
//! `/quit` leaves the token valid, `/logout` also ends it on the backend.

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::chat::{
    AuthService, ChatConfig, ChatError, ChatSession, ConversationId, HttpChatApi, Message,
    OrderId, OutgoingFile, SessionEvent, UserId, WsConnector,
};

const HELP: &str = "commands: /older /read /list /switch <id> /new <subject> | <message> \
                    /attach <path> /files /help /quit /logout";

/// What the input loop does after a line.
enum Flow {
    Continue,
    Quit,
    Logout,
}

/// Run the terminal client (used by the `galaxy-chat` binary).
///
/// # Returns
/// `ExitCode::SUCCESS` on a clean exit, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting Galaxy chat v{}", env!("CARGO_PKG_VERSION"));

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = rt.block_on(run_client()) {
        tracing::error!("Chat client error: {e:#}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

async fn run_client() -> anyhow::Result<()> {
    let config = ChatConfig::from_env().context("invalid GALAXY_* configuration")?;
    let token = std::env::var("GALAXY_TOKEN").context("GALAXY_TOKEN is not set")?;

    let auth_service = AuthService::new(&config.api)?;
    let auth = auth_service
        .validate(&token)
        .await
        .context("token validation failed")?;
    let backend = Arc::new(HttpChatApi::new(&config.api, auth.clone())?);
    let mut session = ChatSession::new(config, auth.clone(), backend, Arc::new(WsConnector))?;

    let opened = match std::env::var("GALAXY_ORDER_ID") {
        Ok(order_id) => {
            let customer = std::env::var("GALAXY_CUSTOMER_ID").ok().map(UserId::new);
            session.open_order(OrderId::new(order_id), customer).await
        }
        Err(_) => session.open_inbox().await,
    };
    match opened {
        Ok(()) => {}
        Err(err @ ChatError::Load(_)) => tracing::warn!("{err}"),
        Err(err) => return Err(err.into()),
    }

    show_conversations(&session)?;
    show_transcript(&session)?;
    say(HELP)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut logout = false;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match handle_line(&mut session, line.trim()).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => break,
                    Ok(Flow::Logout) => {
                        logout = true;
                        break;
                    }
                    Err(err) => say(&describe_error(&err))?,
                }
            }
            event = session.next_event() => {
                let Some(event) = event else { break };
                if !show_event(&session, &event)? {
                    break;
                }
            }
        }
    }

    session.close().await;
    if logout {
        auth_service.logout(auth).await;
        say("-- logged out")?;
    }
    Ok(())
}

async fn handle_line(session: &mut ChatSession, line: &str) -> anyhow::Result<Flow> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "/quit" => return Ok(Flow::Quit),
        "/logout" => return Ok(Flow::Logout),
        "/help" => say(HELP)?,
        "/older" => match session.load_older().await? {
            Some(count) => {
                say(&format!("-- {count} older message(s)"))?;
                show_transcript(session)?;
            }
            None => say("-- no older messages")?,
        },
        "/read" => session.mark_all_read().await?,
        "/list" => show_conversations(session)?,
        "/switch" => {
            session.switch(&ConversationId::new(rest.trim())).await?;
            show_transcript(session)?;
        }
        "/new" => {
            let Some((subject, message)) = rest.split_once('|') else {
                bail!("usage: /new <subject> | <message>");
            };
            let id = session.create_conversation(subject, message).await?;
            say(&format!("-- opened {id}"))?;
            show_transcript(session)?;
        }
        "/attach" => {
            let mut files = session.selected_files().to_vec();
            files.push(read_file(Path::new(rest.trim())).await?);
            session.select_files(files)?;
            say(&format!("-- {} file(s) selected", session.selected_files().len()))?;
        }
        "/files" => {
            for file in session.selected_files() {
                say(&format!("   {} ({} bytes)", file.filename, file.size()))?;
            }
        }
        _ if command.starts_with('/') => say(&format!("unknown command {command}; {HELP}"))?,
        _ => {
            session.set_draft(line).await;
            let result = session.send().await;
            if let Some(last) = session.messages().last() {
                say(&format_message(last))?;
            }
            result?;
        }
    }
    Ok(Flow::Continue)
}

fn describe_error(err: &anyhow::Error) -> String {
    let retryable = err
        .downcast_ref::<ChatError>()
        .is_some_and(ChatError::is_retryable);
    if retryable {
        format!("! {err:#} (try again)")
    } else {
        format!("! {err:#}")
    }
}

/// Returns `false` when the session cannot go on.
fn show_event(session: &ChatSession, event: &SessionEvent) -> anyhow::Result<bool> {
    match event {
        SessionEvent::Connected => say("-- connected")?,
        SessionEvent::Reconnected { attempt } => {
            say(&format!("-- reconnected after {attempt} attempt(s)"))?;
        }
        SessionEvent::ConnectError(reason) => say(&format!("-- connection error: {reason}"))?,
        SessionEvent::Disconnected { reason, gave_up } => {
            say(&format!("-- disconnected: {reason}"))?;
            if *gave_up {
                return Ok(false);
            }
        }
        SessionEvent::AuthFailed(reason) => {
            say(&format!("-- authentication failed: {reason}"))?;
            return Ok(false);
        }
        SessionEvent::Message { id, in_active } => {
            if *in_active {
                if let Some(message) = session.messages().iter().find(|m| &m.id == id) {
                    say(&format_message(message))?;
                }
            } else {
                say("-- new message in another conversation (/list)")?;
            }
        }
        SessionEvent::RemoteTyping => {
            let typists: Vec<_> = session.remote_typing().users().map(UserId::as_str).collect();
            if !typists.is_empty() {
                say(&format!("-- {} typing...", typists.join(", ")))?;
            }
        }
        SessionEvent::Status { .. } | SessionEvent::TypingStopped => {}
    }
    Ok(true)
}

fn show_conversations(session: &ChatSession) -> anyhow::Result<()> {
    let active = session.active_conversation().map(|c| c.id.clone());
    for conversation in session.conversations() {
        let marker = if Some(&conversation.id) == active.as_ref() { '*' } else { ' ' };
        let title = conversation
            .subject()
            .map(str::to_string)
            .or_else(|| conversation.order_id().map(|o| format!("order {o}")))
            .unwrap_or_default();
        let preview = conversation
            .last_message
            .as_ref()
            .map(|p| p.content.as_str())
            .unwrap_or_default();
        say(&format!("{marker} {} {title}: {preview}", conversation.id))?;
    }
    Ok(())
}

fn show_transcript(session: &ChatSession) -> anyhow::Result<()> {
    if session.has_more_history() {
        say("-- /older for earlier messages")?;
    }
    for message in session.messages() {
        say(&format_message(message))?;
    }
    Ok(())
}

fn format_message(message: &Message) -> String {
    let pending = if message.is_pending() { " (sending)" } else { "" };
    let files: String = message
        .attachments
        .iter()
        .map(|a| format!(" [{}]", a.filename))
        .collect();
    format!(
        "[{}] {}{pending}: {}{files}",
        message.timestamp.format("%H:%M"),
        message.sender,
        message.content
    )
}

async fn read_file(path: &Path) -> anyhow::Result<OutgoingFile> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("path has no file name")?;
    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    };
    Ok(OutgoingFile::new(filename, content_type, bytes))
}

fn say(line: &str) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "{line}")?;
    Ok(())
}
