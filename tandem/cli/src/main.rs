//! Tandem - Terminal Chat Client
//!
//! A line-oriented REPL over `tandem-core`. Lines without a leading `/` are
//! sent as turns; responses print as they stream. In dual mode both models
//! answer and `/pick a|b` keeps one of them.
//!
//! # Usage
//!
//! ```bash
//! # Defaults from ~/.config/tandem/client.toml and the environment
//! tandem
//!
//! # Two models per turn
//! tandem --dual --second-model llama3.2
//!
//! # Resume a conversation
//! tandem --conversation 8f14e45f
//!
//! # Verbose logging (stderr)
//! RUST_LOG=debug tandem
//! ```

mod commands;
mod render;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tandem_core::{
    default_config_path, load_config_from_path, ConfigOverrides, ConversationId, Session,
    SessionError, SessionNotice, StoreChange,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use commands::Command;
use render::Renderer;

/// Tandem - chat with one or two models at once
#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "TANDEM_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Chat server base URL
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// Bearer token for the chat server
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,

    /// Model for new conversations
    #[arg(short = 'm', long, value_name = "NAME")]
    model: Option<String>,

    /// Second model for dual mode
    #[arg(long, value_name = "NAME")]
    second_model: Option<String>,

    /// Start in dual mode
    #[arg(short = 'd', long)]
    dual: bool,

    /// Open this conversation instead of starting a new one
    #[arg(long, value_name = "ID")]
    conversation: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "TANDEM_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(url) = &self.base_url {
            overrides = overrides.with_base_url(url);
        }
        if let Some(token) = &self.token {
            overrides = overrides.with_token(token);
        }
        if let Some(model) = &self.model {
            overrides = overrides.with_default_model(model);
        }
        if let Some(model) = &self.second_model {
            overrides = overrides.with_second_model(model);
        }
        if self.dual {
            overrides = overrides.with_dual(true);
        }
        overrides
    }
}

/// Logs go to stderr so they never interleave with the transcript
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("tandem={level},tandem_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

enum Input {
    Line(Option<String>),
    Update,
    Interrupt,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path)
        .await
        .context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        base_url = %config.server.base_url,
        source = ?config.source(),
        "Starting tandem"
    );

    let mut session = Session::connect(&config).context("Failed to create HTTP client")?;
    let mut changes = session.subscribe();
    let mut out = Renderer::new();

    if let Some(id) = &args.conversation {
        session
            .open_conversation(&ConversationId(id.clone()))
            .await
            .with_context(|| format!("Failed to open conversation {id}"))?;
    }

    out.line("tandem: type a message, or /help for commands").await?;
    out.drain(&session, &mut changes).await?;
    out.prompt().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line?),
            _ = session.next_update(), if session.has_pending_work() => Input::Update,
            _ = tokio::signal::ctrl_c() => Input::Interrupt,
        };

        match input {
            Input::Line(None) => {
                session.run_until_idle().await;
                flush(&mut out, &mut session, &mut changes).await?;
                break;
            }
            Input::Line(Some(line)) => {
                if line.trim().is_empty() {
                    out.prompt().await?;
                    continue;
                }
                match commands::parse(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => run(command, &mut session, &mut out).await?,
                    Err(usage) => out.line(&usage).await?,
                }
                flush(&mut out, &mut session, &mut changes).await?;
                if !session.is_streaming() {
                    out.prompt().await?;
                }
            }
            Input::Update => {
                let finished = flush(&mut out, &mut session, &mut changes).await?;
                if finished && !session.is_streaming() {
                    out.prompt().await?;
                }
            }
            Input::Interrupt => {
                out.line("").await?;
                break;
            }
        }
    }

    info!("Shutting down");
    Ok(())
}

/// Print pending changes and notices; returns whether a turn just finished
async fn flush(
    out: &mut Renderer,
    session: &mut Session,
    changes: &mut mpsc::UnboundedReceiver<StoreChange>,
) -> std::io::Result<bool> {
    out.drain(session, changes).await?;
    let mut finished = false;
    for notice in session.take_notices() {
        finished |= matches!(notice, SessionNotice::TurnFinished { .. });
        out.notice(&notice).await?;
    }
    Ok(finished)
}

/// Execute one command; failures are reported inline and never end the REPL
async fn run(command: Command, session: &mut Session, out: &mut Renderer) -> Result<()> {
    match execute(command, session).await {
        Ok(Some(status)) => out.line(&status).await?,
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "Command failed");
            out.line(&format!("! {e}")).await?;
        }
    }
    Ok(())
}

async fn execute(command: Command, session: &mut Session) -> Result<Option<String>, SessionError> {
    match command {
        Command::Submit(text) => {
            submit(session, &text).await?;
            Ok(None)
        }
        Command::Dual(model) => {
            let mode = session.switch_mode(true, model.as_deref())?;
            Ok(Some(format!(
                "(dual mode with {})",
                mode.second_model().unwrap_or("second model")
            )))
        }
        Command::Single => {
            session.switch_mode(false, None)?;
            Ok(Some("(single mode)".to_string()))
        }
        Command::Pick(side) => {
            session.select_last(side)?;
            Ok(None)
        }
        Command::New(title) => {
            let conversation = session.new_conversation(title.as_deref(), None).await?;
            Ok(Some(format!(
                "(new conversation {}: {})",
                conversation.id, conversation.title
            )))
        }
        Command::Open(id) => {
            session.open_conversation(&id).await?;
            Ok(None)
        }
        Command::List => {
            let list = session.list_conversations().await?;
            Ok(Some(render::conversations(&list)))
        }
        Command::Models => {
            let models = session.list_models().await?;
            let current = session.conversation().map(|c| c.model.as_str());
            Ok(Some(render::models(&models, current)))
        }
        Command::Model(name) => {
            session.change_model(&name).await?;
            Ok(Some(format!("(model: {name})")))
        }
        Command::Delete => {
            let id = session.delete_current().await?;
            Ok(Some(format!("(deleted {id})")))
        }
        Command::Status => Ok(Some(render::status(session))),
        Command::Help => Ok(Some(commands::HELP.to_string())),
        Command::Quit => Ok(None),
    }
}

/// Send a turn, creating a conversation first if none is open
async fn submit(session: &mut Session, text: &str) -> Result<(), SessionError> {
    match session.submit(text) {
        Err(SessionError::NoConversation) => {
            session.new_conversation(None, None).await?;
            session.submit(text)?;
        }
        other => {
            other?;
        }
    }
    Ok(())
}
