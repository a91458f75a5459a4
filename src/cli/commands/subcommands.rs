use super::ConfigCommands;
use crate::agent::embeddings::embedder_from_config;
use crate::agent::{ConversationOrchestrator, OrchestratorConfig};
use crate::channels::{ConsoleTransport, InboundMessage, OutboundMessage, Transport};
use crate::config::{Config, load_config};
use crate::errors::RuntimeError;
use crate::providers::openai::OpenAIProvider;
use crate::session::InMemorySessionStore;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const PARTICIPANT: &str = "local";
const CHANNEL: &str = "cli";
const ANNOUNCE_GRACE: Duration = Duration::from_secs(5);

pub(super) async fn chat(
    config_path: Option<&Path>,
    message: Option<String>,
    session: String,
) -> Result<()> {
    let config = load_config(config_path)?;
    if config.provider.api_key.is_empty() {
        warn!("provider.apiKey is empty; set it in the config or PARLANCE_API_KEY");
    }
    let provider = Arc::new(OpenAIProvider::from_config(
        &config.provider,
        &config.agent.model,
    ));
    let transport: Arc<dyn Transport> = Arc::new(ConsoleTransport::stdout());
    let embedder = embedder_from_config(&config.context.dedup);
    let mut deps = OrchestratorConfig::new(
        config,
        provider,
        Arc::clone(&transport),
        Arc::new(InMemorySessionStore::new()),
    );
    deps.embedder = embedder;
    let orchestrator = ConversationOrchestrator::new(deps).await?;

    if let Some(msg) = message {
        let reply = orchestrator
            .handle_turn(&InboundMessage::new(&session, PARTICIPANT, CHANNEL, msg))
            .await?;
        deliver(transport.as_ref(), &session, reply).await?;
        settle_subagents(&orchestrator).await;
    } else {
        interactive_repl(&orchestrator, transport.as_ref(), &session, config_path).await?;
    }

    Ok(())
}

/// Let background runs started by a one-shot message finish and announce
/// before the process exits.
async fn settle_subagents(orchestrator: &ConversationOrchestrator) {
    let scheduler = orchestrator.scheduler();
    let active = scheduler.active();
    if active == 0 {
        return;
    }
    let limit = Duration::from_secs(orchestrator.config().subagents.timeout_secs) + ANNOUNCE_GRACE;
    info!("waiting up to {:?} for {} background subagent run(s)", limit, active);
    if !scheduler.wait_idle(limit).await {
        warn!(
            "{} subagent run(s) still unfinished after {:?}, exiting",
            scheduler.active(),
            limit
        );
    }
}

async fn deliver(transport: &dyn Transport, session: &str, reply: Option<String>) -> Result<()> {
    match reply {
        Some(text) => transport.send(&OutboundMessage::new(session, text)).await,
        // streamed replies end without a newline
        None => transport.send(&OutboundMessage::new(session, "")).await,
    }
}

fn reload(orchestrator: &ConversationOrchestrator, config_path: Option<&Path>) -> String {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => return format!("Reload failed: {:#}", e),
    };
    match orchestrator.reload_config(config) {
        Ok(()) => "Configuration reloaded.".to_string(),
        Err(RuntimeError::ConfigReloadNoop) => "Configuration unchanged.".to_string(),
        Err(e) => format!("Reload failed: {}", e),
    }
}

#[cfg(unix)]
async fn hangup(signal: &mut Option<tokio::signal::unix::Signal>) {
    match signal {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn interactive_repl(
    orchestrator: &ConversationOrchestrator,
    transport: &dyn Transport,
    session: &str,
    config_path: Option<&Path>,
) -> Result<()> {
    println!("Interactive mode. /reload re-reads the config, /quit or Ctrl+D exits.\n");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    #[cfg(unix)]
    let mut sighup =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()).ok();

    loop {
        #[cfg(unix)]
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            () = hangup(&mut sighup) => {
                info!("SIGHUP received, reloading configuration");
                println!("{}", reload(orchestrator, config_path));
                continue;
            }
        };
        #[cfg(not(unix))]
        let line = lines.next_line().await.context("Failed to read stdin")?;

        let Some(line) = line else {
            break;
        };
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reload" => {
                println!("{}", reload(orchestrator, config_path));
                continue;
            }
            _ => {}
        }

        let reply = orchestrator
            .handle_turn(&InboundMessage::new(session, PARTICIPANT, CHANNEL, input))
            .await?;
        deliver(transport, session, reply).await?;
    }
    Ok(())
}

pub(super) fn config_command(config_path: Option<&Path>, cmd: &ConfigCommands) -> Result<()> {
    let config = load_config(config_path)?;
    match cmd {
        ConfigCommands::Check => {
            println!(
                "Configuration OK: model {}, {} catalog capabilities",
                config.agent.model,
                config.capabilities.catalog.len()
            );
        }
        ConfigCommands::Show => {
            println!("{}", render_masked(&config)?);
        }
    }
    Ok(())
}

/// Pretty JSON with credentials replaced.
pub(super) fn render_masked(config: &Config) -> Result<String> {
    let mut masked = config.clone();
    if !masked.provider.api_key.is_empty() {
        masked.provider.api_key = "********".to_string();
    }
    if masked.capabilities.api_key.is_some() {
        masked.capabilities.api_key = Some("********".to_string());
    }
    serde_json::to_string_pretty(&masked).context("Failed to serialize config")
}
