use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use turnip_finder::config::Config;
use turnip_finder::discord::{start_gateway, ChatEvent, DiscordSender};
use turnip_finder::finder::{FinderSettings, MessageOutcome, TurnipFinder};
use turnip_finder::notify::MessageSender;
use turnip_finder::sources::TurnipExchangeSource;

const CONFIG_PATH: &str = "turnipfinder.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let mut config = if Path::new(CONFIG_PATH).exists() {
        Config::load(Path::new(CONFIG_PATH))?
    } else {
        Config::from_env()
    };

    // A token passed on the command line wins over file and env
    if let Some(token) = std::env::args().nth(1) {
        config.discord.token = token;
    }

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("turnip-finder v{} starting", env!("CARGO_PKG_VERSION"));

    let token = config.require_token()?.to_string();

    // --- Discord DM sender ---
    let sender = Arc::new(DiscordSender::new(
        config.discord.api_url.clone(),
        token.clone(),
    )?);

    // --- Finder + sources ---
    let finder = Arc::new(TurnipFinder::new(
        sender.clone(),
        FinderSettings::from_config(&config),
    ));
    finder
        .add_source(Box::new(TurnipExchangeSource::new(&config.exchange)?))
        .await;

    info!(
        commands = ?finder.commands().names(),
        min_price = config.finder.min_price_allowed,
        max_price = config.finder.max_price_allowed,
        interval_secs = config.finder.poll_interval_secs,
        "finder ready"
    );

    // --- Discord gateway ---
    let (chat_tx, mut chat_rx) = mpsc::unbounded_channel::<ChatEvent>();
    start_gateway(config.discord.gateway_url.clone(), token, chat_tx);

    // --- Poll loop ---
    let poll_interval = config.finder.poll_interval();
    let poller = finder.clone();
    tokio::spawn(async move {
        poller.run(poll_interval).await;
    });

    let prefix = config.discord.command_prefix.clone();

    loop {
        tokio::select! {
            Some(event) = chat_rx.recv() => {
                let finder = finder.clone();
                let sender = sender.clone();
                let prefix = prefix.clone();
                tokio::spawn(async move {
                    handle_chat_event(&finder, sender.as_ref(), &prefix, event).await;
                });
            }

            _ = tokio::signal::ctrl_c() => {
                info!(
                    users = finder.users().len(),
                    islands = finder.registry().len(),
                    "shutting down..."
                );
                break;
            }
        }
    }

    Ok(())
}

async fn handle_chat_event(
    finder: &TurnipFinder,
    sender: &dyn MessageSender,
    prefix: &str,
    event: ChatEvent,
) {
    match finder
        .handle_message(&event.author_id, &event.author_name, &event.content)
        .await
    {
        Ok(MessageOutcome::UnknownCommand(name)) => {
            let hint = format!("Unknown command `{}`. Try {}help", name, prefix);
            if let Err(e) = sender.send_direct(&event.author_id, &hint).await {
                warn!(user = %event.author_id, error = %e, "failed to send unknown-command hint");
            }
        }
        Ok(_) => {}
        Err(e) => {
            error!(user = %event.author_id, error = %e, "command failed");
        }
    }
}
