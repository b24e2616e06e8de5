mod config;
mod error;
mod fetch;
mod llm;
mod platform;
mod relay;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::fetch::ImageFetcher;
use crate::llm::GeminiClient;
use crate::platform::telegram::{self, TelegramResolver, TelegramSink, TelegramSource};
use crate::relay::{Relay, RelaySettings};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,geminibot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration; an explicit path must exist, the default may not
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let required = explicit_path.is_some();
    let config_path = explicit_path.unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path, required)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Vision model: {}", config.gemini.vision_model);
    info!("  Text model: {}", config.gemini.text_model);
    info!("  Poll timeout: {}s", config.telegram.poll_timeout_secs);
    info!("  Image fetch timeout: {}s", config.fetch.timeout_secs);

    let bot = telegram::build_bot(&config.telegram)?;
    let mut source = TelegramSource::connect(bot.clone(), &config.telegram).await?;

    let fetcher = ImageFetcher::from_config(&config.fetch)?;
    let model = GeminiClient::new(&config.gemini).context("Failed to create Gemini client")?;

    let relay = Relay::new(
        Arc::new(model),
        Arc::new(TelegramResolver::new(bot.clone(), fetcher)),
        Arc::new(TelegramSink::new(bot, config.telegram.max_message_len)),
        RelaySettings::from(&config),
    );

    info!("Bot is starting...");
    relay.run(&mut source).await;

    Ok(())
}
