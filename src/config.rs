use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u32,
    #[serde(default)]
    pub start_offset: i32,
    /// Empty means every user may talk to the bot.
    #[serde(default)]
    pub allowed_user_ids: Vec<u64>,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    /// Model used when the update carries a photo
    #[serde(default = "default_model")]
    pub vision_model: String,
    /// Model used for text-only updates
    #[serde(default = "default_model")]
    pub text_model: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// When false, photos are ignored and only the caption is sent to the text model.
    #[serde(default = "default_true")]
    pub vision_enabled: bool,
    /// Copy the inbound formatting entities onto the reply.
    #[serde(default)]
    pub echo_input_entities: bool,
    /// Drop the text part of a photo request when the caption is empty.
    #[serde(default = "default_true")]
    pub omit_empty_caption: bool,
}

fn default_poll_timeout() -> u32 {
    60
}

fn default_max_message_len() -> usize {
    4000
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_pool_max_idle() -> usize {
    50
}

fn default_true() -> bool {
    true
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            poll_timeout_secs: default_poll_timeout(),
            start_offset: 0,
            allowed_user_ids: Vec::new(),
            max_message_len: default_max_message_len(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_gemini_base_url(),
            vision_model: default_model(),
            text_model: default_model(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            pool_max_idle_per_host: default_pool_max_idle(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            vision_enabled: true,
            echo_input_entities: false,
            omit_empty_caption: true,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl GeminiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Room for at least one UTF-8 character per chunk.
const MIN_MESSAGE_LEN: usize = 4;
/// Telegram rejects longer message texts.
const MAX_MESSAGE_LEN: usize = 4096;

/// Environment variables checked for the Telegram token, in priority order.
const TELEGRAM_TOKEN_VARS: &[&str] = &["Telegram_Bot_Key", "TELEGRAM_BOT_TOKEN"];
/// Environment variables checked for the Gemini key, in priority order.
const GEMINI_KEY_VARS: &[&str] = &["API_KEY", "GEMINI_API_KEY"];

impl Config {
    /// Load the config file (if any), then apply environment overrides.
    ///
    /// A missing file is only an error when `required` is set, i.e. the
    /// user named the path explicitly.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else if required {
            anyhow::bail!("Config file not found: {}", path.display());
        } else {
            Config::default()
        };

        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override credentials from the environment. Takes a lookup function so
    /// tests don't have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first_set = |names: &[&str]| {
            names
                .iter()
                .filter_map(|name| lookup(name))
                .find(|value| !value.trim().is_empty())
        };

        if let Some(token) = first_set(TELEGRAM_TOKEN_VARS) {
            self.telegram.bot_token = token;
        }
        if let Some(key) = first_set(GEMINI_KEY_VARS) {
            self.gemini.api_key = key;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!(
                "Telegram bot token is missing: set telegram.bot_token or {}",
                TELEGRAM_TOKEN_VARS[0]
            );
        }
        if self.gemini.api_key.trim().is_empty() {
            anyhow::bail!(
                "Gemini API key is missing: set gemini.api_key or {}",
                GEMINI_KEY_VARS[0]
            );
        }
        if self.gemini.vision_model.is_empty() || self.gemini.text_model.is_empty() {
            anyhow::bail!("gemini.vision_model and gemini.text_model must not be empty");
        }
        if !(MIN_MESSAGE_LEN..=MAX_MESSAGE_LEN).contains(&self.telegram.max_message_len) {
            anyhow::bail!(
                "telegram.max_message_len must be between {} and {}",
                MIN_MESSAGE_LEN,
                MAX_MESSAGE_LEN
            );
        }
        Ok(())
    }
}
