use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub finder: FinderConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    /// Bot token - loaded from env DISCORD_BOT_TOKEN
    #[serde(default)]
    pub token: String,
    /// REST API base URL
    #[serde(default = "default_discord_api_url")]
    pub api_url: String,
    /// Gateway WebSocket URL
    #[serde(default = "default_discord_gateway_url")]
    pub gateway_url: String,
    /// Prefix that marks a message as a command
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// turnip.exchange API base URL
    #[serde(default = "default_exchange_url")]
    pub base_url: String,
    /// Seller filter sent with every listings request
    #[serde(default = "default_islander")]
    pub islander: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub fee: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinderConfig {
    /// Sleep between poll cycles in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Lowest price accepted by `!sell` / `!buy`.
    #[serde(default = "default_min_price")]
    pub min_price_allowed: i64,
    /// Highest price accepted by `!sell` / `!buy`.
    #[serde(default = "default_max_price")]
    pub max_price_allowed: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Attempts per direct message before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubles on each further attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_discord_api_url() -> String {
    "https://discord.com/api/v10".to_string()
}
fn default_discord_gateway_url() -> String {
    "wss://gateway.discord.gg/?v=10&encoding=json".to_string()
}
fn default_command_prefix() -> String {
    "!".to_string()
}
fn default_exchange_url() -> String {
    "https://api.turnip.exchange".to_string()
}
fn default_islander() -> String {
    "neither".to_string()
}
fn default_category() -> String {
    "turnips".to_string()
}
fn default_poll_interval() -> u64 {
    1
}
fn default_min_price() -> i64 {
    15
}
fn default_max_price() -> i64 {
    800
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_url: default_discord_api_url(),
            gateway_url: default_discord_gateway_url(),
            command_prefix: default_command_prefix(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: default_exchange_url(),
            islander: default_islander(),
            category: default_category(),
            fee: 0,
        }
    }
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            min_price_allowed: default_min_price(),
            max_price_allowed: default_max_price(),
        }
    }
}

impl FinderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents)?;

        // Override secrets from environment variables (never store in config file)
        if let Ok(token) = std::env::var("DISCORD_BOT_TOKEN") {
            config.discord.token = token;
        }

        Ok(config)
    }

    /// Load a default config with env-only secrets (no file needed).
    pub fn from_env() -> Self {
        Config {
            discord: DiscordConfig {
                token: std::env::var("DISCORD_BOT_TOKEN").unwrap_or_default(),
                api_url: std::env::var("DISCORD_API_URL")
                    .unwrap_or_else(|_| default_discord_api_url()),
                gateway_url: std::env::var("DISCORD_GATEWAY_URL")
                    .unwrap_or_else(|_| default_discord_gateway_url()),
                command_prefix: default_command_prefix(),
            },
            exchange: ExchangeConfig {
                base_url: std::env::var("TURNIP_EXCHANGE_URL")
                    .unwrap_or_else(|_| default_exchange_url()),
                ..ExchangeConfig::default()
            },
            finder: FinderConfig {
                poll_interval_secs: std::env::var("POLL_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_poll_interval),
                ..FinderConfig::default()
            },
            notify: NotifyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// The bot cannot start without a token.
    pub fn require_token(&self) -> Result<&str, ConfigError> {
        if self.discord.token.is_empty() {
            return Err(ConfigError::MissingEnv("DISCORD_BOT_TOKEN".to_string()));
        }
        Ok(&self.discord.token)
    }
}
