//! Client configuration
//!
//! Loads configuration from environment variables and an optional `.env` file.

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use wirecord_core::Intents;

/// Gateway client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bot credential sent in Identify and the REST `Authorization` header
    pub token: String,
    pub api_base_url: String,
    /// Gateway override; resolved through the REST bootstrap when unset
    pub gateway_url: Option<String>,
    pub gateway_version: u8,
    pub intents: Intents,
    pub shard_id: u32,
    pub shard_count: u32,
    /// Outbound queue depth of every transport
    pub write_queue_limit: usize,
    /// Executable spawned by the command audio source
    pub audio_command: String,
    pub env: Environment,
}

/// Environment type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "production" => Some(Self::Production),
            "staging" => Some(Self::Staging),
            "development" => Some(Self::Development),
            _ => None,
        }
    }
}

// Default value functions
fn default_api_base_url() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_gateway_version() -> u8 {
    10
}

fn default_write_queue_limit() -> usize {
    4096
}

fn default_audio_command() -> String {
    "ffmpeg".to_string()
}

impl ClientConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    /// Returns an error if `BOT_TOKEN` is missing or a value fails to parse
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_source(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup("BOT_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::MissingVar("BOT_TOKEN"))?;

        let intents = match lookup("GATEWAY_INTENTS") {
            Some(raw) => Intents::from_bits_truncate(parse_var("GATEWAY_INTENTS", &raw)?),
            None => Intents::default(),
        };

        let shard_id: u32 = parse_opt(&lookup, "SHARD_ID")?.unwrap_or(0);
        let shard_count: u32 = parse_opt(&lookup, "SHARD_COUNT")?.unwrap_or(1);
        if shard_count == 0 || shard_id >= shard_count {
            return Err(ConfigError::InvalidValue(
                "SHARD_ID",
                format!("{shard_id} is not below SHARD_COUNT {shard_count}"),
            ));
        }

        let env = match lookup("APP_ENV") {
            Some(raw) => Environment::parse(&raw).ok_or(ConfigError::InvalidValue("APP_ENV", raw))?,
            None => Environment::default(),
        };

        Ok(Self {
            token,
            api_base_url: lookup("API_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(default_api_base_url),
            gateway_url: lookup("GATEWAY_URL").filter(|url| !url.is_empty()),
            gateway_version: parse_opt(&lookup, "GATEWAY_VERSION")?
                .unwrap_or_else(default_gateway_version),
            intents,
            shard_id,
            shard_count,
            write_queue_limit: parse_opt(&lookup, "WRITE_QUEUE_LIMIT")?
                .unwrap_or_else(default_write_queue_limit),
            audio_command: lookup("AUDIO_COMMAND").unwrap_or_else(default_audio_command),
            env,
        })
    }

    /// Append the version and encoding query to a gateway base URL
    #[must_use]
    pub fn gateway_endpoint(&self, base: &str) -> String {
        format!(
            "{}/?v={}&encoding=json",
            base.trim_end_matches('/'),
            self.gateway_version
        )
    }

    /// The identify `shard` pair
    #[must_use]
    pub fn shard(&self) -> [u32; 2] {
        [self.shard_id, self.shard_count]
    }
}

fn parse_var<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key, raw.to_string()))
}

fn parse_opt<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|raw| parse_var(key, &raw)).transpose()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}
