//! Service configuration from the environment

use crate::runtime::GenerationSettings;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key} must be a non-negative integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("TOOLCHAT_TOOL_SERVERS entry {0:?} is not of the form id=url")]
    InvalidToolServer(String),
}

/// A remote tool server to register at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolServerConfig {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    pub anthropic_api_key: Option<String>,
    pub model: String,
    pub gateway: Option<String>,
    pub max_tokens: Option<u32>,
    pub tool_servers: Vec<ToolServerConfig>,
    pub workspace: PathBuf,
    pub grace: Duration,
    pub hard_timeout: Duration,
    pub tool_timeout: Duration,
    pub poll_interval: Duration,
    pub retention: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
        let db_path = lookup("TOOLCHAT_DB_PATH")
            .map_or_else(|| PathBuf::from(&home).join(".toolchat/toolchat.db"), PathBuf::from);
        let workspace = lookup("TOOLCHAT_WORKSPACE").map_or_else(
            || std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            PathBuf::from,
        );

        let number = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(key)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| ConfigError::InvalidNumber { key, value })
                })
                .transpose()
        };
        let millis = |key: &'static str, default: u64| -> Result<Duration, ConfigError> {
            Ok(Duration::from_millis(number(key)?.unwrap_or(default)))
        };

        let port = match number("TOOLCHAT_PORT")? {
            Some(p) => u16::try_from(p).map_err(|_| ConfigError::InvalidNumber {
                key: "TOOLCHAT_PORT",
                value: p.to_string(),
            })?,
            None => DEFAULT_PORT,
        };
        let max_tokens = number("TOOLCHAT_MAX_TOKENS")?
            .map(|n| {
                u32::try_from(n).map_err(|_| ConfigError::InvalidNumber {
                    key: "TOOLCHAT_MAX_TOKENS",
                    value: n.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            port,
            db_path,
            anthropic_api_key: lookup("ANTHROPIC_API_KEY").filter(|k| !k.is_empty()),
            model: lookup("TOOLCHAT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            gateway: lookup("LLM_GATEWAY").filter(|g| !g.is_empty()),
            max_tokens,
            tool_servers: parse_tool_servers(lookup("TOOLCHAT_TOOL_SERVERS").as_deref())?,
            workspace,
            grace: millis("TOOLCHAT_GRACE_MS", 8_000)?,
            hard_timeout: millis("TOOLCHAT_HARD_TIMEOUT_MS", 180_000)?,
            tool_timeout: millis("TOOLCHAT_TOOL_TIMEOUT_MS", 60_000)?,
            poll_interval: millis("TOOLCHAT_POLL_INTERVAL_MS", 250)?,
            retention: millis("TOOLCHAT_RETENTION_MS", 60_000)?,
        })
    }

    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings {
            grace: self.grace,
            hard_timeout: self.hard_timeout,
            tool_timeout: self.tool_timeout,
            max_tokens: self.max_tokens,
        }
    }
}

/// Parse `id=url,id=url`
fn parse_tool_servers(raw: Option<&str>) -> Result<Vec<ToolServerConfig>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((id, url)) if !id.trim().is_empty() && !url.trim().is_empty() => {
                Ok(ToolServerConfig {
                    id: id.trim().to_string(),
                    url: url.trim().to_string(),
                })
            }
            _ => Err(ConfigError::InvalidToolServer(entry.to_string())),
        })
        .collect()
}
