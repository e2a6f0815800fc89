use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub archive: ArchiveConfig,
    pub summarization: SummarizationConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// redis://host:port/db or rediss:// for TLS
    pub url: String,
    pub ttl_seconds: u64,
    pub key_prefix: String,
    pub op_timeout_ms: u64,
    /// Upper bound for the in-process fallback map
    pub fallback_max_entries: usize,
    pub auth: CacheAuthConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "redis://127.0.0.1:6379/0".to_string(),
            ttl_seconds: 3600,
            key_prefix: "chat:".to_string(),
            op_timeout_ms: 2000,
            fallback_max_entries: 10_000,
            auth: CacheAuthConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheAuthMode {
    #[default]
    None,
    Password,
    TokenEndpoint,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheAuthConfig {
    pub mode: CacheAuthMode,
    pub username: Option<String>,
    pub password: Option<String>,
    /// GET endpoint returning `{"access_token": "...", "expires_in": 3600}`
    pub token_url: Option<String>,
    pub refresh_margin_seconds: u64,
}

impl Default for CacheAuthConfig {
    fn default() -> Self {
        Self {
            mode: CacheAuthMode::None,
            username: None,
            password: None,
            token_url: None,
            refresh_margin_seconds: 300,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ArchiveConfig {
    pub enabled: bool,
    /// postgres://..., file:///var/lib/chat, a bare directory, or memory://
    pub location: String,
    /// ttl-<secs> | before-expiry:<secs> | every:<secs> | interval:<secs> | <secs>
    pub persist_policy: String,
    pub op_timeout_ms: u64,
    pub max_retries: u32,
    pub pool_max_size: u32,
    pub poll_interval_seconds: Option<u64>,
    pub shutdown_timeout_seconds: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            location: "data/chat-history".to_string(),
            persist_policy: "ttl-300".to_string(),
            op_timeout_ms: 5000,
            max_retries: 2,
            pool_max_size: 5,
            poll_interval_seconds: None,
            shutdown_timeout_seconds: 10,
        }
    }
}

impl ArchiveConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SummarizationConfig {
    pub enabled: bool,
    pub max_tokens: usize,
    pub target_tokens: usize,
    pub recent_keep_count: usize,
    pub timeout_seconds: u64,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tokens: 8000,
            target_tokens: 2000,
            recent_keep_count: 5,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            model: None,
            api_key: None,
            timeout_seconds: 60,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}
