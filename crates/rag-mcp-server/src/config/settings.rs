use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub chunk_store: StoreConfig,
    pub identity_store: StoreConfig,
    pub providers: ProviderConfig,
    pub governance: GovernanceConfig,
    pub links: LinksConfig,
    #[serde(default)]
    pub usage_logger: UsageLoggerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProviderConfig {
    /// Ordered API key pool shared by the embedding and rerank clients.
    pub api_keys: Vec<String>,
    pub embedding_base_url: String,
    pub embedding_model: String,
    pub rerank_base_url: String,
    pub rerank_model: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GovernanceConfig {
    /// Per-IP transport ceiling enforced by the threat detector.
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: usize,
    /// Optional alert webhook for critical threat patterns.
    pub alert_webhook_url: Option<String>,
    /// Weekday opening the weekly quota window.
    #[serde(default = "default_week_start")]
    pub week_start: String,
    /// Compute week boundaries in UTC (false = server-local time).
    #[serde(default = "default_week_boundary_utc")]
    pub week_boundary_utc: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LinksConfig {
    pub subscription_url: String,
    pub upgrade_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UsageLoggerConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub worker_count: usize,
}

impl Default for UsageLoggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            batch_timeout_ms: 1000,
            worker_count: 2,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingConfig {
    /// Optional directory for rolling file output alongside stdout.
    pub directory: Option<String>,
}

fn default_max_requests_per_minute() -> usize {
    30
}

fn default_week_start() -> String {
    "sunday".to_string()
}

fn default_week_boundary_utc() -> bool {
    true
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("providers.api_keys"),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}
