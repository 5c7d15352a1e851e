mod loader;
mod runtime;

pub use loader::load_config;
pub use runtime::{watch_config, ConfigCell, WatcherHandle};

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_FAILOVER_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-06-01";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: ClientAuthConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host:port` the relay listens on. Required.
    #[serde(default)]
    pub listen: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: String::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMode {
    /// Clients must present the configured shared secret.
    SharedSecret,
    /// The client credential is accepted as-is and forwarded to
    /// transparent-auth providers.
    Passthrough,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAuthConfig {
    pub mode: ClientAuthMode,
    #[serde(default)]
    pub secret: Option<String>,
}

impl Default for ClientAuthConfig {
    fn default() -> Self {
        Self {
            mode: ClientAuthMode::Passthrough,
            secret: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    Zai,
    Ollama,
    Minimax,
    Bedrock,
    Vertex,
    Azure,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Zai => "zai",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Minimax => "minimax",
            ProviderKind::Bedrock => "bedrock",
            ProviderKind::Vertex => "vertex",
            ProviderKind::Azure => "azure",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AzureAuthMethod {
    ApiKey,
    EntraId,
}

impl Default for AzureAuthMethod {
    fn default() -> Self {
        AzureAuthMethod::ApiKey
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Client model name -> upstream model name.
    #[serde(default)]
    pub model_map: HashMap<String, String>,
    /// Models advertised through `GET /v1/models`.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Upstream request timeout override, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    // Bedrock
    #[serde(default)]
    pub region: Option<String>,
    // Vertex (shares `region` with Bedrock)
    #[serde(default)]
    pub project: Option<String>,
    // Azure
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub auth_method: AzureAuthMethod,
}

fn default_weight() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    /// Resolve the upstream origin, defaulted per provider type.
    pub fn resolved_base_url(&self) -> Result<Url> {
        let raw = match &self.base_url {
            Some(base) => base.clone(),
            None => match self.kind {
                ProviderKind::Anthropic => "https://api.anthropic.com".to_string(),
                ProviderKind::Zai => "https://api.z.ai/api/anthropic".to_string(),
                ProviderKind::Ollama => "http://localhost:11434".to_string(),
                ProviderKind::Minimax => "https://api.minimax.io/anthropic".to_string(),
                ProviderKind::Bedrock => {
                    let region = self.region.as_deref().ok_or_else(|| {
                        Error::Config(format!("provider '{}' requires region", self.name))
                    })?;
                    format!("https://bedrock-runtime.{region}.amazonaws.com")
                }
                ProviderKind::Vertex => {
                    let region = self.region.as_deref().ok_or_else(|| {
                        Error::Config(format!("provider '{}' requires region", self.name))
                    })?;
                    format!("https://{region}-aiplatform.googleapis.com")
                }
                ProviderKind::Azure => {
                    let resource = self.resource.as_deref().ok_or_else(|| {
                        Error::Config(format!("provider '{}' requires resource", self.name))
                    })?;
                    format!("https://{resource}.services.ai.azure.com")
                }
            },
        };
        Url::parse(&raw)
            .map_err(|e| Error::Config(format!("provider '{}' base_url invalid: {e}", self.name)))
    }

    pub fn pool_enabled(&self) -> bool {
        self.pool.enabled.unwrap_or(self.keys.len() >= 2)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    pub secret: String,
    /// Requests per minute; 0 = unlimited.
    #[serde(default)]
    pub rpm: u32,
    /// Input tokens per minute; 0 = unlimited.
    #[serde(default)]
    pub input_tpm: u64,
    /// Output tokens per minute; 0 = unlimited.
    #[serde(default)]
    pub output_tpm: u64,
    /// Legacy combined limit, split 50/50 when the per-direction
    /// limits are absent.
    #[serde(default)]
    pub tpm: u64,
    #[serde(default)]
    pub priority: u8,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl KeyConfig {
    pub fn effective_input_tpm(&self) -> u64 {
        if self.input_tpm > 0 {
            self.input_tpm
        } else if self.tpm > 0 {
            self.tpm / 2
        } else {
            0
        }
    }

    pub fn effective_output_tpm(&self) -> u64 {
        if self.output_tpm > 0 {
            self.output_tpm
        } else if self.tpm > 0 {
            self.tpm / 2
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    LeastLoaded,
    RoundRobin,
    Random,
    Weighted,
}

impl Default for PoolStrategy {
    fn default() -> Self {
        PoolStrategy::LeastLoaded
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub strategy: PoolStrategy,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    Failover,
    RoundRobin,
    WeightedRoundRobin,
    WeightedFailover,
    Shuffle,
    LeastLoaded,
    ModelBased,
}

impl Default for RouteStrategy {
    fn default() -> Self {
        RouteStrategy::Failover
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub strategy: RouteStrategy,
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Client model name -> provider name, used by `model_based`.
    #[serde(default)]
    pub model_routes: HashMap<String, String>,
    #[serde(default = "default_failover_timeout_ms")]
    pub failover_timeout_ms: u64,
}

fn default_failover_timeout_ms() -> u64 {
    DEFAULT_FAILOVER_TIMEOUT_MS
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RouteStrategy::default(),
            default_provider: None,
            model_routes: HashMap::new(),
            failover_timeout_ms: DEFAULT_FAILOVER_TIMEOUT_MS,
        }
    }
}

impl RoutingConfig {
    pub fn failover_timeout(&self) -> Duration {
        Duration::from_millis(self.failover_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How far ahead of expiry the Vertex OAuth token is refreshed.
    #[serde(default = "default_token_refresh_ahead_secs")]
    pub token_refresh_ahead_secs: u64,
}

fn default_token_refresh_ahead_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            token_refresh_ahead_secs: default_token_refresh_ahead_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
    /// Track breaker state per pool key in addition to per provider.
    #[serde(default)]
    pub per_key: bool,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_open_duration_ms() -> u64 {
    30_000
}

fn default_half_open_probes() -> u32 {
    1
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_ms: default_open_duration_ms(),
            half_open_probes: default_half_open_probes(),
            per_key: false,
        }
    }
}

impl HealthConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate a parsed configuration before it is activated. Reload paths
    /// call this too; a snapshot that fails here is never published.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen.is_empty() {
            return Err(Error::Config("server.listen is required".into()));
        }
        validate_listen(&self.server.listen)?;

        if self.auth.mode == ClientAuthMode::SharedSecret
            && self.auth.secret.as_deref().unwrap_or("").is_empty()
        {
            return Err(Error::Config(
                "auth.secret is required for shared_secret mode".into(),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(Error::Config(format!(
                "logging.level '{}' is not one of {LOG_LEVELS:?}",
                self.logging.level
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(Error::Config("provider name must not be empty".into()));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate provider name '{}'",
                    provider.name
                )));
            }
            provider.resolved_base_url()?;
            if provider.timeout_secs == Some(0) {
                return Err(Error::Config(format!(
                    "provider '{}' timeout_secs must be > 0 when set",
                    provider.name
                )));
            }
            match provider.kind {
                ProviderKind::Bedrock if provider.region.is_none() => {
                    return Err(Error::Config(format!(
                        "provider '{}' (bedrock) requires region",
                        provider.name
                    )));
                }
                ProviderKind::Vertex if provider.project.is_none() || provider.region.is_none() => {
                    return Err(Error::Config(format!(
                        "provider '{}' (vertex) requires project and region",
                        provider.name
                    )));
                }
                ProviderKind::Azure if provider.resource.is_none() => {
                    return Err(Error::Config(format!(
                        "provider '{}' (azure) requires resource",
                        provider.name
                    )));
                }
                _ => {}
            }
            for key in &provider.keys {
                if key.secret.is_empty() {
                    return Err(Error::Config(format!(
                        "provider '{}' has a key with an empty secret",
                        provider.name
                    )));
                }
                if key.priority > 2 {
                    return Err(Error::Config(format!(
                        "provider '{}' key priority {} out of range 0..=2",
                        provider.name, key.priority
                    )));
                }
            }
        }

        if self.routing.strategy == RouteStrategy::ModelBased && self.routing.model_routes.is_empty()
        {
            return Err(Error::Config(
                "routing.model_routes must not be empty for model_based strategy".into(),
            ));
        }
        if let Some(default) = &self.routing.default_provider {
            if !self.providers.iter().any(|p| &p.name == default) {
                return Err(Error::Config(format!(
                    "routing.default_provider '{default}' is not a configured provider"
                )));
            }
        }

        if self.health.failure_threshold < 1 {
            return Err(Error::Config(
                "health.failure_threshold must be at least 1".into(),
            ));
        }
        if self.health.open_duration_ms == 0 {
            return Err(Error::Config("health.open_duration_ms must be > 0".into()));
        }
        if self.health.half_open_probes < 1 {
            return Err(Error::Config(
                "health.half_open_probes must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

fn validate_listen(listen: &str) -> Result<()> {
    let (host, port) = listen
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("server.listen '{listen}' is not host:port")))?;
    if host.is_empty() {
        return Err(Error::Config(format!(
            "server.listen '{listen}' is missing a host"
        )));
    }
    port.parse::<u16>()
        .map_err(|_| Error::Config(format!("server.listen '{listen}' has an invalid port")))?;
    Ok(())
}
