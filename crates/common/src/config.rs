use anyhow::{Context, Result};
use serde::Deserialize;
use validator::Validate;

// Default constants
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_SERVER_NAME: &str = "Weir Gateway";

pub const DEFAULT_DEADLINE_MS: u64 = 30_000;
pub const DEFAULT_MAX_PARALLEL_FETCHES: usize = 16;
pub const DEFAULT_MAX_ROWS_PER_FETCH: usize = 100_000;
pub const DEFAULT_CACHE_SOFT_CAP_PER_TENANT: usize = 512;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 250;
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

pub const DEFAULT_AUTH_CACHE_TTL: u64 = 300;
pub const DEFAULT_AUTH_CACHE_CAPACITY: u64 = 10_000;

pub const DEFAULT_TELEMETRY_ENABLED: bool = false;
pub const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Per-query execution limits enforced by the orchestrator and executor.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct QueryLimits {
    /// Default query deadline when the request carries none.
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,
    /// Upper bound on concurrent fetch tasks per query.
    #[serde(default = "default_max_parallel")]
    pub max_parallel_fetches: usize,
    /// Post-fetch row cap per source; exceeding it fails the fetch.
    #[serde(default = "default_max_rows")]
    pub max_rows_per_fetch: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            default_deadline_ms: default_deadline_ms(),
            max_parallel_fetches: default_max_parallel(),
            max_rows_per_fetch: default_max_rows(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    /// Soft cap on cache entries per tenant before LRU eviction kicks in.
    #[serde(default = "default_cache_soft_cap")]
    pub soft_cap_per_tenant: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            soft_cap_per_tenant: default_cache_soft_cap(),
        }
    }
}

fn default_deadline_ms() -> u64 {
    DEFAULT_DEADLINE_MS
}
fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL_FETCHES
}
fn default_max_rows() -> usize {
    DEFAULT_MAX_ROWS_PER_FETCH
}
fn default_cache_soft_cap() -> usize {
    DEFAULT_CACHE_SOFT_CAP_PER_TENANT
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

#[derive(Debug, Deserialize, Default, Clone, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerSettings,
    #[serde(default)]
    pub query_limits: QueryLimits,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_otlp_endpoint")]
    #[validate(url)]
    pub endpoint: String,

    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            endpoint: default_otlp_endpoint(),
            service_name: default_service_name(),
        }
    }
}

fn default_telemetry_enabled() -> bool {
    DEFAULT_TELEMETRY_ENABLED
}

fn default_otlp_endpoint() -> String {
    DEFAULT_OTLP_ENDPOINT.to_string()
}

fn default_service_name() -> String {
    DEFAULT_SERVER_NAME.to_string()
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct ServerSettings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_service_name")]
    pub name: String,

    /// Directory of connector manifest YAML files.
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: String,

    /// Directory of per-tenant policy YAML files.
    #[serde(default = "default_policy_dir")]
    pub policy_dir: String,

    /// Static bearer-token table (token -> principal) YAML file.
    #[serde(default = "default_token_file")]
    pub token_file: String,

    #[serde(default)]
    pub auth: AuthSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            name: default_service_name(),
            manifest_dir: default_manifest_dir(),
            policy_dir: default_policy_dir(),
            token_file: default_token_file(),
            auth: AuthSettings::default(),
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_manifest_dir() -> String {
    "configs/manifests".to_string()
}

fn default_policy_dir() -> String {
    "configs/tenants".to_string()
}

fn default_token_file() -> String {
    "configs/tokens.yaml".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    #[serde(default = "default_auth_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_auth_cache_capacity")]
    pub cache_max_capacity: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_auth_cache_ttl(),
            cache_max_capacity: default_auth_cache_capacity(),
        }
    }
}

fn default_auth_cache_ttl() -> u64 {
    DEFAULT_AUTH_CACHE_TTL
}

fn default_auth_cache_capacity() -> u64 {
    DEFAULT_AUTH_CACHE_CAPACITY
}

impl AppConfig {
    /// Load from an optional file layered under `WEIR__`-prefixed environment
    /// variables (e.g. `WEIR__SERVER__LISTEN_ADDR` maps to
    /// `server.listen_addr`).
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = config::Config::builder();

        let builder = if std::path::Path::new(path).exists() {
            builder.add_source(config::File::with_name(path))
        } else {
            builder
        };

        let builder = builder.add_source(
            config::Environment::with_prefix("WEIR")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("Failed to build configuration")?;

        let app_config: AppConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {:?}", e))?;

        Ok(app_config)
    }
}
