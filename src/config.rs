use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use validator::Validate;

const DEFAULT_ENV: &str = "development";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_DB_URL: &str = "sqlite::memory:";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_JWT_CLIENT_ID: &str = "platter";
const DEFAULT_DRAIN_INTERVAL_MS: u64 = 5_000;
const DEFAULT_DRAIN_BATCH: u64 = 50;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;
const DEFAULT_PROCESSED_TTL_SECS: i64 = 86_400;
const DEFAULT_MAX_REDELIVERIES: u32 = 5;
const CONFIG_DIR: &str = "config";

/// Token verification settings. Tokens are issued by an external identity
/// provider; this crate only verifies them.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct JwtConfig {
    /// "HS256" (shared secret) or "RS256" (public key), per environment.
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,

    /// Shared secret for HS256.
    #[serde(default)]
    pub hmac_secret: Option<String>,

    /// PEM-encoded RSA public key for RS256.
    #[serde(default)]
    pub rsa_public_key_pem: Option<String>,

    /// Client whose `resource_access.<client>.roles` claim carries the roles.
    #[serde(default = "default_jwt_client_id")]
    pub client_id: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            algorithm: default_jwt_algorithm(),
            hmac_secret: None,
            rsa_public_key_pem: None,
            client_id: default_jwt_client_id(),
        }
    }
}

/// Outbox publisher cadence.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct OutboxConfig {
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,

    /// Rows fetched per drain tick.
    #[serde(default = "default_drain_batch")]
    #[validate(range(min = 1, max = 500))]
    pub drain_batch: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Age after which processed rows are eligible for deletion.
    #[serde(default = "default_processed_ttl_secs")]
    pub processed_ttl_secs: i64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: default_drain_interval_ms(),
            drain_batch: default_drain_batch(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            processed_ttl_secs: default_processed_ttl_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct BrokerConfig {
    /// Redeliveries before a message is parked in the dead-letter store.
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: default_max_redeliveries(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    /// Each service owns a private database; nothing but identifiers crosses
    /// these boundaries.
    #[serde(default = "default_db_url")]
    pub order_db_url: String,
    #[serde(default = "default_db_url")]
    pub store_db_url: String,
    #[serde(default = "default_db_url")]
    pub courier_db_url: String,
    #[serde(default = "default_db_url")]
    pub notification_db_url: String,

    /// Sized larger than the consumer pool so broker handlers never starve
    /// waiting for a connection.
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1, max = 512))]
    pub db_max_connections: u32,

    /// Create tables on startup. Development convenience; deployments run
    /// managed migrations instead.
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default)]
    pub jwt: JwtConfig,

    #[serde(default)]
    pub outbox: OutboxConfig,

    #[serde(default)]
    pub broker: BrokerConfig,
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_url() -> String {
    DEFAULT_DB_URL.to_string()
}
fn default_db_max_connections() -> u32 {
    DEFAULT_DB_MAX_CONNECTIONS
}
fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}
fn default_jwt_client_id() -> String {
    DEFAULT_JWT_CLIENT_ID.to_string()
}
fn default_drain_interval_ms() -> u64 {
    DEFAULT_DRAIN_INTERVAL_MS
}
fn default_drain_batch() -> u64 {
    DEFAULT_DRAIN_BATCH
}
fn default_cleanup_interval_secs() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}
fn default_processed_ttl_secs() -> i64 {
    DEFAULT_PROCESSED_TTL_SECS
}
fn default_max_redeliveries() -> u32 {
    DEFAULT_MAX_REDELIVERIES
}

/// Loads configuration in layers: `config/default.toml`, then
/// `config/{environment}.toml`, then `APP__*` environment variables
/// (e.g. `APP__ORDER_DB_URL`, `APP__JWT__HMAC_SECRET`).
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let environment = env::var("APP_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    let cfg = Config::builder()
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, environment)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()
        .map_err(|e| ConfigError::Message(format!("invalid configuration: {}", e)))?;
    Ok(app)
}

/// Initializes tracing with the configured default filter; `RUST_LOG`
/// overrides when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("platter={},tower_http=info", level);
    let filter = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(EnvFilter::new(filter)).json().try_init();
    } else {
        let _ = fmt().with_env_filter(EnvFilter::new(filter)).try_init();
    }
}
