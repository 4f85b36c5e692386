use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_PAYMENT_API_BASE: &str = "https://api.stripe.com";
const DEFAULT_PAYMENT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;
const DEFAULT_PENDING_ORDER_TIMEOUT_HOURS: i64 = 24;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;

fn validate_currency(currency: &str) -> Result<(), ValidationError> {
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("currency");
        err.message = Some("Currency must be a 3-letter ISO code".into());
        Err(err)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// Payment processor secret key. No default: must be provided via
    /// environment variable or config file.
    pub payment_secret_key: String,

    /// Payment processor REST base URL
    #[serde(default = "default_payment_api_base")]
    pub payment_api_base: String,

    /// Webhook signing secret; webhook signature verification is disabled
    /// when unset (development only)
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    /// Maximum accepted age of a webhook signature timestamp, in seconds
    #[serde(default = "default_webhook_tolerance_secs")]
    pub payment_webhook_tolerance_secs: u64,

    /// Bounded timeout applied to every payment processor call, in seconds
    #[serde(default = "default_payment_timeout_secs")]
    pub payment_timeout_secs: u64,

    /// Where the hosted payment page sends the customer after success
    pub checkout_success_url: String,

    /// Where the hosted payment page sends the customer on cancel
    pub checkout_cancel_url: String,

    /// Settlement currency for checkout sessions
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3), custom = "validate_currency")]
    pub currency: String,

    /// Age after which a `pending` order is cancelled by the cleanup sweep
    #[serde(default = "default_pending_order_timeout_hours")]
    #[validate(range(min = 1, max = 720))]
    pub pending_order_timeout_hours: i64,

    /// Interval between cleanup sweeps, in seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_min_connections() -> u32 {
    1
}

fn default_payment_api_base() -> String {
    DEFAULT_PAYMENT_API_BASE.to_string()
}

fn default_webhook_tolerance_secs() -> u64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}

fn default_payment_timeout_secs() -> u64 {
    DEFAULT_PAYMENT_TIMEOUT_SECS
}

fn default_currency() -> String {
    "usd".to_string()
}

fn default_pending_order_timeout_hours() -> i64 {
    DEFAULT_PENDING_ORDER_TIMEOUT_HOURS
}

fn default_cleanup_interval_secs() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}

impl AppConfig {
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Loads configuration from config files and `APP__`-prefixed environment
/// variables, with environment variables taking precedence.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // NOTE: payment_secret_key has no default - it MUST be provided via
    // environment variable or config file.
    let builder = Config::builder()
        .set_default("database_url", "sqlite://marketplace.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("checkout_success_url", "http://localhost:3000/checkout/success")?
        .set_default("checkout_cancel_url", "http://localhost:3000/checkout/cancel")?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false));

    let config = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("payment_secret_key").is_err() {
        error!("Payment secret key is not configured. Set APP__PAYMENT_SECRET_KEY.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "payment_secret_key is required but not configured. Set APP__PAYMENT_SECRET_KEY."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    Ok(app_config)
}

/// Initializes the global tracing subscriber. Safe to call more than once;
/// subsequent calls are no-ops.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("marketplace_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            database_url: "sqlite::memory:".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            environment: "development".to_string(),
            log_level: "debug".to_string(),
            log_json: false,
            auto_migrate: true,
            db_max_connections: 5,
            db_min_connections: 1,
            payment_secret_key: "sk_test_123".to_string(),
            payment_api_base: DEFAULT_PAYMENT_API_BASE.to_string(),
            payment_webhook_secret: Some("whsec_123".to_string()),
            payment_webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
            payment_timeout_secs: DEFAULT_PAYMENT_TIMEOUT_SECS,
            checkout_success_url: "http://localhost/success".to_string(),
            checkout_cancel_url: "http://localhost/cancel".to_string(),
            currency: "usd".to_string(),
            pending_order_timeout_hours: 24,
            cleanup_interval_secs: 3600,
        }
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_bad_currency() {
        let mut cfg = base_config();
        cfg.currency = "usdollar".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_pending_timeout() {
        let mut cfg = base_config();
        cfg.pending_order_timeout_hours = 0;
        assert!(cfg.validate().is_err());
    }
}
