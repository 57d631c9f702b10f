use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_STRIPE_BASE_URL: &str = "https://api.stripe.com/v1";
const DEFAULT_MINIMUM_AMOUNT: i64 = 50;
const DEV_DEFAULT_JWT_SECRET: &str = "storefront_development_secret_do_not_use_in_production";

/// Order pricing inputs applied when a snapshot becomes an order
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CheckoutConfig {
    /// Tax rate as a fraction of the subtotal (0.0 - 1.0)
    #[serde(default)]
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: f64,

    /// Flat shipping charge in major currency units
    #[serde(default)]
    pub flat_shipping: f64,

    /// Subtotal at or above which shipping is free
    #[serde(default)]
    pub free_shipping_threshold: Option<f64>,

    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub default_currency: String,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            tax_rate: 0.0,
            flat_shipping: 0.0,
            free_shipping_threshold: None,
            default_currency: default_currency(),
        }
    }
}

/// Payment gateway settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentsConfig {
    /// "stripe" or "mock"
    #[serde(default = "default_payment_provider")]
    #[validate(custom = "validate_payment_provider")]
    pub provider: String,

    /// Secret API key for the provider
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_stripe_base_url")]
    pub api_base_url: String,

    /// Upper bound for a single gateway call
    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub request_timeout_secs: u64,

    /// Smallest processable amount per lower-case currency code, in minor units
    #[serde(default = "default_minimum_amounts")]
    pub minimum_amounts: HashMap<String, i64>,

    /// Ask the gateway for the real status instead of trusting client reports
    #[serde(default = "default_true_bool")]
    pub verify_client_reports: bool,

    /// Shared secret for webhook signatures
    #[serde(default)]
    pub webhook_secret: Option<String>,

    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,

    /// Poll interval for stale payments; 0 disables the poller
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Age after which a non-terminal payment is polled
    #[serde(default = "default_reconcile_stale_after_secs")]
    pub reconcile_stale_after_secs: u64,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            provider: default_payment_provider(),
            api_key: None,
            api_base_url: default_stripe_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            minimum_amounts: default_minimum_amounts(),
            verify_client_reports: true,
            webhook_secret: None,
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reconcile_stale_after_secs: default_reconcile_stale_after_secs(),
        }
    }
}

impl PaymentsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Minimum amount in minor units for a currency
    pub fn minimum_amount(&self, currency: &str) -> i64 {
        self.minimum_amounts
            .get(&currency.to_ascii_lowercase())
            .copied()
            .unwrap_or(DEFAULT_MINIMUM_AMOUNT)
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RefundConfig {
    /// Days after delivery during which a refund can be requested
    #[serde(default = "default_refund_window_days")]
    #[validate(range(min = 0, max = 365))]
    pub window_days: i64,
}

impl Default for RefundConfig {
    fn default() -> Self {
        Self {
            window_days: default_refund_window_days(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Shared HS256 secret of the identity provider
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    #[serde(default = "default_auth_issuer")]
    pub auth_issuer: String,

    #[serde(default = "default_auth_audience")]
    pub auth_audience: String,

    /// Server host address
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// Whole-request timeout applied by the HTTP layer
    #[serde(default = "default_request_timeout_secs_http")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    #[serde(default)]
    #[validate]
    pub checkout: CheckoutConfig,

    #[serde(default)]
    #[validate]
    pub payments: PaymentsConfig,

    #[serde(default)]
    #[validate]
    pub refunds: RefundConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(database_url: String, jwt_secret: String, environment: String) -> Self {
        Self {
            database_url,
            jwt_secret,
            auth_issuer: default_auth_issuer(),
            auth_audience: default_auth_audience(),
            host: "0.0.0.0".to_string(),
            port: default_port(),
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            request_timeout_secs: default_request_timeout_secs_http(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            checkout: CheckoutConfig::default(),
            payments: PaymentsConfig::default(),
            refunds: RefundConfig::default(),
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn should_allow_permissive_cors(&self) -> bool {
        self.cors_allow_any_origin || self.is_development()
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.is_development() && self.jwt_secret.trim() == DEV_DEFAULT_JWT_SECRET {
            let mut err = ValidationError::new("jwt_secret_default_dev");
            err.message = Some(
                "The bundled development JWT secret must not be used outside development".into(),
            );
            errors.add("jwt_secret", err);
        }

        if self.payments.provider.eq_ignore_ascii_case("stripe")
            && self
                .payments
                .api_key
                .as_deref()
                .map_or(true, |k| k.trim().is_empty())
        {
            let mut err = ValidationError::new("payments_api_key_required");
            err.message = Some("Set APP__PAYMENTS__API_KEY when the stripe provider is used".into());
            errors.add("payments", err);
        }

        if !self.is_development() && self.payments.provider.eq_ignore_ascii_case("mock") {
            let mut err = ValidationError::new("payments_mock_provider");
            err.message = Some("The mock payment provider is only allowed in development".into());
            errors.add("payments", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_currency() -> String {
    "USD".to_string()
}
fn default_true_bool() -> bool {
    true
}
fn default_payment_provider() -> String {
    "stripe".to_string()
}
fn default_stripe_base_url() -> String {
    DEFAULT_STRIPE_BASE_URL.to_string()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_request_timeout_secs_http() -> u64 {
    30
}
fn default_minimum_amounts() -> HashMap<String, i64> {
    HashMap::from([
        ("usd".to_string(), 50),
        ("eur".to_string(), 50),
        ("gbp".to_string(), 30),
        ("ngn".to_string(), 5000),
    ])
}
fn default_webhook_tolerance_secs() -> u64 {
    300
}
fn default_reconcile_interval_secs() -> u64 {
    60
}
fn default_reconcile_stale_after_secs() -> u64 {
    120
}
fn default_refund_window_days() -> i64 {
    30
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_auth_issuer() -> String {
    "storefront-auth".to_string()
}
fn default_auth_audience() -> String {
    "storefront-api".to_string()
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_tax_rate(rate: f64) -> Result<(), ValidationError> {
    if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
        let mut err = ValidationError::new("tax_rate");
        err.message = Some("tax_rate must be a finite value between 0.0 and 1.0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_payment_provider(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "stripe" | "mock" => Ok(()),
        _ => {
            let mut err = ValidationError::new("provider");
            err.message = Some("Must be one of: stripe, mock".into());
            Err(err)
        }
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
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

    let mut builder = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?;

    if run_env.eq_ignore_ascii_case(DEFAULT_ENV) {
        builder = builder
            .set_default("jwt_secret", DEV_DEFAULT_JWT_SECRET)?
            .set_default("payments.provider", "mock")?;
    }

    let config = builder
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET to the identity provider's signing secret.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
