use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::utils::{get_env_flag, get_env_parsed, get_env_with_prefix};

#[cfg(feature = "jobs")]
use crate::jobs::JobsConfig;

/// Deployment environment, read from `ENVIRONMENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl Environment {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Production => "production",
        }
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Sample plans and other fixtures are seeded outside production.
    #[must_use]
    pub fn dev_fixtures_enabled(&self) -> bool {
        !self.is_production()
    }

    /// Store implementations log every statement in development.
    #[must_use]
    pub fn verbose_store_logging(&self) -> bool {
        matches!(self, Self::Development)
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!(
                "Invalid environment: {}. Must be one of: development, test, production",
                other
            )),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main configuration for a Tollgate deployment
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub environment: Environment,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub webhook: WebhookConfig,
    pub gateway: GatewayConfig,
    pub audit: AuditConfig,
    pub usage: UsageConfig,
    #[cfg(feature = "jobs")]
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

/// Gateway webhook ingestion settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    /// Signing secret shared with the gateway.
    #[serde(skip)]
    pub secret: Option<SecretString>,
    /// Maximum accepted body size in bytes.
    #[serde(default = "default_webhook_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Accepted clock skew for the signature timestamp and event age.
    #[serde(default = "default_webhook_tolerance_seconds")]
    pub tolerance_seconds: i64,
    /// How long dedup records are kept.
    #[serde(default = "default_webhook_retention_days")]
    pub retention_days: i64,
}

/// Live payment gateway client settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(skip)]
    pub api_key: Option<SecretString>,
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,
    #[serde(default = "default_gateway_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_retention_days")]
    pub retention_days: i64,
}

/// Which usage metrics are initialised when a subscription activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsageConfig {
    #[serde(default = "default_true")]
    pub terminals_enabled: bool,
    #[serde(default = "default_true")]
    pub courses_enabled: bool,
    #[serde(default = "default_true")]
    pub labs_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            webhook: WebhookConfig::default(),
            gateway: GatewayConfig::default(),
            audit: AuditConfig::default(),
            usage: UsageConfig::default(),
            #[cfg(feature = "jobs")]
            jobs: JobsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
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

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            max_body_bytes: default_webhook_max_body_bytes(),
            tolerance_seconds: default_webhook_tolerance_seconds(),
            retention_days: default_webhook_retention_days(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_gateway_base_url(),
            timeout_seconds: default_gateway_timeout_seconds(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: default_audit_retention_days(),
        }
    }
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            terminals_enabled: true,
            courses_enabled: true,
            labs_enabled: true,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_webhook_max_body_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_webhook_tolerance_seconds() -> i64 {
    300
}

fn default_webhook_retention_days() -> i64 {
    30
}

fn default_gateway_base_url() -> String {
    "https://api.stripe.com".to_string()
}

fn default_gateway_timeout_seconds() -> u64 {
    30
}

fn default_audit_retention_days() -> i64 {
    365
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
    environment_error: Option<String>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            environment_error: None,
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.config.environment = environment;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.server.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.webhook.secret = Some(SecretString::from(secret.into()));
        self
    }

    pub fn with_webhook_tolerance_seconds(mut self, seconds: i64) -> Self {
        self.config.webhook.tolerance_seconds = seconds;
        self
    }

    pub fn with_webhook_max_body_bytes(mut self, bytes: usize) -> Self {
        self.config.webhook.max_body_bytes = bytes;
        self
    }

    pub fn with_webhook_retention_days(mut self, days: i64) -> Self {
        self.config.webhook.retention_days = days;
        self
    }

    pub fn with_gateway_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config.gateway.api_key = Some(SecretString::from(api_key.into()));
        self
    }

    pub fn with_gateway_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.gateway.base_url = base_url.into();
        self
    }

    pub fn with_audit_retention_days(mut self, days: i64) -> Self {
        self.config.audit.retention_days = days;
        self
    }

    pub fn with_usage(mut self, usage: UsageConfig) -> Self {
        self.config.usage = usage;
        self
    }

    #[cfg(feature = "jobs")]
    pub fn with_jobs_config(mut self, jobs: JobsConfig) -> Self {
        self.config.jobs = jobs;
        self
    }

    /// Load configuration from environment variables with TOLLGATE_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(environment) = get_env_with_prefix("ENVIRONMENT") {
            match environment.parse() {
                Ok(env) => self.config.environment = env,
                Err(e) => self.environment_error = Some(e),
            }
        }
        if let Some(host) = get_env_with_prefix("HOST") {
            self.config.server.host = host;
        }
        if let Some(port) = get_env_parsed("PORT") {
            self.config.server.port = port;
        }
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_flag("LOG_JSON") {
            self.config.logging.json = json;
        }

        if let Some(secret) = get_env_with_prefix("WEBHOOK_SECRET") {
            self.config.webhook.secret = Some(SecretString::from(secret));
        }
        if let Some(bytes) = get_env_parsed("WEBHOOK_MAX_BODY_BYTES") {
            self.config.webhook.max_body_bytes = bytes;
        }
        if let Some(seconds) = get_env_parsed("WEBHOOK_TOLERANCE_SECONDS") {
            self.config.webhook.tolerance_seconds = seconds;
        }
        if let Some(days) = get_env_parsed("WEBHOOK_RETENTION_DAYS") {
            self.config.webhook.retention_days = days;
        }

        if let Some(api_key) = get_env_with_prefix("GATEWAY_API_KEY") {
            self.config.gateway.api_key = Some(SecretString::from(api_key));
        }
        if let Some(base_url) = get_env_with_prefix("GATEWAY_BASE_URL") {
            self.config.gateway.base_url = base_url;
        }
        if let Some(timeout) = get_env_parsed("GATEWAY_TIMEOUT_SECONDS") {
            self.config.gateway.timeout_seconds = timeout;
        }

        if let Some(days) = get_env_parsed("AUDIT_RETENTION_DAYS") {
            self.config.audit.retention_days = days;
        }

        if let Some(enabled) = get_env_flag("USAGE_TERMINALS_ENABLED") {
            self.config.usage.terminals_enabled = enabled;
        }
        if let Some(enabled) = get_env_flag("USAGE_COURSES_ENABLED") {
            self.config.usage.courses_enabled = enabled;
        }
        if let Some(enabled) = get_env_flag("USAGE_LABS_ENABLED") {
            self.config.usage.labs_enabled = enabled;
        }

        #[cfg(feature = "jobs")]
        {
            self.config.jobs = JobsConfig::from_env();
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` describing the first invalid setting.
    pub fn build(self) -> crate::error::Result<Config> {
        if let Some(e) = self.environment_error {
            return Err(crate::error::TollgateError::bad_request(e));
        }

        self.config.server.addr().map_err(|e| {
            crate::error::TollgateError::bad_request(format!(
                "Invalid server address {}:{} - {}",
                self.config.server.host, self.config.server.port, e
            ))
        })?;

        if self.config.server.port == 0 {
            return Err(crate::error::TollgateError::bad_request(
                "Server port must be greater than 0",
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(crate::error::TollgateError::bad_request(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if self.config.webhook.max_body_bytes == 0 {
            return Err(crate::error::TollgateError::bad_request(
                "Webhook max body size must be greater than 0",
            ));
        }

        if self.config.webhook.tolerance_seconds <= 0 {
            return Err(crate::error::TollgateError::bad_request(
                "Webhook tolerance must be greater than 0 seconds",
            ));
        }

        if self.config.webhook.retention_days < 1 {
            return Err(crate::error::TollgateError::bad_request(
                "Webhook record retention must be at least 1 day",
            ));
        }

        if self.config.audit.retention_days < 1 {
            return Err(crate::error::TollgateError::bad_request(
                "Audit retention must be at least 1 day",
            ));
        }

        if self.config.environment.is_production() && self.config.webhook.secret.is_none() {
            return Err(crate::error::TollgateError::bad_request(
                "A webhook secret is required in production",
            ));
        }

        #[cfg(feature = "jobs")]
        self.config.jobs.validate()?;

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
