//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use crate::payments::factory::GatewaySettings;
use crate::workers::order_reconciler::OrderReconcilerConfig;
use sqlx::types::BigDecimal;
use std::env;
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub topup: TopupConfig,
    pub reconciler: OrderReconcilerConfig,
    pub gateways: GatewaySettings,
    /// Run against in-memory stores with no database.
    pub skip_externals: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL used to build gateway notify URLs.
    pub public_address: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Top-up policy settings
#[derive(Debug, Clone)]
pub struct TopupConfig {
    /// Quota granted per currency unit.
    pub quota_per_unit: BigDecimal,
    /// Apply callbacks whose signature could not be confirmed.
    pub allow_unverified_callbacks: bool,
    pub gateway_timeout_secs: u64,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        let server = ServerConfig::from_env()?;
        let topup = TopupConfig::from_env()?;
        let gateways = GatewaySettings::from_env(&server.public_address, topup.gateway_timeout_secs);

        Ok(AppConfig {
            database: DatabaseConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            reconciler: OrderReconcilerConfig::from_env(),
            skip_externals: parse_bool("SKIP_EXTERNALS", false)?,
            server,
            topup,
            gateways,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if !self.skip_externals {
            self.database.validate()?;
        }
        self.logging.validate()?;
        self.topup.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?;
        let public_address = env::var("SERVER_ADDRESS")
            .unwrap_or_else(|_| format!("http://{}:{}", host, port))
            .trim_end_matches('/')
            .to_string();

        Ok(ServerConfig {
            host,
            port,
            public_address,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        if !self.public_address.starts_with("http://") && !self.public_address.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "SERVER_ADDRESS must be an http(s) URL".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL").unwrap_or_default(),
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()))?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MIN_CONNECTIONS".to_string()))?,
            connection_timeout: env::var("DB_CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_CONNECTION_TIMEOUT".to_string()))?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::MissingVariable("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl Default for TopupConfig {
    fn default() -> Self {
        Self {
            quota_per_unit: BigDecimal::from(500_000),
            allow_unverified_callbacks: false,
            gateway_timeout_secs: 15,
        }
    }
}

impl TopupConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let quota_per_unit = match env::var("QUOTA_PER_UNIT") {
            Ok(raw) => BigDecimal::from_str(raw.trim())
                .map_err(|_| ConfigError::InvalidValue("QUOTA_PER_UNIT".to_string()))?,
            Err(_) => defaults.quota_per_unit,
        };

        Ok(TopupConfig {
            quota_per_unit,
            allow_unverified_callbacks: parse_bool(
                "ALLOW_UNVERIFIED_CALLBACKS",
                defaults.allow_unverified_callbacks,
            )?,
            gateway_timeout_secs: env::var("GATEWAY_TIMEOUT_SECS")
                .unwrap_or_else(|_| defaults.gateway_timeout_secs.to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("GATEWAY_TIMEOUT_SECS".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quota_per_unit <= BigDecimal::from(0) {
            return Err(ConfigError::ValidationFailed(
                "QUOTA_PER_UNIT must be positive".to_string(),
            ));
        }

        if self.gateway_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "GATEWAY_TIMEOUT_SECS cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            _ => Err(ConfigError::InvalidValue(name.to_string())),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
