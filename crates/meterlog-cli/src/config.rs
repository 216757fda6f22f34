//! Layered application configuration

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use config::{Config, Environment, File};
use meterlog_ingest::IngestConfig;
use meterlog_storage::PgStoreConfig;
use serde::Deserialize;
use serde_with::serde_as;
use thiserror::Error;

const ENV_PREFIX: &str = "METERLOG";

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub ingest: IngestConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr, ConfigurationError> {
        let ip: IpAddr = self.host.parse().map_err(|_| {
            ConfigurationError::Invalid(format!("server.host is not an IP address: {}", self.host))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl DatabaseConfig {
    pub fn store_config(&self, url: &str) -> PgStoreConfig {
        PgStoreConfig {
            url: url.to_string(),
            max_connections: self.max_connections,
            acquire_timeout: self.acquire_timeout,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub bearer_token: Option<String>,
}

impl AppConfig {
    /// `config/default.*`, then `METERLOG__*` variables, then plain `DATABASE_URL`.
    pub fn load() -> Result<Self, ConfigurationError> {
        let mut config = Self::from_sources(
            Some("config/default"),
            Environment::with_prefix(ENV_PREFIX),
        )?;
        if config.database.url.is_none() {
            config.database.url = std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty());
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_sources(
        file: Option<&str>,
        env: Environment,
    ) -> Result<Self, ConfigurationError> {
        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(File::with_name(file).required(false));
        }
        let config = builder
            .add_source(
                env.prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.ingest.chunk_size == 0 {
            return Err(ConfigurationError::Invalid(
                "ingest.chunk_size must be greater than zero".into(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigurationError::Invalid(
                "database.max_connections must be greater than zero".into(),
            ));
        }
        if self
            .auth
            .bearer_token
            .as_deref()
            .is_some_and(|token| token.trim().is_empty())
        {
            return Err(ConfigurationError::Invalid(
                "auth.bearer_token cannot be empty".into(),
            ));
        }
        self.server.addr()?;
        Ok(())
    }
}
