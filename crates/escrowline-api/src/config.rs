use std::net::SocketAddr;
use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use escrowline_types::{EngineConfig, Role, UserId, constants};
use serde::Deserialize;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    pub listen_addr: SocketAddr,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Bearer tokens accepted by the API. Stands in for the session service.
    #[serde(default)]
    pub sessions: Vec<SessionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info,escrowline=debug".to_string()
}

/// One accepted bearer token and the identity it resolves to.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionEntry {
    pub token: String,
    pub user_id: UserId,
    pub role: Role,
}

impl ServerConfig {
    /// Load configuration from `./config` and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory.
    ///
    /// Later sources win: built-in defaults, `default.toml`, the file named
    /// by `ESCROWLINE_ENV` (default `development`), then `ESCROWLINE__*`
    /// environment variables.
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let env_file = std::env::var("ESCROWLINE_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = Config::builder()
            .set_default(
                "listen_addr",
                format!("0.0.0.0:{}", constants::DEFAULT_API_PORT),
            )?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // e.g. config/production.toml
            .add_source(File::from(config_dir.join(env_file)).required(false))
            // ESCROWLINE__ENGINE__AUTO_RELEASE_SLA_SECS=3600, etc.
            .add_source(
                Environment::with_prefix("ESCROWLINE")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        config
            .engine
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;
        Ok(config)
    }
}
