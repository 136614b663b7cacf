//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The API secret is loaded from the AUTH_TOKEN env var or `auth_token_file`,
//! never stored in the TOML directly.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Credential;
use platform::RestConfig;
use serde::Deserialize;
use session_pool::PoolPolicy;

/// Config file looked up in the working directory when no path is given.
const DEFAULT_CONFIG_FILE: &str = "onliner.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub pool: PoolConfig,
    pub platform: PlatformConfig,
    /// Bearer secret guarding the `/tokens` routes.
    #[serde(skip)]
    pub auth_token: Option<Credential>,
}

/// HTTP façade settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    /// Path to a file containing the API secret (alternative to AUTH_TOKEN)
    pub auth_token_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            max_connections: 256,
            auth_token_file: None,
        }
    }
}

/// Desired-set document location
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("onliner-store.json"),
        }
    }
}

/// Reconciliation tunables
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub connect_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Periodic reconcile interval; 0 disables the ticker.
    pub reconcile_interval_secs: u64,
    pub full_reload: bool,
    pub prune_transient_failures: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            shutdown_grace_secs: 4,
            reconcile_interval_secs: 0,
            full_reload: false,
            prune_transient_failures: true,
        }
    }
}

/// Platform API client settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub api_base: String,
    pub heartbeat_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_base: "https://discord.com/api/v9".into(),
            heartbeat_secs: 60,
            request_timeout_secs: 15,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then overlay environment
    /// variables and validate.
    ///
    /// API secret resolution order:
    /// 1. AUTH_TOKEN env var
    /// 2. auth_token_file path from config
    pub fn load(path: Option<&Path>) -> common::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                toml::from_str(&contents)?
            }
            None => Config::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> common::Result<()> {
        if let Ok(port) = std::env::var("PORT") {
            let port: u16 = port.trim().parse().map_err(|_| {
                common::Error::Config(format!("PORT must be a port number, got: {port}"))
            })?;
            self.server.listen_addr.set_port(port);
        }

        if let Ok(path) = std::env::var("STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }

        if let Some(token) = std::env::var("AUTH_TOKEN").ok().and_then(|t| Credential::parse(&t)) {
            self.auth_token = Some(token);
        } else if let Some(ref token_file) = self.server.auth_token_file {
            let contents = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read auth_token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            self.auth_token = Credential::parse(&contents);
        }

        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if self.auth_token.is_none() {
            return Err(common::Error::MissingSetting("AUTH_TOKEN"));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.pool.connect_timeout_secs == 0 {
            return Err(common::Error::Config(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }

        if !self.platform.api_base.starts_with("http://")
            && !self.platform.api_base.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "api_base must start with http:// or https://, got: {}",
                self.platform.api_base
            )));
        }

        if self.platform.heartbeat_secs == 0 || self.platform.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "heartbeat_secs and request_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve the config file from CLI arg, CONFIG_PATH env var, or the
    /// default file when it exists. `None` means run on defaults.
    pub fn resolve_path(cli_path: Option<&str>) -> Option<PathBuf> {
        if let Some(p) = cli_path {
            return Some(PathBuf::from(p));
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return Some(PathBuf::from(p));
        }
        let default = PathBuf::from(DEFAULT_CONFIG_FILE);
        default.exists().then_some(default)
    }

    pub fn pool_policy(&self) -> PoolPolicy {
        PoolPolicy {
            connect_timeout: Duration::from_secs(self.pool.connect_timeout_secs),
            shutdown_grace: Duration::from_secs(self.pool.shutdown_grace_secs),
            full_reload: self.pool.full_reload,
            prune_transient_failures: self.pool.prune_transient_failures,
        }
    }

    pub fn rest_config(&self) -> RestConfig {
        RestConfig {
            api_base: self.platform.api_base.clone(),
            heartbeat: Duration::from_secs(self.platform.heartbeat_secs),
            request_timeout: Duration::from_secs(self.platform.request_timeout_secs),
        }
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.pool.reconcile_interval_secs > 0)
            .then(|| Duration::from_secs(self.pool.reconcile_interval_secs))
    }
}
