//! Process configuration.
//!
//! Loaded from an INI file with `[core]` and `[zmq]` sections, overridden by
//! `MKTL__SECTION__KEY` environment variables.
//!
//! ```ini
//! [core]
//! timeout = 30
//!
//! [zmq]
//! broker = tcp://127.0.0.1:10111
//! publish = tcp://127.0.0.1:10112
//! subscribe = tcp://127.0.0.1:10113
//! pool = 2
//! timeout = 1
//! error-on-join-timeout = false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Environment variable naming a configuration file.
pub const CONFIG_ENV_VAR: &str = "MKTL_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MKTL";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MKTL_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings shared by every role.
    pub core: CoreConfig,
    /// Transport settings.
    pub zmq: ZmqConfig,
}

/// `[core]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Default seconds for any synchronous operation.
    pub timeout: f64,
    /// Reject keywords missing from the catalog instead of warning.
    pub strict: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            timeout: 30.0,
            strict: false,
        }
    }
}

/// `[zmq]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ZmqConfig {
    /// Request endpoint (broker ROUTER).
    pub broker: String,
    /// Endpoint dispatchers publish broadcasts to.
    pub publish: String,
    /// Endpoint clients subscribe to.
    pub subscribe: String,
    /// Number of dispatcher workers.
    pub pool: usize,
    /// Broker event-loop poll timeout, in seconds.
    pub timeout: f64,
    /// Seconds to wait for a task to stop during shutdown.
    #[serde(rename = "join-timeout")]
    pub join_timeout: f64,
    /// Treat a join timeout as a hard error.
    #[serde(rename = "error-on-join-timeout")]
    pub error_on_join_timeout: bool,
}

impl Default for ZmqConfig {
    fn default() -> Self {
        Self {
            broker: "tcp://127.0.0.1:10111".to_string(),
            publish: "tcp://127.0.0.1:10112".to_string(),
            subscribe: "tcp://127.0.0.1:10113".to_string(),
            pool: 2,
            timeout: 1.0,
            join_timeout: 5.0,
            error_on_join_timeout: false,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. Built-in defaults
    /// 2. File given by `path`, or by `CONFIG_ENV_VAR` when `path` is `None`
    /// 3. Environment variables with the `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder();

        let env_path = std::env::var(CONFIG_ENV_VAR).ok();
        let file = path
            .map(|p| p.to_string_lossy().into_owned())
            .or(env_path);
        if let Some(file) = file {
            builder = builder.add_source(File::new(&file, FileFormat::Ini).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse INI text directly.
    pub fn from_ini(text: &str) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, File, FileFormat};

        let config: Config = ConfigLib::builder()
            .add_source(File::from_str(text, FileFormat::Ini))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.zmq.pool == 0 {
            return Err(ConfigError::Invalid {
                key: "zmq.pool",
                message: "at least one worker is required".to_string(),
            });
        }
        for (key, value) in [
            ("core.timeout", self.core.timeout),
            ("zmq.timeout", self.zmq.timeout),
            ("zmq.join-timeout", self.zmq.join_timeout),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid {
                    key,
                    message: format!("expected a positive number of seconds, got {value}"),
                });
            }
        }
        Ok(())
    }

    /// Default timeout for synchronous operations.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.core.timeout)
    }

    /// Broker poll timeout; also the unit of dispatcher liveness.
    pub fn broker_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.zmq.timeout)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.zmq.join_timeout)
    }

    /// Configuration with every endpoint under an `ipc://` directory.
    pub fn for_ipc(dir: &Path) -> Self {
        let endpoint = |name: &str| format!("ipc://{}", dir.join(name).display());
        Self {
            zmq: ZmqConfig {
                broker: endpoint("broker.sock"),
                publish: endpoint("publish.sock"),
                subscribe: endpoint("subscribe.sock"),
                ..ZmqConfig::default()
            },
            ..Self::default()
        }
    }
}
