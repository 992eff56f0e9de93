//! Worker configuration with layered loading.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML
//! file, `STRATUS_WORKER_*` environment variables, then command-line
//! arguments passed by the host.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Error as FigmentError, Figment};
use serde::{Deserialize, Serialize};
use stratus_proto::codec::{MAX_FRAME_PAYLOAD, MAX_MESSAGE_SIZE};
use thiserror::Error;

/// Configuration file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "worker.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "STRATUS_WORKER_";

/// Errors that can occur when loading worker configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error from the Figment configuration library.
    #[error("configuration error: {0}")]
    Figment(Box<FigmentError>),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<FigmentError> for ConfigError {
    fn from(err: FigmentError) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Settings for one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Host address to connect to.
    pub host: String,

    /// Host port to connect to.
    pub port: u16,

    /// Identifier announced in the start-stream message.
    pub worker_id: String,

    /// Identifier of the host request that started this worker.
    pub request_id: String,

    /// Largest frame accepted or sent, in bytes.
    pub max_message_length: usize,

    /// Report user code faults with their original type and message.
    pub enable_user_code_exception: bool,

    /// Extra capabilities advertised to the host.
    pub capabilities: BTreeMap<String, String>,

    /// Function app directory used before the host sends one.
    pub function_app_directory: Option<PathBuf>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 7071,
            worker_id: ulid::Ulid::new().to_string(),
            request_id: String::new(),
            max_message_length: MAX_MESSAGE_SIZE,
            enable_user_code_exception: true,
            capabilities: BTreeMap::new(),
            function_app_directory: None,
        }
    }
}

/// Command-line arguments passed to the worker by the host.
#[derive(Parser, Debug, Clone, Default, Serialize)]
#[command(name = "stratus-worker")]
#[command(about = "Run a stratus language worker")]
#[command(version)]
pub struct WorkerArgs {
    /// Host address.
    #[arg(long, env = "STRATUS_HOST")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Host port.
    #[arg(long, env = "STRATUS_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Worker identifier.
    #[arg(long = "worker-id")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    /// Host request identifier.
    #[arg(long = "request-id")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Maximum message length in bytes.
    #[arg(long = "max-message-length")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_length: Option<usize>,

    /// Path to a TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    #[serde(skip)]
    pub config: Option<PathBuf>,
}

impl WorkerOptions {
    /// Loads options from every source.
    pub fn load(args: &WorkerArgs) -> Result<Self, ConfigError> {
        let file = args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::figment(&file, args).extract::<Self>()?.validated()
    }

    /// Parses options from a TOML string, applying defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(content))
            .extract::<Self>()?
            .validated()
    }

    fn figment(file: &Path, args: &WorkerArgs) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::defaults(args))
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must not be zero".into()));
        }
        if self.max_message_length == 0 {
            return Err(ConfigError::Invalid(
                "max_message_length must be positive".into(),
            ));
        }
        if self.max_message_length > MAX_FRAME_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "max_message_length must not exceed {MAX_FRAME_PAYLOAD}"
            )));
        }
        if self.worker_id.is_empty() {
            return Err(ConfigError::Invalid("worker_id must not be empty".into()));
        }
        Ok(self)
    }

    /// Returns the `host:port` address of the host.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults() {
        let options = WorkerOptions::parse("").unwrap();
        assert_eq!(options.address(), "127.0.0.1:7071");
        assert!(options.enable_user_code_exception);
        assert_eq!(options.max_message_length, MAX_MESSAGE_SIZE);
        assert!(!options.worker_id.is_empty());
    }

    #[test]
    fn toml_overrides_defaults() {
        let options = WorkerOptions::parse(
            r#"
            port = 9000
            enable_user_code_exception = false

            [capabilities]
            CustomCapability = "1"
            "#,
        )
        .unwrap();

        assert_eq!(options.port, 9000);
        assert!(!options.enable_user_code_exception);
        assert_eq!(options.capabilities.get("CustomCapability").map(String::as_str), Some("1"));
    }

    #[test]
    fn zero_port_rejected() {
        let err = WorkerOptions::parse("port = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn oversized_message_limit_rejected() {
        let err = WorkerOptions::parse("max_message_length = 4294967296").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid(message) if message.contains("max_message_length")
        ));
    }

    #[test]
    fn layered_sources() {
        Jail::expect_with(|jail| {
            jail.create_file("worker.toml", "port = 8000\nhost = \"10.0.0.1\"")?;
            jail.set_env("STRATUS_WORKER_PORT", "8100");
            jail.set_env("STRATUS_WORKER_REQUEST_ID", "req-env");

            let args = WorkerArgs {
                worker_id: Some("w-cli".into()),
                request_id: Some("req-cli".into()),
                ..WorkerArgs::default()
            };
            let options = WorkerOptions::load(&args).map_err(|e| e.to_string())?;

            assert_eq!(options.host, "10.0.0.1");
            assert_eq!(options.port, 8100);
            assert_eq!(options.worker_id, "w-cli");
            assert_eq!(options.request_id, "req-cli");
            Ok(())
        });
    }

    #[test]
    fn args_parse() {
        let args = WorkerArgs::try_parse_from([
            "stratus-worker",
            "--host",
            "localhost",
            "--port",
            "5000",
            "--worker-id",
            "w1",
            "--max-message-length",
            "1024",
        ])
        .unwrap();

        assert_eq!(args.host.as_deref(), Some("localhost"));
        assert_eq!(args.port, Some(5000));
        assert_eq!(args.max_message_length, Some(1024));
    }
}
