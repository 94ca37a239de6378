//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags** (applied by the binary)
//! 2. **Environment variables**: `VCR_API_KEY`, `VCR_API_SECRET`,
//!    `VCR_REGION`, `VCR_DEBUG_APP_PORT`, `VCR_DEBUG_DEBUGGER_PORT`
//! 3. **Config file**: path via `--config <path>`, or `vcr-debug.toml` in CWD
//! 4. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [debugger]
//! app_port = 3000
//! debugger_port = 3001
//! app_host = "localhost"
//! verbose = false
//! preserve_data = false
//! shutdown_grace_secs = 5
//! # remote_request_timeout_secs = 30   # unset = wait forever
//!
//! [app]
//! entrypoint = ["node", "index.js"]
//! working_dir = "."
//! application_id = "00000000-0000-0000-0000-000000000000"
//! name = "my-debugger"
//!
//! # Variables for the app; `secret` reads the value from the local environment
//! [[app.environment]]
//! name = "DB_PASSWORD"
//! secret = "LOCAL_DB_PASSWORD"
//!
//! # Used only when [[app.environment]] is empty
//! [[app.instance_environment]]
//! name = "MODE"
//! value = "production"
//!
//! [credentials]
//! api_key = "key"
//! api_secret = "secret"
//!
//! # An already deployed debug service
//! [service]
//! service_name = "my-debugger-abc"
//! websocket_path = "ws-3f1c"
//! instance_id = "..."
//! private_key = "..."
//!
//! [region]
//! alias = "euw1"
//! host_template = "https://{{.ServiceName}}.euw1.runtime.example.cloud"
//! endpoint_url_scheme = "https"
//! debugger_url_scheme = "https"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::process::EnvVar;
use crate::session::{DeployResponse, PreDeployedService, Region, SessionOptions, READY_INTERVALS};

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "vcr-debug.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {error}")]
    Read {
        path: String,
        error: std::io::Error,
    },
    #[error("failed to parse config file {path}: {error}")]
    Parse {
        path: String,
        error: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}: {reason}")]
    Env {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub debugger: DebuggerConfig,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub region: RegionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local ports and tunnel behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct DebuggerConfig {
    /// Port the developer's app listens on (default 3000).
    #[serde(default = "default_app_port")]
    pub app_port: u16,
    /// Port of the local gateway for remote-provider calls (default 3001).
    #[serde(default = "default_debugger_port")]
    pub debugger_port: u16,
    /// Host the app is reached on (default `localhost`).
    #[serde(default = "default_app_host")]
    pub app_host: String,
    /// Trace every tunnel message.
    #[serde(default)]
    pub verbose: bool,
    /// Keep the debug service's data when it is removed.
    #[serde(default)]
    pub preserve_data: bool,
    /// Seconds the gateway gets to drain on shutdown (default 5).
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Bound on the wait for a remote response. Unset waits indefinitely.
    #[serde(default)]
    pub remote_request_timeout_secs: Option<u64>,
}

/// The developer's application.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Program and arguments that start the app.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Code directory; the app runs here (default `.`).
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default)]
    pub application_id: String,
    /// Name for the debug service.
    #[serde(default)]
    pub name: String,
    /// Variables injected into the app in debug mode.
    #[serde(default)]
    pub environment: Vec<EnvVar>,
    /// The deployed instance's variables; the fallback when `environment`
    /// is empty.
    #[serde(default)]
    pub instance_environment: Vec<EnvVar>,
}

/// Account credentials handed to the app. Override with `VCR_API_KEY` and
/// `VCR_API_SECRET`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
}

/// An already deployed debug service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub websocket_path: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub private_key: String,
}

/// Region the debug service runs in. Override the alias with `VCR_REGION`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    #[serde(default)]
    pub alias: String,
    /// Host of a service, with `{{.ServiceName}}` as placeholder.
    #[serde(default)]
    pub host_template: String,
    #[serde(default = "default_url_scheme")]
    pub endpoint_url_scheme: String,
    #[serde(default = "default_url_scheme")]
    pub debugger_url_scheme: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_app_port() -> u16 {
    3000
}
fn default_debugger_port() -> u16 {
    3001
}
fn default_app_host() -> String {
    "localhost".to_string()
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_url_scheme() -> String {
    "https".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            app_port: default_app_port(),
            debugger_port: default_debugger_port(),
            app_host: default_app_host(),
            verbose: false,
            preserve_data: false,
            shutdown_grace_secs: default_shutdown_grace_secs(),
            remote_request_timeout_secs: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            entrypoint: Vec::new(),
            working_dir: default_working_dir(),
            application_id: String::new(),
            name: String::new(),
            environment: Vec::new(),
            instance_environment: Vec::new(),
        }
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            alias: String::new(),
            host_template: String::new(),
            endpoint_url_scheme: default_url_scheme(),
            debugger_url_scheme: default_url_scheme(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `vcr-debug.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.display().to_string(),
            error,
        })?;
        toml::from_str(&content).map_err(|error| ConfigError::Parse {
            path: path.display().to_string(),
            error,
        })
    }

    /// Apply env var overrides, reading variables through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("VCR_API_KEY") {
            self.credentials.api_key = key;
        }
        if let Some(secret) = lookup("VCR_API_SECRET") {
            self.credentials.api_secret = secret;
        }
        if let Some(region) = lookup("VCR_REGION") {
            self.region.alias = region;
        }
        if let Some(port) = lookup("VCR_DEBUG_APP_PORT") {
            self.debugger.app_port = parse_port("VCR_DEBUG_APP_PORT", port)?;
        }
        if let Some(port) = lookup("VCR_DEBUG_DEBUGGER_PORT") {
            self.debugger.debugger_port = parse_port("VCR_DEBUG_DEBUGGER_PORT", port)?;
        }
        Ok(())
    }

    /// Session parameters for the configured app.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            region: self.region.alias.clone(),
            application_id: self.app.application_id.clone(),
            name: self.app.name.clone(),
            entrypoint: self.app.entrypoint.clone(),
            working_dir: self.app.working_dir.clone(),
            api_key: self.credentials.api_key.clone(),
            api_secret: self.credentials.api_secret.clone(),
            app_host: self.debugger.app_host.clone(),
            app_port: self.debugger.app_port,
            debugger_port: self.debugger.debugger_port,
            preserve_data: self.debugger.preserve_data,
            verbose: self.debugger.verbose,
            shutdown_grace: Duration::from_secs(self.debugger.shutdown_grace_secs),
            remote_request_timeout: self
                .debugger
                .remote_request_timeout_secs
                .map(Duration::from_secs),
            ready_intervals: READY_INTERVALS.to_vec(),
            environment: self.app_environment(),
        }
    }

    /// Debug variables, or the instance variables when none are declared.
    pub fn app_environment(&self) -> Vec<EnvVar> {
        if !self.app.environment.is_empty() {
            return self.app.environment.clone();
        }
        if !self.app.instance_environment.is_empty() {
            warn!(
                "no debug environment values configured, loading the instance environment \
                 values instead; consider adding [[app.environment]]"
            );
        }
        self.app.instance_environment.clone()
    }

    /// The `[service]` and `[region]` sections as a deployment collaborator.
    pub fn pre_deployed_service(&self) -> PreDeployedService {
        PreDeployedService {
            service: DeployResponse {
                service_name: self.service.service_name.clone(),
                private_key: self.service.private_key.clone(),
                instance_id: self.service.instance_id.clone(),
                websocket_path: self.service.websocket_path.clone(),
            },
            region: Region {
                name: self.region.alias.clone(),
                alias: self.region.alias.clone(),
                endpoint_url_scheme: self.region.endpoint_url_scheme.clone(),
                debugger_url_scheme: self.region.debugger_url_scheme.clone(),
                host_template: self.region.host_template.clone(),
            },
        }
    }
}

fn parse_port(var: &'static str, value: String) -> Result<u16, ConfigError> {
    value.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Env {
        var,
        reason: e.to_string(),
        value,
    })
}
