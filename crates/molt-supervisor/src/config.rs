//! Supervisor configuration.
//!
//! Loaded from an optional TOML file, then overridden from the environment,
//! then (in `main`) from the command line. Every section has defaults, so an
//! empty file is valid as long as a service command is supplied somewhere.
//!
//! # Environment Variables
//!
//! - `MOLT_LISTEN_ADDR`: Service listen address. Default: `0.0.0.0:8080`
//! - `MOLT_RUNTIME_DIR`: Private directory for relay endpoints and the
//!   control socket. Default: `$XDG_RUNTIME_DIR/molt`, else `/tmp/molt`
//! - `MOLT_LOG_LEVEL`: Default log level when `RUST_LOG` is unset
//! - `MOLT_LOG_FORMAT`: `pretty` or `json`
//! - `MOLT_METRICS_ADDR`: Address for the Prometheus `/metrics` endpoint.
//!   Unset disables it

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use molt_ecdysis::relay::DEFAULT_MAX_STATE_BYTES;
use molt_ecdysis::DEFAULT_BACKLOG;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

const CONTROL_SOCKET_NAME: &str = "supervisor.sock";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The managed service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Name used in logs and status reports
    pub name: String,
    /// Program and arguments of each generation
    pub command: Vec<String>,
    /// Extra environment for each generation
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

/// The shared service listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub address: SocketAddr,
    pub backlog: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Handoff timing and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    pub runtime_dir: PathBuf,
    /// How long a new generation may take to report ready
    pub ready_timeout_ms: u64,
    /// How long the old generation may take to open the relay endpoint
    pub relay_open_timeout_ms: u64,
    /// Per-transfer relay timeout, passed to both generations
    pub relay_timeout_ms: u64,
    /// In-flight drain timeout, passed to each generation
    pub drain_timeout_ms: u64,
    /// How long a draining generation may live before SIGKILL
    pub exit_grace_ms: u64,
    pub max_state_bytes: usize,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(|key| std::env::var(key).ok()),
            ready_timeout_ms: 30_000,
            relay_open_timeout_ms: 5_000,
            relay_timeout_ms: 5_000,
            drain_timeout_ms: 20_000,
            exit_grace_ms: 30_000,
            max_state_bytes: DEFAULT_MAX_STATE_BYTES,
        }
    }
}

impl HandoffConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn relay_open_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_open_timeout_ms)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }
}

/// An operator command run around a handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookConfig {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default = "default_hook_timeout_ms")]
    pub timeout_ms: u64,
}

impl HookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_hook_timeout_ms() -> u64 {
    30_000
}

/// Hooks run once a handoff has settled. Their failures are logged and
/// never change the outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessConfig {
    /// After the previous generation has exited
    pub on_success: Vec<HookConfig>,
    /// After a failed or cancelled handoff has been rolled back
    pub on_failure: Vec<HookConfig>,
}

/// Operator control socket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Defaults to `<runtime_dir>/supervisor.sock`
    pub socket_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    /// Prometheus scrape endpoint; disabled when unset
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: LogFormat::Pretty,
            metrics_addr: None,
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub service: ServiceConfig,
    pub listener: ListenerConfig,
    pub handoff: HandoffConfig,
    pub pre_flight: Vec<HookConfig>,
    pub post_process: PostProcessConfig,
    pub control: ControlConfig,
    pub observability: ObservabilityConfig,
}

impl SupervisorConfig {
    /// Load from `path` (if any) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MOLT_LISTEN_ADDR") {
            self.listener.address = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: "MOLT_LISTEN_ADDR",
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("MOLT_RUNTIME_DIR").filter(|v| !v.is_empty()) {
            self.handoff.runtime_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("MOLT_LOG_LEVEL").filter(|v| !v.is_empty()) {
            self.observability.log_level = value;
        }
        if let Some(value) = lookup("MOLT_LOG_FORMAT") {
            self.observability.log_format = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "MOLT_LOG_FORMAT",
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("MOLT_METRICS_ADDR").filter(|v| !v.is_empty()) {
            let addr = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: "MOLT_METRICS_ADDR",
                value: value.clone(),
            })?;
            self.observability.metrics_addr = Some(addr);
        }
        Ok(())
    }

    /// Check the configuration is usable. Run after all overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.command.is_empty() || self.service.command[0].is_empty() {
            return Err(ConfigError::Invalid(
                "service.command must name a program".into(),
            ));
        }

        let handoff = &self.handoff;
        let timeouts = [
            ("handoff.ready_timeout_ms", handoff.ready_timeout_ms),
            ("handoff.relay_open_timeout_ms", handoff.relay_open_timeout_ms),
            ("handoff.relay_timeout_ms", handoff.relay_timeout_ms),
            ("handoff.drain_timeout_ms", handoff.drain_timeout_ms),
            ("handoff.exit_grace_ms", handoff.exit_grace_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if handoff.exit_grace_ms < handoff.drain_timeout_ms {
            return Err(ConfigError::Invalid(
                "handoff.exit_grace_ms must not be shorter than handoff.drain_timeout_ms".into(),
            ));
        }
        if handoff.max_state_bytes > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "handoff.max_state_bytes cannot exceed {}",
                u32::MAX
            )));
        }

        let hooks = [
            ("pre_flight", &self.pre_flight),
            ("post_process.on_success", &self.post_process.on_success),
            ("post_process.on_failure", &self.post_process.on_failure),
        ];
        for (section, hooks) in hooks {
            if let Some(hook) = hooks.iter().find(|h| h.command.is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "{section} hook '{}' has no command",
                    hook.name
                )));
            }
        }
        if self.observability.metrics_addr == Some(self.listener.address) {
            return Err(ConfigError::Invalid(
                "observability.metrics_addr must differ from listener.address".into(),
            ));
        }
        Ok(())
    }

    pub fn service_name(&self) -> &str {
        if self.service.name.is_empty() {
            self.service.command.first().map_or("service", String::as_str)
        } else {
            &self.service.name
        }
    }

    pub fn control_socket_path(&self) -> PathBuf {
        self.control
            .socket_path
            .clone()
            .unwrap_or_else(|| self.handoff.runtime_dir.join(CONTROL_SOCKET_NAME))
    }

    pub fn log_config(&self) {
        info!("Service: {} ({})", self.service_name(), self.service.command.join(" "));
        info!("Listen address: {} (backlog {})", self.listener.address, self.listener.backlog);
        info!("Runtime directory: {}", self.handoff.runtime_dir.display());
        info!("Control socket: {}", self.control_socket_path().display());
        info!(
            "Handoff timeouts: ready {}ms, relay open {}ms, relay {}ms, drain {}ms, exit grace {}ms",
            self.handoff.ready_timeout_ms,
            self.handoff.relay_open_timeout_ms,
            self.handoff.relay_timeout_ms,
            self.handoff.drain_timeout_ms,
            self.handoff.exit_grace_ms,
        );
        info!("State snapshot limit: {} bytes", self.handoff.max_state_bytes);
        info!("Pre-flight hooks: {}", hook_names(&self.pre_flight));
        info!(
            "Post-process hooks: on success {}, on failure {}",
            hook_names(&self.post_process.on_success),
            hook_names(&self.post_process.on_failure),
        );
        match self.observability.metrics_addr {
            Some(addr) => info!("Metrics endpoint: http://{addr}/metrics"),
            None => info!("Metrics endpoint: disabled"),
        }
    }

    /// Configuration for tests: ephemeral port, fast timeouts.
    pub fn for_tests(command: Vec<String>, runtime_dir: &Path) -> Self {
        Self {
            service: ServiceConfig {
                name: "test-agent".into(),
                command,
                ..ServiceConfig::default()
            },
            listener: ListenerConfig {
                address: SocketAddr::from(([127, 0, 0, 1], 0)),
                backlog: 128,
            },
            handoff: HandoffConfig {
                runtime_dir: runtime_dir.to_path_buf(),
                ready_timeout_ms: 10_000,
                relay_open_timeout_ms: 5_000,
                relay_timeout_ms: 5_000,
                drain_timeout_ms: 2_000,
                exit_grace_ms: 5_000,
                max_state_bytes: DEFAULT_MAX_STATE_BYTES,
            },
            ..Self::default()
        }
    }
}

fn hook_names(hooks: &[HookConfig]) -> String {
    if hooks.is_empty() {
        return "none".into();
    }
    hooks.iter().map(|h| h.name.as_str()).collect::<Vec<_>>().join(", ")
}

fn default_runtime_dir(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    match lookup("XDG_RUNTIME_DIR").filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir).join("molt"),
        None => PathBuf::from("/tmp/molt"),
    }
}
