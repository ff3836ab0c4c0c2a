//! Configuration model, file loading and environment overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors from configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override carried an unparseable value.
    #[error("invalid value for {key}: {value}")]
    InvalidOverride {
        /// Environment variable name.
        key: String,
        /// The offending value.
        value: String,
    },

    /// A validation rule failed.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DispatchConfig {
    /// Per-dispatch ack window in seconds.
    pub ack_timeout_seconds: f64,
    /// Attempts before a task is given up on.
    pub max_attempts: u32,
    /// Base retry backoff in seconds.
    pub base_retry_seconds: f64,
    /// Retry backoff cap in seconds.
    pub max_retry_seconds: f64,
    /// Worker selection policy name.
    pub worker_strategy: String,
    /// Stale worker cutoff; `None` means no cap.
    pub worker_max_heartbeat_age_seconds: Option<f64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_timeout_seconds: 5.0,
            max_attempts: 5,
            base_retry_seconds: 1.0,
            max_retry_seconds: 30.0,
            worker_strategy: "default".into(),
            worker_max_heartbeat_age_seconds: None,
        }
    }
}

/// Reconnect backoff bounds (advertised to workers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ReconnectConfig {
    /// Initial delay in seconds.
    pub base_delay_seconds: f64,
    /// Delay cap in seconds.
    pub max_delay_seconds: f64,
    /// Jitter fraction applied to each delay.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: 1.0,
            max_delay_seconds: 30.0,
            jitter: 0.2,
        }
    }
}

/// Retry policy for outbound frames that requested an ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AckRetryConfig {
    /// Base backoff in milliseconds.
    pub base_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_ms: u64,
    /// Resend attempts before the send is failed.
    pub attempts: u32,
}

impl Default for AckRetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 200,
            max_ms: 2000,
            attempts: 5,
        }
    }
}

/// Worker session tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SessionConfig {
    /// Sliding-window credits per session.
    pub window_size: u32,
    /// Heartbeat pacing advertised to workers, in seconds.
    pub heartbeat_interval_seconds: u64,
    /// Heartbeat jitter advertised to workers, in seconds.
    pub heartbeat_jitter_seconds: u64,
    /// How long a disconnected session stays resumable, in seconds.
    pub resume_grace_seconds: u64,
    /// Reconnect backoff bounds.
    pub reconnect: ReconnectConfig,
    /// Ack retry policy for outbound frames.
    pub ack_retry: AckRetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: 64,
            heartbeat_interval_seconds: 30,
            heartbeat_jitter_seconds: 5,
            resume_grace_seconds: 300,
            reconnect: ReconnectConfig::default(),
            ack_retry: AckRetryConfig::default(),
        }
    }
}

/// Resource binding limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ResourceConfig {
    /// Largest resource value inlined into a dispatch, in bytes.
    pub max_inline_bytes: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_inline_bytes: 64 * 1024,
        }
    }
}

/// Server identity and listen settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ServerConfig {
    /// Socket address the control plane binds to.
    pub bind_addr: String,
    /// Expected worker auth token; `None` disables token checking.
    pub auth_token: Option<String>,
    /// Secret used to mint session tokens; generated when unset.
    pub session_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".into(),
            auth_token: None,
            session_secret: None,
        }
    }
}

/// Complete scheduler configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Dispatcher tuning.
    pub dispatch: DispatchConfig,
    /// Worker session tuning.
    pub session: SessionConfig,
    /// Resource binding limits.
    pub resource: ResourceConfig,
    /// Server identity and listen settings.
    pub server: ServerConfig,
}

impl SchedulerConfig {
    /// Load configuration: defaults, then an optional TOML file, then
    /// `LATTICE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LATTICE_*` overrides from an environment snapshot.
    pub fn apply_env_overrides(
        &mut self,
        vars: impl Iterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidOverride {
                key: key.to_owned(),
                value: value.to_owned(),
            })
        }

        for (key, value) in vars {
            match key.as_str() {
                "LATTICE_DISPATCH_ACK_TIMEOUT_SECONDS" => {
                    self.dispatch.ack_timeout_seconds = parse(&key, &value)?;
                }
                "LATTICE_DISPATCH_MAX_ATTEMPTS" => {
                    self.dispatch.max_attempts = parse(&key, &value)?;
                }
                "LATTICE_DISPATCH_BASE_RETRY_SECONDS" => {
                    self.dispatch.base_retry_seconds = parse(&key, &value)?;
                }
                "LATTICE_DISPATCH_MAX_RETRY_SECONDS" => {
                    self.dispatch.max_retry_seconds = parse(&key, &value)?;
                }
                "LATTICE_DISPATCH_WORKER_STRATEGY" => {
                    self.dispatch.worker_strategy = value;
                }
                "LATTICE_DISPATCH_WORKER_MAX_HEARTBEAT_AGE_SECONDS" => {
                    self.dispatch.worker_max_heartbeat_age_seconds =
                        Some(parse(&key, &value)?);
                }
                "LATTICE_SESSION_WINDOW_SIZE" => {
                    self.session.window_size = parse(&key, &value)?;
                }
                "LATTICE_SESSION_HEARTBEAT_INTERVAL_SECONDS" => {
                    self.session.heartbeat_interval_seconds = parse(&key, &value)?;
                }
                "LATTICE_SESSION_HEARTBEAT_JITTER_SECONDS" => {
                    self.session.heartbeat_jitter_seconds = parse(&key, &value)?;
                }
                "LATTICE_SESSION_RESUME_GRACE_SECONDS" => {
                    self.session.resume_grace_seconds = parse(&key, &value)?;
                }
                "LATTICE_SESSION_RECONNECT_BASE_DELAY_SECONDS" => {
                    self.session.reconnect.base_delay_seconds = parse(&key, &value)?;
                }
                "LATTICE_SESSION_RECONNECT_MAX_DELAY_SECONDS" => {
                    self.session.reconnect.max_delay_seconds = parse(&key, &value)?;
                }
                "LATTICE_SESSION_RECONNECT_JITTER" => {
                    self.session.reconnect.jitter = parse(&key, &value)?;
                }
                "LATTICE_RESOURCE_MAX_INLINE_BYTES" => {
                    self.resource.max_inline_bytes = parse(&key, &value)?;
                }
                "LATTICE_SERVER_BIND_ADDR" => self.server.bind_addr = value,
                "LATTICE_SERVER_AUTH_TOKEN" => self.server.auth_token = Some(value),
                "LATTICE_SERVER_SESSION_SECRET" => self.server.session_secret = Some(value),
                _ => {}
            }
        }
        Ok(())
    }

    /// Check invariants between related settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.window_size == 0 {
            return Err(ConfigError::Invalid("session.window_size must be >= 1".into()));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(ConfigError::Invalid("dispatch.max_attempts must be >= 1".into()));
        }
        if self.dispatch.base_retry_seconds > self.dispatch.max_retry_seconds {
            return Err(ConfigError::Invalid(
                "dispatch.base_retry_seconds must not exceed dispatch.max_retry_seconds".into(),
            ));
        }
        if self.session.reconnect.base_delay_seconds > self.session.reconnect.max_delay_seconds {
            return Err(ConfigError::Invalid(
                "session.reconnect base delay must not exceed the max delay".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.session.reconnect.jitter) {
            return Err(ConfigError::Invalid(
                "session.reconnect.jitter must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}
