//! Router configuration.
//!
//! Every field has a default so a partial JSON document (or none at all)
//! yields a usable [`RouterConfig`]. Heartbeats stay disabled unless a
//! `heartbeat` section is present.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default values applied when a field is omitted.
pub mod defaults {
    pub const RPC_TIMEOUT_MS: u64 = 30_000;
    /// Added to the RPC timeout to derive the idle timeout.
    pub const RPC_IDLE_GRACE_MS: u64 = 10_000;
    pub const RPC_CLEANUP_CADENCE_MS: u64 = 5_000;
    pub const RPC_DEDUP_WINDOW_MS: u64 = 3_600_000;
    pub const RPC_MAX_INFLIGHT_PER_SOCKET: usize = 1_000;
    pub const SOCKET_BUFFER_LIMIT_BYTES: usize = 1024 * 1024;
    pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;
    pub const HEARTBEAT_TIMEOUT_MS: u64 = 5_000;
    /// "Message too big".
    pub const LIMIT_CLOSE_CODE: u16 = 1009;
}

/// Errors raised by [`RouterConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A duration that drives a timer was zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    /// A ceiling was configured as zero, which would reject everything.
    #[error("{0} must be greater than zero when set")]
    ZeroLimit(&'static str),
}

/// What to do when a limit is exceeded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnExceeded {
    /// Send a `RESOURCE_EXHAUSTED` error frame and keep the connection.
    #[default]
    Send,
    /// Close the connection with [`LimitsConfig::close_code`].
    Close,
    /// Only run `on_limit_exceeded` hooks.
    Custom,
}

/// Heartbeat timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: defaults::HEARTBEAT_INTERVAL_MS,
            timeout_ms: defaults::HEARTBEAT_TIMEOUT_MS,
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn interval(&self) -> Duration { Duration::from_millis(self.interval_ms) }

    #[must_use]
    pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }
}

/// Per-message and per-connection ceilings. `None` means unlimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsConfig {
    pub max_payload_bytes: Option<usize>,
    pub max_pending: Option<usize>,
    pub on_exceeded: OnExceeded,
    pub close_code: u16,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: None,
            max_pending: None,
            on_exceeded: OnExceeded::Send,
            close_code: defaults::LIMIT_CLOSE_CODE,
        }
    }
}

/// Whether authentication failures close the connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    pub close_on_unauthenticated: bool,
    pub close_on_permission_denied: bool,
}

/// Complete router configuration.
///
/// ```
/// use wsdispatch::config::RouterConfig;
///
/// let cfg: RouterConfig =
///     serde_json::from_str(r#"{"rpcTimeoutMs": 1000, "limits": {"maxPending": 4}}"#)
///         .expect("valid config");
/// assert_eq!(cfg.rpc_idle_timeout().as_millis(), 11_000);
/// assert_eq!(cfg.limits.max_pending, Some(4));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    pub heartbeat: Option<HeartbeatConfig>,
    pub limits: LimitsConfig,
    pub rpc_timeout_ms: u64,
    /// Defaults to `rpc_timeout_ms` plus ten seconds.
    pub rpc_idle_timeout_ms: Option<u64>,
    pub rpc_cleanup_cadence_ms: u64,
    pub rpc_dedup_window_ms: u64,
    pub rpc_max_inflight_per_socket: Option<usize>,
    pub socket_buffer_limit_bytes: Option<usize>,
    pub drop_progress_on_backpressure: bool,
    pub auto_send_error_on_throw: bool,
    pub expose_error_details: bool,
    pub auth: AuthConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            heartbeat: None,
            limits: LimitsConfig::default(),
            rpc_timeout_ms: defaults::RPC_TIMEOUT_MS,
            rpc_idle_timeout_ms: None,
            rpc_cleanup_cadence_ms: defaults::RPC_CLEANUP_CADENCE_MS,
            rpc_dedup_window_ms: defaults::RPC_DEDUP_WINDOW_MS,
            rpc_max_inflight_per_socket: Some(defaults::RPC_MAX_INFLIGHT_PER_SOCKET),
            socket_buffer_limit_bytes: Some(defaults::SOCKET_BUFFER_LIMIT_BYTES),
            drop_progress_on_backpressure: true,
            auto_send_error_on_throw: true,
            expose_error_details: false,
            auth: AuthConfig::default(),
        }
    }
}

impl RouterConfig {
    #[must_use]
    pub fn rpc_timeout(&self) -> Duration { Duration::from_millis(self.rpc_timeout_ms) }

    #[must_use]
    pub fn rpc_idle_timeout(&self) -> Duration {
        Duration::from_millis(
            self.rpc_idle_timeout_ms
                .unwrap_or_else(|| self.rpc_timeout_ms.saturating_add(defaults::RPC_IDLE_GRACE_MS)),
        )
    }

    #[must_use]
    pub fn rpc_cleanup_cadence(&self) -> Duration {
        Duration::from_millis(self.rpc_cleanup_cadence_ms)
    }

    #[must_use]
    pub fn rpc_dedup_window(&self) -> Duration { Duration::from_millis(self.rpc_dedup_window_ms) }

    /// Check that timers and ceilings are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration("rpcTimeoutMs"));
        }
        if self.rpc_idle_timeout_ms == Some(0) {
            return Err(ConfigError::ZeroDuration("rpcIdleTimeoutMs"));
        }
        if self.rpc_cleanup_cadence_ms == 0 {
            return Err(ConfigError::ZeroDuration("rpcCleanupCadenceMs"));
        }
        if let Some(hb) = self.heartbeat {
            if hb.interval_ms == 0 {
                return Err(ConfigError::ZeroDuration("heartbeat.intervalMs"));
            }
            if hb.timeout_ms == 0 {
                return Err(ConfigError::ZeroDuration("heartbeat.timeoutMs"));
            }
        }
        if self.limits.max_payload_bytes == Some(0) {
            return Err(ConfigError::ZeroLimit("limits.maxPayloadBytes"));
        }
        if self.limits.max_pending == Some(0) {
            return Err(ConfigError::ZeroLimit("limits.maxPending"));
        }
        if self.rpc_max_inflight_per_socket == Some(0) {
            return Err(ConfigError::ZeroLimit("rpcMaxInflightPerSocket"));
        }
        Ok(())
    }
}
