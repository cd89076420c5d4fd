//! Client configuration types.
//!
//! [`ClientConfig`] is the runtime view of the configuration: durations are
//! real [`Duration`]s and every device has a resolved port and endpoint.  The
//! on-disk TOML schema lives in
//! [`infrastructure::config_file`](crate::infrastructure::config_file), which
//! converts into these types.

use std::time::Duration;

use sonoff_core::protocol::frame::{DEFAULT_ENDPOINT, DEFAULT_PORT};

/// Apikey sent in the handshake and in commands.  LAN-mode firmware accepts
/// the literal string `"nonce"`.
pub const DEFAULT_API_KEY: &str = "nonce";

/// Ping interval of the stock firmware.
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(145);

/// Timing rules for connecting, keepalive and reconnecting.
///
/// | Field                      | Default  |
/// |----------------------------|----------|
/// | `connect_timeout`          | 10 s     |
/// | `handshake_timeout`        | 10 s     |
/// | `keepalive_interval`       | 145 s    |
/// | `keepalive_timeout_factor` | 2        |
/// | `reconnect_initial`        | 1 s      |
/// | `reconnect_max`            | 60 s     |
/// | `min_stable_session`       | 10 s     |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPolicy {
    pub connect_timeout: Duration,
    /// How long to wait for the first frame after sending `userOnline`.
    pub handshake_timeout: Duration,
    /// Ping interval used when neither the device config nor the device
    /// itself specifies one.
    pub keepalive_interval: Duration,
    /// A session with no inbound traffic for `interval × factor` is dead.
    pub keepalive_timeout_factor: u32,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// A session must stay ready this long before a loss resets the
    /// reconnect backoff.
    pub min_stable_session: Duration,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: DEFAULT_KEEPALIVE,
            keepalive_timeout_factor: 2,
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            min_stable_session: Duration::from_secs(10),
        }
    }
}

impl ConnectionPolicy {
    /// Replaces zero timers with their defaults and keeps
    /// `reconnect_max >= reconnect_initial`.
    ///
    /// A zero keepalive or timeout would make the session loop spin or panic
    /// in the timer, so the manager only ever runs with a normalized policy.
    /// `min_stable_session` may be zero: every loss then resets the backoff.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        let nonzero = |value: Duration, default: Duration| {
            if value.is_zero() {
                default
            } else {
                value
            }
        };
        self.connect_timeout = nonzero(self.connect_timeout, defaults.connect_timeout);
        self.handshake_timeout = nonzero(self.handshake_timeout, defaults.handshake_timeout);
        self.keepalive_interval = nonzero(self.keepalive_interval, defaults.keepalive_interval);
        self.reconnect_initial = nonzero(self.reconnect_initial, defaults.reconnect_initial);
        self.reconnect_max = self.reconnect_max.max(self.reconnect_initial);
        self
    }

    /// Silence after which a session with the given keepalive interval is
    /// declared dead.
    pub fn liveness_timeout(&self, keepalive: Duration) -> Duration {
        keepalive.saturating_mul(self.keepalive_timeout_factor.max(1))
    }

    /// Doubles `current`, capped at `reconnect_max`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.reconnect_max)
    }
}

/// One device host to keep a session with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    pub endpoint: String,
    /// Friendly name given to the device first seen on this host.
    pub name: Option<String>,
    /// Overrides both the device's advertised interval and the policy default.
    pub keepalive: Option<Duration>,
}

impl DeviceConfig {
    /// A device on the default port and endpoint.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            name: None,
            keepalive: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// WebSocket URL, e.g. `ws://192.168.0.72:8081/`.
    pub fn url(&self) -> String {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let endpoint = if self.endpoint.starts_with('/') {
            self.endpoint.clone()
        } else {
            format!("/{}", self.endpoint)
        };
        format!("ws://{host}:{}{endpoint}", self.port)
    }

    /// Keepalive interval for a session: the configured override, else the
    /// interval the device advertised in its hello reply, else the policy
    /// default.  Zero values are skipped; the result is never zero.
    pub fn keepalive_interval(
        &self,
        policy: &ConnectionPolicy,
        advertised: Option<Duration>,
    ) -> Duration {
        [self.keepalive, advertised, Some(policy.keepalive_interval)]
            .into_iter()
            .flatten()
            .find(|interval| !interval.is_zero())
            .unwrap_or(DEFAULT_KEEPALIVE)
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_key: String,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_level: String,
    pub policy: ConnectionPolicy,
    pub devices: Vec<DeviceConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: DEFAULT_API_KEY.to_string(),
            log_level: "info".to_string(),
            policy: ConnectionPolicy::default(),
            devices: Vec::new(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
