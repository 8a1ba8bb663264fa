//! Configuration types for netplay sessions.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | [`NetplayConfig`] | Session timeouts, pacing, input delay | `lan()`, `high_latency()` |
//! | [`RollbackConfig`] | Rollback engine window and cadences | `lan()`, `high_latency()` |
//! | [`EndpointConfig`] | Per-peer rollback endpoint timers | `lan()`, `high_latency()` |
//!
//! ```
//! use rollback_netplay::NetplayConfig;
//! use web_time::Duration;
//!
//! let config = NetplayConfig::default()
//!     .with_connect_timeout(Duration::from_secs(5))
//!     .with_input_delay(2);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.resync_timeout(), Duration::from_secs(10));
//! ```

use web_time::Duration;

use crate::NetplayError;

/// Upper bound on [`RollbackConfig::max_prediction`].
pub const MAX_PREDICTION_LIMIT: usize = 32;

/// Timers of the per-peer rollback endpoint.
///
/// New fields may be added; construct with `..EndpointConfig::default()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "EndpointConfig has no effect unless stored in a NetplayConfig"]
pub struct EndpointConfig {
    /// Number of successful sync roundtrips required before an endpoint is synchronized.
    ///
    /// Default: 5
    pub num_sync_packets: u32,
    /// Time between sync request retries while synchronizing.
    ///
    /// Default: 200ms
    pub sync_retry_interval: Duration,
    /// Time between input resends while running, when inputs are unacknowledged.
    ///
    /// Default: 200ms
    pub running_retry_interval: Duration,
    /// Time between keep-alive packets when idle.
    ///
    /// Default: 200ms
    pub keepalive_interval: Duration,
    /// Time between quality reports (ping and frame advantage).
    ///
    /// Default: 200ms
    pub quality_report_interval: Duration,
    /// Silence after which the connection is reported as interrupted.
    ///
    /// Default: 750ms
    pub disconnect_notify_start: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            num_sync_packets: 5,
            sync_retry_interval: Duration::from_millis(200),
            running_retry_interval: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(200),
            quality_report_interval: Duration::from_millis(200),
            disconnect_notify_start: Duration::from_millis(750),
        }
    }
}

impl EndpointConfig {
    /// Preset for local networks: faster retries, fewer sync roundtrips.
    pub fn lan() -> Self {
        Self {
            num_sync_packets: 3,
            sync_retry_interval: Duration::from_millis(100),
            running_retry_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_millis(100),
            quality_report_interval: Duration::from_millis(100),
            disconnect_notify_start: Duration::from_millis(500),
        }
    }

    /// Preset for 100-200ms RTT links: slower retries so they do not flood the link.
    pub fn high_latency() -> Self {
        Self {
            num_sync_packets: 5,
            sync_retry_interval: Duration::from_millis(400),
            running_retry_interval: Duration::from_millis(400),
            keepalive_interval: Duration::from_millis(400),
            quality_report_interval: Duration::from_millis(400),
            disconnect_notify_start: Duration::from_millis(1500),
        }
    }

    /// Validates the endpoint timers.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if a value is zero or out of range.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.num_sync_packets == 0 || self.num_sync_packets > 64 {
            return Err(out_of_range("num_sync_packets", 1, 64, self.num_sync_packets));
        }
        for (field, value) in [
            ("sync_retry_interval", self.sync_retry_interval),
            ("running_retry_interval", self.running_retry_interval),
            ("keepalive_interval", self.keepalive_interval),
            ("quality_report_interval", self.quality_report_interval),
            ("disconnect_notify_start", self.disconnect_notify_start),
        ] {
            if value.is_zero() || value > Duration::from_secs(60) {
                return Err(NetplayError::InvalidRequest {
                    info: format!("{field} must be within (0, 60s], got {value:?}"),
                });
            }
        }
        Ok(())
    }
}

/// Sizing and cadence of the rollback engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "RollbackConfig has no effect unless stored in a NetplayConfig"]
pub struct RollbackConfig {
    /// Maximum number of frames the engine predicts ahead of the last confirmed frame.
    ///
    /// Default: 8
    pub max_prediction: usize,
    /// Frames between checksum reports to peers. Zero disables desync detection.
    ///
    /// Default: 16
    pub checksum_interval: u32,
    /// Number of frames averaged to compute the local/remote frame advantage.
    ///
    /// Default: 30
    pub time_sync_window: usize,
    /// Frames between time-sync events.
    ///
    /// Default: 60
    pub recommendation_interval: u32,
    /// Capacity of each per-player input queue. Must exceed the prediction window plus delay.
    ///
    /// Default: 128
    pub input_queue_length: usize,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_prediction: 8,
            checksum_interval: 16,
            time_sync_window: 30,
            recommendation_interval: 60,
            input_queue_length: 128,
        }
    }
}

impl RollbackConfig {
    /// Preset for local networks: a short prediction window.
    pub fn lan() -> Self {
        Self {
            max_prediction: 4,
            ..Self::default()
        }
    }

    /// Preset for long links: a wider prediction window and smoother time sync.
    pub fn high_latency() -> Self {
        Self {
            max_prediction: 12,
            time_sync_window: 60,
            recommendation_interval: 90,
            input_queue_length: 256,
            ..Self::default()
        }
    }

    /// Validates sizing against the input delay the engine will run with.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if a value is out of range.
    pub fn validate(&self, input_delay: usize) -> Result<(), NetplayError> {
        if self.max_prediction == 0 || self.max_prediction > MAX_PREDICTION_LIMIT {
            return Err(out_of_range(
                "max_prediction",
                1,
                MAX_PREDICTION_LIMIT as u64,
                self.max_prediction,
            ));
        }
        if self.time_sync_window == 0 {
            return Err(out_of_range("time_sync_window", 1, 1024, 0u32));
        }
        if self.recommendation_interval == 0 {
            return Err(out_of_range("recommendation_interval", 1, 3600, 0u32));
        }
        let needed = self.max_prediction + input_delay + 2;
        if self.input_queue_length < needed {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "input_queue_length {} is too small for max_prediction {} and input delay {}",
                    self.input_queue_length, self.max_prediction, input_delay
                ),
            });
        }
        Ok(())
    }
}

/// Top-level configuration of a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq)]
#[must_use = "NetplayConfig has no effect unless passed to Session::new()"]
pub struct NetplayConfig {
    /// How long a joiner keeps trying to reach the host, and how long the host waits for
    /// reset acknowledgments before dropping stragglers.
    ///
    /// Default: 15s
    pub connect_timeout: Duration,
    /// Reconnect attempts a joiner makes within `connect_timeout`.
    ///
    /// Default: 4
    pub connect_retries: u32,
    /// How long a closing session waits for peers to acknowledge the disconnect.
    ///
    /// Default: 3s
    pub close_timeout: Duration,
    /// Transport poll timeout while connecting, resetting or closing.
    ///
    /// Default: 16ms
    pub poll_interval: Duration,
    /// Longest single transport poll while the frame throttle waits.
    ///
    /// Default: 2ms
    pub throttle_slice: Duration,
    /// Base simulation tick rate in Hz.
    ///
    /// Default: 60.0
    pub tick_rate_hz: f64,
    /// Local input delay in frames.
    ///
    /// Default: 1
    pub input_delay: usize,
    /// Rollback engine sizing.
    pub rollback: RollbackConfig,
    /// Per-peer endpoint timers.
    pub endpoint: EndpointConfig,
}

impl Default for NetplayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            connect_retries: 4,
            close_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(16),
            throttle_slice: Duration::from_millis(2),
            tick_rate_hz: 60.0,
            input_delay: 1,
            rollback: RollbackConfig::default(),
            endpoint: EndpointConfig::default(),
        }
    }
}

impl NetplayConfig {
    /// Creates a new `NetplayConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for local networks.
    pub fn lan() -> Self {
        Self {
            input_delay: 0,
            rollback: RollbackConfig::lan(),
            endpoint: EndpointConfig::lan(),
            ..Self::default()
        }
    }

    /// Preset for 100-200ms RTT links.
    pub fn high_latency() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            input_delay: 2,
            rollback: RollbackConfig::high_latency(),
            endpoint: EndpointConfig::high_latency(),
            ..Self::default()
        }
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the number of reconnect attempts within the connect timeout.
    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    /// Sets the close timeout.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Sets the poll interval used outside the Running state.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the base tick rate.
    pub fn with_tick_rate(mut self, hz: f64) -> Self {
        self.tick_rate_hz = hz;
        self
    }

    /// Sets the local input delay.
    pub fn with_input_delay(mut self, frames: usize) -> Self {
        self.input_delay = frames;
        self
    }

    /// Sets the rollback engine configuration.
    pub fn with_rollback(mut self, rollback: RollbackConfig) -> Self {
        self.rollback = rollback;
        self
    }

    /// Sets the endpoint configuration.
    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Time a client waits for a resync to finish before giving up.
    #[must_use]
    pub fn resync_timeout(&self) -> Duration {
        self.connect_timeout * 2
    }

    /// Interval between a joiner's reconnect attempts.
    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        self.connect_timeout / (self.connect_retries + 1)
    }

    /// Validates the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if any value is out of range.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.connect_timeout.is_zero() {
            return Err(NetplayError::InvalidRequest {
                info: "connect_timeout must be non-zero".to_owned(),
            });
        }
        if self.close_timeout.is_zero() {
            return Err(NetplayError::InvalidRequest {
                info: "close_timeout must be non-zero".to_owned(),
            });
        }
        if self.throttle_slice.is_zero() {
            return Err(NetplayError::InvalidRequest {
                info: "throttle_slice must be non-zero".to_owned(),
            });
        }
        if !self.tick_rate_hz.is_finite() || self.tick_rate_hz < 1.0 || self.tick_rate_hz > 1000.0
        {
            return Err(NetplayError::InvalidRequest {
                info: format!("tick_rate_hz must be within [1, 1000], got {}", self.tick_rate_hz),
            });
        }
        if self.input_delay > 16 {
            return Err(out_of_range("input_delay", 0, 16, self.input_delay));
        }
        self.rollback.validate(self.input_delay)?;
        self.endpoint.validate()
    }
}

fn out_of_range(field: &str, min: u64, max: u64, actual: impl std::fmt::Display) -> NetplayError {
    NetplayError::InvalidRequest {
        info: format!("{field} must be within [{min}, {max}], got {actual}"),
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = NetplayConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.connect_retries, 4);
        assert_eq!(config.close_timeout, Duration::from_secs(3));
        assert_eq!(config.rollback.max_prediction, 8);
        assert_eq!(config.endpoint.num_sync_packets, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn derived_timeouts() {
        let config = NetplayConfig::default();
        assert_eq!(config.resync_timeout(), Duration::from_secs(30));
        assert_eq!(config.reconnect_interval(), Duration::from_secs(3));
    }

    #[test]
    fn presets_validate() {
        assert!(NetplayConfig::lan().validate().is_ok());
        assert!(NetplayConfig::high_latency().validate().is_ok());
    }

    #[test]
    fn input_queue_must_cover_prediction_window() {
        let config = NetplayConfig::default().with_rollback(RollbackConfig {
            input_queue_length: 8,
            ..RollbackConfig::default()
        });
        assert!(matches!(
            config.validate(),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn rejects_zero_prediction_and_bad_tick_rate() {
        let zero_prediction = NetplayConfig::default().with_rollback(RollbackConfig {
            max_prediction: 0,
            ..RollbackConfig::default()
        });
        assert!(zero_prediction.validate().is_err());
        assert!(NetplayConfig::default()
            .with_tick_rate(f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn rejects_zero_endpoint_interval() {
        let config = NetplayConfig::default().with_endpoint(EndpointConfig {
            keepalive_interval: Duration::ZERO,
            ..EndpointConfig::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keepalive_interval"));
    }
}
