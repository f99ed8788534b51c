//! Configuration for the satellite.

use crate::migrator::Migration;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_protocol::{ReplicaId, Shape, PROTOCOL_VERSION};

/// Shortest accepted ping interval.
pub const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for one satellite process.
#[derive(Debug, Clone)]
pub struct SatelliteConfig {
    /// Server endpoint, as understood by the socket factory.
    pub endpoint: String,
    /// Bearer token sent in `Auth`.
    pub auth_token: String,
    /// Replica id to use instead of the persisted one.
    pub replica_id: Option<ReplicaId>,
    /// Bundled schema migrations, in version order.
    pub migrations: Vec<Migration>,
    /// Protocol version.
    pub protocol_version: u16,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Timeout for the authentication handshake.
    pub auth_timeout: Duration,
    /// Interval between liveness pings.
    pub ping_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub liveness_timeout: Duration,
    /// Outbound transactions awaiting acknowledgement at once.
    pub max_in_flight: usize,
    /// Transactions read from the oplog per batch.
    pub outbound_batch_size: usize,
    /// Attempts at applying one inbound transaction before giving up.
    pub max_apply_attempts: u32,
    /// Delay between apply attempts.
    pub apply_retry_delay: Duration,
    /// Consecutive auth rejections tolerated before giving up.
    pub auth_rejection_limit: u32,
    /// Whether acknowledged oplog entries are deleted.
    pub prune_acknowledged: bool,
    /// How long ids of applied inbound transactions are remembered for
    /// duplicate detection.
    pub received_retention: Duration,
    /// Shapes subscribed on first start.
    pub initial_shapes: Vec<Shape>,
}

impl SatelliteConfig {
    /// Creates a new satellite configuration.
    pub fn new(endpoint: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth_token: auth_token.into(),
            replica_id: None,
            migrations: Vec::new(),
            protocol_version: PROTOCOL_VERSION,
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(45),
            max_in_flight: 16,
            outbound_batch_size: 64,
            max_apply_attempts: 3,
            apply_retry_delay: Duration::from_millis(100),
            auth_rejection_limit: 1,
            prune_acknowledged: true,
            received_retention: Duration::from_secs(7 * 24 * 60 * 60),
            initial_shapes: Vec::new(),
        }
    }

    /// Pins the replica id.
    pub fn with_replica_id(mut self, replica_id: ReplicaId) -> Self {
        self.replica_id = Some(replica_id);
        self
    }

    /// Sets the bundled migrations.
    pub fn with_migrations(mut self, migrations: Vec<Migration>) -> Self {
        self.migrations = migrations;
        self
    }

    /// Sets the protocol version.
    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the auth timeout.
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Sets the ping interval and liveness timeout.
    ///
    /// The interval is raised to [`MIN_PING_INTERVAL`], and the timeout to
    /// at least the interval.
    pub fn with_liveness(mut self, ping_interval: Duration, liveness_timeout: Duration) -> Self {
        self.ping_interval = ping_interval.max(MIN_PING_INTERVAL);
        self.liveness_timeout = liveness_timeout.max(self.ping_interval);
        self
    }

    /// Sets the in-flight window.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Sets the oplog read batch size.
    pub fn with_outbound_batch_size(mut self, size: usize) -> Self {
        self.outbound_batch_size = size.max(1);
        self
    }

    /// Sets the apply retry policy.
    pub fn with_apply_retry(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.max_apply_attempts = max_attempts.max(1);
        self.apply_retry_delay = delay;
        self
    }

    /// Sets how many auth rejections are tolerated.
    pub fn with_auth_rejection_limit(mut self, limit: u32) -> Self {
        self.auth_rejection_limit = limit.max(1);
        self
    }

    /// Keeps acknowledged oplog entries instead of deleting them.
    pub fn with_prune_acknowledged(mut self, prune: bool) -> Self {
        self.prune_acknowledged = prune;
        self
    }

    /// Sets how long applied inbound transaction ids are kept.
    pub fn with_received_retention(mut self, retention: Duration) -> Self {
        self.received_retention = retention;
        self
    }

    /// Sets the shapes subscribed on first start.
    pub fn with_initial_shapes(mut self, shapes: Vec<Shape>) -> Self {
        self.initial_shapes = shapes;
        self
    }
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// Reconnect backoff bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Random extra delay, as a fraction of the base delay.
    pub jitter: f64,
}

impl BackoffConfig {
    /// Creates a configuration with the given bounds.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Sets the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Base delay for the `attempt`-th consecutive failure (1-indexed),
    /// before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satellite_config_builder() {
        let config = SatelliteConfig::new("127.0.0.1:5133", "token")
            .with_max_in_flight(0)
            .with_apply_retry(5, Duration::from_millis(10))
            .with_initial_shapes(vec![Shape::table("items")])
            .with_liveness(Duration::from_secs(1), Duration::from_secs(3));

        assert_eq!(config.endpoint, "127.0.0.1:5133");
        assert_eq!(config.auth_token, "token");
        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.max_apply_attempts, 5);
        assert_eq!(config.auth_rejection_limit, 1);
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert_eq!(config.initial_shapes.len(), 1);
        assert_eq!(config.liveness_timeout, Duration::from_secs(3));
    }

    #[test]
    fn zero_ping_interval_is_clamped() {
        let config = SatelliteConfig::new("127.0.0.1:5133", "token")
            .with_liveness(Duration::ZERO, Duration::ZERO);
        assert_eq!(config.ping_interval, MIN_PING_INTERVAL);
        assert_eq!(config.liveness_timeout, MIN_PING_INTERVAL);
    }

    #[test]
    fn base_delay_grows_and_caps() {
        let backoff = BackoffConfig::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.base_delay(0), Duration::ZERO);
        assert_eq!(backoff.base_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.base_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.base_delay(3), Duration::from_millis(400));
        assert_eq!(backoff.base_delay(4), Duration::from_millis(500));
        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn backoff_from_json() {
        let backoff: BackoffConfig = serde_json::from_str(
            r#"{"initial_delay":{"secs":1,"nanos":0},"max_delay":{"secs":60,"nanos":0}}"#,
        )
        .unwrap();
        assert_eq!(backoff.initial_delay, Duration::from_secs(1));
        assert_eq!(backoff.max_delay, Duration::from_secs(60));
        assert!((backoff.multiplier - 2.0).abs() < f64::EPSILON);
    }
}
