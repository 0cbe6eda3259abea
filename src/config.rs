//! Peer configuration.
//!
//! A [`Config`] can be built in code starting from [`Config::new`], or loaded from a TOML file with
//! [`Config::from_toml_file`]. Durations are expressed in milliseconds in TOML (`*_ms` keys).
//!
//! ```toml
//! peer_id = "alice"
//! port = 9000
//! min_active_connections = 3
//! keep_alive_period_ms = 5000
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, peer::PeerId};

/// Default minimum number of active connections a peer tries to maintain.
pub const DEFAULT_MIN_ACTIVE_CONNECTIONS: usize = 5;

/// Default keep-alive period in seconds.
pub const DEFAULT_KEEP_ALIVE_PERIOD_SECS: u64 = 15;

/// Default staleness bound of peer facts in seconds.
pub const DEFAULT_PONG_STALENESS_SECS: u64 = 60;

/// Default ping timeout in seconds.
pub const DEFAULT_PING_TIMEOUT_SECS: u64 = 5;

/// Default connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default election round timeout in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MILLIS: u64 = 2_000;

/// Default timeout sweep interval in milliseconds.
pub const DEFAULT_SWEEP_INTERVAL_MILLIS: u64 = 100;

/// Default read idle timeout in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;

/// Default maximum frame size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Configuration of a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The peer name. Must be unique cluster-wide and has no default.
    pub peer_id: PeerId,
    /// Host the listener binds to.
    pub bind_host: String,
    /// Port the listener binds to. `0` picks an ephemeral port.
    pub port: u16,
    /// Host advertised to other peers in pongs.
    ///
    /// When unset, the local address of the connection the pong is sent over is advertised.
    pub advertised_host: Option<String>,
    /// Below this number of connections, keep-alive pings request discovery and timed out peer facts
    /// are used to open new connections.
    pub min_active_connections: usize,
    /// Period of the keep-alive ping.
    #[serde(rename = "keep_alive_period_ms", with = "duration_ms")]
    pub keep_alive_period: Duration,
    /// Maximum age of a peer fact before it is evicted.
    #[serde(rename = "pong_staleness_ms", with = "duration_ms")]
    pub pong_staleness: Duration,
    /// How long an outstanding ping waits for its pong.
    #[serde(rename = "ping_timeout_ms", with = "duration_ms")]
    pub ping_timeout: Duration,
    /// How long an outbound connection attempt may take.
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// How long an election round waits for rejections before the candidate declares itself leader.
    #[serde(rename = "election_timeout_ms", with = "duration_ms")]
    pub election_timeout: Duration,
    /// Interval of the timeout sweep.
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
    /// A connection which receives nothing for this long is closed.
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Maximum size of a single frame on the wire.
    pub max_frame_size: usize,
    /// Directory received files are written to.
    pub received_files_dir: PathBuf,
}

impl Config {
    /// Creates a config with default values for the given peer name.
    pub fn new(peer_id: impl Into<PeerId>) -> Self {
        Config {
            peer_id: peer_id.into(),
            ..Config::default()
        }
    }

    /// Loads a config from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Config::from_toml_str(&contents)
    }

    /// Parses a config from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that all values are within range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer_id.as_str().is_empty() {
            return Err(ConfigError::Invalid("peer_id must be set"));
        }
        if self.keep_alive_period.is_zero() {
            return Err(ConfigError::Invalid("keep_alive_period must be non-zero"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("sweep_interval must be non-zero"));
        }
        if self.pong_staleness <= self.keep_alive_period {
            return Err(ConfigError::Invalid(
                "pong_staleness must be greater than keep_alive_period",
            ));
        }
        if self.idle_timeout <= self.keep_alive_period {
            return Err(ConfigError::Invalid(
                "idle_timeout must be greater than keep_alive_period",
            ));
        }
        Ok(())
    }

    /// Sets the port to bind.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the host to bind.
    pub fn bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Sets the host advertised to other peers.
    pub fn advertised_host(mut self, host: impl Into<String>) -> Self {
        self.advertised_host = Some(host.into());
        self
    }

    /// Sets the minimum number of active connections.
    pub fn min_active_connections(mut self, min: usize) -> Self {
        self.min_active_connections = min;
        self
    }

    /// Sets the keep-alive period.
    pub fn keep_alive_period(mut self, period: Duration) -> Self {
        self.keep_alive_period = period;
        self
    }

    /// Sets the staleness bound of peer facts.
    pub fn pong_staleness(mut self, staleness: Duration) -> Self {
        self.pong_staleness = staleness;
        self
    }

    /// Sets the ping timeout.
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the election round timeout.
    pub fn election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    /// Sets the timeout sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the read idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the directory received files are written to.
    pub fn received_files_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.received_files_dir = dir.into();
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            peer_id: PeerId::from(""),
            bind_host: "0.0.0.0".to_string(),
            port: 0,
            advertised_host: None,
            min_active_connections: DEFAULT_MIN_ACTIVE_CONNECTIONS,
            keep_alive_period: Duration::from_secs(DEFAULT_KEEP_ALIVE_PERIOD_SECS),
            pong_staleness: Duration::from_secs(DEFAULT_PONG_STALENESS_SECS),
            ping_timeout: Duration::from_secs(DEFAULT_PING_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            election_timeout: Duration::from_millis(DEFAULT_ELECTION_TIMEOUT_MILLIS),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MILLIS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            received_files_dir: PathBuf::from("received_files"),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
