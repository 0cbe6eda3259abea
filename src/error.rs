//! Defines error handling constructs for the peer.
//!
//! Failures which a caller can act upon surface as a [`PeerError`] through the [`PeerHandle`] control surface.
//! Everything else (lost probes, stale peer facts, conflicting leader views) is resolved by the protocol itself
//! and only shows up in the logs.
//!
//! [`PeerHandle`]: crate::peer::PeerHandle

use std::{error, fmt, io, path::PathBuf};

use crate::peer::PeerId;

/// Error returned by operations on a peer.
#[derive(Debug)]
pub enum PeerError {
    /// The peer has left the network, or has not started yet.
    NotRunning,
    /// The peer actor stopped before a reply could be received.
    ActorStopped,
    /// The listening socket could not be bound.
    Bind {
        /// The address which could not be bound.
        addr: String,
        /// The underlying I/O error.
        source: io::Error,
    },
    /// A connection attempt failed.
    Connect {
        /// The address being connected to.
        addr: String,
        /// The underlying I/O error.
        source: io::Error,
    },
    /// A connection attempt did not complete within the configured connect timeout.
    ConnectTimeout {
        /// The address being connected to.
        addr: String,
    },
    /// There is no open connection to the given peer.
    NotConnected(PeerId),
    /// The configuration is invalid.
    InvalidConfig(ConfigError),
    /// A local I/O operation failed.
    Io(io::Error),
}

impl PeerError {
    /// Returns `true` if this error was caused by the peer not running.
    pub fn is_not_running(&self) -> bool {
        matches!(self, PeerError::NotRunning | PeerError::ActorStopped)
    }
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::NotRunning => write!(f, "peer not running"),
            PeerError::ActorStopped => write!(f, "peer actor stopped"),
            PeerError::Bind { addr, source } => write!(f, "failed to bind {addr}: {source}"),
            PeerError::Connect { addr, source } => {
                write!(f, "failed to connect to {addr}: {source}")
            }
            PeerError::ConnectTimeout { addr } => write!(f, "connection to {addr} timed out"),
            PeerError::NotConnected(peer) => write!(f, "not connected to {peer}"),
            PeerError::InvalidConfig(err) => err.fmt(f),
            PeerError::Io(err) => err.fmt(f),
        }
    }
}

impl error::Error for PeerError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            PeerError::Bind { source, .. } | PeerError::Connect { source, .. } => Some(source),
            PeerError::InvalidConfig(err) => Some(err),
            PeerError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for PeerError {
    fn from(err: io::Error) -> Self {
        PeerError::Io(err)
    }
}

impl From<ConfigError> for PeerError {
    fn from(err: ConfigError) -> Self {
        PeerError::InvalidConfig(err)
    }
}

/// An error that occurs while encoding or decoding a frame.
#[derive(Debug)]
pub enum CodecError {
    /// The message could not be serialized.
    Encode(rmp_serde::encode::Error),
    /// The frame could not be deserialized into a message.
    Decode(rmp_serde::decode::Error),
    /// The frame length exceeds the configured maximum.
    FrameTooLarge {
        /// Length of the offending frame.
        len: usize,
        /// The configured maximum.
        max: usize,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(err) => write!(f, "failed to encode message: {err}"),
            CodecError::Decode(err) => write!(f, "failed to decode message: {err}"),
            CodecError::FrameTooLarge { len, max } => write!(f, "frame too large: {len} > {max}"),
        }
    }
}

impl error::Error for CodecError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            CodecError::Encode(err) => Some(err),
            CodecError::Decode(err) => Some(err),
            CodecError::FrameTooLarge { .. } => None,
        }
    }
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// An error that occurs while loading a [`Config`](crate::config::Config).
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Read {
        /// Path of the configuration file.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },
    /// The configuration file is not valid TOML, or does not match the expected shape.
    Parse(toml::de::Error),
    /// A configuration value is out of range.
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse(err) => write!(f, "invalid config: {err}"),
            ConfigError::Invalid(reason) => write!(f, "invalid config: {reason}"),
        }
    }
}

impl error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse(err) => Some(err),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err)
    }
}
