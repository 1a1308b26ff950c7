//! Error types for the leak engine.

use std::io;

/// Invalid parameter combination, rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// `high` must be strictly greater than `low`.
    #[error("high ({high}) must be greater than low ({low})")]
    InvertedThresholds {
        /// Low threshold as given.
        low: u32,
        /// High threshold as given.
        high: u32,
    },

    /// A threshold is outside what the selected mode accepts.
    #[error("{name} = {value} is out of range for {mode} mode (allowed {allowed})")]
    ThresholdOutOfRange {
        /// Attack mode the threshold belongs to.
        mode: &'static str,
        /// Which threshold (`low` or `high`).
        name: &'static str,
        /// The rejected value.
        value: u32,
        /// Human readable range.
        allowed: &'static str,
    },

    /// The secret does not fit the 16-bit length header.
    #[error("secret is {len} bytes, the maximum is {max}")]
    SecretTooLong {
        /// Length of the rejected secret.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// `max_connections` must allow at least one worker.
    #[error("max_connections must be at least 1")]
    NoConnections,

    /// The throttle tick rate must be positive.
    #[error("ticks_per_second must be at least 1")]
    ZeroTickRate,

    /// A time value could not be represented.
    #[error("invalid {name}: {reason}")]
    InvalidDuration {
        /// Which setting.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Failure of the covert channel as seen by the client.
///
/// This is `Clone` so a failed leak keeps reporting the same error on every
/// later poll.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Connection was refused by the remote host.
    #[error("connection refused")]
    Refused,
    /// Connection was reset by the remote host.
    #[error("connection reset")]
    Reset,
    /// The peer closed the connection in the middle of a measurement.
    #[error("connection closed by peer")]
    Closed,
    /// The channel did not produce a signal within its bound.
    #[error("timed out after {0:?}")]
    TimedOut(std::time::Duration),
    /// Host name did not resolve to any address.
    #[error("host not found: {0}")]
    HostNotFound(String),
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => Self::Reset,
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(e.to_string()),
        }
    }
}

/// A bit index outside `[0, 16 + 8 * len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bit index {index} out of range (secret has {total} addressable bits)")]
pub struct RangeError {
    /// The requested index.
    pub index: u32,
    /// Number of addressable bits.
    pub total: u32,
}

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The covert channel failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A bit index outside the secret.
    #[error(transparent)]
    Range(#[from] RangeError),

    /// `start` was called on a running instance.
    #[error("already started")]
    AlreadyStarted,

    /// The operation needs a started instance.
    #[error("not started")]
    NotStarted,

    /// Socket setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
