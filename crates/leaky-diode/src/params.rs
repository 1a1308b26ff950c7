//! Attack mode and channel thresholds.
//!
//! Both sides of a leak must agree on the same [`ChannelParameters`]: the
//! server uses them to pick a delay or a transfer rate for each bit, the
//! client uses the midpoint between `low` and `high` to classify what it
//! measured.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use leaky_diode::ChannelParameters;
//!
//! let params = ChannelParameters::flow_modulation()
//!     .low(10_000)
//!     .high(100_000)
//!     .settle_time(Duration::from_secs(2))
//!     .sample_time(Duration::from_secs(1))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(params.midpoint(), 55_000.0);
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::bits::Bit;
use crate::error::ConfigError;

/// Largest close delay in milliseconds (exclusive).
pub const MAX_CLOSE_DELAY_MS: u32 = 300_000;

/// Largest transfer rate in bytes per second (inclusive).
pub const MAX_FLOW_RATE: u32 = 500 * 1024;

/// Default throttle tick rate.
pub const DEFAULT_TICKS_PER_SECOND: u32 = 100;

/// Connect bound for the flow-modulation session connection.
pub const FLOW_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Covert channel used for a whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttackMode {
    /// Bits are encoded as the transfer rate of one long-lived connection.
    FlowModulation,
    /// Bits are encoded as the delay before the server closes a connection.
    CloseDelay,
}

impl AttackMode {
    fn name(self) -> &'static str {
        match self {
            AttackMode::FlowModulation => "flow",
            AttackMode::CloseDelay => "close",
        }
    }
}

impl fmt::Display for AttackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown [`AttackMode`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown attack mode '{0}' (expected 'flow' or 'close')")]
pub struct ParseModeError(String);

impl FromStr for AttackMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flow" | "flow_modulation" | "flow-modulation" => Ok(AttackMode::FlowModulation),
            "close" | "close_delay" | "close-delay" => Ok(AttackMode::CloseDelay),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

/// Validated thresholds for one covert channel.
///
/// `low` and `high` are milliseconds in close-delay mode and bytes per
/// second in flow-modulation mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelParameters {
    mode: AttackMode,
    low: u32,
    high: u32,
    settle_time: Duration,
    sample_time: Duration,
    ticks_per_second: u32,
}

impl ChannelParameters {
    /// Start building flow-modulation parameters.
    #[must_use]
    pub fn flow_modulation() -> ChannelParametersBuilder {
        ChannelParametersBuilder::new(AttackMode::FlowModulation)
    }

    /// Start building close-delay parameters.
    #[must_use]
    pub fn close_delay() -> ChannelParametersBuilder {
        ChannelParametersBuilder::new(AttackMode::CloseDelay)
    }

    /// Start building parameters for `mode`.
    #[must_use]
    pub fn builder(mode: AttackMode) -> ChannelParametersBuilder {
        ChannelParametersBuilder::new(mode)
    }

    /// The attack mode these thresholds belong to.
    #[must_use]
    pub fn mode(&self) -> AttackMode {
        self.mode
    }

    /// Low threshold (ms or bytes/s).
    #[must_use]
    pub fn low(&self) -> u32 {
        self.low
    }

    /// High threshold (ms or bytes/s).
    #[must_use]
    pub fn high(&self) -> u32 {
        self.high
    }

    /// Time the client waits after a request before sampling the rate.
    #[must_use]
    pub fn settle_time(&self) -> Duration {
        self.settle_time
    }

    /// Length of the rate sampling window.
    #[must_use]
    pub fn sample_time(&self) -> Duration {
        self.sample_time
    }

    /// Throttle re-evaluations per second.
    #[must_use]
    pub fn ticks_per_second(&self) -> u32 {
        self.ticks_per_second
    }

    /// Decision boundary between a low and a high measurement.
    #[must_use]
    pub fn midpoint(&self) -> f64 {
        (f64::from(self.low) + f64::from(self.high)) / 2.0
    }

    /// Threshold value that signals `bit`.
    #[must_use]
    pub fn level(&self, bit: Bit) -> u32 {
        match bit {
            Bit::Low => self.low,
            Bit::High => self.high,
        }
    }

    /// Classify a measurement against the midpoint.
    ///
    /// A measurement exactly at the midpoint resolves to [`Bit::High`].
    #[must_use]
    pub fn classify(&self, measurement: f64) -> Bit {
        if measurement >= self.midpoint() {
            Bit::High
        } else {
            Bit::Low
        }
    }

    /// How long a close-delay client waits for the teardown before giving up.
    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.high)) * 3 / 2
    }

    /// How long a client waits for the TCP handshake.
    ///
    /// Close-delay connections share the teardown bound; the single
    /// flow-modulation connection gets [`FLOW_CONNECT_TIMEOUT`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        match self.mode {
            AttackMode::CloseDelay => self.close_timeout(),
            AttackMode::FlowModulation => FLOW_CONNECT_TIMEOUT,
        }
    }
}

/// Builder for [`ChannelParameters`].
#[derive(Debug, Clone)]
pub struct ChannelParametersBuilder {
    mode: AttackMode,
    low: Option<u32>,
    high: Option<u32>,
    settle_time: Option<Duration>,
    sample_time: Option<Duration>,
    ticks_per_second: Option<u32>,
}

impl ChannelParametersBuilder {
    fn new(mode: AttackMode) -> Self {
        Self {
            mode,
            low: None,
            high: None,
            settle_time: None,
            sample_time: None,
            ticks_per_second: None,
        }
    }

    /// Set the low threshold.
    #[must_use]
    pub fn low(mut self, low: u32) -> Self {
        self.low = Some(low);
        self
    }

    /// Set the high threshold.
    #[must_use]
    pub fn high(mut self, high: u32) -> Self {
        self.high = Some(high);
        self
    }

    /// Set the settle time (flow modulation only).
    #[must_use]
    pub fn settle_time(mut self, settle: Duration) -> Self {
        self.settle_time = Some(settle);
        self
    }

    /// Set the sample time (flow modulation only).
    #[must_use]
    pub fn sample_time(mut self, sample: Duration) -> Self {
        self.sample_time = Some(sample);
        self
    }

    /// Set the throttle tick rate.
    #[must_use]
    pub fn ticks_per_second(mut self, ticks: u32) -> Self {
        self.ticks_per_second = Some(ticks);
        self
    }

    /// Validate and build the parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `high <= low`, a threshold is outside the
    /// mode's bounds, or the tick rate is zero.
    pub fn build(self) -> Result<ChannelParameters, ConfigError> {
        let low = self.low.unwrap_or(10_000);
        let high = self.high.unwrap_or(100_000);
        let ticks_per_second = self.ticks_per_second.unwrap_or(DEFAULT_TICKS_PER_SECOND);

        if high <= low {
            return Err(ConfigError::InvertedThresholds { low, high });
        }
        if ticks_per_second == 0 {
            return Err(ConfigError::ZeroTickRate);
        }

        let mode = self.mode.name();
        match self.mode {
            AttackMode::CloseDelay => {
                if high >= MAX_CLOSE_DELAY_MS {
                    return Err(ConfigError::ThresholdOutOfRange {
                        mode,
                        name: "high",
                        value: high,
                        allowed: "0 <= low < high < 300000 ms",
                    });
                }
            }
            AttackMode::FlowModulation => {
                if low == 0 {
                    return Err(ConfigError::ThresholdOutOfRange {
                        mode,
                        name: "low",
                        value: low,
                        allowed: "0 < low < high <= 512000 B/s",
                    });
                }
                if high > MAX_FLOW_RATE {
                    return Err(ConfigError::ThresholdOutOfRange {
                        mode,
                        name: "high",
                        value: high,
                        allowed: "0 < low < high <= 512000 B/s",
                    });
                }
            }
        }

        Ok(ChannelParameters {
            mode: self.mode,
            low,
            high,
            settle_time: self.settle_time.unwrap_or(Duration::from_secs(10)),
            sample_time: self.sample_time.unwrap_or(Duration::from_secs(4)),
            ticks_per_second,
        })
    }
}

/// Convert a number of seconds from user input into a [`Duration`].
///
/// # Errors
///
/// Returns [`ConfigError::InvalidDuration`] for negative, NaN or infinite values.
pub fn seconds(name: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidDuration {
        name,
        reason: e.to_string(),
    })
}
