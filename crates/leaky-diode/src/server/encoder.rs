//! Server-side channel encoders.
//!
//! An encoder turns a bit into observable connection behavior:
//!
//! - [`CloseDelayEncoder`] holds the connection open for `low` or `high`
//!   milliseconds, then closes it. No payload is ever written.
//! - [`FlowModulationEncoder`] streams filler bytes at `low` or `high`
//!   bytes per second until it is retargeted or the peer goes away.

use std::io;
use std::time::Duration;

use rand::RngCore;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::bits::Bit;
use crate::params::{AttackMode, ChannelParameters};
use crate::throttle::{Throttle, Ticker};

/// Size of the filler block written by the flow encoder.
pub const FILLER_BLOCK: usize = 4096;

/// Encoder selected once per server from the attack mode.
#[derive(Debug, Clone)]
pub enum ChannelEncoder {
    /// One bit per connection, signalled by the close delay.
    CloseDelay(CloseDelayEncoder),
    /// Many bits per connection, signalled by the transfer rate.
    FlowModulation(FlowModulationEncoder),
}

impl ChannelEncoder {
    /// Build the encoder matching `params.mode()`.
    #[must_use]
    pub fn new(params: &ChannelParameters) -> Self {
        match params.mode() {
            AttackMode::CloseDelay => Self::CloseDelay(CloseDelayEncoder::new(params)),
            AttackMode::FlowModulation => Self::FlowModulation(FlowModulationEncoder::new(params)),
        }
    }
}

/// Encodes a bit as the delay before the server closes the connection.
#[derive(Debug, Clone)]
pub struct CloseDelayEncoder {
    low: Duration,
    high: Duration,
}

impl CloseDelayEncoder {
    /// Create an encoder from close-delay thresholds (milliseconds).
    #[must_use]
    pub fn new(params: &ChannelParameters) -> Self {
        Self {
            low: Duration::from_millis(u64::from(params.low())),
            high: Duration::from_millis(u64::from(params.high())),
        }
    }

    /// Delay that signals `bit`.
    #[must_use]
    pub fn delay(&self, bit: Bit) -> Duration {
        match bit {
            Bit::Low => self.low,
            Bit::High => self.high,
        }
    }

    /// Wait the delay for `bit`, then shut down the write side of `stream`.
    ///
    /// The caller drops the stream afterwards, which completes the teardown.
    ///
    /// # Errors
    ///
    /// Returns the error of the final shutdown, if any.
    pub async fn encode<W>(&self, stream: &mut W, bit: Bit) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        tokio::time::sleep(self.delay(bit)).await;
        stream.shutdown().await
    }
}

/// Encodes bits as the transfer rate of an open connection.
#[derive(Debug, Clone)]
pub struct FlowModulationEncoder {
    low: u32,
    high: u32,
    ticks_per_second: u32,
}

impl FlowModulationEncoder {
    /// Create an encoder from flow-modulation thresholds (bytes/second).
    #[must_use]
    pub fn new(params: &ChannelParameters) -> Self {
        Self {
            low: params.low(),
            high: params.high(),
            ticks_per_second: params.ticks_per_second(),
        }
    }

    /// Rate that signals `bit`.
    #[must_use]
    pub fn rate(&self, bit: Bit) -> u32 {
        match bit {
            Bit::Low => self.low,
            Bit::High => self.high,
        }
    }

    /// Stream filler into `writer` at the rate of the current target bit.
    ///
    /// Idles while `target` holds `None`. A new value on `target` switches
    /// the rate at the next tick boundary. Returns `Ok(())` once the sending
    /// half of `target` is dropped.
    ///
    /// # Errors
    ///
    /// Returns the first write error, which normally means the peer closed
    /// the connection.
    pub async fn run<W>(
        &self,
        writer: &mut W,
        mut target: watch::Receiver<Option<Bit>>,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let filler = filler_block();

        loop {
            let current = *target.borrow_and_update();
            let Some(bit) = current else {
                if target.changed().await.is_err() {
                    return Ok(());
                }
                continue;
            };

            let mut throttle = Throttle::new(self.rate(bit), self.ticks_per_second);
            let mut ticker = Ticker::new(throttle.period());
            tracing::trace!(rate = throttle.rate(), "flow encoder retargeted");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = target.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        break;
                    }
                }
                write_filler(writer, &filler, throttle.next_budget()).await?;
            }
        }
    }
}

/// Random filler so the stream does not look like a constant pattern.
fn filler_block() -> Vec<u8> {
    let mut block = vec![0u8; FILLER_BLOCK];
    rand::thread_rng().fill_bytes(&mut block);
    block
}

async fn write_filler<W>(writer: &mut W, filler: &[u8], mut budget: usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    while budget > 0 {
        let chunk = budget.min(filler.len());
        writer.write_all(&filler[..chunk]).await?;
        budget -= chunk;
    }
    writer.flush().await
}
