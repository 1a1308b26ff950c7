//! Client-side channel decoders.
//!
//! A decoder asks the server for one bit index and turns what it observes
//! into a [`Bit`]: the time until the server closes the connection, or the
//! rate at which filler arrives on a shared connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::Instant;

use crate::bits::Bit;
use crate::error::ConnectionError;
use crate::params::{AttackMode, ChannelParameters};
use crate::wire;

/// Receive buffer requested for flow-modulation connections.
///
/// A small buffer keeps the kernel from absorbing a burst that would blur the
/// sampled rate.
pub const FLOW_RECV_BUFFER: u32 = 4096;

const READ_CHUNK: usize = 8192;

/// Classify a close delay. A delay at the midpoint resolves to [`Bit::High`].
#[must_use]
pub fn classify_delay(params: &ChannelParameters, elapsed: Duration) -> Bit {
    // Compared in integer nanoseconds so the tie-break is exact.
    let threshold = (u128::from(params.low()) + u128::from(params.high())) * 1_000_000;
    Bit::from(elapsed.as_nanos() * 2 >= threshold)
}

/// Bytes per second over `window`. An empty window observes nothing.
#[must_use]
pub fn observed_rate(bytes: u64, window: Duration) -> f64 {
    if window.is_zero() {
        return 0.0;
    }
    bytes as f64 / window.as_secs_f64()
}

/// Classify an observed rate. A rate at the midpoint resolves to
/// [`Bit::High`].
#[must_use]
pub fn classify_rate(params: &ChannelParameters, rate: f64) -> Bit {
    params.classify(rate)
}

/// Resolve the server address once per session.
///
/// # Errors
///
/// Returns [`ConnectionError::HostNotFound`] if the name does not resolve.
pub async fn resolve(host: &str, port: u16) -> Result<Arc<[SocketAddr]>, ConnectionError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ConnectionError::HostNotFound(format!("{host}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(ConnectionError::HostNotFound(host.to_string()));
    }
    Ok(addrs.into())
}

/// Connect to the first reachable address, giving each attempt `bound`.
async fn connect(
    addrs: &[SocketAddr],
    recv_buffer: Option<u32>,
    bound: Duration,
) -> Result<TcpStream, ConnectionError> {
    let mut last_error = None;
    for &addr in addrs {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(size) = recv_buffer {
            socket.set_recv_buffer_size(size)?;
        }
        match tokio::time::timeout(bound, socket.connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                tracing::debug!(%addr, "connected");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                tracing::debug!(%addr, error = %e, "connect failed");
                last_error = Some(ConnectionError::from(e));
            }
            Err(_) => {
                tracing::debug!(%addr, bound_ms = bound.as_millis() as u64, "connect timed out");
                last_error = Some(ConnectionError::TimedOut(bound));
            }
        }
    }
    Err(last_error.unwrap_or_else(|| ConnectionError::HostNotFound(String::from("no addresses"))))
}

/// Decoder selected once per client from the attack mode.
#[derive(Debug, Clone)]
pub enum ChannelDecoder {
    /// One connection per bit, timed until the server closes it.
    CloseDelay(CloseDelayDecoder),
    /// One connection for the whole session, rate sampled per bit.
    FlowModulation(FlowModulationDecoder),
}

impl ChannelDecoder {
    /// Build the decoder matching `params.mode()`.
    #[must_use]
    pub fn new(addrs: Arc<[SocketAddr]>, params: ChannelParameters) -> Self {
        match params.mode() {
            AttackMode::CloseDelay => Self::CloseDelay(CloseDelayDecoder::new(addrs, params)),
            AttackMode::FlowModulation => {
                Self::FlowModulation(FlowModulationDecoder::new(addrs, params))
            }
        }
    }
}

/// Decodes bits from connection close delays.
#[derive(Debug, Clone)]
pub struct CloseDelayDecoder {
    addrs: Arc<[SocketAddr]>,
    params: ChannelParameters,
}

impl CloseDelayDecoder {
    /// Create a decoder for the server at `addrs`.
    #[must_use]
    pub fn new(addrs: Arc<[SocketAddr]>, params: ChannelParameters) -> Self {
        Self { addrs, params }
    }

    /// Open a fresh connection and decode the bit at `index`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] if the server is unreachable, the
    /// connection fails, or either the handshake or the close takes longer
    /// than 1.5 × `high`.
    pub async fn measure(&self, index: u32) -> Result<Bit, ConnectionError> {
        let mut stream = connect(&self.addrs, None, self.params.connect_timeout()).await?;
        self.measure_on(&mut stream, index).await
    }

    /// Decode the bit at `index` on an already open connection.
    ///
    /// # Errors
    ///
    /// See [`measure`](Self::measure).
    pub async fn measure_on<S>(&self, stream: &mut S, index: u32) -> Result<Bit, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        wire::write_index(stream, index).await?;
        let start = Instant::now();
        let bound = self.params.close_timeout();

        match tokio::time::timeout(bound, wait_for_close(stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::TimedOut(bound)),
        }

        let elapsed = start.elapsed();
        let bit = classify_delay(&self.params, elapsed);
        tracing::debug!(
            index,
            bit = bit.value(),
            elapsed_ms = elapsed.as_millis() as u64,
            "decoded close delay"
        );
        Ok(bit)
    }
}

/// Read until the peer tears the connection down.
///
/// A reset counts as the teardown instant.
async fn wait_for_close<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return Ok(()),
            // Close-delay servers send nothing; ignore anything that arrives.
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Decodes bits from the transfer rate of one long-lived connection.
#[derive(Debug, Clone)]
pub struct FlowModulationDecoder {
    addrs: Arc<[SocketAddr]>,
    params: ChannelParameters,
}

impl FlowModulationDecoder {
    /// Create a decoder for the server at `addrs`.
    #[must_use]
    pub fn new(addrs: Arc<[SocketAddr]>, params: ChannelParameters) -> Self {
        Self { addrs, params }
    }

    /// Open the session connection with a small receive buffer.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] if the server is unreachable or the
    /// handshake takes longer than [`FLOW_CONNECT_TIMEOUT`].
    ///
    /// [`FLOW_CONNECT_TIMEOUT`]: crate::params::FLOW_CONNECT_TIMEOUT
    pub async fn connect(&self) -> Result<TcpStream, ConnectionError> {
        connect(
            &self.addrs,
            Some(FLOW_RECV_BUFFER),
            self.params.connect_timeout(),
        )
        .await
    }

    /// Request `index` on `stream`, let the rate settle, then sample it.
    ///
    /// Filler received during the settle time, including leftovers from the
    /// previous bit, is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the server closes the
    /// connection, or the underlying error if a read or write fails.
    pub async fn measure<S>(&self, index: u32, stream: &mut S) -> Result<Bit, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        wire::write_index(stream, index).await?;

        let mut buf = vec![0u8; READ_CHUNK];
        count_for(stream, &mut buf, self.params.settle_time()).await?;
        let bytes = count_for(stream, &mut buf, self.params.sample_time()).await?;

        let rate = observed_rate(bytes, self.params.sample_time());
        let bit = classify_rate(&self.params, rate);
        tracing::debug!(index, bit = bit.value(), bytes, rate, "decoded flow rate");
        Ok(bit)
    }
}

/// Count bytes received during `window`.
async fn count_for<S>(
    stream: &mut S,
    buf: &mut [u8],
    window: Duration,
) -> Result<u64, ConnectionError>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + window;
    let mut total = 0u64;
    loop {
        match tokio::time::timeout_at(deadline, stream.read(buf)).await {
            Err(_) => return Ok(total),
            Ok(Ok(0)) => return Err(ConnectionError::Closed),
            Ok(Ok(n)) => total += n as u64,
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}
