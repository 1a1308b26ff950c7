//! The leaking side: a TCP server that answers bit-index requests through
//! connection timing or transfer rate.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> leaky_diode::Result<()> {
//! use leaky_diode::{ChannelParameters, LeakyServer, ServerConfig};
//!
//! let params = ChannelParameters::close_delay().low(100).high(300).build()?;
//! let config = ServerConfig::new("0.0.0.0:4444".parse().unwrap(), b"secret".to_vec())
//!     .with_max_connections(4);
//!
//! let mut server = LeakyServer::new(config, params)?;
//! let addr = server.start().await?;
//! println!("leaking on {addr}");
//! // ...
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod encoder;
pub mod pool;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use encoder::{ChannelEncoder, CloseDelayEncoder, FlowModulationEncoder};
pub use pool::{SlotGuard, SlotTable};

use crate::bits::BitSource;
use crate::error::{ConfigError, Error, Result};
use crate::params::ChannelParameters;
use pool::ConnectionPool;

/// Default number of concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Default time `stop` waits for workers before aborting them.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Server settings.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to listen on. Port 0 picks a free port.
    pub addr: SocketAddr,
    /// Bytes to leak. At most 65535.
    pub secret: Vec<u8>,
    /// Concurrent connections served. Connections beyond this are closed
    /// immediately.
    pub max_connections: usize,
    /// How long `stop` waits for workers to finish before aborting them.
    pub stop_grace: Duration,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("addr", &self.addr)
            .field("secret_len", &self.secret.len())
            .field("max_connections", &self.max_connections)
            .field("stop_grace", &self.stop_grace)
            .finish()
    }
}

impl ServerConfig {
    /// Create a config with default limits.
    #[must_use]
    pub fn new(addr: SocketAddr, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            addr,
            secret: secret.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Set the maximum number of concurrent connections.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the grace period of `stop`.
    #[must_use]
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// State of a started server.
#[derive(Debug)]
struct Running {
    local_addr: SocketAddr,
    slots: Arc<SlotTable>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Covert-channel server.
///
/// The attack mode is fixed by the [`ChannelParameters`] given at
/// construction.
#[derive(Debug)]
pub struct LeakyServer {
    addr: SocketAddr,
    max_connections: usize,
    stop_grace: Duration,
    source: BitSource,
    params: ChannelParameters,
    running: Option<Running>,
}

impl LeakyServer {
    /// Validate the configuration and build a stopped server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the secret is longer than 65535 bytes or
    /// `max_connections` is zero.
    pub fn new(config: ServerConfig, params: ChannelParameters) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(ConfigError::NoConnections.into());
        }
        let source = BitSource::new(config.secret)?;
        Ok(Self {
            addr: config.addr,
            max_connections: config.max_connections,
            stop_grace: config.stop_grace,
            source,
            params,
            running: None,
        })
    }

    /// Bind the listener and start accepting connections in the background.
    ///
    /// Returns the bound address once the server is listening.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if the server is running, or
    /// [`Error::Io`] if the address cannot be bound.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let listener = bind(self.addr, self.max_connections)?;
        let local_addr = listener.local_addr()?;
        let slots = SlotTable::new(self.max_connections);
        let cancel = CancellationToken::new();

        let pool = ConnectionPool {
            listener,
            slots: Arc::clone(&slots),
            encoder: ChannelEncoder::new(&self.params),
            source: self.source.clone(),
            cancel: cancel.clone(),
            stop_grace: self.stop_grace,
        };
        let task = tokio::spawn(pool.run());

        tracing::info!(
            addr = %local_addr,
            mode = %self.params.mode(),
            low = self.params.low(),
            high = self.params.high(),
            secret_len = self.source.len(),
            max_connections = self.max_connections,
            "server listening"
        );
        self.running = Some(Running {
            local_addr,
            slots,
            cancel,
            task,
        });
        Ok(local_addr)
    }

    /// Stop accepting, close every connection and wait for the workers.
    ///
    /// Workers get the configured grace period to finish; stragglers are
    /// aborted. Safe to call at any time, including before `start` and more
    /// than once.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        tracing::info!(addr = %running.local_addr, "stopping server");
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            tracing::error!(error = %e, "accept loop failed");
        }
    }

    /// Whether `start` has been called without a matching `stop`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bound address while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Number of connections currently being served.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.running.as_ref().map_or(0, |r| r.slots.active())
    }

    /// Channel parameters the server encodes with.
    #[must_use]
    pub fn params(&self) -> &ChannelParameters {
        &self.params
    }
}

impl Drop for LeakyServer {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

fn bind(addr: SocketAddr, backlog: usize) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(u32::try_from(backlog).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn config_defaults() {
        let config = ServerConfig::new(localhost(), b"abc".to_vec());
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.stop_grace, Duration::from_secs(2));

        let config = config
            .with_max_connections(3)
            .with_stop_grace(Duration::from_millis(50));
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.stop_grace, Duration::from_millis(50));
    }

    #[test]
    fn config_debug_hides_secret() {
        let config = ServerConfig::new(localhost(), b"hunter2".to_vec());
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("secret_len: 7"));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let params = ChannelParameters::close_delay().build().unwrap();

        let zero = ServerConfig::new(localhost(), Vec::new()).with_max_connections(0);
        assert!(matches!(
            LeakyServer::new(zero, params.clone()),
            Err(Error::Config(ConfigError::NoConnections))
        ));

        let long = ServerConfig::new(localhost(), vec![0u8; 65_536]);
        assert!(matches!(
            LeakyServer::new(long, params),
            Err(Error::Config(ConfigError::SecretTooLong { .. }))
        ));
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let params = ChannelParameters::close_delay().build().unwrap();
        let mut server =
            LeakyServer::new(ServerConfig::new(localhost(), b"x".to_vec()), params).unwrap();

        // Stopping a server that never started is a no-op.
        server.stop().await;
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert!(matches!(server.start().await, Err(Error::AlreadyStarted)));

        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
        assert_eq!(server.active_connections(), 0);
    }
}
