//! # Leaky Diode
//!
//! Tests whether a smart data diode leaks data back through the TCP
//! connections it proxies.
//!
//! A TCP pass-through diode only forwards payload one way, but the sending
//! side still sees how the receiving side treats the connection. The
//! [`LeakyServer`] sits behind the diode and encodes one bit of a secret per
//! request into something the client can observe:
//!
//! - **Close delay** - the server holds the connection open for `low` or
//!   `high` milliseconds before closing it. One connection per bit.
//! - **Flow modulation** - the server streams filler at `low` or `high`
//!   bytes per second over one long-lived connection, switching rate on every
//!   request.
//!
//! The [`LeakyClient`] requests bit indices in order, decodes the 16-bit
//! length header and then the payload, and reports the partial secret as it
//! grows.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use leaky_diode::{ChannelParameters, LeakyClient, LeakyServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), leaky_diode::Error> {
//!     let params = ChannelParameters::close_delay().low(50).high(150).build()?;
//!
//!     let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), b"Hi".to_vec());
//!     let mut server = LeakyServer::new(config, params.clone())?;
//!     let addr = server.start().await?;
//!
//!     let mut client = LeakyClient::new("127.0.0.1", addr.port(), params);
//!     client.start().await?;
//!     loop {
//!         let (secret, finished) = client.get_secret(true, Some(Duration::from_secs(1))).await?;
//!         if finished {
//!             assert_eq!(secret, b"Hi");
//!             break;
//!         }
//!     }
//!
//!     client.stop().await;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod bits;
pub mod client;
mod error;
pub mod params;
pub mod server;
pub mod throttle;
pub mod wire;

pub use bits::{Bit, BitSource, SecretAssembler};
pub use client::LeakyClient;
pub use error::{ConfigError, ConnectionError, Error, RangeError, Result};
pub use params::{AttackMode, ChannelParameters, ChannelParametersBuilder, ParseModeError};
pub use server::{LeakyServer, ServerConfig};
