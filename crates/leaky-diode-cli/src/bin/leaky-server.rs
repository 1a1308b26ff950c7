//! Serve a secret over a covert channel until interrupted.
//!
//! # Examples
//!
//! ```bash
//! # Flow modulation with the default rates
//! leaky-server 0.0.0.0 4444 --secret "launch codes"
//!
//! # Close delay, 200 ms for a 0 and 1 s for a 1
//! leaky-server 0.0.0.0 4444 --secret-file key.bin --mode close --low 200 --high 1000
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use leaky_diode::{LeakyServer, ServerConfig};
use leaky_diode_cli::{ChannelArgs, init_tracing};

/// Leak a secret through a data diode's TCP connections.
#[derive(Parser, Debug)]
#[command(name = "leaky-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on
    host: String,

    /// Port to listen on
    port: u16,

    /// Secret to leak (at most 65535 bytes)
    #[arg(short, long, required_unless_present = "secret_file")]
    secret: Option<String>,

    /// Read the secret from a file instead
    #[arg(long, conflicts_with = "secret")]
    secret_file: Option<PathBuf>,

    #[command(flatten)]
    channel: ChannelArgs,

    /// Maximum concurrent connections; extra connections are closed at once
    #[arg(long, default_value_t = 10)]
    max_connections: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let secret = match (&args.secret, &args.secret_file) {
        (_, Some(path)) => std::fs::read(path)
            .with_context(|| format!("Failed to read secret file: {}", path.display()))?,
        (Some(secret), None) => secret.clone().into_bytes(),
        (None, None) => anyhow::bail!("--secret or --secret-file is required"),
    };

    let addr = tokio::net::lookup_host((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("Failed to resolve {}", args.host))?
        .next()
        .with_context(|| format!("No address for {}", args.host))?;

    let params = args.channel.params()?;
    let config = ServerConfig::new(addr, secret).with_max_connections(args.max_connections);
    let mut server = LeakyServer::new(config, params).context("Invalid server configuration")?;

    let local = server
        .start()
        .await
        .with_context(|| format!("Failed to listen on {addr}"))?;
    println!(
        "Leaking in {} mode on {local} (low {}, high {}). Press Ctrl-C to stop.",
        server.params().mode(),
        server.params().low(),
        server.params().high()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    println!("Stopping...");
    server.stop().await;
    Ok(())
}
