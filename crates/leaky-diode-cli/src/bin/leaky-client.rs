//! Recover a secret from a leaky server, printing progress as it arrives.
//!
//! # Examples
//!
//! ```bash
//! # Flow modulation, shorter settle and sample windows
//! leaky-client diode.example 4444 --settle 2 --sample 1
//!
//! # Close delay matching the server's thresholds
//! leaky-client diode.example 4444 --mode close --low 200 --high 1000
//! ```

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use leaky_diode::LeakyClient;
use leaky_diode_cli::{ChannelArgs, init_tracing, parse_seconds, render_secret};

/// Recover a secret leaked through a data diode.
#[derive(Parser, Debug)]
#[command(name = "leaky-client")]
#[command(version, about, long_about = None)]
struct Args {
    /// Server host
    host: String,

    /// Server port
    port: u16,

    #[command(flatten)]
    channel: ChannelArgs,

    /// Seconds to wait after each request before sampling (flow mode)
    #[arg(long, default_value_t = 10.0)]
    settle: f64,

    /// Seconds to sample the transfer rate for each bit (flow mode)
    #[arg(long, default_value_t = 4.0)]
    sample: f64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let params = args
        .channel
        .builder()
        .settle_time(parse_seconds("settle", args.settle)?)
        .sample_time(parse_seconds("sample", args.sample)?)
        .build()
        .context("invalid channel parameters")?;

    println!(
        "Leaking from {}:{} in {} mode. Press Ctrl-C to stop.",
        args.host,
        args.port,
        params.mode()
    );

    let started = Instant::now();
    let mut client = LeakyClient::new(args.host.clone(), args.port, params);
    client.start().await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut last = None;
    let finished = loop {
        tokio::select! {
            _ = &mut shutdown => break false,
            polled = client.get_secret(true, Some(Duration::from_secs(1))) => {
                let (secret, finished) = polled.context("Leak failed")?;
                let decoded = client.bits_decoded();
                if last != Some(decoded) {
                    last = Some(decoded);
                    let total = client
                        .total_bits()
                        .map_or_else(|| String::from("?"), |t| t.to_string());
                    println!("[{decoded}/{total} bits] {}", render_secret(&secret));
                }
                if finished {
                    break true;
                }
            }
        }
    };

    let (secret, _) = client.get_secret(false, None).await?;
    client.stop().await;

    if finished {
        println!(
            "Secret ({} bytes, {:.1}s): {}",
            secret.len(),
            started.elapsed().as_secs_f64(),
            render_secret(&secret)
        );
    } else {
        println!("Interrupted. Partial secret: {}", render_secret(&secret));
    }
    Ok(())
}
