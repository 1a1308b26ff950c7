//! Argument handling and logging setup shared by `leaky-server` and
//! `leaky-client`.

use anyhow::{Context, Result};
use clap::Args;
use leaky_diode::{AttackMode, ChannelParameters, params};

/// Channel options common to both binaries.
#[derive(Args, Debug, Clone)]
pub struct ChannelArgs {
    /// Attack mode: `flow` (flow modulation) or `close` (close delay)
    #[arg(short, long, default_value = "flow")]
    pub mode: AttackMode,

    /// Low threshold: bytes/s in flow mode, milliseconds in close mode
    #[arg(long)]
    pub low: Option<u32>,

    /// High threshold: bytes/s in flow mode, milliseconds in close mode
    #[arg(long)]
    pub high: Option<u32>,
}

impl ChannelArgs {
    /// Start a parameter builder from the mode and thresholds.
    #[must_use]
    pub fn builder(&self) -> leaky_diode::ChannelParametersBuilder {
        let mut builder = ChannelParameters::builder(self.mode);
        if let Some(low) = self.low {
            builder = builder.low(low);
        }
        if let Some(high) = self.high {
            builder = builder.high(high);
        }
        builder
    }

    /// Validated parameters without any flow timing overrides.
    ///
    /// # Errors
    ///
    /// Fails if the thresholds are invalid for the mode.
    pub fn params(&self) -> Result<ChannelParameters> {
        self.builder()
            .build()
            .context("invalid channel parameters")
    }
}

/// Parse a number of seconds from the command line.
///
/// # Errors
///
/// Fails for negative or non-finite values.
pub fn parse_seconds(name: &'static str, secs: f64) -> Result<std::time::Duration> {
    params::seconds(name, secs).with_context(|| format!("invalid --{name}"))
}

/// Install the tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(verbose: bool) {
    let default = if verbose {
        "leaky_diode=debug,leaky_server=debug,leaky_client=debug"
    } else {
        "leaky_diode=info,leaky_server=info,leaky_client=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Render a partial secret for the terminal: text when printable, hex
/// otherwise.
#[must_use]
pub fn render_secret(secret: &[u8]) -> String {
    match std::str::from_utf8(secret) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => format!("0x{}", hex::encode(secret)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        channel: ChannelArgs,
    }

    #[test]
    fn defaults_follow_mode() {
        let cli = Cli::try_parse_from(["test"]).unwrap();
        let params = cli.channel.params().unwrap();
        assert_eq!(params.mode(), AttackMode::FlowModulation);
        assert_eq!((params.low(), params.high()), (10_000, 100_000));

        let cli = Cli::try_parse_from(["test", "--mode", "close", "--low", "5", "--high", "9"])
            .unwrap();
        let params = cli.channel.params().unwrap();
        assert_eq!(params.mode(), AttackMode::CloseDelay);
        assert_eq!((params.low(), params.high()), (5, 9));
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        assert!(Cli::try_parse_from(["test", "--mode", "smoke"]).is_err());

        let cli = Cli::try_parse_from(["test", "--low", "9", "--high", "5"]).unwrap();
        assert!(cli.channel.params().is_err());

        assert!(parse_seconds("settle", -1.0).is_err());
        assert_eq!(
            parse_seconds("sample", 0.5).unwrap(),
            std::time::Duration::from_millis(500)
        );
    }

    #[test]
    fn secrets_render_as_text_or_hex() {
        assert_eq!(render_secret(b"Hi"), "Hi");
        assert_eq!(render_secret(b""), "");
        assert_eq!(render_secret(&[0x00, 0xFF]), "0x00ff");
    }
}
