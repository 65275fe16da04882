//! Command line arguments
//!
//! Every tunable also reads an `FSHARE_*` environment variable, so a `.env`
//! file next to the binary can hold the defaults.

use clap::{ArgAction, Parser, ValueEnum};
use fileserver::{SupervisorConfig, TunnelProvider, DEFAULT_HOST, DEFAULT_PORT};
use std::path::PathBuf;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Share files and directories instantly over the internet.
///
/// A single file is served as-is; several paths or a directory are
/// compressed into one zip archive first. The link stays valid until you
/// press Ctrl+C.
#[derive(Debug, Parser)]
#[command(name = "fshare", version, about, long_about)]
pub struct Cli {
    /// One or more files or directories to share
    #[arg(required = true, value_name = "PATH")]
    pub paths: Vec<PathBuf>,

    /// File name offered to downloaders
    #[arg(short, long, value_name = "NAME")]
    pub name: Option<String>,

    /// Local port for the file server
    #[arg(short, long, env = "FSHARE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Local address for the file server
    #[arg(long, env = "FSHARE_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Tunnel provider: pinggy, localhost.run, cloudflare or none
    #[arg(short, long, env = "FSHARE_TUNNEL", default_value = "pinggy")]
    pub tunnel: TunnelProvider,

    /// Seconds to wait after the server is up before starting the tunnel
    #[arg(long, env = "FSHARE_WARM_UP", default_value = "2", value_name = "SECS", value_parser = parse_seconds)]
    pub warm_up: Duration,

    /// Seconds running downloads may continue after shutdown starts
    #[arg(long, env = "FSHARE_GRACE", default_value = "2", value_name = "SECS", value_parser = parse_seconds)]
    pub grace: Duration,

    /// Compress without asking for confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, env = "FSHARE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            warm_up: self.warm_up,
            ..SupervisorConfig::default()
        }
        .with_grace_period(self.grace)
    }
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", value))?;
    Duration::try_from_secs_f64(secs).map_err(|_| format!("'{}' is not a valid duration", value))
}
