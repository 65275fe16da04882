//! Tracing subscriber setup

use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

use crate::cli::LogFormat;

/// Initialize the logging system
///
/// Logs go to stderr so they never mix with the share link on stdout.
/// `RUST_LOG` overrides the verbosity flag.
///
/// # Arguments
/// * `verbosity` - 0=warn, 1=info, 2=debug, 3+=trace
/// * `format` - text or JSON lines
pub fn init_logging(verbosity: u8, format: LogFormat) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "fshare={},fileserver={},tower_http={}",
            level, level, level
        ))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled(format, std::io::stderr().is_terminal()))
        .with_target(false);

    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

/// Colors only for text logs on a terminal; redirected or JSON output stays plain
fn ansi_enabled(format: LogFormat, stderr_is_terminal: bool) -> bool {
    format == LogFormat::Text && stderr_is_terminal
}
