mod archive;
mod cli;
mod display;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;
use fileserver::{
    ProcessSupervisor, ServeSpec, SessionError, SessionOutcome, Tunnel, TunnelClient,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::archive::{Archive, ArchiveError};
use crate::cli::Cli;
use crate::display::FileRow;

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables before clap reads its env fallbacks
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// What ends up behind the download URL
struct Prepared {
    path: PathBuf,
    download_name: Option<String>,
    // Holds the temporary zip until the session is over
    archive: Option<Archive>,
}

/// How preparing the shared file ended
enum Preparation {
    Ready(Prepared),
    Declined,
    Interrupted,
}

/// Cancel the returned token on the first Ctrl+C
fn listen_for_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down...");
                trigger.cancel();
            }
            // Without a listener the session can only end through the tunnel
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });
    token
}

fn failure_message(err: &SessionError) -> String {
    format!("Error during {}: {}", err.phase(), err)
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let interrupt = listen_for_interrupt();
    display::print_banner();

    let paths = cli
        .paths
        .iter()
        .map(|path| {
            std::fs::canonicalize(path).with_context(|| {
                format!("pre-start validation failed: cannot access {}", path.display())
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let rows: Vec<FileRow> = paths.iter().map(|p| FileRow::from_path(p)).collect();
    display::print_file_table(&rows);

    let original: u64 = rows.iter().map(|row| row.size).sum();
    let prepared = match prepare(&cli, paths, original, &interrupt).await? {
        Preparation::Ready(prepared) => prepared,
        Preparation::Declined => {
            println!("Operation cancelled by user.");
            return Ok(ExitCode::SUCCESS);
        }
        Preparation::Interrupted => {
            println!("\nInterrupted before sharing started. Nothing was shared.");
            return Ok(ExitCode::from(SessionOutcome::Interrupted.exit_code()));
        }
    };

    let mut spec = ServeSpec::new(prepared.path.clone())
        .with_port(cli.port)
        .with_host(cli.host.clone());
    if let Some(name) = cli.name.clone().or(prepared.download_name) {
        spec = spec.with_download_name(name);
    }

    let file = match spec.validate() {
        Ok(file) => file,
        Err(e) => {
            eprintln!("{}", failure_message(&SessionError::Validation(e)));
            return Ok(ExitCode::FAILURE);
        }
    };
    display::print_ready(&file, cli.tunnel);

    let mut tunnel = TunnelClient::new(cli.tunnel);
    debug!(tunnel = tunnel.name(), "Tunnel client created");

    let mut urls = tunnel.subscribe();
    let printer = tokio::spawn(async move {
        while urls.changed().await.is_ok() {
            let current = urls.borrow_and_update().clone();
            if let Some(info) = current {
                display::print_public_url(&info);
            }
        }
    });

    let mut supervisor = ProcessSupervisor::new(cli.supervisor_config());
    let result = supervisor
        .run_session_until(spec, &mut tunnel, interrupt.cancelled())
        .await;
    printer.abort();
    drop(prepared.archive);

    match result {
        Ok(report) => {
            info!(
                outcome = ?report.outcome,
                started_at = %report.started_at,
                ended_at = %report.ended_at,
                "Session finished"
            );
            match report.outcome {
                SessionOutcome::Completed => println!("\nTunnel closed. Sharing finished."),
                SessionOutcome::Interrupted => {
                    println!("\nSharing stopped by user. Thanks for using fshare!")
                }
            }
            Ok(ExitCode::from(report.outcome.exit_code()))
        }
        Err(e) => {
            eprintln!("{}", failure_message(&e));
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Pick the file to serve, compressing when needed
///
/// An interrupt during the prompt or the compression ends preparation;
/// a partial archive is removed before this returns.
async fn prepare(
    cli: &Cli,
    paths: Vec<PathBuf>,
    original: u64,
    interrupt: &CancellationToken,
) -> anyhow::Result<Preparation> {
    if let [single] = paths.as_slice() {
        if single.is_file() {
            println!("Sharing single file: {}\n", single.display());
            return Ok(Preparation::Ready(Prepared {
                path: single.clone(),
                download_name: None,
                archive: None,
            }));
        }
    }

    println!("Multiple items or a directory will be compressed into a zip archive.");
    if !cli.yes {
        let accepted = tokio::select! {
            biased;
            _ = interrupt.cancelled() => return Ok(Preparation::Interrupted),
            answer = display::confirm("Continue with compression?") => answer?,
        };
        if !accepted {
            return Ok(Preparation::Declined);
        }
    }

    let download_name = archive::archive_download_name(&paths);

    println!("\nCompressing {} item(s)...", paths.len());
    let cancel = interrupt.clone();
    let built = tokio::task::spawn_blocking(move || {
        archive::build_archive(&paths, &cancel, |progress| {
            display::print_archive_progress(&progress)
        })
    })
    .await
    .context("archive task panicked")?;

    let archive = match built {
        Ok(archive) => archive,
        Err(ArchiveError::Cancelled) => return Ok(Preparation::Interrupted),
        Err(e) => return Err(e.into()),
    };

    if archive.entries() == 0 {
        bail!("nothing to share: the selected directories are empty");
    }

    display::print_archive_summary(original, archive.size());

    Ok(Preparation::Ready(Prepared {
        path: archive.path().to_path_buf(),
        download_name: Some(download_name),
        archive: Some(archive),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileserver::{InvalidFileReason, ServeError};

    #[test]
    fn test_validation_failure_names_phase() {
        let err = SessionError::Validation(ServeError::InvalidFile {
            path: PathBuf::from("/tmp/missing.bin"),
            reason: InvalidFileReason::Missing,
        });

        let message = failure_message(&err);
        assert!(message.starts_with("Error during pre-start validation:"), "{}", message);
        assert!(message.contains("/tmp/missing.bin"), "{}", message);
        assert!(!message.contains('\n'));
    }

    #[test]
    fn test_server_exit_names_phase() {
        assert_eq!(
            failure_message(&SessionError::ServerExited),
            "Error during server start: file server exited unexpectedly"
        );
    }
}
