//! torrent-fetch - Main entry point
//!
//! Downloads one torrent and exits: 0 when it completes, 1 on a terminal
//! session error, 130 when interrupted.

use std::process::ExitCode;

use anyhow::{Context, Result};
use torrent_fetch::cli::progress::format_bytes;
use torrent_fetch::{CliArgs, Config, Engine, ProgressDisplay, SessionEvent, SessionHandle};
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized at {:?}", args.log_level());
}

/// How the download ended
enum Outcome {
    Done,
    Failed,
    Interrupted,
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_panic_handler();
    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    match run(&args).await {
        Ok(Outcome::Done) => ExitCode::SUCCESS,
        Ok(Outcome::Failed) => ExitCode::from(1),
        Ok(Outcome::Interrupted) => ExitCode::from(130),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(args: &CliArgs) -> Result<Outcome> {
    let cwd = std::env::current_dir().context("Cannot determine the current directory")?;
    let config = Config::from_args(args, &cwd).context("Invalid configuration")?;
    info!("Saving into {}", config.output_dir().display());

    let engine = Engine::new(config.engine.clone())?;
    let handle = engine
        .add(config.source.clone(), config.add.clone())
        .await
        .context("Failed to add torrent")?;
    info!("Added torrent {}", handle.info_hash_hex());

    let outcome = tokio::select! {
        outcome = follow(handle, ProgressDisplay::new(config.quiet)) => outcome,
        _ = shutdown_signal() => {
            warn!("Interrupted, shutting down");
            Outcome::Interrupted
        }
    };

    engine.shutdown_all().await;
    info!("Shut down cleanly");
    Ok(outcome)
}

/// Report events until the session finishes or fails
async fn follow(mut handle: SessionHandle, mut display: ProgressDisplay) -> Outcome {
    while let Some(event) = handle.next_event().await {
        match event {
            SessionEvent::Progress { .. } => {
                display.update(&handle.progress());
            }
            SessionEvent::Done => {
                let progress = handle.progress();
                display.complete(&progress);
                info!("Wrote {} ({})", progress.name.unwrap_or_default(), format_bytes(progress.total_bytes));
                return Outcome::Done;
            }
            SessionEvent::Error(e) => {
                error!("{} error: {}", e.kind(), e);
                return Outcome::Failed;
            }
            SessionEvent::PieceVerified(index) => debug!("Piece {} verified", index),
            SessionEvent::HashMismatch(index) => debug!("Piece {} failed verification", index),
        }
    }
    Outcome::Failed
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
