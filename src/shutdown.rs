use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal cuts the drain short.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Watch SIGTERM and SIGINT for the lifetime of the process.
///
/// The first signal cancels the returned token. The worker pool, janitor and
/// HTTP server all watch it and drain. A second signal while draining
/// exits immediately with [`FORCED_EXIT_CODE`], abandoning in-flight sessions.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();

    // Register up front so a failure reaches the caller instead of a detached task
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let trigger = token.clone();
    tokio::spawn(async move {
        let name = next_signal(&mut sigterm, &mut sigint).await;
        tracing::info!(signal = name, "Shutdown requested, draining in-flight jobs");
        trigger.cancel();

        let name = next_signal(&mut sigterm, &mut sigint).await;
        tracing::warn!(signal = name, "Second signal received, exiting without drain");
        std::process::exit(FORCED_EXIT_CODE);
    });

    Ok(token)
}

async fn next_signal(sigterm: &mut Signal, sigint: &mut Signal) -> &'static str {
    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}
