use std::io;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Turn SIGTERM and SIGINT into cancellation of the batch.
///
/// Once registered, neither signal kills the process outright any more. The first one
/// cancels the returned token, so queued jobs are reported as cancelled and running
/// jobs are torn down through their grace period, footer and all. Signals that arrive
/// while that teardown is under way are logged and otherwise ignored.
pub fn install_shutdown_handler() -> io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let cancel = token.clone();
    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = sigterm.recv() => "SIGTERM",
                Some(()) = sigint.recv() => "SIGINT",
                else => break,
            };
            if cancel.is_cancelled() {
                tracing::warn!(signal = name, "Already cancelling, waiting for jobs to be torn down");
            } else {
                tracing::warn!(signal = name, "Cancelling batch");
                cancel.cancel();
            }
        }
    });

    Ok(token)
}
