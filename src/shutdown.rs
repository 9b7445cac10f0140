use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Listen for SIGTERM and SIGINT.
///
/// The returned token is cancelled when either signal arrives. Must be
/// called from inside a tokio runtime.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, cancelling running work");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, cancelling running work");
            }
        }
        trigger.cancel();
    });

    Ok(token)
}
