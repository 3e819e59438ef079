//! # OS termination signals.
//!
//! [`wait_for_shutdown_signal`] completes on the first of:
//! - unix: `SIGINT`, `SIGTERM`, `SIGQUIT` (and Ctrl-C)
//! - elsewhere: Ctrl-C via [`tokio::signal::ctrl_c`]
//!
//! Registration failure is returned as an error so the caller can decide
//! whether to run without signal handling.

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let which = tokio::select! {
        _ = tokio::signal::ctrl_c() => "ctrl_c",
        _ = sigint.recv()  => "sigint",
        _ = sigterm.recv() => "sigterm",
        _ = sigquit.recv() => "sigquit",
    };
    tracing::info!(signal = which, "termination signal received");
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!(signal = "ctrl_c", "termination signal received");
    Ok(())
}
