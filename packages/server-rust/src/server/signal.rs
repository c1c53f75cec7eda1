//! Termination signal watcher.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Resolves with the name of the first SIGINT, SIGTERM or SIGHUP.
///
/// # Errors
///
/// Returns an error if a signal handler cannot be installed.
#[cfg(unix)]
pub async fn termination() -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut int = signal(SignalKind::interrupt())?;
    let name = tokio::select! {
        _ = int.recv() => "SIGINT",
        _ = term.recv() => "SIGTERM",
        _ = hup.recv() => "SIGHUP",
    };
    Ok(name)
}

/// Resolves on Ctrl-C.
///
/// # Errors
///
/// Returns an error if the handler cannot be installed.
#[cfg(not(unix))]
pub async fn termination() -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Run-group actor that returns on the first signal or when `parent` is
/// cancelled, which ends the group.
///
/// After a signal, a second one exits the process unless `drained` is
/// cancelled first.
///
/// # Errors
///
/// Returns an error if signal handlers cannot be installed.
pub async fn watch(
    parent: CancellationToken,
    token: CancellationToken,
    drained: CancellationToken,
) -> anyhow::Result<()> {
    tokio::select! {
        () = token.cancelled() => Ok(()),
        () = parent.cancelled() => {
            info!("parent cancelled, shutting down");
            Ok(())
        }
        signal = termination() => {
            let signal = signal?;
            info!(signal, "received signal, shutting down");
            tokio::spawn(abort_on_second_signal(drained));
            Ok(())
        }
    }
}

/// Exits the process on the next signal. Returns once `drained` is
/// cancelled.
pub async fn abort_on_second_signal(drained: CancellationToken) {
    tokio::select! {
        () = drained.cancelled() => {}
        again = termination() => {
            if let Ok(again) = again {
                error!(signal = again, "second signal during shutdown, aborting");
                std::process::exit(1);
            }
        }
    }
}
