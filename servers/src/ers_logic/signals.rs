use std::path::PathBuf;

use lib_ingest::{load_config, ErsConfig};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Turns process signals into registry requests until `shutdown` fires:
/// Ctrl-C and SIGTERM cancel `shutdown`, SIGHUP re-reads `config_path` and
/// sends the result to the registry. A configuration that fails to load is
/// logged and the running set stays as it is.
pub async fn watch(config_path: PathBuf, shutdown: CancellationToken, reload: mpsc::Sender<ErsConfig>) {
    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};

        let (mut term, mut hup) = match (
            unix_signal(SignalKind::terminate()),
            unix_signal(SignalKind::hangup()),
        ) {
            (Ok(term), Ok(hup)) => (term, hup),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to install signal handlers, only Ctrl-C is handled");
                wait_ctrl_c(&shutdown).await;
                return;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = signal::ctrl_c() => {
                    info!("Ctrl-C received, initiating shutdown.");
                    shutdown.cancel();
                    break;
                }
                _ = term.recv() => {
                    info!("SIGTERM received, initiating shutdown.");
                    shutdown.cancel();
                    break;
                }
                _ = hup.recv() => {
                    info!(path = %config_path.display(), "SIGHUP received, reloading reader configuration");
                    match load_config(&config_path) {
                        Ok(config) => {
                            if reload.send(config).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "reload ignored"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (config_path, reload);
        wait_ctrl_c(&shutdown).await;
    }
}

async fn wait_ctrl_c(shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received, initiating shutdown.");
            shutdown.cancel();
        }
    }
}

/// Waits for the watcher task. Returns `false` and logs when it panicked or
/// was aborted.
pub async fn join(watcher: JoinHandle<()>) -> bool {
    match watcher.await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "signal watcher ended abnormally");
            false
        }
    }
}
