//! Process lifecycle: termination signals and idle-session reaping

use crate::api::serve;
use crate::gateway::Gateway;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long in-flight requests may run on after a shutdown signal.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve once SIGINT or (on Unix) SIGTERM arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Serve the API until `signal` resolves, then close every session and
/// give in-flight requests at most `drain` to finish.
///
/// Sessions are closed before the drain, so a long message fetch cannot
/// hold the process open.
///
/// # Errors
///
/// Returns an error if accepting connections fails.
pub async fn serve_until<F>(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    signal: F,
    drain: Duration,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let signal = signal.shared();
    let server = serve(listener, Arc::clone(&gateway), signal.clone());
    tokio::pin!(server);

    let finished = tokio::select! {
        result = &mut server => Some(result),
        () = signal => None,
    };
    gateway.shutdown().await;

    match finished {
        Some(result) => result,
        None => {
            if let Ok(result) = tokio::time::timeout(drain, &mut server).await {
                result
            } else {
                warn!(?drain, "Abandoning in-flight requests");
                Ok(())
            }
        }
    }
}

/// Periodically close sessions that have been idle too long.
#[must_use]
pub fn spawn_idle_reaper(gateway: Arc<Gateway>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            gateway.prune_idle().await;
        }
    })
}

/// Reaper interval for a given idle limit: often enough that a session
/// outlives its limit by at most a fraction of it.
#[must_use]
pub fn reaper_interval(idle: Duration) -> Duration {
    (idle / 4).clamp(Duration::from_secs(1), Duration::from_secs(60))
}
