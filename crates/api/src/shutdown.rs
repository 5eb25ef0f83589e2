//! Signal handling and the staged shutdown sequence.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{error, info};

use crate::app::services::Lifecycle;

/// Resolve on SIGINT or SIGTERM.
pub async fn signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Shutdown timings.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownPlan {
    pub readiness_drain: Duration,
    pub http_timeout: Duration,
    pub hard_period: Duration,
}

/// Drive the staged shutdown around a running server.
///
/// When `trigger` resolves: mark the process as shutting down, wait the
/// readiness drain, then tell the server to stop accepting (`stop`). In-flight
/// requests get `http_timeout` to finish before their cancellation token fires.
/// If they still have not finished, wait `hard_period` and give up on them.
pub async fn run_with_shutdown<S, T>(
    server: S,
    stop: oneshot::Sender<()>,
    trigger: T,
    lifecycle: Lifecycle,
    plan: ShutdownPlan,
) -> std::io::Result<()>
where
    S: Future<Output = std::io::Result<()>> + Send + 'static,
    T: Future<Output = ()>,
{
    let mut server = tokio::spawn(server);

    tokio::select! {
        result = &mut server => {
            return flatten(result);
        }
        _ = trigger => {}
    }

    info!("shutdown signal received");
    lifecycle.begin_shutdown();
    tokio::time::sleep(plan.readiness_drain).await;

    info!("shutting down http server");
    let _ = stop.send(());

    match tokio::time::timeout(plan.http_timeout, &mut server).await {
        Ok(result) => {
            lifecycle.cancel_requests();
            info!("http server stopped gracefully");
            flatten(result)
        }
        Err(_) => {
            lifecycle.cancel_requests();
            error!(
                timeout_ms = plan.http_timeout.as_millis() as u64,
                "graceful shutdown timed out, forcing close"
            );
            if tokio::time::timeout(plan.hard_period, &mut server).await.is_err() {
                server.abort();
            }
            Ok(())
        }
    }
}

fn flatten(result: Result<std::io::Result<()>, tokio::task::JoinError>) -> std::io::Result<()> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(std::io::Error::other(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> ShutdownPlan {
        ShutdownPlan {
            readiness_drain: Duration::from_millis(50),
            http_timeout: Duration::from_millis(100),
            hard_period: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_path_marks_drains_and_stops() {
        let lifecycle = Lifecycle::default();
        let (stop_tx, stop_rx) = oneshot::channel();
        let server = async move {
            let _ = stop_rx.await;
            Ok(())
        };
        let (fire, trigger) = oneshot::channel::<()>();
        let observer = lifecycle.clone();

        let run = tokio::spawn(run_with_shutdown(
            server,
            stop_tx,
            async move {
                let _ = trigger.await;
            },
            lifecycle.clone(),
            plan(),
        ));

        fire.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(observer.is_shutting_down());
        assert!(!observer.token().is_cancelled());

        run.await.unwrap().unwrap();
        assert!(observer.token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_server_is_abandoned_after_hard_period() {
        let lifecycle = Lifecycle::default();
        let (stop_tx, _stop_rx) = oneshot::channel();
        let server = std::future::pending::<std::io::Result<()>>();

        let result = run_with_shutdown(server, stop_tx, async {}, lifecycle.clone(), plan()).await;
        assert!(result.is_ok());
        assert!(lifecycle.is_shutting_down());
        assert!(lifecycle.token().is_cancelled());
    }
}
