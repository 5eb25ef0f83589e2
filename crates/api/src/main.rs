use std::net::SocketAddr;

use anyhow::Context;
use tokio::sync::oneshot;

use taskproc_api::shutdown::{self, ShutdownPlan};
use taskproc_infra::AppConfig;
use taskproc_observability::{LogConfig, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;

    taskproc_observability::init_with(&LogConfig {
        level: config.log.level.clone(),
        format: if config.log.json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
    });
    tracing::info!(
        app = %config.app.name,
        version = %config.app.version,
        env = %config.app.env,
        "starting"
    );

    let handles = taskproc_api::app::services::build_services(&config).await?;
    let services = handles.services.clone();
    let app = taskproc_api::app::build_app(services.clone());

    let addr = config.http.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop_rx.await;
        })
        .await
    };

    let plan = ShutdownPlan {
        readiness_drain: config.shutdown.readiness_drain,
        http_timeout: config.shutdown.http_timeout,
        hard_period: config.shutdown.hard_period,
    };
    let result = shutdown::run_with_shutdown(
        server,
        stop_tx,
        shutdown::signal(),
        services.lifecycle.clone(),
        plan,
    )
    .await;

    handles.shutdown().await;
    result.context("http server error")?;
    tracing::info!("application stopped gracefully");
    Ok(())
}
