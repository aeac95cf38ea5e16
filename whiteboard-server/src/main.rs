use std::sync::Arc;

use log::info;
use whiteboard_collab::metrics::{self, PrometheusMetrics};
use whiteboard_collab::{ServerConfig, ServerError, WhiteboardServer};

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!("Starting whiteboard server ({} store)", config.store.kind());

    let metrics = Arc::new(PrometheusMetrics::new()?);
    let metrics_addr = config.metrics_bind_addr.clone();
    let server = WhiteboardServer::open(config, metrics.clone())
        .await?
        .bind()
        .await?;

    let exporter = match metrics_addr {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
            info!("Metrics on http://{addr}/metrics");
            Some(tokio::spawn(metrics::serve(
                listener,
                metrics.clone(),
                server.shutdown_token(),
            )))
        }
        None => None,
    };

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    if let Some(exporter) = exporter {
        match exporter.await {
            Ok(Err(e)) => log::warn!("Metrics endpoint failed: {e}"),
            Err(e) => log::warn!("Metrics endpoint task failed: {e}"),
            Ok(Ok(())) => {}
        }
    }

    let snapshot = metrics.snapshot();
    info!(
        "Served {} connections, {} draws, {} clears",
        snapshot.connections_total, snapshot.draw_actions, snapshot.clear_actions
    );
    Ok(())
}
