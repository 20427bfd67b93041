// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use asya_gateway_client::{GatewayClient, ProgressReporter, ReporterHandle};
use asya_sidecar::http::{AppState, build_app};
use asya_sidecar::run::consume_loop;
use asya_sidecar::{Router, SidecarConfig, SidecarMetrics};
use asya_transport::TransportConfig;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "asya-sidecar", version, about = "Asya per-pod message router")]
struct Args {
    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("asya=debug,asya_sidecar=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("asya=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = SidecarConfig::from_env().context("read sidecar environment")?;
    let transport_config = TransportConfig::from_env().context("read transport environment")?;
    let transport = transport_config
        .build()
        .await
        .context("connect transport")?;

    let reporter = config
        .gateway_url
        .as_deref()
        .map(|url| ProgressReporter::spawn(GatewayClient::new(url)));
    let handle = reporter
        .as_ref()
        .map(ProgressReporter::handle)
        .unwrap_or_else(ReporterHandle::disabled);

    let metrics = Arc::new(SidecarMetrics::new());
    let router = Arc::new(Router::new(
        config.clone(),
        transport.clone(),
        handle,
        metrics.clone(),
    ));

    let app = build_app(AppState {
        metrics,
        transport: transport.clone(),
    });
    let listener = tokio::net::TcpListener::bind(config.metrics_addr)
        .await
        .with_context(|| format!("bind {}", config.metrics_addr))?;
    let http = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    info!(
        actor = %config.actor_name,
        queue = %config.own_queue(),
        terminal = ?config.terminal_role(),
        metrics = %config.metrics_addr,
        "asya-sidecar starting"
    );

    consume_loop(router, transport, shutdown_signal())
        .await
        .context("consume loop")?;

    if let Some(reporter) = reporter {
        reporter.shutdown().await;
    }
    http.abort();
    info!("asya-sidecar stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
