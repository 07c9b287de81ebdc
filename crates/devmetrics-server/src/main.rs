use anyhow::{Context, Result};
use clap::Parser;
use devmetrics_common::proto::metric_collector_server::MetricCollectorServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tonic::transport::Server as TonicServer;
use tracing_subscriber::EnvFilter;

use devmetrics_server::app;
use devmetrics_server::config::{ServerArgs, ServerConfig};
use devmetrics_server::grpc::MetricCollectorImpl;
use devmetrics_server::lifecycle;
use devmetrics_server::state::AppState;
use tokio_util::sync::CancellationToken;

/// Resolves on Ctrl-C, or on SIGTERM / SIGQUIT where available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::quit())) {
            (Ok(mut term), Ok(mut quit)) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = quit.recv() => {}
                }
            }
            _ => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn resolve_addr(address: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await
        .with_context(|| format!("cannot resolve '{address}'"))?
        .next()
        .with_context(|| format!("'{address}' resolved to no address"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("devmetrics=info".parse()?))
        .init();

    let args = ServerArgs::parse();
    let config = ServerConfig::load(&args, |key| std::env::var(key).ok())?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %config.address,
        grpc_address = config.grpc_address.as_deref().unwrap_or("-"),
        store_interval = ?config.store_interval,
        store_file = config.store_file.as_deref().unwrap_or("-"),
        database = config.database_dsn.is_some(),
        restore = config.restore,
        signed = config.key.is_some(),
        encrypted = config.crypto_key.is_some(),
        trusted_subnet = ?config.trusted_subnet,
        "devmetrics-server starting"
    );

    let service = Arc::new(lifecycle::build_service(&config)?);
    lifecycle::restore_on_start(&service, &config);

    let cancel = CancellationToken::new();
    let backup_handle = lifecycle::spawn_backup(service.clone(), config.store_interval, cancel.clone());

    // HTTP server
    let app = app::build_http_app(AppState::new(service.clone()));
    let http_listener = tokio::net::TcpListener::bind(&config.address)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", config.address))?;
    tracing::info!(addr = %http_listener.local_addr()?, "HTTP server listening");
    let http_server = axum::serve(
        http_listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.clone().cancelled_owned());
    let http_handle = tokio::spawn(async move { http_server.await });

    // gRPC server, only when an address is configured
    let grpc_handle = match &config.grpc_address {
        Some(address) => {
            let grpc_addr = resolve_addr(address).await?;
            let grpc_service = MetricCollectorServer::new(MetricCollectorImpl::new(service.clone()));
            let shutdown = cancel.clone().cancelled_owned();
            tracing::info!(addr = %grpc_addr, "gRPC server listening");
            Some(tokio::spawn(async move {
                TonicServer::builder()
                    .add_service(grpc_service)
                    .serve_with_shutdown(grpc_addr, shutdown)
                    .await
            }))
        }
        None => None,
    };

    shutdown_signal().await;
    tracing::info!("Shutting down gracefully");
    cancel.cancel();

    match http_handle.await {
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server error"),
        Err(e) => tracing::error!(error = %e, "HTTP server task panicked"),
        Ok(Ok(())) => {}
    }
    if let Some(handle) = grpc_handle {
        match handle.await {
            Ok(Err(e)) => tracing::error!(error = %e, "gRPC server error"),
            Err(e) => tracing::error!(error = %e, "gRPC server task panicked"),
            Ok(Ok(())) => {}
        }
    }
    if let Some(handle) = backup_handle {
        let _ = handle.await;
    }

    lifecycle::shutdown_flush(&service);
    tracing::info!("devmetrics-server stopped");
    Ok(())
}
