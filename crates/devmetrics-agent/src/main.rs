use anyhow::{Context, Result};
use clap::Parser;
use devmetrics_collector::runtime::RuntimeCollector;
use devmetrics_collector::system::SystemCollector;
use devmetrics_common::codec::RsaEncryptor;
use devmetrics_common::sign::Signer;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use devmetrics_agent::config::{AgentArgs, AgentConfig, TransportKind};
use devmetrics_agent::reporter::{MetricSet, Reporter};
use devmetrics_agent::runner;
use devmetrics_agent::transport::{self, GrpcTransport, HttpTransport, Transport};

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

fn build_transport(config: &AgentConfig) -> Result<Box<dyn Transport>> {
    let real_ip = config.real_ip.clone().or_else(|| {
        transport::detect_outbound_ip(config.target()).map(|ip| ip.to_string())
    });
    if let Some(ip) = &real_ip {
        tracing::info!(real_ip = %ip, "Reporting origin address");
    }
    Ok(match config.transport {
        TransportKind::Http => Box::new(HttpTransport::new(
            &config.address,
            real_ip,
            config.request_timeout,
        )?),
        TransportKind::Grpc => Box::new(GrpcTransport::new(
            &config.grpc_address,
            real_ip,
            config.request_timeout,
        )),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("devmetrics=info".parse()?))
        .init();

    let args = AgentArgs::parse();
    let config = AgentConfig::load(&args, |key| std::env::var(key).ok())?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = ?config.transport,
        server = config.target(),
        poll_interval = ?config.poll_interval,
        report_interval = ?config.report_interval,
        signed = config.key.is_some(),
        encrypted = config.crypto_key.is_some(),
        "devmetrics-agent starting"
    );

    let encryptor = config
        .crypto_key
        .as_ref()
        .map(|path| {
            RsaEncryptor::load(path)
                .with_context(|| format!("Failed to load crypto key '{}'", path.display()))
        })
        .transpose()?;
    let reporter = Arc::new(Reporter::new(
        Signer::new(config.key.as_deref()),
        encryptor,
        build_transport(&config)?,
    ));
    let metrics = Arc::new(MetricSet::new());
    let cancel = CancellationToken::new();

    let handles = vec![
        tokio::spawn(runner::sampling_loop(
            metrics.clone(),
            Box::new(RuntimeCollector::new()?),
            config.poll_interval,
            cancel.clone(),
        )),
        tokio::spawn(runner::scan_loop(
            metrics.clone(),
            Box::new(SystemCollector::new()),
            config.poll_interval,
            cancel.clone(),
        )),
        tokio::spawn(runner::report_loop(
            metrics.clone(),
            reporter.clone(),
            config.report_interval,
            cancel.clone(),
        )),
    ];

    shutdown_signal().await;
    tracing::info!("Shutting down gracefully");
    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Agent task panicked");
        }
    }

    let summary = reporter.report(&metrics).await;
    tracing::info!(
        chunks = summary.chunks,
        failed = summary.failed,
        "Final report sent, devmetrics-agent stopped"
    );
    Ok(())
}
