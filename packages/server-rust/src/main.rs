use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use taskgate_server::bus::PulsarBus;
use taskgate_server::config::Cli;
use taskgate_server::network::NetworkModule;
use taskgate_server::{discovery, observability};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    observability::init_logging(cli.debug_enabled());

    let mut config = cli.into_config()?;
    if let Some(addr) = config.metrics_addr {
        observability::install_metrics_exporter(addr)?;
    }

    let host = discovery::advertised_host(config.network.advertise_host.as_deref()).await?;
    config.network.advertise_host = Some(host);

    let bus = PulsarBus::new(config.bus.clone())?;
    info!(
        tenant = %config.bus.tenant,
        namespace = %config.bus.namespace,
        "Pulsar producer endpoint configured"
    );

    let mut module = NetworkModule::new(config.network, config.dispatch, Arc::new(bus));
    let port = module.start().await?;
    info!(port, "taskgate ready");

    module.serve(shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutdown signal received, draining");
}
