use anyhow::Result;
use lib_relay::{Controller, WsProviderConnector};
use tokio::net::TcpListener;
use tokio::signal;

mod relay_logic;
use relay_logic::{config, ingress, logger};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls (wss:// providers)
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    logger::setup_logging(config.log_dir.as_deref(), &config.log_level)?;
    log::info!(
        "Relay controller starting: primary {}, backup {}, {} sends per {:?}",
        config.settings.primary_url,
        config.settings.backup_url,
        config.settings.rate_max,
        config.settings.rate_interval
    );

    let controller = Controller::new(config.settings.clone(), WsProviderConnector)?;
    let supervisor = controller.supervisor().clone();
    controller.start();

    let listener = TcpListener::bind(config.listen_addr).await?;
    let app = ingress::router(controller.clone(), &config.ingress_path);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(ingress::serve(listener, app, async move {
        shutdown_rx.await.ok();
        log::info!("App ingress shutting down.");
    }));

    let finished = tokio::select! {
        reason = supervisor.fatal() => {
            log::error!("Fatal error, exiting: {}", reason);
            log::logger().flush();
            std::process::exit(1);
        }
        result = &mut server => Some(result),
        _ = shutdown_signal() => None,
    };

    let _ = shutdown_tx.send(());
    supervisor.shutdown().await;
    let server_result = match finished {
        Some(result) => result,
        None => server.await,
    };
    match server_result {
        Ok(Err(e)) => log::error!("App ingress failed: {}", e),
        Err(e) => log::error!("App ingress task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    log::info!("Shutdown complete. Final task states: {:?}", supervisor.snapshot());
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}
