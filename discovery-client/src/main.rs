use std::future::Future;
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{eyre, Result};
use tokio::net::TcpListener;
use tokio::signal::unix::SignalKind;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use discovery_client::client::{ClientOptions, DiscoveryClient};
use discovery_client::config::Config;
use discovery_client::events::ClientEvent;
use discovery_client::health::{health_routes, HealthSampler};
use discovery_common::metrics::{serve, setup_metrics_routes};
use discovery_common::transport::Transport;

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    Ok(())
}

async fn log_events(client: DiscoveryClient) {
    let mut events = client.subscribe();

    loop {
        match events.recv().await {
            Ok(ClientEvent::Registered(identity)) => info!(
                "registered as SERVICE_ID: {} INSTANCE_ID: {}",
                identity.service_id, identity.instance_id
            ),
            Ok(ClientEvent::Deregistered) => info!("deregistered"),
            Ok(ClientEvent::Heartbeat) => debug!("heartbeat acknowledged"),
            Ok(ClientEvent::RegistryFetched(cache)) => {
                debug!(
                    "registry refreshed, {} services",
                    cache.service_names().count()
                )
            }
            Ok(ClientEvent::Error(error)) => error!("discovery client error: {}", error),
            Err(RecvError::Lagged(skipped)) => warn!("event logger skipped {} events", skipped),
            Err(RecvError::Closed) => return,
        }
    }
}

fn server_exit(result: Result<std::io::Result<()>, JoinError>) -> eyre::Report {
    match result {
        Ok(Ok(())) => eyre!("health server stopped unexpectedly"),
        Ok(Err(error)) => eyre!("health server failed: {}", error),
        Err(error) => eyre!("health server task panicked: {}", error),
    }
}

/// Serve health and metrics, keep the client registered until `shutdown_signal` resolves,
/// the client fails or the server exits, then deregister.
async fn run<S>(config: Config, shutdown_signal: S) -> Result<()>
where
    S: Future<Output = Result<()>>,
{
    // The health check URL is advertised on registration, it must be served by then.
    let listener = TcpListener::bind(config.bind()).await?;

    let transport = Transport::new(
        config.discovery.endpoint(),
        config.discovery.retry_policy(),
        config.service.timeout.0,
    )?;
    let client = DiscoveryClient::new(transport, ClientOptions::from_config(&config));

    let router = health_routes(
        &config.service.health_check_url,
        Arc::new(HealthSampler::new()),
    );
    let router = setup_metrics_routes(router)?;

    let server_shutdown = CancellationToken::new();
    let mut server = {
        let token = server_shutdown.clone();
        tokio::spawn(serve(router, listener, async move { token.cancelled().await }))
    };
    let mut server_exited = false;

    tokio::spawn(log_events(client.clone()));

    let outcome = match client.start().await {
        Ok(_) => tokio::select! {
            result = shutdown_signal => {
                if let Err(error) = result {
                    error!("failed to wait for shutdown signals: {}", error);
                }
                Ok(())
            }
            fatal = client.closed() => match fatal {
                Some(error) => Err(error.into()),
                None => Ok(()),
            },
            result = &mut server => {
                server_exited = true;
                Err(server_exit(result))
            }
        },
        Err(error) => Err(error.into()),
    };

    client.stop().await;
    server_shutdown.cancel();

    if !server_exited {
        match server.await {
            Ok(Ok(())) => {}
            result => error!("{}", server_exit(result)),
        }
    }

    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env()?;

    run(config, wait_for_shutdown_signal()).await
}
