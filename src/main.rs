use anyhow::{Context, Result};
use clap::Parser;
use kube::client::ClientBuilder;
use kube::Client;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use portti::apis::ingress::event_source::EventSource;
use portti::apis::ingress::reconciler::{OwnedSet, Reconciler};
use portti::apis::ingress::status::StatusWriter;
use portti::config::Config;
use portti::error::ControllerError;
use portti::proxy::forwarder::build_client;
use portti::proxy::http3::serve_http3;
use portti::proxy::router::RouterContext;
use portti::proxy::server::{serve_http, serve_https, HeaderDecorator, ServerSettings};
use portti::proxy::snapshot::SnapshotCell;
use portti::proxy::tls;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        info!("rustls crypto provider already installed");
    }

    let config = Config::parse();
    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let client = build_kube_client(&config)
        .await
        .context("failed to construct Kubernetes client")?;

    let cancel = CancellationToken::new();
    let snapshots = Arc::new(SnapshotCell::new());
    let owned: OwnedSet = Arc::new(RwLock::new(HashMap::new()));

    let (event_source, batches) = EventSource::new(
        client.clone(),
        owned.clone(),
        config.debounce_duration(),
        cancel.clone(),
    );

    let status = config
        .host_ip
        .map(|host_ip| StatusWriter::new(client.clone(), host_ip));
    if status.is_none() {
        info!("no host IP configured, ingress status updates are disabled");
    }
    let reconciler = Arc::new(Reconciler::new(
        event_source.ingresses(),
        event_source.services(),
        event_source.secrets(),
        owned,
        config.ingress_class_name.clone(),
        snapshots.clone(),
        status,
    ));

    let ctx = Arc::new(RouterContext::new(
        snapshots.clone(),
        build_client(config.backend_timeout(), config.idle_timeout()),
        config.backend_timeout(),
    ));
    let decorator = HeaderDecorator::new(
        config.hsts_config().as_ref(),
        config.alt_svc_header().as_deref(),
    );
    let settings = ServerSettings::from_config(&config);

    // listeners bind before anything else starts; failure here is fatal
    let http_listener = bind(config.http_port)
        .await
        .context("failed to bind HTTP listener")?;
    let https_listener = bind(config.https_port)
        .await
        .context("failed to bind HTTPS listener")?;
    let tls_config = Arc::new(
        tls::server_config(snapshots.clone(), config.http3)
            .map_err(ControllerError::from)
            .context("failed to build TLS configuration")?,
    );

    let mut tasks: tokio::task::JoinSet<Result<()>> = tokio::task::JoinSet::new();

    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            event_source.run(cancel).await;
            Ok(())
        });
    }
    {
        let reconciler = reconciler.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            reconciler.run(batches, cancel).await;
            Ok(())
        });
    }
    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            serve_http(http_listener, ctx, settings, cancel)
                .await
                .map_err(anyhow::Error::from)
        });
    }
    {
        let ctx = ctx.clone();
        let decorator = decorator.clone();
        let cancel = cancel.clone();
        let tls_config = tls_config.clone();
        tasks.spawn(async move {
            serve_https(https_listener, tls_config, ctx, decorator, settings, cancel)
                .await
                .map_err(anyhow::Error::from)
        });
    }
    if config.http3 {
        let h3_tls = Arc::new(
            tls::h3_server_config(snapshots.clone())
                .map_err(ControllerError::from)
                .context("failed to build HTTP/3 TLS configuration")?,
        );
        let addr = SocketAddr::from(([0, 0, 0, 0], config.http3_port));
        let ctx = ctx.clone();
        let decorator = decorator.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            serve_http3(addr, h3_tls, ctx, decorator, cancel)
                .await
                .map_err(anyhow::Error::from)
        });
    }

    // SIGTERM: keep serving for the shutdown delay so surrounding load
    // balancers notice the drain, then cancel everything.
    {
        let cancel = cancel.clone();
        let delay = config.shutdown_delay();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!(
                delay_secs = delay.as_secs(),
                "shutdown signal received, delaying before drain"
            );
            tokio::time::sleep(delay).await;
            cancel.cancel();
        });
    }

    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "server task failed"),
            Err(e) => error!(error = %e, "task panicked"),
        }
    }

    // listeners are drained, remove our load balancer status entries
    reconciler.clean_ingress_status().await;
    info!("shutdown complete");
    Ok(())
}

async fn bind(port: u16) -> Result<TcpListener, ControllerError> {
    Ok(TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?)
}

/// Kubernetes client with rate limiting applied, the analog of client-side
/// QPS/burst throttling.
async fn build_kube_client(config: &Config) -> Result<Client, ControllerError> {
    let kube_config = kube::Config::infer()
        .await
        .map_err(kube::Error::InferConfig)?;
    let client = ClientBuilder::try_from(kube_config)?
        .with_layer(
            &tower::ServiceBuilder::new()
                .buffer::<http::Request<kube::client::Body>>(config.k8s_client_burst as usize)
                .rate_limit(config.k8s_client_qps as u64, Duration::from_secs(1))
                .into_inner(),
        )
        .build();
    Ok(client)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
