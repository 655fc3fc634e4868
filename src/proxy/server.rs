//! HTTP and HTTPS listeners
//!
//! The plain HTTP listener serves the redirect/ACME handler, the HTTPS
//! listener terminates TLS (SNI certificates from the snapshot) and serves
//! the main proxy handler over HTTP/1.1 or HTTP/2. Cancelling the token
//! stops accepting, sends GOAWAY to open connections and drains them within
//! the shutdown timeout.

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ALT_SVC, STRICT_TRANSPORT_SECURITY};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{Config, HstsConfig};
use crate::proxy::router::{proxy_request, redirect_request, RouterContext};

/// Response headers applied on the TLS-terminated planes (HSTS, Alt-Svc).
#[derive(Clone, Default)]
pub struct HeaderDecorator {
    headers: Vec<(hyper::header::HeaderName, HeaderValue)>,
}

impl HeaderDecorator {
    pub fn new(hsts: Option<&HstsConfig>, alt_svc: Option<&str>) -> Self {
        let mut headers = Vec::new();
        if let Some(hsts) = hsts {
            if let Ok(value) = HeaderValue::from_str(&hsts.header_value()) {
                headers.push((STRICT_TRANSPORT_SECURITY, value));
            }
        }
        if let Some(alt_svc) = alt_svc {
            if let Ok(value) = HeaderValue::from_str(alt_svc) {
                headers.push((ALT_SVC, value));
            }
        }
        Self { headers }
    }

    pub fn apply<B>(&self, response: &mut Response<B>) {
        for (name, value) in &self.headers {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
}

/// Listener timeouts, derived from the controller config.
#[derive(Clone, Copy)]
pub struct ServerSettings {
    pub header_read_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl ServerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            header_read_timeout: config.read_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

fn conn_builder(settings: &ServerSettings) -> auto::Builder<TokioExecutor> {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(settings.header_read_timeout);
    builder.http2().timer(TokioTimer::new());
    builder
}

/// Serve the plain HTTP plane (redirect + ACME pass-through) until cancelled.
pub async fn serve_http(
    listener: TcpListener,
    ctx: Arc<RouterContext>,
    settings: ServerSettings,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "listening for HTTP");
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept HTTP connection");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                let cancel = cancel.clone();
                let settings = settings;
                tracker.spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let ctx = ctx.clone();
                        async move {
                            let response = redirect_request(&ctx, req.map(|b| b.boxed())).await;
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let builder = conn_builder(&settings);
                    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                    let mut conn = std::pin::pin!(conn);
                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(e) = result {
                                debug!(error = %e, "HTTP connection closed with error");
                            }
                        }
                        _ = cancel.cancelled() => {
                            conn.as_mut().graceful_shutdown();
                            let _ = conn.as_mut().await;
                        }
                    }
                });
            }
        }
    }

    drop(listener);
    drain(tracker, settings.shutdown_timeout, "HTTP").await;
    Ok(())
}

/// Serve the HTTPS plane (TLS termination + main proxy handler) until cancelled.
pub async fn serve_https(
    listener: TcpListener,
    tls_config: Arc<ServerConfig>,
    ctx: Arc<RouterContext>,
    decorator: HeaderDecorator,
    settings: ServerSettings,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "listening for HTTPS");
    let acceptor = TlsAcceptor::from(tls_config);
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept HTTPS connection");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let ctx = ctx.clone();
                let decorator = decorator.clone();
                let cancel = cancel.clone();
                let settings = settings;
                tracker.spawn(async move {
                    // SNI certificate selection happens inside the handshake.
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(e) => {
                            debug!(remote = %remote, error = %e, "TLS handshake failed");
                            return;
                        }
                    };
                    let service = service_fn(move |req: Request<Incoming>| {
                        let ctx = ctx.clone();
                        let decorator = decorator.clone();
                        async move {
                            let mut response = proxy_request(&ctx, req.map(|b| b.boxed())).await;
                            decorator.apply(&mut response);
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let builder = conn_builder(&settings);
                    let conn =
                        builder.serve_connection_with_upgrades(TokioIo::new(tls_stream), service);
                    let mut conn = std::pin::pin!(conn);
                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(e) = result {
                                debug!(error = %e, "HTTPS connection closed with error");
                            }
                        }
                        _ = cancel.cancelled() => {
                            conn.as_mut().graceful_shutdown();
                            let _ = conn.as_mut().await;
                        }
                    }
                });
            }
        }
    }

    drop(listener);
    drain(tracker, settings.shutdown_timeout, "HTTPS").await;
    Ok(())
}

/// Wait for the open connections of a listener, bounded by the shutdown timeout.
async fn drain(tracker: TaskTracker, timeout: Duration, plane: &str) {
    tracker.close();
    if tokio::time::timeout(timeout, tracker.wait()).await.is_err() {
        warn!(plane = plane, "graceful shutdown timed out with connections still open");
    } else {
        debug!(plane = plane, "all connections drained");
    }
}
