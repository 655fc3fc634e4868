//! Request routing over the current snapshot
//!
//! Two public handlers share the lookup logic: the main proxy handler used
//! by the TLS (and HTTP/3) front, and the redirect handler used by the plain
//! HTTP front, which 308-redirects to HTTPS but tunnels ACME HTTP-01
//! challenges through unencrypted.
//!
//! Every handler loads the snapshot exactly once and keeps that reference
//! for the whole request; a concurrent publication never changes a decision
//! mid-request.

use hyper::header::{HeaderValue, HOST, LOCATION};
use hyper::{Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::proxy::forwarder::{self, status_response, HttpClient, ProxyBody};
use crate::proxy::snapshot::SnapshotCell;

/// ACME HTTP-01 challenges are served cleartext below this prefix.
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge";

/// Shared state for the request handlers.
pub struct RouterContext {
    pub snapshots: Arc<SnapshotCell>,
    pub client: HttpClient,
    /// Upper bound for a complete upstream round trip.
    pub backend_timeout: Duration,
}

impl RouterContext {
    pub fn new(snapshots: Arc<SnapshotCell>, client: HttpClient, backend_timeout: Duration) -> Self {
        Self {
            snapshots,
            client,
            backend_timeout,
        }
    }
}

/// The request host, normalized by stripping any port suffix.
///
/// HTTP/2 and HTTP/3 carry the authority in the URI, HTTP/1.1 in the Host
/// header.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .uri()
        .authority()
        .map(|authority| authority.as_str().to_owned())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        })?;
    Some(strip_port(&raw).to_owned())
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Main proxying handler: Host -> ordered paths -> first match -> upstream.
///
/// 503 before the first snapshot, 404 on host or path miss.
pub async fn proxy_request(ctx: &RouterContext, req: Request<ProxyBody>) -> Response<ProxyBody> {
    let Some(snapshot) = ctx.snapshots.load() else {
        return status_response(StatusCode::SERVICE_UNAVAILABLE);
    };
    let Some(host) = request_host(&req) else {
        return status_response(StatusCode::NOT_FOUND);
    };
    let Some(domain) = snapshot.routing.get(&host) else {
        warn!(host = %host, path = %req.uri().path(), "no routes for host");
        return status_response(StatusCode::NOT_FOUND);
    };
    let Some(route) = domain.matching_route(req.uri().path()) else {
        debug!(host = %host, path = %req.uri().path(), "no matching path");
        return status_response(StatusCode::NOT_FOUND);
    };
    forwarder::forward(&ctx.client, &route.upstream, ctx.backend_timeout, req).await
}

/// Redirect handler for the plain HTTP front.
///
/// ACME challenge paths are proxied to their backend in cleartext; every
/// other matching path is answered with 308 and the HTTPS location. Host or
/// path misses are 404, an uninitialized snapshot is 503.
pub async fn redirect_request(ctx: &RouterContext, req: Request<ProxyBody>) -> Response<ProxyBody> {
    let Some(snapshot) = ctx.snapshots.load() else {
        return status_response(StatusCode::SERVICE_UNAVAILABLE);
    };
    let Some(host) = request_host(&req) else {
        return status_response(StatusCode::NOT_FOUND);
    };
    let Some(domain) = snapshot.routing.get(&host) else {
        return status_response(StatusCode::NOT_FOUND);
    };

    let path = req.uri().path().to_owned();
    if path.starts_with(ACME_CHALLENGE_PREFIX) {
        if let Some(route) = domain.matching_route(&path) {
            debug!(host = %host, path = %path, "serving ACME challenge cleartext");
            return forwarder::forward(&ctx.client, &route.upstream, ctx.backend_timeout, req)
                .await;
        }
    }

    if domain.matching_route(&path).is_some() {
        let location = format!("https://{host}{path}");
        let Ok(location) = HeaderValue::from_str(&location) else {
            return status_response(StatusCode::NOT_FOUND);
        };
        let mut response = status_response(StatusCode::PERMANENT_REDIRECT);
        response.headers_mut().insert(LOCATION, location);
        return response;
    }
    status_response(StatusCode::NOT_FOUND)
}
