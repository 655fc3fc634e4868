//! Upstream request forwarding
//!
//! One shared connection-pooled client serves every backend path; the dial
//! timeout is baked into the connector once at startup. Request bodies are
//! streamed through, hop-by-hop headers are stripped in both directions and
//! the outbound Host header is rewritten to the upstream authority.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::HOST;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{debug, warn};

use crate::proxy::snapshot::Upstream;

/// Unified body type for requests and responses on the proxy path.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Connection-pooled upstream HTTP client.
pub type HttpClient = Client<HttpConnector, ProxyBody>;

/// Build the shared upstream client with the configured dial timeout.
/// Idle pooled connections are dropped after the idle timeout.
pub fn build_client(connect_timeout: Duration, pool_idle_timeout: Duration) -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(connect_timeout));
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(pool_idle_timeout)
        .build(connector)
}

/// An empty response body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// A complete in-memory body.
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// A response with the given status and no body.
pub fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

/// Check if a header is hop-by-hop and should not be forwarded
/// per RFC 2616 Section 13.5.1.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Forward a request to the upstream behind the matched backend path.
///
/// Any upstream failure (dial, timeout, protocol error) is answered with
/// 502 Bad Gateway; dropping the returned future cancels the upstream call.
pub async fn forward(
    client: &HttpClient,
    upstream: &Upstream,
    timeout: Duration,
    req: Request<ProxyBody>,
) -> Response<ProxyBody> {
    let (parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = match format!("http://{}{}", upstream.authority(), path_and_query).parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(upstream = %upstream, error = %e, "invalid upstream URI");
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    let mut builder = Request::builder().method(parts.method).uri(uri);
    for (name, value) in parts.headers.iter() {
        let name_str = name.as_str();
        if name_str != "host" && !is_hop_by_hop_header(name_str) {
            builder = builder.header(name, value);
        }
    }
    builder = builder.header(HOST, upstream.authority());

    let upstream_req = match builder.body(body) {
        Ok(req) => req,
        Err(e) => {
            warn!(upstream = %upstream, error = %e, "failed to build upstream request");
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    let upstream_resp = match tokio::time::timeout(timeout, client.request(upstream_req)).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            warn!(upstream = %upstream, error = %e, "upstream request failed");
            return status_response(StatusCode::BAD_GATEWAY);
        }
        Err(_) => {
            warn!(
                upstream = %upstream,
                timeout_ms = timeout.as_millis() as u64,
                "upstream request timed out"
            );
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    debug!(
        upstream = %upstream,
        status = upstream_resp.status().as_u16(),
        "upstream responded"
    );

    // Response body streams through unchanged; only hop-by-hop headers are dropped.
    let (mut parts, body) = upstream_resp.into_parts();
    let headers_to_remove: Vec<_> = parts
        .headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for header_name in headers_to_remove {
        parts.headers.remove(header_name);
    }

    Response::from_parts(parts, body.boxed())
}
