//! HTTP/3 front over QUIC
//!
//! Optional UDP listener sharing the snapshot-backed certificate selection
//! and the main proxy handler with the HTTPS plane. Clients learn about it
//! through the Alt-Svc header the HTTPS responses carry.
//!
//! h3 requests arrive as stream chunks, so request and response bodies are
//! buffered here rather than streamed.

use bytes::Buf;
use h3::server::RequestStream;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use quinn::crypto::rustls::QuicServerConfig;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::proxy::forwarder::full_body;
use crate::proxy::router::{proxy_request, RouterContext};
use crate::proxy::server::HeaderDecorator;

/// Serve the HTTP/3 plane until cancelled.
pub async fn serve_http3(
    addr: SocketAddr,
    tls_config: Arc<ServerConfig>,
    ctx: Arc<RouterContext>,
    decorator: HeaderDecorator,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let quic_config = QuicServerConfig::try_from((*tls_config).clone())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_config));
    let endpoint = quinn::Endpoint::server(server_config, addr)?;
    info!(addr = %addr, "listening for HTTP/3");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                let ctx = ctx.clone();
                let decorator = decorator.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let connection = match incoming.await {
                        Ok(connection) => connection,
                        Err(e) => {
                            debug!(error = %e, "QUIC handshake failed");
                            return;
                        }
                    };
                    if let Err(e) = serve_connection(connection, ctx, decorator, cancel).await {
                        debug!(error = %e, "HTTP/3 connection ended with error");
                    }
                });
            }
        }
    }

    endpoint.close(0u32.into(), b"shutdown");
    endpoint.wait_idle().await;
    Ok(())
}

async fn serve_connection(
    connection: quinn::Connection,
    ctx: Arc<RouterContext>,
    decorator: HeaderDecorator,
    cancel: CancellationToken,
) -> Result<(), h3::Error> {
    let mut h3_conn: h3::server::Connection<_, Bytes> =
        h3::server::Connection::new(h3_quinn::Connection::new(connection)).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            request = h3_conn.accept() => {
                match request {
                    Ok(Some((req, stream))) => {
                        let ctx = ctx.clone();
                        let decorator = decorator.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(req, stream, ctx, decorator).await {
                                debug!(error = %e, "HTTP/3 request failed");
                            }
                        });
                    }
                    Ok(None) => break,
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Ok(())
}

async fn handle_request(
    req: Request<()>,
    mut stream: RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
    ctx: Arc<RouterContext>,
    decorator: HeaderDecorator,
) -> Result<(), h3::Error> {
    let mut body = Vec::new();
    while let Some(mut chunk) = stream.recv_data().await? {
        body.extend_from_slice(&chunk.copy_to_bytes(chunk.remaining()));
    }

    let (parts, ()) = req.into_parts();
    let req = Request::from_parts(parts, full_body(Bytes::from(body)));
    let mut response = proxy_request(&ctx, req).await;
    decorator.apply(&mut response);

    let (head, body_bytes) = {
        let (parts, body) = response.into_parts();
        match body.collect().await {
            Ok(collected) => (parts, collected.to_bytes()),
            Err(e) => {
                warn!(error = %e, "failed to read upstream body for HTTP/3 response");
                let mut parts = parts;
                parts.status = StatusCode::BAD_GATEWAY;
                parts.headers.clear();
                (parts, Bytes::new())
            }
        }
    };

    stream.send_response(Response::from_parts(head, ())).await?;
    if !body_bytes.is_empty() {
        stream.send_data(body_bytes).await?;
    }
    stream.finish().await
}
