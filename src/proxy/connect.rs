//! CONNECT tunneling and plain-HTTP forwarding.
//!
//! The agent points its HTTP(S) proxy at this listener. Two request
//! shapes arrive:
//!
//! 1. `CONNECT host:port HTTP/1.1` for HTTPS. The flow is:
//!    - Evaluate the decision pipeline for the host (may suspend on a
//!      queued approval).
//!    - If allowed: return `200 Connection Established`, take over the
//!      upgraded socket, and pipe bytes both ways to the target.
//!    - If denied: return `403` citing the decision.
//! 2. Absolute-form requests (`GET http://host/path`) for plain HTTP,
//!    forwarded through a downstream client when permitted.
//!
//! The tunnel is blind: approved CONNECT traffic is piped without
//! interception, so the agent's TLS sessions stay end-to-end.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::error::ProxyError;
use super::policy::{ProxyDecision, ProxyPolicy};

/// Handle an HTTP CONNECT request for HTTPS tunneling.
pub async fn handle_connect(
    req: Request<Incoming>,
    policy: Arc<ProxyPolicy>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    let target = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::InvalidRequest("Missing authority in CONNECT request".into()))?
        .to_string();
    let (host, port) = parse_host_port(&target)?;

    debug!("CONNECT request to {}:{}", host, port);

    let action = format!("CONNECT {}:{}", host, port);
    let description = format!("Agent wants an HTTPS tunnel to {}:{}", host, port);

    match policy.authorize(&host, action, description).await {
        ProxyDecision::Allow => establish_tunnel(req, &host, port).await,
        ProxyDecision::Deny(message) => Ok(forbidden_response(&message)),
    }
}

/// Establish the tunnel after an allow decision.
///
/// Returns `200 Connection Established` and hands the upgraded socket to
/// a spawned task that pipes bytes both ways until either side closes.
async fn establish_tunnel(
    req: Request<Incoming>,
    host: &str,
    port: u16,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    let host = host.to_string();

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = tunnel_connection(upgraded, &host, port).await {
                    // Connection resets are routine here.
                    debug!("Tunnel ended for {}:{}: {}", host, port, e);
                }
            }
            Err(e) => {
                warn!("HTTP upgrade failed for {}:{}: {}", host, port, e);
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .unwrap())
}

/// Pipe bytes between the hijacked client socket and the target.
async fn tunnel_connection(upgraded: Upgraded, host: &str, port: u16) -> Result<(), ProxyError> {
    let upstream_addr = format!("{}:{}", host, port);
    let mut upstream =
        TcpStream::connect(&upstream_addr)
            .await
            .map_err(|e| ProxyError::UpstreamConnect {
                addr: upstream_addr.clone(),
                message: e.to_string(),
            })?;

    debug!("Tunnel open to {}", upstream_addr);

    let mut client = TokioIo::new(upgraded);
    let (from_client, from_upstream) =
        tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;

    debug!(
        "Tunnel closed to {} ({} bytes out, {} bytes in)",
        upstream_addr, from_client, from_upstream
    );
    Ok(())
}

/// Handle an absolute-form plain HTTP request.
pub async fn handle_http(
    req: Request<Incoming>,
    policy: Arc<ProxyPolicy>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    let uri = req.uri();
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::InvalidRequest("Missing host in request URI".into()))?
        .to_string();

    debug!("HTTP proxy request to {}", host);

    let action = format!("{} {}", req.method(), uri);
    let description = format!("Agent wants to {} {}", req.method(), uri);

    match policy.authorize(&host, action, description).await {
        ProxyDecision::Allow => forward_http_request(req).await,
        ProxyDecision::Deny(message) => Ok(forbidden_response(&message)),
    }
}

/// Forward an HTTP request to the upstream server.
async fn forward_http_request(
    req: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;

    let client: Client<_, Incoming> = Client::builder(TokioExecutor::new()).build_http();

    let response = client
        .request(req)
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: "upstream".to_string(),
            message: e.to_string(),
        })?;

    Ok(response.map(|body| body.boxed()))
}

/// Parse `host[:port]` from a CONNECT authority. Defaults to 443.
fn parse_host_port(authority: &str) -> Result<(String, u16), ProxyError> {
    if let Some((host, port_str)) = authority.rsplit_once(':') {
        // IPv6 like [::1]:443
        if host.starts_with('[') && host.ends_with(']') {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| ProxyError::InvalidRequest(format!("Invalid port: {}", port_str)))?;
            return Ok((host[1..host.len() - 1].to_string(), port));
        }

        let port = port_str
            .parse::<u16>()
            .map_err(|_| ProxyError::InvalidRequest(format!("Invalid port: {}", port_str)))?;
        Ok((host.to_string(), port))
    } else {
        Ok((authority.to_string(), 443))
    }
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(content: String) -> BoxBody<Bytes, hyper::Error> {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

/// Build the 403 denial response.
pub fn forbidden_response(message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header("Content-Type", "text/plain")
        .body(full_body(message.to_string()))
        .unwrap()
}
