//! The mediating proxy listener.
//!
//! A second TCP listener (default port 3701) that the agent's HTTP(S)
//! traffic is pointed at. Each accepted connection is served by hyper's
//! HTTP/1.1 stack with upgrade support so CONNECT requests can hijack
//! the socket after approval. Every connection handler runs in its own
//! task; a handler suspended on a queued approval costs no thread.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::connect::{handle_connect, handle_http};
use super::error::ProxyError;
use super::policy::ProxyPolicy;

/// The proxy server.
pub struct ProxyServer {
    addr: SocketAddr,
    policy: Arc<ProxyPolicy>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(addr: SocketAddr, policy: Arc<ProxyPolicy>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            addr,
            policy,
            shutdown_rx,
        }
    }

    /// Run the accept loop until the shutdown signal fires.
    pub async fn run(self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Proxy listening on {}", self.addr);

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("Accepted proxy connection from {}", peer);
                            self.spawn_connection_handler(stream);
                        }
                        Err(e) => {
                            warn!("Failed to accept proxy connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn spawn_connection_handler(&self, stream: TcpStream) {
        let policy = self.policy.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, policy).await {
                let err_str = e.to_string();
                if err_str.contains("connection reset")
                    || err_str.contains("broken pipe")
                    || err_str.contains("Connection reset")
                {
                    debug!("Proxy connection ended: {}", e);
                } else {
                    warn!("Proxy connection error: {}", e);
                }
            }
        });
    }
}

/// Serve one client connection.
async fn handle_connection(stream: TcpStream, policy: Arc<ProxyPolicy>) -> Result<(), ProxyError> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let policy = policy.clone();
        async move { proxy_request(req, policy).await }
    });

    // HTTP/1.1 with upgrade support, needed for CONNECT hijack.
    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}

async fn proxy_request(
    req: Request<Incoming>,
    policy: Arc<ProxyPolicy>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    if req.method() == Method::CONNECT {
        handle_connect(req, policy).await
    } else {
        handle_http(req, policy).await
    }
}
