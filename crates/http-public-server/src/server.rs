//! Public HTTP dispatcher
//!
//! One listener carries both sides of the system: requests whose `Host` is the
//! server's own hostname come from tunnel clients (registration and tunnel
//! supply), everything else comes from visitors and is routed by hostname to a
//! [`TunnelAgent`].
//!
//! The first request head of every connection is read raw. Upgrade requests
//! stay on the raw socket so the head can be replayed verbatim onto a tunnel;
//! plain requests are handed to hyper with keep-alive disabled, so each
//! connection carries exactly one classified request.

use crate::agent::TunnelAgent;
use crate::registry::{RegistryError, TunnelRegistry};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, HOST};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use http_public_proto::{
    parse_hostname, read_request_head, splice, HeadError, Prebuffered, RequestHead, HOST_HEADER,
    IDLE_TIMEOUT, KEY_HEADER, MAX_HEAD_LEN, TOKEN_HEADER, TUNNEL_PROTOCOL,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

const RAW_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";
const RAW_NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The server's own hostname; requests for it are client requests
    pub hostname: String,
    pub bind_addr: SocketAddr,
    /// Shared secret clients present when registering
    pub token: String,
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 1111)),
            token: String::new(),
            idle_timeout: IDLE_TIMEOUT,
        }
    }
}

struct ServerState {
    hostname: String,
    token: String,
    idle_timeout: Duration,
    registry: Arc<TunnelRegistry>,
}

/// Stops a running [`TunnelServer`]
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shutdown: CancellationToken,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub struct TunnelServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
}

impl TunnelServer {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            ServerError::BindError {
                address: config.bind_addr.ip().to_string(),
                port: config.bind_addr.port(),
                reason: e.to_string(),
            }
        })?;

        let hostname = parse_hostname(&config.hostname).unwrap_or(config.hostname);
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                hostname,
                token: config.token,
                idle_timeout: config.idle_timeout,
                registry: Arc::new(TunnelRegistry::new()),
            }),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.state.registry.clone()
    }

    pub fn shutdown_handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Accept connections until shut down. On shutdown every registered agent
    /// is destroyed before the listener closes.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            "Tunnel server listening on {} (hostname {})",
            self.listener.local_addr()?,
            self.state.hostname
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let state = self.state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer_addr, state).await {
                                debug!("Connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }

        info!("Shutting down tunnel server");
        self.state.registry.destroy_all();
        drop(self.listener);
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), ServerError> {
    let mut conn = Prebuffered::new(stream, MAX_HEAD_LEN);

    let head = match read_request_head(&mut conn).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(HeadError::Io(e)) => return Err(e.into()),
        Err(e) => {
            debug!("Bad request head from {}: {}", peer_addr, e);
            conn.write_all(RAW_BAD_REQUEST).await?;
            return Ok(());
        }
    };

    if head.is_upgrade() {
        handle_upgrade(conn, head, peer_addr, &state).await
    } else {
        serve_plain(conn, state).await
    }
}

async fn serve_plain(
    conn: Prebuffered<TcpStream>,
    state: Arc<ServerState>,
) -> Result<(), ServerError> {
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(handle_request(state, req).await) }
    });

    http1::Builder::new()
        .keep_alive(false)
        .preserve_header_case(true)
        .timer(TokioTimer::new())
        .serve_connection(TokioIo::new(conn), service)
        .await?;
    Ok(())
}

async fn handle_request(state: Arc<ServerState>, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(hostname) = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_hostname)
    else {
        return status_response(StatusCode::BAD_REQUEST, "Missing or invalid Host header\n");
    };

    if hostname == state.hostname {
        return register_client(&state, req.headers());
    }

    let Some(agent) = state.registry.lookup(&hostname) else {
        debug!("No tunnel registered for {}", hostname);
        return status_response(StatusCode::NOT_FOUND, "Tunnel not found\n");
    };

    match proxy_request(agent, req).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Proxying to {} failed: {}", hostname, e);
            status_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n")
        }
    }
}

fn register_client(state: &ServerState, headers: &HeaderMap) -> Response<ProxyBody> {
    let authorized = headers
        .get(TOKEN_HEADER)
        .is_some_and(|token| token.as_bytes() == state.token.as_bytes());
    if !authorized {
        return status_response(StatusCode::FORBIDDEN, "Forbidden\n");
    }

    let Some(hostname) = headers
        .get(HOST_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_hostname)
    else {
        return status_response(StatusCode::BAD_REQUEST, "Missing or invalid x-tunnel-host\n");
    };

    let registry = Arc::downgrade(&state.registry);
    let idle_timeout = state.idle_timeout;
    let registered = state.registry.register_with(&hostname, |key| {
        let expired_host = hostname.clone();
        let expired_key = key.to_string();
        TunnelAgent::new(hostname.clone(), idle_timeout, move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove_if_key(&expired_host, &expired_key);
            }
        })
    });

    match registered {
        Ok(registered) => match HeaderValue::from_str(&registered.key) {
            Ok(key) => {
                let mut response = status_response(StatusCode::CREATED, "");
                response.headers_mut().insert(KEY_HEADER, key);
                response
            }
            Err(e) => {
                error!("Unusable registration key for {}: {}", hostname, e);
                state.registry.remove_if_key(&hostname, &registered.key);
                registered.agent.destroy();
                status_response(StatusCode::INTERNAL_SERVER_ERROR, "")
            }
        },
        Err(RegistryError::AlreadyRegistered(_)) => {
            debug!("Rejected duplicate registration for {}", hostname);
            status_response(StatusCode::CONFLICT, "Hostname already registered\n")
        }
    }
}

/// Forward one visitor request over a tunnel acquired from `agent`.
async fn proxy_request(
    agent: TunnelAgent,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Box<dyn std::error::Error + Send + Sync>> {
    let tunnel = agent.create_connection().await?;
    let tunnel_id = tunnel.id();
    let closed = tunnel.close_signal();

    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(tunnel))
        .await?;

    tokio::spawn(async move {
        tokio::select! {
            res = conn => {
                if let Err(e) = res {
                    debug!("Tunnel {} connection error: {}", tunnel_id, e);
                }
            }
            _ = closed.cancelled() => debug!("Tunnel {} closed by agent", tunnel_id),
        }
    });

    debug!("Proxying {} {} over tunnel {}", req.method(), req.uri(), tunnel_id);
    let response = sender.send_request(req).await?;
    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, body.boxed()))
}

async fn handle_upgrade(
    mut conn: Prebuffered<TcpStream>,
    head: RequestHead,
    peer_addr: SocketAddr,
    state: &ServerState,
) -> Result<(), ServerError> {
    let Some(hostname) = head.hostname() else {
        debug!("Upgrade from {} without a usable Host header", peer_addr);
        conn.write_all(RAW_BAD_REQUEST).await?;
        let _ = conn.shutdown().await;
        return Ok(());
    };

    if hostname == state.hostname {
        supply_tunnel(conn, head, peer_addr, state).await
    } else {
        upgrade_visitor(conn, head, hostname, state).await
    }
}

/// A client offers a tunnel socket. Every mismatch drops the socket without a
/// response, so unknown hostnames and wrong keys look the same.
async fn supply_tunnel(
    mut conn: Prebuffered<TcpStream>,
    head: RequestHead,
    peer_addr: SocketAddr,
    state: &ServerState,
) -> Result<(), ServerError> {
    let protocol_ok = head
        .upgrade_protocol()
        .is_some_and(|protocol| protocol.eq_ignore_ascii_case(TUNNEL_PROTOCOL));

    let agent = protocol_ok
        .then(|| head.header(HOST_HEADER).and_then(parse_hostname))
        .flatten()
        .and_then(|hostname| {
            let key = head.header(KEY_HEADER)?;
            state.registry.authorize(&hostname, key)
        });

    let Some(agent) = agent else {
        debug!("Rejected tunnel supply from {}", peer_addr);
        return Ok(());
    };

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nConnection: upgrade\r\nUpgrade: {}\r\n\r\n",
        TUNNEL_PROTOCOL
    );
    conn.write_all(response.as_bytes()).await?;
    conn.discard(head.len);

    debug!("Tunnel supplied for {} from {}", agent.hostname(), peer_addr);
    agent.register_tunnel(conn);
    Ok(())
}

/// A visitor upgrade (e.g. a WebSocket) is spliced onto a tunnel after the
/// original head is replayed.
async fn upgrade_visitor(
    mut conn: Prebuffered<TcpStream>,
    head: RequestHead,
    hostname: String,
    state: &ServerState,
) -> Result<(), ServerError> {
    let Some(agent) = state.registry.lookup(&hostname) else {
        debug!("Upgrade for unknown host {}", hostname);
        conn.write_all(RAW_NOT_FOUND).await?;
        let _ = conn.shutdown().await;
        return Ok(());
    };

    let acquired = tokio::select! {
        res = agent.create_connection() => res,
        _ = visitor_gone(conn.get_ref()) => {
            debug!("Visitor for {} left before a tunnel was available", hostname);
            return Ok(());
        }
    };
    let mut tunnel = match acquired {
        Ok(tunnel) => tunnel,
        Err(e) => {
            debug!("No tunnel for upgrade to {}: {}", hostname, e);
            return Ok(());
        }
    };

    conn.discard(head.len);
    let (leftover, visitor) = conn.into_parts();
    tunnel.write_all(&head.to_bytes()).await?;
    if !leftover.is_empty() {
        tunnel.write_all(&leftover).await?;
    }

    let closed = tunnel.close_signal();
    debug!("Splicing upgrade for {} onto tunnel {}", hostname, tunnel.id());
    tokio::select! {
        _ = splice(visitor, tunnel) => {}
        _ = closed.cancelled() => debug!("Agent for {} destroyed mid-splice", hostname),
    }
    Ok(())
}

/// Resolves once the visitor has closed or reset its socket
async fn visitor_gone(stream: &TcpStream) {
    let mut byte = [0u8; 1];
    match stream.peek(&mut byte).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending().await,
    }
}

fn status_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from_static(body.as_bytes()))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}
