//! Pool of tunnel connections for one registration
//!
//! Each worker keeps one tunnel open: it upgrades a connection to the proxy,
//! dials the local service, acknowledges the tunnel and splices the two. When
//! either side closes the worker starts over; failures back off exponentially.

use crate::connect::{dial, Target};
use crate::{ClientConfig, ClientError, Registration};
use bytes::Bytes;
use http::header::{CONNECTION, HOST, UPGRADE};
use http::{Method, Request, StatusCode};
use http_body_util::Empty;
use http_public_proto::{
    read_request_head, splice, Prebuffered, CLIENT_ACK, HOST_HEADER, KEY_HEADER, MAX_HEAD_LEN,
    TOKEN_HEADER, TUNNEL_PROTOCOL,
};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// Every configured tunnel has been opened at least once
    Connected { public_url: Url },
    /// A tunnel attempt failed; the worker retries after a delay
    Error { message: String },
}

struct ClusterInner {
    config: ClientConfig,
    registration: Registration,
    events: broadcast::Sender<ClusterEvent>,
    shutdown: CancellationToken,
    open: AtomicUsize,
    announced: AtomicBool,
}

pub struct TunnelCluster {
    inner: Arc<ClusterInner>,
}

impl TunnelCluster {
    pub fn new(config: ClientConfig, registration: Registration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ClusterInner {
                config,
                registration,
                events,
                shutdown: CancellationToken::new(),
                open: AtomicUsize::new(0),
                announced: AtomicBool::new(false),
            }),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.events.subscribe()
    }

    pub fn public_url(&self) -> &Url {
        &self.inner.registration.public_url
    }

    /// Tunnels currently spliced to the local service
    pub fn open_tunnels(&self) -> usize {
        self.inner.open.load(Ordering::Relaxed)
    }

    /// Spawn one worker per configured connection
    pub fn connect(&self) {
        info!(
            "Opening {} tunnels for {}",
            self.inner.config.connections, self.inner.registration.hostname
        );
        for worker in 0..self.inner.config.connections {
            tokio::spawn(run_worker(self.inner.clone(), worker));
        }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Drop for TunnelCluster {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn run_worker(inner: Arc<ClusterInner>, worker: usize) {
    let mut delay = INITIAL_RETRY_DELAY;

    loop {
        let result = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = open_tunnel(&inner) => res,
        };

        match result {
            Ok(()) => {
                delay = INITIAL_RETRY_DELAY;
            }
            Err(e) => {
                warn!("Tunnel {} failed: {} (retrying in {:?})", worker, e, delay);
                let _ = inner.events.send(ClusterEvent::Error {
                    message: e.to_string(),
                });

                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(MAX_RETRY_DELAY);
            }
        }
    }

    debug!("Tunnel worker {} stopped", worker);
}

struct OpenGuard<'a>(&'a AtomicUsize);

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Run one tunnel from upgrade to close
async fn open_tunnel(inner: &ClusterInner) -> Result<(), ClientError> {
    let config = &inner.config;
    let proxy = Target::from_url(&config.proxy_url)?;
    let local = Target::from_url(&config.local_url)?;

    let stream = dial(&proxy, !config.insecure).await?;
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Tunnel upgrade connection error: {}", e);
        }
    });

    let request = Request::builder()
        .method(Method::GET)
        .uri(config.proxy_url.path())
        .header(HOST, proxy.authority())
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, TUNNEL_PROTOCOL)
        .header(TOKEN_HEADER, &config.token)
        .header(KEY_HEADER, &inner.registration.key)
        .header(HOST_HEADER, &inner.registration.hostname)
        .body(Empty::<Bytes>::new())?;

    let response = sender.send_request(request).await?;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(ClientError::UpgradeRefused {
            status: response.status(),
        });
    }
    let upgraded = hyper::upgrade::on(response).await?;
    let mut tunnel = TokioIo::new(upgraded);

    // the local service is always dialed without certificate validation
    let local_conn = dial(&local, false).await?;
    tunnel.write_all(&[CLIENT_ACK]).await?;

    inner.open.fetch_add(1, Ordering::Relaxed);
    let _open = OpenGuard(&inner.open);
    announce_if_ready(inner);

    let (to_local, from_local) = if config.log_requests {
        let mut tunnel = Prebuffered::new(tunnel, MAX_HEAD_LEN);
        match read_request_head(&mut tunnel).await {
            Ok(Some(head)) => info!("{} {}", head.method, head.path),
            Ok(None) => return Ok(()),
            Err(e) => debug!("Could not parse request for logging: {}", e),
        }
        splice(tunnel, local_conn).await
    } else {
        splice(tunnel, local_conn).await
    };

    debug!(
        "Tunnel closed ({} bytes to local, {} bytes from local)",
        to_local, from_local
    );
    Ok(())
}

fn announce_if_ready(inner: &ClusterInner) {
    if inner.open.load(Ordering::Relaxed) >= inner.config.connections
        && !inner.announced.swap(true, Ordering::Relaxed)
    {
        info!(
            "http-public proxy listening at {}",
            inner.registration.public_url
        );
        let _ = inner.events.send(ClusterEvent::Connected {
            public_url: inner.registration.public_url.clone(),
        });
    }
}
