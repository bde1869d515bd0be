//! Tunnel agent: the socket pool behind one registered hostname
//!
//! A client supplies raw tunnel sockets through the upgrade handshake; the
//! agent waits for each socket's acknowledgement byte, then either hands it
//! to the oldest waiting request or parks it until one arrives. Requests that
//! find no parked socket wait in FIFO order.
//!
//! Every attached socket is supervised by its own task until it is handed
//! out, so sockets that die while parked leave the pool immediately. When the
//! last socket is gone the idle timer starts; if it fires, the agent reports
//! the timeout and destroys itself.

use http_public_proto::CLIENT_ACK;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent closed")]
    Closed,

    #[error("bad client ack: {0:#04x}")]
    BadClientAck(u8),

    #[error("tunnel closed by client")]
    TunnelClosed,

    #[error("unexpected data on idle tunnel")]
    UnexpectedData,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte stream that can back a tunnel
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

type BoxedIo = Box<dyn TunnelIo>;
type Waiter = oneshot::Sender<Result<Tunnel, AgentError>>;
type TimeoutHandler = Box<dyn FnOnce() + Send>;

/// A parked socket; sending a waiter on `claim` asks its supervisor to hand it over
struct ReadyTunnel {
    id: u64,
    claim: oneshot::Sender<Waiter>,
}

#[derive(Default)]
struct AgentState {
    closed: bool,
    /// Every socket attached to this agent, acknowledged or not, parked or in use
    tunnels: HashSet<u64>,
    tunnel_queue: VecDeque<ReadyTunnel>,
    connection_queue: VecDeque<Waiter>,
    idle_timer: Option<JoinHandle<()>>,
    idle_generation: u64,
    on_timeout: Option<TimeoutHandler>,
}

impl AgentState {
    fn check_invariant(&self) {
        debug_assert!(
            self.tunnel_queue.is_empty() || self.connection_queue.is_empty(),
            "tunnel queue and connection queue are both non-empty"
        );
    }

    fn cancel_idle_timer(&mut self) {
        self.idle_generation = self.idle_generation.wrapping_add(1);
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

enum Offer {
    Deliver(Waiter),
    Queued(oneshot::Receiver<Waiter>),
    Closed,
}

struct AgentInner {
    hostname: String,
    idle_timeout: Duration,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    state: Mutex<AgentState>,
}

impl AgentInner {
    fn state(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arm_idle_timer(self: &Arc<Self>, state: &mut AgentState) {
        state.cancel_idle_timer();
        let generation = state.idle_generation;
        let timeout = self.idle_timeout;
        let agent = Arc::downgrade(self);

        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(agent) = agent.upgrade() {
                agent.expire(generation);
            }
        }));
    }

    fn expire(&self, generation: u64) {
        let handler = {
            let mut state = self.state();
            if state.closed || state.idle_generation != generation {
                return;
            }
            state.idle_timer = None;
            state.on_timeout.take()
        };

        info!(
            hostname = %self.hostname,
            "No tunnels for {:?}, expiring agent", self.idle_timeout
        );
        if let Some(handler) = handler {
            handler();
        }
        self.destroy();
    }

    fn destroy(&self) {
        let waiters = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.cancel_idle_timer();
            state.on_timeout = None;
            state.tunnels.clear();
            state.tunnel_queue.clear();
            std::mem::take(&mut state.connection_queue)
        };

        self.shutdown.cancel();
        for waiter in waiters {
            let _ = waiter.send(Err(AgentError::Closed));
        }
        info!(hostname = %self.hostname, "Tunnel agent destroyed");
    }

    /// Remove a socket from every collection. Starts the idle timer when it was
    /// the last one and no idle window is already running; only a completed
    /// handshake resets the window.
    fn detach(self: &Arc<Self>, id: u64) {
        let mut state = self.state();
        if !state.tunnels.remove(&id) {
            return;
        }
        state.tunnel_queue.retain(|ready| ready.id != id);
        state.check_invariant();

        if state.tunnels.is_empty() && !state.closed && state.idle_timer.is_none() {
            debug!(hostname = %self.hostname, "Last tunnel detached, starting idle timer");
            self.arm_idle_timer(&mut state);
        }
    }

    /// An acknowledged socket becomes available: hand it to the oldest live
    /// waiter or park it.
    fn offer(&self, id: u64) -> Offer {
        let mut state = self.state();
        if state.closed || !state.tunnels.contains(&id) {
            return Offer::Closed;
        }
        state.cancel_idle_timer();

        while let Some(waiter) = state.connection_queue.pop_front() {
            if !waiter.is_closed() {
                state.check_invariant();
                return Offer::Deliver(waiter);
            }
        }

        let (claim, claimed) = oneshot::channel();
        state.tunnel_queue.push_back(ReadyTunnel { id, claim });
        state.check_invariant();
        Offer::Queued(claimed)
    }
}

/// Pool and broker for one hostname's tunnels
#[derive(Clone)]
pub struct TunnelAgent {
    inner: Arc<AgentInner>,
}

impl TunnelAgent {
    /// Create an agent with no tunnels and start its idle timer.
    ///
    /// `on_timeout` runs once if the idle timer fires, before the agent
    /// destroys itself. It never runs after an explicit [`destroy`](Self::destroy).
    /// Must be called from within a Tokio runtime.
    pub fn new<F>(hostname: impl Into<String>, idle_timeout: Duration, on_timeout: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = Arc::new(AgentInner {
            hostname: hostname.into(),
            idle_timeout,
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            state: Mutex::new(AgentState {
                on_timeout: Some(Box::new(on_timeout)),
                ..Default::default()
            }),
        });

        {
            let mut state = inner.state();
            inner.arm_idle_timer(&mut state);
        }

        debug!(hostname = %inner.hostname, "Tunnel agent created");
        Self { inner }
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Sockets attached to this agent, including unacknowledged and in-use ones
    pub fn tunnel_count(&self) -> usize {
        self.inner.state().tunnels.len()
    }

    /// Acknowledged sockets waiting for a request
    pub fn ready_count(&self) -> usize {
        self.inner.state().tunnel_queue.len()
    }

    /// Requests waiting for a socket
    pub fn pending_count(&self) -> usize {
        self.inner
            .state()
            .connection_queue
            .iter()
            .filter(|waiter| !waiter.is_closed())
            .count()
    }

    /// Attach a freshly upgraded socket.
    ///
    /// The socket counts as attached right away but is only pooled once the
    /// client's acknowledgement byte arrives. Any other first byte, or an
    /// error before it, drops the socket.
    pub fn register_tunnel<S>(&self, io: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.state();
            if state.closed {
                debug!(hostname = %self.inner.hostname, "Agent closed, dropping tunnel");
                return;
            }
            state.tunnels.insert(id);
        }

        debug!(hostname = %self.inner.hostname, tunnel_id = id, "Tunnel attached, awaiting ack");
        let closed = self.inner.shutdown.child_token();
        tokio::spawn(supervise_tunnel(
            self.inner.clone(),
            id,
            Box::new(io),
            closed,
        ));
    }

    /// Acquire a tunnel, waiting in FIFO order if none is parked.
    ///
    /// Fails with [`AgentError::Closed`] if the agent is or becomes destroyed.
    /// Dropping the returned future withdraws the request.
    pub async fn create_connection(&self) -> Result<Tunnel, AgentError> {
        loop {
            let delivered = {
                let mut state = self.inner.state();
                if state.closed {
                    return Err(AgentError::Closed);
                }

                let (mut waiter, delivered) = oneshot::channel();
                loop {
                    match state.tunnel_queue.pop_front() {
                        Some(ready) => match ready.claim.send(waiter) {
                            Ok(()) => break,
                            // supervisor already gone, try the next parked socket
                            Err(returned) => waiter = returned,
                        },
                        None => {
                            state.connection_queue.push_back(waiter);
                            break;
                        }
                    }
                }
                state.check_invariant();
                delivered
            };

            match delivered.await {
                Ok(result) => return result,
                Err(_) if self.is_closed() => return Err(AgentError::Closed),
                // the claimed socket died before it could be handed over
                Err(_) => continue,
            }
        }
    }

    /// Close every attached socket and fail every waiting request. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl fmt::Debug for TunnelAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelAgent")
            .field("hostname", &self.inner.hostname)
            .finish_non_exhaustive()
    }
}

async fn supervise_tunnel(
    agent: Arc<AgentInner>,
    id: u64,
    io: BoxedIo,
    closed: CancellationToken,
) {
    if let Err(e) = run_tunnel(&agent, id, io, &closed).await {
        match e {
            AgentError::BadClientAck(_) | AgentError::UnexpectedData => {
                warn!(hostname = %agent.hostname, tunnel_id = id, "Dropping tunnel: {}", e)
            }
            e => debug!(hostname = %agent.hostname, tunnel_id = id, "Tunnel gone: {}", e),
        }
        agent.detach(id);
    }
}

/// Returns `Ok` once the socket has been handed to a request; from then on
/// the [`Tunnel`] owns the detach.
async fn run_tunnel(
    agent: &Arc<AgentInner>,
    id: u64,
    mut io: BoxedIo,
    closed: &CancellationToken,
) -> Result<(), AgentError> {
    let mut ack = [0u8; 1];
    tokio::select! {
        _ = closed.cancelled() => return Err(AgentError::Closed),
        res = io.read_exact(&mut ack) => { res?; }
    }
    if ack[0] != CLIENT_ACK {
        return Err(AgentError::BadClientAck(ack[0]));
    }
    debug!(hostname = %agent.hostname, tunnel_id = id, "Tunnel acknowledged");

    loop {
        let waiter = match agent.offer(id) {
            Offer::Closed => return Err(AgentError::Closed),
            Offer::Deliver(waiter) => waiter,
            Offer::Queued(claimed) => {
                let mut byte = [0u8; 1];
                tokio::select! {
                    biased;
                    _ = closed.cancelled() => return Err(AgentError::Closed),
                    waiter = claimed => waiter.map_err(|_| AgentError::Closed)?,
                    res = io.read(&mut byte) => {
                        return Err(match res {
                            Ok(0) => AgentError::TunnelClosed,
                            Ok(_) => AgentError::UnexpectedData,
                            Err(e) => AgentError::Io(e),
                        });
                    }
                }
            }
        };

        let tunnel = Tunnel {
            id,
            io,
            closed: closed.clone(),
            lease: TunnelLease {
                agent: Some(Arc::downgrade(agent)),
                id,
            },
        };

        match waiter.send(Ok(tunnel)) {
            Ok(()) => return Ok(()),
            Err(Ok(tunnel)) => {
                debug!(hostname = %agent.hostname, tunnel_id = id, "Waiter went away, re-offering tunnel");
                io = tunnel.reclaim();
            }
            Err(Err(e)) => return Err(e),
        }
    }
}

/// Detaches the socket from its agent when the [`Tunnel`] is dropped
struct TunnelLease {
    agent: Option<Weak<AgentInner>>,
    id: u64,
}

impl Drop for TunnelLease {
    fn drop(&mut self) {
        if let Some(agent) = self.agent.take().and_then(|agent| agent.upgrade()) {
            agent.detach(self.id);
        }
    }
}

/// A tunnel socket handed out by [`TunnelAgent::create_connection`]
pub struct Tunnel {
    id: u64,
    io: BoxedIo,
    closed: CancellationToken,
    lease: TunnelLease,
}

impl Tunnel {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancelled when the owning agent is destroyed; whoever drives the
    /// socket must stop and drop it.
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn reclaim(self) -> BoxedIo {
        let Tunnel { io, mut lease, .. } = self;
        lease.agent = None;
        io
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel").field("id", &self.id).finish_non_exhaustive()
    }
}

impl AsyncRead for Tunnel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Tunnel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_public_proto::IDLE_TIMEOUT;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    fn agent() -> TunnelAgent {
        TunnelAgent::new("new.localhost", IDLE_TIMEOUT, || {})
    }

    /// Attach one end of a duplex pipe and acknowledge it from the other
    async fn supply(agent: &TunnelAgent) -> DuplexStream {
        let (near, mut far) = duplex(1024);
        agent.register_tunnel(near);
        far.write_all(&[CLIENT_ACK]).await.unwrap();
        far
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_parked_tunnel_is_handed_out() {
        let agent = agent();
        let mut far = supply(&agent).await;
        eventually(|| agent.ready_count() == 1).await;

        let mut tunnel = agent.create_connection().await.unwrap();
        assert_eq!(agent.ready_count(), 0);
        assert_eq!(agent.tunnel_count(), 1);

        tunnel.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let mut buf = [0u8; 16];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_waiter_resolved_once_tunnel_acknowledged() {
        let agent = agent();
        let waiting = tokio::spawn({
            let agent = agent.clone();
            async move { agent.create_connection().await }
        });
        eventually(|| agent.pending_count() == 1).await;

        let _far = supply(&agent).await;
        let tunnel = waiting.await.unwrap();
        assert!(tunnel.is_ok());
        assert_eq!(agent.pending_count(), 0);
        assert_eq!(agent.ready_count(), 0);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_order() {
        let agent = agent();
        let first = tokio::spawn({
            let agent = agent.clone();
            async move { agent.create_connection().await }
        });
        eventually(|| agent.pending_count() == 1).await;
        let second = tokio::spawn({
            let agent = agent.clone();
            async move { agent.create_connection().await }
        });
        eventually(|| agent.pending_count() == 2).await;

        let _far1 = supply(&agent).await;
        let tunnel1 = first.await.unwrap().unwrap();
        assert_eq!(agent.pending_count(), 1);

        let _far2 = supply(&agent).await;
        let tunnel2 = second.await.unwrap().unwrap();
        assert_ne!(tunnel1.id(), tunnel2.id());
        assert_eq!(agent.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_ack_drops_tunnel() {
        let agent = agent();
        let (near, mut far) = duplex(1024);
        agent.register_tunnel(near);
        assert_eq!(agent.tunnel_count(), 1);

        far.write_all(&[0x01]).await.unwrap();
        eventually(|| agent.tunnel_count() == 0).await;
        assert_eq!(agent.ready_count(), 0);

        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);

        let pending = timeout(Duration::from_millis(50), agent.create_connection()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_parked_tunnel_closing_leaves_pool() {
        let agent = agent();
        let far = supply(&agent).await;
        eventually(|| agent.ready_count() == 1).await;

        drop(far);
        eventually(|| agent.tunnel_count() == 0).await;
        assert_eq!(agent.ready_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_tunnel_detaches_it() {
        let agent = agent();
        let _far = supply(&agent).await;
        let tunnel = agent.create_connection().await.unwrap();
        assert_eq!(agent.tunnel_count(), 1);

        drop(tunnel);
        assert_eq!(agent.tunnel_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let agent = agent();
        let abandoned = timeout(Duration::from_millis(20), agent.create_connection()).await;
        assert!(abandoned.is_err());
        assert_eq!(agent.pending_count(), 0);

        let _far = supply(&agent).await;
        eventually(|| agent.ready_count() == 1).await;
        assert!(agent.create_connection().await.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_fails_waiters_and_closes_sockets() {
        let agent = agent();
        let mut far = supply(&agent).await;
        eventually(|| agent.ready_count() == 1).await;
        let in_use = agent.create_connection().await.unwrap();
        let signal = in_use.close_signal();

        let waiting = tokio::spawn({
            let agent = agent.clone();
            async move { agent.create_connection().await }
        });
        eventually(|| agent.pending_count() == 1).await;

        agent.destroy();
        assert!(agent.is_closed());
        assert!(signal.is_cancelled());
        assert!(matches!(waiting.await.unwrap(), Err(AgentError::Closed)));
        assert!(matches!(
            agent.create_connection().await,
            Err(AgentError::Closed)
        ));

        drop(in_use);
        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);

        // second destroy has no further effect
        agent.destroy();
        assert_eq!(agent.tunnel_count(), 0);
    }

    #[tokio::test]
    async fn test_tunnel_supplied_after_destroy_is_dropped() {
        let agent = agent();
        agent.destroy();

        let (near, mut far) = duplex(64);
        agent.register_tunnel(near);
        assert_eq!(agent.tunnel_count(), 0);

        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_agent_times_out() {
        let (notify, notified) = oneshot::channel();
        let agent = TunnelAgent::new("idle.localhost", IDLE_TIMEOUT, move || {
            let _ = notify.send(());
        });

        timeout(IDLE_TIMEOUT * 2, notified).await.unwrap().unwrap();
        assert!(agent.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_cancels_idle_timer_until_last_tunnel_leaves() {
        let agent = agent();
        let far = supply(&agent).await;
        eventually(|| agent.ready_count() == 1).await;

        tokio::time::sleep(IDLE_TIMEOUT * 2).await;
        assert!(!agent.is_closed());

        drop(far);
        eventually(|| agent.tunnel_count() == 0).await;
        tokio::time::sleep(IDLE_TIMEOUT + Duration::from_millis(10)).await;
        assert!(agent.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_tunnels_do_not_extend_idle_window() {
        let agent = agent();

        // keep churning sockets that never acknowledge
        for _ in 0..4 {
            tokio::time::sleep(IDLE_TIMEOUT / 4 - Duration::from_millis(100)).await;
            let (near, far) = duplex(64);
            agent.register_tunnel(near);
            drop(far);
            eventually(|| agent.tunnel_count() == 0).await;
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(agent.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_suppresses_timeout_notification() {
        let (notify, mut notified) = oneshot::channel::<()>();
        let agent = TunnelAgent::new("gone.localhost", IDLE_TIMEOUT, move || {
            let _ = notify.send(());
        });
        agent.destroy();

        tokio::time::sleep(IDLE_TIMEOUT * 2).await;
        assert!(notified.try_recv().is_err());
    }
}
