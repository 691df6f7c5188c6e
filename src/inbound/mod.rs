//! Inbound module for Switchyard
//!
//! Listeners accept client connections, run the HTTP or SOCKS5 handshake
//! and hand the destination to an [`InboundHandler`]. The handler either
//! returns a ready [`Tunnel`] or nothing, in which case the listener dials
//! the destination itself. Either way the connection is relayed through a
//! tunnel that is tracked in a [`TunnelRegistry`] while it runs.

pub mod http;
pub mod socks;

pub use http::{HttpTarget, PrefixedStream};

use crate::config::TunnelConfig;
use crate::helper::{next_session_id, DIRECT};
use crate::transport::{connect_tcp, BoxedStream, SocketOpts};
use crate::tunnel::{Tunnel, TunnelStatus};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Client-facing protocol of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// HTTP proxy (`CONNECT` and absolute-form requests)
    Http,
    /// SOCKS5 proxy
    Socks,
}

impl InboundKind {
    /// Session id prefix
    pub fn prefix(&self) -> &'static str {
        match self {
            InboundKind::Http => "http",
            InboundKind::Socks => "socks",
        }
    }
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Processing stage of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Accepted, handshake not finished
    Accepted,
    /// Destination known, outlet being connected
    Connected,
    /// Relaying
    Transfer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Accepted => write!(f, "accepted"),
            Stage::Connected => write!(f, "connected"),
            Stage::Transfer => write!(f, "transfer"),
        }
    }
}

/// Per-connection state shared with the [`InboundHandler`] callbacks
pub struct ConnContext {
    session_id: String,
    peer: Option<SocketAddr>,
    conn: Option<BoxedStream>,
    /// Destination host
    pub dest_host: String,
    /// Destination port
    pub dest_port: u16,
    /// Current stage
    pub stage: Stage,
    /// Rule that selected the outlet
    pub matched_rule: String,
    /// Name of the outlet carrying the connection
    pub selected_outlet: String,
    /// Traffic summary, set once the relay has finished
    pub tunnel_status: Option<TunnelStatus>,
}

impl ConnContext {
    /// Create a context for a freshly accepted connection
    pub fn new(kind: InboundKind, conn: BoxedStream, peer: Option<SocketAddr>) -> Self {
        ConnContext {
            session_id: next_session_id(kind.prefix()),
            peer,
            conn: Some(conn),
            dest_host: String::new(),
            dest_port: 0,
            stage: Stage::Accepted,
            matched_rule: String::new(),
            selected_outlet: String::new(),
            tunnel_status: None,
        }
    }

    /// Session id, e.g. `socks-sid-0x1A`
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Remote address of the client
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Take the client connection, e.g. to build a tunnel with it
    pub fn take_conn(&mut self) -> Option<BoxedStream> {
        self.conn.take()
    }

    /// Put a client connection (back) into the context
    pub fn set_conn(&mut self, conn: BoxedStream) {
        self.conn = Some(conn);
    }

    /// Whether the client connection is still held by the context
    pub fn has_conn(&self) -> bool {
        self.conn.is_some()
    }
}

impl fmt::Debug for ConnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnContext")
            .field("session_id", &self.session_id)
            .field("peer", &self.peer)
            .field("dest_host", &self.dest_host)
            .field("dest_port", &self.dest_port)
            .field("stage", &self.stage)
            .field("matched_rule", &self.matched_rule)
            .field("selected_outlet", &self.selected_outlet)
            .finish()
    }
}

/// Callbacks driven by a listener for every client connection
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// A connection was accepted
    fn on_accepted(&self, ctx: &ConnContext) {
        debug!("<{}> [{}] {:?} arrived", ctx.session_id(), ctx.stage, ctx.peer());
    }

    /// The destination is known; build a tunnel or return `None` to have
    /// the listener dial the destination directly
    ///
    /// A handler that returns `None` must leave the client connection in
    /// the context.
    async fn on_connected(&self, ctx: &mut ConnContext) -> Option<Arc<Tunnel>>;

    /// The relay finished; `ctx.tunnel_status` holds the summary
    fn on_finished(&self, _ctx: &ConnContext) {}

    /// Something failed; `ctx` is absent for accept errors
    fn on_error(&self, ctx: Option<&ConnContext>, err: &anyhow::Error) {
        match ctx {
            Some(ctx) => error!("<{}> [{}] {:#}", ctx.session_id(), ctx.stage, err),
            None => error!("error: {:#}", err),
        }
    }
}

/// Tunnels that are currently relaying
///
/// Entries are keyed by a registry-local counter. Session ids wrap and
/// cannot be used as keys while long-lived tunnels are running.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<Mutex<HashMap<u64, Arc<Tunnel>>>>,
    next_key: Arc<AtomicU64>,
}

impl TunnelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `tunnel`; the returned key removes it again
    pub fn insert(&self, tunnel: Arc<Tunnel>) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.tunnels.lock().insert(key, tunnel);
        key
    }

    /// Stop tracking the tunnel registered under `key`
    pub fn remove(&self, key: u64) -> Option<Arc<Tunnel>> {
        self.tunnels.lock().remove(&key)
    }

    /// Number of tracked tunnels
    pub fn len(&self) -> usize {
        self.tunnels.lock().len()
    }

    /// Whether no tunnel is tracked
    pub fn is_empty(&self) -> bool {
        self.tunnels.lock().is_empty()
    }

    /// Copy of the tracked tunnels
    pub fn active_tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.lock().values().cloned().collect()
    }

    /// Close every tracked tunnel, returning how many were closed
    pub fn close_all(&self) -> usize {
        let tunnels = self.active_tunnels();
        for tunnel in &tunnels {
            tunnel.close();
        }
        tunnels.len()
    }
}

impl fmt::Debug for TunnelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelRegistry")
            .field("active", &self.len())
            .finish()
    }
}

/// A protocol listener bound to one handler
pub struct InboundServer {
    kind: InboundKind,
    handler: Arc<dyn InboundHandler>,
    tunnels: TunnelRegistry,
    tunnel_config: TunnelConfig,
    connect_timeout: Duration,
}

impl InboundServer {
    /// Create a listener of `kind` driving `handler`
    pub fn new(kind: InboundKind, handler: Arc<dyn InboundHandler>) -> Self {
        InboundServer {
            kind,
            handler,
            tunnels: TunnelRegistry::new(),
            tunnel_config: TunnelConfig::default(),
            connect_timeout: Duration::from_secs(crate::helper::DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// Share a tunnel registry with other listeners
    pub fn with_registry(mut self, tunnels: TunnelRegistry) -> Self {
        self.tunnels = tunnels;
        self
    }

    /// Relay settings for direct-fallback tunnels
    pub fn with_tunnel_config(mut self, config: TunnelConfig) -> Self {
        self.tunnel_config = config;
        self
    }

    /// Deadline for direct-fallback dials
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Listener protocol
    pub fn kind(&self) -> InboundKind {
        self.kind
    }

    /// Tunnels currently relaying
    pub fn active_tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.active_tunnels()
    }

    /// Accept connections until a shutdown signal arrives
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<bool>,
    ) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("{} inbound listening on {}", self.kind, addr);
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                            }
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle(Box::new(stream), Some(peer)).await;
                            });
                        }
                        Err(e) => {
                            self.handler.on_error(None, &anyhow!(e).context("accept failed"));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("{} inbound shutting down", self.kind);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Drive one client connection to completion
    pub async fn handle(&self, conn: BoxedStream, peer: Option<SocketAddr>) {
        let mut ctx = ConnContext::new(self.kind, conn, peer);
        self.handler.on_accepted(&ctx);
        if let Err(e) = self.process(&mut ctx).await {
            self.handler.on_error(Some(&ctx), &e);
        }
    }

    async fn process(&self, ctx: &mut ConnContext) -> Result<()> {
        let mut conn = ctx
            .take_conn()
            .ok_or_else(|| anyhow!("client connection missing"))?;

        let route = match self.kind {
            InboundKind::Socks => {
                let (host, port) = socks::handshake(&mut conn).await?;
                ctx.set_conn(conn);
                (host, port, true)
            }
            InboundKind::Http => {
                let target = http::handshake(&mut conn).await?;
                let routable = !target.is_private();
                if target.replay.is_empty() {
                    ctx.set_conn(conn);
                } else {
                    ctx.set_conn(Box::new(PrefixedStream::new(target.replay.clone(), conn)));
                }
                (target.host, target.port, routable)
            }
        };
        let (host, port, routable) = route;

        ctx.dest_host = host;
        ctx.dest_port = port;
        ctx.stage = Stage::Connected;

        let tunnel = if routable {
            self.handler.on_connected(ctx).await
        } else {
            None
        };

        let tunnel = match tunnel {
            Some(tunnel) => tunnel,
            None => self.direct_tunnel(ctx).await?,
        };

        ctx.stage = Stage::Transfer;
        let key = self.tunnels.insert(tunnel.clone());
        let result = tunnel.start().await;
        self.tunnels.remove(key);
        ctx.tunnel_status = Some(tunnel.get_status());

        if let Err(e) = result {
            self.handler.on_error(Some(ctx), &anyhow!(e));
        }
        self.handler.on_finished(ctx);
        Ok(())
    }

    async fn direct_tunnel(&self, ctx: &mut ConnContext) -> Result<Arc<Tunnel>> {
        let local = ctx
            .take_conn()
            .ok_or_else(|| anyhow!("handler consumed the client connection without a tunnel"))?;

        if ctx.selected_outlet.is_empty() {
            ctx.selected_outlet = DIRECT.to_string();
        }

        let remote = connect_tcp(
            &ctx.dest_host,
            ctx.dest_port,
            &SocketOpts::default(),
            self.connect_timeout,
        )
        .await
        .with_context(|| format!("direct dial {}:{} failed", ctx.dest_host, ctx.dest_port))?;

        let tunnel = Tunnel::with_id(ctx.session_id(), local, Box::new(remote), self.tunnel_config)
            .with_outlet(DIRECT);
        Ok(Arc::new(tunnel))
    }
}
