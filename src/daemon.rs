//! Daemon wiring for Switchyard
//!
//! Builds outlets and the routing table from configuration, starts the
//! enabled listeners and applies reloads.

use crate::config::{geoip_entries, Config, TunnelConfig};
use crate::helper::{format_speed, DIRECT};
use crate::inbound::{ConnContext, InboundHandler, InboundKind, InboundServer, TunnelRegistry};
use crate::outlet::{build_outlets, Network, ProxyClient};
use crate::router::{CidrGeoClassifier, Router};
use crate::tunnel::Tunnel;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Callbacks that route each connection and connect it through its outlet
pub struct RoutingHandler {
    router: Arc<Router>,
    tunnel_config: TunnelConfig,
    connect_timeout: Duration,
}

impl RoutingHandler {
    /// Create a handler routing with `router`
    pub fn new(router: Arc<Router>, tunnel_config: TunnelConfig, connect_timeout: Duration) -> Self {
        RoutingHandler {
            router,
            tunnel_config,
            connect_timeout,
        }
    }
}

#[async_trait]
impl InboundHandler for RoutingHandler {
    async fn on_connected(&self, ctx: &mut ConnContext) -> Option<Arc<Tunnel>> {
        let decision = self.router.route(&ctx.dest_host);
        ctx.matched_rule = decision.matched_rule.clone();
        let matched = if decision.used_default {
            "default outlet"
        } else {
            decision.matched_rule.as_str()
        };

        let Some(outlet) = decision.outlet.clone() else {
            debug!(
                "<{}> [{}:routing] [{}] matched [{}] going direct",
                ctx.session_id(),
                ctx.stage,
                ctx.dest_host,
                matched
            );
            ctx.selected_outlet = DIRECT.to_string();
            return None;
        };
        ctx.selected_outlet = outlet.name().to_string();
        debug!(
            "<{}> [{}:routing] [{}] matched [{}] using [{}]",
            ctx.session_id(),
            ctx.stage,
            ctx.dest_host,
            matched,
            outlet.name()
        );

        let connect = outlet.connect(Network::Tcp, &ctx.dest_host, ctx.dest_port);
        let remote = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                error!(
                    "<{}> [{}:connect] [{}] connect via {} failed: {}",
                    ctx.session_id(),
                    ctx.stage,
                    ctx.dest_host,
                    outlet.name(),
                    e
                );
                ctx.selected_outlet = DIRECT.to_string();
                return None;
            }
            Err(_) => {
                error!(
                    "<{}> [{}:connect] [{}] connect via {} timed out after {:?}",
                    ctx.session_id(),
                    ctx.stage,
                    ctx.dest_host,
                    outlet.name(),
                    self.connect_timeout
                );
                ctx.selected_outlet = DIRECT.to_string();
                return None;
            }
        };

        let local = ctx.take_conn()?;
        let tunnel = Tunnel::with_id(ctx.session_id(), local, remote, self.tunnel_config)
            .with_outlet(outlet.name());
        Some(Arc::new(tunnel))
    }

    fn on_finished(&self, ctx: &ConnContext) {
        let Some(status) = ctx.tunnel_status.as_ref() else {
            return;
        };
        info!(
            "<{}> [{}] used by [{}] [up:{} B | {}] [down:{} B | {}] [duration: {} ms]",
            ctx.session_id(),
            ctx.dest_host,
            ctx.selected_outlet,
            status.up_bytes,
            format_speed(status.up_speed),
            status.down_bytes,
            format_speed(status.down_speed),
            status.total_duration.as_millis()
        );
    }
}

/// The proxy daemon: router, outlets and listeners
pub struct Daemon {
    config: Mutex<Config>,
    router: Arc<Router>,
    tunnels: TunnelRegistry,
    outlets: Mutex<Vec<Arc<dyn ProxyClient>>>,
}

impl Daemon {
    /// Build outlets and the routing table from `config`
    pub fn new(config: Config) -> Result<Self> {
        let daemon = Daemon {
            config: Mutex::new(config.clone()),
            router: Arc::new(Router::new()),
            tunnels: TunnelRegistry::new(),
            outlets: Mutex::new(Vec::new()),
        };
        daemon.apply(&config)?;
        Ok(daemon)
    }

    /// Shared router
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Tunnels relaying on any listener
    pub fn tunnels(&self) -> &TunnelRegistry {
        &self.tunnels
    }

    /// Outlets currently in use
    pub fn outlets(&self) -> Vec<Arc<dyn ProxyClient>> {
        self.outlets.lock().clone()
    }

    /// Build outlets from `config` and swap in a new routing table
    ///
    /// The old pools are closed only after the new table is active; on
    /// error nothing changes.
    fn apply(&self, config: &Config) -> Result<()> {
        let specs = config.router.proxy_specs()?;
        let outlets = build_outlets(&specs, &config.pool)?;

        let classifier = CidrGeoClassifier::from_entries(geoip_entries(&config.geoip)?);
        if !classifier.is_empty() {
            debug!("Geo classifier loaded with {} networks", classifier.len());
        }

        let default = config.router.default_outlet();
        self.router
            .initialize_with_classifier(
                config.router.route_rules(),
                outlets.clone(),
                config.router.alias_mapping(),
                default.as_deref(),
                Arc::new(classifier),
            )
            .context("Failed to initialize routing table")?;

        let previous = std::mem::replace(&mut *self.outlets.lock(), outlets);
        for outlet in previous {
            if let Some(pool) = outlet.pool() {
                pool.close();
            }
        }
        Ok(())
    }

    fn spawn_maintenance(&self) {
        for outlet in self.outlets.lock().iter() {
            if let Some(pool) = outlet.pool() {
                if !pool.is_closed() {
                    let _ = pool.spawn_maintenance();
                }
            }
        }
    }

    /// Apply a new configuration, then drop every live tunnel
    ///
    /// Listener addresses are not rebound. Returns the number of tunnels
    /// that were closed.
    pub fn reload(&self, config: Config) -> Result<usize> {
        if config.server != self.config.lock().server {
            warn!("Listener settings changed; restart to apply them");
        }
        self.apply(&config)?;
        *self.config.lock() = config;
        self.spawn_maintenance();
        let closed = self.refresh();
        info!("Configuration reloaded, {} live tunnels closed", closed);
        Ok(closed)
    }

    /// Close every live tunnel so new connections use the current table
    pub fn refresh(&self) -> usize {
        self.tunnels.close_all()
    }

    /// Bind the enabled listeners and serve until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        let config = self.config.lock().clone();
        let handler: Arc<dyn InboundHandler> = Arc::new(RoutingHandler::new(
            self.router.clone(),
            config.tunnel,
            config.server.connect_timeout(),
        ));

        let listeners = [
            (InboundKind::Http, config.server.http_addr()),
            (InboundKind::Socks, config.server.socks_addr()),
        ];

        let mut tasks = Vec::new();
        for (kind, addr) in listeners {
            let Some(addr) = addr else {
                continue;
            };
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind {} inbound on {}", kind, addr))?;
            let server = Arc::new(
                InboundServer::new(kind, handler.clone())
                    .with_registry(self.tunnels.clone())
                    .with_tunnel_config(config.tunnel)
                    .with_connect_timeout(config.server.connect_timeout()),
            );
            tasks.push(tokio::spawn(server.serve(listener, shutdown_rx.resubscribe())));
        }

        self.spawn_maintenance();
        info!(
            "Switchyard running with router {} and {} outlets",
            self.router.name(),
            self.outlets.lock().len()
        );

        let _ = shutdown_rx.recv().await;

        for task in tasks {
            match task.await {
                Ok(Err(e)) => error!("Listener error: {:#}", e),
                Err(e) => error!("Listener task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }

        let closed = self.refresh();
        for outlet in self.outlets.lock().iter() {
            if let Some(pool) = outlet.pool() {
                pool.close();
            }
        }
        info!("Switchyard stopped, {} live tunnels closed", closed);
        Ok(())
    }
}
