//! Server endpoint
//!
//! The server owns the tunnel port: it serves the handshake there, then
//! rebinds the port as the raw listener the pool accepts on. In run mode 1
//! it also owns the target listeners (data flow `-`); in mode 2 the client
//! is the ingress (`+`). Mode 0 probes by attempting the target bind.

use std::sync::Arc;

use tokio::net::TcpListener;
use url::Url;

use tracing::{info, warn};

use crate::config::{Scheme, TunnelConfig, REPORT_INTERVAL};
use crate::crypto;
use crate::dns::DnsCache;
use crate::error::{Error, Result};
use crate::pool::{TcpServerPool, TransportPool};

use super::control;
use super::endpoint::{supervise, Endpoint};
use super::handshake;
use super::tunnel;

pub struct Server {
    endpoint: Arc<Endpoint>,
}

impl Server {
    pub async fn new(url: &Url) -> Result<Self> {
        let mut config = TunnelConfig::parse(url)?;
        if config.scheme != Scheme::Server {
            return Err(Error::Config(format!("not a server URL: {}", url)));
        }
        let cache = Arc::new(DnsCache::new(config.dns_ttl));
        config.resolve_addresses(&cache).await?;

        let (tls_code, identity) = crypto::resolve_tls(&config);
        Ok(Self {
            endpoint: Endpoint::new(config, cache, tls_code, identity),
        })
    }

    /// Run under supervision until SIGINT/SIGTERM.
    pub async fn run(&self) {
        supervise(Arc::clone(&self.endpoint), "Server", start).await;
    }
}

async fn start(endpoint: Arc<Endpoint>) -> Result<()> {
    let channels = endpoint.init_run();

    let tunnel_addr = endpoint
        .config
        .tunnel_tcp_addr
        .ok_or_else(|| Error::Config("nil tunnel address".into()))?;
    let tunnel_listener = TcpListener::bind(tunnel_addr)
        .await
        .map_err(|e| Error::Config(format!("tunnel listen {} failed: {}", tunnel_addr, e)))?;

    // Mode 1 owns the target listeners; mode 0 probes for them.
    let mut target_listeners = (None, None);
    let (run_mode, data_flow) = match endpoint.config.run_mode {
        1 => {
            target_listeners = endpoint.init_target_listener().await?;
            (1, '-')
        }
        2 => (2, '+'),
        _ => match endpoint.init_target_listener().await {
            Ok(listeners) => {
                target_listeners = listeners;
                (1, '-')
            }
            Err(_) => (2, '+'),
        },
    };
    {
        let mut state = endpoint.state.write();
        state.run_mode = run_mode;
        state.data_flow = data_flow;
    }

    info!("Pending tunnel handshake...");
    handshake::server_handshake(&endpoint, tunnel_listener).await?;

    // The handshake dropped the listener; the pool takes the port over.
    let tunnel_listener = TcpListener::bind(tunnel_addr)
        .await
        .map_err(|e| Error::Config(format!("tunnel rebind {} failed: {}", tunnel_addr, e)))?;

    let (client_ip, tls_code, tls_config, max_capacity, pool_type) = {
        let state = endpoint.state.read();
        (
            state.client_ip.clone(),
            state.tls_code,
            state.tls.as_ref().map(|identity| identity.config.clone()),
            state.max_pool_capacity,
            state.pool_type,
        )
    };
    if pool_type != 0 {
        warn!("Pool type {} not built in, using TCP", pool_type);
    }
    let pool = TcpServerPool::new(
        max_capacity,
        client_ip,
        (tls_code > 0).then_some(tls_config).flatten(),
        *REPORT_INTERVAL,
    );
    tokio::spawn(Arc::clone(&pool).server_manager(tunnel_listener));
    let pool: Arc<dyn TransportPool> = pool;
    endpoint.set_pool(Arc::clone(&pool));

    info!("Getting tunnel pool ready...");
    let reader = control::set_control_conn(&endpoint, &pool, channels.write_rx).await?;

    if data_flow == '-' {
        let (tcp_listener, udp_socket) = target_listeners;
        let ingress_endpoint = Arc::clone(&endpoint);
        let ingress_pool = Arc::clone(&pool);
        tokio::spawn(tunnel::tunnel_loop(
            ingress_endpoint,
            ingress_pool,
            tcp_listener,
            udp_socket,
        ));
    }

    control::common_control(endpoint, pool, reader, channels.signal_rx).await
}
