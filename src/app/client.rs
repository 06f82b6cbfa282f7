//! Client endpoint
//!
//! Mode 1 collapses to single mode: the client binds the tunnel address
//! itself and dials targets directly. Mode 2 joins the server's tunnel:
//! handshake, pool of dialed connections, control channel, and, for data
//! flow `+`, the target listeners on this side. Mode 0 probes the tunnel
//! bind to choose.

use std::sync::Arc;

use url::Url;

use tracing::{info, warn};

use crate::config::{Scheme, TunnelConfig, REPORT_INTERVAL, TCP_DIAL_TIMEOUT};
use crate::dns::DnsCache;
use crate::error::{Error, Result};
use crate::pool::{DialFn, TcpClientPool, TransportPool};

use super::control;
use super::endpoint::{supervise, Endpoint, RunChannels};
use super::handshake;
use super::single;
use super::tunnel;

pub struct Client {
    endpoint: Arc<Endpoint>,
}

impl Client {
    pub async fn new(url: &Url) -> Result<Self> {
        let mut config = TunnelConfig::parse(url)?;
        if config.scheme != Scheme::Client {
            return Err(Error::Config(format!("not a client URL: {}", url)));
        }
        let cache = Arc::new(DnsCache::new(config.dns_ttl));
        config.resolve_addresses(&cache).await?;

        Ok(Self {
            endpoint: Endpoint::new(config, cache, 0, None),
        })
    }

    /// Run under supervision until SIGINT/SIGTERM.
    pub async fn run(&self) {
        supervise(Arc::clone(&self.endpoint), "Client", start).await;
    }
}

async fn start(endpoint: Arc<Endpoint>) -> Result<()> {
    let channels = endpoint.init_run();

    match endpoint.config.run_mode {
        1 => single_start(endpoint).await,
        2 => common_start(endpoint, channels).await,
        _ => match endpoint.init_tunnel_listener().await {
            Ok((tcp_listener, udp_socket)) => {
                endpoint.state.write().run_mode = 1;
                single::single_control(endpoint, tcp_listener, udp_socket).await
            }
            Err(_) => {
                endpoint.state.write().run_mode = 2;
                common_start(endpoint, channels).await
            }
        },
    }
}

async fn single_start(endpoint: Arc<Endpoint>) -> Result<()> {
    let (tcp_listener, udp_socket) = endpoint.init_tunnel_listener().await?;
    endpoint.state.write().run_mode = 1;
    single::single_control(endpoint, tcp_listener, udp_socket).await
}

async fn common_start(endpoint: Arc<Endpoint>, channels: RunChannels) -> Result<()> {
    info!("Pending tunnel handshake...");
    handshake::client_handshake(&endpoint).await?;

    let (tls_code, max_capacity, pool_type) = {
        let state = endpoint.state.read();
        (state.tls_code, state.max_pool_capacity, state.pool_type)
    };
    if pool_type != 0 {
        warn!("Pool type {} not built in, using TCP", pool_type);
    }

    // Each pool dial re-resolves the tunnel address through the cache, so a
    // moved DNS record heals without a restart.
    let dial: DialFn = {
        let cache = Arc::clone(&endpoint.cache);
        let dialer = Arc::clone(&endpoint.dialer);
        let tunnel_addr = endpoint.config.tunnel_addr.clone();
        Arc::new(move || {
            let cache = Arc::clone(&cache);
            let dialer = Arc::clone(&dialer);
            let tunnel_addr = tunnel_addr.clone();
            Box::pin(async move {
                let addr = cache.resolve_addr(&tunnel_addr).await?;
                dialer.dial_tcp(addr, *TCP_DIAL_TIMEOUT).await
            })
        })
    };

    let pool = TcpClientPool::new(
        endpoint.config.min_pool_capacity,
        max_capacity,
        *REPORT_INTERVAL,
        tls_code,
        endpoint.config.server_name.clone(),
        dial,
    );
    tokio::spawn(Arc::clone(&pool).client_manager());
    let pool: Arc<dyn TransportPool> = pool;
    endpoint.set_pool(Arc::clone(&pool));

    info!("Getting tunnel pool ready...");
    let reader = control::set_control_conn(&endpoint, &pool, channels.write_rx).await?;

    if endpoint.state.read().data_flow == '+' {
        let (tcp_listener, udp_socket) = endpoint.init_target_listener().await?;
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
