//! Configuration for NodePass
//!
//! Two layers live here: process-wide tuning knobs drawn from `NP_*`
//! environment variables once at startup, and the tunnel configuration
//! resolved from the command URL
//! (`scheme://password@host:port/target1,target2?k=v`).

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use lazy_static::lazy_static;
use url::Url;

use crate::dns::DnsCache;
use crate::error::{Error, Result};

pub const CONTEXT_CHECK_INTERVAL: Duration = Duration::from_millis(50);

pub const DEFAULT_DNS_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MIN_POOL: usize = 64;
pub const DEFAULT_MAX_POOL: usize = 1024;
pub const DEFAULT_SERVER_NAME: &str = "none";
pub const DEFAULT_SLOT_LIMIT: i32 = 65536;

/// Flow id reserved for the control connection.
pub const CONTROL_CONN_ID: &str = "00000000";

lazy_static! {
    pub static ref SEMAPHORE_LIMIT: usize = env_as_usize("NP_SEMAPHORE_LIMIT", 65536);
    pub static ref TCP_DATA_BUF_SIZE: usize = env_as_usize("NP_TCP_DATA_BUF_SIZE", 16384);
    pub static ref UDP_DATA_BUF_SIZE: usize = env_as_usize("NP_UDP_DATA_BUF_SIZE", 16384);
    pub static ref HANDSHAKE_TIMEOUT: Duration =
        env_as_duration("NP_HANDSHAKE_TIMEOUT", Duration::from_secs(5));
    pub static ref TCP_DIAL_TIMEOUT: Duration =
        env_as_duration("NP_TCP_DIAL_TIMEOUT", Duration::from_secs(5));
    pub static ref UDP_DIAL_TIMEOUT: Duration =
        env_as_duration("NP_UDP_DIAL_TIMEOUT", Duration::from_secs(5));
    pub static ref UDP_READ_TIMEOUT: Duration =
        env_as_duration("NP_UDP_READ_TIMEOUT", Duration::from_secs(30));
    pub static ref POOL_GET_TIMEOUT: Duration =
        env_as_duration("NP_POOL_GET_TIMEOUT", Duration::from_secs(5));
    pub static ref MIN_POOL_INTERVAL: Duration =
        env_as_duration("NP_MIN_POOL_INTERVAL", Duration::from_millis(100));
    pub static ref MAX_POOL_INTERVAL: Duration =
        env_as_duration("NP_MAX_POOL_INTERVAL", Duration::from_secs(1));
    pub static ref REPORT_INTERVAL: Duration =
        env_as_duration("NP_REPORT_INTERVAL", Duration::from_secs(5));
    pub static ref FALLBACK_INTERVAL: Duration =
        env_as_duration("NP_FALLBACK_INTERVAL", Duration::from_secs(300));
    pub static ref SERVICE_COOLDOWN: Duration =
        env_as_duration("NP_SERVICE_COOLDOWN", Duration::from_secs(3));
    pub static ref SHUTDOWN_TIMEOUT: Duration =
        env_as_duration("NP_SHUTDOWN_TIMEOUT", Duration::from_secs(5));
    pub static ref RELOAD_INTERVAL: Duration =
        env_as_duration("NP_RELOAD_INTERVAL", Duration::from_secs(3600));
}

fn env_as_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_as_duration(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_duration(&v))
        .unwrap_or(default)
}

/// Parse a Go-style duration string (`100ms`, `5s`, `1h30m`).
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let bytes = s.as_bytes();
    let mut i = 0;
    let mut total = Duration::ZERO;
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        if i == start {
            return None;
        }
        let num: f64 = s[start..i].parse().ok()?;

        let unit_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_digit() {
            i += 1;
        }
        let secs = match &s[unit_start..i] {
            "ns" => num / 1e9,
            "us" | "µs" => num / 1e6,
            "ms" => num / 1e3,
            "s" => num,
            "m" => num * 60.0,
            "h" => num * 3600.0,
            _ => return None,
        };
        total += Duration::from_secs_f64(secs);
    }
    Some(total)
}

/// FNV-1a 32-bit hash, used to derive the tunnel key from the port when no
/// password is given. Both ends must compute the same value.
fn fnv32a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

/// Endpoint role taken from the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Server,
    Client,
    Master,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Server => "server",
            Scheme::Client => "client",
            Scheme::Master => "master",
        }
    }
}

/// Resolved tunnel configuration.
///
/// Built in two steps: [`TunnelConfig::parse`] reads the URL without touching
/// the network, then [`TunnelConfig::resolve_addresses`] turns the tunnel and
/// target addresses into socket addresses through the DNS cache.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub scheme: Scheme,
    pub tunnel_addr: String,
    pub server_name: String,
    pub server_port: String,
    pub tunnel_key: String,
    pub tunnel_tcp_addr: Option<SocketAddr>,
    pub tunnel_udp_addr: Option<SocketAddr>,
    pub target_addrs: Vec<String>,
    pub target_tcp_addrs: Vec<SocketAddr>,
    pub target_udp_addrs: Vec<SocketAddr>,
    pub log_level: String,
    pub dns_ttl: Duration,
    pub lb_strategy: u8,
    pub min_pool_capacity: usize,
    pub max_pool_capacity: usize,
    pub run_mode: u8,
    pub pool_type: u8,
    pub dialer_ip: Option<IpAddr>,
    pub read_timeout: Duration,
    pub rate_limit: u64,
    pub slot_limit: i32,
    pub proxy_protocol: bool,
    pub block_socks: bool,
    pub block_http: bool,
    pub block_tls: bool,
    pub disable_tcp: bool,
    pub disable_udp: bool,
    pub tls_mode: u8,
    pub crt_path: Option<String>,
    pub key_path: Option<String>,
}

impl TunnelConfig {
    /// Parse the command URL into typed settings. Unknown query keys are
    /// ignored; invalid values fall back to their defaults.
    pub fn parse(url: &Url) -> Result<Self> {
        let scheme = match url.scheme() {
            "server" => Scheme::Server,
            "client" => Scheme::Client,
            "master" => Scheme::Master,
            other => return Err(Error::Config(format!("unknown scheme: {}", other))),
        };

        let host = url.host_str().unwrap_or("").to_string();
        let port = url
            .port()
            .ok_or_else(|| Error::Config("no valid tunnel address found".into()))?;
        let tunnel_addr = format!("{}:{}", host, port);
        let server_port = port.to_string();

        let tunnel_key = {
            let user = url.username();
            if !user.is_empty() {
                user.to_string()
            } else {
                format!("{:08x}", fnv32a(server_port.as_bytes()))
            }
        };

        let target_path = url.path().trim_start_matches('/');
        let target_addrs: Vec<String> = target_path
            .split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if target_addrs.is_empty() && scheme != Scheme::Master {
            return Err(Error::Config("no valid target address found".into()));
        }

        let query: std::collections::HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let opt = |key: &str| query.get(key).map(|s| s.as_str());

        let server_name = match opt("sni") {
            Some(sni) if !sni.is_empty() => sni.to_string(),
            _ => {
                if host.is_empty() || host.parse::<IpAddr>().is_ok() {
                    DEFAULT_SERVER_NAME.to_string()
                } else {
                    host.clone()
                }
            }
        };

        let dns_ttl = opt("dns")
            .and_then(parse_duration)
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_DNS_TTL);

        let lb_strategy = opt("lbs").and_then(|v| v.parse().ok()).unwrap_or(0);
        let min_pool_capacity = opt("min")
            .and_then(|v| v.parse().ok())
            .filter(|&v: &usize| v > 0)
            .unwrap_or(DEFAULT_MIN_POOL);
        let max_pool_capacity = opt("max")
            .and_then(|v| v.parse().ok())
            .filter(|&v: &usize| v > 0)
            .unwrap_or(DEFAULT_MAX_POOL);
        let run_mode = opt("mode").and_then(|v| v.parse().ok()).unwrap_or(0);
        let pool_type = opt("type").and_then(|v| v.parse().ok()).unwrap_or(0);

        let dialer_ip = match opt("dial") {
            Some(dial) if !dial.is_empty() && dial != "auto" => match dial.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    tracing::error!("Invalid dial IP address, fallback to system auto: {}", dial);
                    None
                }
            },
            _ => None,
        };

        let read_timeout = opt("read").and_then(parse_duration).unwrap_or(Duration::ZERO);
        let rate_limit = opt("rate")
            .and_then(|v| v.parse::<u64>().ok())
            .map(|mbps| mbps * 125_000)
            .unwrap_or(0);
        let slot_limit = opt("slot")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SLOT_LIMIT);

        let block = opt("block").unwrap_or("0");
        let tls_mode = opt("tls").and_then(|v| v.parse().ok()).unwrap_or(0);

        Ok(TunnelConfig {
            scheme,
            tunnel_addr,
            server_name,
            server_port,
            tunnel_key,
            tunnel_tcp_addr: None,
            tunnel_udp_addr: None,
            target_addrs,
            target_tcp_addrs: Vec::new(),
            target_udp_addrs: Vec::new(),
            log_level: opt("log").unwrap_or("info").to_string(),
            dns_ttl,
            lb_strategy,
            min_pool_capacity,
            max_pool_capacity,
            run_mode,
            pool_type,
            dialer_ip,
            read_timeout,
            rate_limit,
            slot_limit,
            proxy_protocol: opt("proxy") == Some("1"),
            block_socks: block.contains('1'),
            block_http: block.contains('2'),
            block_tls: block.contains('3'),
            disable_tcp: opt("notcp") == Some("1"),
            disable_udp: opt("noudp") == Some("1"),
            tls_mode,
            crt_path: opt("crt").map(String::from),
            key_path: opt("key").map(String::from),
        })
    }

    /// Resolve the tunnel and target addresses, then validate the tunnel
    /// port against every target per the conflict rule.
    pub async fn resolve_addresses(&mut self, cache: &DnsCache) -> Result<()> {
        let tunnel_addr = cache.resolve_addr(&self.tunnel_addr).await?;
        self.tunnel_tcp_addr = Some(tunnel_addr);
        self.tunnel_udp_addr = Some(tunnel_addr);

        let mut tcp_addrs = Vec::with_capacity(self.target_addrs.len());
        let mut udp_addrs = Vec::with_capacity(self.target_addrs.len());
        for addr in &self.target_addrs {
            let resolved = cache
                .resolve_addr(addr)
                .await
                .map_err(|e| Error::Config(format!("target {} did not resolve: {}", addr, e)))?;
            tcp_addrs.push(resolved);
            udp_addrs.push(resolved);
        }
        if tcp_addrs.is_empty() && self.scheme != Scheme::Master {
            return Err(Error::Config("no valid target address found".into()));
        }
        self.target_tcp_addrs = tcp_addrs;
        self.target_udp_addrs = udp_addrs;

        let tunnel_port = tunnel_addr.port();
        for target in &self.target_tcp_addrs {
            if target.port() == tunnel_port
                && (target.ip().is_loopback() || tunnel_addr.ip().is_unspecified())
            {
                return Err(Error::PortConflict(tunnel_port, target.to_string()));
            }
        }
        Ok(())
    }

    /// Comma-joined resolved target list, as logged in the startup banner.
    pub fn target_addrs_string(&self) -> String {
        self.target_tcp_addrs
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Effective configuration echoed back as a URL on start and restart.
    pub fn banner(&self) -> String {
        format!(
            "{}://{}@{}/{}?dns={:?}&lbs={}&min={}&max={}&mode={}&type={}&dial={}&read={:?}&rate={}&slot={}&proxy={}&block={}{}{}&notcp={}&noudp={}",
            self.scheme.as_str(),
            self.tunnel_key,
            self.tunnel_tcp_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| self.tunnel_addr.clone()),
            self.target_addrs_string(),
            self.dns_ttl,
            self.lb_strategy,
            self.min_pool_capacity,
            self.max_pool_capacity,
            self.run_mode,
            self.pool_type,
            self.dialer_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "auto".into()),
            self.read_timeout,
            self.rate_limit / 125_000,
            self.slot_limit,
            if self.proxy_protocol { 1 } else { 0 },
            if self.block_socks { "1" } else { "" },
            if self.block_http { "2" } else { "" },
            if self.block_tls { "3" } else { "" },
            if self.disable_tcp { 1 } else { 0 },
            if self.disable_udp { 1 } else { 0 },
        )
    }
}

/// Normalize shorthand authority forms (`server://:5000/...`) the original
/// accepted: an empty bind host means all interfaces.
pub fn normalize_url(raw: &str) -> String {
    if let Some(idx) = raw.find("://") {
        let (scheme, rest) = raw.split_at(idx + 3);
        let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);
        let fixed = match authority.rfind('@') {
            Some(at) if authority[at + 1..].starts_with(':') => {
                format!("{}@0.0.0.0{}", &authority[..at], &authority[at + 1..])
            }
            None if authority.starts_with(':') => format!("0.0.0.0{}", authority),
            _ => authority.to_string(),
        };
        format!("{}{}{}", scheme, fixed, tail)
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> TunnelConfig {
        let url = Url::parse(&normalize_url(raw)).unwrap();
        TunnelConfig::parse(&url).unwrap()
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("100ms"), Some(Duration::from_millis(100)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("10"), None);
    }

    #[test]
    fn test_tunnel_key_from_password() {
        let config = parse("server://secret@127.0.0.1:10101/127.0.0.1:8080");
        assert_eq!(config.tunnel_key, "secret");
    }

    #[test]
    fn test_tunnel_key_from_port_hash() {
        let config = parse("server://127.0.0.1:10101/127.0.0.1:8080");
        // FNV-32a of the port string, lower-case hex, identical on both ends.
        assert_eq!(config.tunnel_key, format!("{:08x}", fnv32a(b"10101")));
        let again = parse("client://127.0.0.1:10101/127.0.0.1:8080");
        assert_eq!(config.tunnel_key, again.tunnel_key);
    }

    #[test]
    fn test_defaults() {
        let config = parse("client://k@1.2.3.4:5000/5.6.7.8:9000");
        assert_eq!(config.min_pool_capacity, DEFAULT_MIN_POOL);
        assert_eq!(config.max_pool_capacity, DEFAULT_MAX_POOL);
        assert_eq!(config.slot_limit, DEFAULT_SLOT_LIMIT);
        assert_eq!(config.dns_ttl, DEFAULT_DNS_TTL);
        assert_eq!(config.lb_strategy, 0);
        assert_eq!(config.run_mode, 0);
        assert_eq!(config.pool_type, 0);
        assert!(!config.proxy_protocol);
        assert!(config.dialer_ip.is_none());
        assert_eq!(config.read_timeout, Duration::ZERO);
        assert_eq!(config.rate_limit, 0);
    }

    #[test]
    fn test_block_flags() {
        let config = parse("client://k@1.2.3.4:5000/5.6.7.8:9000?block=13");
        assert!(config.block_socks);
        assert!(!config.block_http);
        assert!(config.block_tls);
    }

    #[test]
    fn test_rate_limit_scaling() {
        let config = parse("client://k@1.2.3.4:5000/5.6.7.8:9000?rate=10");
        assert_eq!(config.rate_limit, 1_250_000);
    }

    #[test]
    fn test_sni_from_host() {
        let config = parse("client://k@example.com:5000/5.6.7.8:9000");
        assert_eq!(config.server_name, "example.com");
        let config = parse("client://k@1.2.3.4:5000/5.6.7.8:9000");
        assert_eq!(config.server_name, DEFAULT_SERVER_NAME);
        let config = parse("client://k@1.2.3.4:5000/5.6.7.8:9000?sni=custom.host");
        assert_eq!(config.server_name, "custom.host");
    }

    #[test]
    fn test_missing_target_fails() {
        let url = Url::parse("server://k@1.2.3.4:5000/").unwrap();
        assert!(TunnelConfig::parse(&url).is_err());
        // Master has no target path requirement.
        let url = Url::parse("master://1.2.3.4:5000/").unwrap();
        assert!(TunnelConfig::parse(&url).is_ok());
    }

    #[test]
    fn test_normalize_unspecified_bind() {
        assert_eq!(
            normalize_url("server://:10101/127.0.0.1:8080"),
            "server://0.0.0.0:10101/127.0.0.1:8080"
        );
        assert_eq!(
            normalize_url("server://pass@:10101/a"),
            "server://pass@0.0.0.0:10101/a"
        );
        assert_eq!(
            normalize_url("client://k@1.2.3.4:5000/t"),
            "client://k@1.2.3.4:5000/t"
        );
    }

    #[tokio::test]
    async fn test_port_conflict() {
        let cache = DnsCache::new(DEFAULT_DNS_TTL);
        let mut config = parse("server://k@0.0.0.0:9000/127.0.0.1:9000");
        let err = config.resolve_addresses(&cache).await.unwrap_err();
        assert!(matches!(err, Error::PortConflict(9000, _)));

        // Different ports never conflict.
        let mut config = parse("server://k@0.0.0.0:9000/127.0.0.1:9001");
        config.resolve_addresses(&cache).await.unwrap();

        // Same port is fine when the target is remote and the bind is specific.
        let mut config = parse("server://k@127.0.0.1:9000/8.8.8.8:9000");
        config.resolve_addresses(&cache).await.unwrap();
    }
}
