//! NodePass - Universal TCP/UDP tunneling

use tracing_subscriber::EnvFilter;
use url::Url;

use nodepass::config::normalize_url;
use nodepass::error::{Error, Result};
use nodepass::{Client, Server};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = run(args) {
        exit(e);
    }
}

fn run(args: Vec<String>) -> Result<()> {
    let url = CommandLine::new(args).parse()?;

    let log_level = url
        .query_pairs()
        .find(|(key, _)| key == "log")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| "info".to_string());
    init_logging(&log_level);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match url.scheme() {
            "server" => {
                let server = Server::new(&url).await?;
                server.run().await;
                Ok(())
            }
            "client" => {
                let client = Client::new(&url).await?;
                client.run().await;
                Ok(())
            }
            "master" => Err(Error::Config(
                "master scheme is handled by the orchestrator, not the tunnel binary".into(),
            )),
            other => Err(Error::Config(format!("unknown core: {}", other))),
        }
    })
}

/// Map the `log` option onto a tracing filter. The telemetry line is tagged
/// with the `event` target so it survives every level except `none`.
fn init_logging(level: &str) {
    let directive = match level {
        "none" => "off",
        "debug" => "debug",
        "warn" => "warn,event=info",
        "error" => "error,event=info",
        "event" => "off,event=info",
        _ => "info",
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");

    match level {
        "debug" => tracing::debug!("Init log level: DEBUG"),
        "warn" => tracing::warn!("Init log level: WARN"),
        "error" => tracing::error!("Init log level: ERROR"),
        _ => {}
    }
}

fn exit(err: Error) -> ! {
    eprintln!(
        "nodepass-{} {}/{} pid={} error={}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
        std::process::id(),
        err
    );
    eprintln!("\nrun 'nodepass --help' for usage");
    std::process::exit(1);
}

/// Command line arguments: either a full configuration URL or a subcommand
/// with flags that assemble one.
struct CommandLine {
    args: Vec<String>,
}

impl CommandLine {
    fn new(args: Vec<String>) -> Self {
        Self { args }
    }

    fn parse(&self) -> Result<Url> {
        if self.args.len() == 2 && self.args[1].contains("://") {
            return parse_url(&self.args[1]);
        }
        if self.args.len() < 2 {
            return Err(Error::Config(
                "usage: nodepass <command> [options] or nodepass <url>".into(),
            ));
        }

        let command = self.args[1].as_str();
        let flag_args = &self.args[2..];
        match command {
            "server" | "client" | "master" => build_url(command, flag_args),
            "help" | "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "version" | "-v" | "--version" => {
                println!(
                    "nodepass-{} {}/{}",
                    env!("CARGO_PKG_VERSION"),
                    std::env::consts::OS,
                    std::env::consts::ARCH
                );
                std::process::exit(0);
            }
            _ => {
                let joined = self.args[1..].join(" ");
                if joined.contains("://") {
                    return parse_url(&joined);
                }
                Err(Error::Config(format!("unknown command: {}", command)))
            }
        }
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(&normalize_url(raw)).map_err(|e| Error::Config(format!("invalid URL: {}", e)))
}

/// Assemble the configuration URL from `--flag value` pairs.
fn build_url(scheme: &str, flag_args: &[String]) -> Result<Url> {
    let mut flags = std::collections::HashMap::new();
    let mut i = 0;
    while i < flag_args.len() {
        let name = flag_args[i]
            .strip_prefix("--")
            .or_else(|| flag_args[i].strip_prefix('-'))
            .ok_or_else(|| Error::Config(format!("unexpected argument: {}", flag_args[i])))?;
        let value = flag_args
            .get(i + 1)
            .ok_or_else(|| Error::Config(format!("flag --{} needs a value", name)))?;
        flags.insert(name.to_string(), value.clone());
        i += 2;
    }
    let flag = |name: &str| flags.get(name).filter(|v| !v.is_empty());

    let mut authority = String::new();
    if let Some(password) = flag("password") {
        authority.push_str(password);
        authority.push('@');
    }
    authority.push_str(flag("tunnel-addr").map(String::as_str).unwrap_or(""));
    if let Some(port) = flag("tunnel-port") {
        authority.push(':');
        authority.push_str(port);
    }

    let path = if let Some(targets) = flag("targets") {
        format!("/{}", targets)
    } else {
        let addr = flag("target-addr").map(String::as_str).unwrap_or("");
        match flag("target-port") {
            Some(port) => format!("/{}:{}", addr, port),
            None if !addr.is_empty() => format!("/{}", addr),
            None => "/".to_string(),
        }
    };

    let mut query = Vec::new();
    for key in [
        "log", "dns", "sni", "lbs", "min", "max", "mode", "type", "tls", "crt", "key", "dial",
        "read", "rate", "slot", "proxy", "block", "notcp", "noudp",
    ] {
        if key == "crt" || key == "key" {
            // Cert paths only make sense in file mode.
            if flag("tls").map(String::as_str) != Some("2") {
                continue;
            }
        }
        if let Some(value) = flag(key) {
            query.push(format!("{}={}", key, value));
        }
    }
    let query = if query.is_empty() {
        String::new()
    } else {
        format!("?{}", query.join("&"))
    };

    parse_url(&format!("{}://{}{}{}", scheme, authority, path, query))
}

fn print_help() {
    println!(
        r#"NodePass - Universal TCP/UDP Tunneling Solution

Usage:
  nodepass <command> [options]
  nodepass <url>

Commands:
  server     Start a NodePass server
  client     Start a NodePass client
  master     Start a NodePass master
  help       Show this help message
  version    Show version information

URL form:
  <server|client|master>://[password@]host:port/target1[,target2,...][?k=v...]

Common options (flag or query form):
  --log      Log level (none|debug|info|warn|error|event)
  --dns      DNS cache TTL (e.g. 5m)
  --sni      SNI hostname
  --lbs      Load balancing strategy (0|1|2)
  --min      Minimum pool size        --max    Maximum pool size
  --mode     Run mode (0|1|2)         --type   Pool type (0|1|2|3)
  --tls      TLS mode (0|1|2)         --crt    Certificate file (tls=2)
  --key      Key file (tls=2)         --dial   Outbound source IP
  --read     Read timeout             --rate   Bandwidth limit in Mbps
  --slot     Connection slot limit    --proxy  PROXY protocol v1 (0|1)
  --block    Block protocols (1=SOCKS 2=HTTP 3=TLS)
  --notcp    Disable TCP              --noudp  Disable UDP
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_from_flags() {
        let args: Vec<String> = [
            "--password", "k", "--tunnel-addr", "0.0.0.0", "--tunnel-port", "5000",
            "--target-addr", "127.0.0.1", "--target-port", "9000", "--mode", "2",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let url = build_url("server", &args).unwrap();
        assert_eq!(url.scheme(), "server");
        assert_eq!(url.username(), "k");
        assert_eq!(url.port(), Some(5000));
        assert_eq!(url.path(), "/127.0.0.1:9000");
        assert!(url.query().unwrap().contains("mode=2"));
    }

    #[test]
    fn test_build_url_multiple_targets() {
        let args: Vec<String> = [
            "--tunnel-port", "4321", "--targets", "127.0.0.1:9001,127.0.0.1:9002",
            "--mode", "1", "--lbs", "0",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let url = build_url("client", &args).unwrap();
        assert_eq!(url.path(), "/127.0.0.1:9001,127.0.0.1:9002");
        assert_eq!(url.host_str(), Some("0.0.0.0"));
    }

    #[test]
    fn test_cert_flags_require_file_mode() {
        let args: Vec<String> = [
            "--tunnel-port", "5000", "--target-port", "9000", "--tls", "1",
            "--crt", "/tmp/a.pem", "--key", "/tmp/a.key",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let url = build_url("server", &args).unwrap();
        assert!(!url.query().unwrap_or("").contains("crt="));

        let args: Vec<String> = [
            "--tunnel-port", "5000", "--target-port", "9000", "--tls", "2",
            "--crt", "/tmp/a.pem", "--key", "/tmp/a.key",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let url = build_url("server", &args).unwrap();
        let crt = url
            .query_pairs()
            .find(|(key, _)| key == "crt")
            .map(|(_, value)| value.into_owned());
        assert_eq!(crt.as_deref(), Some("/tmp/a.pem"));
    }

    #[test]
    fn test_direct_url_form() {
        let line = CommandLine::new(vec![
            "nodepass".to_string(),
            "client://k@1.2.3.4:5000/5.6.7.8:9000?mode=1".to_string(),
        ]);
        let url = line.parse().unwrap();
        assert_eq!(url.scheme(), "client");
        assert_eq!(url.port(), Some(5000));
    }
}
