//! Crypto primitives and TLS configuration
//!
//! The tunnel key drives three things: the cyclic XOR obfuscation of control
//! signals, the HMAC-SHA256 bearer token exchanged during the handshake, and
//! the Basic pre-auth check. TLS identities come in three modes: 0 none,
//! 1 self-signed RAM cert, 2 certificate files with periodic reload.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Instant;

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio_rustls::rustls::{
    self,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    ClientConfig, ServerConfig,
};
use tracing::{debug, error, info, warn};

use crate::config::{TunnelConfig, RELOAD_INTERVAL};
use crate::error::{Error, Result};

/// Cyclic XOR with the tunnel key. Applying it twice restores the input.
pub fn xor_with_key(data: &mut [u8], key: &[u8]) {
    if key.is_empty() {
        return;
    }
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % key.len()];
    }
}

pub fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

type HmacSha256 = Hmac<Sha256>;

/// Bearer token for the handshake: lower-case hex of HMAC-SHA256 over the
/// empty message, keyed by the tunnel key.
pub fn generate_auth_token(key: &str) -> String {
    let mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    hex_lower(&mac.finalize().into_bytes())
}

pub fn verify_auth_token(token: &str, key: &str) -> bool {
    let expected = generate_auth_token(key);
    // Constant-time comparison over same-length hex strings.
    if token.len() != expected.len() {
        return false;
    }
    token
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// `sha256:<hex>` over the raw DER certificate.
pub fn format_cert_fingerprint(cert_der: &[u8]) -> String {
    let hash = Sha256::digest(cert_der);
    format!("sha256:{}", hex_lower(&hash))
}

/// A server-side TLS identity: the rustls config plus the leaf certificate
/// bytes used for fingerprint verification.
#[derive(Clone)]
pub struct TlsIdentity {
    pub config: Arc<ServerConfig>,
    pub cert_der: Vec<u8>,
}

impl TlsIdentity {
    pub fn fingerprint(&self) -> String {
        format_cert_fingerprint(&self.cert_der)
    }
}

/// Generate a fresh self-signed RAM certificate, TLS 1.3 only.
pub fn new_ram_identity() -> Result<TlsIdentity> {
    let certified = rcgen::generate_simple_self_signed(vec!["nodepass".to_string()])
        .map_err(|e| Error::Tls(format!("RAM cert generation failed: {}", e)))?;
    let cert_der: CertificateDer<'static> = certified.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));

    let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .map_err(|e| Error::Tls(format!("RAM cert config failed: {}", e)))?;

    Ok(TlsIdentity {
        config: Arc::new(config),
        cert_der: cert_der.to_vec(),
    })
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("failed to open certificate file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse certificates: {}", e)))
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("failed to open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    for item in rustls_pemfile::read_all(&mut reader) {
        match item.map_err(|e| Error::Tls(format!("failed to parse private key: {}", e)))? {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }
    Err(Error::Tls("no valid private key found in file".into()))
}

fn load_certified_key(crt_path: &str, key_path: &str) -> Result<Arc<rustls::sign::CertifiedKey>> {
    let certs = load_certs(crt_path)?;
    let key = load_private_key(key_path)?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| Error::Tls(format!("unsupported private key: {}", e)))?;
    Ok(Arc::new(rustls::sign::CertifiedKey::new(certs, signing_key)))
}

/// Certificate resolver for file mode: re-reads the pair at most once per
/// reload interval, keeping the cached pair when a reload fails.
struct ReloadingCertResolver {
    crt_path: String,
    key_path: String,
    cached: RwLock<(Arc<rustls::sign::CertifiedKey>, Instant)>,
}

impl fmt::Debug for ReloadingCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReloadingCertResolver({})", self.crt_path)
    }
}

impl rustls::server::ResolvesServerCert for ReloadingCertResolver {
    fn resolve(
        &self,
        _client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        {
            let cached = self.cached.read();
            if cached.1.elapsed() < *RELOAD_INTERVAL {
                return Some(cached.0.clone());
            }
        }

        let mut cached = self.cached.write();
        if cached.1.elapsed() >= *RELOAD_INTERVAL {
            match load_certified_key(&self.crt_path, &self.key_path) {
                Ok(key) => {
                    debug!("TLS cert reloaded: {}", self.crt_path);
                    cached.0 = key;
                }
                Err(e) => error!("Certificate reload failed: {}", e),
            }
            cached.1 = Instant::now();
        }
        Some(cached.0.clone())
    }
}

/// Resolve the server-side TLS protocol from the `tls`/`crt`/`key` options.
/// Returns the effective TLS code and the identity (None for code 0).
pub fn resolve_tls(config: &TunnelConfig) -> (u8, Option<TlsIdentity>) {
    let ram = match new_ram_identity() {
        Ok(identity) => identity,
        Err(e) => {
            error!("Generate TLS config failed: {}", e);
            warn!("TLS code-0: nil cert");
            return (0, None);
        }
    };

    match config.tls_mode {
        1 => {
            info!("TLS code-1: RAM cert with TLS 1.3");
            (1, Some(ram))
        }
        2 => {
            let (crt_path, key_path) = match (&config.crt_path, &config.key_path) {
                (Some(crt), Some(key)) => (crt.clone(), key.clone()),
                _ => {
                    error!("Certificate load failed: crt/key path missing");
                    warn!("TLS code-1: RAM cert with TLS 1.3");
                    return (1, Some(ram));
                }
            };
            match load_certified_key(&crt_path, &key_path) {
                Ok(certified) => {
                    let cert_der = certified
                        .cert
                        .first()
                        .map(|c| c.to_vec())
                        .unwrap_or_default();
                    let resolver = ReloadingCertResolver {
                        crt_path: crt_path.clone(),
                        key_path,
                        cached: RwLock::new((certified, Instant::now())),
                    };
                    let server_config =
                        ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
                            .with_no_client_auth()
                            .with_cert_resolver(Arc::new(resolver));
                    info!("TLS code-2: {} with TLS 1.3", crt_path);
                    (
                        2,
                        Some(TlsIdentity {
                            config: Arc::new(server_config),
                            cert_der,
                        }),
                    )
                }
                Err(e) => {
                    error!("Certificate load failed: {}", e);
                    warn!("TLS code-1: RAM cert with TLS 1.3");
                    (1, Some(ram))
                }
            }
        }
        _ => {
            // Stream pool transports always ride on TLS.
            if config.pool_type == 1 || config.pool_type == 3 {
                info!("TLS code-1: RAM cert with TLS 1.3 for stream pool");
                (1, Some(ram))
            } else {
                warn!("TLS code-0: unencrypted");
                (0, None)
            }
        }
    }
}

/// Client-side TLS config: TLS 1.3, certificate checks disabled. Trust is
/// established by the fingerprint verify signal, not WebPKI.
pub fn insecure_client_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth();
    Arc::new(config)
}

/// Pick the SNI name for an outbound TLS connection: the configured `sni`
/// value when usable, else the tunnel host, else a harmless constant.
pub fn sni_server_name(preferred: &str, fallback_host: &str) -> ServerName<'static> {
    if preferred != "none" {
        if let Ok(name) = ServerName::try_from(preferred.to_string()) {
            return name;
        }
    }
    let host = fallback_host
        .rsplit_once(':')
        .map(|(h, _)| h)
        .unwrap_or(fallback_host);
    ServerName::try_from(host.to_string())
        .unwrap_or_else(|_| ServerName::try_from("localhost".to_string()).expect("valid name"))
}

/// Accepts any server certificate; fingerprints are verified out of band.
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_involution() {
        let key = b"secret-key";
        let original = b"The quick brown fox jumps over the lazy dog".to_vec();
        let mut data = original.clone();
        xor_with_key(&mut data, key);
        assert_ne!(data, original);
        xor_with_key(&mut data, key);
        assert_eq!(data, original);
    }

    #[test]
    fn test_xor_empty_key_is_identity() {
        let mut data = b"payload".to_vec();
        xor_with_key(&mut data, b"");
        assert_eq!(data, b"payload");
    }

    #[test]
    fn test_auth_token_roundtrip() {
        let token = generate_auth_token("k");
        assert_eq!(token, generate_auth_token("k"));
        assert_eq!(token.len(), 64);
        assert!(verify_auth_token(&token, "k"));

        // Any single-byte mutation must fail verification.
        let mut bytes = token.into_bytes();
        bytes[5] = if bytes[5] == b'a' { b'b' } else { b'a' };
        let mutated = String::from_utf8(bytes).unwrap();
        assert!(!verify_auth_token(&mutated, "k"));
        assert!(!verify_auth_token("", "k"));
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = format_cert_fingerprint(b"dummy-cert-bytes");
        assert!(fp.starts_with("sha256:"));
        assert_eq!(fp.len(), "sha256:".len() + 64);
        assert_eq!(fp, format_cert_fingerprint(b"dummy-cert-bytes"));
    }

    #[test]
    fn test_ram_identity() {
        let identity = new_ram_identity().unwrap();
        assert!(!identity.cert_der.is_empty());
        let fp = identity.fingerprint();
        assert!(fp.starts_with("sha256:"));
        // A second identity must not share the fingerprint.
        let other = new_ram_identity().unwrap();
        assert_ne!(fp, other.fingerprint());
    }
}
