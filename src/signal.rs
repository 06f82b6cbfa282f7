//! Control-channel signal protocol
//!
//! A signal is a small JSON object XOR-obfuscated with the tunnel key,
//! base64-encoded, and newline-terminated. Decoding is symmetric; field
//! order is irrelevant.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::crypto::xor_with_key;
use crate::error::{Error, Result};

pub const ACTION_TCP: &str = "tcp";
pub const ACTION_UDP: &str = "udp";
pub const ACTION_VERIFY: &str = "verify";
pub const ACTION_FLUSH: &str = "flush";
pub const ACTION_PING: &str = "ping";
pub const ACTION_PONG: &str = "pong";

/// One control-channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "action")]
    pub action: String,

    #[serde(rename = "remote", default, skip_serializing_if = "String::is_empty")]
    pub remote: String,

    #[serde(rename = "id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(rename = "fp", default, skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
}

impl Signal {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            remote: String::new(),
            id: String::new(),
            fingerprint: String::new(),
        }
    }

    /// A `tcp`/`udp` launch signal pairing a pool connection with the flow
    /// source address.
    pub fn launch(action: &str, id: &str, remote: &str) -> Self {
        Self {
            action: action.to_string(),
            remote: remote.to_string(),
            id: id.to_string(),
            fingerprint: String::new(),
        }
    }

    pub fn verify(id: &str, fingerprint: &str) -> Self {
        Self {
            action: ACTION_VERIFY.to_string(),
            remote: String::new(),
            id: id.to_string(),
            fingerprint: fingerprint.to_string(),
        }
    }

    /// Whether the action is one the dispatcher understands; anything else
    /// is dropped on receipt.
    pub fn known_action(&self) -> bool {
        matches!(
            self.action.as_str(),
            ACTION_TCP | ACTION_UDP | ACTION_VERIFY | ACTION_FLUSH | ACTION_PING | ACTION_PONG
        )
    }
}

/// Obfuscate and frame one payload for the control connection.
pub fn encode(data: &[u8], key: &str) -> Vec<u8> {
    let mut obfuscated = data.to_vec();
    xor_with_key(&mut obfuscated, key.as_bytes());
    let mut line = BASE64.encode(&obfuscated).into_bytes();
    line.push(b'\n');
    line
}

/// Reverse of [`encode`]: strip the newline, base64-decode, un-XOR.
pub fn decode(line: &[u8], key: &str) -> Result<Vec<u8>> {
    let trimmed = match line.last() {
        Some(b'\n') => &line[..line.len() - 1],
        _ => line,
    };
    let mut data = BASE64
        .decode(trimmed)
        .map_err(|e| Error::Protocol(format!("base64 decode failed: {}", e)))?;
    xor_with_key(&mut data, key.as_bytes());
    Ok(data)
}

/// Serialize and frame a signal in one step.
pub fn encode_signal(signal: &Signal, key: &str) -> Vec<u8> {
    let json = serde_json::to_vec(signal).expect("signal serialization is infallible");
    encode(&json, key)
}

/// Decode one control line into a signal.
pub fn decode_signal(line: &[u8], key: &str) -> Result<Signal> {
    let data = decode(line, key)?;
    serde_json::from_slice(&data)
        .map_err(|e| Error::Protocol(format!("signal unmarshal failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_roundtrip() {
        let key = "tunnel-key";
        for signal in [
            Signal::new(ACTION_PING),
            Signal::new(ACTION_FLUSH),
            Signal::launch(ACTION_TCP, "a1b2c3d4", "10.0.0.1:54321"),
            Signal::launch(ACTION_UDP, "00ff00ff", "[::1]:9999"),
            Signal::verify("deadbeef", "sha256:0123"),
        ] {
            let line = encode_signal(&signal, key);
            assert_eq!(*line.last().unwrap(), b'\n');
            let decoded = decode_signal(&line, key).unwrap();
            assert_eq!(decoded, signal);
        }
    }

    #[test]
    fn test_roundtrip_with_derived_key() {
        // Keys are often FNV hex strings; any non-empty key must work.
        let signal = Signal::launch(ACTION_TCP, "01234567", "1.2.3.4:5");
        let line = encode_signal(&signal, "bfa81e26");
        assert_eq!(decode_signal(&line, "bfa81e26").unwrap(), signal);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"!!!not-base64!!!\n", "k").is_err());
        // Valid base64 of non-JSON bytes decodes but fails the signal parse.
        let line = encode(b"not json", "k");
        assert!(decode_signal(&line, "k").is_err());
    }

    #[test]
    fn test_wrong_key_fails_parse() {
        let line = encode_signal(&Signal::new(ACTION_PING), "key-one");
        assert!(decode_signal(&line, "key-two").is_err());
    }

    #[test]
    fn test_empty_fields_omitted() {
        let json = serde_json::to_string(&Signal::new(ACTION_PING)).unwrap();
        assert_eq!(json, r#"{"action":"ping"}"#);
    }

    #[test]
    fn test_known_actions() {
        for action in ["tcp", "udp", "verify", "flush", "ping", "pong"] {
            assert!(Signal::new(action).known_action());
        }
        assert!(!Signal::new("reboot").known_action());
    }
}
