pub mod guardian;
pub mod poller;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 32-byte bridge emitter address, rendered as lowercase hex without `0x`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EmitterAddress([u8; 32]);

impl EmitterAddress {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for EmitterAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| anyhow::anyhow!("decode emitter hex: {e}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("emitter address must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for EmitterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for EmitterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EmitterAddress({self})")
    }
}

impl Serialize for EmitterAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EmitterAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Deterministic lookup key of one bridge message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttestationKey {
    pub emitter_chain: u16,
    pub emitter_address: EmitterAddress,
    pub sequence: u64,
}

impl fmt::Display for AttestationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.emitter_chain, self.emitter_address, self.sequence
        )
    }
}

/// A signed bridge message. `vaa` is kept exactly as the attestation network
/// delivered it; only the destination chain client interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub key: AttestationKey,
    pub vaa: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Ready(Attestation),
    NotYet,
}

/// Failure of a single poll.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("transient attestation error: {0:#}")]
    Transient(anyhow::Error),
    #[error("malformed attestation response: {0}")]
    Malformed(String),
}

/// One request against the attestation network, no retries.
#[async_trait]
pub trait AttestationApi: Send + Sync {
    async fn poll(&self, key: &AttestationKey) -> Result<PollOutcome, PollError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    #[error("attestation {key} not available after {waited:?}")]
    Timeout { key: AttestationKey, waited: Duration },
    #[error("attestation {key} unavailable after {consecutive} consecutive bad responses: {last}")]
    Unavailable {
        key: AttestationKey,
        consecutive: u32,
        last: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitter_parses_with_or_without_prefix() {
        let hex64 = "00000000000000000000000000000000000000000000000000000000000000ec";
        let a: EmitterAddress = hex64.parse().unwrap();
        let b: EmitterAddress = format!("0x{hex64}").parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), hex64);
        assert!("abcd".parse::<EmitterAddress>().is_err());
        assert!("zz".parse::<EmitterAddress>().is_err());
    }

    #[test]
    fn key_renders_as_vaa_id() {
        let key = AttestationKey {
            emitter_chain: 2,
            emitter_address: EmitterAddress::from_bytes([0xab; 32]),
            sequence: 42,
        };
        assert_eq!(key.to_string(), format!("2/{}/42", "ab".repeat(32)));
    }
}
