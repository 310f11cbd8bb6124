//! Routing cookies.
//!
//! A cookie is an opaque, authenticated token naming the target device
//! and port. The server decodes it from the `auth` query parameter (or from
//! the `infos` message for desktop sessions); sessions encode a fresh one
//! for the relay hop.
//!
//! Token format: `hex([8-byte expiry][json route]) "." hex(HMAC-SHA256)`

use crate::error::{RelayError, RelayResult};
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Where a session should be routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    /// Requesting user.
    #[serde(rename = "userid")]
    pub user_id: String,
    /// Administrative domain, empty for the default domain.
    #[serde(rename = "domainid", default)]
    pub domain_id: String,
    /// Target device.
    #[serde(rename = "nodeid")]
    pub node_id: String,
    /// TCP port on the device.
    #[serde(rename = "tcpport")]
    pub tcp_port: u16,
    /// Route through the device's local relay instead of the mesh relay.
    #[serde(rename = "lc", default)]
    pub local: bool,
    /// User groups the requesting user belongs to; audit events are also
    /// addressed to each of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// Encodes and decodes routing cookies.
pub trait CookieCodec: Send + Sync {
    fn encode(&self, route: &RouteInfo) -> RelayResult<String>;

    /// Decode and authenticate a token. `None` when it is malformed,
    /// forged, or expired.
    fn decode(&self, token: &str) -> Option<RouteInfo>;
}

/// HMAC-SHA256 signed cookies with an expiry.
pub struct HmacCookieCodec {
    key: hmac::Key,
    ttl_secs: u64,
}

impl HmacCookieCodec {
    pub fn new(secret: &[u8], ttl_secs: u64) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            ttl_secs,
        }
    }

    fn encode_with_expiry(&self, route: &RouteInfo, expiry: u64) -> RelayResult<String> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&expiry.to_be_bytes());
        payload.extend_from_slice(&serde_json::to_vec(route)?);
        let tag = hmac::sign(&self.key, &payload);
        Ok(format!("{}.{}", hex::encode(&payload), hex::encode(tag.as_ref())))
    }
}

impl CookieCodec for HmacCookieCodec {
    fn encode(&self, route: &RouteInfo) -> RelayResult<String> {
        self.encode_with_expiry(route, unix_now().saturating_add(self.ttl_secs))
    }

    fn decode(&self, token: &str) -> Option<RouteInfo> {
        let (payload_hex, tag_hex) = token.split_once('.')?;
        let payload = hex::decode(payload_hex).ok()?;
        let tag = hex::decode(tag_hex).ok()?;
        hmac::verify(&self.key, &payload, &tag).ok()?;
        if payload.len() < 8 {
            return None;
        }
        let (expiry, body) = payload.split_at(8);
        let mut expiry_bytes = [0u8; 8];
        expiry_bytes.copy_from_slice(expiry);
        if unix_now() > u64::from_be_bytes(expiry_bytes) {
            return None;
        }
        serde_json::from_slice(body).ok()
    }
}

/// Generate a random 32-byte cookie secret.
pub fn generate_secret() -> RelayResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| RelayError::Cookie("system RNG unavailable".into()))?;
    Ok(secret)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> RouteInfo {
        RouteInfo {
            user_id: "user//admin".into(),
            domain_id: String::new(),
            node_id: "node//abc".into(),
            tcp_port: 22,
            local: false,
            groups: vec!["ugrp//ops".into()],
        }
    }

    #[test]
    fn encode_and_decode() {
        let codec = HmacCookieCodec::new(&generate_secret().unwrap(), 3600);
        let token = codec.encode(&route()).unwrap();
        assert_eq!(codec.decode(&token), Some(route()));
    }

    #[test]
    fn wrong_secret_rejected() {
        let a = HmacCookieCodec::new(b"secret-a", 3600);
        let b = HmacCookieCodec::new(b"secret-b", 3600);
        let token = a.encode(&route()).unwrap();
        assert!(b.decode(&token).is_none());
    }

    #[test]
    fn tampered_payload_rejected() {
        let codec = HmacCookieCodec::new(b"secret", 3600);
        let token = codec.encode(&route()).unwrap();
        let mut chars: Vec<char> = token.chars().collect();
        chars[20] = if chars[20] == '0' { '1' } else { '0' };
        let tampered: String = chars.into_iter().collect();
        assert!(codec.decode(&tampered).is_none());
    }

    #[test]
    fn expired_rejected() {
        let codec = HmacCookieCodec::new(b"secret", 3600);
        let token = codec.encode_with_expiry(&route(), 1).unwrap();
        assert!(codec.decode(&token).is_none());
    }

    #[test]
    fn garbage_rejected() {
        let codec = HmacCookieCodec::new(b"secret", 3600);
        assert!(codec.decode("").is_none());
        assert!(codec.decode("zz.zz").is_none());
        assert!(codec.decode("00").is_none());
    }

    #[test]
    fn groups_are_optional() {
        let route: RouteInfo =
            serde_json::from_str(r#"{"userid":"user//a","nodeid":"node//b","tcpport":22}"#).unwrap();
        assert!(route.groups.is_empty());
        assert!(!route.local);
    }
}
