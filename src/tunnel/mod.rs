//! Tunnel record bookkeeping
//!
//! The tunnel itself is created by the tunnel provider. This module holds the
//! identifiers the rest of the core needs, generates the tunnel secret and
//! renders the connector credentials file.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;

/// Length of a generated tunnel secret
pub const TUNNEL_SECRET_LEN: usize = 64;

/// Suffix of the CNAME target that routes a hostname into a tunnel
pub const TUNNEL_CNAME_SUFFIX: &str = "cfargotunnel.com";

/// Shared secret the tunnel connector authenticates with
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelSecret(String);

impl TunnelSecret {
    /// Generate a random alphanumeric secret
    pub fn generate() -> Self {
        let secret = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TUNNEL_SECRET_LEN)
            .map(char::from)
            .collect();
        Self(secret)
    }

    /// Wrap an existing secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Secret value
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TunnelSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TunnelSecret(<redacted>)")
    }
}

/// Connector credentials file, in the connector's own field naming
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct TunnelCredentials {
    /// Account owning the tunnel
    #[serde(rename = "AccountTag")]
    pub account_tag: String,
    /// Tunnel identifier
    #[serde(rename = "TunnelID")]
    pub tunnel_id: String,
    /// Base64 of the tunnel secret
    #[serde(rename = "TunnelSecret")]
    tunnel_secret: String,
}

impl fmt::Debug for TunnelCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelCredentials")
            .field("account_tag", &self.account_tag)
            .field("tunnel_id", &self.tunnel_id)
            .finish_non_exhaustive()
    }
}

/// The one tunnel a deployment routes through
#[derive(Clone, Debug)]
pub struct TunnelRecord {
    /// Control-plane account that owns the tunnel
    pub account_id: String,
    /// Tunnel identifier
    pub tunnel_id: String,
    /// Connector secret
    pub secret: TunnelSecret,
}

impl TunnelRecord {
    /// Record an existing tunnel
    pub fn new(
        account_id: impl Into<String>,
        tunnel_id: impl Into<String>,
        secret: TunnelSecret,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            tunnel_id: tunnel_id.into(),
            secret,
        }
    }

    /// CNAME target for hostnames served by this tunnel
    pub fn cname_target(&self) -> String {
        format!("{}.{}", self.tunnel_id, TUNNEL_CNAME_SUFFIX)
    }

    /// Credentials a locally-run connector authenticates with
    pub fn credentials(&self) -> TunnelCredentials {
        TunnelCredentials {
            account_tag: self.account_id.clone(),
            tunnel_id: self.tunnel_id.clone(),
            tunnel_secret: STANDARD.encode(self.secret.expose()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secrets_are_alphanumeric() {
        let secret = TunnelSecret::generate();
        assert_eq!(secret.expose().len(), TUNNEL_SECRET_LEN);
        assert!(secret.expose().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, TunnelSecret::generate());
    }

    #[test]
    fn debug_never_shows_the_secret() {
        let record = TunnelRecord::new("acct", "tun-1", TunnelSecret::new("hunter2"));
        let debug = format!("{:?}", record);
        assert!(debug.contains("tun-1"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn credentials_embed_the_encoded_secret() {
        let record = TunnelRecord::new("acct", "tun-1", TunnelSecret::new("hunter2"));
        let credentials = record.credentials();

        let json = serde_json::to_value(&credentials).unwrap();
        assert_eq!(json["AccountTag"], "acct");
        assert_eq!(json["TunnelID"], "tun-1");
        assert_eq!(json["TunnelSecret"], STANDARD.encode("hunter2"));
        assert!(!format!("{:?}", credentials).contains("aHVudGVyMg"));
    }

    #[test]
    fn cname_points_into_the_tunnel() {
        let record = TunnelRecord::new("acct", "6f1c", TunnelSecret::generate());
        assert_eq!(record.cname_target(), "6f1c.cfargotunnel.com");
    }
}
