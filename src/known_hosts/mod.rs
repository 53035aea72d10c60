//! Known-hosts file aggregation
//!
//! The known-hosts file is derived, never edited: it is recomputed from the
//! current trust state and topology every time. Output is deterministic, so an
//! unchanged trust state yields byte-identical output, and adding a node adds
//! exactly one line.
//!
//! Layout:
//!
//! ```text
//! @cert-authority ssh.example.com,*.example.com,10.0.1.* <ca-key>   # shared patterns, optional
//! @cert-authority 10.0.1.10,ctrl-00 <ca-key>                        # one line per node, by IP
//! @cert-authority 10.0.1.20,worker-00,worker-00-ssh.example.com <ca-key>
//! ```
//!
//! A node line lists the node's private IP, its hostname and then any aliases
//! registered for it, such as its routed tunnel hostname.
//!
//! Without a CA the lines carry the host keys themselves and no
//! `@cert-authority` marker.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use thiserror::Error;

use crate::topology::{NetworkSpec, NodeIdentity};

/// Marker for lines trusting a certificate authority
pub const CERT_AUTHORITY_MARKER: &str = "@cert-authority";

/// Known-hosts errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KnownHostsError {
    /// A node has no host key in per-host mode
    #[error("no host key for '{0}'")]
    MissingHostKey(String),

    /// Shared patterns cannot be bound to one of several per-host keys
    #[error("pattern '{0}' cannot be pinned to a single host key")]
    AmbiguousPattern(String),

    /// Key material is empty or spans lines
    #[error("invalid public key for '{0}'")]
    InvalidKey(String),
}

/// What clients should trust
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostTrust {
    /// Trust any host certificate signed by this CA key
    CertAuthority(String),
    /// Every node presents the same host key
    SharedHostKey(String),
    /// Each node presents its own key, keyed by hostname
    PerHostKeys(BTreeMap<String, String>),
}

impl HostTrust {
    fn key_for(&self, hostname: &str) -> Result<&str, KnownHostsError> {
        let key = match self {
            Self::CertAuthority(key) | Self::SharedHostKey(key) => key.as_str(),
            Self::PerHostKeys(keys) => keys
                .get(hostname)
                .map(String::as_str)
                .ok_or_else(|| KnownHostsError::MissingHostKey(hostname.to_string()))?,
        };
        let key = key.trim();
        if key.is_empty() || key.contains('\n') {
            return Err(KnownHostsError::InvalidKey(hostname.to_string()));
        }
        Ok(key)
    }

    fn marker(&self) -> Option<&'static str> {
        match self {
            Self::CertAuthority(_) => Some(CERT_AUTHORITY_MARKER),
            _ => None,
        }
    }
}

/// Known-hosts builder
#[derive(Clone, Debug)]
pub struct KnownHosts {
    trust: HostTrust,
    shared_patterns: Vec<String>,
    aliases: BTreeMap<String, Vec<String>>,
}

impl KnownHosts {
    /// Start from a trust anchor
    pub fn new(trust: HostTrust) -> Self {
        Self {
            trust,
            shared_patterns: Vec::new(),
            aliases: BTreeMap::new(),
        }
    }

    /// Add a name only `hostname` answers to (its routed tunnel hostname)
    pub fn with_alias(mut self, hostname: impl Into<String>, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        let aliases = self.aliases.entry(hostname.into()).or_default();
        if !aliases.contains(&alias) {
            aliases.push(alias);
        }
        self
    }

    /// Add a name or wildcard every node answers to (bastion alias, subnet)
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        if !self.shared_patterns.contains(&pattern) {
            self.shared_patterns.push(pattern);
        }
        self
    }

    /// Render the file for `nodes`
    pub fn render(&self, nodes: &[NodeIdentity]) -> Result<String, KnownHostsError> {
        let mut out = String::new();

        if !self.shared_patterns.is_empty() {
            if let HostTrust::PerHostKeys(_) = self.trust {
                return Err(KnownHostsError::AmbiguousPattern(self.shared_patterns.join(",")));
            }
            let key = self.trust.key_for("*")?;
            self.push_line(&mut out, &self.shared_patterns.join(","), key);
        }

        let hosts: BTreeSet<(Ipv4Addr, &str)> = nodes
            .iter()
            .map(|node| (node.ip, node.hostname.as_str()))
            .collect();
        for (ip, hostname) in hosts {
            let key = self.trust.key_for(hostname)?;
            let mut patterns = format!("{},{}", ip, hostname);
            for alias in self.aliases.get(hostname).into_iter().flatten() {
                patterns.push(',');
                patterns.push_str(alias);
            }
            self.push_line(&mut out, &patterns, key);
        }

        Ok(out)
    }

    fn push_line(&self, out: &mut String, patterns: &str, key: &str) {
        if let Some(marker) = self.trust.marker() {
            out.push_str(marker);
            out.push(' ');
        }
        out.push_str(patterns);
        out.push(' ');
        out.push_str(key);
        out.push('\n');
    }
}

/// Wildcard covering `network`, widened to the enclosing octet boundary
///
/// `10.0.1.0/24` becomes `10.0.1.*`, `10.0.0.0/16` becomes `10.0.*`.
pub fn subnet_wildcard(network: &NetworkSpec) -> String {
    let octets = network.base_address.octets();
    let fixed = usize::from(network.prefix_length.min(32) / 8);
    if fixed == 4 {
        return network.base_address.to_string();
    }
    let mut parts: Vec<String> = octets[..fixed].iter().map(u8::to_string).collect();
    parts.push("*".to_string());
    parts.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::allocate;

    const CA: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICA";

    #[test]
    fn one_line_per_node_with_the_ca_key() {
        let nodes = allocate("worker", 2, 20).unwrap();
        let out = KnownHosts::new(HostTrust::CertAuthority(CA.to_string()))
            .render(&nodes)
            .unwrap();

        assert_eq!(
            out,
            format!(
                "@cert-authority 10.0.1.20,worker-00 {CA}\n@cert-authority 10.0.1.21,worker-01 {CA}\n"
            )
        );
    }

    #[test]
    fn shared_patterns_come_first() {
        let nodes = allocate("worker", 1, 20).unwrap();
        let out = KnownHosts::new(HostTrust::CertAuthority(format!("{CA}\n")))
            .with_pattern("ssh.example.com")
            .with_pattern("*.example.com")
            .with_pattern(subnet_wildcard(&NetworkSpec::default()))
            .render(&nodes)
            .unwrap();

        let lines: Vec<_> = out.lines().collect();
        assert_eq!(
            lines[0],
            format!("@cert-authority ssh.example.com,*.example.com,10.0.1.* {CA}")
        );
        assert_eq!(lines[1], format!("@cert-authority 10.0.1.20,worker-00 {CA}"));
    }

    #[test]
    fn regeneration_is_byte_identical() {
        let nodes = allocate("worker", 3, 20).unwrap();
        let hosts = KnownHosts::new(HostTrust::CertAuthority(CA.to_string())).with_pattern("ssh.example.com");
        assert_eq!(hosts.render(&nodes).unwrap(), hosts.render(&nodes).unwrap());

        let mut reversed = nodes.clone();
        reversed.reverse();
        assert_eq!(hosts.render(&nodes).unwrap(), hosts.render(&reversed).unwrap());
    }

    #[test]
    fn adding_a_node_adds_exactly_one_line() {
        let hosts = KnownHosts::new(HostTrust::CertAuthority(CA.to_string())).with_pattern("ssh.example.com");
        let before = hosts.render(&allocate("worker", 2, 20).unwrap()).unwrap();
        let after = hosts.render(&allocate("worker", 3, 20).unwrap()).unwrap();

        let before_lines: Vec<_> = before.lines().collect();
        let after_lines: Vec<_> = after.lines().collect();
        assert_eq!(after_lines.len(), before_lines.len() + 1);
        assert_eq!(&after_lines[..before_lines.len()], &before_lines[..]);
        assert_eq!(
            *after_lines.last().unwrap(),
            format!("@cert-authority 10.0.1.22,worker-02 {CA}")
        );
    }

    #[test]
    fn per_host_keys_emit_plain_lines() {
        let nodes = allocate("worker", 2, 20).unwrap();
        let keys = BTreeMap::from([
            ("worker-00".to_string(), "ssh-ed25519 KEY0".to_string()),
            ("worker-01".to_string(), "ssh-ed25519 KEY1".to_string()),
        ]);
        let out = KnownHosts::new(HostTrust::PerHostKeys(keys)).render(&nodes).unwrap();
        assert_eq!(
            out,
            "10.0.1.20,worker-00 ssh-ed25519 KEY0\n10.0.1.21,worker-01 ssh-ed25519 KEY1\n"
        );
    }

    #[test]
    fn aliases_extend_their_node_line_only() {
        let nodes = allocate("worker", 2, 20).unwrap();
        let keys = BTreeMap::from([
            ("worker-00".to_string(), "ssh-ed25519 KEY0".to_string()),
            ("worker-01".to_string(), "ssh-ed25519 KEY1".to_string()),
        ]);
        let out = KnownHosts::new(HostTrust::PerHostKeys(keys))
            .with_alias("worker-01", "worker-01-ssh.example.com")
            .with_alias("worker-01", "worker-01-ssh.example.com")
            .render(&nodes)
            .unwrap();
        assert_eq!(
            out,
            "10.0.1.20,worker-00 ssh-ed25519 KEY0\n\
             10.0.1.21,worker-01,worker-01-ssh.example.com ssh-ed25519 KEY1\n"
        );
    }

    #[test]
    fn per_host_keys_must_cover_every_node() {
        let nodes = allocate("worker", 2, 20).unwrap();
        let keys = BTreeMap::from([("worker-00".to_string(), "ssh-ed25519 KEY0".to_string())]);
        assert_eq!(
            KnownHosts::new(HostTrust::PerHostKeys(keys)).render(&nodes),
            Err(KnownHostsError::MissingHostKey("worker-01".to_string()))
        );
    }

    #[test]
    fn per_host_keys_reject_shared_patterns() {
        let result = KnownHosts::new(HostTrust::PerHostKeys(BTreeMap::new()))
            .with_pattern("ssh.example.com")
            .render(&[]);
        assert!(matches!(result, Err(KnownHostsError::AmbiguousPattern(_))));
    }

    #[test]
    fn shared_host_key_covers_bastion_alias() {
        let nodes = allocate("worker", 1, 20).unwrap();
        let out = KnownHosts::new(HostTrust::SharedHostKey("ssh-ed25519 SHARED".to_string()))
            .with_pattern("ssh.example.com")
            .render(&nodes)
            .unwrap();
        assert_eq!(
            out,
            "ssh.example.com ssh-ed25519 SHARED\n10.0.1.20,worker-00 ssh-ed25519 SHARED\n"
        );
    }

    #[test]
    fn empty_keys_are_rejected() {
        let nodes = allocate("worker", 1, 20).unwrap();
        assert_eq!(
            KnownHosts::new(HostTrust::CertAuthority("  ".to_string())).render(&nodes),
            Err(KnownHostsError::InvalidKey("worker-00".to_string()))
        );
    }

    #[test]
    fn subnet_wildcards_follow_octet_boundaries() {
        let net = |a, b, c, d, p| NetworkSpec::new(Ipv4Addr::new(a, b, c, d), p);
        assert_eq!(subnet_wildcard(&net(10, 0, 1, 0, 24)), "10.0.1.*");
        assert_eq!(subnet_wildcard(&net(10, 0, 0, 0, 16)), "10.0.*");
        assert_eq!(subnet_wildcard(&net(10, 0, 16, 0, 20)), "10.0.*");
        assert_eq!(subnet_wildcard(&net(10, 0, 1, 5, 32)), "10.0.1.5");
        assert_eq!(subnet_wildcard(&net(0, 0, 0, 0, 0)), "*");
    }
}
