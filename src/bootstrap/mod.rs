//! Node bootstrap (cloud-init user-data)
//!
//! Each node boots from a `#cloud-config` document that installs its SSH host
//! identity and the tunnel connector service. Key material is embedded
//! base64-encoded so it survives YAML quoting untouched.
//!
//! In certificate mode a node without a certificate is refused outright;
//! bringing it up would silently fall back to trust-on-first-use.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{context, AutoEscape, Environment};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pki::{HostCertificate, HostKeyPair, HostTrustMode, SigningError};
use crate::topology::NodeIdentity;
use crate::Error;

/// Embedded cloud-config template
pub const CLOUD_CONFIG_TEMPLATE: &str = include_str!("../../templates/cloud-config.yaml");

const TEMPLATE_NAME: &str = "cloud-config.yaml";

/// CPU architecture of the node image
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// 64-bit ARM
    #[default]
    Arm64,
    /// 64-bit x86
    Amd64,
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arm64 => f.write_str("arm64"),
            Self::Amd64 => f.write_str("amd64"),
        }
    }
}

/// Everything one node needs at first boot
pub struct NodeBootstrap<'a> {
    node: &'a NodeIdentity,
    host_key: &'a HostKeyPair,
    certificate: Option<&'a HostCertificate>,
    tunnel_token: Option<&'a str>,
    authorized_key: Option<&'a str>,
    arch: Arch,
    trust: HostTrustMode,
}

impl<'a> NodeBootstrap<'a> {
    /// Bootstrap for `node` presenting `host_key`
    pub fn new(node: &'a NodeIdentity, host_key: &'a HostKeyPair) -> Self {
        Self {
            node,
            host_key,
            certificate: None,
            tunnel_token: None,
            authorized_key: None,
            arch: Arch::default(),
            trust: HostTrustMode::default(),
        }
    }

    /// Host certificate to install
    pub fn with_certificate(mut self, certificate: &'a HostCertificate) -> Self {
        self.certificate = Some(certificate);
        self
    }

    /// Tunnel connector installation token
    pub fn with_tunnel_token(mut self, token: &'a str) -> Self {
        self.tunnel_token = Some(token);
        self
    }

    /// Operator public key allowed to log in
    pub fn with_authorized_key(mut self, key: &'a str) -> Self {
        self.authorized_key = Some(key.trim());
        self
    }

    /// Node architecture (selects the connector package)
    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    /// Trust mode; raw-key mode does not require a certificate
    pub fn with_trust(mut self, trust: HostTrustMode) -> Self {
        self.trust = trust;
        self
    }

    /// Render the user-data document
    pub fn render(&self) -> Result<String, Error> {
        if self.trust == HostTrustMode::CertificateAuthority && self.certificate.is_none() {
            return Err(SigningError::EmptyOutput {
                key_id: self.node.hostname.clone(),
            }
            .into());
        }

        if let Some(token) = self.tunnel_token {
            if token.is_empty() || token.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
                return Err(Error::configuration("tunnel token must be a single non-empty word"));
            }
        }

        if let Some(key) = self.authorized_key {
            if key.is_empty() || key.contains('\n') {
                return Err(Error::configuration("authorized key must be a single line"));
            }
        }

        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.add_template(TEMPLATE_NAME, CLOUD_CONFIG_TEMPLATE)?;

        let cert_b64 = self
            .certificate
            .map(|cert| STANDARD.encode(format!("{}\n", cert.openssh)));

        let rendered = env.get_template(TEMPLATE_NAME)?.render(context! {
            hostname => &self.node.hostname,
            role => self.node.role.to_string(),
            private_ip => self.node.ip.to_string(),
            arch => self.arch.to_string(),
            ssh_host_key_b64 => STANDARD.encode(self.host_key.private_key_openssh()),
            ssh_host_pub_b64 => STANDARD.encode(format!("{}\n", self.host_key.public_key_openssh())),
            ssh_host_cert_b64 => cert_b64,
            tunnel_token => self.tunnel_token,
            authorized_key => self.authorized_key,
        })?;

        debug!(node = %self.node.hostname, bytes = rendered.len(), "Rendered user-data");
        Ok(rendered)
    }
}
