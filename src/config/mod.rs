//! Deployment configuration
//!
//! Loaded once from a camelCase YAML file and passed by reference to every
//! component. Secrets (API token, CA key, tunnel token) are not part of the
//! file; the CLI takes them from flags or the environment.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bootstrap::Arch;
use crate::ingress::IngressMode;
use crate::pki::{HostKeyMode, HostTrustMode, Validity, DEFAULT_VALIDITY_WEEKS};
use crate::topology::{
    self, GroupSpec, NetworkSpec, NodeRole, DEFAULT_NETWORK_BASE, DEFAULT_PREFIX_LEN,
};
use crate::Error;

/// Default firewall-level CIDR covering the private network
pub const DEFAULT_CIDR: &str = "10.0.0.0/16";

/// Default bastion subdomain
pub const DEFAULT_BASTION_SUBDOMAIN: &str = "ssh";

/// Suffix of the access organization's auth domain
pub const ACCESS_AUTH_SUFFIX: &str = "cloudflareaccess.com";

/// Private network settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    /// Base address node offsets are added to
    pub base_address: Ipv4Addr,
    /// Prefix length of the node subnet
    pub prefix_length: u8,
    /// Enclosing network (firewall rules, wildcards)
    pub cidr: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_address: DEFAULT_NETWORK_BASE,
            prefix_length: DEFAULT_PREFIX_LEN,
            cidr: DEFAULT_CIDR.to_string(),
        }
    }
}

impl NetworkConfig {
    /// Node subnet used for allocation
    pub fn node_network(&self) -> NetworkSpec {
        NetworkSpec::new(self.base_address, self.prefix_length)
    }

    fn parse_cidr(&self) -> Option<(Ipv4Addr, u8)> {
        let (addr, prefix) = self.cidr.split_once('/')?;
        let addr: Ipv4Addr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        (prefix <= 32).then_some((addr, prefix))
    }
}

/// Bastion settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BastionConfig {
    /// Subdomain of the bastion hostname
    pub subdomain: String,
}

impl Default for BastionConfig {
    fn default() -> Self {
        Self {
            subdomain: DEFAULT_BASTION_SUBDOMAIN.to_string(),
        }
    }
}

/// Host certificate settings
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificateConfig {
    /// Validity in weeks
    pub validity_weeks: u32,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            validity_weeks: DEFAULT_VALIDITY_WEEKS,
        }
    }
}

/// Control-plane group used when none are configured
pub fn default_groups() -> Vec<GroupSpec> {
    vec![
        GroupSpec::new("ctrl", 1, 10, NodeRole::ControlPlane),
        GroupSpec::new("worker", 1, 20, NodeRole::Worker),
    ]
}

/// Complete deployment configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentConfig {
    /// Control-plane account
    pub account_id: String,
    /// DNS zone holding the deployment's records
    pub zone_id: String,
    /// Access organization name
    pub org_name: String,
    /// Domain hostnames are created under
    pub domain: String,
    /// Administrator contact
    pub admin_email: String,
    /// Operator public key installed on every node
    pub ssh_public_key: String,
    /// Private network
    pub network: NetworkConfig,
    /// Node groups
    pub groups: Vec<GroupSpec>,
    /// Bastion settings
    pub bastion: BastionConfig,
    /// Per-node or shared host keys
    pub host_keys: HostKeyMode,
    /// Certificate or raw-key trust
    pub host_trust: HostTrustMode,
    /// Per-node or shared-bastion ingress
    pub ingress: IngressMode,
    /// Host certificate settings
    pub certificate: CertificateConfig,
    /// Node architecture
    pub arch: Arch,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            zone_id: String::new(),
            org_name: String::new(),
            domain: String::new(),
            admin_email: String::new(),
            ssh_public_key: String::new(),
            network: NetworkConfig::default(),
            groups: default_groups(),
            bastion: BastionConfig::default(),
            host_keys: HostKeyMode::default(),
            host_trust: HostTrustMode::default(),
            ingress: IngressMode::default(),
            certificate: CertificateConfig::default(),
            arch: Arch::default(),
        }
    }
}

impl fmt::Debug for DeploymentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentConfig")
            .field("account_id", &self.account_id)
            .field("domain", &self.domain)
            .field("network", &self.network)
            .field("groups", &self.groups)
            .field("host_keys", &self.host_keys)
            .field("host_trust", &self.host_trust)
            .field("ingress", &self.ingress)
            .finish_non_exhaustive()
    }
}

impl DeploymentConfig {
    /// Parse YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Bastion hostname, e.g. `ssh.example.com`
    pub fn bastion_hostname(&self) -> String {
        format!("{}.{}", self.bastion.subdomain, self.domain)
    }

    /// Access organization auth domain, e.g. `acme.cloudflareaccess.com`
    pub fn auth_domain(&self) -> String {
        format!("{}.{}", self.org_name, ACCESS_AUTH_SUFFIX)
    }

    /// Domain part of the administrator email; access is limited to it
    pub fn email_domain(&self) -> Option<&str> {
        self.admin_email
            .trim()
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
    }

    /// Certificate validity
    pub fn validity(&self) -> Validity {
        Validity::weeks(self.certificate.validity_weeks)
    }

    /// Check required values and topology before anything runs
    pub fn validate(&self) -> Result<(), Error> {
        let required = [
            ("accountId", &self.account_id),
            ("zoneId", &self.zone_id),
            ("orgName", &self.org_name),
            ("domain", &self.domain),
            ("adminEmail", &self.admin_email),
            ("sshPublicKey", &self.ssh_public_key),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(Error::configuration(format!(
                "missing required values: {}",
                missing.join(", ")
            )));
        }

        if self.domain.contains("://") || self.domain.contains('/') || self.domain.starts_with('.') {
            return Err(Error::configuration(format!(
                "domain '{}' must be a bare DNS name",
                self.domain
            )));
        }
        if self.email_domain().is_none() || self.admin_email.trim().starts_with('@') {
            return Err(Error::configuration(format!(
                "adminEmail '{}' is not an email address",
                self.admin_email
            )));
        }
        if self.ssh_public_key.trim().contains('\n') {
            return Err(Error::configuration("sshPublicKey must be a single line"));
        }
        if self.bastion.subdomain.is_empty() || self.bastion.subdomain.contains('.') {
            return Err(Error::configuration(format!(
                "bastion subdomain '{}' must be a single DNS label",
                self.bastion.subdomain
            )));
        }
        if self.certificate.validity_weeks == 0 {
            return Err(Error::configuration("certificate validityWeeks must be positive"));
        }

        let (cidr_base, cidr_prefix) = self.network.parse_cidr().ok_or_else(|| {
            Error::configuration(format!("invalid network cidr '{}'", self.network.cidr))
        })?;
        let nodes = self.network.node_network();
        if nodes.prefix_length < cidr_prefix || !contains(cidr_base, cidr_prefix, nodes.base_address) {
            return Err(Error::configuration(format!(
                "node network {} is not inside {}",
                nodes.cidr(),
                self.network.cidr
            )));
        }

        topology::validate_groups(&nodes, &self.groups)?;
        Ok(())
    }
}

fn contains(base: Ipv4Addr, prefix: u8, addr: Ipv4Addr) -> bool {
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) };
    u32::from(base) & mask == u32::from(addr) & mask
}
