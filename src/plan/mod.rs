//! Deployment plan
//!
//! Runs the provisioning side of the core in dependency order and collects
//! every artifact the orchestrator needs:
//!
//! 1. validate configuration
//! 2. allocate node identities
//! 3. generate host keys and, with a CA, sign them (concurrently, one
//!    scratch directory per node)
//! 4. route the tunnel ingress
//! 5. aggregate known_hosts
//! 6. render user-data per node
//!
//! Certificate principals and known_hosts lines both include the hostname the
//! tunnel routes to each node, so clients verify the name they actually dial.
//!
//! Any signing failure aborts the whole plan; there is no partial output.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::bootstrap::NodeBootstrap;
use crate::config::DeploymentConfig;
use crate::ingress::{IngressMode, IngressPlan, IngressRouter};
use crate::known_hosts::{subnet_wildcard, HostTrust, KnownHosts};
use crate::pki::{
    CertificateIssuer, HostCertificate, HostKeyMode, HostKeyPair, HostKeySigner, HostTrustMode,
    SigningAuthority,
};
use crate::topology::{allocate_all, NodeIdentity};
use crate::tunnel::{TunnelCredentials, TunnelRecord};
use crate::Error;

/// Key id of the certificate shared by every node in shared-key mode
pub const SHARED_KEY_ID: &str = "shared-host";

/// CNAME the orchestrator creates for one routed hostname
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecord {
    /// Fully-qualified hostname
    pub name: String,
    /// Tunnel CNAME target
    pub target: String,
    /// Record type (always `CNAME`)
    #[serde(rename = "type")]
    pub record_type: String,
    /// Whether the record is proxied by the edge
    pub proxied: bool,
}

/// SSH identity installed on one node
#[derive(Clone, Debug)]
pub struct NodeHostIdentity {
    /// Host key pair
    pub host_key: HostKeyPair,
    /// Certificate, absent in raw-key mode
    pub certificate: Option<HostCertificate>,
}

/// Everything produced for one deployment
#[derive(Debug)]
pub struct DeploymentPlan {
    /// Allocated nodes, in group declaration order
    pub nodes: Vec<NodeIdentity>,
    /// Host identity per hostname
    pub identities: BTreeMap<String, NodeHostIdentity>,
    /// CA public key when certificate trust is used
    pub ca_public_key: Option<String>,
    /// Tunnel ingress rules and access bindings
    pub ingress: IngressPlan,
    /// Access organization auth domain the bindings belong to
    pub auth_domain: String,
    /// Connector credentials for the tunnel
    pub tunnel_credentials: TunnelCredentials,
    /// DNS records pointing routed hostnames at the tunnel
    pub dns_records: Vec<DnsRecord>,
    /// Rendered known_hosts file
    pub known_hosts: String,
    /// Rendered user-data per hostname
    pub user_data: BTreeMap<String, String>,
}

impl DeploymentPlan {
    /// Build the plan
    ///
    /// `authority` is required with certificate trust and ignored with raw
    /// keys. `tunnel_token` is the connector installation token embedded in
    /// every node's user-data.
    pub async fn build<S>(
        config: &DeploymentConfig,
        tunnel: &TunnelRecord,
        tunnel_token: &str,
        authority: Option<&SigningAuthority>,
        signer: &S,
    ) -> Result<Self, Error>
    where
        S: HostKeySigner + ?Sized,
    {
        config.validate()?;

        let network = config.network.node_network();
        let nodes = allocate_all(&network, &config.groups)?;
        info!(nodes = nodes.len(), network = %network.cidr(), "Allocated topology");

        let mut router = IngressRouter::new(tunnel, config.domain.clone(), config.ingress.clone())
            .with_bastion_subdomain(config.bastion.subdomain.clone());
        if let Some(domain) = config.email_domain() {
            router = router.with_email_domain(domain);
        }

        let (identities, ca_public_key) = match config.host_trust {
            HostTrustMode::CertificateAuthority => {
                let authority = authority.ok_or_else(|| {
                    Error::configuration("certificate trust requires a signing authority")
                })?;
                let issuer = CertificateIssuer::new(authority, signer, config.validity());
                let identities =
                    issue_certificates(&issuer, &nodes, &router, config.host_keys).await?;
                (identities, Some(authority.public_key_openssh().to_string()))
            }
            HostTrustMode::RawKeys => (generate_raw_keys(&nodes, config.host_keys)?, None),
        };

        let ingress = router.route(&nodes);
        ingress.validate()?;

        let dns_records = ingress
            .rules
            .iter()
            .filter_map(|rule| rule.hostname.as_ref())
            .map(|name| DnsRecord {
                name: name.clone(),
                target: tunnel.cname_target(),
                record_type: "CNAME".to_string(),
                proxied: true,
            })
            .collect();

        let known_hosts =
            render_known_hosts(config, &router, &nodes, &identities, ca_public_key.as_deref())?;

        let mut user_data = BTreeMap::new();
        for node in &nodes {
            let identity = identities
                .get(&node.hostname)
                .ok_or_else(|| Error::configuration(format!("no host identity for {}", node.hostname)))?;

            let mut bootstrap = NodeBootstrap::new(node, &identity.host_key)
                .with_trust(config.host_trust)
                .with_arch(config.arch)
                .with_tunnel_token(tunnel_token)
                .with_authorized_key(&config.ssh_public_key);
            if let Some(cert) = &identity.certificate {
                bootstrap = bootstrap.with_certificate(cert);
            }
            user_data.insert(node.hostname.clone(), bootstrap.render()?);
        }

        info!(
            nodes = nodes.len(),
            rules = ingress.rules.len(),
            trust = ?config.host_trust,
            "Deployment plan complete"
        );

        Ok(Self {
            nodes,
            identities,
            ca_public_key,
            ingress,
            auth_domain: config.auth_domain(),
            tunnel_credentials: tunnel.credentials(),
            dns_records,
            known_hosts,
            user_data,
        })
    }

    /// Write every artifact under `dir`, returning the paths written
    ///
    /// User-data files and the tunnel credentials carry secrets and are
    /// created owner-only.
    pub fn write_to(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, Error> {
        let dir = dir.as_ref();
        let user_data_dir = dir.join("user-data");
        fs::create_dir_all(&user_data_dir)?;

        let mut written = Vec::new();
        let mut put = |path: PathBuf, contents: &[u8], secret: bool| -> Result<(), Error> {
            write_file(&path, contents, secret)?;
            written.push(path);
            Ok(())
        };

        put(dir.join("known_hosts"), self.known_hosts.as_bytes(), false)?;
        put(
            dir.join("tunnel-config.json"),
            &serde_json::to_vec_pretty(&self.ingress.to_tunnel_config()?)?,
            false,
        )?;
        put(
            dir.join("tunnel-credentials.json"),
            &serde_json::to_vec_pretty(&self.tunnel_credentials)?,
            true,
        )?;
        put(
            dir.join("access-bindings.json"),
            &serde_json::to_vec_pretty(&json!({
                "authDomain": self.auth_domain,
                "bindings": self.ingress.access_bindings,
            }))?,
            false,
        )?;
        put(
            dir.join("dns-records.json"),
            &serde_json::to_vec_pretty(&self.dns_records)?,
            false,
        )?;
        put(
            dir.join("topology.json"),
            &serde_json::to_vec_pretty(&self.nodes)?,
            false,
        )?;
        if let Some(ca) = &self.ca_public_key {
            put(dir.join("ssh_ca.pub"), format!("{}\n", ca.trim()).as_bytes(), false)?;
        }
        for (hostname, doc) in &self.user_data {
            put(user_data_dir.join(format!("{}.yaml", hostname)), doc.as_bytes(), true)?;
        }

        info!(dir = %dir.display(), files = written.len(), "Wrote deployment plan");
        Ok(written)
    }
}

/// Names clients may dial for `node`: the bastion alias and its routed hostname
fn public_names(router: &IngressRouter<'_>, node: &NodeIdentity) -> Vec<String> {
    let mut names = vec![router.bastion_hostname()];
    let routed = router.routed_hostname(node);
    if !names.contains(&routed) {
        names.push(routed);
    }
    names
}

async fn issue_certificates<S>(
    issuer: &CertificateIssuer<'_, S>,
    nodes: &[NodeIdentity],
    router: &IngressRouter<'_>,
    mode: HostKeyMode,
) -> Result<BTreeMap<String, NodeHostIdentity>, Error>
where
    S: HostKeySigner + ?Sized,
{
    match mode {
        HostKeyMode::PerNode => {
            let names: Vec<Vec<String>> = nodes
                .iter()
                .map(|node| public_names(router, node))
                .collect();
            let issued = try_join_all(
                nodes
                    .iter()
                    .zip(&names)
                    .map(|(node, names)| issuer.issue_for_node(node, names)),
            )
            .await?;
            Ok(issued
                .into_iter()
                .map(|identity| {
                    (
                        identity.key_id,
                        NodeHostIdentity {
                            host_key: identity.host_key,
                            certificate: Some(identity.certificate),
                        },
                    )
                })
                .collect())
        }
        HostKeyMode::Shared => {
            let mut names = vec![router.bastion_hostname()];
            for node in nodes {
                names.extend(public_names(router, node));
            }
            let issued = issuer.issue_shared(SHARED_KEY_ID, nodes, &names).await?;
            Ok(nodes
                .iter()
                .map(|node| {
                    (
                        node.hostname.clone(),
                        NodeHostIdentity {
                            host_key: issued.host_key.clone(),
                            certificate: Some(issued.certificate.clone()),
                        },
                    )
                })
                .collect())
        }
    }
}

fn generate_raw_keys(
    nodes: &[NodeIdentity],
    mode: HostKeyMode,
) -> Result<BTreeMap<String, NodeHostIdentity>, Error> {
    let shared = match mode {
        HostKeyMode::Shared => Some(HostKeyPair::generate()?),
        HostKeyMode::PerNode => None,
    };

    let mut identities = BTreeMap::new();
    for node in nodes {
        let host_key = match &shared {
            Some(key) => key.clone(),
            None => HostKeyPair::generate()?,
        };
        identities.insert(
            node.hostname.clone(),
            NodeHostIdentity {
                host_key,
                certificate: None,
            },
        );
    }
    Ok(identities)
}

fn render_known_hosts(
    config: &DeploymentConfig,
    router: &IngressRouter<'_>,
    nodes: &[NodeIdentity],
    identities: &BTreeMap<String, NodeHostIdentity>,
    ca_public_key: Option<&str>,
) -> Result<String, Error> {
    let wildcard = subnet_wildcard(&config.network.node_network());
    let with_patterns = |hosts: KnownHosts| {
        hosts
            .with_pattern(format!("*.{}", config.domain))
            .with_pattern(config.bastion_hostname())
            .with_pattern(wildcard.clone())
    };

    let hosts = match (ca_public_key, config.host_keys) {
        (Some(ca), _) => with_patterns(KnownHosts::new(HostTrust::CertAuthority(ca.to_string()))),
        (None, HostKeyMode::Shared) => match identities.values().next() {
            Some(identity) => with_patterns(KnownHosts::new(HostTrust::SharedHostKey(
                identity.host_key.public_key_openssh().to_string(),
            ))),
            // No node holds the shared key, so nothing can be pinned
            None => return Ok(String::new()),
        },
        (None, HostKeyMode::PerNode) => {
            if config.ingress == IngressMode::SharedBastion {
                warn!(
                    bastion = %config.bastion_hostname(),
                    "Per-node raw keys cannot be pinned to the shared bastion alias"
                );
            }
            let keys = identities
                .iter()
                .map(|(hostname, identity)| {
                    (hostname.clone(), identity.host_key.public_key_openssh().to_string())
                })
                .collect();
            KnownHosts::new(HostTrust::PerHostKeys(keys))
        }
    };

    let hosts = match config.ingress {
        IngressMode::PerNode => nodes.iter().fold(hosts, |hosts, node| {
            hosts.with_alias(node.hostname.clone(), router.node_hostname(node))
        }),
        IngressMode::SharedBastion => hosts,
    };

    Ok(hosts.render(nodes)?)
}

fn write_file(path: &Path, contents: &[u8], secret: bool) -> Result<(), Error> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(if secret { 0o600 } else { 0o644 });
    }
    #[cfg(not(unix))]
    let _ = secret;

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    Ok(())
}
