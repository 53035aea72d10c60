//! Tunnel ingress routing
//!
//! Builds the ordered rule list the tunnel's edge configuration holds. Rules
//! are matched first to last; the list always ends with exactly one
//! hostname-less catch-all that answers unmatched traffic with a 404.
//!
//! Every hostname-bearing rule needs a matching access-policy binding on the
//! control plane. The router emits those as [`AccessBinding`]s, one per rule,
//! for the orchestrator to create.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::NodeIdentity;
use crate::tunnel::TunnelRecord;

/// Service the catch-all rule routes to
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

/// SSH port nodes listen on
pub const SSH_PORT: u16 = 22;

/// Ingress plan validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngressError {
    /// The plan has no rules at all
    #[error("ingress plan is empty")]
    Empty,

    /// The last rule carries a hostname
    #[error("last ingress rule must be a catch-all")]
    MissingCatchAll,

    /// A catch-all appears before the end
    #[error("catch-all rule at position {0} is not last")]
    CatchAllNotLast(usize),

    /// Two rules claim the same hostname
    #[error("hostname '{0}' is routed more than once")]
    DuplicateHostname(String),
}

/// One ingress rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    /// Hostname to match; `None` matches everything
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Backend service address
    pub service: String,
}

impl IngressRule {
    /// Route `hostname` to `service`
    pub fn route(hostname: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            service: service.into(),
        }
    }

    /// The terminal deny rule
    pub fn catch_all() -> Self {
        Self {
            hostname: None,
            service: CATCH_ALL_SERVICE.to_string(),
        }
    }

    /// Whether this rule matches every hostname
    pub fn is_catch_all(&self) -> bool {
        self.hostname.is_none()
    }
}

/// Control-plane access application required for one routed hostname
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessBinding {
    /// Hostname the application protects
    pub hostname: String,
    /// Application type
    pub application_type: String,
    /// Access policy name the application is bound to
    pub policy: String,
    /// Email domain the policy admits, e.g. `example.com`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_domain: Option<String>,
}

/// How node SSH endpoints are exposed through the tunnel
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IngressMode {
    /// `<node>-ssh.<domain>` routes to that node's private address
    #[default]
    PerNode,
    /// A single bastion hostname routes to the connector host's own SSH daemon
    SharedBastion,
}

/// Ordered rules plus the access bindings they require
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressPlan {
    /// Tunnel the rules belong to
    pub tunnel_id: String,
    /// Rules, in match order
    pub rules: Vec<IngressRule>,
    /// One binding per hostname-bearing rule
    pub access_bindings: Vec<AccessBinding>,
}

#[derive(Serialize)]
struct TunnelConfig<'a> {
    ingress: &'a [IngressRule],
}

impl IngressPlan {
    /// Check the ordering invariants
    pub fn validate(&self) -> Result<(), IngressError> {
        let last = self.rules.last().ok_or(IngressError::Empty)?;
        if !last.is_catch_all() {
            return Err(IngressError::MissingCatchAll);
        }

        let mut seen = HashSet::new();
        for (i, rule) in self.rules[..self.rules.len() - 1].iter().enumerate() {
            match &rule.hostname {
                None => return Err(IngressError::CatchAllNotLast(i)),
                Some(hostname) if !seen.insert(hostname.as_str()) => {
                    return Err(IngressError::DuplicateHostname(hostname.clone()))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Tunnel configuration document (`{"ingress": [...]}`)
    pub fn to_tunnel_config(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(TunnelConfig {
            ingress: &self.rules,
        })
    }
}

/// Maps node identities to ingress rules for one tunnel
#[derive(Clone, Debug)]
pub struct IngressRouter<'a> {
    tunnel: &'a TunnelRecord,
    domain: String,
    bastion_subdomain: String,
    policy: String,
    email_domain: Option<String>,
    mode: IngressMode,
}

impl<'a> IngressRouter<'a> {
    /// Create a router for `tunnel` serving hostnames under `domain`
    pub fn new(tunnel: &'a TunnelRecord, domain: impl Into<String>, mode: IngressMode) -> Self {
        Self {
            tunnel,
            domain: domain.into(),
            bastion_subdomain: "ssh".to_string(),
            policy: "Allow Only Org Domain".to_string(),
            email_domain: None,
            mode,
        }
    }

    /// Override the bastion subdomain (default `ssh`)
    pub fn with_bastion_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.bastion_subdomain = subdomain.into();
        self
    }

    /// Override the access policy bindings reference
    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = policy.into();
        self
    }

    /// Restrict access bindings to users of one email domain
    pub fn with_email_domain(mut self, domain: impl Into<String>) -> Self {
        self.email_domain = Some(domain.into());
        self
    }

    /// Bastion hostname, e.g. `ssh.example.com`
    pub fn bastion_hostname(&self) -> String {
        format!("{}.{}", self.bastion_subdomain, self.domain)
    }

    /// Public SSH hostname for one node, e.g. `worker-00-ssh.example.com`
    pub fn node_hostname(&self, node: &NodeIdentity) -> String {
        format!("{}-ssh.{}", node.hostname, self.domain)
    }

    /// Hostname clients dial to reach `node` through the tunnel
    pub fn routed_hostname(&self, node: &NodeIdentity) -> String {
        match self.mode {
            IngressMode::PerNode => self.node_hostname(node),
            IngressMode::SharedBastion => self.bastion_hostname(),
        }
    }

    /// Build the plan for `nodes`
    pub fn route(&self, nodes: &[NodeIdentity]) -> IngressPlan {
        let mut rules: Vec<IngressRule> = match self.mode {
            IngressMode::PerNode => nodes
                .iter()
                .map(|node| {
                    IngressRule::route(
                        self.node_hostname(node),
                        format!("ssh://{}:{}", node.ip, SSH_PORT),
                    )
                })
                .collect(),
            IngressMode::SharedBastion => vec![IngressRule::route(
                self.bastion_hostname(),
                format!("ssh://localhost:{}", SSH_PORT),
            )],
        };
        rules.push(IngressRule::catch_all());

        let access_bindings = rules
            .iter()
            .filter_map(|rule| rule.hostname.as_ref())
            .map(|hostname| AccessBinding {
                hostname: hostname.clone(),
                application_type: "ssh".to_string(),
                policy: self.policy.clone(),
                email_domain: self.email_domain.clone(),
            })
            .collect();

        IngressPlan {
            tunnel_id: self.tunnel.tunnel_id.clone(),
            rules,
            access_bindings,
        }
    }
}
