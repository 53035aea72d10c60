//! Deterministic cluster topology allocation
//!
//! Every node identity is derived from a `(group, index, offset)` triple:
//!
//! - hostname: `<group>-<index, zero-padded to 2>`
//! - private IP: `network base + group offset + index`
//!
//! The same inputs always produce the same identities, so re-planning an
//! unchanged deployment yields an unchanged topology.
//!
//! Groups must not be configured with overlapping `[offset, offset + count)`
//! ranges. [`validate_groups`] enforces this before [`allocate_all`] assigns
//! anything; the single-group [`allocate`] takes disjointness as a caller
//! precondition.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default private network base (`10.0.1.0/24`)
pub const DEFAULT_NETWORK_BASE: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 0);

/// Default private network prefix length
pub const DEFAULT_PREFIX_LEN: u8 = 24;

/// Topology errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    /// Two groups claim intersecting address ranges
    #[error("groups '{first}' and '{second}' have overlapping IP ranges")]
    Overlap {
        /// Group declared first
        first: String,
        /// Group declared second
        second: String,
    },

    /// The same group name appears more than once
    #[error("group '{0}' is declared more than once")]
    DuplicateGroup(String),

    /// A group's range does not fit inside the network
    #[error("group '{group}' range {start}..{end} does not fit in {network}")]
    OutOfRange {
        /// Group name
        group: String,
        /// First host offset
        start: u64,
        /// One past the last host offset
        end: u64,
        /// Network in CIDR notation
        network: String,
    },

    /// Group names become hostnames and must be DNS labels
    #[error("invalid group name '{0}': must be a lowercase DNS label")]
    InvalidName(String),

    /// Prefix length outside 0..=32
    #[error("invalid prefix length /{0}")]
    InvalidPrefix(u8),
}

/// Role a group's nodes play in the cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Control plane node
    ControlPlane,
    /// Worker node
    #[default]
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlPlane => write!(f, "control-plane"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// A named group of identical nodes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSpec {
    /// Group name, used as the hostname prefix
    pub name: String,
    /// Number of nodes in the group
    pub count: u32,
    /// Offset of the group's first address from the network base
    pub ip_offset: u32,
    /// Role of the group's nodes
    #[serde(default)]
    pub role: NodeRole,
}

impl GroupSpec {
    /// Create a new group spec
    pub fn new(name: impl Into<String>, count: u32, ip_offset: u32, role: NodeRole) -> Self {
        Self {
            name: name.into(),
            count,
            ip_offset,
            role,
        }
    }

    /// Half-open offset range `[ip_offset, ip_offset + count)`
    pub fn range(&self) -> std::ops::Range<u64> {
        let start = u64::from(self.ip_offset);
        start..start + u64::from(self.count)
    }

    fn overlaps(&self, other: &GroupSpec) -> bool {
        let (a, b) = (self.range(), other.range());
        !a.is_empty() && !b.is_empty() && a.start < b.end && b.start < a.end
    }
}

/// The private network nodes are addressed from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Network base address
    pub base_address: Ipv4Addr,
    /// Prefix length
    pub prefix_length: u8,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            base_address: DEFAULT_NETWORK_BASE,
            prefix_length: DEFAULT_PREFIX_LEN,
        }
    }
}

impl NetworkSpec {
    /// Create a network spec
    pub fn new(base_address: Ipv4Addr, prefix_length: u8) -> Self {
        Self {
            base_address,
            prefix_length,
        }
    }

    /// Number of addresses in the network, including network and broadcast
    pub fn capacity(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_length.min(32)))
    }

    /// CIDR notation
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.base_address, self.prefix_length)
    }

    fn address_at(&self, offset: u64) -> Ipv4Addr {
        // Bounds are checked by validate_group, so this cannot wrap
        Ipv4Addr::from(u32::from(self.base_address).wrapping_add(offset as u32))
    }
}

/// Identity assigned to one node
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    /// Group the node belongs to
    pub group: String,
    /// Index within the group, starting at 0
    pub index: u32,
    /// Private IPv4 address
    pub ip: Ipv4Addr,
    /// Short hostname (`<group>-<nn>`)
    pub hostname: String,
    /// Role inherited from the group
    pub role: NodeRole,
}

/// Derive a node hostname: group name, a dash, then the index zero-padded to two digits
pub fn hostname_for(group: &str, index: u32) -> String {
    format!("{}-{:02}", group, index)
}

/// Allocate `count` workers of `group` at `ip_offset` on the default network
///
/// Precondition: no other group in the deployment uses an intersecting
/// `[ip_offset, ip_offset + count)` range. Use [`allocate_all`] to have that
/// checked.
pub fn allocate(group: &str, count: u32, ip_offset: u32) -> Result<Vec<NodeIdentity>, TopologyError> {
    allocate_group(
        &NetworkSpec::default(),
        &GroupSpec::new(group, count, ip_offset, NodeRole::Worker),
    )
}

/// Allocate a single group on the given network
pub fn allocate_group(
    network: &NetworkSpec,
    group: &GroupSpec,
) -> Result<Vec<NodeIdentity>, TopologyError> {
    validate_group(network, group)?;

    Ok((0..group.count)
        .map(|index| NodeIdentity {
            group: group.name.clone(),
            index,
            ip: network.address_at(u64::from(group.ip_offset) + u64::from(index)),
            hostname: hostname_for(&group.name, index),
            role: group.role,
        })
        .collect())
}

/// Validate every group and check that no two ranges intersect
pub fn validate_groups(network: &NetworkSpec, groups: &[GroupSpec]) -> Result<(), TopologyError> {
    let mut seen = HashSet::new();
    for group in groups {
        validate_group(network, group)?;
        if !seen.insert(group.name.as_str()) {
            return Err(TopologyError::DuplicateGroup(group.name.clone()));
        }
    }

    for (i, first) in groups.iter().enumerate() {
        for second in &groups[i + 1..] {
            if first.overlaps(second) {
                return Err(TopologyError::Overlap {
                    first: first.name.clone(),
                    second: second.name.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Validate all groups, then allocate them in declaration order
pub fn allocate_all(
    network: &NetworkSpec,
    groups: &[GroupSpec],
) -> Result<Vec<NodeIdentity>, TopologyError> {
    validate_groups(network, groups)?;

    let mut nodes = Vec::new();
    for group in groups {
        nodes.extend(allocate_group(network, group)?);
    }
    Ok(nodes)
}

fn validate_group(network: &NetworkSpec, group: &GroupSpec) -> Result<(), TopologyError> {
    if network.prefix_length > 32 {
        return Err(TopologyError::InvalidPrefix(network.prefix_length));
    }
    if !is_dns_label(&group.name) {
        return Err(TopologyError::InvalidName(group.name.clone()));
    }

    // Host offsets exclude the network and broadcast addresses
    let range = group.range();
    let capacity = network.capacity();
    if group.count > 0 && (range.start == 0 || range.end > capacity.saturating_sub(1)) {
        return Err(TopologyError::OutOfRange {
            group: group.name.clone(),
            start: range.start,
            end: range.end,
            network: network.cidr(),
        });
    }
    Ok(())
}

fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 60
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}
