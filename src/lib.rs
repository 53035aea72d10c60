//! Outpost - private cluster provisioning behind an outbound-only tunnel
//!
//! Outpost plans a small compute cluster that is reachable only through an
//! outbound-initiated tunnel, and gates the tunnel's destruction until the
//! control plane confirms it carries no traffic.
//!
//! # Architecture
//!
//! The resource orchestrator that actually creates servers, DNS records and
//! tunnels is external. Outpost supplies the pieces it cannot get wrong:
//! - Deterministic node identity (hostname and private IP) from group offsets
//! - SSH host certificates scoped to every name a node is reachable by
//! - A drain gate that blocks tunnel deletion until the tunnel is idle
//!
//! # Modules
//!
//! - [`topology`] - Node identity allocation
//! - [`pki`] - SSH certificate authority and host key signing
//! - [`tunnel`] - Tunnel record and connector secret
//! - [`ingress`] - Tunnel ingress rules and access bindings
//! - [`known_hosts`] - Known-hosts aggregation
//! - [`bootstrap`] - Cloud-init user-data rendering
//! - [`drain`] - Tunnel drain controller
//! - [`plan`] - Dependency-ordered deployment plan
//! - [`config`] - Deployment configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod drain;
pub mod error;
pub mod ingress;
pub mod known_hosts;
pub mod pki;
pub mod plan;
pub mod topology;
pub mod tunnel;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Environment variable holding the control-plane API token
pub const API_TOKEN_ENV: &str = "CLOUDFLARE_API_TOKEN";

/// Default tracing filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,outpost=debug";
