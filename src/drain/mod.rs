//! Tunnel drain controller
//!
//! Deleting a tunnel that still carries edge connections fails on the control
//! plane and strands client sessions. The drain controller is the gate in
//! front of that deletion:
//!
//! - [`TunnelDrainer::acquire`] is pure bookkeeping and never touches the network
//! - [`TunnelDrainer::release`] blocks, polling the tunnel on a fixed interval,
//!   until the control plane reports it safe to delete
//!
//! # State Machine
//!
//! ```text
//! Created --release--> Polling(1) --> Polling(2) --> ... --> Drained
//!                          |                |
//!                          +-- Protocol ----+--> error (fatal)
//! ```
//!
//! Transient failures (transport errors, non-2xx other than 404) are logged
//! and retried forever unless [`DrainConfig::max_attempts`] is set. A 404
//! means the tunnel is already gone and counts as drained. Only a 2xx body
//! missing the expected field aborts, since that means the API changed.
//!
//! There is no cancellation: dropping the `release` future is the only way
//! to stop it early.

mod cloudflare;

pub use cloudflare::{CloudflareTunnelApi, DEFAULT_API_BASE};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::tunnel::TunnelRecord;

/// Interval between status polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Drain errors
#[derive(Debug, Error)]
pub enum DrainError {
    /// The status API answered 2xx with a body this controller cannot read
    #[error("unexpected API response: {0}")]
    Protocol(String),

    /// The optional attempt ceiling was reached
    #[error("tunnel {tunnel_id} not drained after {attempts} polls (last: {last})")]
    AttemptsExhausted {
        /// Tunnel being drained
        tunnel_id: String,
        /// Polls performed
        attempts: u32,
        /// Last observation or error
        last: String,
    },

    /// The lease has already been released
    #[error("drain for tunnel {0} already completed")]
    AlreadyReleased(String),
}

/// Errors from a single status request
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never produced a response
    #[error("request failed: {0}")]
    Transport(String),

    /// Non-2xx status other than 404
    #[error("API error {status}: {reason}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Reason phrase
        reason: String,
    },

    /// 2xx response whose body is not JSON
    #[error("malformed response body: {0}")]
    Malformed(String),
}

/// Tunnel status as reported by the control plane
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelHealth {
    /// No connector has ever connected, or all have left
    Inactive,
    /// Some connections are unhealthy
    Degraded,
    /// All connections healthy
    Healthy,
    /// Connectors are gone
    Down,
}

impl TunnelHealth {
    /// Whether this status means the tunnel carries no traffic
    pub fn is_drained(self) -> bool {
        matches!(self, Self::Inactive | Self::Down)
    }
}

impl FromStr for TunnelHealth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(Self::Inactive),
            "degraded" => Ok(Self::Degraded),
            "healthy" => Ok(Self::Healthy),
            "down" => Ok(Self::Down),
            other => Err(format!("unknown tunnel status '{}'", other)),
        }
    }
}

impl fmt::Display for TunnelHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::Degraded => "degraded",
            Self::Healthy => "healthy",
            Self::Down => "down",
        };
        f.write_str(s)
    }
}

/// How "drained" is detected; fixed for a deployment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DrainStrategy {
    /// `result.status` is `inactive` or `down`
    #[default]
    Status,
    /// `result.connections` is empty
    ConnectionCount,
}

/// Drain policy
#[derive(Clone, Debug)]
pub struct DrainConfig {
    /// Wait between polls
    pub interval: Duration,
    /// Detection strategy
    pub strategy: DrainStrategy,
    /// Give up after this many polls (`None` = never)
    pub max_attempts: Option<u32>,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            strategy: DrainStrategy::default(),
            max_attempts: None,
        }
    }
}

impl DrainConfig {
    /// Config for the given strategy with default interval and no ceiling
    pub fn with_strategy(strategy: DrainStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }
}

/// Where a lease is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainPhase {
    /// Acquired, release not started
    Created,
    /// Release in progress
    Polling {
        /// Current poll number, starting at 1
        attempt: u32,
    },
    /// Tunnel confirmed safe to delete
    Drained,
}

/// Bookkeeping returned by [`TunnelDrainer::acquire`]
pub struct DrainLease {
    id: String,
    account_id: String,
    tunnel_id: String,
    api_token: String,
    phase: DrainPhase,
}

impl DrainLease {
    /// Opaque lease identity (`drainer-<tunnel id>`)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Account owning the tunnel
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Tunnel being drained
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// Bearer token for the status API
    pub fn api_token(&self) -> &str {
        &self.api_token
    }

    /// Current phase
    pub fn phase(&self) -> DrainPhase {
        self.phase
    }
}

impl fmt::Debug for DrainLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainLease")
            .field("id", &self.id)
            .field("account_id", &self.account_id)
            .field("tunnel_id", &self.tunnel_id)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Raw answer from the status endpoint
#[derive(Clone, Debug, PartialEq)]
pub enum TunnelResponse {
    /// 2xx with a JSON body
    Found(Value),
    /// 404: the tunnel no longer exists
    NotFound,
}

/// Trait abstracting the tunnel status endpoint for testability
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TunnelStatusApi: Send + Sync {
    /// `GET /accounts/{account}/cfd_tunnel/{tunnel}`
    async fn fetch(&self, lease: &DrainLease) -> Result<TunnelResponse, ApiError>;
}

/// Why a tunnel was considered drained
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainReason {
    /// Status reported inactive or down
    Status(TunnelHealth),
    /// Connection list was empty
    NoConnections,
    /// Tunnel already deleted
    NotFound,
}

/// Traffic still present on the tunnel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activity {
    /// Status still healthy or degraded
    Status(TunnelHealth),
    /// Live connection count
    Connections(usize),
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(health) => write!(f, "status {}", health),
            Self::Connections(n) => write!(f, "{} connections", n),
        }
    }
}

/// Interpretation of one successful poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// Safe to delete
    Drained(DrainReason),
    /// Still carrying traffic
    Draining(Activity),
}

/// Interpret a status response according to `strategy`
pub fn interpret(strategy: DrainStrategy, response: &TunnelResponse) -> Result<Observation, DrainError> {
    let body = match response {
        TunnelResponse::NotFound => return Ok(Observation::Drained(DrainReason::NotFound)),
        TunnelResponse::Found(body) => body,
    };
    let result = body
        .get("result")
        .filter(|r| r.is_object())
        .ok_or_else(|| DrainError::Protocol("missing result object".to_string()))?;

    match strategy {
        DrainStrategy::Status => {
            let status = result
                .get("status")
                .and_then(Value::as_str)
                .ok_or_else(|| DrainError::Protocol("missing result.status".to_string()))?;
            let health: TunnelHealth = status.parse().map_err(DrainError::Protocol)?;
            if health.is_drained() {
                Ok(Observation::Drained(DrainReason::Status(health)))
            } else {
                Ok(Observation::Draining(Activity::Status(health)))
            }
        }
        DrainStrategy::ConnectionCount => {
            let connections = result
                .get("connections")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    DrainError::Protocol("missing result.connections array".to_string())
                })?;
            if connections.is_empty() {
                Ok(Observation::Drained(DrainReason::NoConnections))
            } else {
                Ok(Observation::Draining(Activity::Connections(connections.len())))
            }
        }
    }
}

/// Outcome of a completed drain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainReport {
    /// Number of status polls performed
    pub polls: u32,
    /// Why the tunnel counted as drained
    pub reason: DrainReason,
}

/// Pre-destroy gate for one tunnel
pub struct TunnelDrainer<A: TunnelStatusApi> {
    api: A,
    config: DrainConfig,
}

impl<A: TunnelStatusApi> TunnelDrainer<A> {
    /// Create a drainer
    pub fn new(api: A, config: DrainConfig) -> Self {
        Self { api, config }
    }

    /// Drain policy
    pub fn config(&self) -> &DrainConfig {
        &self.config
    }

    /// Record what release will need. Performs no I/O and cannot fail.
    pub fn acquire(&self, tunnel: &TunnelRecord, api_token: impl Into<String>) -> DrainLease {
        DrainLease {
            id: format!("drainer-{}", tunnel.tunnel_id),
            account_id: tunnel.account_id.clone(),
            tunnel_id: tunnel.tunnel_id.clone(),
            api_token: api_token.into(),
            phase: DrainPhase::Created,
        }
    }

    /// Block until the tunnel is safe to delete
    ///
    /// Polls every [`DrainConfig::interval`]. Returns once the tunnel is
    /// drained or gone; fails only on a protocol error or, when configured,
    /// after `max_attempts` polls.
    pub async fn release(&self, lease: &mut DrainLease) -> Result<DrainReport, DrainError> {
        if lease.phase == DrainPhase::Drained {
            return Err(DrainError::AlreadyReleased(lease.tunnel_id.clone()));
        }

        info!(tunnel_id = %lease.tunnel_id, strategy = ?self.config.strategy, "Starting drain for tunnel");

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            lease.phase = DrainPhase::Polling { attempt };

            let last = match self.api.fetch(lease).await {
                Ok(response) => match interpret(self.config.strategy, &response)? {
                    Observation::Drained(reason) => {
                        info!(
                            tunnel_id = %lease.tunnel_id,
                            attempt = attempt,
                            reason = ?reason,
                            "Tunnel drained, proceeding with destruction"
                        );
                        lease.phase = DrainPhase::Drained;
                        return Ok(DrainReport {
                            polls: attempt,
                            reason,
                        });
                    }
                    Observation::Draining(activity) => {
                        info!(
                            tunnel_id = %lease.tunnel_id,
                            attempt = attempt,
                            activity = %activity,
                            wait_ms = self.config.interval.as_millis() as u64,
                            "Tunnel still carrying traffic, waiting"
                        );
                        activity.to_string()
                    }
                },
                Err(ApiError::Malformed(msg)) => return Err(DrainError::Protocol(msg)),
                Err(e) => {
                    warn!(
                        tunnel_id = %lease.tunnel_id,
                        attempt = attempt,
                        error = %e,
                        "Tunnel status check failed, retrying"
                    );
                    e.to_string()
                }
            };

            if let Some(max) = self.config.max_attempts {
                if attempt >= max {
                    error!(
                        tunnel_id = %lease.tunnel_id,
                        attempt = attempt,
                        "Tunnel drain gave up after max attempts"
                    );
                    return Err(DrainError::AttemptsExhausted {
                        tunnel_id: lease.tunnel_id.clone(),
                        attempts: attempt,
                        last,
                    });
                }
            }

            tokio::time::sleep(self.config.interval).await;
        }
    }
}
