//! SSH host certificate authority
//!
//! One Ed25519 signing authority is generated per deployment. Every node's
//! host key is signed into a certificate scoped to the names a client may use
//! to reach it, so clients trust the CA instead of individual keys.
//!
//! # Security Model
//!
//! - The CA private key only leaves memory for the duration of one signing
//!   operation, inside an [`EphemeralKeyDir`] that is removed on every exit path
//! - Certificates are long-lived but bounded (520 weeks by default)
//! - A node is never provisioned with an unsigned or mismatched host key:
//!   every certificate is parsed and checked against its request before use
//! - Rotation issues a new certificate; nothing is re-signed in place

mod ephemeral;
mod signer;

pub use ephemeral::EphemeralKeyDir;
pub use signer::{InProcessSigner, SshKeygenSigner};

use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use ssh_key::certificate::CertType;
use ssh_key::{Algorithm, Certificate, HashAlg, LineEnding, PrivateKey, PublicKey};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::topology::NodeIdentity;

/// Default certificate validity: 520 weeks (about 10 years)
pub const DEFAULT_VALIDITY_WEEKS: u32 = 520;

/// Signing errors
#[derive(Debug, Error)]
pub enum SigningError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// A key could not be parsed or encoded
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A principal cannot be represented in a certificate
    #[error("invalid principal '{0}'")]
    InvalidPrincipal(String),

    /// The external signing command failed
    #[error("signing '{key_id}' failed: {message}")]
    CommandFailed {
        /// Certificate identity being signed
        key_id: String,
        /// Diagnostic output
        message: String,
    },

    /// The signer succeeded but produced no certificate
    #[error("signing '{key_id}' produced no certificate")]
    EmptyOutput {
        /// Certificate identity being signed
        key_id: String,
    },

    /// The produced certificate could not be parsed
    #[error("certificate parsing error: {0}")]
    Parse(String),

    /// The produced certificate does not match the request
    #[error("certificate for '{key_id}' does not match request: {reason}")]
    Mismatch {
        /// Certificate identity being signed
        key_id: String,
        /// What differed
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether each node gets its own host key or all nodes share one
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostKeyMode {
    /// One host key and certificate per node
    #[default]
    PerNode,
    /// A single host key and certificate distributed to every node
    ///
    /// Only appropriate when clients tolerate the same host identity behind
    /// every load-balanced entry point.
    Shared,
}

/// How clients come to trust node host keys
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostTrustMode {
    /// Host keys are signed by the deployment CA
    #[default]
    CertificateAuthority,
    /// Raw host public keys are pinned in known_hosts
    RawKeys,
}

/// The deployment's certificate authority
pub struct SigningAuthority {
    key: PrivateKey,
    public_openssh: String,
}

impl SigningAuthority {
    /// Generate a new Ed25519 authority
    pub fn generate() -> Result<Self, SigningError> {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| SigningError::KeyGeneration(format!("failed to generate CA key: {}", e)))?;
        let authority = Self::from_private_key(key)?;
        info!(fingerprint = %authority.fingerprint(), "Generated SSH certificate authority");
        Ok(authority)
    }

    /// Load an authority from an OpenSSH private key
    pub fn from_openssh(private_key: &str) -> Result<Self, SigningError> {
        let key = PrivateKey::from_openssh(private_key)
            .map_err(|e| SigningError::InvalidKey(format!("failed to parse CA key: {}", e)))?;
        Self::from_private_key(key)
    }

    fn from_private_key(key: PrivateKey) -> Result<Self, SigningError> {
        let public_openssh = key
            .public_key()
            .to_openssh()
            .map_err(|e| SigningError::InvalidKey(format!("failed to encode CA public key: {}", e)))?;
        Ok(Self {
            key,
            public_openssh,
        })
    }

    /// CA public key in OpenSSH format (for known_hosts distribution)
    pub fn public_key_openssh(&self) -> &str {
        &self.public_openssh
    }

    /// CA private key in OpenSSH format
    pub fn private_key_openssh(&self) -> Result<Zeroizing<String>, SigningError> {
        self.key
            .to_openssh(LineEnding::LF)
            .map_err(|e| SigningError::InvalidKey(format!("failed to encode CA key: {}", e)))
    }

    /// SHA-256 fingerprint of the CA public key
    pub fn fingerprint(&self) -> String {
        self.key.public_key().fingerprint(HashAlg::Sha256).to_string()
    }

    pub(crate) fn private_key(&self) -> &PrivateKey {
        &self.key
    }

    pub(crate) fn public_key(&self) -> &PublicKey {
        self.key.public_key()
    }
}

impl fmt::Debug for SigningAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never expose the private key
        f.debug_struct("SigningAuthority")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// A host key pair in OpenSSH encoding
#[derive(Clone)]
pub struct HostKeyPair {
    private_openssh: Zeroizing<String>,
    public_openssh: String,
}

impl HostKeyPair {
    /// Generate a new Ed25519 host key
    pub fn generate() -> Result<Self, SigningError> {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(|e| {
            SigningError::KeyGeneration(format!("failed to generate host key: {}", e))
        })?;
        let private_openssh = key
            .to_openssh(LineEnding::LF)
            .map_err(|e| SigningError::InvalidKey(format!("failed to encode host key: {}", e)))?;
        let public_openssh = key.public_key().to_openssh().map_err(|e| {
            SigningError::InvalidKey(format!("failed to encode host public key: {}", e))
        })?;
        Ok(Self {
            private_openssh,
            public_openssh,
        })
    }

    /// Private key (goes into node bootstrap only)
    pub fn private_key_openssh(&self) -> &str {
        &self.private_openssh
    }

    /// Public key
    pub fn public_key_openssh(&self) -> &str {
        &self.public_openssh
    }
}

impl fmt::Debug for HostKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKeyPair")
            .field("public", &self.public_openssh)
            .finish_non_exhaustive()
    }
}

/// Ordered, de-duplicated set of names a certificate is valid for
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principals(Vec<String>);

impl Principals {
    /// Principals for one node: public names, private IP, short hostname
    ///
    /// `public_names` are the tunnel hostnames clients dial (bastion alias,
    /// the node's own routed hostname).
    pub fn for_node(node: &NodeIdentity, public_names: &[String]) -> Self {
        let mut principals = Self::default();
        for name in public_names {
            principals.push(name.as_str());
        }
        principals.push(node.ip.to_string());
        principals.push(node.hostname.as_str());
        principals
    }

    /// Union of every node's principals, for a shared host key
    pub fn for_nodes<'a>(
        nodes: impl IntoIterator<Item = &'a NodeIdentity>,
        public_names: &[String],
    ) -> Self {
        let mut principals = Self::default();
        for name in public_names {
            principals.push(name.as_str());
        }
        for node in nodes {
            principals.push(node.ip.to_string());
            principals.push(node.hostname.as_str());
        }
        principals
    }

    /// Append a principal unless already present
    pub fn push(&mut self, principal: impl Into<String>) {
        let principal = principal.into();
        if !self.0.contains(&principal) {
            self.0.push(principal);
        }
    }

    /// Whether `principal` is in the set
    pub fn contains(&self, principal: &str) -> bool {
        self.0.iter().any(|p| p == principal)
    }

    /// Principals in insertion order
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Comma-separated form used by `ssh-keygen -n`
    pub fn to_csv(&self) -> String {
        self.0.join(",")
    }

    fn validate(&self) -> Result<(), SigningError> {
        if self.0.is_empty() {
            return Err(SigningError::InvalidPrincipal(String::new()));
        }
        for principal in &self.0 {
            if principal.is_empty()
                || principal.contains(',')
                || principal.chars().any(|c| c.is_whitespace() || c.is_control())
            {
                return Err(SigningError::InvalidPrincipal(principal.clone()));
            }
        }
        Ok(())
    }
}

/// Certificate validity, counted from the moment of signing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validity {
    /// Validity in weeks
    pub weeks: u32,
}

impl Default for Validity {
    fn default() -> Self {
        Self {
            weeks: DEFAULT_VALIDITY_WEEKS,
        }
    }
}

impl Validity {
    /// Validity of the given number of weeks
    pub fn weeks(weeks: u32) -> Self {
        Self { weeks }
    }

    /// `ssh-keygen -V` argument, e.g. `+520w`
    pub fn keygen_arg(&self) -> String {
        format!("+{}w", self.weeks)
    }

    /// Validity window in unix seconds starting at `now`
    pub fn window_from(&self, now: u64) -> (u64, u64) {
        (now, now.saturating_add(u64::from(self.weeks) * 7 * 24 * 60 * 60))
    }
}

/// Everything a signer needs besides the authority
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningRequest {
    /// Certificate identity (`-I`)
    pub key_id: String,
    /// Host public key to sign, OpenSSH format
    pub host_public_key: String,
    /// Names the certificate is valid for
    pub principals: Principals,
    /// Validity window
    pub validity: Validity,
}

/// Trait for turning a host public key into a host certificate
///
/// Implementations return the certificate in OpenSSH format. Each call must
/// use its own scratch storage; concurrent calls never share key files.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostKeySigner: Send + Sync {
    /// Sign the request with the authority
    async fn sign(
        &self,
        authority: &SigningAuthority,
        request: &SigningRequest,
    ) -> Result<String, SigningError>;
}

/// A parsed host certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostCertificate {
    /// Certificate identity
    pub key_id: String,
    /// Names the certificate is valid for
    pub principals: Vec<String>,
    /// Start of validity, unix seconds
    pub valid_after: u64,
    /// End of validity, unix seconds
    pub valid_before: u64,
    /// Certificate in OpenSSH format
    pub openssh: String,
}

impl HostCertificate {
    /// Parse a signer's output and check it against the request
    ///
    /// Checks that the certificate is a host certificate for the requested
    /// key, carries a valid signature from `authority`, and has the requested
    /// identity and exactly the requested principals.
    pub fn verify(
        output: &str,
        request: &SigningRequest,
        authority: &SigningAuthority,
    ) -> Result<Self, SigningError> {
        let openssh = output.trim();
        if openssh.is_empty() {
            return Err(SigningError::EmptyOutput {
                key_id: request.key_id.clone(),
            });
        }

        let cert = Certificate::from_openssh(openssh)
            .map_err(|e| SigningError::Parse(format!("failed to parse certificate: {}", e)))?;
        let host_key = PublicKey::from_openssh(&request.host_public_key)
            .map_err(|e| SigningError::InvalidKey(format!("failed to parse host key: {}", e)))?;

        let mismatch = |reason: &str| SigningError::Mismatch {
            key_id: request.key_id.clone(),
            reason: reason.to_string(),
        };

        if cert.cert_type() != CertType::Host {
            return Err(mismatch("not a host certificate"));
        }
        if cert.public_key() != host_key.key_data() {
            return Err(mismatch("certified key differs from host key"));
        }
        if cert.signature_key() != authority.public_key().key_data() {
            return Err(mismatch("signed by a different authority"));
        }
        if cert.key_id() != request.key_id {
            return Err(mismatch("key id differs"));
        }
        let ca_fingerprint = authority.public_key().fingerprint(HashAlg::Sha256);
        cert.validate_at(cert.valid_after(), [&ca_fingerprint])
            .map_err(|_| mismatch("signature does not verify against the authority"))?;

        let mut expected = request.principals.as_slice().to_vec();
        let mut actual = cert.valid_principals().to_vec();
        expected.sort();
        actual.sort();
        if expected != actual {
            return Err(mismatch("principals differ"));
        }

        Ok(Self {
            key_id: cert.key_id().to_string(),
            principals: cert.valid_principals().to_vec(),
            valid_after: cert.valid_after(),
            valid_before: cert.valid_before(),
            openssh: openssh.to_string(),
        })
    }
}

/// A host key together with its verified certificate
#[derive(Clone, Debug)]
pub struct IssuedHostIdentity {
    /// Certificate identity
    pub key_id: String,
    /// Host key pair
    pub host_key: HostKeyPair,
    /// Verified certificate
    pub certificate: HostCertificate,
}

/// Issues host certificates from one authority through one signer
pub struct CertificateIssuer<'a, S: HostKeySigner + ?Sized> {
    authority: &'a SigningAuthority,
    signer: &'a S,
    validity: Validity,
}

impl<'a, S: HostKeySigner + ?Sized> CertificateIssuer<'a, S> {
    /// Create an issuer
    pub fn new(authority: &'a SigningAuthority, signer: &'a S, validity: Validity) -> Self {
        Self {
            authority,
            signer,
            validity,
        }
    }

    /// Sign an existing host key
    pub async fn issue(
        &self,
        key_id: &str,
        host_key: &HostKeyPair,
        principals: Principals,
    ) -> Result<HostCertificate, SigningError> {
        principals.validate()?;

        let request = SigningRequest {
            key_id: key_id.to_string(),
            host_public_key: host_key.public_key_openssh().to_string(),
            principals,
            validity: self.validity,
        };

        debug!(key_id = %key_id, principals = %request.principals.to_csv(), "Signing host key");
        let output = self.signer.sign(self.authority, &request).await?;
        let certificate = HostCertificate::verify(&output, &request, self.authority)?;
        info!(key_id = %key_id, "Issued host certificate");
        Ok(certificate)
    }

    /// Generate a host key for `node` and sign it
    pub async fn issue_for_node(
        &self,
        node: &NodeIdentity,
        public_names: &[String],
    ) -> Result<IssuedHostIdentity, SigningError> {
        let host_key = HostKeyPair::generate()?;
        let certificate = self
            .issue(&node.hostname, &host_key, Principals::for_node(node, public_names))
            .await?;
        Ok(IssuedHostIdentity {
            key_id: node.hostname.clone(),
            host_key,
            certificate,
        })
    }

    /// Generate one host key valid for every node and sign it
    pub async fn issue_shared(
        &self,
        key_id: &str,
        nodes: &[NodeIdentity],
        public_names: &[String],
    ) -> Result<IssuedHostIdentity, SigningError> {
        let host_key = HostKeyPair::generate()?;
        let certificate = self
            .issue(key_id, &host_key, Principals::for_nodes(nodes, public_names))
            .await?;
        Ok(IssuedHostIdentity {
            key_id: key_id.to_string(),
            host_key,
            certificate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::allocate;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn issuer_parts() -> (SigningAuthority, InProcessSigner) {
        (SigningAuthority::generate().unwrap(), InProcessSigner::new())
    }

    #[test]
    fn authority_debug_redacts_private_key() {
        let authority = SigningAuthority::generate().unwrap();
        let debug = format!("{:?}", authority);
        assert!(debug.contains("SHA256:"));
        assert!(!debug.contains("PRIVATE KEY"));
        assert!(authority.public_key_openssh().starts_with("ssh-ed25519 "));
    }

    #[test]
    fn authority_round_trips_through_openssh() {
        let authority = SigningAuthority::generate().unwrap();
        let pem = authority.private_key_openssh().unwrap();
        let restored = SigningAuthority::from_openssh(&pem).unwrap();
        assert_eq!(authority.public_key_openssh(), restored.public_key_openssh());
    }

    #[test]
    fn invalid_authority_key_rejected() {
        assert!(matches!(
            SigningAuthority::from_openssh("not a key"),
            Err(SigningError::InvalidKey(_))
        ));
    }

    #[test]
    fn principals_cover_every_reachable_name() {
        let nodes = allocate("worker", 2, 20).unwrap();
        let principals = Principals::for_node(
            &nodes[0],
            &names(&["ssh.example.com", "worker-00-ssh.example.com"]),
        );
        assert_eq!(
            principals.as_slice(),
            [
                "ssh.example.com",
                "worker-00-ssh.example.com",
                "10.0.1.20",
                "worker-00"
            ]
        );
        assert_eq!(
            principals.to_csv(),
            "ssh.example.com,worker-00-ssh.example.com,10.0.1.20,worker-00"
        );

        let without_bastion = Principals::for_node(&nodes[1], &[]);
        assert_eq!(without_bastion.as_slice(), ["10.0.1.21", "worker-01"]);
    }

    #[test]
    fn shared_principals_are_the_union() {
        let nodes = allocate("worker", 2, 20).unwrap();
        let principals = Principals::for_nodes(&nodes, &names(&["ssh.example.com"]));
        assert_eq!(principals.as_slice().len(), 5);
        for node in &nodes {
            assert!(principals.contains(&node.ip.to_string()));
            assert!(principals.contains(&node.hostname));
        }
    }

    #[test]
    fn principals_are_deduplicated() {
        let mut principals = Principals::default();
        principals.push("a");
        principals.push("a");
        assert_eq!(principals.as_slice(), ["a"]);
    }

    #[test]
    fn validity_formats_for_ssh_keygen() {
        assert_eq!(Validity::default().keygen_arg(), "+520w");
        assert_eq!(Validity::weeks(1).window_from(100), (100, 100 + 604_800));
    }

    #[tokio::test]
    async fn in_process_signing_produces_verified_certificate() {
        let (authority, signer) = issuer_parts();
        let issuer = CertificateIssuer::new(&authority, &signer, Validity::default());
        let node = &allocate("worker", 1, 20).unwrap()[0];

        let issued = issuer
            .issue_for_node(node, &names(&["ssh.example.com"]))
            .await
            .unwrap();

        assert_eq!(issued.key_id, "worker-00");
        assert!(issued.certificate.openssh.starts_with("ssh-ed25519-cert-v01@openssh.com "));
        assert!(issued.certificate.principals.contains(&"10.0.1.20".to_string()));
        assert!(issued.certificate.principals.contains(&"worker-00".to_string()));
        assert!(issued.certificate.principals.contains(&"ssh.example.com".to_string()));
        assert_eq!(
            issued.certificate.valid_before - issued.certificate.valid_after,
            520 * 7 * 24 * 60 * 60
        );
    }

    #[tokio::test]
    async fn empty_signer_output_is_fatal() {
        let authority = SigningAuthority::generate().unwrap();
        let mut signer = MockHostKeySigner::new();
        signer.expect_sign().returning(|_, _| Ok(String::new()));

        let issuer = CertificateIssuer::new(&authority, &signer, Validity::default());
        let node = &allocate("worker", 1, 20).unwrap()[0];
        let result = issuer.issue_for_node(node, &[]).await;

        assert!(matches!(result, Err(SigningError::EmptyOutput { key_id }) if key_id == "worker-00"));
    }

    #[tokio::test]
    async fn signer_failure_is_propagated() {
        let authority = SigningAuthority::generate().unwrap();
        let mut signer = MockHostKeySigner::new();
        signer.expect_sign().times(1).returning(|_, request| {
            Err(SigningError::CommandFailed {
                key_id: request.key_id.clone(),
                message: "boom".to_string(),
            })
        });

        let issuer = CertificateIssuer::new(&authority, &signer, Validity::default());
        let node = &allocate("ctrl", 1, 10).unwrap()[0];
        assert!(matches!(
            issuer.issue_for_node(node, &[]).await,
            Err(SigningError::CommandFailed { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_principals_never_reach_the_signer() {
        let authority = SigningAuthority::generate().unwrap();
        let mut signer = MockHostKeySigner::new();
        signer.expect_sign().times(0);

        let issuer = CertificateIssuer::new(&authority, &signer, Validity::default());
        let host_key = HostKeyPair::generate().unwrap();
        let mut principals = Principals::default();
        principals.push("a,b");

        assert!(matches!(
            issuer.issue("bad", &host_key, principals).await,
            Err(SigningError::InvalidPrincipal(p)) if p == "a,b"
        ));
    }

    // ==========================================================================
    // Story Tests: Mismatched Certificates Never Reach a Node
    // ==========================================================================

    /// Story: a certificate for another host key is rejected
    #[tokio::test]
    async fn story_certificate_for_wrong_key_is_rejected() {
        let (authority, signer) = issuer_parts();
        let other_key = HostKeyPair::generate().unwrap();
        let node = &allocate("worker", 1, 20).unwrap()[0];
        let principals = Principals::for_node(node, &[]);

        // Sign a different key than the one being requested
        let wrong = signer
            .sign(
                &authority,
                &SigningRequest {
                    key_id: "worker-00".to_string(),
                    host_public_key: other_key.public_key_openssh().to_string(),
                    principals: principals.clone(),
                    validity: Validity::default(),
                },
            )
            .await
            .unwrap();

        let mut mock = MockHostKeySigner::new();
        mock.expect_sign().returning(move |_, _| Ok(wrong.clone()));

        let issuer = CertificateIssuer::new(&authority, &mock, Validity::default());
        let host_key = HostKeyPair::generate().unwrap();
        let result = issuer.issue("worker-00", &host_key, principals).await;

        assert!(matches!(
            result,
            Err(SigningError::Mismatch { reason, .. }) if reason.contains("host key")
        ));
    }

    /// Story: a certificate from a rogue authority is rejected
    #[tokio::test]
    async fn story_certificate_from_other_authority_is_rejected() {
        let (legitimate, signer) = issuer_parts();
        let rogue = SigningAuthority::generate().unwrap();
        let host_key = HostKeyPair::generate().unwrap();
        let node = &allocate("worker", 1, 20).unwrap()[0];

        let request = SigningRequest {
            key_id: "worker-00".to_string(),
            host_public_key: host_key.public_key_openssh().to_string(),
            principals: Principals::for_node(node, &[]),
            validity: Validity::default(),
        };
        let forged = signer.sign(&rogue, &request).await.unwrap();

        let result = HostCertificate::verify(&forged, &request, &legitimate);
        assert!(matches!(
            result,
            Err(SigningError::Mismatch { reason, .. }) if reason.contains("authority")
        ));
    }

    /// Story: dropping a principal breaks verification before provisioning
    #[tokio::test]
    async fn story_missing_principal_is_rejected() {
        let (authority, signer) = issuer_parts();
        let host_key = HostKeyPair::generate().unwrap();
        let node = &allocate("worker", 1, 20).unwrap()[0];

        let mut request = SigningRequest {
            key_id: "worker-00".to_string(),
            host_public_key: host_key.public_key_openssh().to_string(),
            principals: Principals::for_node(node, &[]),
            validity: Validity::default(),
        };
        let cert = signer.sign(&authority, &request).await.unwrap();

        request.principals.push("ssh.example.com");
        let result = HostCertificate::verify(&cert, &request, &authority);
        assert!(matches!(
            result,
            Err(SigningError::Mismatch { reason, .. }) if reason.contains("principals")
        ));
    }

    /// Story: a certificate whose signature was altered is rejected
    #[tokio::test]
    async fn story_tampered_signature_is_rejected() {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let (authority, signer) = issuer_parts();
        let host_key = HostKeyPair::generate().unwrap();
        let node = &allocate("worker", 1, 20).unwrap()[0];
        let request = SigningRequest {
            key_id: "worker-00".to_string(),
            host_public_key: host_key.public_key_openssh().to_string(),
            principals: Principals::for_node(node, &[]),
            validity: Validity::default(),
        };
        let cert = signer.sign(&authority, &request).await.unwrap();
        assert!(HostCertificate::verify(&cert, &request, &authority).is_ok());

        // The signature is the last field of the blob
        let mut fields: Vec<String> = cert.split_whitespace().map(str::to_string).collect();
        let mut blob = STANDARD.decode(&fields[1]).unwrap();
        *blob.last_mut().unwrap() ^= 0x01;
        fields[1] = STANDARD.encode(&blob);
        let tampered = fields.join(" ");

        let result = HostCertificate::verify(&tampered, &request, &authority);
        assert!(
            matches!(
                result,
                Err(SigningError::Mismatch { ref reason, .. }) if reason.contains("signature")
            ) || matches!(result, Err(SigningError::Parse(_))),
            "{:?}",
            result
        );
    }

    #[tokio::test]
    async fn garbage_output_is_a_parse_error() {
        let authority = SigningAuthority::generate().unwrap();
        let host_key = HostKeyPair::generate().unwrap();
        let request = SigningRequest {
            key_id: "x".to_string(),
            host_public_key: host_key.public_key_openssh().to_string(),
            principals: Principals::default(),
            validity: Validity::default(),
        };
        assert!(matches!(
            HostCertificate::verify("ssh-ed25519-cert-v01@openssh.com garbage", &request, &authority),
            Err(SigningError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn shared_host_key_covers_every_node() {
        let (authority, signer) = issuer_parts();
        let issuer = CertificateIssuer::new(&authority, &signer, Validity::weeks(52));
        let nodes = allocate("worker", 3, 20).unwrap();

        let issued = issuer
            .issue_shared("cluster-shared", &nodes, &names(&["ssh.example.com"]))
            .await
            .unwrap();

        assert_eq!(issued.key_id, "cluster-shared");
        for node in &nodes {
            assert!(issued.certificate.principals.contains(&node.hostname));
            assert!(issued.certificate.principals.contains(&node.ip.to_string()));
        }
    }
}
