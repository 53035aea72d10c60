//! Host key signer implementations

use std::path::PathBuf;

use async_trait::async_trait;
use rand::rngs::OsRng;
use ssh_key::certificate::{Builder, CertType};
use ssh_key::PublicKey;
use tokio::process::Command;
use tracing::debug;

use super::{EphemeralKeyDir, HostKeySigner, SigningAuthority, SigningError, SigningRequest};

/// Signs through the `ssh-keygen` binary
///
/// Runs `ssh-keygen -s <ca> -I <id> -h -n <principals> -V +<n>w <host.pub>`
/// with an explicit argument vector. Key files live in an
/// [`EphemeralKeyDir`] that is removed however the call ends.
#[derive(Clone, Debug)]
pub struct SshKeygenSigner {
    program: PathBuf,
    work_root: Option<PathBuf>,
}

impl SshKeygenSigner {
    /// Use `ssh-keygen` from `PATH`
    pub fn new() -> Self {
        Self::with_program("ssh-keygen")
    }

    /// Use a specific `ssh-keygen` binary
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            work_root: None,
        }
    }

    /// Create scratch directories under `root` instead of the system temp dir
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    fn scratch_dir(&self) -> std::io::Result<EphemeralKeyDir> {
        match &self.work_root {
            Some(root) => EphemeralKeyDir::new_in(root),
            None => EphemeralKeyDir::new(),
        }
    }
}

impl Default for SshKeygenSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostKeySigner for SshKeygenSigner {
    async fn sign(
        &self,
        authority: &SigningAuthority,
        request: &SigningRequest,
    ) -> Result<String, SigningError> {
        let dir = self.scratch_dir()?;

        let ca_key = dir.write_secret("ca_key", &authority.private_key_openssh()?)?;
        dir.write_public("ca_key.pub", authority.public_key_openssh())?;
        let host_key = dir.write_public("host_key.pub", &request.host_public_key)?;

        debug!(
            key_id = %request.key_id,
            program = %self.program.display(),
            "Running ssh-keygen"
        );

        let output = Command::new(&self.program)
            .arg("-q")
            .arg("-s")
            .arg(&ca_key)
            .arg("-I")
            .arg(&request.key_id)
            .arg("-h")
            .arg("-n")
            .arg(request.principals.to_csv())
            .arg("-V")
            .arg(request.validity.keygen_arg())
            .arg(&host_key)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SigningError::CommandFailed {
                key_id: request.key_id.clone(),
                message: format!("failed to run {}: {}", self.program.display(), e),
            })?;

        if !output.status.success() {
            return Err(SigningError::CommandFailed {
                key_id: request.key_id.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let cert_path = dir.path().join("host_key-cert.pub");
        let certificate = match tokio::fs::read_to_string(&cert_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        dir.close();

        if certificate.trim().is_empty() {
            return Err(SigningError::EmptyOutput {
                key_id: request.key_id.clone(),
            });
        }
        Ok(certificate.trim().to_string())
    }
}

/// Signs in-process with the same semantics as [`SshKeygenSigner`]
///
/// The CA key never touches disk.
#[derive(Clone, Copy, Debug, Default)]
pub struct InProcessSigner;

impl InProcessSigner {
    /// Create a signer
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostKeySigner for InProcessSigner {
    async fn sign(
        &self,
        authority: &SigningAuthority,
        request: &SigningRequest,
    ) -> Result<String, SigningError> {
        let host_key = PublicKey::from_openssh(&request.host_public_key)
            .map_err(|e| SigningError::InvalidKey(format!("failed to parse host key: {}", e)))?;

        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let (valid_after, valid_before) = request.validity.window_from(now);

        let build_err = |e: ssh_key::Error| SigningError::CommandFailed {
            key_id: request.key_id.clone(),
            message: e.to_string(),
        };

        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            host_key.key_data().clone(),
            valid_after,
            valid_before,
        )
        .map_err(build_err)?;
        builder.key_id(&request.key_id).map_err(build_err)?;
        builder.cert_type(CertType::Host).map_err(build_err)?;
        for principal in request.principals.as_slice() {
            builder.valid_principal(principal).map_err(build_err)?;
        }

        let certificate = builder.sign(authority.private_key()).map_err(build_err)?;
        certificate
            .to_openssh()
            .map_err(|e| SigningError::Parse(format!("failed to encode certificate: {}", e)))
    }
}
