//! Outpost CLI - plan a tunnel-fronted cluster and gate tunnel teardown

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use outpost::config::DeploymentConfig;
use outpost::drain::{
    CloudflareTunnelApi, DrainConfig, DrainStrategy, TunnelDrainer, DEFAULT_API_BASE,
};
use outpost::pki::{HostKeySigner, HostTrustMode, InProcessSigner, SigningAuthority, SshKeygenSigner};
use outpost::plan::DeploymentPlan;
use outpost::topology::allocate_all;
use outpost::tunnel::{TunnelRecord, TunnelSecret};
use outpost::DEFAULT_LOG_FILTER;

/// Outpost - private cluster provisioning behind an outbound-only tunnel
#[derive(Parser, Debug)]
#[command(name = "outpost", version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the node topology a configuration allocates
    Topology(TopologyArgs),

    /// Build the deployment plan and write its artifacts
    ///
    /// Allocates nodes, issues host certificates, routes tunnel ingress and
    /// renders known_hosts plus per-node user-data.
    Plan(PlanArgs),

    /// Block until a tunnel carries no traffic
    ///
    /// Run this immediately before deleting the tunnel. Polls the tunnel
    /// status API until it reports the tunnel drained or already gone.
    Drain(DrainArgs),
}

/// Topology arguments
#[derive(Parser, Debug)]
struct TopologyArgs {
    /// Path to the deployment YAML configuration file
    #[arg(short = 'f', long = "config")]
    config_file: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SignerKind {
    /// Shell out to ssh-keygen
    SshKeygen,
    /// Sign in-process
    InProcess,
}

/// Plan arguments
#[derive(Parser, Debug)]
struct PlanArgs {
    /// Path to the deployment YAML configuration file
    #[arg(short = 'f', long = "config")]
    config_file: PathBuf,

    /// Output directory
    #[arg(short = 'o', long = "out", default_value = "outpost-plan")]
    out_dir: PathBuf,

    /// Tunnel the deployment routes through
    #[arg(long, env = "OUTPOST_TUNNEL_ID")]
    tunnel_id: String,

    /// Connector installation token embedded in user-data
    #[arg(long, env = "OUTPOST_TUNNEL_TOKEN", hide_env_values = true)]
    tunnel_token: String,

    /// Tunnel connector secret written to tunnel-credentials.json (generated when omitted)
    #[arg(long, env = "OUTPOST_TUNNEL_SECRET", hide_env_values = true)]
    tunnel_secret: Option<String>,

    /// OpenSSH private key of the host certificate authority
    ///
    /// Without it an ephemeral authority is generated for this run only.
    #[arg(long, env = "OUTPOST_CA_KEY_FILE")]
    ca_key: Option<PathBuf>,

    /// Certificate signer
    #[arg(long, value_enum, default_value_t = SignerKind::SshKeygen)]
    signer: SignerKind,

    /// ssh-keygen binary used by the ssh-keygen signer
    #[arg(long, default_value = "ssh-keygen")]
    ssh_keygen: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    /// Wait for status inactive or down
    Status,
    /// Wait for an empty connection list
    Connections,
}

impl From<StrategyArg> for DrainStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Status => DrainStrategy::Status,
            StrategyArg::Connections => DrainStrategy::ConnectionCount,
        }
    }
}

/// Drain arguments
#[derive(Parser, Debug)]
struct DrainArgs {
    /// Account owning the tunnel
    #[arg(long, env = "CLOUDFLARE_ACCOUNT_ID")]
    account_id: String,

    /// Tunnel to drain
    #[arg(long, env = "OUTPOST_TUNNEL_ID")]
    tunnel_id: String,

    /// Control-plane API token
    #[arg(long, env = "CLOUDFLARE_API_TOKEN", hide_env_values = true)]
    api_token: String,

    /// How "drained" is detected
    #[arg(long, value_enum, default_value_t = StrategyArg::Status)]
    strategy: StrategyArg,

    /// Seconds between status polls
    #[arg(long, default_value = "2")]
    interval_secs: u64,

    /// Give up after this many polls (default: never)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// API root
    #[arg(long, default_value = DEFAULT_API_BASE)]
    api_base: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output on stdout stays machine-readable
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    match cli.command {
        Commands::Topology(args) => run_topology(args),
        Commands::Plan(args) => run_plan(args).await,
        Commands::Drain(args) => run_drain(args).await,
    }
}

/// Print allocated nodes as JSON
fn run_topology(args: TopologyArgs) -> anyhow::Result<()> {
    let config = DeploymentConfig::load(&args.config_file)?;
    let nodes = allocate_all(&config.network.node_network(), &config.groups)?;
    println!("{}", serde_json::to_string_pretty(&nodes)?);
    Ok(())
}

/// Build and write the deployment plan
async fn run_plan(args: PlanArgs) -> anyhow::Result<()> {
    let config = DeploymentConfig::load(&args.config_file)?;

    let authority = match (config.host_trust, &args.ca_key) {
        (HostTrustMode::RawKeys, _) => None,
        (HostTrustMode::CertificateAuthority, Some(path)) => {
            let pem = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read CA key {:?}: {}", path, e))?;
            Some(SigningAuthority::from_openssh(&pem)?)
        }
        (HostTrustMode::CertificateAuthority, None) => {
            warn!("No --ca-key given; generating an ephemeral CA that is discarded after this run");
            Some(SigningAuthority::generate()?)
        }
    };

    let signer: Box<dyn HostKeySigner> = match args.signer {
        SignerKind::SshKeygen => Box::new(SshKeygenSigner::with_program(&args.ssh_keygen)),
        SignerKind::InProcess => Box::new(InProcessSigner::new()),
    };

    let secret = args
        .tunnel_secret
        .map(TunnelSecret::new)
        .unwrap_or_else(TunnelSecret::generate);
    let tunnel = TunnelRecord::new(config.account_id.clone(), args.tunnel_id, secret);

    let plan = DeploymentPlan::build(
        &config,
        &tunnel,
        &args.tunnel_token,
        authority.as_ref(),
        signer.as_ref(),
    )
    .await?;

    for path in plan.write_to(&args.out_dir)? {
        println!("{}", path.display());
    }
    Ok(())
}

/// Block until the tunnel is drained
async fn run_drain(args: DrainArgs) -> anyhow::Result<()> {
    let api = CloudflareTunnelApi::with_base_url(args.api_base)?;
    let config = DrainConfig {
        interval: Duration::from_secs(args.interval_secs),
        strategy: args.strategy.into(),
        max_attempts: args.max_attempts,
    };
    let drainer = TunnelDrainer::new(api, config);

    let tunnel = TunnelRecord::new(args.account_id, args.tunnel_id, TunnelSecret::new(""));
    let mut lease = drainer.acquire(&tunnel, args.api_token);
    info!(lease = %lease.id(), "Acquired drain lease");

    tokio::select! {
        result = drainer.release(&mut lease) => {
            let report = result?;
            println!(
                "tunnel {} drained after {} polls ({:?})",
                tunnel.tunnel_id,
                report.polls,
                report.reason
            );
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            anyhow::bail!("interrupted while draining tunnel {}", tunnel.tunnel_id)
        }
    }
}
