use std::{path::PathBuf, sync::Arc};

use aetherport::{
    beacon::{run_beacon_egress, run_beacon_ingress, BeaconServer},
    peer::PeerTransport,
    proxy::{EgressProxy, IngressProxy},
    signal::SignalTty,
    Endpoint, EndpointAuthorizer,
};
use aetherport_identity::{
    certificate_from_pem, certificate_to_pem, ed25519_private_key_from_pem, ed25519_private_key_to_pem, generate_ca,
    generate_leaf, re_sign, x25519_private_key_from_pem, x25519_private_key_to_pem, CaPool, Certificate, Identity, Label,
};
use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(name = "aetherport", version, about = "peer-to-peer TCP tunnels over WebRTC")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a tunnel proxy (egress with --forward, ingress with --allow).
    Proxy(ProxyArgs),
    /// Run the beacon rendezvous server.
    Signal(SignalArgs),
    /// Generate and re-sign certificates.
    #[command(subcommand)]
    Cert(CertCommand),
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SignalType {
    /// Exchange SDP manually through the terminal.
    Tty,
    /// Rendezvous through a beacon server.
    Beacon,
}

#[derive(Args)]
pub struct ProxyArgs {
    /// Local to remote endpoint mappings.
    #[arg(short = 'f', long = "forward", value_name = "LOCAL-IP:LOCAL-PORT:REMOTE-IP:REMOTE-PORT")]
    pub forwards: Vec<String>,

    /// Remote endpoints the egress is allowed to reach through this ingress.
    #[arg(short = 'w', long = "allow", value_name = "IP:PORT")]
    pub allows: Vec<String>,

    #[arg(short = 't', long = "signal-type", value_enum, default_value = "tty")]
    pub signal_type: SignalType,

    /// Beacon URL used by the ingress to register itself.
    #[arg(long = "beacon-base-url")]
    pub beacon_base_url: Option<String>,

    /// Beacon ingress URL used by the egress to attach.
    #[arg(long = "beacon-ingress-url")]
    pub beacon_ingress_url: Option<String>,

    /// Path to the private key. Not used with tty signalling.
    #[arg(long = "key")]
    pub key_file: Option<PathBuf>,

    /// Path to the certificate. Not used with tty signalling.
    #[arg(long = "cert")]
    pub cert_file: Option<PathBuf>,

    /// Path to one or more concatenated trusted CA certificates.
    #[arg(long = "cacert")]
    pub ca_cert_file: Option<PathBuf>,

    /// ICE servers to use for address discovery.
    #[arg(long = "ice-server", value_name = "[stun|stuns|turn|turns]://<host>:<port>")]
    pub ice_servers: Vec<String>,
}

#[derive(Args)]
pub struct SignalArgs {
    #[arg(short = 'l', long = "listen-addr", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,
}

#[derive(Subcommand)]
pub enum CertCommand {
    /// Generate a leaf certificate, creating a default CA if none exists.
    Generate(GenerateArgs),
    /// Generate a self-signed CA certificate.
    GenerateCa(GenerateCaArgs),
    /// Re-sign an existing certificate with a fresh validity window.
    ReSign(ReSignArgs),
}

#[derive(Args)]
pub struct GenerateArgs {
    /// Where to save the private key; defaults to <name>-key.pem.
    #[arg(long = "key")]
    pub key_file: Option<PathBuf>,
    /// Where to save the certificate; defaults to <name>-cert.pem.
    #[arg(long = "cert")]
    pub cert_file: Option<PathBuf>,
    #[arg(long = "cakey", default_value = "cakey.pem")]
    pub ca_key_file: PathBuf,
    #[arg(long = "cacert", default_value = "cacert.pem")]
    pub ca_cert_file: PathBuf,

    /// The name represented by this certificate.
    #[arg(long)]
    pub name: String,
    /// Arbitrary key=value labels.
    #[arg(long = "label")]
    pub labels: Vec<String>,
    /// Validity, e.g. 30m, 24h, 365d. Defaults to the CA's remaining lifetime.
    #[arg(long)]
    pub duration: Option<String>,
}

#[derive(Args)]
pub struct GenerateCaArgs {
    #[arg(long = "cakey", default_value = "cakey.pem")]
    pub ca_key_file: PathBuf,
    #[arg(long = "cacert", default_value = "cacert.pem")]
    pub ca_cert_file: PathBuf,

    /// The name represented by this certificate.
    #[arg(long)]
    pub name: String,
    #[arg(long = "label")]
    pub labels: Vec<String>,
    /// Validity, e.g. 8760h.
    #[arg(long, default_value = "8760h")]
    pub duration: String,
}

#[derive(Args)]
pub struct ReSignArgs {
    #[arg(long = "cert", default_value = "cert.pem")]
    pub cert_file: PathBuf,
    #[arg(long = "cakey", default_value = "cakey.pem")]
    pub ca_key_file: PathBuf,
    #[arg(long = "cacert", default_value = "cacert.pem")]
    pub ca_cert_file: PathBuf,

    /// New validity; defaults to the certificate's previous lifetime.
    #[arg(long)]
    pub duration: Option<String>,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Proxy(args) => run_proxy(args).await,
        Command::Signal(args) => run_signal(args).await,
        Command::Cert(command) => run_cert(command),
    }
}

async fn run_proxy(args: ProxyArgs) -> anyhow::Result<()> {
    match args.signal_type {
        SignalType::Tty => run_proxy_tty(args).await,
        SignalType::Beacon => run_proxy_beacon(args).await,
    }
}

async fn run_proxy_tty(args: ProxyArgs) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    let peer = PeerTransport::new(&args.ice_servers).await?;

    if !args.allows.is_empty() {
        let proxy = IngressProxy::new(SignalTty::new(), peer, EndpointAuthorizer::new(args.allows));
        proxy.run(token).await.context("ingress proxy failed")?;
    } else if !args.forwards.is_empty() {
        let proxy = EgressProxy::new(SignalTty::new(), peer, parse_endpoints(&args.forwards)?);
        proxy.run(token).await.context("egress proxy failed")?;
    } else {
        bail!("either specify --forward or --allow");
    }

    Ok(())
}

async fn run_proxy_beacon(args: ProxyArgs) -> anyhow::Result<()> {
    let identity = Arc::new(load_identity(&args)?);
    let token = CancellationToken::new();

    let mut tasks = tokio::task::JoinSet::new();
    if !args.allows.is_empty() {
        let base_url = args
            .beacon_base_url
            .clone()
            .context("--beacon-base-url is required to run a beacon ingress")?;
        let identity = Arc::clone(&identity);
        let authorizer = EndpointAuthorizer::new(args.allows.clone());
        let ice_servers = args.ice_servers.clone();
        let token = token.child_token();
        tasks.spawn(async move {
            run_beacon_ingress(&base_url, identity, authorizer, ice_servers, token)
                .await
                .context("beacon ingress failed")
        });
    }
    if !args.forwards.is_empty() {
        let ingress_url = args
            .beacon_ingress_url
            .clone()
            .context("--beacon-ingress-url is required to run a beacon egress")?;
        let identity = Arc::clone(&identity);
        let endpoints = parse_endpoints(&args.forwards)?;
        let ice_servers = args.ice_servers.clone();
        let token = token.child_token();
        tasks.spawn(async move {
            run_beacon_egress(&ingress_url, identity, endpoints, ice_servers, token)
                .await
                .context("beacon egress failed")
        });
    }
    if tasks.is_empty() {
        bail!("either specify --forward or --allow");
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(error) = result? {
            warn!("{error:#}");
        }
    }
    Ok(())
}

async fn run_signal(args: SignalArgs) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("cannot listen on {}", args.listen_addr))?;
    BeaconServer::new().serve(listener).await?;
    Ok(())
}

fn run_cert(command: CertCommand) -> anyhow::Result<()> {
    match command {
        CertCommand::GenerateCa(args) => generate_ca_files(&args),
        CertCommand::Generate(args) => generate_leaf_files(&args),
        CertCommand::ReSign(args) => re_sign_files(&args),
    }
}

fn generate_ca_files(args: &GenerateCaArgs) -> anyhow::Result<()> {
    let duration = parse_duration(&args.duration)?;
    let (key, cert) = generate_ca(&args.name, parse_labels(&args.labels)?, Utc::now(), duration)?;

    write_new(&args.ca_key_file, ed25519_private_key_to_pem(&key))?;
    write_new(&args.ca_cert_file, certificate_to_pem(&cert)?)?;
    Ok(())
}

fn generate_leaf_files(args: &GenerateArgs) -> anyhow::Result<()> {
    if !args.ca_key_file.exists() && !args.ca_cert_file.exists() {
        generate_ca_files(&GenerateCaArgs {
            ca_key_file: args.ca_key_file.clone(),
            ca_cert_file: args.ca_cert_file.clone(),
            name: "aetherport.ca".to_string(),
            labels: Vec::new(),
            duration: "8760h".to_string(),
        })?;
    }

    let (ca_key, ca_cert) = load_ca(&args.ca_key_file, &args.ca_cert_file)?;

    let now = Utc::now();
    let duration = match &args.duration {
        Some(duration) => parse_duration(duration)?,
        None => ca_cert.details.not_after - now - chrono::Duration::seconds(1),
    };
    let (key, cert) = generate_leaf(&args.name, parse_labels(&args.labels)?, now, duration, &ca_key, &ca_cert)?;

    let key_file = args.key_file.clone().unwrap_or_else(|| format!("{}-key.pem", args.name).into());
    let cert_file = args.cert_file.clone().unwrap_or_else(|| format!("{}-cert.pem", args.name).into());
    write_new(&key_file, x25519_private_key_to_pem(&key))?;
    write_new(&cert_file, certificate_to_pem(&cert)?)?;
    Ok(())
}

fn re_sign_files(args: &ReSignArgs) -> anyhow::Result<()> {
    let (ca_key, ca_cert) = load_ca(&args.ca_key_file, &args.ca_cert_file)?;

    let pem = std::fs::read(&args.cert_file).with_context(|| format!("open {} failed", args.cert_file.display()))?;
    let (cert, _) = certificate_from_pem(&pem)?;

    let duration = args.duration.as_deref().map(parse_duration).transpose()?;
    let renewed = re_sign(&cert, Utc::now(), duration, &ca_key, &ca_cert)?;

    std::fs::write(&args.cert_file, certificate_to_pem(&renewed)?)
        .with_context(|| format!("write {} failed", args.cert_file.display()))?;
    Ok(())
}

fn load_ca(key_file: &PathBuf, cert_file: &PathBuf) -> anyhow::Result<(Vec<u8>, Certificate)> {
    let pem = std::fs::read(key_file).with_context(|| format!("open CA key {} failed", key_file.display()))?;
    let (key, _) = ed25519_private_key_from_pem(&pem)?;

    let pem = std::fs::read(cert_file).with_context(|| format!("open CA certificate {} failed", cert_file.display()))?;
    let (cert, _) = certificate_from_pem(&pem)?;

    Ok((key, cert))
}

fn load_identity(args: &ProxyArgs) -> anyhow::Result<Identity> {
    let key_file = args.key_file.as_ref().context("--key is required for beacon signalling")?;
    let cert_file = args.cert_file.as_ref().context("--cert is required for beacon signalling")?;
    let ca_cert_file = args.ca_cert_file.as_ref().context("--cacert is required for beacon signalling")?;

    let pem = std::fs::read(key_file).with_context(|| format!("open private key {} failed", key_file.display()))?;
    let (key, _) = x25519_private_key_from_pem(&pem)?;

    let pem = std::fs::read(cert_file).with_context(|| format!("open certificate {} failed", cert_file.display()))?;
    let (cert, _) = certificate_from_pem(&pem)?;
    cert.verify_private_key(&key)?;

    let pem = std::fs::read(ca_cert_file).with_context(|| format!("open CA bundle {} failed", ca_cert_file.display()))?;
    let (pool, expired) = CaPool::from_pem(&pem)?;
    for fingerprint in expired {
        warn!("trusted CA {fingerprint} is expired; peers signed by it will be rejected");
    }

    Ok(Identity::new(key, cert, Arc::new(pool))?)
}

fn parse_endpoints(specs: &[String]) -> anyhow::Result<Vec<Endpoint>> {
    specs
        .iter()
        .map(|spec| spec.parse::<Endpoint>().map_err(Into::into))
        .collect()
}

fn parse_labels(labels: &[String]) -> anyhow::Result<Vec<Label>> {
    labels
        .iter()
        .map(|label| label.parse::<Label>().map_err(Into::into))
        .collect()
}

/// Parses durations of the form `90s`, `30m`, `24h` or `365d`.
fn parse_duration(s: &str) -> anyhow::Result<chrono::Duration> {
    let s = s.trim();
    let (value, unit) = s.split_at(s.len().saturating_sub(1));
    let value: i64 = value.parse().with_context(|| format!("invalid duration: {s}"))?;

    match unit {
        "s" => Ok(chrono::Duration::seconds(value)),
        "m" => Ok(chrono::Duration::minutes(value)),
        "h" => Ok(chrono::Duration::hours(value)),
        "d" => Ok(chrono::Duration::days(value)),
        _ => bail!("invalid duration unit in {s}, expected one of s, m, h, d"),
    }
}

fn write_new(path: &PathBuf, contents: String) -> anyhow::Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("preparing {} for writing failed", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("writing {} failed", path.display()))?;
    Ok(())
}
