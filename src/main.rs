//! pvclone - PVC clone controller and upload proxy

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pvclone::controller::clone::{self, Context};
use pvclone::pki::{CertificateAuthority, FileCertBundleFetcher, FileCertFetcher};
use pvclone::proxy::{
    CertUploadClientCreator, CertWatcher, FileCertWatcher, KubePvcLookup, ProxyState, UploadProxy,
};
use pvclone::token::{TokenValidator, CLONE_TOKEN_ISSUER, TOKEN_LEEWAY};

/// pvclone - host-assisted PVC cloning and authenticated uploads
#[derive(Parser, Debug)]
#[command(name = "pvclone", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the clone controller
    Controller(ControllerArgs),

    /// Run the external upload proxy
    Proxy(ProxyArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Image the clone source worker pods run
    #[arg(long, env = "CLONER_IMAGE")]
    image: String,

    /// Pull policy for the worker image
    #[arg(long, env = "PULL_POLICY", default_value = "IfNotPresent")]
    pull_policy: String,

    /// Path to the apiserver's token-signing public key (PEM)
    #[arg(
        long,
        env = "APISERVER_PUBLIC_KEY",
        default_value = "/var/run/cdi/apiserver/key/id_rsa.pub"
    )]
    apiserver_public_key: PathBuf,

    /// Path to the CA certificate used to mint worker client certs (PEM)
    #[arg(long, env = "CLIENT_CA_CERT")]
    ca_cert: PathBuf,

    /// Path to the CA key used to mint worker client certs (PEM)
    #[arg(long, env = "CLIENT_CA_KEY")]
    ca_key: PathBuf,

    /// Path to the upload server CA bundle handed to workers (PEM)
    #[arg(long, env = "SERVER_CA_BUNDLE")]
    server_ca_bundle: PathBuf,
}

/// Proxy mode arguments
#[derive(Parser, Debug)]
struct ProxyArgs {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    bind_address: String,

    /// Listen port
    #[arg(long, default_value_t = pvclone::DEFAULT_PROXY_PORT)]
    bind_port: u16,

    /// Path to the apiserver's token-signing public key (PEM)
    #[arg(
        long,
        env = "APISERVER_PUBLIC_KEY",
        default_value = "/var/run/cdi/apiserver/key/id_rsa.pub"
    )]
    apiserver_public_key: PathBuf,

    /// Path to the upload client certificate presented upstream (PEM)
    #[arg(long, env = "UPLOAD_CLIENT_CERT")]
    client_cert: PathBuf,

    /// Path to the upload client key (PEM)
    #[arg(long, env = "UPLOAD_CLIENT_KEY")]
    client_key: PathBuf,

    /// Path to the upload server CA bundle (PEM)
    #[arg(long, env = "SERVER_CA_BUNDLE")]
    server_ca_bundle: PathBuf,

    /// Path to the serving certificate; plain HTTP when absent (test mode)
    #[arg(long, env = "PROXY_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Path to the serving key
    #[arg(long, env = "PROXY_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Controller(args) => run_controller(args).await,
        Commands::Proxy(args) => run_proxy(args).await,
    }
}

/// Run the clone controller until shutdown
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("clone controller starting...");

    let client = kube::Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let public_key = tokio::fs::read(&args.apiserver_public_key)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to read apiserver public key from {}: {}",
                args.apiserver_public_key.display(),
                e
            )
        })?;
    let token_validator = TokenValidator::new(CLONE_TOKEN_ISSUER, &public_key, TOKEN_LEEWAY)?;

    let ca_cert = tokio::fs::read_to_string(&args.ca_cert).await?;
    let ca_key = tokio::fs::read_to_string(&args.ca_key).await?;
    let ca = CertificateAuthority::from_pem(&ca_cert, &ca_key)?;
    tracing::info!("client certificate authority loaded");

    let ctx = Arc::new(Context::new(
        client.clone(),
        token_validator,
        Arc::new(ca),
        Arc::new(FileCertBundleFetcher {
            path: args.server_ca_bundle,
        }),
        args.image,
        args.pull_policy,
    ));

    tracing::info!("starting clone controller");
    clone::run(client, ctx).await;

    tracing::info!("clone controller shutting down");
    Ok(())
}

/// Run the upload proxy until the listener fails
async fn run_proxy(args: ProxyArgs) -> anyhow::Result<()> {
    tracing::info!("upload proxy starting...");

    let client = kube::Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let public_key = tokio::fs::read(&args.apiserver_public_key)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to read apiserver public key from {}: {}",
                args.apiserver_public_key.display(),
                e
            )
        })?;

    let state = ProxyState::new(
        &public_key,
        Arc::new(KubePvcLookup::new(client)),
        Arc::new(CertUploadClientCreator::new(
            Arc::new(FileCertFetcher {
                cert_path: args.client_cert,
                key_path: args.client_key,
            }),
            Arc::new(FileCertBundleFetcher {
                path: args.server_ca_bundle,
            }),
        )),
    )?;

    let cert_watcher: Option<Arc<dyn CertWatcher>> = match (args.tls_cert, args.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            Some(Arc::new(FileCertWatcher { cert_path, key_path }) as Arc<dyn CertWatcher>)
        }
        _ => {
            tracing::warn!("no serving certificate configured, serving plain HTTP");
            None
        }
    };

    let proxy = UploadProxy::new(&args.bind_address, args.bind_port, cert_watcher, state);
    proxy.start().await?;
    Ok(())
}
