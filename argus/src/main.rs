#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use argus::{admin, config::ArgusConfig, log::LogFormat, runtime, shutdown};

#[derive(Debug, Parser)]
#[command(name = "argus", version, about = "Kubernetes monitoring sidecar")]
struct Args {
    #[command(flatten)]
    admin: admin::AdminArgs,

    #[command(flatten)]
    client: ClientArgs,

    /// Path to the JSON configuration file (all defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, env = "ARGUS_LOG", default_value = "argus=info,warn")]
    log_level: String,

    #[arg(long, default_value = "plain")]
    log_format: LogFormat,
}

/// Configures the Kubernetes client
#[derive(Clone, Debug, Parser)]
struct ClientArgs {
    /// The name of the kubeconfig cluster to use
    #[arg(long)]
    cluster: Option<String>,

    /// The name of the kubeconfig context to use
    #[arg(long)]
    context: Option<String>,

    /// The name of the kubeconfig user to use
    #[arg(long)]
    user: Option<String>,
}

impl ClientArgs {
    /// Initializes a Kubernetes client from the kubeconfig, falling back to
    /// the in-cluster environment.
    async fn try_client(
        self,
    ) -> Result<kube_client::Client, Box<dyn std::error::Error + Send + Sync>> {
        let options = kube_client::config::KubeConfigOptions {
            context: self.context.clone(),
            cluster: self.cluster.clone(),
            user: self.user.clone(),
        };

        let config = match kube_client::Config::from_kubeconfig(&options).await {
            Ok(config) => config,
            Err(error)
                if self.context.is_some() || self.cluster.is_some() || self.user.is_some() =>
            {
                return Err(error.into())
            }
            Err(_) => kube_client::Config::incluster_env()?,
        };

        Ok(config.try_into()?)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    args.log_format
        .clone()
        .try_init(EnvFilter::new(&args.log_level))?;

    let config = ArgusConfig::load(args.config.as_deref())?;
    let client = args.client.clone().try_client().await?;

    let (signals, watch) = shutdown::register()?;
    let runtime = runtime::start(config, client, admin::Builder::new(args.admin.admin_addr))?;

    let cleanup = tokio::spawn(async move {
        let release = watch.signaled().await;
        info!("Shutting down");
        runtime.shutdown().await;
        drop(release);
    });

    signals.signaled().await?;
    cleanup.await?;
    Ok(())
}
