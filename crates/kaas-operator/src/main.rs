//! KaaS control plane - tenant virtual clusters, project hierarchies and
//! workspace identity

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kaas_common::crd::VirtualCluster;
use kaas_common::telemetry::{init_telemetry, TelemetryConfig};
use kaas_operator::config::Settings;
use kaas_operator::startup;

/// Multi-tenant Kubernetes-as-a-Service control plane
#[derive(Parser, Debug)]
#[command(name = "kaas-control-plane", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the task workers, key rotation and identity endpoints
    Run(RunArgs),
    /// Print the custom resource definitions the control plane uses
    PrintCrds,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Settings file
    #[arg(long, env = "KAAS_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, env = "KAAS_DATABASE")]
    database: Option<PathBuf>,

    /// Concurrent task workers
    #[arg(long, env = "KAAS_WORKERS")]
    workers: Option<usize>,

    /// Public base URL of the identity endpoints
    #[arg(long, env = "KAAS_ISSUER_BASE_URL")]
    issuer_base_url: Option<String>,

    /// Host cluster kubeconfig
    #[arg(long, env = "KAAS_HOST_KUBECONFIG")]
    host_kubeconfig: Option<PathBuf>,

    /// OTLP collector endpoint
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

impl RunArgs {
    fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        if let Some(database) = &self.database {
            settings.database_path = database.clone();
        }
        if let Some(workers) = self.workers {
            settings.workers = workers;
        }
        if let Some(url) = &self.issuer_base_url {
            settings.issuer_base_url = url.clone();
        }
        if let Some(path) = &self.host_kubeconfig {
            settings.host_kubeconfig = Some(path.clone());
        }
        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install the aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::PrintCrds => print_crds(),
        Commands::Run(args) => run(args).await,
    }
}

fn print_crds() -> anyhow::Result<()> {
    let mut crds = vec![VirtualCluster::crd()];
    crds.extend(kaas_hierarchy::hierarchy_crds());
    for crd in crds {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("---\n{yaml}");
    }
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        otlp_endpoint: args.otlp_endpoint.clone(),
        ..Default::default()
    })?;
    let settings = args.settings()?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        shutdown.cancel();
    });

    startup::run(settings, cancel).await
}
