//! eks-harness - create, check and delete an ephemeral test cluster

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use eks_harness::abort::{spawn_signal_listener, StopSignal};
use eks_harness::config::{Config, Store};
use eks_harness::orchestrator::Orchestrator;
use eks_harness::provider::aws_cli::AwsCli;
use eks_harness::provider::Providers;
use eks_harness::telemetry::init_logging;

/// eks-harness - lifecycle driver for ephemeral managed Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "eks-harness", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a configuration document or a cluster
    #[command(subcommand)]
    Create(CreateCommand),

    /// Delete resources
    #[command(subcommand)]
    Delete(DeleteCommand),

    /// Health-check the cluster recorded in the document
    Check(PathArgs),
}

#[derive(Subcommand, Debug)]
enum CreateCommand {
    /// Write a default configuration document
    Config(PathArgs),

    /// Bring the cluster and every enabled add-on up
    ///
    /// On failure the document keeps everything that was created. With
    /// `onFailureDelete` the partial cluster is deleted before exiting.
    Cluster(PathArgs),
}

#[derive(Subcommand, Debug)]
enum DeleteCommand {
    /// Tear down everything recorded in the document
    Cluster(PathArgs),
}

/// Location of the configuration document
#[derive(Parser, Debug)]
struct PathArgs {
    /// Path to the YAML configuration document
    #[arg(short = 'p', long = "path", env = "EKS_HARNESS_CONFIG")]
    path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // reqwest and kube share the process-wide rustls provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install the TLS crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Create(CreateCommand::Config(args)) => create_config(&args.path),
        Commands::Create(CreateCommand::Cluster(args)) => {
            let orchestrator = open(&args.path)?;
            let stop = StopSignal::new();
            let _signals = spawn_signal_listener(stop.clone());
            orchestrator.up(&stop).await?;
            Ok(())
        }
        Commands::Delete(DeleteCommand::Cluster(args)) => {
            let orchestrator = open(&args.path)?;
            orchestrator.down().await?;
            Ok(())
        }
        Commands::Check(args) => {
            let orchestrator = open(&args.path)?;
            let stop = StopSignal::new();
            let _signals = spawn_signal_listener(stop.clone());
            orchestrator.check(&stop).await?;
            Ok(())
        }
    }
}

fn create_config(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    let mut cfg = Config::default_document(path);
    cfg.apply_env_overrides()?;
    cfg.validate_and_set_defaults()?;
    cfg.sync()?;
    println!("wrote {}", cfg.config_path);
    Ok(())
}

fn open(path: &Path) -> anyhow::Result<Orchestrator> {
    let store = Store::open(path)?;
    let (level, outputs, aws, region) = store.read(|c| {
        (
            c.log_level.clone(),
            c.log_outputs.clone(),
            c.aws_cli_path.clone(),
            c.region.clone(),
        )
    });
    init_logging(&level, &outputs)?;
    let providers = Providers::from_shared(Arc::new(AwsCli::new(aws, region)));
    Ok(Orchestrator::new(store, providers))
}
