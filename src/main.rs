/// Kindling - typed kind cluster declarations
///
/// Declares kind clusters from a YAML manifest, submits them to a provider
/// runtime and records what was created.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kindling::config::{DeploymentManifest, RuntimeConfig, PROVIDER_TOKEN_ENV};
use kindling::deployment::{refresh, CancelHandle, Deployment, DeploymentState, LiveStatus};
use kindling::provider::{HttpRuntime, KindRuntime, ProviderRuntime};

const STATE_FILE: &str = "state.json";

#[derive(Parser)]
#[command(name = "kindling")]
#[command(about = "Declare kind clusters and manage them through a provider runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Deployment manifest path
    #[arg(short, long, default_value = "deployment.yaml")]
    config: PathBuf,

    /// Output directory for state and kubeconfigs
    #[arg(short, long, default_value = "./output")]
    output: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update the declared clusters
    Up,

    /// Delete every recorded cluster
    Down,

    /// Show live state of recorded clusters
    Status,

    /// Generate example manifest
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("kindling={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Up => up(&cli).await,
        Commands::Down => down(&cli).await,
        Commands::Status => show_status(&cli).await,
        Commands::Init => init_config(&cli).await,
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Pick the provider runtime named in the manifest
async fn connect(config: &RuntimeConfig) -> Result<Box<dyn ProviderRuntime>> {
    match config {
        RuntimeConfig::Kind { binary } => {
            let runtime = binary
                .as_deref()
                .map(KindRuntime::new)
                .unwrap_or_default();
            runtime.check_installed().await.context("kind is required")?;
            Ok(Box::new(runtime))
        }
        RuntimeConfig::Http {
            endpoint,
            timeout_secs,
            ..
        } => {
            let token = config.token();
            if token.is_none() {
                info!("No provider token configured (set {} to send one)", PROVIDER_TOKEN_ENV);
            }
            let runtime =
                HttpRuntime::new(endpoint, token.as_deref(), Duration::from_secs(*timeout_secs))
                    .context("Failed to create HTTP provider runtime")?;
            info!("Using provider runtime at {}", endpoint);
            Ok(Box::new(runtime))
        }
    }
}

/// Cancel the deployment on Ctrl-C
fn cancel_on_interrupt(cancel: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling pending operations...");
            cancel.cancel();
        }
    });
}

fn kubeconfig_path(output: &Path, cluster: &str) -> PathBuf {
    output.join(format!("{}.kubeconfig", cluster))
}

/// Declare the manifest's clusters and reconcile them
async fn up(cli: &Cli) -> Result<()> {
    info!("Starting deployment...");

    let manifest =
        DeploymentManifest::from_file(&cli.config).context("Failed to load configuration")?;
    let state_path = cli.output.join(STATE_FILE);
    let prior = DeploymentState::load_if_exists(&state_path)?;

    info!("Deployment: {}", manifest.deployment);

    let runtime = connect(&manifest.runtime).await?;
    let (deployment, clusters) = manifest
        .declare(prior)
        .context("Invalid cluster declaration")?;
    cancel_on_interrupt(deployment.cancel_handle());

    let summary = deployment.up(runtime.as_ref()).await?;
    summary.state.save(&state_path)?;

    tokio::fs::create_dir_all(&cli.output)
        .await
        .context("Failed to create output directory")?;

    info!("");
    info!("Clusters:");
    for (declaration, cluster) in manifest.clusters.iter().zip(&clusters) {
        let phase = summary
            .phase(&cluster.urn)
            .map(|p| p.to_string())
            .unwrap_or_default();
        match (
            cluster.outputs.name.resolve().await,
            cluster.outputs.kubeconfig.resolve().await,
        ) {
            (Ok(name), Ok(kubeconfig)) => {
                let path = kubeconfig_path(&cli.output, &declaration.name);
                tokio::fs::write(&path, kubeconfig)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!("  - {} (Name: {}, Status: {})", declaration.name, name, phase);
                info!("    Kubeconfig: {}", path.display());
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("  - {} (Status: {})", declaration.name, e);
            }
        }
    }
    for outcome in summary.outcomes.iter().skip(clusters.len()) {
        info!("  - {} (Status: {})", outcome.urn, outcome.phase);
    }
    info!("");
    info!("State: {}", state_path.display());

    summary.check().context("Deployment did not complete")?;
    info!("✓ Deployment completed successfully!");

    Ok(())
}

/// Delete everything the state file records
async fn down(cli: &Cli) -> Result<()> {
    info!("Starting teardown...");

    let manifest =
        DeploymentManifest::from_file(&cli.config).context("Failed to load configuration")?;
    let state_path = cli.output.join(STATE_FILE);
    let Some(state) = DeploymentState::load_if_exists(&state_path)? else {
        info!("No state found at {}, nothing to delete", state_path.display());
        return Ok(());
    };
    let recorded: Vec<String> = state.resources.iter().map(|r| r.name.clone()).collect();

    let runtime = connect(&manifest.runtime).await?;
    let deployment = Deployment::new(&manifest.deployment)
        .with_provider_config(manifest.provider.clone())
        .with_prior_state(state)?;
    cancel_on_interrupt(deployment.cancel_handle());

    let summary = deployment.up(runtime.as_ref()).await?;

    for name in &recorded {
        if summary.state.resources.iter().any(|r| &r.name == name) {
            continue;
        }
        let path = kubeconfig_path(&cli.output, name);
        if path.exists() {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
    }

    if summary.state.is_empty() {
        tokio::fs::remove_file(&state_path)
            .await
            .context("Failed to remove state file")?;
    } else {
        summary.state.save(&state_path)?;
    }

    summary.check().context("Teardown did not complete")?;
    info!("✓ Deployment {} destroyed successfully", manifest.deployment);

    Ok(())
}

/// Show live state of recorded clusters
async fn show_status(cli: &Cli) -> Result<()> {
    let manifest =
        DeploymentManifest::from_file(&cli.config).context("Failed to load configuration")?;
    let state_path = cli.output.join(STATE_FILE);
    let state = match DeploymentState::load_if_exists(&state_path)? {
        Some(state) if !state.is_empty() => state,
        _ => {
            info!("No clusters recorded for deployment: {}", manifest.deployment);
            return Ok(());
        }
    };

    let runtime = connect(&manifest.runtime).await?;
    let outcomes = refresh(runtime.as_ref(), &manifest.provider, &state).await?;

    info!("Deployment: {}", state.deployment);
    info!("Last updated: {}", state.updated_at.to_rfc3339());
    info!("");
    info!("Clusters:");
    for (record, outcome) in state.resources.iter().zip(outcomes) {
        let id = record.id.as_deref().unwrap_or("N/A");
        match outcome.status {
            Ok(LiveStatus::Present { .. }) => {
                info!("  - {} (ID: {}, Status: running)", record.name, id)
            }
            Ok(LiveStatus::Missing) => {
                warn!("  - {} (ID: {}, Status: missing)", record.name, id)
            }
            Err(e) => warn!("  - {} (ID: {}, Status: unknown: {})", record.name, id, e),
        }
    }

    Ok(())
}

/// Initialize example manifest
async fn init_config(cli: &Cli) -> Result<()> {
    if cli.config.exists() {
        anyhow::bail!(
            "Configuration file already exists: {}",
            cli.config.display()
        );
    }

    let example_config = DeploymentManifest::example();
    let yaml = serde_yaml::to_string(&example_config)?;

    tokio::fs::write(&cli.config, yaml)
        .await
        .context("Failed to write configuration file")?;

    info!("Example configuration created: {}", cli.config.display());
    info!("");
    info!("Next steps:");
    info!("  1. Edit the manifest to describe your clusters");
    info!("  2. Make sure kind and a container runtime are installed,");
    info!("     or point runtime.endpoint at a provider service");
    info!("  3. Create the clusters:");
    info!("     kindling up");

    Ok(())
}
