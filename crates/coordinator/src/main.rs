//! StyleFlow - Main Entry Point
//!
//! One binary for every rank: the launch environment decides whether this
//! process coordinates the cluster or only works. Configuration comes from
//! a YAML file overlaid with cluster-launch environment variables; invalid
//! configuration is fatal before anything starts.

use styleflow_common::config::CONFIG_ENV;
use styleflow_common::{Result, StyleFlowConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "styleflow=info,styleflow_coordinator=info,styleflow_worker=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting StyleFlow");

    // Load configuration
    let config_path =
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| "configs/styleflow.yaml".to_string());

    let mut config = StyleFlowConfig::from_file(&config_path)?;
    config.cluster.apply_env()?;
    config.validate()?;

    info!(
        "Configuration loaded: input={}, output={}, batch_size={}, patience={}s",
        config.pipeline.input_dir.display(),
        config.pipeline.output_dir.display(),
        config.pipeline.batch_size,
        config.pipeline.patience_secs
    );

    styleflow_coordinator::bootstrap::start(&config).await?;

    info!("StyleFlow shutdown complete");
    Ok(())
}
