use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use yolo_harness::{Config, ImageSource, InferenceHarness};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    let harness = InferenceHarness::with_yolo_model(&config)
        .with_context(|| format!("Failed to load model: {}", config.model_path.display()))?;

    let source = ImageSource::from(config.source.as_str());
    let shown = harness
        .run(&source)
        .with_context(|| format!("Failed to predict on: {}", config.source))?;

    info!("displayed {shown} result(s)");
    Ok(())
}
