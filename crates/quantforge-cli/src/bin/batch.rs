//! Batch conversion from a JSON manifest of models.

use std::path::PathBuf;

use clap::Parser;
use quantforge::{load_manifest, BatchDriver};
use quantforge_cli::{init_runtime, init_tracing};
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "quantforge-batch")]
#[command(about = "Convert an explicit list of models from a JSON manifest")]
struct Args {
    /// Manifest file: { "models": [ "owner/name" | {"name": ..., "is_moe": ...} ] }
    manifest: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let manifest = load_manifest(&args.manifest)?;
    let runtime = init_runtime(None).await?;
    let driver = BatchDriver::new(runtime.catalog.clone(), runtime.orchestrator.clone());

    if let Err(e) = driver.run(&manifest).await {
        error!("FATAL: {e}");
        error!("Stopping processing due to failure");
        return Err(e.into());
    }
    Ok(())
}
