//! Model converter service: continuous daemon or single-model run.

use clap::Parser;
use quantforge::{scheduler::config_has_moe_marker, CatalogStore, ConvertOptions, HubApi, Scheduler};
use quantforge_cli::{init_runtime, init_tracing};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "quantforge-daemon")]
#[command(about = "Model converter service")]
struct Args {
    /// Run as continuous service
    #[arg(long, conflicts_with = "single")]
    daemon: bool,

    /// Process a specific model (format: owner/model_name)
    #[arg(long, value_name = "MODEL_NAME")]
    single: Option<String>,

    /// Maximum number of parameters to process
    #[arg(long)]
    max_parameters: Option<f64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if !args.daemon && args.single.is_none() {
        anyhow::bail!("one of --daemon or --single is required");
    }
    init_tracing(args.debug);

    let runtime = init_runtime(None).await?;

    if args.daemon {
        let mut scheduler = Scheduler::new(
            runtime.catalog.clone(),
            runtime.hub.clone(),
            runtime.toolchain.clone(),
            runtime.orchestrator.clone(),
        );
        if let Some(max) = args.max_parameters {
            scheduler = scheduler.with_max_parameters(max);
        }
        scheduler.run_daemon().await?;
        return Ok(());
    }

    let model_id = args.single.expect("checked above");

    // MoE status from the catalog, falling back to the upstream config.
    let is_moe = match runtime.catalog.get(&model_id).await? {
        Some(entry) => entry.is_moe,
        None => match runtime.hub.raw_json(&model_id, "config.json").await {
            Ok(Some(config)) => config_has_moe_marker(&config),
            _ => false,
        },
    };

    let opts = ConvertOptions {
        is_moe,
        ..Default::default()
    };
    let status = runtime.orchestrator.convert_model(&model_id, &opts).await?;
    info!("Finished {model_id}: {status:?}");
    Ok(())
}
