//! Quantization stage only, for a model whose base artifact already exists.

use clap::Parser;
use quantforge::{CatalogStore, ConvertOptions};
use quantforge_cli::{init_runtime, init_tracing};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "quantforge-quant")]
#[command(about = "Quantize and upload an already-converted model")]
struct Args {
    /// Full model key (e.g. 'owner/model')
    model_id: String,

    /// Allow requantization of already quantized models
    #[arg(long = "allow-requantize")]
    allow_requantize: bool,

    /// The model is a Mixture-of-Experts model
    #[arg(long)]
    is_moe: bool,

    /// Resume quantization from after this quant name
    #[arg(long)]
    resume_quant: Option<String>,

    /// Number of threads to use (default: CPU count)
    #[arg(long)]
    threads: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    if !args.model_id.contains('/') {
        anyhow::bail!("model key must be in the format 'owner/model_name'");
    }

    let runtime = init_runtime(args.threads).await?;

    let parameters = runtime
        .catalog
        .get(&args.model_id)
        .await?
        .map(|entry| entry.parameters)
        .unwrap_or(-1);

    let mut opts = ConvertOptions {
        is_moe: args.is_moe,
        allow_requantize: args.allow_requantize,
        resume_quant: args.resume_quant,
        ..Default::default()
    };
    if let Some(threads) = args.threads {
        opts.threads = threads;
    }

    let completed = runtime
        .orchestrator
        .quantize_and_upload(&args.model_id, parameters, &opts)
        .await?;
    info!(
        "Quantization complete for {}: {} artifacts uploaded",
        args.model_id,
        completed.len()
    );
    Ok(())
}
