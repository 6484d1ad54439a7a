//! Shared bootstrap for the quantforge binaries: logging, environment,
//! catalog connection, and the fully wired orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use quantforge::{
    catalog::RedisCatalog, quant::load_quant_configs, DiskManager, ForgeEnv, HttpHub,
    LlamaCppToolchain, Orchestrator, PathsConfig, RuleEngine,
};

/// Install the global tracing subscriber.
pub fn init_tracing(debug: bool) {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

/// Directory holding `quant_configs.json` and `quant_rules.json`.
pub fn config_dir() -> PathBuf {
    std::env::var("QUANTFORGE_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"))
}

/// Everything a binary needs to drive conversions.
pub struct Runtime {
    pub env: ForgeEnv,
    pub catalog: Arc<RedisCatalog>,
    pub hub: Arc<HttpHub>,
    pub toolchain: Arc<LlamaCppToolchain>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Load the environment, verify the catalog connection, and wire up the
/// orchestrator with its collaborators.
pub async fn init_runtime(threads: Option<usize>) -> anyhow::Result<Runtime> {
    let env = ForgeEnv::from_env().context("loading environment")?;

    let catalog = Arc::new(RedisCatalog::new(&env.redis).context("opening catalog client")?);
    catalog
        .ping()
        .await
        .context("catalog connection test failed")?;
    info!("Catalog connection test: Success");

    let hub = Arc::new(HttpHub::new(env.hf_token.clone()).context("building Hub client")?);

    let mut toolchain = LlamaCppToolchain::new(
        env.llama_cpp_dir(),
        env.work_root.join(PathsConfig::IMATRIX_TRAIN_SET_NAME),
    );
    if let Some(threads) = threads {
        toolchain = toolchain.with_threads(threads);
    }
    let toolchain = Arc::new(toolchain);

    let config_dir = config_dir();
    let rules = RuleEngine::load(&config_dir.join("quant_rules.json"))?;
    let configs = load_quant_configs(&config_dir.join("quant_configs.json"))?;

    let disk = DiskManager::new(env.hf_cache_dir(), env.models_dir());

    let orchestrator = Arc::new(Orchestrator::new(
        catalog.clone(),
        hub.clone(),
        toolchain.clone(),
        disk,
        rules,
        configs,
        env.imatrix_cache_dir(),
        env.models_dir(),
        env.hub_namespace.clone(),
    ));

    Ok(Runtime {
        env,
        catalog,
        hub,
        toolchain,
        orchestrator,
    })
}
