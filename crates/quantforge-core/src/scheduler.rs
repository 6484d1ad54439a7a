//! The daemon scheduler.
//!
//! Each cycle refreshes trending candidates from the Hub, expands the
//! catalog with eligible new entries, and walks every unconverted entry in
//! order of increasing staleness, one model at a time. Between cycles the
//! daemon sleeps an hour and rebuilds the converter stack.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::catalog::{CatalogStore, ModelEntry};
use crate::config::ConvertConfig;
use crate::convert::{ConvertOptions, Orchestrator, Toolchain};
use crate::error::{ForgeError, Result};
use crate::hub::{HubApi, TrendingModel};

/// Staleness key: `last_attempt` when set, else `added`. Oldest first.
pub fn staleness_key(entry: &ModelEntry) -> DateTime<Utc> {
    entry.last_attempt.unwrap_or(entry.added)
}

/// Whether the scheduler should skip this entry outright.
pub fn is_ineligible(model_id: &str, entry: &ModelEntry, max_parameters: f64) -> bool {
    let owner = model_id.split('/').next().unwrap_or("");
    if ConvertConfig::EXCLUDED_OWNERS.contains(&owner) {
        return true;
    }
    entry.converted
        || entry.attempts >= ConvertConfig::MAX_ATTEMPTS
        || entry.parameters as f64 > max_parameters
        || entry.parameters < 0
        || !entry.has_config
}

/// Recursive `moe` substring scan over config keys, the upstream marker for
/// Mixture-of-Experts architectures.
pub fn config_has_moe_marker(config: &Value) -> bool {
    match config {
        Value::Object(map) => map.iter().any(|(key, value)| {
            key.to_lowercase().contains("moe") || config_has_moe_marker(value)
        }),
        Value::Array(items) => items.iter().any(config_has_moe_marker),
        _ => false,
    }
}

/// The daemon scheduler.
pub struct Scheduler {
    catalog: Arc<dyn CatalogStore>,
    hub: Arc<dyn HubApi>,
    toolchain: Arc<dyn Toolchain>,
    orchestrator: Arc<Orchestrator>,
    max_parameters: f64,
}

impl Scheduler {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        hub: Arc<dyn HubApi>,
        toolchain: Arc<dyn Toolchain>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            catalog,
            hub,
            toolchain,
            orchestrator,
            max_parameters: ConvertConfig::MAX_PARAMETERS,
        }
    }

    pub fn with_max_parameters(mut self, max_parameters: f64) -> Self {
        self.max_parameters = max_parameters;
        self
    }

    /// Estimate a parameter count for a new candidate: the upstream config,
    /// then the name-based estimator, then an FP32-equivalent size
    /// heuristic over the repository's safetensors bytes. `-1` when all
    /// fail.
    async fn estimate_parameters(&self, model: &TrendingModel) -> i64 {
        if let Some(count) = model.config_parameters() {
            return count;
        }

        let base_name = model.model_id.rsplit('/').next().unwrap_or(&model.model_id);
        if let Some(count) = crate::quant::model_size_from_name(base_name) {
            return count;
        }

        info!("Estimating parameters via file size for {}", model.model_id);
        match self.hub.repo_info(&model.model_id).await {
            Ok(Some(info)) => {
                let bytes = info.safetensors_bytes();
                if bytes > 0 {
                    return (bytes / 4) as i64;
                }
            }
            Ok(None) => warn!("Repository not found: {}", model.model_id),
            Err(e) => warn!("File size check failed for {}: {e}", model.model_id),
        }
        -1
    }

    /// Expand the catalog with eligible new trending candidates.
    pub async fn refresh_candidates(&self) -> Result<()> {
        let models = self
            .hub
            .trending_models(ConvertConfig::TRENDING_FETCH_LIMIT)
            .await?;
        info!("{} trending models fetched", models.len());

        for model in &models {
            let model_id = &model.model_id;
            let info = match self.hub.repo_info(model_id).await {
                Ok(Some(info)) => info,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping {model_id}: {e}");
                    continue;
                }
            };
            if !info.has_config() {
                info!("Skipping {model_id} - config.json not found");
                continue;
            }

            if self.catalog.get(model_id).await?.is_some() {
                continue;
            }

            let parameters = self.estimate_parameters(model).await;
            if parameters as f64 > self.max_parameters {
                info!("Skipping {model_id} - {parameters} parameters exceed limit");
                continue;
            }

            let is_moe = match self.hub.raw_json(model_id, "config.json").await {
                Ok(Some(config)) => config_has_moe_marker(&config),
                _ => false,
            };

            info!("Adding {model_id} with parameters={parameters} is_moe={is_moe}");
            let entry = ModelEntry::new(parameters, true, is_moe);
            if !self.catalog.put_if_absent(model_id, &entry).await? {
                info!("Model {model_id} already exists in catalog");
            }
        }
        Ok(())
    }

    /// One full cycle: refresh candidates, then convert every eligible
    /// entry sequentially, stalest first.
    pub async fn run_cycle(&self) -> Result<()> {
        info!("=== Fetching trending models ===");
        if let Err(e) = self.refresh_candidates().await {
            warn!("Candidate refresh failed: {e}");
        }

        let catalog = self.catalog.all().await?;
        info!("Catalog loaded: {} models", catalog.len());

        let mut entries: Vec<(String, ModelEntry)> = catalog.into_iter().collect();
        entries.sort_by_key(|(_, entry)| staleness_key(entry));

        let total = entries.len();
        for (idx, (model_id, entry)) in entries.into_iter().enumerate() {
            info!("--- [{}/{total}] Processing model: {model_id} ---", idx + 1);
            if is_ineligible(&model_id, &entry, self.max_parameters) {
                info!(
                    "Skipping {model_id} - converted={}, attempts={}, parameters={}",
                    entry.converted, entry.attempts, entry.parameters
                );
                continue;
            }

            let opts = ConvertOptions {
                is_moe: entry.is_moe,
                ..Default::default()
            };
            match self.orchestrator.convert_model(&model_id, &opts).await {
                Ok(status) => info!("Finished {model_id}: {status:?}"),
                // Disk exhaustion is fatal under daemon mode.
                Err(e @ ForgeError::SpaceExhausted { .. }) => {
                    error!("Stopping daemon due to persistent insufficient disk space");
                    return Err(e);
                }
                Err(e) => warn!("Error converting {model_id}: {e}"),
            }
        }
        Ok(())
    }

    /// Run conversion cycles forever, sleeping an hour between them and
    /// rebuilding the converter stack after each sleep (failures ignored).
    pub async fn run_daemon(&self) -> Result<()> {
        loop {
            info!("Starting conversion cycle...");
            self.run_cycle().await?;
            info!("Cycle complete. Sleeping for 1 hour...");
            tokio::time::sleep(ConvertConfig::CYCLE_SLEEP).await;

            info!("Updating and rebuilding llama.cpp...");
            if let Err(e) = self.toolchain.rebuild().await {
                warn!("Failed to update or rebuild llama.cpp: {e}");
            }
        }
    }
}
