//! The per-model conversion state machine.
//!
//! One model at a time: reserve space and the converting-set lock, download
//! and convert to the base precision, walk the planned quant configs,
//! upload each artifact, and record durable progress after every committed
//! step so any interruption can resume without repeating work.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, warn};

use super::imatrix::ImatrixFetcher;
use super::llama_cpp::{BaseType, QuantizeRequest, Toolchain};
use crate::catalog::{CatalogStore, ModelEntry};
use crate::config::ConvertConfig;
use crate::disk::{DiskManager, ReclaimOutcome};
use crate::error::{ForgeError, Result};
use crate::hub::{HubApi, Uploader};
use crate::quant::{
    effective_model_size, fallback_types, needs_compatibility_fallback,
    precision_override_for_suffix, plan_quants, QuantConfig, RuleEngine,
};

/// Cursor value marking the pre-quant setup stage. Never advances the
/// resume point past any quant config.
pub const IMATRIX_SENTINEL: &str = "imatrix";

/// Per-run options.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub is_moe: bool,
    pub allow_requantize: bool,
    /// Explicit resume point, overriding the stored cursor.
    pub resume_quant: Option<String>,
    pub threads: usize,
    pub base_type: BaseType,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            is_moe: false,
            allow_requantize: false,
            resume_quant: None,
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            base_type: BaseType::Bf16,
        }
    }
}

/// Outcome of one orchestrator pass over a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Skipped(String),
}

/// Where to begin in the declared config order given a resume cursor.
///
/// A concrete quant id skips everything up to and including it; the
/// `imatrix` sentinel and unknown ids start from the beginning.
pub fn resume_start_index(progress: Option<&str>, configs: &[QuantConfig]) -> usize {
    match progress {
        None => 0,
        Some(IMATRIX_SENTINEL) => {
            info!("Resume point is the imatrix sentinel; starting from the beginning");
            0
        }
        Some(name) => match configs.iter().position(|c| c.name == name) {
            Some(idx) => idx + 1,
            None => {
                warn!("Resume quant '{name}' not found in quant list; starting from the beginning");
                0
            }
        },
    }
}

/// The conversion pipeline orchestrator.
pub struct Orchestrator {
    catalog: Arc<dyn CatalogStore>,
    hub: Arc<dyn HubApi>,
    toolchain: Arc<dyn Toolchain>,
    disk: DiskManager,
    rules: RuleEngine,
    configs: Vec<QuantConfig>,
    imatrix: ImatrixFetcher,
    uploader: Uploader,
    models_dir: PathBuf,
    /// Namespace owning the per-model upload repositories.
    namespace: String,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        hub: Arc<dyn HubApi>,
        toolchain: Arc<dyn Toolchain>,
        disk: DiskManager,
        rules: RuleEngine,
        configs: Vec<QuantConfig>,
        imatrix_cache_dir: impl Into<PathBuf>,
        models_dir: impl Into<PathBuf>,
        namespace: impl Into<String>,
    ) -> Self {
        let imatrix = ImatrixFetcher::new(hub.clone(), toolchain.clone(), imatrix_cache_dir);
        let uploader = Uploader::new(hub.clone());
        Self {
            catalog,
            hub,
            toolchain,
            disk,
            rules,
            configs,
            imatrix,
            uploader,
            models_dir: models_dir.into(),
            namespace: namespace.into(),
        }
    }

    fn split_key(model_id: &str) -> Result<(&str, &str)> {
        model_id.split_once('/').ok_or_else(|| ForgeError::Config {
            message: format!("model key must be owner/name: {model_id}"),
        })
    }

    fn model_dir(&self, base_name: &str) -> PathBuf {
        self.models_dir.join(base_name)
    }

    fn base_file(&self, base_name: &str, base_type: BaseType) -> PathBuf {
        self.model_dir(base_name)
            .join(format!("{base_name}-{base_type}.gguf"))
    }

    fn repo_id(&self, base_name: &str) -> String {
        format!("{}/{base_name}-GGUF", self.namespace)
    }

    async fn append_error(&self, model_id: &str, message: &str) {
        let Ok(Some(entry)) = self.catalog.get(model_id).await else {
            return;
        };
        let mut log = entry.error_log;
        log.push(message.to_string());
        if let Err(e) = self
            .catalog
            .update_field(model_id, "error_log", Value::from(log), None)
            .await
        {
            warn!("Could not record error for {model_id}: {e}");
        }
    }

    /// Run the full conversion state machine for one model.
    pub async fn convert_model(&self, model_id: &str, opts: &ConvertOptions) -> Result<RunStatus> {
        info!("Begin convert_model for {model_id}");

        // Lock check: refuse duplicate work unless the model is resumable.
        if self.catalog.is_converting(model_id).await? {
            if self.catalog.is_failed(model_id).await? {
                info!("Resuming failed conversion for {model_id}");
            } else {
                info!("Model {model_id} is already being converted by another process; skipping");
                return Ok(RunStatus::Skipped("already converting".to_string()));
            }
        }

        let entry = self
            .catalog
            .get(model_id)
            .await?
            .ok_or_else(|| ForgeError::ModelNotFound {
                model_id: model_id.to_string(),
            })?;

        if entry.converted {
            self.catalog.unmark_converting(model_id).await?;
            info!("Model {model_id} is already converted; nothing to do");
            return Ok(RunStatus::Skipped("already converted".to_string()));
        }

        if entry.attempts >= ConvertConfig::MAX_ATTEMPTS {
            self.catalog.unmark_converting(model_id).await?;
            info!(
                "Model {model_id} has reached the maximum number of attempts ({}); skipping",
                ConvertConfig::MAX_ATTEMPTS
            );
            return Ok(RunStatus::Skipped("max attempts reached".to_string()));
        }

        // Refuse models whose space needs cannot be determined at all.
        if self.disk.required_bytes(entry.parameters).is_none() {
            warn!("Cannot determine space requirements for {model_id}");
            self.catalog.unmark_converting(model_id).await?;
            return Ok(RunStatus::Skipped("unknown space requirements".to_string()));
        }

        // Space reservation, with at most one reclaim pass.
        if !self.disk.can_fit(model_id, entry.parameters) {
            if self.disk.reclaim_for(model_id, entry.parameters) == ReclaimOutcome::Exhausted {
                self.catalog.unmark_converting(model_id).await?;
                return Err(ForgeError::SpaceExhausted {
                    model_id: model_id.to_string(),
                });
            }
        }

        // Per-run accounting.
        let attempts_now = entry.attempts + 1;
        self.catalog.mark_converting(model_id).await?;
        self.catalog
            .update_field(model_id, "attempts", Value::from(attempts_now), None)
            .await?;
        self.catalog
            .update_field(
                model_id,
                "last_attempt",
                serde_json::to_value(Utc::now())?,
                None,
            )
            .await?;

        if let Some(progress) = self.catalog.get_quant_progress(model_id).await? {
            info!("Resuming quantization for {model_id} from quant: {progress}");
        }

        let result = self.run_pipeline(model_id, &entry, opts).await;

        match result {
            Ok(completed) => {
                info!("Successfully converted {model_id}");
                self.catalog
                    .update_field(model_id, "converted", Value::Bool(true), None)
                    .await?;
                self.catalog
                    .update_field(
                        model_id,
                        "success_date",
                        serde_json::to_value(Utc::now())?,
                        None,
                    )
                    .await?;
                self.catalog
                    .update_field(model_id, "error_log", Value::Array(Vec::new()), None)
                    .await?;
                if !completed.is_empty() {
                    self.catalog
                        .update_field(model_id, "quantizations", Value::from(completed), None)
                        .await?;
                }
                self.catalog.unmark_failed(model_id).await?;
                self.catalog.clear_quant_progress(model_id).await?;
                self.catalog.unmark_converting(model_id).await?;
                self.disk.clear_model_cache(model_id);
                Ok(RunStatus::Completed)
            }
            Err(e) => {
                error!("Conversion failed for {model_id}: {e}");
                self.append_error(model_id, &e.to_string()).await;
                self.catalog.mark_failed(model_id).await?;

                // Keep the converting-set membership only while there is
                // resumable progress.
                match self.catalog.get_quant_progress(model_id).await? {
                    Some(progress) => {
                        info!("Keeping converting mark for {model_id}; quant progress is {progress}")
                    }
                    None => self.catalog.unmark_converting(model_id).await?,
                }

                if attempts_now >= ConvertConfig::MAX_ATTEMPTS {
                    info!("Max attempts reached for {model_id}, cleaning cache");
                    self.disk.clear_model_cache(model_id);
                }
                Err(e)
            }
        }
    }

    /// Download + base conversion + quant loop. Returns completed suffixes.
    async fn run_pipeline(
        &self,
        model_id: &str,
        entry: &ModelEntry,
        opts: &ConvertOptions,
    ) -> Result<Vec<String>> {
        let (_, base_name) = Self::split_key(model_id)?;
        let base_file = self.base_file(base_name, opts.base_type);

        if base_file.exists() {
            info!(
                "Base file already exists at {}, skipping download/convert step",
                base_file.display()
            );
        } else {
            self.download_and_convert(model_id, opts).await?;
            if !base_file.exists() {
                return Err(ForgeError::ConversionFailed {
                    message: format!("converter produced no artifact at {}", base_file.display()),
                });
            }
        }

        // Base artifact in hand; the model is no longer stuck.
        self.catalog.unmark_failed(model_id).await?;

        self.quantize_and_upload(model_id, entry.parameters, opts).await
    }

    /// Fetch upstream weights into the shared cache and convert them.
    async fn download_and_convert(&self, model_id: &str, opts: &ConvertOptions) -> Result<()> {
        let (_, base_name) = Self::split_key(model_id)?;
        let model_dir = self.model_dir(base_name);
        tokio::fs::create_dir_all(&model_dir)
            .await
            .map_err(|e| ForgeError::io_with_path(e, &model_dir))?;

        let snapshot_dir = self
            .disk
            .cache_dir()
            .join(format!("models--{}", model_id.replace('/', "--")));
        info!("Downloading {model_id} into {}", snapshot_dir.display());
        self.hub.download_repo(model_id, &snapshot_dir).await?;

        let base_file = self.base_file(base_name, opts.base_type);
        self.toolchain
            .convert_to_base(&snapshot_dir, &base_file, base_name, opts.base_type)
            .await?;

        // Metadata refresh is best-effort; a failure is recorded, not fatal.
        if let Err(e) = self.toolchain.add_metadata(&base_file).await {
            warn!("Failed to add metadata for {model_id}: {e}");
            self.append_error(model_id, &format!("metadata: {e}")).await;
        }

        // Sidecar multimodal projections; most models simply have none.
        for outtype in ConvertConfig::MMPROJ_OUTTYPES {
            let mmproj_file = model_dir.join(format!("{base_name}-{outtype}.mmproj"));
            if let Err(e) = self
                .toolchain
                .convert_mmproj(&snapshot_dir, &mmproj_file, base_name, outtype)
                .await
            {
                info!("mmproj conversion failed for {outtype}: {e}");
            }
        }

        Ok(())
    }

    /// The quant loop: plan configs, acquire the importance matrix, emit
    /// one artifact per config, upload, and advance the cursor. Public so
    /// the quant-only entry point can drive it directly.
    pub async fn quantize_and_upload(
        &self,
        model_id: &str,
        parameters: i64,
        opts: &ConvertOptions,
    ) -> Result<Vec<String>> {
        let (owner, base_name) = Self::split_key(model_id)?;
        let model_dir = self.model_dir(base_name);
        let base_file = self.base_file(base_name, opts.base_type);
        if !base_file.exists() {
            return Err(ForgeError::FileNotFound(base_file));
        }

        let progress = match &opts.resume_quant {
            Some(explicit) => Some(explicit.clone()),
            None => self.catalog.get_quant_progress(model_id).await?,
        };
        // Mark the setup stage, but never rewind a concrete cursor.
        if progress.is_none() {
            self.catalog
                .set_quant_progress(model_id, IMATRIX_SENTINEL)
                .await?;
        }

        let imatrix_file = self
            .imatrix
            .acquire(&model_dir, owner, base_name, &base_file)
            .await?;

        let size = effective_model_size(base_name, parameters);
        let planned = plan_quants(base_name, size, &self.configs);
        info!("Selected {} quantizations for {base_name}", planned.len());

        let start_idx = resume_start_index(progress.as_deref(), &planned);
        if start_idx >= planned.len() && !planned.is_empty() {
            info!("All quantizations completed for {model_id}; finishing uploads only");
        }

        let repo_id = self.repo_id(base_name);
        let mut repo_created = false;
        let mut completed: Vec<String> = Vec::new();

        for (idx, config) in planned.iter().enumerate() {
            if idx < start_idx {
                info!("Skipping quant {} (before resume point)", config.name);
                continue;
            }
            match self
                .run_quant_step(model_id, base_name, &base_file, &imatrix_file, config, opts, &mut repo_created, &repo_id)
                .await
            {
                Ok(()) => completed.push(config.name.clone()),
                Err(e) => {
                    // Step failure: record and continue with the next config.
                    warn!("Quant step {} failed for {model_id}: {e}", config.name);
                    self.append_error(model_id, &format!("{}: {e}", config.name))
                        .await;
                }
            }
        }

        // Post-quant uploads happen only if some step created the repo.
        if repo_created && imatrix_file.exists() {
            match self
                .uploader
                .upload_artifact(&imatrix_file, &repo_id, IMATRIX_SENTINEL)
                .await
            {
                Ok(()) => {
                    tokio::fs::remove_file(&imatrix_file).await.ok();
                }
                Err(e) => warn!("Failed to upload imatrix for {model_id}: {e}"),
            }
        }

        let readme = model_dir.join("README.md");
        if repo_created && readme.exists() {
            if let Err(e) = self.uploader.upload_artifact(&readme, &repo_id, "readme").await {
                warn!("Failed to upload README for {model_id}: {e}");
            }
        }

        Ok(completed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_quant_step(
        &self,
        model_id: &str,
        base_name: &str,
        base_file: &Path,
        imatrix_file: &Path,
        config: &QuantConfig,
        opts: &ConvertOptions,
        repo_created: &mut bool,
        repo_id: &str,
    ) -> Result<()> {
        let model_dir = self.model_dir(base_name);
        let output_file = model_dir.join(format!("{base_name}-{}.gguf", config.name));
        let temp_output = model_dir.join(format!("{base_name}-{}.gguf.tmp", config.name));
        info!("Processing {}", output_file.display());

        let precision_override = precision_override_for_suffix(&config.name);
        let tensors = self.toolchain.tensor_types(base_file).await?;
        let overrides =
            self.rules
                .plan_overrides(&tensors, &config.target, opts.is_moe, precision_override);
        info!(
            "Planned {} tensor overrides for {} (is_moe={})",
            overrides.len(),
            config.name,
            opts.is_moe
        );

        let request = QuantizeRequest {
            source: base_file.to_path_buf(),
            dest: temp_output.clone(),
            target: config.target.clone(),
            output_type: config.output_type().map(String::from),
            embed_type: config.embed_type().map(String::from),
            imatrix: config.use_imatrix.then(|| imatrix_file.to_path_buf()),
            pure: config.use_pure,
            allow_requantize: opts.allow_requantize,
            overrides,
            threads: opts.threads,
        };

        let mut result = self.toolchain.quantize(&request).await;

        // The quantizer rejects some Q5_K/Q6_K tensor/embedding pairings;
        // one retry with Q5_1 substituted covers them.
        if result.is_err()
            && needs_compatibility_fallback(config.output_type(), config.embed_type())
        {
            warn!("Q5_K/Q6_K tensor/embed types not compatible, falling back to Q5_1");
            let (output_type, embed_type) =
                fallback_types(config.output_type(), config.embed_type());
            let fallback = QuantizeRequest {
                output_type,
                embed_type,
                ..request.clone()
            };
            result = self.toolchain.quantize(&fallback).await;
        }

        if let Err(e) = result {
            tokio::fs::remove_file(&temp_output).await.ok();
            return Err(e);
        }

        tokio::fs::rename(&temp_output, &output_file)
            .await
            .map_err(|e| ForgeError::io_with_path(e, &output_file))?;
        info!("Successfully created {}", output_file.display());

        if !*repo_created {
            self.hub.create_repo(repo_id).await?;
            *repo_created = true;
        }

        self.uploader
            .upload_artifact(&output_file, repo_id, &config.name)
            .await?;
        if let Err(e) = tokio::fs::remove_file(&output_file).await {
            warn!("Could not delete {} after upload: {e}", output_file.display());
        }

        // The cursor only advances after the artifact is durably uploaded.
        self.catalog
            .set_quant_progress(model_id, &config.name)
            .await?;
        Ok(())
    }
}
