//! Importance-matrix acquisition.
//!
//! Preference order: a locally cached copy, then a small set of canonical
//! download URLs, then local generation with the toolchain. Whatever we end
//! up with is cached for future runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::llama_cpp::Toolchain;
use crate::config::HubConfig;
use crate::error::Result;
use crate::hub::HubApi;

/// Canonical download URLs for a model's `.imatrix`, attempted in order.
///
/// The variants cover the common republishing patterns: the plain model
/// name, the capitalized first owner segment prefixed onto a de-duplicated
/// name, and `owner_name`.
pub fn imatrix_urls(endpoint: &str, owner: &str, model_name: &str) -> Vec<String> {
    let first_owner_segment = owner.split('-').next().unwrap_or(owner);
    let capitalized = capitalize(first_owner_segment);

    let name_parts: Vec<&str> = model_name.split('-').collect();
    let corrected = if name_parts.first() == Some(&capitalized.as_str()) {
        name_parts[1..].join("-")
    } else {
        model_name.to_string()
    };

    let variant_1 = format!("{capitalized}-{corrected}");
    let variant_2 = format!("{owner}_{model_name}");
    let base = format!("{endpoint}/{}", HubConfig::IMATRIX_NAMESPACE);

    vec![
        format!("{base}/{model_name}-GGUF/resolve/main/{model_name}.imatrix"),
        format!("{base}/{variant_1}-GGUF/resolve/main/{variant_1}.imatrix"),
        format!("{base}/{variant_2}-GGUF/resolve/main/{variant_2}.imatrix"),
    ]
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Acquires importance matrices for the quant loop.
pub struct ImatrixFetcher {
    hub: Arc<dyn HubApi>,
    toolchain: Arc<dyn Toolchain>,
    /// Cross-run cache of `.imatrix` files.
    cache_dir: PathBuf,
    endpoint: String,
}

impl ImatrixFetcher {
    pub fn new(
        hub: Arc<dyn HubApi>,
        toolchain: Arc<dyn Toolchain>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            hub,
            toolchain,
            cache_dir: cache_dir.into(),
            endpoint: HubConfig::ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Produce `<model_dir>/<model_name>.imatrix`, acquiring it if missing.
    ///
    /// `base_model` is the intermediate container used for local generation
    /// when no cached or downloadable copy exists.
    pub async fn acquire(
        &self,
        model_dir: &Path,
        owner: &str,
        model_name: &str,
        base_model: &Path,
    ) -> Result<PathBuf> {
        let imatrix_file = model_dir.join(format!("{model_name}.imatrix"));
        let cached_copy = self.cache_dir.join(format!("{model_name}.imatrix"));

        if cached_copy.exists() {
            info!("Found cached imatrix: {}", cached_copy.display());
            tokio::fs::copy(&cached_copy, &imatrix_file)
                .await
                .map_err(|e| crate::ForgeError::io_with_path(e, &imatrix_file))?;
            return Ok(imatrix_file);
        }

        if imatrix_file.exists() {
            info!("{} already exists, skipping download", imatrix_file.display());
            return Ok(imatrix_file);
        }

        for url in imatrix_urls(&self.endpoint, owner, model_name) {
            info!("Trying imatrix download: {url}");
            match self.hub.download_url(&url, &imatrix_file).await {
                Ok(()) => {
                    info!("Downloaded imatrix from {url}");
                    self.cache(&imatrix_file, &cached_copy).await;
                    return Ok(imatrix_file);
                }
                Err(e) => warn!("Failed to download imatrix from {url}: {e}"),
            }
        }

        info!("All imatrix downloads failed; generating locally");
        self.toolchain
            .generate_imatrix(base_model, &imatrix_file)
            .await?;
        self.cache(&imatrix_file, &cached_copy).await;
        Ok(imatrix_file)
    }

    async fn cache(&self, imatrix_file: &Path, cached_copy: &Path) {
        if let Err(e) = tokio::fs::create_dir_all(&self.cache_dir).await {
            warn!("Could not create imatrix cache dir: {e}");
            return;
        }
        match tokio::fs::copy(imatrix_file, cached_copy).await {
            Ok(_) => info!("Saved imatrix copy to {}", cached_copy.display()),
            Err(e) => warn!("Could not cache imatrix: {e}"),
        }
    }
}
