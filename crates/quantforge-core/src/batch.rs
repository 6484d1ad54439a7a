//! Batch driver: convert an explicit list of models from a JSON manifest.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::catalog::{CatalogStore, ModelEntry};
use crate::convert::{ConvertOptions, Orchestrator};
use crate::error::{ForgeError, Result};

/// Manifest shape: `{ "models": [ "owner/name" | {"name": ..., "is_moe": ...}, ... ] }`.
#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub models: Vec<ManifestEntry>,
}

/// One manifest item; the bare-string form defaults `is_moe` to false.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ManifestEntry {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        is_moe: bool,
    },
}

impl ManifestEntry {
    pub fn name(&self) -> &str {
        match self {
            ManifestEntry::Name(name) => name,
            ManifestEntry::Detailed { name, .. } => name,
        }
    }

    pub fn is_moe(&self) -> bool {
        match self {
            ManifestEntry::Name(_) => false,
            ManifestEntry::Detailed { is_moe, .. } => *is_moe,
        }
    }
}

/// Parse a manifest file. Malformed manifests are contract violations.
pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let raw = std::fs::read_to_string(path).map_err(|e| ForgeError::Contract {
        what: "manifest".to_string(),
        message: format!("{}: {e}", path.display()),
    })?;
    let manifest: Manifest = serde_json::from_str(&raw).map_err(|e| ForgeError::Contract {
        what: "manifest".to_string(),
        message: format!("{}: {e}", path.display()),
    })?;
    if manifest.models.is_empty() {
        return Err(ForgeError::Contract {
            what: "manifest".to_string(),
            message: "no models found in the manifest".to_string(),
        });
    }
    Ok(manifest)
}

/// The batch driver: ensures each manifest entry exists in the catalog and
/// converts them strictly in list order. The first failure aborts the run.
pub struct BatchDriver {
    catalog: Arc<dyn CatalogStore>,
    orchestrator: Arc<Orchestrator>,
}

impl BatchDriver {
    pub fn new(catalog: Arc<dyn CatalogStore>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            catalog,
            orchestrator,
        }
    }

    async fn ensure_entry(&self, item: &ManifestEntry) -> Result<()> {
        let model_id = item.name();
        match self.catalog.get(model_id).await? {
            Some(existing) => {
                if existing.is_moe != item.is_moe() {
                    info!("Updating MoE status for {model_id} to {}", item.is_moe());
                    let applied = self
                        .catalog
                        .update_field(model_id, "is_moe", Value::Bool(item.is_moe()), None)
                        .await?;
                    if !applied {
                        return Err(ForgeError::Catalog {
                            message: format!("failed to update MoE status for {model_id}"),
                            source: None,
                        });
                    }
                }
            }
            None => {
                info!("Adding new model to catalog: {model_id}");
                // Parameters are resolved later by the pipeline; the entry
                // assumes a config since the caller asked for a conversion.
                let entry = ModelEntry::new(0, true, item.is_moe());
                self.catalog.put_if_absent(model_id, &entry).await?;
            }
        }
        Ok(())
    }

    /// Process every manifest entry in order; the first failure aborts.
    pub async fn run(&self, manifest: &Manifest) -> Result<()> {
        let total = manifest.models.len();
        info!("Found {total} models to process");

        for (idx, item) in manifest.models.iter().enumerate() {
            let model_id = item.name();
            info!(
                "Processing model {}/{total}: {model_id} (MoE: {})",
                idx + 1,
                if item.is_moe() { "Yes" } else { "No" }
            );
            self.ensure_entry(item).await?;

            let opts = ConvertOptions {
                is_moe: item.is_moe(),
                ..Default::default()
            };
            self.orchestrator.convert_model(model_id, &opts).await?;
        }

        info!("All models processed successfully");
        Ok(())
    }
}
