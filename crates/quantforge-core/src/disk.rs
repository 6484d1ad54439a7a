//! Disk-pressure accounting and cache eviction.
//!
//! Predicts whether the filesystem can host a model's work set and reclaims
//! space otherwise. Reclamation is the only agent that deletes from the
//! shared cache; the orchestrator and external programs never do.

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::DiskConfig;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Disk usage for the filesystem hosting a path.
#[derive(Debug, Clone, Default)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DiskUsage {
    pub fn free_gib(&self) -> f64 {
        self.free_bytes as f64 / GIB
    }
}

/// Result of a reclamation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Enough space was freed for the caller's model.
    Ok,
    /// Every eviction step ran and the re-check still failed.
    Exhausted,
}

/// Free-space accounting and shared-cache eviction.
pub struct DiskManager {
    /// Shared Hub download cache (`models--owner--name` entries).
    cache_dir: PathBuf,
    /// Per-model working directories.
    work_dir: PathBuf,
    /// Floor for the per-model space estimate.
    min_required_bytes: u64,
}

impl DiskManager {
    pub fn new(cache_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            work_dir: work_dir.into(),
            min_required_bytes: DiskConfig::MIN_REQUIRED_BYTES,
        }
    }

    /// Override the required-space floor. Deployments on small volumes (and
    /// tests) lower this.
    pub fn with_min_required_bytes(mut self, bytes: u64) -> Self {
        self.min_required_bytes = bytes;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Required bytes for converting a model with `parameters` parameters.
    ///
    /// `parameters · bytes_per_param · working_copies · safety_factor`,
    /// floored at 10 GiB. Unknown counts (`≤ 0`) return `None`: the caller
    /// must refuse the model rather than guess.
    pub fn required_bytes(&self, parameters: i64) -> Option<u64> {
        if parameters <= 0 {
            return None;
        }
        let raw = parameters as f64
            * DiskConfig::BYTES_PER_PARAM as f64
            * DiskConfig::WORKING_COPIES as f64
            * DiskConfig::SAFETY_FACTOR;
        Some((raw as u64).max(self.min_required_bytes))
    }

    /// Disk usage of the filesystem holding the work directory.
    ///
    /// Statted on the nearest existing ancestor, since the work directory
    /// is created lazily.
    pub fn disk_usage(&self) -> DiskUsage {
        let mut probe: &Path = &self.work_dir;
        loop {
            if probe.exists() {
                if let (Ok(total), Ok(free)) =
                    (fs2::total_space(probe), fs2::available_space(probe))
                {
                    return DiskUsage {
                        total_bytes: total,
                        free_bytes: free,
                    };
                }
            }
            match probe.parent() {
                Some(parent) => probe = parent,
                None => return DiskUsage::default(),
            }
        }
    }

    /// Whether the model's work set fits on disk right now.
    pub fn can_fit(&self, model_id: &str, parameters: i64) -> bool {
        let Some(required) = self.required_bytes(parameters) else {
            warn!("Couldn't determine space requirements for {model_id}");
            return false;
        };
        let usage = self.disk_usage();
        let fits = usage.free_bytes >= required;
        info!(
            "Space check for {model_id}: need {:.1} GiB, have {:.1} GiB ({})",
            required as f64 / GIB,
            usage.free_gib(),
            if fits { "ok" } else { "insufficient" }
        );
        fits
    }

    /// The `limit` largest cache entries by recursive on-disk size.
    pub fn scan_largest(&self, limit: usize) -> Vec<(String, f64)> {
        let Ok(entries) = std::fs::read_dir(&self.cache_dir) else {
            return Vec::new();
        };
        let mut items: Vec<(String, f64)> = entries
            .filter_map(|e| e.ok())
            .map(|e| {
                let size: u64 = WalkDir::new(e.path())
                    .into_iter()
                    .filter_map(|f| f.ok())
                    .filter(|f| f.file_type().is_file())
                    .filter_map(|f| f.metadata().ok())
                    .map(|m| m.len())
                    .sum();
                (e.file_name().to_string_lossy().to_string(), size as f64 / GIB)
            })
            .collect();
        items.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        items.truncate(limit);
        items
    }

    /// Remove the `limit` largest cache entries.
    pub fn remove_largest_cache_items(&self, limit: usize) {
        info!("Scanning for largest cache items in {}", self.cache_dir.display());
        for (name, size_gib) in self.scan_largest(limit) {
            let path = self.cache_dir.join(&name);
            info!("Removing cache item: {name} ({size_gib:.2} GiB)");
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = result {
                warn!("Failed to remove {}: {e}", path.display());
            }
        }
    }

    /// Clear the cache entry belonging to one model.
    pub fn clear_model_cache(&self, model_id: &str) {
        let entry = format!("models--{}", model_id.replace('/', "--"));
        let path = self.cache_dir.join(entry);
        if path.exists() {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => info!("Cleared cache for {model_id}"),
                Err(e) => warn!("Failed to clear cache for {model_id}: {e}"),
            }
        }
    }

    /// Wipe the entire shared cache.
    pub fn wipe_all_caches(&self) {
        info!("Wiping entire cache at {}", self.cache_dir.display());
        if let Err(e) = std::fs::remove_dir_all(&self.cache_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to wipe cache: {e}");
            }
        }
    }

    /// Force-clean every reclaimable location: the shared cache, model
    /// working directories, and temp-file stragglers.
    pub fn aggressive_cleanup(&self) {
        info!("Performing aggressive cache cleanup");
        self.wipe_all_caches();

        if let Ok(entries) = std::fs::read_dir(&self.work_dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.is_dir() {
                    match std::fs::remove_dir_all(&path) {
                        Ok(()) => info!("Deleted working directory: {}", path.display()),
                        Err(e) => warn!("Failed to delete {}: {e}", path.display()),
                    }
                } else if path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e == "tmp" || e == "temp")
                    .unwrap_or(false)
                {
                    std::fs::remove_file(&path).ok();
                }
            }
        }
    }

    /// Reclaim space for a model, escalating until a re-check passes.
    ///
    /// Steps, in order: targeted cache clear for the model, removal of the
    /// largest cache entries, full cache wipe. The first step whose re-check
    /// succeeds ends eviction.
    pub fn reclaim_for(&self, model_id: &str, parameters: i64) -> ReclaimOutcome {
        self.clear_model_cache(model_id);
        if self.can_fit(model_id, parameters) {
            return ReclaimOutcome::Ok;
        }

        info!("Attempting targeted large cache cleanup for {model_id}");
        self.remove_largest_cache_items(DiskConfig::EVICT_LARGEST_COUNT);
        if self.can_fit(model_id, parameters) {
            return ReclaimOutcome::Ok;
        }

        self.wipe_all_caches();
        if self.can_fit(model_id, parameters) {
            return ReclaimOutcome::Ok;
        }

        warn!("Critical: still insufficient space for {model_id} after cleanup");
        ReclaimOutcome::Exhausted
    }
}
