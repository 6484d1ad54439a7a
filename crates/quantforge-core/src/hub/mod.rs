//! Hub access: the narrow client contract, the HTTP implementation, the
//! retry utility, and the chunked-upload path.

mod client;
mod retry;
mod upload;

pub use client::HttpHub;
pub use retry::{retry_async, RetryConfig};
pub use upload::{
    chunk_file_name, clean_base_name, is_chunk_name, quant_folder, should_upload, split_file,
    total_parts, Uploader,
};

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;

/// One model from the trending enumeration.
#[derive(Debug, Clone, Deserialize)]
pub struct TrendingModel {
    #[serde(rename = "modelId", alias = "id")]
    pub model_id: String,
    #[serde(default)]
    pub config: Option<Value>,
}

impl TrendingModel {
    /// Parameter count exposed by the upstream structured config, if any.
    pub fn config_parameters(&self) -> Option<i64> {
        self.config
            .as_ref()?
            .get("num_parameters")
            .and_then(Value::as_i64)
    }
}

/// One file of a repository listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoFile {
    pub rfilename: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Repository listing with per-file sizes.
#[derive(Debug, Clone, Default)]
pub struct RepoInfo {
    pub files: Vec<RepoFile>,
}

impl RepoInfo {
    /// Whether the repository exposes a structured model-configuration blob.
    pub fn has_config(&self) -> bool {
        self.files.iter().any(|f| f.rfilename == "config.json")
    }

    /// Total bytes of `.safetensors` weights.
    pub fn safetensors_bytes(&self) -> u64 {
        self.files
            .iter()
            .filter(|f| f.rfilename.ends_with(".safetensors"))
            .filter_map(|f| f.size)
            .sum()
    }
}

/// Existence and freshness of a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFileMeta {
    pub last_modified: Option<DateTime<Utc>>,
}

/// The Hub, reduced to the operations the pipeline needs.
///
/// The production implementation is [`HttpHub`]; tests substitute their own.
#[async_trait::async_trait]
pub trait HubApi: Send + Sync {
    /// Enumerate trending models.
    async fn trending_models(&self, limit: usize) -> Result<Vec<TrendingModel>>;

    /// Repository listing, `None` when the repository does not exist.
    async fn repo_info(&self, repo_id: &str) -> Result<Option<RepoInfo>>;

    /// Fetch a JSON file from a repository's main revision.
    async fn raw_json(&self, repo_id: &str, filename: &str) -> Result<Option<Value>>;

    /// Download every file of a repository into `dest_dir`.
    async fn download_repo(&self, repo_id: &str, dest_dir: &Path) -> Result<Vec<PathBuf>>;

    /// Download an absolute URL to a local file.
    async fn download_url(&self, url: &str, dest: &Path) -> Result<()>;

    /// Create a repository; succeeds if it already exists.
    async fn create_repo(&self, repo_id: &str) -> Result<()>;

    /// Upload a local file to `path_in_repo`.
    async fn upload_file(&self, local: &Path, repo_id: &str, path_in_repo: &str) -> Result<()>;

    /// Probe a remote file. `None` when it does not exist.
    async fn remote_file_meta(&self, repo_id: &str, path: &str) -> Result<Option<RemoteFileMeta>>;
}
