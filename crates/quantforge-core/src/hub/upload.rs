//! Chunked uploads.
//!
//! Files above the Hub single-file ceiling are split into deterministically
//! named parts (`<base>-<quant>-00001-of-00003.gguf`) before upload; smaller
//! files go up in one piece. Either way the artifact lands in a per-quant
//! folder of the model's repository.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use super::HubApi;
use crate::config::UploadConfig;
use crate::error::{ForgeError, Result};

/// Trailing precision token stripped from base names before part naming.
static PRECISION_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)-(f16|bf16|q[0-9]_[kmls]|iq\d_\w+)$").unwrap());

/// Part filename shape produced by [`chunk_file_name`].
static PART_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.+-\d{5}-of-\d{5}\.gguf$").unwrap());

/// Strip a trailing `-<precision>` token from a base name.
pub fn clean_base_name(base_name: &str) -> String {
    PRECISION_SUFFIX.replace(base_name, "").into_owned()
}

/// Deterministic part name. Indices are 1-based, zero-padded to width five.
pub fn chunk_file_name(base_name: &str, quant: &str, part: usize, total: usize) -> String {
    format!("{}-{quant}-{part:05}-of-{total:05}.gguf", clean_base_name(base_name))
}

/// Whether a filename matches the part template.
pub fn is_chunk_name(filename: &str) -> bool {
    PART_NAME.is_match(filename)
}

/// Repository folder for a quant identifier: lowercased, underscores
/// replaced by dashes.
pub fn quant_folder(quant: &str) -> String {
    quant.to_lowercase().trim().replace('_', "-")
}

/// Number of parts for a source of `size` bytes at the given soft chunk size.
pub fn total_parts(size: u64, soft_chunk: u64) -> usize {
    if size == 0 {
        return 1;
    }
    size.div_ceil(soft_chunk) as usize
}

/// Split a file into sequentially written parts of at most `soft_chunk`
/// bytes. The final part may end short but is still numbered `M of M`.
/// On any write failure every part from this invocation is deleted before
/// the error surfaces.
pub async fn split_file(path: &Path, quant: &str, soft_chunk: u64) -> Result<Vec<PathBuf>> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ForgeError::FileNotFound(path.to_path_buf()))?;
    let base_name = file_name.trim_end_matches(".gguf");
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let size = tokio::fs::metadata(path)
        .await
        .map_err(|e| ForgeError::io_with_path(e, path))?
        .len();
    let total = total_parts(size, soft_chunk);

    let mut written: Vec<PathBuf> = Vec::with_capacity(total);
    match write_parts(path, dir, base_name, quant, soft_chunk, total, &mut written).await {
        Ok(()) => Ok(written),
        Err(e) => {
            for part in &written {
                tokio::fs::remove_file(part).await.ok();
            }
            Err(e)
        }
    }
}

async fn write_parts(
    path: &Path,
    dir: &Path,
    base_name: &str,
    quant: &str,
    soft_chunk: u64,
    total: usize,
    written: &mut Vec<PathBuf>,
) -> Result<()> {
    let mut source = tokio::fs::File::open(path)
        .await
        .map_err(|e| ForgeError::io_with_path(e, path))?;
    let mut buf = vec![0u8; UploadConfig::SPLIT_BUFFER_BYTES];

    for part in 1..=total {
        let part_path = dir.join(chunk_file_name(base_name, quant, part, total));
        let mut out = tokio::fs::File::create(&part_path)
            .await
            .map_err(|e| ForgeError::io_with_path(e, &part_path))?;
        written.push(part_path.clone());

        let mut part_bytes: u64 = 0;
        while part_bytes < soft_chunk {
            let want = buf.len().min((soft_chunk - part_bytes) as usize);
            let n = source
                .read(&mut buf[..want])
                .await
                .map_err(|e| ForgeError::io_with_path(e, path))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])
                .await
                .map_err(|e| ForgeError::io_with_path(e, &part_path))?;
            part_bytes += n as u64;
        }
        out.flush()
            .await
            .map_err(|e| ForgeError::io_with_path(e, &part_path))?;
    }
    Ok(())
}

/// Skip helper: upload only when the local file is newer than the remote
/// copy. Absent remote metadata always uploads.
pub fn should_upload(local_mtime: DateTime<Utc>, remote: Option<DateTime<Utc>>) -> bool {
    match remote {
        Some(remote_time) => local_mtime > remote_time,
        None => true,
    }
}

/// Uploads artifacts into per-quant folders, chunking as needed.
pub struct Uploader {
    hub: Arc<dyn HubApi>,
}

impl Uploader {
    pub fn new(hub: Arc<dyn HubApi>) -> Self {
        Self { hub }
    }

    /// Upload one artifact into the quant folder of `repo_id`.
    ///
    /// Files above the single-file ceiling are split; each part is deleted
    /// locally as soon as its upload succeeds. The source file itself is
    /// left in place for the caller to dispose of.
    pub async fn upload_artifact(&self, path: &Path, repo_id: &str, quant_name: &str) -> Result<()> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| ForgeError::io_with_path(e, path))?
            .len();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ForgeError::FileNotFound(path.to_path_buf()))?;
        let folder = quant_folder(quant_name);
        info!(
            "Processing {file_name} ({:.2} GiB) for {repo_id}/{folder}",
            size as f64 / (1024.0 * 1024.0 * 1024.0)
        );

        if size <= UploadConfig::SINGLE_FILE_CEILING_BYTES {
            let path_in_repo = format!("{folder}/{file_name}");
            self.hub.upload_file(path, repo_id, &path_in_repo).await?;
            info!("Uploaded {file_name}");
            return Ok(());
        }

        info!("Splitting large file {file_name}");
        let parts = split_file(path, quant_name, UploadConfig::soft_chunk_bytes()).await?;
        for part in &parts {
            let part_name = part
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| ForgeError::FileNotFound(part.clone()))?;
            let path_in_repo = format!("{folder}/{part_name}");
            self.hub.upload_file(part, repo_id, &path_in_repo).await?;
            // Free the part immediately; disk pressure is the whole reason
            // for chunking in the first place.
            if let Err(e) = tokio::fs::remove_file(part).await {
                warn!("Could not delete uploaded part {part_name}: {e}");
            }
            info!("Uploaded chunk {part_name}");
        }
        Ok(())
    }
}
