//! HTTP implementation of the Hub contract.
//!
//! Talks to the Hub's REST surface with `reqwest`: model enumeration, repo
//! listings, raw file fetches, streamed downloads, repo creation, and the
//! NDJSON commit endpoint for uploads. Transient failures are retried with
//! exponential backoff.

use std::path::{Path, PathBuf};

use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::retry::{retry_async, RetryConfig};
use super::{HubApi, RemoteFileMeta, RepoFile, RepoInfo, TrendingModel};
use crate::config::HubConfig;
use crate::error::{ForgeError, Result};

/// Base64 chunk fed into the commit body; multiple of 3 so chunk encodings
/// concatenate into one valid stream.
const UPLOAD_CHUNK_BYTES: usize = 3 * 1024 * 1024;

/// Production [`HubApi`] implementation.
pub struct HttpHub {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    retry: RetryConfig,
}

impl HttpHub {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_endpoint(HubConfig::ENDPOINT, token)
    }

    pub fn with_endpoint(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HubConfig::REQUEST_TIMEOUT)
            .build()
            .map_err(ForgeError::from)?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            token: token.into(),
            retry: RetryConfig::new().with_max_attempts(HubConfig::MAX_RETRIES),
        })
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        retry_async(
            &self.retry,
            || async {
                let response = self.auth(self.http.get(url)).send().await?;
                match response.status() {
                    reqwest::StatusCode::NOT_FOUND => Ok(None),
                    status if status.is_success() => Ok(Some(response.json::<T>().await?)),
                    status => Err(ForgeError::Hub {
                        message: format!("GET {url} returned {status}"),
                        status_code: Some(status.as_u16()),
                    }),
                }
            },
            ForgeError::is_retryable,
        )
        .await
    }

    /// Stream a GET response into `dest` through a `.part` temp file.
    async fn stream_to_file(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ForgeError::io_with_path(e, parent))?;
        }
        let temp = dest.with_extension(format!(
            "{}{}",
            dest.extension().and_then(|e| e.to_str()).unwrap_or(""),
            HubConfig::DOWNLOAD_TEMP_SUFFIX
        ));

        let response = self.auth(self.http.get(url)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ForgeError::DownloadFailed {
                url: url.to_string(),
                message: "not found".to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(ForgeError::DownloadFailed {
                url: url.to_string(),
                message: format!("status {}", response.status()),
            });
        }

        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| ForgeError::io_with_path(e, &temp))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ForgeError::DownloadFailed {
                url: url.to_string(),
                message: e.to_string(),
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ForgeError::io_with_path(e, &temp))?;
        }
        file.flush()
            .await
            .map_err(|e| ForgeError::io_with_path(e, &temp))?;
        drop(file);

        tokio::fs::rename(&temp, dest)
            .await
            .map_err(|e| ForgeError::io_with_path(e, dest))?;
        Ok(())
    }

    fn resolve_url(&self, repo_id: &str, path: &str) -> String {
        let encoded: Vec<String> = path
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect();
        format!("{}/{repo_id}/resolve/main/{}", self.endpoint, encoded.join("/"))
    }
}

#[async_trait::async_trait]
impl HubApi for HttpHub {
    async fn trending_models(&self, limit: usize) -> Result<Vec<TrendingModel>> {
        let url = format!("{}/api/models?limit={limit}", self.endpoint);
        info!("Fetching {limit} trending models");
        Ok(self.get_json(&url).await?.unwrap_or_default())
    }

    async fn repo_info(&self, repo_id: &str) -> Result<Option<RepoInfo>> {
        #[derive(serde::Deserialize)]
        struct ApiModel {
            #[serde(default)]
            siblings: Vec<RepoFile>,
        }
        let url = format!("{}/api/models/{repo_id}?blobs=true", self.endpoint);
        Ok(self
            .get_json::<ApiModel>(&url)
            .await?
            .map(|m| RepoInfo { files: m.siblings }))
    }

    async fn raw_json(&self, repo_id: &str, filename: &str) -> Result<Option<Value>> {
        let url = format!("{}/{repo_id}/raw/main/{filename}", self.endpoint);
        self.get_json(&url).await
    }

    async fn download_repo(&self, repo_id: &str, dest_dir: &Path) -> Result<Vec<PathBuf>> {
        let info = self
            .repo_info(repo_id)
            .await?
            .ok_or_else(|| ForgeError::RepoNotFound {
                repo_id: repo_id.to_string(),
            })?;

        let mut downloaded = Vec::with_capacity(info.files.len());
        for file in &info.files {
            let dest = dest_dir.join(&file.rfilename);
            let url = self.resolve_url(repo_id, &file.rfilename);
            debug!("Downloading {}", file.rfilename);
            retry_async(
                &self.retry,
                || self.stream_to_file(&url, &dest),
                ForgeError::is_retryable,
            )
            .await?;
            downloaded.push(dest);
        }
        info!("Downloaded {} files from {repo_id}", downloaded.len());
        Ok(downloaded)
    }

    async fn download_url(&self, url: &str, dest: &Path) -> Result<()> {
        retry_async(
            &self.retry,
            || self.stream_to_file(url, dest),
            ForgeError::is_retryable,
        )
        .await
    }

    async fn create_repo(&self, repo_id: &str) -> Result<()> {
        let (owner, name) = repo_id.split_once('/').ok_or_else(|| ForgeError::Hub {
            message: format!("repo id without owner: {repo_id}"),
            status_code: None,
        })?;
        let url = format!("{}/api/repos/create", self.endpoint);
        let body = serde_json::json!({
            "type": "model",
            "organization": owner,
            "name": name,
            "private": false,
        });

        retry_async(
            &self.retry,
            || async {
                let response = self.auth(self.http.post(&url)).json(&body).send().await?;
                let status = response.status();
                // 409 means the repository already exists; that is fine.
                if status.is_success() || status == reqwest::StatusCode::CONFLICT {
                    Ok(())
                } else {
                    Err(ForgeError::Hub {
                        message: format!("create_repo {repo_id} returned {status}"),
                        status_code: Some(status.as_u16()),
                    })
                }
            },
            ForgeError::is_retryable,
        )
        .await?;
        info!("Repository {repo_id} is ready");
        Ok(())
    }

    async fn upload_file(&self, local: &Path, repo_id: &str, path_in_repo: &str) -> Result<()> {
        let file = tokio::fs::File::open(local)
            .await
            .map_err(|e| ForgeError::io_with_path(e, local))?;

        // NDJSON commit: a header line, then one file line whose base64
        // content is streamed straight out of the local file.
        let header = serde_json::json!({
            "key": "header",
            "value": { "summary": format!("Upload {path_in_repo}") },
        });
        let prefix = format!(
            "{header}\n{{\"key\":\"file\",\"value\":{{\"path\":{},\"encoding\":\"base64\",\"content\":\"",
            serde_json::to_string(path_in_repo)?,
        );

        enum BodyState {
            Prefix(String, tokio::fs::File),
            Content(tokio::fs::File),
            Done,
        }

        let stream = futures::stream::unfold(
            BodyState::Prefix(prefix, file),
            |state| async move {
                match state {
                    BodyState::Prefix(text, file) => {
                        Some((Ok(Bytes::from(text)), BodyState::Content(file)))
                    }
                    BodyState::Content(mut file) => {
                        let mut buf = vec![0u8; UPLOAD_CHUNK_BYTES];
                        match file.read(&mut buf).await {
                            Ok(0) => Some((Ok(Bytes::from("\"}}\n")), BodyState::Done)),
                            Ok(n) => {
                                buf.truncate(n);
                                let encoded =
                                    base64::engine::general_purpose::STANDARD.encode(&buf);
                                Some((Ok(Bytes::from(encoded)), BodyState::Content(file)))
                            }
                            Err(e) => Some((Err(e), BodyState::Done)),
                        }
                    }
                    BodyState::Done => None,
                }
            },
        );

        let url = format!("{}/api/models/{repo_id}/commit/main", self.endpoint);
        let response = self
            .auth(self.http.post(&url))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ForgeError::UploadFailed {
                path: local.display().to_string(),
                message: format!("commit returned {}", response.status()),
            });
        }
        Ok(())
    }

    async fn remote_file_meta(&self, repo_id: &str, path: &str) -> Result<Option<RemoteFileMeta>> {
        let url = self.resolve_url(repo_id, path);
        let response = self.auth(self.http.head(&url)).send().await?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let last_modified = response
                    .headers()
                    .get(reqwest::header::LAST_MODIFIED)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                if last_modified.is_none() {
                    warn!("No parsable Last-Modified for {repo_id}/{path}");
                }
                Ok(Some(RemoteFileMeta { last_modified }))
            }
            status => Err(ForgeError::Hub {
                message: format!("HEAD {url} returned {status}"),
                status_code: Some(status.as_u16()),
            }),
        }
    }
}
