//! Document download with overwrite-by-destination semantics.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::filename::choose_pdf_filename;
use crate::{FetchError, HttpFetcher};

/// What to do when the destination file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExistingFilePolicy {
    #[default]
    Overwrite,
    Keep,
}

impl std::str::FromStr for ExistingFilePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(ExistingFilePolicy::Overwrite),
            "keep" => Ok(ExistingFilePolicy::Keep),
            other => Err(format!("unknown existing-file policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Written { path: PathBuf, bytes: usize },
    /// The destination already existed and nothing was fetched. The file may
    /// belong to a different document that shares the name.
    KeptExisting { path: PathBuf },
}

impl DownloadOutcome {
    /// Whether this call fetched the document's bytes.
    pub fn fetched(&self) -> bool {
        matches!(self, DownloadOutcome::Written { .. })
    }

    pub fn path(&self) -> &Path {
        match self {
            DownloadOutcome::Written { path, .. } | DownloadOutcome::KeptExisting { path } => path,
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected status {status} for {url}")]
    UnexpectedStatus { status: u16, url: String },
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Downloader {
    http: Arc<HttpFetcher>,
    dir: PathBuf,
    existing: ExistingFilePolicy,
    referer: Option<String>,
    max_filename_chars: usize,
}

impl Downloader {
    pub fn new(http: Arc<HttpFetcher>, dir: impl Into<PathBuf>, max_filename_chars: usize) -> Self {
        Self {
            http,
            dir: dir.into(),
            existing: ExistingFilePolicy::default(),
            referer: None,
            max_filename_chars,
        }
    }

    pub fn with_existing_policy(mut self, existing: ExistingFilePolicy) -> Self {
        self.existing = existing;
        self
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    /// Local file name for a resolved document of the entry titled `title`.
    pub fn file_name_for(&self, pdf_url: &str, title: &str) -> String {
        choose_pdf_filename(pdf_url, title, self.max_filename_chars)
    }

    /// Fetches `url` into `dir/file_name`. With the overwrite policy an
    /// existing file is always replaced; the new bytes land through a temp
    /// file and rename so no stale partial file is left behind.
    pub async fn download(&self, url: &str, file_name: &str) -> Result<DownloadOutcome, DownloadError> {
        let dest = self.dir.join(file_name);

        if self.existing == ExistingFilePolicy::Keep
            && fs::try_exists(&dest).await.unwrap_or(false)
        {
            info!(path = %dest.display(), "destination exists; keeping it");
            return Ok(DownloadOutcome::KeptExisting { path: dest });
        }

        let resp = self.http.fetch_bytes(url, self.referer.as_deref()).await?;
        if resp.status != StatusCode::OK {
            return Err(DownloadError::UnexpectedStatus {
                status: resp.status.as_u16(),
                url: resp.final_url,
            });
        }

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| DownloadError::Io {
                path: self.dir.clone(),
                source,
            })?;
        self.replace(&dest, &resp.body).await?;

        info!(path = %dest.display(), bytes = resp.body.len(), "downloaded");
        Ok(DownloadOutcome::Written {
            path: dest,
            bytes: resp.body.len(),
        })
    }

    async fn replace(&self, dest: &Path, bytes: &[u8]) -> Result<(), DownloadError> {
        let temp_path = self.dir.join(format!(".{}.part", Uuid::new_v4()));

        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(source) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(DownloadError::Io {
                path: temp_path,
                source,
            });
        }

        if let Err(source) = fs::rename(&temp_path, dest).await {
            warn!(path = %dest.display(), error = %source, "rename failed");
            let _ = fs::remove_file(&temp_path).await;
            return Err(DownloadError::Io {
                path: dest.to_path_buf(),
                source,
            });
        }
        Ok(())
    }
}
