//! Source retrieval - downloads panels or replays them from disk
//!
//! The ETL core only needs `fetch(source) -> bytes | error`; everything
//! here (rate limiting, caching, hashing) stays behind that seam.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::sources::SourceSpec;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("source '{source_id}' request failed: {source}")]
    Http {
        source_id: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("source '{source_id}' I/O error at {path}: {source}")]
    Io {
        source_id: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("source '{source_id}' not found at {path}")]
    NotFound { source_id: String, path: String },
}

/// Raw panel content for one source
#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub source_id: String,
    pub bytes: Vec<u8>,
    pub content_hash: String,
    pub local_path: Option<PathBuf>,
}

impl FetchedArtifact {
    pub fn new(source_id: &str, bytes: Vec<u8>, local_path: Option<PathBuf>) -> Self {
        let content_hash = content_hash(&bytes);
        Self {
            source_id: source_id.to_string(),
            bytes,
            content_hash,
            local_path,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, source: &SourceSpec) -> Result<FetchedArtifact, RetrievalError>;
}

/// `sha256:<hex>` digest of the raw content
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Dated raw file name, one per source per day
pub fn raw_file_name(source_id: &str, date: NaiveDate) -> String {
    format!("{}_{}.csv", source_id, date.format("%Y-%m-%d"))
}

// =============================================================================
// HTTP Fetcher
// =============================================================================

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub raw_dir: PathBuf,
    pub rate_limit_ms: u64,
    pub timeout: Duration,
    pub force: bool,
}

impl HttpConfig {
    pub fn from_env() -> Self {
        Self {
            raw_dir: PathBuf::from(
                std::env::var("RAW_FS_DIR").unwrap_or_else(|_| "./data/raw".to_string()),
            ),
            rate_limit_ms: std::env::var("RATE_LIMIT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            timeout: Duration::from_secs(180),
            force: false,
        }
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
    config: HttpConfig,
}

impl HttpFetcher {
    pub fn new(config: HttpConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("RegionPanelLoader/1.0 (batch research data loader)")
            .build()?;
        Ok(Self { client, config })
    }

    fn io_error(source: &SourceSpec, path: &Path, err: std::io::Error) -> RetrievalError {
        RetrievalError::Io {
            source_id: source.id.clone(),
            path: path.display().to_string(),
            source: err,
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, source: &SourceSpec) -> Result<FetchedArtifact, RetrievalError> {
        let path = self
            .config
            .raw_dir
            .join(raw_file_name(&source.id, Utc::now().date_naive()));

        if !self.config.force && fs::try_exists(&path).await.unwrap_or(false) {
            let bytes = fs::read(&path)
                .await
                .map_err(|e| Self::io_error(source, &path, e))?;
            info!(source = %source.id, path = %path.display(), "using cached download");
            return Ok(FetchedArtifact::new(&source.id, bytes, Some(path)));
        }

        debug!(source = %source.id, wait_ms = self.config.rate_limit_ms, "rate limit");
        sleep(Duration::from_millis(self.config.rate_limit_ms)).await;

        info!(source = %source.id, url = %source.url, "downloading");
        let http_error = |err: reqwest::Error| RetrievalError::Http {
            source_id: source.id.clone(),
            source: err,
        };
        let bytes = self
            .client
            .get(&source.url)
            .send()
            .await
            .map_err(http_error)?
            .error_for_status()
            .map_err(http_error)?
            .bytes()
            .await
            .map_err(http_error)?
            .to_vec();

        fs::create_dir_all(&self.config.raw_dir)
            .await
            .map_err(|e| Self::io_error(source, &self.config.raw_dir, e))?;
        fs::write(&path, &bytes)
            .await
            .map_err(|e| Self::io_error(source, &path, e))?;

        let artifact = FetchedArtifact::new(&source.id, bytes, Some(path));
        info!(
            source = %source.id,
            size_mb = %format!("{:.2}", artifact.size_bytes() as f64 / 1024.0 / 1024.0),
            hash = %artifact.content_hash,
            "downloaded"
        );
        Ok(artifact)
    }
}

// =============================================================================
// Local Fetcher (offline replay)
// =============================================================================

/// Reads `<dir>/<source_id>.csv`, falling back to the newest dated raw file
pub struct LocalFetcher {
    dir: PathBuf,
}

impl LocalFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn newest_dated_file(&self, source_id: &str) -> Option<PathBuf> {
        let prefix = format!("{}_", source_id);
        let mut entries = fs::read_dir(&self.dir).await.ok()?;
        let mut candidates = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(date_part) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".csv"))
            else {
                continue;
            };
            if NaiveDate::parse_from_str(date_part, "%Y-%m-%d").is_ok() {
                candidates.push(name);
            }
        }
        // ISO dates sort lexicographically
        candidates.sort();
        candidates.pop().map(|name| self.dir.join(name))
    }
}

#[async_trait]
impl Fetcher for LocalFetcher {
    async fn fetch(&self, source: &SourceSpec) -> Result<FetchedArtifact, RetrievalError> {
        let plain = self.dir.join(format!("{}.csv", source.id));
        let path = if fs::try_exists(&plain).await.unwrap_or(false) {
            plain
        } else {
            self.newest_dated_file(&source.id)
                .await
                .ok_or_else(|| RetrievalError::NotFound {
                    source_id: source.id.clone(),
                    path: plain.display().to_string(),
                })?
        };

        let bytes = fs::read(&path).await.map_err(|e| RetrievalError::Io {
            source_id: source.id.clone(),
            path: path.display().to_string(),
            source: e,
        })?;
        info!(source = %source.id, path = %path.display(), "replaying local file");
        Ok(FetchedArtifact::new(&source.id, bytes, Some(path)))
    }
}

// =============================================================================
// TESTS
// =============================================================================
