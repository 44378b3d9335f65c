//! # Image Resolution
//!
//! Turns the `src` of a discovered image into bytes and a mime type.
//!
//! - Data URIs are already self-contained and are skipped.
//! - Remote (`http://`, `https://`) sources are fetched with redirects
//!   followed. Network errors and 5xx responses are retried with exponential
//!   backoff under a hard per-image deadline; 4xx responses fail at once.
//! - Local sources are looked up, in order, under the site source root (for
//!   `/`-prefixed paths), under the post's asset directory, and finally under
//!   the source root again.
//!
//! A failure is returned as a [`Resolution::Failed`] so the caller can leave
//! that one tag untouched and carry on with the rest of the document.

use crate::config::FetchSettings;
use crate::error::{ResolveError, Result};
use crate::images::ImageReference;
use futures::future::join_all;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Resolved bytes for one image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub buffer: Vec<u8>,
    pub mime: String,
}

/// Where an image `src` points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource<'a> {
    DataUri,
    Remote(&'a str),
    Local(&'a str),
}

impl<'a> ImageSource<'a> {
    pub fn classify(src: &'a str) -> Self {
        let lower = src.trim_start().to_ascii_lowercase();
        if lower.starts_with("data:") {
            ImageSource::DataUri
        } else if lower.starts_with("http://") || lower.starts_with("https://") {
            ImageSource::Remote(src)
        } else {
            ImageSource::Local(src)
        }
    }
}

/// Outcome of resolving one reference.
#[derive(Debug)]
pub enum Resolution {
    /// Already a data URI; nothing to do.
    Skipped,
    Resolved(ImageAsset),
    Failed(ResolveError),
}

/// Infers a mime type from a file extension.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        "avif" => "image/avif",
        "ico" => "image/x-icon",
        _ => DEFAULT_MIME,
    }
}

/// Candidate paths for a local `src`, in lookup order.
pub fn local_candidates(src: &str, source_dir: &Path, asset_dir: Option<&Path>) -> Vec<PathBuf> {
    // Query strings and fragments never name part of the file.
    let bare = src.split(['?', '#']).next().unwrap_or(src);
    let relative = bare.trim_start_matches('/');

    let mut candidates = Vec::with_capacity(2);
    if !bare.starts_with('/') {
        if let Some(assets) = asset_dir {
            candidates.push(assets.join(relative));
        }
    }
    candidates.push(source_dir.join(relative));
    candidates
}

/// Reads a local image through the fallback chain.
pub fn resolve_local(
    src: &str,
    source_dir: &Path,
    asset_dir: Option<&Path>,
) -> std::result::Result<ImageAsset, ResolveError> {
    let candidates = local_candidates(src, source_dir, asset_dir);
    let path = candidates
        .iter()
        .find(|p| p.is_file())
        .ok_or_else(|| ResolveError::NotFound {
            src: src.to_string(),
            tried: candidates.clone(),
        })?;

    let buffer = std::fs::read(path).map_err(|source| ResolveError::Read {
        path: path.clone(),
        source,
    })?;

    Ok(ImageAsset {
        buffer,
        mime: mime_for_path(path).to_string(),
    })
}

/// HTTP client for remote images.
pub struct ImageFetcher {
    client: Client,
    settings: FetchSettings,
}

impl ImageFetcher {
    pub fn new(settings: FetchSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;
        Ok(Self { client, settings })
    }

    /// Fetches `url`, retrying transient failures until the deadline.
    pub async fn fetch(&self, url: &str) -> std::result::Result<ImageAsset, ResolveError> {
        let started = Instant::now();
        match tokio::time::timeout(self.settings.deadline(), self.fetch_with_retries(url)).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::DeadlineExceeded {
                url: url.to_string(),
                elapsed_ms: started.elapsed().as_millis(),
            }),
        }
    }

    async fn fetch_with_retries(&self, url: &str) -> std::result::Result<ImageAsset, ResolveError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(url).await {
                Ok(asset) => return Ok(asset),
                Err(e) if e.is_retryable() && attempt < self.settings.retries => {
                    let delay = self.settings.backoff(attempt);
                    tracing::debug!(%url, attempt, error = %e, ?delay, "retrying image fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> std::result::Result<ImageAsset, ResolveError> {
        let network = |source| ResolveError::Network {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MIME)
            .to_string();

        let buffer = response.bytes().await.map_err(network)?.to_vec();
        Ok(ImageAsset { buffer, mime })
    }
}

/// Resolves image references for one site.
pub struct Resolver {
    fetcher: ImageFetcher,
    source_dir: PathBuf,
}

impl Resolver {
    pub fn new(fetcher: ImageFetcher, source_dir: PathBuf) -> Self {
        Self {
            fetcher,
            source_dir,
        }
    }

    pub async fn resolve(&self, src: &str, asset_dir: Option<&Path>) -> Resolution {
        let result = match ImageSource::classify(src) {
            ImageSource::DataUri => return Resolution::Skipped,
            ImageSource::Remote(url) => self.fetcher.fetch(url).await,
            ImageSource::Local(path) => resolve_local(path, &self.source_dir, asset_dir),
        };

        match result {
            Ok(asset) => Resolution::Resolved(asset),
            Err(e) => Resolution::Failed(e),
        }
    }

    /// Resolves every reference concurrently; results line up with `refs`.
    pub async fn resolve_all(
        &self,
        refs: &[ImageReference],
        asset_dir: Option<&Path>,
    ) -> Vec<Resolution> {
        join_all(refs.iter().map(|r| self.resolve(&r.src, asset_dir))).await
    }
}
