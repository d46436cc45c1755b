use std::path::{Path, PathBuf};
use std::time::Instant;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("blob request failed")]
    Transport(#[from] reqwest::Error),
    #[error("failed to write downloaded stream")]
    Io(#[from] std::io::Error),
}

/// Retrieves the origin bytes of a stream into a destination directory,
/// assembled as a single file named after the fingerprint.
#[async_trait::async_trait]
pub trait Downloader: Send + Sync + 'static {
    async fn download(&self, sd_hash: &str, dest_dir: &Path) -> Result<PathBuf, DownloadError>;
}

/// Streams origin files over HTTP from a blob server.
pub struct BlobDownloader {
    client: reqwest::Client,
    base: Url,
}

impl BlobDownloader {
    pub fn new(base: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base,
        }
    }
}

#[async_trait::async_trait]
impl Downloader for BlobDownloader {
    #[tracing::instrument(skip(self, dest_dir))]
    async fn download(&self, sd_hash: &str, dest_dir: &Path) -> Result<PathBuf, DownloadError> {
        let url = self
            .base
            .join(&format!("stream/{sd_hash}"))
            .expect("blob server base URL accepts a path segment");

        tracing::info!(%url, "downloading stream");
        let started = Instant::now();

        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(sd_hash);

        let response = self.client.get(url).send().await?.error_for_status()?;
        let total = response.content_length().unwrap_or(0);
        let mut body = response.bytes_stream();

        let mut file = tokio::fs::File::create(&dest).await?;
        let mut loaded = 0u64;
        let mut logged_quarter = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            loaded += chunk.len() as u64;
            file.write_all(&chunk).await?;

            // Log at every 25% step, once.
            if total > 0 {
                let quarter = loaded * 4 / total;
                if quarter > logged_quarter {
                    logged_quarter = quarter;
                    let rate = (loaded as f64 / started.elapsed().as_secs_f64()) as u64;
                    tracing::debug!(
                        size = total,
                        progress = quarter * 25,
                        rate,
                        "download progress"
                    );
                }
            }
        }
        file.flush().await?;

        let rate = (loaded as f64 / started.elapsed().as_secs_f64()) as u64;
        tracing::info!(size = loaded, rate, seconds_spent = started.elapsed().as_secs(), "stream downloaded");
        Ok(dest)
    }
}
