use tokio_util::sync::CancellationToken;
use url::Url;

use crate::stream::{LocalStream, StreamError};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The remote already holds this stream. Carries the remote handle so
    /// callers can record the path without re-uploading.
    #[error("stream already exists in remote storage")]
    StreamExists(RemoteStream),
    #[error("upload request failed")]
    Transport(#[from] reqwest::Error),
    #[error("failed to read local stream")]
    Stream(#[from] StreamError),
    #[error("upload rejected with status {0}")]
    Rejected(u16),
    #[error("upload cancelled")]
    Cancelled,
}

/// Handle to a stream held in remote object storage.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub url: String,
}

/// The object storage contract: uploads every file of a local stream under
/// the stream's fingerprint key.
#[async_trait::async_trait]
pub trait StorageDriver: Send + Sync + 'static {
    async fn put(
        &self,
        stream: &LocalStream,
        cancel: &CancellationToken,
    ) -> Result<RemoteStream, StorageError>;
}

/// Uploads streams to an S3-style HTTP endpoint, one PUT per file. A
/// conflict response for the manifest key signals [`StorageError::StreamExists`].
pub struct HttpStorage {
    client: reqwest::Client,
    base: Url,
}

impl HttpStorage {
    pub fn new(base: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base,
        }
    }

    fn remote_url(&self, sd_hash: &str) -> String {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(sd_hash);
        }
        url.to_string()
    }
}

#[async_trait::async_trait]
impl StorageDriver for HttpStorage {
    #[tracing::instrument(skip_all, fields(sd_hash = stream.sd_hash()))]
    async fn put(
        &self,
        stream: &LocalStream,
        cancel: &CancellationToken,
    ) -> Result<RemoteStream, StorageError> {
        let sd_hash = stream.sd_hash();
        let remote = RemoteStream {
            url: self.remote_url(sd_hash),
        };

        let mut uploaded = 0u64;
        for (path, relative) in stream.files()? {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let object = format!("{}/{relative}", remote.url);
            let body = tokio::fs::read(&path)
                .await
                .map_err(|err| StorageError::Stream(StreamError::Io(err)))?;
            let len = body.len() as u64;

            let response = tokio::select! {
                response = self.client.put(&object).body(body).send() => response?,
                () = cancel.cancelled() => return Err(StorageError::Cancelled),
            };
            let status = response.status();
            if status.is_success() {
                uploaded += len;
                metrics::counter!("recast_uploaded_bytes").increment(len);
            } else if matches!(status.as_u16(), 409 | 412) {
                return Err(StorageError::StreamExists(remote));
            } else {
                return Err(StorageError::Rejected(status.as_u16()));
            }
        }

        tracing::info!(remote_path = %remote.url, uploaded, "stream uploaded");
        Ok(remote)
    }
}
