use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use manager::TranscodingRequest;

use crate::download::Downloader;
use crate::encoder::{EncodeError, Encoder};
use crate::storage::{RemoteStream, StorageDriver, StorageError};
use crate::stream::{LocalStream, Manifest};
use crate::{DIR_STREAMS, DIR_TRANSCODED};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Downloading,
    Encoding,
    Uploading,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskProgress {
    pub stage: Stage,
    pub percent: f32,
}

/// A failed task, classified for the worker: fatal errors finish the
/// request, non-fatal errors return it to its queue. When the encoded
/// artifact survived the failure it is carried along so the worker can still
/// record it.
#[derive(Debug, thiserror::Error)]
#[error("{stage:?} stage failed")]
pub struct TaskError {
    pub stage: Stage,
    pub fatal: bool,
    pub local: Option<LocalStream>,
    #[source]
    pub source: anyhow::Error,
}

impl TaskError {
    fn fatal(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            fatal: true,
            local: None,
            source: source.into(),
        }
    }

    fn non_fatal(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            fatal: false,
            local: None,
            source: source.into(),
        }
    }

    fn with_local(mut self, local: LocalStream) -> Self {
        self.local = Some(local);
        self
    }
}

/// A finished task.
#[derive(Debug)]
pub struct TaskOutcome {
    pub local: LocalStream,
    pub remote: RemoteStream,
    /// The remote already held the stream; nothing was transferred.
    pub already_uploaded: bool,
}

/// Handle to an in-flight task. Progress events for a stage precede the
/// task's terminal outcome; the progress channel closes before the outcome
/// is delivered.
pub struct TaskHandle {
    pub progress: mpsc::Receiver<TaskProgress>,
    pub outcome: oneshot::Receiver<Result<TaskOutcome, TaskError>>,
}

/// The per-task download → encode → upload pipeline.
pub struct Pipeline {
    streams_dir: PathBuf,
    transcoded_dir: PathBuf,
    downloader: Arc<dyn Downloader>,
    encoder: Arc<dyn Encoder>,
    storage: Arc<dyn StorageDriver>,
}

impl Pipeline {
    pub fn new(
        work_dir: impl AsRef<Path>,
        downloader: Arc<dyn Downloader>,
        encoder: Arc<dyn Encoder>,
        storage: Arc<dyn StorageDriver>,
    ) -> std::io::Result<Self> {
        let work_dir = work_dir.as_ref();
        let streams_dir = work_dir.join(DIR_STREAMS);
        let transcoded_dir = work_dir.join(DIR_TRANSCODED);
        std::fs::create_dir_all(&streams_dir)?;
        std::fs::create_dir_all(&transcoded_dir)?;
        Ok(Self {
            streams_dir,
            transcoded_dir,
            downloader,
            encoder,
            storage,
        })
    }

    pub fn transcoded_dir(&self) -> &Path {
        &self.transcoded_dir
    }

    /// Run the pipeline for one request.
    pub fn process(&self, request: Arc<TranscodingRequest>, cancel: CancellationToken) -> TaskHandle {
        let (progress_tx, progress_rx) = mpsc::channel(16);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let task = Task {
            streams_dir: self.streams_dir.clone(),
            transcoded_dir: self.transcoded_dir.clone(),
            downloader: self.downloader.clone(),
            encoder: self.encoder.clone(),
            storage: self.storage.clone(),
            cancel,
        };

        tokio::spawn(async move {
            let result = task.run(request, progress_tx).await;
            if let Err(err) = &result {
                tracing::error!(
                    stage = ?err.stage,
                    fatal = err.fatal,
                    error = ?err.source,
                    "task failed"
                );
            }
            let _ = outcome_tx.send(result);
        });

        TaskHandle {
            progress: progress_rx,
            outcome: outcome_rx,
        }
    }
}

struct Task {
    streams_dir: PathBuf,
    transcoded_dir: PathBuf,
    downloader: Arc<dyn Downloader>,
    encoder: Arc<dyn Encoder>,
    storage: Arc<dyn StorageDriver>,
    cancel: CancellationToken,
}

impl Task {
    async fn run(
        &self,
        request: Arc<TranscodingRequest>,
        progress: mpsc::Sender<TaskProgress>,
    ) -> Result<TaskOutcome, TaskError> {
        let sd_hash = &request.sd_hash;

        // Download the origin bytes. Failures here are transient network
        // faults: the request is re-queueable.
        let _ = progress
            .send(TaskProgress { stage: Stage::Downloading, percent: 0.0 })
            .await;
        if self.cancel.is_cancelled() {
            return Err(TaskError::non_fatal(Stage::Downloading, cancelled()));
        }
        let original = self
            .downloader
            .download(sd_hash, &self.streams_dir)
            .await
            .map_err(|err| TaskError::non_fatal(Stage::Downloading, err))?;
        let _original = Cleanup::new(original.clone());

        // Encode. A failing encoder means bad input or a broken encoder;
        // retrying would fail the same way.
        let _ = progress
            .send(TaskProgress { stage: Stage::Encoding, percent: 0.0 })
            .await;
        if self.cancel.is_cancelled() {
            return Err(TaskError::non_fatal(Stage::Encoding, cancelled()));
        }
        let encoded_dir = self.transcoded_dir.join(sd_hash);
        let mut encoded_guard = Cleanup::new(encoded_dir.clone());

        let mut encoding = self
            .encoder
            .encode(&original, &encoded_dir, &self.cancel)
            .await
            .map_err(|err| TaskError::fatal(Stage::Encoding, err))?;

        // The encoder observes the same stop signal and terminates its
        // subprocess itself; the progress channel then closes and the result
        // reports the cancellation. The output directory must not be cleaned
        // up until that result arrives.
        let mut last_percent = None;
        while let Some(value) = encoding.progress.recv().await {
            let percent = value.ceil() as u32;
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                let _ = progress
                    .send(TaskProgress { stage: Stage::Encoding, percent: percent as f32 })
                    .await;
            }
        }
        let output = encoding
            .result
            .await
            .map_err(|_| TaskError::fatal(Stage::Encoding, anyhow::anyhow!("encoder terminated without a result")))?
            .map_err(|err| match err {
                EncodeError::Cancelled => TaskError::non_fatal(Stage::Encoding, err),
                err => TaskError::fatal(Stage::Encoding, err),
            })?;

        let manifest = Manifest {
            url: request.uri.clone(),
            sd_hash: sd_hash.clone(),
            formats: output.ladder.tiers.clone(),
        };
        let local = LocalStream::create(&encoded_dir, manifest).map_err(|err| {
            TaskError::fatal(Stage::Encoding, anyhow::Error::from(err).context("stream object initialization failed"))
        })?;
        encoded_guard.disarm();
        tracing::info!(
            %sd_hash,
            size = local.size(),
            tiers = output.ladder.tiers.len(),
            "encoding done"
        );

        // Upload. The artifact stays on disk either way; if the upload
        // fails, the sweeper gets another chance at it.
        let _ = progress
            .send(TaskProgress { stage: Stage::Uploading, percent: 0.0 })
            .await;
        match self.storage.put(&local, &self.cancel).await {
            Ok(remote) => {
                let _ = progress
                    .send(TaskProgress { stage: Stage::Uploading, percent: 100.0 })
                    .await;
                Ok(TaskOutcome { local, remote, already_uploaded: false })
            }
            // The remote already has the stream: record its path and finish.
            Err(StorageError::StreamExists(remote)) => {
                tracing::info!(%sd_hash, remote_path = %remote.url, "stream already uploaded");
                Ok(TaskOutcome { local, remote, already_uploaded: true })
            }
            Err(err) => {
                Err(TaskError::non_fatal(Stage::Uploading, err).with_local(local))
            }
        }
    }
}

fn cancelled() -> anyhow::Error {
    anyhow::anyhow!("task cancelled")
}

/// Removes a path on drop unless disarmed. Keeps stage artifacts from
/// leaking on error and cancellation paths.
struct Cleanup {
    path: PathBuf,
    armed: bool,
}

impl Cleanup {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let result = if self.path.is_dir() {
            std::fs::remove_dir_all(&self.path)
        } else {
            std::fs::remove_file(&self.path)
        };
        if let Err(err) = result {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), ?err, "failed to clean up stage artifact");
            }
        }
    }
}
