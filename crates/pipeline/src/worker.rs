use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use library::AddParams;
use manager::{TranscodingRequest, VideoManager};

use crate::pipeline::Pipeline;
use crate::stream::LocalStream;

/// Media type recorded for transcoded artifacts.
const MEDIA_TYPE_HLS: &str = "hls";

/// Spawn `count` encoder workers pulling from the manager's request stream.
///
/// Workers share one receiver, so the pool's hand-off channel remains the
/// only buffer between scheduler and workers: a request is only popped when
/// some worker is ready for it.
pub fn spawn_workers(
    count: usize,
    manager: Arc<VideoManager>,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) {
    tracing::info!(count, "starting encoder workers");
    let requests = Arc::new(Mutex::new(manager.requests()));
    for id in 0..count {
        tokio::spawn(worker_loop(
            id,
            requests.clone(),
            manager.clone(),
            pipeline.clone(),
            cancel.clone(),
        ));
    }
}

async fn worker_loop(
    id: usize,
    requests: Arc<Mutex<mpsc::Receiver<Arc<TranscodingRequest>>>>,
    manager: Arc<VideoManager>,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = requests.lock().await;
            tokio::select! {
                request = rx.recv() => request,
                () = cancel.cancelled() => return,
            }
        };
        let Some(request) = next else {
            tracing::info!(worker = id, "request stream closed, worker exiting");
            return;
        };
        process_one(&manager, &pipeline, request, &cancel).await;
    }
}

/// Drive one request through the pipeline and apply its lifecycle outcome.
async fn process_one(
    manager: &VideoManager,
    pipeline: &Pipeline,
    request: Arc<TranscodingRequest>,
    cancel: &CancellationToken,
) {
    tracing::info!(uri = %request.uri, sd_hash = %request.sd_hash, "processing transcoding request");
    let mut handle = pipeline.process(request.clone(), cancel.child_token());

    while let Some(progress) = handle.progress.recv().await {
        tracing::debug!(
            uri = %request.uri,
            stage = ?progress.stage,
            percent = progress.percent,
            "task progress"
        );
    }

    let result = match handle.outcome.await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(uri = %request.uri, "task ended without an outcome");
            request.release();
            return;
        }
    };

    match result {
        Ok(outcome) => {
            let recorded = record_local(manager, &request, &outcome.local).await;
            let recorded = match recorded {
                Ok(()) => manager
                    .record_uploaded(&request.sd_hash, &outcome.remote.url)
                    .await,
                err => err,
            };
            if let Err(err) = recorded {
                tracing::error!(uri = %request.uri, error = ?err, "failed to record artifact");
                request.release();
                return;
            }
            request.complete();
        }
        Err(err) if err.fatal => {
            request.reject();
        }
        Err(err) => {
            // An artifact that survived a retryable failure is recorded
            // local-only; the sweeper picks up its upload.
            if let Some(local) = &err.local {
                if let Err(record_err) = record_local(manager, &request, local).await {
                    tracing::error!(uri = %request.uri, error = ?record_err, "failed to record local stream");
                }
            }
            request.release();
        }
    }
}

async fn record_local(
    manager: &VideoManager,
    request: &TranscodingRequest,
    local: &LocalStream,
) -> Result<(), manager::VideoError> {
    manager
        .record_transcoded(AddParams {
            url: request.uri.clone(),
            sd_hash: request.sd_hash.clone(),
            media_type: MEDIA_TYPE_HLS.into(),
            channel: request.channel_uri.clone(),
            path: local.path().display().to_string(),
            size: local.size(),
            checksum: Some(local.checksum().to_string()),
        })
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{EncodeError, EncodeOutput, Encoder, Encoding, Ladder};
    use crate::download::{DownloadError, Downloader};
    use crate::storage::{RemoteStream, StorageDriver, StorageError};
    use manager::{
        ChannelConfig, Claim, ClaimSource, ClaimValue, ManagerOptions, ResolveError, Resolver,
        SigningChannel,
    };
    use mfr::Status;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const URI: &str = "@chan#f/stream#1";

    fn sd_hash() -> String {
        "ab".repeat(48)
    }

    struct StaticResolver(Claim);

    #[async_trait::async_trait]
    impl Resolver for StaticResolver {
        async fn resolve(&self, _uri: &str) -> Result<Claim, ResolveError> {
            Ok(self.0.clone())
        }
    }

    struct MockDownloader {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Downloader for MockDownloader {
        async fn download(&self, sd_hash: &str, dest_dir: &Path) -> Result<PathBuf, DownloadError> {
            if self.fail {
                return Err(DownloadError::Io(std::io::Error::other("network fault")));
            }
            let dest = dest_dir.join(sd_hash);
            std::fs::write(&dest, b"original media").map_err(DownloadError::Io)?;
            Ok(dest)
        }
    }

    struct MockEncoder {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Encoder for MockEncoder {
        async fn encode(
            &self,
            _input: &Path,
            out_dir: &Path,
            _cancel: &CancellationToken,
        ) -> Result<Encoding, EncodeError> {
            if self.fail {
                return Err(EncodeError::Probe("bad input".into()));
            }
            std::fs::create_dir_all(out_dir)?;
            std::fs::write(out_dir.join("master.m3u8"), "#EXTM3U")?;

            let (progress_tx, progress) = tokio::sync::mpsc::channel(16);
            let (result_tx, result) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                for percent in [25.0, 25.4, 100.0] {
                    let _ = progress_tx.send(percent).await;
                }
                drop(progress_tx);
                let _ = result_tx.send(Ok(EncodeOutput { ladder: Ladder::default() }));
            });
            Ok(Encoding { progress, result })
        }
    }

    /// Encodes "forever" until its stop signal fires, like a real subprocess
    /// would. Records whether it was actually terminated.
    struct SlowEncoder {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Encoder for SlowEncoder {
        async fn encode(
            &self,
            _input: &Path,
            out_dir: &Path,
            cancel: &CancellationToken,
        ) -> Result<Encoding, EncodeError> {
            std::fs::create_dir_all(out_dir)?;
            std::fs::write(out_dir.join("master.m3u8"), "#EXTM3U")?;

            let (progress_tx, progress) = tokio::sync::mpsc::channel(16);
            let (result_tx, result) = tokio::sync::oneshot::channel();
            let cancel = cancel.clone();
            let stopped = self.stopped.clone();
            tokio::spawn(async move {
                let _ = progress_tx.send(10.0).await;
                tokio::select! {
                    () = cancel.cancelled() => {
                        stopped.store(true, Ordering::SeqCst);
                        drop(progress_tx);
                        let _ = result_tx.send(Err(EncodeError::Cancelled));
                    }
                    () = tokio::time::sleep(std::time::Duration::from_secs(30)) => {
                        drop(progress_tx);
                        let _ = result_tx.send(Ok(EncodeOutput { ladder: Ladder::default() }));
                    }
                }
            });
            Ok(Encoding { progress, result })
        }
    }

    enum UploadMode {
        Ok,
        Exists,
        Fail,
    }

    struct MockStorage {
        mode: UploadMode,
        puts: AtomicUsize,
    }

    impl MockStorage {
        fn new(mode: UploadMode) -> Self {
            Self {
                mode,
                puts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl StorageDriver for MockStorage {
        async fn put(
            &self,
            stream: &LocalStream,
            _cancel: &CancellationToken,
        ) -> Result<RemoteStream, StorageError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            let remote = RemoteStream {
                url: format!("https://cdn.example.com/t/{}", stream.sd_hash()),
            };
            match self.mode {
                UploadMode::Ok => Ok(remote),
                UploadMode::Exists => Err(StorageError::StreamExists(remote)),
                UploadMode::Fail => Err(StorageError::Rejected(500)),
            }
        }
    }

    struct Fixture {
        manager: Arc<VideoManager>,
        pipeline: Arc<Pipeline>,
        requests: mpsc::Receiver<Arc<TranscodingRequest>>,
        _work_dir: tempfile::TempDir,
    }

    fn fixture(
        downloader: MockDownloader,
        encoder: impl Encoder,
        storage: MockStorage,
    ) -> Fixture {
        let claim = Claim {
            canonical_url: format!("lbry://{URI}"),
            name: "stream".into(),
            normalized_name: "stream".into(),
            claim_id: "beef".into(),
            signing_channel: Some(SigningChannel {
                canonical_url: "lbry://@chan#f".into(),
                meta: Default::default(),
            }),
            value: Some(ClaimValue {
                source: Some(ClaimSource { sd_hash: sd_hash() }),
            }),
        };
        let manager = VideoManager::new(
            Arc::new(library::Library::open_in_memory().unwrap()),
            Arc::new(StaticResolver(claim)),
            ChannelConfig::new(vec!["@chan#f"], vec![], vec![]),
            ManagerOptions::default(),
        );
        let work_dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(
            Pipeline::new(
                work_dir.path(),
                Arc::new(downloader),
                Arc::new(encoder),
                Arc::new(storage),
            )
            .unwrap(),
        );
        let requests = manager.requests();
        Fixture {
            manager,
            pipeline,
            requests,
            _work_dir: work_dir,
        }
    }

    /// Admit the fixture URI and pull it off the request stream, leaving the
    /// scheduler stopped so queue states stay put for assertions.
    async fn admit_and_take(fx: &mut Fixture) -> Arc<TranscodingRequest> {
        fx.manager.video(URI).await.unwrap();
        let request = fx.requests.recv().await.unwrap();
        fx.manager.stop();
        request
    }

    #[tokio::test]
    async fn success_records_artifact_and_completes() {
        let mut fx = fixture(
            MockDownloader { fail: false },
            MockEncoder { fail: false },
            MockStorage::new(UploadMode::Ok),
        );
        let request = admit_and_take(&mut fx).await;

        process_one(&fx.manager, &fx.pipeline, request.clone(), &CancellationToken::new()).await;

        assert_eq!(fx.manager.request_status(&sd_hash()), Status::Done);
        let video = fx.manager.library().get(&sd_hash()).unwrap().unwrap();
        assert_eq!(video.remote_path, format!("https://cdn.example.com/t/{}", sd_hash()));
        assert_eq!(video.media_type, "hls");
        assert!(video.size > 0);

        // The downloaded original is cleaned up; the artifact remains.
        let streams: Vec<_> = std::fs::read_dir(fx._work_dir.path().join(crate::DIR_STREAMS))
            .unwrap()
            .collect();
        assert!(streams.is_empty());
        assert!(fx.pipeline.transcoded_dir().join(sd_hash()).join("manifest.json").exists());
    }

    #[tokio::test]
    async fn fatal_encoder_error_rejects_request() {
        let mut fx = fixture(
            MockDownloader { fail: false },
            MockEncoder { fail: true },
            MockStorage::new(UploadMode::Ok),
        );
        let request = admit_and_take(&mut fx).await;

        process_one(&fx.manager, &fx.pipeline, request, &CancellationToken::new()).await;

        assert_eq!(fx.manager.request_status(&sd_hash()), Status::Done);
        assert!(fx.manager.library().get(&sd_hash()).unwrap().is_none());
        // No partial output is left behind.
        assert!(!fx.pipeline.transcoded_dir().join(sd_hash()).exists());
    }

    #[tokio::test]
    async fn transient_download_error_releases_request() {
        let mut fx = fixture(
            MockDownloader { fail: true },
            MockEncoder { fail: false },
            MockStorage::new(UploadMode::Ok),
        );
        let request = admit_and_take(&mut fx).await;

        process_one(&fx.manager, &fx.pipeline, request, &CancellationToken::new()).await;

        assert_eq!(fx.manager.request_status(&sd_hash()), Status::Queued);
        assert!(fx.manager.library().get(&sd_hash()).unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_upload_releases_but_keeps_local_record() {
        let mut fx = fixture(
            MockDownloader { fail: false },
            MockEncoder { fail: false },
            MockStorage::new(UploadMode::Fail),
        );
        let request = admit_and_take(&mut fx).await;

        process_one(&fx.manager, &fx.pipeline, request, &CancellationToken::new()).await;

        // Released for another round, but the encoded artifact is recorded
        // local-only for the sweeper.
        assert_eq!(fx.manager.request_status(&sd_hash()), Status::Queued);
        let video = fx.manager.library().get(&sd_hash()).unwrap().unwrap();
        assert!(video.is_local_only());
        assert!(fx.pipeline.transcoded_dir().join(sd_hash()).exists());
    }

    #[tokio::test]
    async fn existing_remote_stream_completes_without_reupload() {
        let mut fx = fixture(
            MockDownloader { fail: false },
            MockEncoder { fail: false },
            MockStorage::new(UploadMode::Exists),
        );
        let request = admit_and_take(&mut fx).await;

        process_one(&fx.manager, &fx.pipeline, request, &CancellationToken::new()).await;

        assert_eq!(fx.manager.request_status(&sd_hash()), Status::Done);
        let video = fx.manager.library().get(&sd_hash()).unwrap().unwrap();
        assert!(!video.is_local_only());
    }

    #[tokio::test]
    async fn cancellation_terminates_inflight_encode_before_cleanup() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut fx = fixture(
            MockDownloader { fail: false },
            SlowEncoder { stopped: stopped.clone() },
            MockStorage::new(UploadMode::Ok),
        );
        let request = admit_and_take(&mut fx).await;

        let cancel = CancellationToken::new();
        let mut handle = fx.pipeline.process(request, cancel.clone());

        // Wait until the encode is demonstrably in flight, then pull the
        // stop signal.
        loop {
            let progress = handle.progress.recv().await.expect("encode is under way");
            if progress.stage == crate::pipeline::Stage::Encoding && progress.percent == 10.0 {
                break;
            }
        }
        cancel.cancel();
        while handle.progress.recv().await.is_some() {}

        let err = handle.outcome.await.unwrap().unwrap_err();
        assert!(!err.fatal);

        // The encoder was terminated through its stop interface, and only
        // then was the partial output directory cleaned up.
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!fx.pipeline.transcoded_dir().join(sd_hash()).exists());
    }

    #[tokio::test]
    async fn progress_suppresses_duplicate_integer_percents() {
        let mut fx = fixture(
            MockDownloader { fail: false },
            MockEncoder { fail: false },
            MockStorage::new(UploadMode::Ok),
        );
        let request = admit_and_take(&mut fx).await;

        let mut handle = fx.pipeline.process(request, CancellationToken::new());
        let mut events = Vec::new();
        while let Some(progress) = handle.progress.recv().await {
            events.push((progress.stage, progress.percent as u32));
        }
        handle.outcome.await.unwrap().unwrap();

        use crate::pipeline::Stage::*;
        // 25.0 and 25.4 both round up to distinct integers (25 and 26);
        // repeated integers would be dropped.
        assert_eq!(
            events,
            vec![
                (Downloading, 0),
                (Encoding, 0),
                (Encoding, 25),
                (Encoding, 26),
                (Encoding, 100),
                (Uploading, 0),
                (Uploading, 100),
            ]
        );
    }
}
