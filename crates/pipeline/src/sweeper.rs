use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use library::Library;

use crate::is_sd_hash;
use crate::storage::{StorageDriver, StorageError};
use crate::stream::LocalStream;

/// Spawn the uploader sweeper: a background loop that finds local-only
/// artifacts — library rows without a remote path, plus leftover directories
/// in `transcoded_dir` whose names have the fingerprint shape — and pushes
/// them to remote storage.
pub fn spawn_sweeper(
    library: Arc<Library>,
    storage: Arc<dyn StorageDriver>,
    transcoded_dir: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tracing::info!("starting uploader sweeper");
    let inflight: Arc<Mutex<HashSet<String>>> = Default::default();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = cancel.cancelled() => return,
            }
            if let Err(err) = sweep(&library, &storage, &transcoded_dir, &inflight, &cancel).await {
                tracing::error!(error = ?err, "sweep failed");
            }
        }
    })
}

async fn sweep(
    library: &Arc<Library>,
    storage: &Arc<dyn StorageDriver>,
    transcoded_dir: &Path,
    inflight: &Arc<Mutex<HashSet<String>>>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let lib = library.clone();
    let rows = tokio::task::spawn_blocking(move || lib.list_local_only()).await??;

    let mut candidates: Vec<(String, PathBuf)> = rows
        .into_iter()
        .map(|v| (v.sd_hash, PathBuf::from(v.path)))
        .collect();
    let known: HashSet<String> = candidates.iter().map(|(h, _)| h.clone()).collect();

    // Leftover output directories from interrupted runs.
    let mut entries = tokio::fs::read_dir(transcoded_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if is_sd_hash(&name) && !known.contains(&name) {
            candidates.push((name, entry.path()));
        }
    }

    for (sd_hash, path) in candidates {
        // One upload per fingerprint at a time.
        if !inflight.lock().unwrap().insert(sd_hash.clone()) {
            continue;
        }
        tokio::spawn(upload_one(
            library.clone(),
            storage.clone(),
            sd_hash,
            path,
            inflight.clone(),
            cancel.clone(),
        ));
    }
    Ok(())
}

async fn upload_one(
    library: Arc<Library>,
    storage: Arc<dyn StorageDriver>,
    sd_hash: String,
    path: PathBuf,
    inflight: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
) {
    let result = try_upload(&library, &storage, &sd_hash, &path, &cancel).await;
    match result {
        Ok(remote_path) => {
            // The guard entry is kept: a swept fingerprint is never
            // re-dispatched within this process.
            tracing::info!(%sd_hash, %remote_path, "sweeper uploaded stream");
        }
        Err(err) => {
            tracing::warn!(%sd_hash, error = ?err, "sweeper upload failed");
            inflight.lock().unwrap().remove(&sd_hash);
        }
    }
}

async fn try_upload(
    library: &Arc<Library>,
    storage: &Arc<dyn StorageDriver>,
    sd_hash: &str,
    path: &Path,
    cancel: &CancellationToken,
) -> anyhow::Result<String> {
    let local = LocalStream::open(path)?;

    let remote = match storage.put(&local, cancel).await {
        Ok(remote) => remote,
        // Already uploaded: just record where it lives.
        Err(StorageError::StreamExists(remote)) => remote,
        Err(err) => return Err(err.into()),
    };

    let lib = library.clone();
    let hash = sd_hash.to_string();
    let url = remote.url.clone();
    match tokio::task::spawn_blocking(move || lib.update_remote_path(&hash, &url)).await? {
        Ok(()) => {}
        // Leftover directories may have no library row; the upload itself
        // is still worthwhile.
        Err(err) => {
            tracing::debug!(%sd_hash, error = ?err, "no library row to update for swept stream");
        }
    }
    Ok(remote.url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RemoteStream;
    use crate::stream::Manifest;
    use library::AddParams;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowStorage {
        puts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StorageDriver for SlowStorage {
        async fn put(
            &self,
            stream: &LocalStream,
            _cancel: &CancellationToken,
        ) -> Result<RemoteStream, StorageError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(RemoteStream {
                url: format!("https://cdn.example.com/t/{}", stream.sd_hash()),
            })
        }
    }

    fn stream_dir(root: &std::path::Path, sd_hash: &str) -> PathBuf {
        let dir = root.join(sd_hash);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("master.m3u8"), "#EXTM3U").unwrap();
        LocalStream::create(
            &dir,
            Manifest {
                url: "@chan#1/stream#1".into(),
                sd_hash: sd_hash.into(),
                formats: vec![],
            },
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn uploads_local_only_rows_exactly_once() {
        let work = tempfile::tempdir().unwrap();
        let sd_hash = "ab".repeat(48);
        let dir = stream_dir(work.path(), &sd_hash);

        let library = Arc::new(Library::open_in_memory().unwrap());
        library
            .add(AddParams {
                url: "@chan#1/stream#1".into(),
                sd_hash: sd_hash.clone(),
                media_type: "hls".into(),
                channel: "lbry://@chan:1".into(),
                path: dir.display().to_string(),
                size: 1,
                checksum: None,
            })
            .unwrap();

        let storage = Arc::new(SlowStorage { puts: AtomicUsize::new(0) });
        let cancel = CancellationToken::new();
        // Tick much faster than one upload takes: the in-flight guard must
        // keep the fingerprint from being dispatched twice.
        let handle = spawn_sweeper(
            library.clone(),
            storage.clone(),
            work.path().to_path_buf(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(storage.puts.load(Ordering::SeqCst), 1);
        let video = library.get(&sd_hash).unwrap().unwrap();
        assert_eq!(video.remote_path, format!("https://cdn.example.com/t/{sd_hash}"));
    }

    #[tokio::test]
    async fn sweeps_orphan_fingerprint_directories() {
        let work = tempfile::tempdir().unwrap();
        let sd_hash = "cd".repeat(48);
        stream_dir(work.path(), &sd_hash);
        // Not fingerprint-shaped: must be ignored.
        std::fs::create_dir(work.path().join("scratch")).unwrap();

        let library = Arc::new(Library::open_in_memory().unwrap());
        let storage = Arc::new(SlowStorage { puts: AtomicUsize::new(0) });
        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(
            library.clone(),
            storage.clone(),
            work.path().to_path_buf(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(storage.puts.load(Ordering::SeqCst), 1);
    }
}
