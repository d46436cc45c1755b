use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;

use library::{AddParams, Library, Video};
use mfr::{Admission, Pool, Popped, Queue, Status};

use crate::cache::TtlCache;
use crate::config::ChannelConfig;
use crate::request::TranscodingRequest;
use crate::resolve::{ResolveError, Resolver};
use crate::{VideoError, VideoReply};

/// Support, in whole tokens, at which a channel qualifies for the `level5`
/// queue without being allow-listed.
pub const LEVEL5_SUPPORT_THRESHOLD: i64 = 1000;

const CLAIM_CACHE_TTL: Duration = Duration::from_secs(300);
const VIDEO_CACHE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_CACHE_ENTRIES: usize = 65_536;

/// Tunables for [`VideoManager::new`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Hits required before a `common`-queue item becomes dequeueable.
    pub common_min_hits: u64,
    /// Optional backlog bound applied to every queue.
    pub max_backlog: Option<usize>,
    /// Entry bound of the resolution and library read caches.
    pub cache_entries: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            common_min_hits: 0,
            max_backlog: None,
            cache_entries: DEFAULT_CACHE_ENTRIES,
        }
    }
}

/// Front door of the transcoding service: resolves URIs, consults the
/// library, and admits misses into the pool.
pub struct VideoManager {
    library: Arc<Library>,
    pool: Pool<Arc<TranscodingRequest>>,
    resolver: Arc<dyn Resolver>,
    channels: Arc<ChannelConfig>,
    claim_cache: TtlCache<Arc<TranscodingRequest>>,
    video_cache: TtlCache<Option<Video>>,
    out: Mutex<Option<mpsc::Receiver<Popped<Arc<TranscodingRequest>>>>>,
}

impl VideoManager {
    /// Build a manager with the recognized admission queues, in priority
    /// order: `priority` and `enabled` (allow lists), `level5` (support
    /// threshold), and the catch-all `common` gated on
    /// [`ManagerOptions::common_min_hits`].
    pub fn new(
        library: Arc<Library>,
        resolver: Arc<dyn Resolver>,
        channels: ChannelConfig,
        options: ManagerOptions,
    ) -> Arc<Self> {
        let channels = Arc::new(channels);
        let mut pool = Pool::new();

        let new_queue = |name: &str, min_hits: u64| {
            let queue = Queue::new(name, min_hits);
            match options.max_backlog {
                Some(max) => queue.with_max_size(max),
                None => queue,
            }
        };

        let cfg = channels.clone();
        pool.add_queue(
            new_queue("priority", 0),
            Box::new(move |key, r: &Arc<TranscodingRequest>, queue| {
                if !cfg.is_priority(&r.channel_uri) {
                    return false;
                }
                tracing::info!(uri = %r.uri, "accepted for 'priority' queue");
                r.attach_queue(queue);
                queue.hit(key, r.clone())
            }),
        );

        let cfg = channels.clone();
        pool.add_queue(
            new_queue("enabled", 0),
            Box::new(move |key, r: &Arc<TranscodingRequest>, queue| {
                if !cfg.is_enabled(&r.channel_uri) {
                    return false;
                }
                tracing::debug!(uri = %r.uri, "accepted for 'enabled' queue");
                r.attach_queue(queue);
                queue.hit(key, r.clone())
            }),
        );

        pool.add_queue(
            new_queue("level5", 0),
            Box::new(move |key, r: &Arc<TranscodingRequest>, queue| {
                if r.channel_support_amount < LEVEL5_SUPPORT_THRESHOLD {
                    return false;
                }
                tracing::debug!(
                    uri = %r.uri,
                    support_amount = r.channel_support_amount,
                    "accepted for 'level5' queue"
                );
                r.attach_queue(queue);
                queue.hit(key, r.clone())
            }),
        );

        pool.add_queue(
            new_queue("common", options.common_min_hits),
            Box::new(move |key, r: &Arc<TranscodingRequest>, queue| {
                r.attach_queue(queue);
                queue.hit(key, r.clone())
            }),
        );

        let out = pool.start();

        Arc::new(Self {
            library,
            pool,
            resolver,
            channels,
            claim_cache: TtlCache::new(CLAIM_CACHE_TTL, options.cache_entries),
            video_cache: TtlCache::new(VIDEO_CACHE_TTL, options.cache_entries),
            out: Mutex::new(Some(out)),
        })
    }

    /// Answer a client request for `uri`: the artifact if the library has
    /// it, otherwise the outcome of admission into the pool.
    #[tracing::instrument(skip(self))]
    pub async fn video(&self, uri: &str) -> Result<VideoReply, VideoError> {
        let uri = uri.strip_prefix("lbry://").unwrap_or(uri);
        let request = self.resolve_request(uri).await?;

        if self.channels.is_disabled(&request.channel_uri) {
            return Err(VideoError::ChannelNotEnabled);
        }

        if let Some(video) = self.get_video(&request.sd_hash).await? {
            return Ok(VideoReply::Ready(video));
        }

        match self.pool.admit(&request.sd_hash, &request) {
            Admission::Queued => Ok(VideoReply::Queued),
            Admission::Underway => Ok(VideoReply::Underway),
            Admission::Forbidden => Err(VideoError::TranscodingForbidden),
        }
    }

    /// The stream of admitted requests, drained evenly across queues. May
    /// only be taken once; workers share the returned receiver.
    pub fn requests(&self) -> mpsc::Receiver<Arc<TranscodingRequest>> {
        let mut out = self
            .out
            .lock()
            .unwrap()
            .take()
            .expect("requests() may only be called once");

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            while let Some(popped) = out.recv().await {
                tracing::info!(uri = %popped.value.uri, hits = popped.hits, "pulling out next request");
                if tx.send(popped.value).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    /// First non-none status for the fingerprint across the pool's queues.
    pub fn request_status(&self, sd_hash: &str) -> Status {
        self.pool.status(sd_hash)
    }

    /// Current queue backlogs, in priority order.
    pub fn queue_sizes(&self) -> Vec<(String, usize)> {
        self.pool.queue_sizes()
    }

    /// Stop the pool scheduler; `requests()` consumers observe
    /// end-of-stream.
    pub fn stop(&self) {
        self.pool.stop();
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    /// Record a freshly transcoded stream, invalidating the read cache.
    pub async fn record_transcoded(&self, params: AddParams) -> Result<Video, VideoError> {
        let library = self.library.clone();
        let sd_hash = params.sd_hash.clone();
        let video = tokio::task::spawn_blocking(move || library.add(params))
            .await
            .context("library add task failed")?
            .context("recording transcoded stream")?;
        self.video_cache.invalidate(&video_key(&sd_hash));
        Ok(video)
    }

    /// Record the remote location of an uploaded artifact, invalidating the
    /// read cache.
    pub async fn record_uploaded(&self, sd_hash: &str, remote_path: &str) -> Result<(), VideoError> {
        let library = self.library.clone();
        let hash = sd_hash.to_string();
        let remote = remote_path.to_string();
        tokio::task::spawn_blocking(move || library.update_remote_path(&hash, &remote))
            .await
            .context("library update task failed")?
            .context("recording uploaded stream")?;
        self.video_cache.invalidate(&video_key(sd_hash));
        Ok(())
    }

    async fn resolve_request(&self, uri: &str) -> Result<Arc<TranscodingRequest>, VideoError> {
        let resolver = self.resolver.clone();
        let target = uri.to_string();
        let result = self
            .claim_cache
            .fetch(&format!("claim:{uri}"), move || async move {
                let claim = resolver.resolve(&target).await?;
                let request = TranscodingRequest::from_claim(&target, &claim)?;
                Ok(Arc::new(request))
            })
            .await;

        result.map_err(|err| match err.downcast_ref::<ResolveError>() {
            Some(ResolveError::StreamNotFound) => VideoError::StreamNotFound,
            Some(ResolveError::NoSigningChannel) => VideoError::NoSigningChannel,
            _ => VideoError::Internal(anyhow::anyhow!("resolving {uri}: {err:#}")),
        })
    }

    /// Read-through library lookup, cached briefly to keep status polls from
    /// hammering SQLite.
    async fn get_video(&self, sd_hash: &str) -> Result<Option<Video>, VideoError> {
        let library = self.library.clone();
        let hash = sd_hash.to_string();
        let result = self
            .video_cache
            .fetch(&video_key(sd_hash), move || async move {
                tokio::task::spawn_blocking(move || library.get(&hash))
                    .await
                    .context("library lookup task failed")?
                    .context("library lookup")
            })
            .await;

        result.map_err(|err| VideoError::Internal(anyhow::anyhow!("library lookup: {err:#}")))
    }
}

fn video_key(sd_hash: &str) -> String {
    format!("video:{sd_hash}")
}
