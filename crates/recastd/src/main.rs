use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::FutureExt;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use pipeline::StorageDriver;

/// recastd is the control plane of the recast video transcoding service: it
/// admits transcoding requests through a most-frequently-requested pool,
/// runs encoder workers, and publishes finished streams to object storage.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the artifact library database.
    #[clap(long = "db-path", env = "DB_PATH", default_value = "video.db")]
    db_path: std::path::PathBuf,
    /// Directory holding stream downloads and transcoded outputs.
    #[clap(long = "work-dir", env = "WORK_DIR", default_value = ".")]
    work_dir: std::path::PathBuf,
    /// Number of concurrent encoder workers.
    #[clap(long, env = "WORKERS", default_value = "3")]
    workers: usize,
    /// Hits required before a common-queue stream becomes transcodable.
    #[clap(long = "min-hits", env = "MIN_HITS", default_value = "3")]
    min_hits: u64,
    /// Optional bound on each admission queue's backlog.
    #[clap(long = "max-backlog", env = "MAX_BACKLOG")]
    max_backlog: Option<usize>,
    /// Entry bound of the resolution and library read caches.
    #[clap(long = "cache-size", env = "CACHE_SIZE", default_value = "65536")]
    cache_size: usize,
    /// Channels whose streams are always admitted first. May be specified
    /// multiple times or comma-separated.
    #[clap(long = "priority-channel", env = "PRIORITY_CHANNELS", value_delimiter = ',')]
    priority_channels: Vec<String>,
    /// Channels whose streams are always admitted.
    #[clap(long = "enabled-channel", env = "ENABLED_CHANNELS", value_delimiter = ',')]
    enabled_channels: Vec<String>,
    /// Channels whose streams are never transcoded.
    #[clap(long = "disabled-channel", env = "DISABLED_CHANNELS", value_delimiter = ',')]
    disabled_channels: Vec<String>,
    /// Resolver JSON-RPC endpoint.
    #[clap(
        long = "resolver",
        env = "RESOLVER_URL",
        default_value = "https://api.na-backend.odysee.com/api/v1/proxy"
    )]
    resolver: url::Url,
    /// Blob server streams are downloaded from.
    #[clap(
        long = "blob-server",
        env = "BLOB_SERVER",
        default_value = "https://blobcache-us.lbry.com"
    )]
    blob_server: url::Url,
    /// Object storage endpoint transcoded streams are uploaded to.
    #[clap(long = "storage", env = "STORAGE_URL")]
    storage: url::Url,
    /// Address to serve the HTTP API on.
    #[clap(long, env = "BIND", default_value = "127.0.0.1:8080")]
    bind: String,
}

fn main() -> anyhow::Result<()> {
    // Use reasonable defaults for printing structured logs to stderr.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(?args, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(Duration::from_secs(5));
    result?
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    // Bind early so requests dispatched during startup are not refused.
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .context("failed to bind server port")?;

    let library = Arc::new(library::Library::open(&args.db_path).context("opening video library")?);
    let channels = manager::ChannelConfig::new(
        &args.priority_channels,
        &args.enabled_channels,
        &args.disabled_channels,
    );
    let manager = manager::VideoManager::new(
        library.clone(),
        Arc::new(manager::JsonRpcResolver::new(args.resolver.clone())),
        channels,
        manager::ManagerOptions {
            common_min_hits: args.min_hits,
            max_backlog: args.max_backlog,
            cache_entries: args.cache_size,
        },
    );

    let storage: Arc<dyn StorageDriver> = Arc::new(pipeline::HttpStorage::new(args.storage.clone()));
    let transcoding = Arc::new(
        pipeline::Pipeline::new(
            &args.work_dir,
            Arc::new(pipeline::BlobDownloader::new(args.blob_server.clone())),
            Arc::new(pipeline::FfmpegEncoder::new()),
            storage.clone(),
        )
        .context("preparing work directories")?,
    );

    let cancel = tokio_util::sync::CancellationToken::new();
    pipeline::spawn_workers(args.workers, manager.clone(), transcoding.clone(), cancel.clone());
    let sweeper = pipeline::spawn_sweeper(
        library.clone(),
        storage,
        transcoding.transcoded_dir().to_path_buf(),
        Duration::from_secs(1),
        cancel.clone(),
    );

    // Periodically export queue backlogs.
    let gauge_manager = manager.clone();
    let gauge_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = gauge_cancel.cancelled() => return,
            }
            for (queue, len) in gauge_manager.queue_sizes() {
                metrics::gauge!("recast_queue_items", "queue" => queue).set(len as f64);
            }
        }
    });

    // Share-able future which completes when the daemon should exit.
    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    let router = manager::build_router(manager.clone()).merge(metrics_router());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("caught signal; exiting...");
    manager.stop();
    cancel.cancel();
    let _ = sweeper.await;
    Ok(())
}

fn metrics_router() -> axum::Router<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder");

    axum::Router::new()
        .route("/metrics", axum::routing::get(prometheus_metrics))
        .with_state(handle)
}

async fn prometheus_metrics(
    axum::extract::State(handle): axum::extract::State<PrometheusHandle>,
) -> (axum::http::StatusCode, String) {
    (axum::http::StatusCode::OK, handle.render())
}
