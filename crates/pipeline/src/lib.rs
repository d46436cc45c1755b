//! Worker side of the transcoding service.
//!
//! A [`Pipeline`] runs each accepted request through three stages — download
//! the origin bytes, encode them into an HLS ladder, upload the result to
//! object storage — with staged progress reporting and a fatal/retryable
//! error classification that decides whether the request is finished or
//! returned to its queue. A sibling [`sweeper`](spawn_sweeper) pushes
//! artifacts that only exist on local disk up to remote storage.

mod download;
mod encoder;
mod pipeline;
mod storage;
mod stream;
mod sweeper;
mod worker;

pub use download::{BlobDownloader, DownloadError, Downloader};
pub use encoder::{EncodeError, EncodeOutput, Encoder, Encoding, FfmpegEncoder, Ladder, Tier};
pub use pipeline::{Pipeline, Stage, TaskError, TaskHandle, TaskOutcome, TaskProgress};
pub use storage::{HttpStorage, RemoteStream, StorageDriver, StorageError};
pub use stream::{LocalStream, Manifest, StreamError};
pub use sweeper::spawn_sweeper;
pub use worker::spawn_workers;

/// Directory under the work dir holding downloaded originals.
pub const DIR_STREAMS: &str = "streams";
/// Directory under the work dir holding transcoded outputs.
pub const DIR_TRANSCODED: &str = "transcoded";

/// Whether `name` has the shape of a stream fingerprint: 96 hex characters.
pub(crate) fn is_sd_hash(name: &str) -> bool {
    name.len() == 96 && name.chars().all(|c| c.is_ascii_hexdigit())
}
