//! Admission front door of the transcoding service.
//!
//! The [`VideoManager`] resolves content URIs into claims, answers from the
//! artifact library when a stream is already transcoded, and otherwise admits
//! the request into a multi-tier most-frequently-requested pool. Workers pull
//! admitted requests through [`VideoManager::requests`] and report back
//! through the lifecycle methods on [`TranscodingRequest`].

mod api;
mod cache;
mod config;
mod manager;
mod request;
mod resolve;

pub use api::build_router;
pub use config::ChannelConfig;
pub use manager::{ManagerOptions, VideoManager, LEVEL5_SUPPORT_THRESHOLD};
pub use request::{TranscodingRequest, VideoQueue};
pub use resolve::{
    ChannelMeta, Claim, ClaimSource, ClaimValue, JsonRpcResolver, ResolveError, Resolver,
    SigningChannel,
};

/// A client-facing reply to a video request that is not an error.
#[derive(Debug, Clone)]
pub enum VideoReply {
    /// The artifact is in the library.
    Ready(library::Video),
    /// Newly admitted into the pool.
    Queued,
    /// Already queued or being transcoded.
    Underway,
}

/// Client-facing failure taxonomy. The `Display` strings double as HTTP
/// response bodies.
#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("stream not found")]
    StreamNotFound,
    #[error("stream has no signing channel")]
    NoSigningChannel,
    #[error("channel not enabled")]
    ChannelNotEnabled,
    #[error("transcoding forbidden")]
    TranscodingForbidden,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
