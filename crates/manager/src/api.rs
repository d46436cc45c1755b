use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;

use crate::manager::VideoManager;
use crate::{VideoError, VideoReply};

/// Build the client-facing router. `{uri}` arrives URI-path-escaped and is
/// decoded by the path extractor.
pub fn build_router(manager: Arc<VideoManager>) -> axum::Router<()> {
    axum::Router::new()
        .route("/api/v2/video/:uri", get(video))
        .route("/healthz", get(|| async { "ok" }))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(manager)
}

async fn video(State(manager): State<Arc<VideoManager>>, Path(uri): Path<String>) -> Response {
    match manager.video(&uri).await {
        Ok(VideoReply::Ready(video)) => (StatusCode::OK, Json(video)).into_response(),
        Ok(VideoReply::Queued) => (StatusCode::ACCEPTED, "transcoding queued").into_response(),
        Ok(VideoReply::Underway) => (StatusCode::ACCEPTED, "transcoding underway").into_response(),
        Err(err) => err.into_response(),
    }
}

impl IntoResponse for VideoError {
    fn into_response(self) -> Response {
        let status = match &self {
            VideoError::StreamNotFound | VideoError::NoSigningChannel => StatusCode::NOT_FOUND,
            VideoError::ChannelNotEnabled | VideoError::TranscodingForbidden => {
                StatusCode::FORBIDDEN
            }
            VideoError::Internal(err) => {
                tracing::error!(error = ?err, "video request failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
            }
        };
        (status, self.to_string()).into_response()
    }
}
