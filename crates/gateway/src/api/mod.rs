//! HTTP surface.
//!
//! Long-running endpoints answer `text/event-stream` with the engine run
//! id in `X-Workflow-Run-Id`; idempotent lookups answer JSON. Status
//! mapping: 400 invalid id, 404 nothing streaming, 409 duplicate start /
//! already completed, 410 stream ended, 500 unexpected.

pub mod analysis;
pub mod process;
pub mod runs;
pub mod slides;
pub mod sse;
pub mod transcript;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;

use vs_domain::{Error, VideoId};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/transcript/:video_id/start", post(transcript::start))
        .route("/v1/video/:video_id/analysis/start", post(analysis::start))
        .route("/v1/video/:video_id/analysis/resume", get(analysis::resume))
        .route("/v1/video/:video_id/analysis/status", get(analysis::status))
        .route("/v1/video/:video_id/analysis/versions", get(analysis::versions))
        .route("/v1/video/:video_id/super/start", post(analysis::start_super))
        .route("/v1/video/:video_id/slides/start", post(slides::start))
        .route("/v1/video/:video_id/slides/resume", get(slides::resume))
        .route("/v1/video/:video_id/slides", get(slides::list))
        .route(
            "/v1/video/:video_id/slides/:slide_number/feedback",
            put(slides::feedback),
        )
        .route(
            "/v1/video/:video_id/slides/analysis/start",
            post(slides::start_analysis),
        )
        .route("/v1/process/:video_id/start", post(process::start))
        .route("/v1/run/:run_id/stream", get(runs::stream))
        .route("/v1/run/:run_id/cancel", post(runs::cancel))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "workflows": ["fetch_transcript", "dynamic_analysis", "slide_extraction",
                      "slide_analysis", "super_analysis"],
        "version": env!("CARGO_PKG_VERSION"),
        "database": state.config.database.path.display().to_string(),
    }))
}

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// Map a domain error to the HTTP layer.
pub(crate) fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.to_string())
}

/// Validate a path-supplied video id; failures become a 400 response.
pub(crate) fn parse_video_id(raw: &str) -> Result<VideoId, Response> {
    VideoId::new(raw).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_video_id_becomes_400() {
        let err = parse_video_id("not-an-id").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(parse_video_id("dQw4w9WgXcQ").is_ok());
    }

    #[test]
    fn error_response_status_mapping() {
        assert_eq!(
            error_response(Error::Validation("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_response(Error::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_response(Error::DataAnomaly("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
