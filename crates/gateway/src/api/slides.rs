//! Slide-extraction, slide-listing, feedback, and per-slide analysis
//! endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use vs_domain::slides::{SlideFeedback, SlideTarget};

use crate::coordinator::{ResumeOutcome, SlidesDispatch};
use crate::state::AppState;
use crate::workflows::slide_analysis;

use super::analysis::ResumeQuery;
use super::{api_error, error_response, parse_video_id, sse};

// ── POST /v1/video/:id/slides/start ────────────────────────────────

pub async fn start(State(state): State<AppState>, Path(video_id): Path<String>) -> Response {
    let video_id = match parse_video_id(&video_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.coordinator.dispatch_slides(&video_id).await {
        Ok(SlidesDispatch::Started { run_id, stream }) => sse::run_sse(run_id, stream),
        Ok(SlidesDispatch::Conflict { run_id }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "Extraction already in progress",
                "runId": run_id,
            })),
        )
            .into_response(),
        Ok(SlidesDispatch::AlreadyCompleted { total_slides }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "Extraction already completed",
                "totalSlides": total_slides,
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// ── GET /v1/video/:id/slides/resume ────────────────────────────────

pub async fn resume(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    Query(query): Query<ResumeQuery>,
) -> Response {
    let video_id = match parse_video_id(&video_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.coordinator.resume_slides(&video_id, query.start_index) {
        Ok(ResumeOutcome::Stream { run_id, stream }) => sse::run_sse(run_id, stream),
        Ok(ResumeOutcome::Completed) => {
            (StatusCode::GONE, Json(json!({"completed": true}))).into_response()
        }
        Ok(ResumeOutcome::NotFound) => {
            api_error(StatusCode::NOT_FOUND, "no streaming extraction for this video")
        }
        Err(e) => error_response(e),
    }
}

// ── GET /v1/video/:id/slides ───────────────────────────────────────

pub async fn list(State(state): State<AppState>, Path(video_id): Path<String>) -> Response {
    let video_id = match parse_video_id(&video_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let extraction = match state.store.slide_extraction(video_id.as_str()) {
        Ok(row) => row,
        Err(e) => return error_response(e),
    };
    match state.store.slides(video_id.as_str()) {
        Ok(slides) => Json(json!({
            "extraction": extraction,
            "slides": slides,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

// ── PUT /v1/video/:id/slides/:n/feedback ───────────────────────────

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    #[serde(default)]
    pub is_first_frame_picked: bool,
    #[serde(default)]
    pub is_last_frame_picked: bool,
}

pub async fn feedback(
    State(state): State<AppState>,
    Path((video_id, slide_number)): Path<(String, u32)>,
    Json(body): Json<FeedbackRequest>,
) -> Response {
    let video_id = match parse_video_id(&video_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.store.slide(video_id.as_str(), slide_number) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return api_error(
                StatusCode::NOT_FOUND,
                format!("slide {slide_number} not found"),
            )
        }
        Err(e) => return error_response(e),
    }

    let feedback = SlideFeedback {
        slide_number,
        is_first_frame_picked: body.is_first_frame_picked,
        is_last_frame_picked: body.is_last_frame_picked,
    };
    match state.store.set_slide_feedback(video_id.as_str(), &feedback) {
        Ok(()) => Json(json!({"ok": true, "feedback": feedback})).into_response(),
        Err(e) => error_response(e),
    }
}

// ── POST /v1/video/:id/slides/analysis/start ───────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct SlideAnalysisRequest {
    #[serde(default)]
    pub targets: Option<Vec<SlideTarget>>,
}

pub async fn start_analysis(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    body: Option<Json<SlideAnalysisRequest>>,
) -> Response {
    let video_id = match parse_video_id(&video_id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let request = body.map(|Json(b)| b).unwrap_or_default();

    match state.engine.start(
        slide_analysis::NAME,
        json!({"video_id": video_id, "targets": request.targets}),
    ) {
        Ok(started) => sse::run_sse(started.run_id, started.stream),
        Err(e) => error_response(e),
    }
}
