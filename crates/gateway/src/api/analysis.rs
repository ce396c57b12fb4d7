//! Dynamic-analysis and super-analysis endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use crate::coordinator::{AnalysisDispatch, ResumeOutcome};
use crate::state::AppState;
use crate::workflows::super_analysis;

use super::{api_error, error_response, parse_video_id, sse};

#[derive(Debug, Default, Deserialize)]
pub struct StartAnalysisRequest {
    #[serde(default)]
    pub additional_instructions: Option<String>,
    /// Skip the cached result and open a new version.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResumeQuery {
    #[serde(rename = "startIndex", default)]
    pub start_index: u64,
}

// ── POST /v1/video/:id/analysis/start ──────────────────────────────

pub async fn start(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    body: Option<Json<StartAnalysisRequest>>,
) -> Response {
    let video_id = match parse_video_id(&video_id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let request = body.map(|Json(b)| b).unwrap_or_default();

    match state
        .coordinator
        .dispatch_analysis(&video_id, request.additional_instructions, request.force)
        .await
    {
        Ok(AnalysisDispatch::Cached(result)) => {
            Json(json!({"cached": true, "result": result})).into_response()
        }
        Ok(AnalysisDispatch::Started { run_id, stream, .. })
        | Ok(AnalysisDispatch::Attached { run_id, stream, .. }) => {
            sse::run_sse(run_id, stream)
        }
        Ok(AnalysisDispatch::Failed { version, message }) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("analysis version {version} failed: {message}"),
        ),
        Err(e) => error_response(e),
    }
}

// ── GET /v1/video/:id/analysis/resume ──────────────────────────────

pub async fn resume(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    Query(query): Query<ResumeQuery>,
) -> Response {
    let video_id = match parse_video_id(&video_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.coordinator.resume_analysis(&video_id, query.start_index) {
        Ok(ResumeOutcome::Stream { run_id, stream }) => sse::run_sse(run_id, stream),
        Ok(ResumeOutcome::Completed) => {
            (StatusCode::GONE, Json(json!({"completed": true}))).into_response()
        }
        Ok(ResumeOutcome::NotFound) => {
            api_error(StatusCode::NOT_FOUND, "no streaming analysis for this video")
        }
        Err(e) => error_response(e),
    }
}

// ── GET /v1/video/:id/analysis/status ──────────────────────────────

pub async fn status(State(state): State<AppState>, Path(video_id): Path<String>) -> Response {
    let video_id = match parse_video_id(&video_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let streaming = match state.store.streaming_version(video_id.as_str()) {
        Ok(row) => row,
        Err(e) => return error_response(e),
    };
    let versions = match state.store.versions(video_id.as_str()) {
        Ok(rows) => rows,
        Err(e) => return error_response(e),
    };
    let has_result = versions
        .iter()
        .any(|v| v.result_json.is_some());

    Json(json!({
        "streaming": streaming.map(|row| json!({
            "version": row.version,
            "runId": row.workflow_run_id,
        })),
        "latestVersion": versions.first().map(|v| v.version),
        "hasResult": has_result,
    }))
    .into_response()
}

// ── GET /v1/video/:id/analysis/versions ────────────────────────────

pub async fn versions(State(state): State<AppState>, Path(video_id): Path<String>) -> Response {
    let video_id = match parse_video_id(&video_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.store.versions(video_id.as_str()) {
        Ok(rows) => Json(json!({"versions": rows})).into_response(),
        Err(e) => error_response(e),
    }
}

// ── POST /v1/video/:id/super/start ─────────────────────────────────

pub async fn start_super(State(state): State<AppState>, Path(video_id): Path<String>) -> Response {
    let video_id = match parse_video_id(&video_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state
        .engine
        .start(super_analysis::NAME, json!({"video_id": video_id}))
    {
        Ok(started) => sse::run_sse(started.run_id, started.stream),
        Err(e) => error_response(e),
    }
}
