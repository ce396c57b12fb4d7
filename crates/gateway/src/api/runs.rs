//! Low-level run handles: raw stream attachment and cancellation.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::state::AppState;

use super::{api_error, error_response, sse};

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "startIndex", default)]
    pub start_index: u64,
    #[serde(default)]
    pub namespace: Option<String>,
}

fn parse_run_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw)
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, format!("invalid run id {raw:?}")))
}

// ── GET /v1/run/:run_id/stream ─────────────────────────────────────

pub async fn stream(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let run_id = match parse_run_id(&run_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.engine.run_state(run_id) {
        Ok(Some(_)) => {}
        Ok(None) => return api_error(StatusCode::NOT_FOUND, format!("unknown run {run_id}")),
        Err(e) => return error_response(e),
    }

    // Sealed logs still replay: a reader at any startIndex gets the
    // remaining history and a clean end.
    let stream = state
        .engine
        .stream(run_id, query.start_index, query.namespace);
    sse::run_sse(run_id, stream)
}

// ── POST /v1/run/:run_id/cancel ────────────────────────────────────

pub async fn cancel(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    let run_id = match parse_run_id(&run_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.engine.run_state(run_id) {
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("unknown run {run_id}")),
        Ok(Some(state_now)) if state_now.is_terminal() => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "run already ended",
                "state": state_now.as_str(),
            })),
        )
            .into_response(),
        Ok(Some(_)) => {
            let requested = state.engine.cancel(run_id);
            Json(json!({"cancelled": requested})).into_response()
        }
        Err(e) => error_response(e),
    }
}
