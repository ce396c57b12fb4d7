//! `POST /v1/transcript/:video_id/start` — run the fetch-transcript
//! workflow and stream it.

use axum::extract::{Path, State};
use axum::response::Response;

use crate::state::AppState;
use crate::workflows::transcript::NAME;

use super::{error_response, parse_video_id, sse};

pub async fn start(State(state): State<AppState>, Path(video_id): Path<String>) -> Response {
    let video_id = match parse_video_id(&video_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state
        .engine
        .start(NAME, serde_json::json!({"video_id": video_id}))
    {
        Ok(started) => sse::run_sse(started.run_id, started.stream),
        Err(e) => error_response(e),
    }
}
