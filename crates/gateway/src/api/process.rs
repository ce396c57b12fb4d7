//! `POST /v1/process/:video_id/start` — the combined process.
//!
//! Slides extraction starts immediately and streams in parallel;
//! transcript fetch streams next, and dynamic analysis is dispatched only
//! after the transcript completes. All three sub-streams merge into one
//! tagged stream whose first event is `meta{slidesRunId}`.

use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::StreamExt;
use serde_json::{json, Value};

use vs_domain::stream::BoxStream;
use vs_domain::{EventKind, RunState, VideoId};
use vs_engine::StreamMerger;

use crate::coordinator::{AnalysisDispatch, SlidesDispatch};
use crate::state::AppState;
use crate::workflows::transcript;

use super::{parse_video_id, sse};

fn tagged(mut payload: Value, source: &str) -> Value {
    if let Value::Object(map) = &mut payload {
        map.insert("source".into(), json!(source));
    }
    payload
}

fn error_payload(message: String) -> Value {
    json!({"type": "error", "message": message})
}

pub async fn start(State(state): State<AppState>, Path(video_id): Path<String>) -> Response {
    let video_id = match parse_video_id(&video_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    // Slides begin immediately; a concurrent or finished extraction is
    // attached rather than restarted.
    let (slides_run_id, slides_stream): (Option<String>, BoxStream<'static, Value>) =
        match state.coordinator.dispatch_slides(&video_id).await {
            Ok(SlidesDispatch::Started { run_id, stream }) => {
                (Some(run_id.to_string()), sse::client_payloads(stream))
            }
            Ok(SlidesDispatch::Conflict { run_id }) => {
                let stream: BoxStream<'static, Value> = match run_id
                    .as_deref()
                    .and_then(|id| uuid::Uuid::parse_str(id).ok())
                {
                    Some(existing) => {
                        sse::client_payloads(state.engine.stream(existing, 0, None))
                    }
                    None => Box::pin(futures_util::stream::empty()),
                };
                (run_id, stream)
            }
            Ok(SlidesDispatch::AlreadyCompleted { total_slides }) => (
                None,
                Box::pin(futures_util::stream::iter(vec![json!({
                    "type": "complete",
                    "totalSlides": total_slides,
                    "alreadyCompleted": true,
                })])),
            ),
            Err(e) => (
                None,
                Box::pin(futures_util::stream::iter(vec![error_payload(
                    e.to_string(),
                )])),
            ),
        };

    let (merger, output) = StreamMerger::new();
    merger
        .push(json!({"type": "meta", "slidesRunId": slides_run_id}))
        .await;
    merger.add("slides", slides_stream);

    // Transcript, then analysis once the transcript completed.
    let handle = merger.clone();
    let engine = state.engine.clone();
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        run_transcript_then_analysis(handle, engine, coordinator, video_id).await;
    });
    drop(merger);

    sse::merged_sse(output)
}

async fn run_transcript_then_analysis(
    handle: StreamMerger,
    engine: std::sync::Arc<vs_engine::Engine>,
    coordinator: std::sync::Arc<crate::coordinator::Coordinator>,
    video_id: VideoId,
) {
    let started = match engine.start(transcript::NAME, json!({"video_id": video_id})) {
        Ok(started) => started,
        Err(e) => {
            handle
                .push(tagged(error_payload(e.to_string()), "transcript"))
                .await;
            return;
        }
    };

    let mut transcript_completed = false;
    let mut stream = started.stream;
    while let Some(event) = stream.next().await {
        if let EventKind::RunTerminal { state, .. } = &event.kind {
            transcript_completed = *state == RunState::Completed;
        }
        if let Some((_, payload)) = sse::client_frame(&event) {
            handle.push(tagged(payload, "transcript")).await;
        }
    }

    // Causality: analysis events always come after the transcript's
    // completion because dispatch waits for it.
    if !transcript_completed {
        return;
    }

    match coordinator.dispatch_analysis(&video_id, None, false).await {
        Ok(AnalysisDispatch::Cached(result)) => {
            handle
                .push(tagged(json!({"type": "result", "data": result}), "analysis"))
                .await;
            handle
                .push(tagged(json!({"type": "complete", "cached": true}), "analysis"))
                .await;
        }
        Ok(AnalysisDispatch::Started { stream, .. })
        | Ok(AnalysisDispatch::Attached { stream, .. }) => {
            let mut payloads = sse::client_payloads(stream);
            while let Some(payload) = payloads.next().await {
                handle.push(tagged(payload, "analysis")).await;
            }
        }
        Ok(AnalysisDispatch::Failed { message, .. }) => {
            handle
                .push(tagged(error_payload(message), "analysis"))
                .await;
        }
        Err(e) => {
            handle
                .push(tagged(error_payload(e.to_string()), "analysis"))
                .await;
        }
    }
}
