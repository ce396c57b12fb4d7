//! Engine streams → HTTP SSE.
//!
//! Each frame is `data: {json}` with the event's log index as the SSE id,
//! so clients can resume with `startIndex`. The terminal event maps to a
//! final `complete` / `error` frame; step bookkeeping stays internal.

use std::convert::Infallible;

use axum::http::HeaderValue;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use vs_domain::stream::BoxStream;
use vs_domain::{EventKind, RunEvent, RunState};

pub const RUN_ID_HEADER: &str = "x-workflow-run-id";

/// Map one engine event to its client-visible frame. Internal control
/// events (step bookkeeping) return None.
pub fn client_frame(event: &RunEvent) -> Option<(String, Value)> {
    match &event.kind {
        EventKind::Emit { payload, .. } => {
            let kind = payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("message")
                .to_owned();
            Some((kind, payload.clone()))
        }
        EventKind::RunTerminal {
            state: RunState::Completed,
            result,
            ..
        } => {
            let mut payload = result.clone().unwrap_or_else(|| json!({}));
            match &mut payload {
                Value::Object(map) => {
                    map.insert("type".into(), json!("complete"));
                }
                other => {
                    payload = json!({"type": "complete", "result": other.clone()});
                }
            }
            Some(("complete".into(), payload))
        }
        EventKind::RunTerminal { message, .. } => {
            let message = message.clone().unwrap_or_else(|| "run failed".into());
            Some((
                "error".into(),
                json!({"type": "error", "message": message}),
            ))
        }
        _ => None,
    }
}

/// Serve a run's event stream as SSE with the run id header.
pub fn run_sse(run_id: Uuid, events: BoxStream<'static, RunEvent>) -> Response {
    let stream = events.filter_map(|event| async move {
        let (kind, payload) = client_frame(&event)?;
        Some(Ok::<_, Infallible>(
            Event::default()
                .event(kind)
                .id(event.index.to_string())
                .data(payload.to_string()),
        ))
    });

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&run_id.to_string()) {
        response.headers_mut().insert(RUN_ID_HEADER, value);
    }
    response
}

/// Serve an already-mapped stream of client payloads (the merged process
/// stream) as SSE.
pub fn merged_sse(values: BoxStream<'static, Value>) -> Response {
    let stream = values.map(|payload| {
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("message")
            .to_owned();
        Ok::<_, Infallible>(Event::default().event(kind).data(payload.to_string()))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Map a run's events to bare client payloads (for merging).
pub fn client_payloads(
    events: BoxStream<'static, RunEvent>,
) -> BoxStream<'static, Value> {
    Box::pin(events.filter_map(|event| async move {
        client_frame(&event).map(|(_, payload)| payload)
    }))
}
