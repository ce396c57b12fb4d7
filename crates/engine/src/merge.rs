//! Fan-out stream merger.
//!
//! Combines several per-sub-workflow event streams into one tagged stream:
//! every forwarded JSON object gains a `"source"` field naming the stream
//! it came from. Sources may be added while the merger is live (the
//! combined process attaches the analysis stream only after the transcript
//! stream completes); the output ends when every source has finished and
//! all handles are dropped. An error in one source never aborts siblings —
//! each source's mapping layer emits its own `error` event.

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use vs_domain::stream::BoxStream;

/// Handle for feeding a merged output stream. Cloneable; the output closes
/// once all handles are dropped and all added sources are drained.
#[derive(Clone)]
pub struct StreamMerger {
    tx: mpsc::Sender<Value>,
}

impl StreamMerger {
    /// Create a merger and its output stream.
    pub fn new() -> (Self, BoxStream<'static, Value>) {
        let (tx, mut rx) = mpsc::channel::<Value>(64);
        let out = Box::pin(async_stream::stream! {
            while let Some(value) = rx.recv().await {
                yield value;
            }
        });
        (Self { tx }, out)
    }

    /// Push a single event directly (e.g. the leading `meta` event).
    pub async fn push(&self, value: Value) {
        let _ = self.tx.send(value).await;
    }

    /// Attach a source: its events are forwarded onto the output with
    /// `"source"` set to `label`, on a dedicated task.
    pub fn add<S>(&self, label: &str, source: S)
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        let tx = self.tx.clone();
        let label = label.to_owned();
        tokio::spawn(async move {
            futures_util::pin_mut!(source);
            while let Some(mut value) = source.next().await {
                if let Value::Object(map) = &mut value {
                    map.insert("source".into(), Value::String(label.clone()));
                }
                if tx.send(value).await.is_err() {
                    // Output dropped; stop forwarding.
                    break;
                }
            }
        });
    }
}
