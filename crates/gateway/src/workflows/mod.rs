//! The workflow catalog.
//!
//! Five workflows run on the engine: transcript fetch, dynamic analysis,
//! slide extraction, per-slide analysis, and super-analysis. The combined
//! process endpoint composes three of them at the API layer. Each
//! workflow's client-visible events are emitted from inside step bodies so
//! crash-recovery replay never re-issues them.

pub mod analysis;
pub mod slide_analysis;
pub mod slides;
pub mod super_analysis;
pub mod transcript;

use std::sync::Arc;

use vs_clients::{BlobStore, ObjectStore, SlideExtractor, TranscriptSource};
use vs_domain::config::Config;
use vs_engine::{Engine, RetryPolicy};
use vs_providers::LanguageModel;
use vs_store::Store;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared dependencies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a workflow body may touch, injected once at registration.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub store: Arc<Store>,
    pub llm: Arc<dyn LanguageModel>,
    pub transcripts: Arc<dyn TranscriptSource>,
    pub extractor: Arc<dyn SlideExtractor>,
    pub objects: Arc<dyn ObjectStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub config: Arc<Config>,
}

impl WorkflowDeps {
    /// The default step retry policy from config.
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.config.workflow.step_max_retries,
            backoff_base: std::time::Duration::from_millis(self.config.workflow.backoff_base_ms),
        }
    }
}

/// Register the whole catalog on an engine.
pub fn register_all(engine: &Arc<Engine>, deps: WorkflowDeps) {
    engine.register(Arc::new(transcript::FetchTranscriptWorkflow::new(deps.clone())));
    engine.register(Arc::new(analysis::DynamicAnalysisWorkflow::new(deps.clone())));
    engine.register(Arc::new(slides::SlideExtractionWorkflow::new(deps.clone())));
    engine.register(Arc::new(slide_analysis::SlideAnalysisWorkflow::new(deps.clone())));
    engine.register(Arc::new(super_analysis::SuperAnalysisWorkflow::new(deps)));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client event payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod events {
    use serde_json::{json, Value};
    use vs_domain::slides::Slide;

    pub fn progress(phase: &str, message: Option<&str>, percent: Option<u8>) -> Value {
        let mut payload = json!({"type": "progress", "phase": phase});
        if let Some(message) = message {
            payload["message"] = json!(message);
        }
        if let Some(percent) = percent {
            payload["progress"] = json!(percent);
        }
        payload
    }

    /// Extraction-status progress, the shape the slides stream uses.
    pub fn extraction_progress(
        status: &str,
        message: Option<&str>,
        percent: Option<f32>,
    ) -> Value {
        let mut payload = json!({"type": "progress", "status": status});
        if let Some(message) = message {
            payload["message"] = json!(message);
        }
        if let Some(percent) = percent {
            payload["progress"] = json!(percent);
        }
        payload
    }

    pub fn partial(data: Value) -> Value {
        json!({"type": "partial", "data": data})
    }

    pub fn result(data: Value) -> Value {
        json!({"type": "result", "data": data})
    }

    pub fn slide(record: &Slide) -> Value {
        let mut payload = serde_json::to_value(record).unwrap_or(Value::Null);
        payload["type"] = json!("slide");
        payload
    }

    pub fn slide_markdown(slide_number: u32, frame_position: &str, markdown: &str) -> Value {
        json!({
            "type": "slide_markdown",
            "slide_number": slide_number,
            "frame_position": frame_position,
            "markdown": markdown,
        })
    }

    pub fn slide_analysis_progress(slides: Value, completed: usize, total: usize) -> Value {
        json!({
            "type": "slide_analysis_progress",
            "slides": slides,
            "completedCount": completed,
            "totalCount": total,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test scaffolding shared by the workflow tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
