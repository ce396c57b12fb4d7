//! Slide-extraction workflow.
//!
//! `trigger_job` → `monitor_job` → `fetch_manifest` → `process_slides` →
//! `finalize`. The extractor deduplicates jobs by video id, so the trigger
//! is idempotent; the monitor tails the extractor's SSE stream with a
//! bounded wait. Per-frame processing failures land on the slide record,
//! never on the run.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use futures_util::StreamExt;
use vs_domain::slides::{FramePosition, Slide, SlideFrame};
use vs_domain::{Error, Result, VideoId};
use vs_engine::{Emitter, RetryPolicy, Workflow, WorkflowCtx};

use vs_clients::extractor::{ManifestFrame, ManifestSegment};
use vs_clients::{JobStatus, SlideManifest};

use super::{events, WorkflowDeps};

pub const NAME: &str = "slide_extraction";

#[derive(Debug, Deserialize)]
pub struct SlidesArgs {
    pub video_id: VideoId,
}

/// The manifest re-serialized for step memoization: replay reads it from
/// the log instead of object storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredManifest {
    segments: Vec<StoredSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSegment {
    start_seconds: Option<f64>,
    end_seconds: Option<f64>,
    first: Option<StoredFrame>,
    last: Option<StoredFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredFrame {
    frame_id: Option<String>,
    uri: String,
    has_text: bool,
    duplicate_of_slide: Option<u32>,
    duplicate_of_frame: Option<FramePosition>,
}

fn stored_frame(frame: &ManifestFrame) -> StoredFrame {
    StoredFrame {
        frame_id: frame.frame_id.clone(),
        uri: frame.uri.clone(),
        has_text: frame.has_text,
        duplicate_of_slide: frame.duplicate_of.as_ref().map(|d| d.slide_number),
        duplicate_of_frame: frame
            .duplicate_of
            .as_ref()
            .and_then(|d| FramePosition::parse(&d.frame_position)),
    }
}

fn stored_segment(segment: &ManifestSegment) -> StoredSegment {
    StoredSegment {
        start_seconds: segment.start_seconds,
        end_seconds: segment.end_seconds,
        first: segment.first_frame.as_ref().map(stored_frame),
        last: segment.last_frame.as_ref().map(stored_frame),
    }
}

pub struct SlideExtractionWorkflow {
    deps: WorkflowDeps,
}

impl SlideExtractionWorkflow {
    pub fn new(deps: WorkflowDeps) -> Self {
        Self { deps }
    }

    /// Download a frame from source storage and publish it at its
    /// deterministic blob path. Returns the public URL.
    async fn publish_frame(
        &self,
        video_id: &VideoId,
        slide_number: u32,
        position: FramePosition,
        frame: &StoredFrame,
    ) -> Result<String> {
        let name = match &frame.frame_id {
            Some(id) => id.clone(),
            None => format!("{slide_number}-{position}"),
        };
        let path = format!("slides/{video_id}/{name}.webp");
        let bytes = self.deps.objects.get(&frame.uri).await?;
        self.deps.blobs.put(&path, bytes, "image/webp").await
    }

    /// Build one slide row from a stored segment, uploading both frames.
    /// Frame failures are recorded on the frame, not raised.
    async fn build_slide(
        &self,
        em: &Emitter,
        video_id: &VideoId,
        slide_number: u32,
        segment: &StoredSegment,
    ) -> Result<Slide> {
        let mut slide = Slide {
            video_id: video_id.as_str().to_owned(),
            slide_number,
            start_seconds: segment.start_seconds,
            end_seconds: segment.end_seconds,
            first: SlideFrame::default(),
            last: SlideFrame::default(),
        };

        for (position, stored) in [
            (FramePosition::First, &segment.first),
            (FramePosition::Last, &segment.last),
        ] {
            let Some(stored) = stored else { continue };
            let frame = slide.frame_mut(position);
            frame.source_uri = Some(stored.uri.clone());
            frame.has_text = stored.has_text;
            frame.duplicate_of_slide = stored.duplicate_of_slide;
            frame.duplicate_of_frame = stored.duplicate_of_frame;

            if stored.duplicate_of_slide.is_some() {
                // Duplicates reference an earlier frame's image instead of
                // re-uploading it.
                continue;
            }

            match self
                .publish_frame(video_id, slide_number, position, stored)
                .await
            {
                Ok(url) => slide.frame_mut(position).image_url = Some(url),
                Err(e) => {
                    tracing::warn!(
                        video_id = %video_id,
                        slide_number,
                        position = %position,
                        error = %e,
                        "frame processing failed"
                    );
                    slide.frame_mut(position).error = Some(e.to_string());
                }
            }
        }

        self.deps.store.insert_slide(&slide)?;
        em.emit(events::slide(&slide))?;
        Ok(slide)
    }
}

#[async_trait::async_trait]
impl Workflow for SlideExtractionWorkflow {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(&self, ctx: &WorkflowCtx, args: Value) -> Result<Value> {
        let args: SlidesArgs = serde_json::from_value(args)?;
        let video_id = args.video_id;
        let em = ctx.emitter();
        let retry = self.deps.retry();

        ctx.step("trigger_job", retry, || {
            let em = em.clone();
            let extractor = self.deps.extractor.clone();
            let video_id = video_id.clone();
            async move {
                em.emit(events::extraction_progress("starting", None, None))?;
                extractor.trigger(&video_id).await.map_err(|e| match e {
                    Error::Fatal(message) => {
                        Error::Fatal(format!("Failed to trigger extraction: {message}"))
                    }
                    other => other,
                })
            }
        })
        .await?;

        // Bounded wait on the extractor's SSE stream; one retry covers a
        // dropped connection, a missing manifest on completion is fatal.
        let metadata_uri: String = ctx
            .step("monitor_job", RetryPolicy::retries(1), || {
                let em = em.clone();
                let extractor = self.deps.extractor.clone();
                let video_id = video_id.clone();
                let timeout = std::time::Duration::from_secs(
                    self.deps.config.slide_extractor.monitor_timeout_secs,
                );
                async move {
                    let monitor = async {
                        let mut updates = extractor.monitor(&video_id).await?;
                        while let Some(update) = updates.next().await {
                            let update = update?;
                            em.emit(events::extraction_progress(
                                update.status.as_str(),
                                update.message.as_deref(),
                                update.progress,
                            ))?;
                            match update.status {
                                JobStatus::Completed => {
                                    return update.metadata_uri.ok_or_else(|| {
                                        Error::Fatal(
                                            "extraction completed without a manifest".into(),
                                        )
                                    });
                                }
                                JobStatus::Failed => {
                                    return Err(Error::Fatal(format!(
                                        "extraction failed: {}",
                                        update.message.unwrap_or_else(|| "unknown error".into())
                                    )));
                                }
                                _ => {}
                            }
                        }
                        Err(Error::Transient(
                            "extractor stream ended before completion".into(),
                        ))
                    };

                    match tokio::time::timeout(timeout, monitor).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Fatal(format!(
                            "timed out waiting for slide extraction of {video_id}"
                        ))),
                    }
                }
            })
            .await?;

        let manifest: StoredManifest = ctx
            .step("fetch_manifest", retry, || {
                let objects = self.deps.objects.clone();
                let metadata_uri = metadata_uri.clone();
                async move {
                    let bytes = objects.get(&metadata_uri).await?;
                    let manifest: SlideManifest = serde_json::from_slice(&bytes)
                        .map_err(|e| Error::Fatal(format!("unparseable manifest: {e}")))?;
                    Ok(StoredManifest {
                        segments: manifest.static_segments().map(stored_segment).collect(),
                    })
                }
            })
            .await?;

        let total: u32 = ctx
            .step("process_slides", retry, || {
                let em = em.clone();
                let video_id = video_id.clone();
                let segments = manifest.segments.clone();
                async move {
                    let mut total = 0u32;
                    for (index, segment) in segments.iter().enumerate() {
                        let slide_number = index as u32 + 1;
                        self.build_slide(&em, &video_id, slide_number, segment).await?;
                        total += 1;
                    }
                    Ok(total)
                }
            })
            .await?;

        ctx.step("finalize", retry, || {
            let store = self.deps.store.clone();
            let video_id = video_id.clone();
            async move {
                store.set_extraction_completed(video_id.as_str(), total)?;
                Ok(())
            }
        })
        .await?;

        Ok(json!({"totalSlides": total}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::testutil::{self, VID};
    use std::collections::HashMap;
    use std::sync::Arc;
    use vs_clients::JobUpdate;
    use vs_domain::resource::ExtractionStatus;
    use vs_domain::{EventKind, RunState};
    use vs_engine::Engine;
    use vs_store::Store;

    fn update(status: JobStatus, metadata_uri: Option<&str>) -> JobUpdate {
        serde_json::from_value(json!({
            "status": status.as_str(),
            "metadataUri": metadata_uri,
        }))
        .unwrap()
    }

    fn manifest_json() -> Vec<u8> {
        json!({
            "video_id": VID,
            "segments": [
                {
                    "type": "static",
                    "start_seconds": 0.0,
                    "end_seconds": 10.0,
                    "first_frame": {"frame_id": "f0", "uri": "frames/0-first.webp", "has_text": true},
                    "last_frame": {"frame_id": "f1", "uri": "frames/0-last.webp"}
                },
                {"type": "motion", "start_seconds": 10.0, "end_seconds": 20.0},
                {
                    "type": "static",
                    "start_seconds": 20.0,
                    "end_seconds": 30.0,
                    "first_frame": {
                        "uri": "frames/1-first.webp",
                        "duplicate_of": {"slide_number": 1, "frame_position": "last"}
                    },
                    "last_frame": {"uri": "frames/1-last.webp"}
                }
            ]
        })
        .to_string()
        .into_bytes()
    }

    fn objects_with_manifest() -> Arc<testutil::MapObjectStore> {
        let mut objects = HashMap::new();
        objects.insert("frames/manifest.json".to_string(), manifest_json());
        objects.insert("frames/0-first.webp".to_string(), vec![1u8; 4]);
        objects.insert("frames/0-last.webp".to_string(), vec![2u8; 4]);
        objects.insert("frames/1-last.webp".to_string(), vec![3u8; 4]);
        Arc::new(testutil::MapObjectStore { objects })
    }

    fn setup(
        extractor: Arc<dyn vs_clients::SlideExtractor>,
        objects: Arc<testutil::MapObjectStore>,
    ) -> (Arc<Store>, Arc<Engine>, Arc<testutil::RecordingBlobStore>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let blobs = Arc::new(testutil::RecordingBlobStore::default());
        let deps = testutil::deps(
            store.clone(),
            testutil::ScriptedModel::new(vec![]),
            testutil::FixedTranscripts::new(),
            extractor,
            objects,
            blobs.clone(),
        );
        let engine = Engine::new(store.clone());
        engine.register(Arc::new(SlideExtractionWorkflow::new(deps)));
        (store, engine, blobs)
    }

    #[tokio::test]
    async fn full_extraction_stores_slides_and_finalizes() {
        let extractor = testutil::ScriptedExtractor::ok(vec![
            update(JobStatus::Downloading, None),
            update(JobStatus::Extracting, None),
            update(JobStatus::Completed, Some("frames/manifest.json")),
        ]);
        let (store, engine, blobs) = setup(extractor, objects_with_manifest());
        store.begin_extraction(VID).unwrap();

        let started = engine.start(NAME, json!({"video_id": VID})).unwrap();
        let terminal = testutil::wait_terminal(&store, started.run_id).await;

        match terminal.kind {
            EventKind::RunTerminal { state, result, .. } => {
                assert_eq!(state, RunState::Completed);
                assert_eq!(result.unwrap()["totalSlides"], 2);
            }
            other => panic!("expected terminal, got {other:?}"),
        }

        // Two static segments became slides; the motion segment did not.
        let slides = store.slides(VID).unwrap();
        assert_eq!(slides.len(), 2);
        assert_eq!(
            slides[0].first.image_url.as_deref(),
            Some("https://blob.example/slides/dQw4w9WgXcQ/f0.webp")
        );
        assert!(slides[0].first.has_text);
        // The duplicate frame kept its reference and skipped upload.
        assert_eq!(slides[1].first.duplicate_of_slide, Some(1));
        assert_eq!(slides[1].first.duplicate_of_frame, Some(FramePosition::Last));
        assert!(slides[1].first.image_url.is_none());

        // Deterministic paths, unnamed frames fall back to N-position.
        let uploads = blobs.uploads.lock().clone();
        assert!(uploads.contains(&format!("slides/{VID}/f0.webp")));
        assert!(uploads.contains(&format!("slides/{VID}/2-last.webp")));

        let row = store.slide_extraction(VID).unwrap().unwrap();
        assert_eq!(row.status, ExtractionStatus::Completed);
        assert_eq!(row.total_slides, Some(2));

        // Forwarded progress + one slide event per stored slide.
        let emits = testutil::emitted(&store, started.run_id);
        let statuses: Vec<&str> = emits
            .iter()
            .filter_map(|e| e["status"].as_str())
            .collect();
        assert_eq!(
            statuses,
            vec!["starting", "downloading", "extracting", "completed"]
        );
        assert_eq!(emits.iter().filter(|e| e["type"] == "slide").count(), 2);
    }

    #[tokio::test]
    async fn forbidden_trigger_is_fatal_and_not_retried() {
        let extractor = testutil::ScriptedExtractor::forbidden();
        let (store, engine, _) = setup(
            extractor,
            Arc::new(testutil::MapObjectStore {
                objects: HashMap::new(),
            }),
        );
        store.begin_extraction(VID).unwrap();

        let started = engine.start(NAME, json!({"video_id": VID})).unwrap();
        let terminal = testutil::wait_terminal(&store, started.run_id).await;

        match terminal.kind {
            EventKind::RunTerminal { state, message, .. } => {
                assert_eq!(state, RunState::Failed);
                let message = message.unwrap();
                assert!(message.contains("Failed to trigger extraction"));
                assert!(message.contains("HTTP 403"));
            }
            other => panic!("expected terminal, got {other:?}"),
        }

        // One starting progress, then nothing else; a single step_started
        // for the trigger proves no retry happened.
        let emits = testutil::emitted(&store, started.run_id);
        assert_eq!(emits.len(), 1);
        assert_eq!(emits[0]["status"], "starting");
        let trigger_starts = store
            .events_from(started.run_id, 0)
            .unwrap()
            .iter()
            .filter(|e| {
                matches!(&e.kind, EventKind::StepStarted { step_id, .. } if step_id == "trigger_job")
            })
            .count();
        assert_eq!(trigger_starts, 1);
    }

    #[tokio::test]
    async fn completion_without_manifest_is_fatal() {
        let extractor =
            testutil::ScriptedExtractor::ok(vec![update(JobStatus::Completed, None)]);
        let (store, engine, _) = setup(
            extractor,
            Arc::new(testutil::MapObjectStore {
                objects: HashMap::new(),
            }),
        );
        store.begin_extraction(VID).unwrap();

        let started = engine.start(NAME, json!({"video_id": VID})).unwrap();
        let terminal = testutil::wait_terminal(&store, started.run_id).await;
        match terminal.kind {
            EventKind::RunTerminal { state, message, .. } => {
                assert_eq!(state, RunState::Failed);
                assert!(message.unwrap().contains("without a manifest"));
            }
            other => panic!("expected terminal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn frame_failure_lands_on_record_not_run() {
        // Manifest references a frame the object store cannot serve.
        let mut objects = HashMap::new();
        objects.insert("frames/manifest.json".to_string(), manifest_json());
        objects.insert("frames/0-last.webp".to_string(), vec![2u8; 4]);
        objects.insert("frames/1-last.webp".to_string(), vec![3u8; 4]);
        let extractor = testutil::ScriptedExtractor::ok(vec![update(
            JobStatus::Completed,
            Some("frames/manifest.json"),
        )]);
        let (store, engine, _) = setup(extractor, Arc::new(testutil::MapObjectStore { objects }));
        store.begin_extraction(VID).unwrap();

        let started = engine.start(NAME, json!({"video_id": VID})).unwrap();
        let terminal = testutil::wait_terminal(&store, started.run_id).await;
        match terminal.kind {
            EventKind::RunTerminal { state, .. } => assert_eq!(state, RunState::Completed),
            other => panic!("expected terminal, got {other:?}"),
        }

        let slide = store.slide(VID, 1).unwrap().unwrap();
        assert!(slide.first.image_url.is_none());
        assert!(slide.first.error.as_deref().unwrap().contains("404"));
        // The sibling frame still made it.
        assert!(slide.last.image_url.is_some());
    }
}
