//! Run registry & coordinator.
//!
//! Maps resource-level requests onto engine runs: serves cached results
//! without starting anything, attaches callers to in-flight runs, opens
//! new versioned runs behind the store's partial unique index, runs the
//! two-phase claim for slide extraction, and self-heals the status
//! anomalies the data model calls out.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use vs_domain::config::Config;
use vs_domain::resource::{ExtractionStatus, SlideExtraction};
use vs_domain::stream::BoxStream;
use vs_domain::{Error, EventKind, Result, RunEvent, RunState, VideoId};
use vs_engine::Engine;
use vs_store::{ClaimOutcome, Store};

use crate::workflows::{analysis, slides};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub enum AnalysisDispatch {
    /// A completed result exists; no run started.
    Cached(Value),
    /// A run is already streaming; the caller attaches to it.
    Attached {
        run_id: Uuid,
        version: u32,
        stream: BoxStream<'static, RunEvent>,
    },
    /// A fresh version was claimed and its engine run started.
    Started {
        run_id: Uuid,
        version: u32,
        stream: BoxStream<'static, RunEvent>,
    },
    /// The streaming row's run already ended in failure.
    Failed { version: u32, message: String },
}

impl std::fmt::Debug for AnalysisDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cached(value) => f.debug_tuple("Cached").field(value).finish(),
            Self::Attached { run_id, version, .. } => f
                .debug_struct("Attached")
                .field("run_id", run_id)
                .field("version", version)
                .finish_non_exhaustive(),
            Self::Started { run_id, version, .. } => f
                .debug_struct("Started")
                .field("run_id", run_id)
                .field("version", version)
                .finish_non_exhaustive(),
            Self::Failed { version, message } => f
                .debug_struct("Failed")
                .field("version", version)
                .field("message", message)
                .finish(),
        }
    }
}

pub enum SlidesDispatch {
    AlreadyCompleted { total_slides: u32 },
    /// Another extraction is in flight; duplicate starts conflict.
    Conflict { run_id: Option<String> },
    Started {
        run_id: Uuid,
        stream: BoxStream<'static, RunEvent>,
    },
}

/// Outcome of a resume request.
pub enum ResumeOutcome {
    Stream {
        run_id: Uuid,
        stream: BoxStream<'static, RunEvent>,
    },
    /// The work already finished; the client should reload the cached
    /// result (HTTP 410).
    Completed,
    /// Nothing is streaming for this resource (HTTP 404).
    NotFound,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Coordinator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Coordinator {
    store: Arc<Store>,
    engine: Arc<Engine>,
    config: Arc<Config>,
}

impl Coordinator {
    pub fn new(store: Arc<Store>, engine: Arc<Engine>, config: Arc<Config>) -> Self {
        Self {
            store,
            engine,
            config,
        }
    }

    // ── dynamic analysis ─────────────────────────────────────────────

    /// Dispatch an analysis request: cached result, attach, or cold
    /// start. `force` skips the cache and opens a new version.
    pub async fn dispatch_analysis(
        &self,
        video_id: &VideoId,
        additional_instructions: Option<String>,
        force: bool,
    ) -> Result<AnalysisDispatch> {
        let resource = video_id.as_str();

        // Normalize the streaming-with-result anomaly before reading.
        let healed = self.store.heal_streaming_with_result(resource)?;
        if healed > 0 {
            tracing::warn!(resource, healed, "healed streaming rows with results");
        }

        if !force {
            if let Some(result) = self.store.latest_completed_result(resource)? {
                return Ok(AnalysisDispatch::Cached(result));
            }
        }

        if let Some(row) = self.store.streaming_version(resource)? {
            return self.resolve_streaming_row(resource, row.version, row.workflow_run_id);
        }

        match self
            .store
            .claim_streaming_version(resource, additional_instructions.as_deref())?
        {
            ClaimOutcome::Claimed(row) => {
                let args = json!({
                    "video_id": resource,
                    "version": row.version,
                    "additional_instructions": additional_instructions,
                });
                let started = match self.engine.start(analysis::NAME, args) {
                    Ok(started) => started,
                    Err(e) => {
                        self.store.fail_version(resource, row.version)?;
                        return Err(e);
                    }
                };
                self.store
                    .set_version_run_id(resource, row.version, started.run_id)?;
                self.watch_versioned_run(resource.to_owned(), row.version, started.run_id);
                Ok(AnalysisDispatch::Started {
                    run_id: started.run_id,
                    version: row.version,
                    stream: started.stream,
                })
            }
            ClaimOutcome::AlreadyStreaming(row) => {
                // Lost the race; the winner writes the run id right after
                // starting, so wait briefly for it.
                let version = row.version;
                let mut run_id = row.workflow_run_id;
                for _ in 0..20 {
                    if run_id.is_some() {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                    run_id = self
                        .store
                        .streaming_version(resource)?
                        .and_then(|r| r.workflow_run_id);
                }
                self.resolve_streaming_row(resource, version, run_id)
            }
        }
    }

    /// Resolve a streaming `versioned_runs` row against the engine's view
    /// of its run.
    fn resolve_streaming_row(
        &self,
        resource: &str,
        version: u32,
        run_id: Option<Uuid>,
    ) -> Result<AnalysisDispatch> {
        let Some(run_id) = run_id else {
            self.store.fail_version(resource, version)?;
            return Err(Error::DataAnomaly(format!(
                "streaming version {version} for {resource} has no engine run"
            )));
        };

        match self.engine.run_state(run_id)? {
            None => {
                self.store.fail_version(resource, version)?;
                Err(Error::DataAnomaly(format!(
                    "streaming version {version} for {resource} references unknown run {run_id}"
                )))
            }
            Some(RunState::Completed) => {
                // Completed engine run, yet no result row made the cache
                // path return above: self-heal to failed.
                self.store.fail_version(resource, version)?;
                Err(Error::DataAnomaly(format!(
                    "run {run_id} completed without a stored result"
                )))
            }
            Some(RunState::Failed) | Some(RunState::Cancelled) => {
                self.store.fail_version(resource, version)?;
                Ok(AnalysisDispatch::Failed {
                    version,
                    message: "analysis run failed".into(),
                })
            }
            Some(_) => Ok(AnalysisDispatch::Attached {
                run_id,
                version,
                stream: self.engine.stream(run_id, 0, None),
            }),
        }
    }

    pub fn resume_analysis(&self, video_id: &VideoId, start_index: u64) -> Result<ResumeOutcome> {
        let resource = video_id.as_str();
        self.store.heal_streaming_with_result(resource)?;

        if let Some(row) = self.store.streaming_version(resource)? {
            if let Some(run_id) = row.workflow_run_id {
                return Ok(ResumeOutcome::Stream {
                    run_id,
                    stream: self.engine.stream(run_id, start_index, None),
                });
            }
        }
        if self.store.latest_completed_result(resource)?.is_some() {
            return Ok(ResumeOutcome::Completed);
        }
        Ok(ResumeOutcome::NotFound)
    }

    /// Mark the versioned run failed when its engine run ends any way
    /// other than completed (the workflow persists its own success).
    fn watch_versioned_run(&self, resource: String, version: u32, run_id: Uuid) {
        let store = self.store.clone();
        let mut stream = self.engine.stream(run_id, 0, None);
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let EventKind::RunTerminal { state, .. } = event.kind {
                    if state != RunState::Completed {
                        if let Err(e) = store.fail_version(&resource, version) {
                            tracing::warn!(resource, version, error = %e, "failed to finalize version");
                        }
                    }
                    break;
                }
            }
        });
    }

    // ── slide extraction ─────────────────────────────────────────────

    /// Dispatch a slide-extraction request using the two-phase claim:
    /// upsert the row to `in_progress`, then CAS a placeholder into the
    /// `run_id` slot; only the winner starts the engine run.
    pub async fn dispatch_slides(&self, video_id: &VideoId) -> Result<SlidesDispatch> {
        let resource = video_id.as_str();

        if let Some(row) = self.heal_extraction(video_id)? {
            match row.status {
                ExtractionStatus::Completed => {
                    return Ok(SlidesDispatch::AlreadyCompleted {
                        total_slides: row.total_slides.unwrap_or(0),
                    });
                }
                ExtractionStatus::InProgress if row.run_id.is_some() => {
                    return Ok(SlidesDispatch::Conflict { run_id: row.run_id });
                }
                _ => {}
            }
        }

        self.store.begin_extraction(resource)?;
        let placeholder = format!("claim:{}", Uuid::new_v4());
        if !self.store.claim_extraction_run(resource, &placeholder)? {
            let row = self.store.slide_extraction(resource)?;
            return Ok(SlidesDispatch::Conflict {
                run_id: row.and_then(|r| r.run_id),
            });
        }

        let started = match self
            .engine
            .start(slides::NAME, json!({"video_id": resource}))
        {
            Ok(started) => started,
            Err(e) => {
                self.store.set_extraction_failed(resource, &e.to_string())?;
                return Err(e);
            }
        };
        self.store
            .replace_extraction_run_id(resource, &placeholder, &started.run_id.to_string())?;
        self.watch_extraction(resource.to_owned(), started.run_id);

        Ok(SlidesDispatch::Started {
            run_id: started.run_id,
            stream: started.stream,
        })
    }

    pub fn resume_slides(&self, video_id: &VideoId, start_index: u64) -> Result<ResumeOutcome> {
        let row = self.heal_extraction(video_id)?;
        match row {
            Some(row) if row.status == ExtractionStatus::Completed => Ok(ResumeOutcome::Completed),
            Some(row) if row.status == ExtractionStatus::InProgress => {
                match row.run_id.as_deref().and_then(|id| Uuid::parse_str(id).ok()) {
                    Some(run_id) => Ok(ResumeOutcome::Stream {
                        run_id,
                        stream: self.engine.stream(run_id, start_index, None),
                    }),
                    None => Ok(ResumeOutcome::NotFound),
                }
            }
            _ => Ok(ResumeOutcome::NotFound),
        }
    }

    /// Repair the extraction-status anomalies on read. A row whose engine
    /// run is still live is left untouched — mid-run slide inserts are
    /// progress, not an anomaly.
    fn heal_extraction(&self, video_id: &VideoId) -> Result<Option<SlideExtraction>> {
        let resource = video_id.as_str();
        let Some(row) = self.store.slide_extraction(resource)? else {
            return Ok(None);
        };

        let run_live = row
            .run_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id).ok())
            .and_then(|run_id| self.engine.run_state(run_id).ok().flatten())
            .is_some_and(|state| !state.is_terminal());
        if run_live {
            return Ok(Some(row));
        }

        let slide_count = self.store.slide_count(resource)?;
        let stale_after =
            chrono::Duration::minutes(self.config.workflow.extraction_stale_after_mins);
        let age = chrono::Utc::now() - row.updated_at;

        match row.status {
            ExtractionStatus::InProgress if slide_count > 0 => {
                tracing::warn!(resource, slide_count, "healing in_progress extraction with slides");
                self.store.set_extraction_completed(resource, slide_count)?;
            }
            ExtractionStatus::Completed if slide_count == 0 => {
                tracing::warn!(resource, "healing completed extraction without slides");
                self.store.set_extraction_failed(
                    resource,
                    "data inconsistency: extraction marked completed but no slides exist",
                )?;
            }
            ExtractionStatus::InProgress if age > stale_after => {
                tracing::warn!(resource, "healing timed-out extraction");
                self.store
                    .set_extraction_failed(resource, "slide extraction timed out")?;
            }
            _ => return Ok(Some(row)),
        }
        self.store.slide_extraction(resource)
    }

    /// Store the failure on the extraction row when its run ends badly.
    fn watch_extraction(&self, resource: String, run_id: Uuid) {
        let store = self.store.clone();
        let mut stream = self.engine.stream(run_id, 0, None);
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let EventKind::RunTerminal { state, message, .. } = event.kind {
                    if state != RunState::Completed {
                        let message =
                            message.unwrap_or_else(|| "slide extraction failed".into());
                        if let Err(e) = store.set_extraction_failed(&resource, &message) {
                            tracing::warn!(resource, error = %e, "failed to record extraction failure");
                        }
                    }
                    break;
                }
            }
        });
    }

    /// Periodic sweep applying the timeout repair to extractions that
    /// have sat `in_progress` past the staleness window.
    pub fn sweep_stale_extractions(&self) {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::minutes(self.config.workflow.extraction_stale_after_mins);
        let stale = match self.store.stale_extractions(cutoff) {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!(error = %e, "stale-extraction sweep query failed");
                return;
            }
        };
        for row in stale {
            if let Ok(video_id) = VideoId::new(&row.video_id) {
                if let Err(e) = self.heal_extraction(&video_id) {
                    tracing::warn!(video_id = %row.video_id, error = %e, "stale sweep heal failed");
                }
            }
        }
    }

    // ── misc lookups used by the API layer ───────────────────────────

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}
