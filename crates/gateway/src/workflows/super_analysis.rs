//! Super-analysis workflow.
//!
//! `check_cache` → `load_picks` → `ensure_slide_analyses` →
//! `load_context` → `synthesize` → `persist`. Missing per-slide analyses
//! are fanned out in parallel with an aggregate progress event after each
//! settles; synthesis proceeds as long as at least one slide analysis is
//! available.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use vs_domain::slides::{picked_targets, SlideTarget};
use vs_domain::transcript::format_timestamp;
use vs_domain::{Error, Result, VideoId};
use vs_engine::{Workflow, WorkflowCtx};
use vs_providers::{GenerateRequest, StreamEvent};

use super::slide_analysis::analyze_target;
use super::{events, WorkflowDeps};

pub const NAME: &str = "super_analysis";

const SYNTHESIS_PROMPT: &str = "Write a unified markdown report of this video. Combine \
the transcript analysis with the per-slide analyses, ordering slides by their timing \
and weaving them into the narrative. Use headings, keep slide content faithful.";

#[derive(Debug, Deserialize)]
pub struct SuperAnalysisArgs {
    pub video_id: VideoId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TargetOutcome {
    slide_number: u32,
    frame_position: String,
    status: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SynthesisContext {
    title: Option<String>,
    analysis: Option<Value>,
    slide_sections: Vec<SlideSection>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SlideSection {
    slide_number: u32,
    frame_position: String,
    start_seconds: Option<f64>,
    markdown: String,
}

pub struct SuperAnalysisWorkflow {
    deps: WorkflowDeps,
}

impl SuperAnalysisWorkflow {
    pub fn new(deps: WorkflowDeps) -> Self {
        Self { deps }
    }

    fn build_prompt(&self, context: &SynthesisContext) -> String {
        let mut prompt = String::new();
        if let Some(title) = &context.title {
            prompt.push_str(&format!("Video title: {title}\n\n"));
        }
        if let Some(analysis) = &context.analysis {
            prompt.push_str("Transcript analysis:\n");
            prompt.push_str(&analysis.to_string());
            prompt.push_str("\n\n");
        }
        prompt.push_str("Slide analyses (in timeline order):\n");
        for section in &context.slide_sections {
            let at = section
                .start_seconds
                .map(format_timestamp)
                .unwrap_or_else(|| "??:??:??".into());
            prompt.push_str(&format!(
                "\n--- Slide {} ({} frame, at {at}) ---\n{}\n",
                section.slide_number, section.frame_position, section.markdown
            ));
        }
        prompt
    }
}

#[async_trait::async_trait]
impl Workflow for SuperAnalysisWorkflow {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(&self, ctx: &WorkflowCtx, args: Value) -> Result<Value> {
        let args: SuperAnalysisArgs = serde_json::from_value(args)?;
        let video_id = args.video_id;
        let em = ctx.emitter();
        let retry = self.deps.retry();

        let cached: Option<String> = ctx
            .step("check_cache", retry, || {
                let em = em.clone();
                let store = self.deps.store.clone();
                let video_id = video_id.clone();
                async move {
                    let hit = store.super_analysis(video_id.as_str())?;
                    if let Some(markdown) = &hit {
                        em.emit(events::result(json!({"markdown": markdown})))?;
                    }
                    Ok(hit)
                }
            })
            .await?;

        if let Some(markdown) = cached {
            return Ok(json!({"videoId": video_id.as_str(), "markdown": markdown, "cached": true}));
        }

        let targets: Vec<SlideTarget> = ctx
            .step("load_picks", retry, || {
                let store = self.deps.store.clone();
                let video_id = video_id.clone();
                async move {
                    let targets = picked_targets(&store.slide_feedback(video_id.as_str())?);
                    if targets.is_empty() {
                        return Err(Error::NotFound(format!(
                            "no picked slides for {video_id}; pick frames first"
                        )));
                    }
                    Ok(targets)
                }
            })
            .await?;

        // Fan out analyses for targets that lack one, emitting an
        // aggregate after each settles. Wrapped in its own step so replay
        // neither re-runs children nor repeats the aggregates.
        let outcomes: Vec<TargetOutcome> = ctx
            .step("ensure_slide_analyses", retry, || {
                let em = em.clone();
                let video_id = video_id.clone();
                let targets = targets.clone();
                async move {
                    let mut statuses: HashMap<SlideTarget, String> = HashMap::new();
                    let mut missing = Vec::new();
                    for &target in &targets {
                        let existing = self.deps.store.slide_analysis(
                            video_id.as_str(),
                            target.slide_number,
                            target.frame_position,
                        )?;
                        if existing.is_some() {
                            statuses.insert(target, "cached".into());
                        } else {
                            statuses.insert(target, "pending".into());
                            missing.push(target);
                        }
                    }

                    let total = targets.len();

                    let mut pending: FuturesUnordered<_> = missing
                        .into_iter()
                        .map(|target| {
                            let em = em.clone();
                            let video_id = video_id.clone();
                            async move {
                                let step_id = format!(
                                    "analyze_slide:{}:{}",
                                    target.slide_number, target.frame_position
                                );
                                let result = ctx
                                    .step(&step_id, self.deps.retry(), || {
                                        let em = em.clone();
                                        let video_id = video_id.clone();
                                        async move {
                                            analyze_target(&self.deps, &em, &video_id, target)
                                                .await
                                        }
                                    })
                                    .await;
                                (target, result.is_ok())
                            }
                        })
                        .collect();

                    while let Some((target, ok)) = pending.next().await {
                        statuses.insert(target, if ok { "completed" } else { "failed" }.into());
                        let completed = statuses.values().filter(|s| *s != "failed" && *s != "pending").count();
                        let snapshot: Vec<Value> = targets
                            .iter()
                            .map(|t| {
                                json!({
                                    "slide_number": t.slide_number,
                                    "frame_position": t.frame_position.as_str(),
                                    "status": statuses[t],
                                })
                            })
                            .collect();
                        em.emit(events::slide_analysis_progress(
                            json!(snapshot),
                            completed,
                            total,
                        ))?;
                    }

                    let outcomes: Vec<TargetOutcome> = targets
                        .iter()
                        .map(|t| TargetOutcome {
                            slide_number: t.slide_number,
                            frame_position: t.frame_position.as_str().into(),
                            status: statuses[t].clone(),
                        })
                        .collect();

                    if outcomes.iter().all(|o| o.status == "failed") {
                        return Err(Error::Fatal(
                            "All slide analyses failed; cannot synthesize".into(),
                        ));
                    }
                    Ok(outcomes)
                }
            })
            .await?;

        let context: SynthesisContext = ctx
            .step("load_context", retry, || {
                let store = self.deps.store.clone();
                let video_id = video_id.clone();
                let outcomes = outcomes.clone();
                async move {
                    let title = store.transcript(video_id.as_str())?.map(|t| t.title);
                    let analysis = store.latest_completed_result(video_id.as_str())?;
                    let slides = store.slides(video_id.as_str())?;
                    let analyses = store.slide_analyses(video_id.as_str())?;

                    let mut slide_sections = Vec::new();
                    for outcome in &outcomes {
                        if outcome.status == "failed" {
                            continue;
                        }
                        let Some(result) = analyses.iter().find(|a| {
                            a.slide_number == outcome.slide_number
                                && a.frame_position.as_str() == outcome.frame_position
                        }) else {
                            continue;
                        };
                        let start_seconds = slides
                            .iter()
                            .find(|s| s.slide_number == outcome.slide_number)
                            .and_then(|s| s.start_seconds);
                        slide_sections.push(SlideSection {
                            slide_number: outcome.slide_number,
                            frame_position: outcome.frame_position.clone(),
                            start_seconds,
                            markdown: result.markdown.clone(),
                        });
                    }
                    slide_sections.sort_by(|a, b| {
                        a.slide_number
                            .cmp(&b.slide_number)
                            .then_with(|| a.frame_position.cmp(&b.frame_position))
                    });

                    Ok(SynthesisContext {
                        title,
                        analysis,
                        slide_sections,
                    })
                }
            })
            .await?;

        let markdown: String = ctx
            .step("synthesize", retry, || {
                let em = em.clone();
                let llm = self.deps.llm.clone();
                let prompt = self.build_prompt(&context);
                async move {
                    let mut tokens = llm
                        .stream_text(GenerateRequest {
                            system: Some(SYNTHESIS_PROMPT.into()),
                            prompt,
                            ..Default::default()
                        })
                        .await?;

                    let mut markdown = String::new();
                    while let Some(event) = tokens.next().await {
                        match event? {
                            StreamEvent::Token { text } => {
                                markdown.push_str(&text);
                                em.emit(events::partial(json!({"text": text})))?;
                            }
                            StreamEvent::Done { .. } => break,
                        }
                    }
                    if markdown.trim().is_empty() {
                        return Err(Error::Fatal("synthesis produced no output".into()));
                    }
                    em.emit(events::result(json!({"markdown": markdown})))?;
                    Ok(markdown)
                }
            })
            .await?;

        ctx.step("persist", retry, || {
            let store = self.deps.store.clone();
            let video_id = video_id.clone();
            let markdown = markdown.clone();
            async move {
                store.set_super_analysis(video_id.as_str(), &markdown)?;
                Ok(())
            }
        })
        .await?;

        Ok(json!({"videoId": video_id.as_str(), "markdown": markdown}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::testutil::{self, VID};
    use std::sync::Arc;
    use vs_domain::slides::{FramePosition, Slide, SlideFeedback, SlideFrame};
    use vs_domain::{EventKind, RunState};
    use vs_engine::Engine;
    use vs_store::Store;

    fn seed_slide(store: &Store, n: u32, with_image: bool) {
        let image_url = with_image.then(|| format!("https://blob.example/s/{n}.webp"));
        store
            .insert_slide(&Slide {
                video_id: VID.into(),
                slide_number: n,
                start_seconds: Some(n as f64 * 30.0),
                end_seconds: Some(n as f64 * 30.0 + 10.0),
                first: SlideFrame {
                    image_url,
                    ..Default::default()
                },
                last: SlideFrame::default(),
            })
            .unwrap();
    }

    fn pick_first(store: &Store, n: u32) {
        store
            .set_slide_feedback(
                VID,
                &SlideFeedback {
                    slide_number: n,
                    is_first_frame_picked: true,
                    is_last_frame_picked: false,
                },
            )
            .unwrap();
    }

    fn engine_with(store: Arc<Store>, llm: Arc<dyn vs_providers::LanguageModel>) -> Arc<Engine> {
        let deps = testutil::minimal_deps(store.clone(), llm);
        let engine = Engine::new(store);
        engine.register(Arc::new(SuperAnalysisWorkflow::new(deps)));
        engine
    }

    #[tokio::test]
    async fn cached_super_analysis_returns_immediately() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.set_super_analysis(VID, "# Existing Report").unwrap();
        let engine = engine_with(store.clone(), testutil::ScriptedModel::new(vec![]));

        let started = engine.start(NAME, json!({"video_id": VID})).unwrap();
        let terminal = testutil::wait_terminal(&store, started.run_id).await;

        match terminal.kind {
            EventKind::RunTerminal { state, result, .. } => {
                assert_eq!(state, RunState::Completed);
                let result = result.unwrap();
                assert_eq!(result["cached"], true);
                assert_eq!(result["markdown"], "# Existing Report");
            }
            other => panic!("expected terminal, got {other:?}"),
        }

        let emits = testutil::emitted(&store, started.run_id);
        assert_eq!(emits.len(), 1);
        assert_eq!(emits[0]["type"], "result");
    }

    #[tokio::test]
    async fn no_picks_fails() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = engine_with(store.clone(), testutil::ScriptedModel::new(vec![]));

        let started = engine.start(NAME, json!({"video_id": VID})).unwrap();
        let terminal = testutil::wait_terminal(&store, started.run_id).await;
        match terminal.kind {
            EventKind::RunTerminal { state, message, .. } => {
                assert_eq!(state, RunState::Failed);
                assert!(message.unwrap().contains("no picked slides"));
            }
            other => panic!("expected terminal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_slide_failure_still_synthesizes() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        // Three picks; slide 3 has no image so its analysis fails fast.
        for n in 1..=3 {
            seed_slide(&store, n, n != 3);
            pick_first(&store, n);
        }
        // Two slide analyses + one synthesis output.
        let engine = engine_with(
            store.clone(),
            testutil::ScriptedModel::new(vec!["# S1", "# S2", "# The Unified Report"]),
        );

        let started = engine.start(NAME, json!({"video_id": VID})).unwrap();
        let terminal = testutil::wait_terminal(&store, started.run_id).await;

        match terminal.kind {
            EventKind::RunTerminal { state, result, .. } => {
                assert_eq!(state, RunState::Completed);
                assert!(result.unwrap()["markdown"]
                    .as_str()
                    .unwrap()
                    .contains("Unified Report"));
            }
            other => panic!("expected terminal, got {other:?}"),
        }

        // Aggregate progress events settled to 2 completed of 3.
        let emits = testutil::emitted(&store, started.run_id);
        let aggregates: Vec<&Value> = emits
            .iter()
            .filter(|e| e["type"] == "slide_analysis_progress")
            .collect();
        assert_eq!(aggregates.len(), 3);
        let last = aggregates.last().unwrap();
        assert_eq!(last["completedCount"], 2);
        assert_eq!(last["totalCount"], 3);
        let failed = last["slides"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|s| s["status"] == "failed")
            .count();
        assert_eq!(failed, 1);

        assert_eq!(store.super_analysis(VID).unwrap().unwrap(), "# The Unified Report");
    }

    #[tokio::test]
    async fn all_slide_failures_abort_synthesis() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for n in 1..=2 {
            seed_slide(&store, n, false);
            pick_first(&store, n);
        }
        let engine = engine_with(store.clone(), testutil::ScriptedModel::new(vec![]));

        let started = engine.start(NAME, json!({"video_id": VID})).unwrap();
        let terminal = testutil::wait_terminal(&store, started.run_id).await;
        match terminal.kind {
            EventKind::RunTerminal { state, message, .. } => {
                assert_eq!(state, RunState::Failed);
                assert!(message.unwrap().contains("All slide analyses failed"));
            }
            other => panic!("expected terminal, got {other:?}"),
        }
        assert!(store.super_analysis(VID).unwrap().is_none());
    }

    #[tokio::test]
    async fn existing_analyses_are_reused_not_regenerated() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_slide(&store, 1, true);
        pick_first(&store, 1);
        store
            .upsert_slide_analysis(VID, 1, FramePosition::First, "# Prebaked")
            .unwrap();
        // Only the synthesis output is scripted: a slide-analysis call
        // would exhaust the model and fail the run.
        let engine = engine_with(store.clone(), testutil::ScriptedModel::new(vec!["# Report"]));

        let started = engine.start(NAME, json!({"video_id": VID})).unwrap();
        let terminal = testutil::wait_terminal(&store, started.run_id).await;
        match terminal.kind {
            EventKind::RunTerminal { state, .. } => assert_eq!(state, RunState::Completed),
            other => panic!("expected terminal, got {other:?}"),
        }
        assert_eq!(
            store
                .slide_analysis(VID, 1, FramePosition::First)
                .unwrap()
                .unwrap()
                .markdown,
            "# Prebaked"
        );
    }

    #[tokio::test]
    async fn synthesis_prompt_orders_slides_by_number() {
        let deps = testutil::minimal_deps(
            Arc::new(Store::open_in_memory().unwrap()),
            testutil::ScriptedModel::new(vec![]),
        );
        let wf = SuperAnalysisWorkflow::new(deps);
        let context = SynthesisContext {
            title: Some("T".into()),
            analysis: None,
            slide_sections: vec![
                SlideSection {
                    slide_number: 2,
                    frame_position: "first".into(),
                    start_seconds: Some(60.0),
                    markdown: "# Two".into(),
                },
                SlideSection {
                    slide_number: 1,
                    frame_position: "first".into(),
                    start_seconds: Some(30.0),
                    markdown: "# One".into(),
                },
            ],
        };
        let prompt = wf.build_prompt(&context);
        let one = prompt.find("# One").unwrap();
        let two = prompt.find("# Two").unwrap();
        // Prompt lists sections in given order; load_context sorts them.
        assert!(two < one);
        assert!(prompt.contains("00:01:00"));
    }
}
