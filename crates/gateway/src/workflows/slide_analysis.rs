//! Per-slide-analysis workflow.
//!
//! One child step per target streams a markdown analysis of the slide's
//! image. Incremental chunks go out on the target's namespaced sub-stream
//! (`"{slide_number}-{first|last}"`); the finished markdown lands on the
//! main stream and in the store.

use serde::Deserialize;
use serde_json::{json, Value};

use futures_util::StreamExt;
use vs_domain::slides::{picked_targets, FramePosition, Slide, SlideTarget};
use vs_domain::{Error, Result, VideoId};
use vs_engine::{Emitter, Workflow, WorkflowCtx};
use vs_providers::{GenerateRequest, StreamEvent};

use super::{events, WorkflowDeps};

pub const NAME: &str = "slide_analysis";

const SLIDE_PROMPT: &str = "Describe this presentation slide as markdown. Transcribe \
visible text faithfully, describe diagrams, and keep the structure of the slide.";

#[derive(Debug, Deserialize)]
pub struct SlideAnalysisArgs {
    pub video_id: VideoId,
    /// Explicit targets; when absent, all picked frames are analyzed.
    #[serde(default)]
    pub targets: Option<Vec<SlideTarget>>,
}

/// Resolve the image to analyze for a frame, following one duplicate hop.
fn resolve_image_url(
    store: &vs_store::Store,
    video_id: &VideoId,
    slide: &Slide,
    position: FramePosition,
) -> Result<Option<String>> {
    let frame = slide.frame(position);
    if let Some(url) = &frame.image_url {
        return Ok(Some(url.clone()));
    }
    if let (Some(target_slide), Some(target_position)) =
        (frame.duplicate_of_slide, frame.duplicate_of_frame)
    {
        if let Some(original) = store.slide(video_id.as_str(), target_slide)? {
            return Ok(original.frame(target_position).image_url.clone());
        }
    }
    Ok(None)
}

/// Stream one slide-frame analysis and upsert the result. Shared with the
/// super-analysis workflow's fan-out.
pub(crate) async fn analyze_target(
    deps: &WorkflowDeps,
    em: &Emitter,
    video_id: &VideoId,
    target: SlideTarget,
) -> Result<String> {
    let slide = deps
        .store
        .slide(video_id.as_str(), target.slide_number)?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "slide {} not found for {video_id}",
                target.slide_number
            ))
        })?;

    let image_url = resolve_image_url(&deps.store, video_id, &slide, target.frame_position)?
        .ok_or_else(|| {
            Error::Fatal(format!(
                "no image available for slide {} frame {}",
                target.slide_number, target.frame_position
            ))
        })?;

    let tokens = deps
        .llm
        .stream_text(GenerateRequest {
            system: Some(SLIDE_PROMPT.into()),
            prompt: "Analyze this slide.".into(),
            image_url: Some(image_url),
            model: deps.config.llm.slide_model.clone(),
            ..Default::default()
        })
        .await?;

    let namespace = target.namespace();
    let mut markdown = String::new();
    let mut tokens = tokens;
    while let Some(event) = tokens.next().await {
        match event? {
            StreamEvent::Token { text } => {
                markdown.push_str(&text);
                em.emit_in(
                    &namespace,
                    events::slide_markdown(
                        target.slide_number,
                        target.frame_position.as_str(),
                        &text,
                    ),
                )?;
            }
            StreamEvent::Done { .. } => break,
        }
    }

    if markdown.trim().is_empty() {
        return Err(Error::Fatal(format!(
            "empty analysis for slide {} frame {}",
            target.slide_number, target.frame_position
        )));
    }

    deps.store.upsert_slide_analysis(
        video_id.as_str(),
        target.slide_number,
        target.frame_position,
        &markdown,
    )?;
    em.emit(events::slide_markdown(
        target.slide_number,
        target.frame_position.as_str(),
        &markdown,
    ))?;
    Ok(markdown)
}

pub struct SlideAnalysisWorkflow {
    deps: WorkflowDeps,
}

impl SlideAnalysisWorkflow {
    pub fn new(deps: WorkflowDeps) -> Self {
        Self { deps }
    }
}

#[async_trait::async_trait]
impl Workflow for SlideAnalysisWorkflow {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(&self, ctx: &WorkflowCtx, args: Value) -> Result<Value> {
        let args: SlideAnalysisArgs = serde_json::from_value(args)?;
        let video_id = args.video_id;
        let em = ctx.emitter();
        let retry = self.deps.retry();

        let targets: Vec<SlideTarget> = ctx
            .step("resolve_targets", retry, || {
                let store = self.deps.store.clone();
                let explicit = args.targets.clone();
                let video_id = video_id.clone();
                async move {
                    let targets = match explicit {
                        Some(targets) => targets,
                        None => picked_targets(&store.slide_feedback(video_id.as_str())?),
                    };
                    if targets.is_empty() {
                        return Err(Error::NotFound(format!(
                            "no picked slides to analyze for {video_id}"
                        )));
                    }
                    Ok(targets)
                }
            })
            .await?;

        // Fan out one child step per target; each branch gets its own step
        // id so memoization stays per-target.
        let outcomes = futures_util::future::join_all(targets.iter().map(|&target| {
            let em = em.clone();
            let video_id = video_id.clone();
            let step_id = format!(
                "analyze_slide:{}:{}",
                target.slide_number, target.frame_position
            );
            async move {
                let result = ctx
                    .step(&step_id, retry, || {
                        let em = em.clone();
                        let video_id = video_id.clone();
                        async move {
                            analyze_target(&self.deps, &em, &video_id, target).await
                        }
                    })
                    .await;
                (target, result.is_ok())
            }
        }))
        .await;

        let completed = outcomes.iter().filter(|(_, ok)| *ok).count();
        let failed = outcomes.len() - completed;
        if completed == 0 {
            return Err(Error::Fatal("All slide analyses failed".into()));
        }

        Ok(json!({
            "completedCount": completed,
            "failedCount": failed,
            "totalCount": outcomes.len(),
        }))
    }
}
