//! Fetch-transcript workflow.
//!
//! `check_cache` → `fetch_remote` → `persist`. A cache hit short-circuits
//! after the 50% milestone; the workflow's return value (title + channel)
//! becomes the stream's `complete` payload.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use vs_domain::{Result, VideoId};
use vs_engine::{Workflow, WorkflowCtx};

use super::{events, WorkflowDeps};

pub const NAME: &str = "fetch_transcript";

#[derive(Debug, Deserialize)]
pub struct TranscriptArgs {
    pub video_id: VideoId,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedMeta {
    title: String,
    channel_name: String,
}

pub struct FetchTranscriptWorkflow {
    deps: WorkflowDeps,
}

impl FetchTranscriptWorkflow {
    pub fn new(deps: WorkflowDeps) -> Self {
        Self { deps }
    }
}

#[async_trait::async_trait]
impl Workflow for FetchTranscriptWorkflow {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(&self, ctx: &WorkflowCtx, args: Value) -> Result<Value> {
        let args: TranscriptArgs = serde_json::from_value(args)?;
        let video_id = args.video_id;
        let em = ctx.emitter();
        let retry = self.deps.retry();

        let cached: Option<CachedMeta> = ctx
            .step("check_cache", retry, || {
                let em = em.clone();
                let store = self.deps.store.clone();
                let video_id = video_id.clone();
                async move {
                    em.emit(events::progress("transcript", None, Some(10)))?;
                    let hit = store.transcript(video_id.as_str())?.map(|t| CachedMeta {
                        title: t.title,
                        channel_name: t.channel_name,
                    });
                    if hit.is_some() {
                        em.emit(events::progress(
                            "transcript",
                            Some("Transcript found in database, skipping API call..."),
                            Some(50),
                        ))?;
                    }
                    Ok(hit)
                }
            })
            .await?;

        if let Some(meta) = cached {
            return Ok(json!({
                "title": meta.title,
                "channelName": meta.channel_name,
            }));
        }

        let transcript = ctx
            .step("fetch_remote", retry, || {
                let em = em.clone();
                let source = self.deps.transcripts.clone();
                let video_id = video_id.clone();
                async move {
                    em.emit(events::progress(
                        "transcript",
                        Some("Fetching transcript from API..."),
                        Some(20),
                    ))?;
                    source.fetch(&video_id).await
                }
            })
            .await?;

        let meta: CachedMeta = ctx
            .step("persist", retry, || {
                let em = em.clone();
                let store = self.deps.store.clone();
                let transcript = transcript.clone();
                async move {
                    em.emit(events::progress(
                        "transcript",
                        Some("Saving transcript..."),
                        Some(80),
                    ))?;
                    store.upsert_transcript(&transcript)?;
                    Ok(CachedMeta {
                        title: transcript.title,
                        channel_name: transcript.channel_name,
                    })
                }
            })
            .await?;

        Ok(json!({
            "title": meta.title,
            "channelName": meta.channel_name,
        }))
    }
}
