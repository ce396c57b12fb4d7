//! Dynamic-analysis workflow.
//!
//! `load_transcript` → `create_analysis_run` → `run_llm` → `persist_result`.
//! The LLM step streams an open-record schema-and-content generation,
//! surfacing `partial` snapshots as the object grows and a `result` event
//! with the validated document.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use futures_util::StreamExt;
use vs_domain::analysis::AnalysisDocument;
use vs_domain::transcript::format_for_llm;
use vs_domain::{Error, Result, VideoId};
use vs_engine::{Workflow, WorkflowCtx};
use vs_providers::{objects_from_tokens, GenerateRequest, ObjectStreamEvent};
use vs_store::ClaimOutcome;

use super::{events, WorkflowDeps};

pub const NAME: &str = "dynamic_analysis";

const SYSTEM_PROMPT: &str = "You analyze video transcripts. Respond with a single JSON \
object holding `reasoning` (string), `schema` (array of {key, description, type} where \
type is one of \"string\", \"string[]\", \"object\"), and `analysis` (object). The \
analysis must contain `tldr`, `detailed_summary`, and `transcript_corrections` as \
strings, plus one entry per schema key you declared.";

#[derive(Debug, Deserialize)]
pub struct AnalysisArgs {
    pub video_id: VideoId,
    #[serde(default)]
    pub additional_instructions: Option<String>,
    /// Set when the coordinator already claimed the versioned run.
    #[serde(default)]
    pub version: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoadedTranscript {
    title: String,
    text: String,
}

pub struct DynamicAnalysisWorkflow {
    deps: WorkflowDeps,
}

impl DynamicAnalysisWorkflow {
    pub fn new(deps: WorkflowDeps) -> Self {
        Self { deps }
    }

    fn build_prompt(&self, loaded: &LoadedTranscript, instructions: Option<&str>) -> String {
        let mut prompt = format!(
            "Video title: {}\n\nTranscript:\n{}",
            loaded.title, loaded.text
        );
        if let Some(instructions) = instructions {
            prompt.push_str("\n\nAdditional instructions: ");
            prompt.push_str(instructions);
        }
        prompt
    }
}

#[async_trait::async_trait]
impl Workflow for DynamicAnalysisWorkflow {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(&self, ctx: &WorkflowCtx, args: Value) -> Result<Value> {
        let args: AnalysisArgs = serde_json::from_value(args)?;
        let video_id = args.video_id;
        let em = ctx.emitter();
        let retry = self.deps.retry();

        let loaded: LoadedTranscript = ctx
            .step("load_transcript", retry, || {
                let em = em.clone();
                let store = self.deps.store.clone();
                let video_id = video_id.clone();
                async move {
                    em.emit(events::progress("analysis", Some("Loading transcript..."), Some(10)))?;
                    let transcript = store.transcript(video_id.as_str())?.ok_or_else(|| {
                        Error::NotFound(format!("no transcript stored for {video_id}"))
                    })?;
                    if transcript.segments.is_empty() {
                        return Err(Error::NotFound(format!(
                            "transcript for {video_id} has no segments"
                        )));
                    }
                    Ok(LoadedTranscript {
                        title: transcript.title,
                        text: format_for_llm(&transcript.segments),
                    })
                }
            })
            .await?;

        // The coordinator normally claims the versioned run before the
        // engine run exists and passes its number through; a direct start
        // claims one here. Replay is idempotent either way because the
        // step outcome is memoized.
        let version: u32 = ctx
            .step("create_analysis_run", retry, || {
                let store = self.deps.store.clone();
                let video_id = video_id.clone();
                let preclaimed = args.version;
                let instructions = args.additional_instructions.clone();
                let run_id = ctx.run_id();
                async move {
                    let version = match preclaimed {
                        Some(version) => version,
                        None => match store
                            .claim_streaming_version(video_id.as_str(), instructions.as_deref())?
                        {
                            ClaimOutcome::Claimed(v) => v.version,
                            ClaimOutcome::AlreadyStreaming(v) => {
                                return Err(Error::Fatal(format!(
                                    "version {} for {video_id} is already streaming",
                                    v.version
                                )))
                            }
                        },
                    };
                    store.set_version_run_id(video_id.as_str(), version, run_id)?;
                    Ok(version)
                }
            })
            .await?;

        let document: Value = ctx
            .step("run_llm", retry, || {
                let em = em.clone();
                let llm = self.deps.llm.clone();
                let prompt =
                    self.build_prompt(&loaded, args.additional_instructions.as_deref());
                async move {
                    let tokens = llm
                        .stream_text(GenerateRequest {
                            system: Some(SYSTEM_PROMPT.into()),
                            prompt,
                            json_mode: true,
                            ..Default::default()
                        })
                        .await?;

                    let mut objects = objects_from_tokens(tokens);
                    let mut document = None;
                    while let Some(event) = objects.next().await {
                        match event? {
                            ObjectStreamEvent::Partial(snapshot) => {
                                em.emit(events::partial(snapshot))?;
                            }
                            ObjectStreamEvent::Final(value) => {
                                let validated = AnalysisDocument::from_llm_output(&value)?;
                                let value = validated.to_value();
                                em.emit(events::result(value.clone()))?;
                                document = Some(value);
                            }
                        }
                    }
                    document.ok_or_else(|| Error::Fatal("LLM stream produced no object".into()))
                }
            })
            .await?;

        ctx.step("persist_result", retry, || {
            let store = self.deps.store.clone();
            let video_id = video_id.clone();
            let document = document.clone();
            async move {
                store.complete_version(video_id.as_str(), version, &document)?;
                Ok(())
            }
        })
        .await?;

        Ok(json!({
            "runId": ctx.run_id(),
            "version": version,
        }))
    }
}
