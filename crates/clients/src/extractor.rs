//! Slide extractor client: job trigger, SSE job monitor, and the manifest
//! wire format.
//!
//! The extractor deduplicates jobs by video id on its side, so triggering
//! is safe under at-least-once step semantics.

use futures_util::StreamExt;
use serde::Deserialize;

use vs_domain::config::SlideExtractorConfig;
use vs_domain::sse::SseDecoder;
use vs_domain::stream::BoxStream;
use vs_domain::{Error, Result, VideoId};

use crate::{execute_with_retry, join_url};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job updates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Downloading,
    Extracting,
    Uploading,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One progress update from the extractor's SSE stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<f32>,
    #[serde(default)]
    pub message: Option<String>,
    /// Object-storage pointer to the manifest, set on completion.
    #[serde(default)]
    pub metadata_uri: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manifest
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The manifest JSON the extractor writes to object storage.
#[derive(Debug, Clone, Deserialize)]
pub struct SlideManifest {
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub segments: Vec<ManifestSegment>,
}

impl SlideManifest {
    /// The static segments, in manifest order — one slide each.
    pub fn static_segments(&self) -> impl Iterator<Item = &ManifestSegment> {
        self.segments.iter().filter(|s| s.kind == "static")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestSegment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub start_seconds: Option<f64>,
    #[serde(default)]
    pub end_seconds: Option<f64>,
    #[serde(default)]
    pub first_frame: Option<ManifestFrame>,
    #[serde(default)]
    pub last_frame: Option<ManifestFrame>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestFrame {
    #[serde(default)]
    pub frame_id: Option<String>,
    pub uri: String,
    #[serde(default)]
    pub has_text: bool,
    #[serde(default)]
    pub duplicate_of: Option<DuplicateRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DuplicateRef {
    pub slide_number: u32,
    pub frame_position: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait SlideExtractor: Send + Sync {
    /// Trigger extraction for a video. 4xx responses are fatal.
    async fn trigger(&self, video_id: &VideoId) -> Result<()>;

    /// Tail the extractor's SSE job stream.
    async fn monitor(&self, video_id: &VideoId)
        -> Result<BoxStream<'static, Result<JobUpdate>>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpSlideExtractor {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpSlideExtractor {
    pub fn new(cfg: &SlideExtractorConfig, token: String) -> Result<Self> {
        // No overall timeout: the monitor stream stays open for the whole
        // job. The workflow bounds the wait instead.
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("extractor client: {e}")))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_owned(),
            token,
        })
    }
}

#[async_trait::async_trait]
impl SlideExtractor for HttpSlideExtractor {
    async fn trigger(&self, video_id: &VideoId) -> Result<()> {
        let url = join_url(&self.base_url, "v1/extractions");
        let body = serde_json::json!({"video_id": video_id.as_str()});
        // No retries on the trigger: the extractor deduplicates by video
        // id, and the monitor step is the one that owns waiting.
        execute_with_retry("slide_extractor_trigger", 0, || {
            self.client.post(&url).bearer_auth(&self.token).json(&body)
        })
        .await?;
        Ok(())
    }

    async fn monitor(
        &self,
        video_id: &VideoId,
    ) -> Result<BoxStream<'static, Result<JobUpdate>>> {
        let url = join_url(
            &self.base_url,
            &format!("v1/extractions/{video_id}/events"),
        );
        let response = execute_with_retry("slide_extractor_monitor", 0, || {
            self.client
                .get(&url)
                .bearer_auth(&self.token)
                .header("Accept", "text/event-stream")
        })
        .await?;

        let stream = async_stream::stream! {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::new();

            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        for payload in decoder.feed(&bytes) {
                            match serde_json::from_str::<JobUpdate>(&payload) {
                                Ok(update) => yield Ok(update),
                                Err(e) => {
                                    tracing::warn!(error = %e, "unparseable job update");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(Error::Transient(format!("extractor stream: {e}")));
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
