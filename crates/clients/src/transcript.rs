//! Transcript source API client.

use serde::Deserialize;

use vs_domain::config::TranscriptApiConfig;
use vs_domain::transcript::{Transcript, TranscriptSegment};
use vs_domain::{Error, Result, VideoId};

use crate::{execute_with_retry, join_url};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fetches transcripts from the external transcript API.
#[async_trait::async_trait]
pub trait TranscriptSource: Send + Sync {
    /// Fetch the transcript for a video. Fails with [`Error::NotFound`]
    /// (fatal) when the service has no results for the id.
    async fn fetch(&self, video_id: &VideoId) -> Result<Transcript>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct TranscriptApiResponse {
    #[serde(default)]
    results: Vec<TranscriptResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscriptResult {
    title: String,
    channel_name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    transcript: Vec<WireSegment>,
}

#[derive(Debug, Deserialize)]
struct WireSegment {
    start: f64,
    end: f64,
    text: String,
}

fn to_domain(video_id: &VideoId, result: TranscriptResult) -> Transcript {
    Transcript {
        video_id: video_id.as_str().to_owned(),
        title: result.title,
        channel_name: result.channel_name,
        description: result.description,
        segments: result
            .transcript
            .into_iter()
            .map(|s| TranscriptSegment {
                start: s.start,
                end: s.end,
                text: s.text,
            })
            .collect(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpTranscriptSource {
    client: reqwest::Client,
    base_url: String,
    token: String,
    max_retries: u32,
}

impl HttpTranscriptSource {
    pub fn new(cfg: &TranscriptApiConfig, token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("transcript client: {e}")))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_owned(),
            token,
            max_retries: cfg.max_retries,
        })
    }
}

#[async_trait::async_trait]
impl TranscriptSource for HttpTranscriptSource {
    async fn fetch(&self, video_id: &VideoId) -> Result<Transcript> {
        let url = join_url(&self.base_url, &format!("v1/transcripts/{video_id}"));
        let response = execute_with_retry("transcript_api", self.max_retries, || {
            self.client.get(&url).bearer_auth(&self.token)
        })
        .await?;

        let parsed: TranscriptApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Transient(format!("transcript_api body: {e}")))?;

        let result = parsed
            .results
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("no transcript results for {video_id}")))?;

        Ok(to_domain(video_id, result))
    }
}
