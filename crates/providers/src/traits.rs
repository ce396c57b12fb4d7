use serde::{Deserialize, Serialize};

use vs_domain::stream::BoxStream;
use vs_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / stream types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic text generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    /// System prompt, when the model should be primed.
    pub system: Option<String>,
    /// The user prompt.
    pub prompt: String,
    /// An image the prompt refers to (slide analysis); providers without
    /// vision support reject requests carrying one.
    pub image_url: Option<String>,
    /// When true, request valid-JSON-only output.
    pub json_mode: bool,
    /// Model identifier override. `None` uses the provider default.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Events emitted during LLM streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A text token chunk.
    Token { text: String },
    /// Stream finished.
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
}

/// Token usage for a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The stream a provider returns.
pub type TokenStream = BoxStream<'static, Result<StreamEvent>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An opaque streaming text generator.
///
/// Implementations translate between this interface and a provider's wire
/// format; workflows never see provider specifics.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    /// Start a streaming generation.
    async fn stream_text(&self, req: GenerateRequest) -> Result<TokenStream>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}
