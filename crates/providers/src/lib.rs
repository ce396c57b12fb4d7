//! LLM provider layer.
//!
//! The engine's workflows see one trait, [`LanguageModel`], producing a
//! stream of text tokens. [`openai_compat::OpenAiCompatModel`] adapts any
//! OpenAI-style chat completions endpoint to it, and
//! [`object_stream`] assembles token streams into incrementally-parsed
//! JSON objects for the schema-and-content generation steps.

pub mod object_stream;
pub mod openai_compat;
pub mod traits;

pub use object_stream::{objects_from_tokens, ObjectStreamEvent};
pub use openai_compat::OpenAiCompatModel;
pub use traits::{GenerateRequest, LanguageModel, StreamEvent, TokenStream, Usage};
