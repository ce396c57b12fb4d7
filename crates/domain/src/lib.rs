//! Shared domain types for VidScribe.
//!
//! Everything the engine, store, clients, and gateway agree on lives here:
//! the error taxonomy, the run/event model, video identifiers, transcript
//! and slide records, the dynamic-analysis document shape, and the config.

pub mod analysis;
pub mod config;
pub mod error;
pub mod event;
pub mod resource;
pub mod slides;
pub mod sse;
pub mod stream;
pub mod transcript;
pub mod video;

pub use error::{Error, Result};
pub use event::{EventKind, RunEvent, RunState};
pub use video::VideoId;
