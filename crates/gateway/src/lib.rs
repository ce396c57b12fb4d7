//! The VidScribe gateway: HTTP surface, resource coordinator, and the
//! workflow catalog, wired over the durable engine.

pub mod api;
pub mod coordinator;
pub mod state;
pub mod workflows;
