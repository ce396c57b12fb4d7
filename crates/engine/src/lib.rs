//! The durable workflow engine.
//!
//! A [`runtime::Engine`] executes named workflows composed of idempotent
//! steps. Progress is persisted as an append-only event log per run
//! ([`log::EventBus`]), memoized step outcomes make re-execution after a
//! crash resume at the first unsatisfied step, and readers can attach to a
//! run's stream at any index without loss.

pub mod cancel;
pub mod log;
pub mod merge;
pub mod runtime;
pub mod step;

pub use cancel::{CancelMap, CancelToken};
pub use log::EventBus;
pub use merge::StreamMerger;
pub use runtime::{Engine, StartedRun, Workflow};
pub use step::{Emitter, RetryPolicy, WorkflowCtx};
