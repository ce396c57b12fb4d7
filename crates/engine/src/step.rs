//! The step executor and workflow context.
//!
//! A step is an effectful async body with a stable id and a retry policy.
//! Outcomes are memoized in the run's event log keyed by
//! `(step_id, call_ordinal)`; re-executing the workflow (crash recovery)
//! returns recorded outcomes without re-running bodies. Only results and
//! *fatal* errors memoize — a transient failure that exhausted its retries
//! is recorded but re-executed on the next recovery attempt.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use vs_domain::event::digest_value;
use vs_domain::{Error, EventKind, Result};

use crate::cancel::CancelToken;
use crate::log::EventBus;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a step responds to transient failures. Fatal errors ignore the
/// policy entirely.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Base delay; attempt `n` sleeps `backoff_base * 2^n`.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// No retries at all; the first failure propagates.
    pub fn none() -> Self {
        Self::retries(0)
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memoized outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
enum StepOutcome {
    Value(serde_json::Value),
    Fatal { error_kind: String, message: String },
}

/// Rebuild the error a recorded fatal outcome stands for.
fn replay_error(error_kind: &str, message: &str) -> Error {
    match error_kind {
        "not_found" => Error::NotFound(message.to_owned()),
        "validation" => Error::Validation(message.to_owned()),
        "data_anomaly" => Error::DataAnomaly(message.to_owned()),
        "cancelled" => Error::Cancelled,
        _ => Error::Fatal(message.to_owned()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Emitter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A cloneable capability for writing client-visible events onto the run's
/// log. Step bodies move a clone into their closure; because emits happen
/// inside memoized bodies, replay does not re-issue them.
#[derive(Clone)]
pub struct Emitter {
    run_id: Uuid,
    bus: Arc<EventBus>,
}

impl Emitter {
    pub fn emit(&self, payload: serde_json::Value) -> Result<()> {
        self.bus.append(
            self.run_id,
            EventKind::Emit {
                namespace: None,
                payload,
            },
        )?;
        Ok(())
    }

    /// Emit onto a named sub-channel.
    pub fn emit_in(&self, namespace: &str, payload: serde_json::Value) -> Result<()> {
        self.bus.append(
            self.run_id,
            EventKind::Emit {
                namespace: Some(namespace.to_owned()),
                payload,
            },
        )?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle passed to a workflow function. Owns the step executor state for
/// one (re-)execution: memoized records loaded from the log and per-step-id
/// call ordinal counters.
///
/// Parallel branches share the context immutably; each branch must use a
/// distinct step id prefix so call ordinals stay well-defined per branch.
pub struct WorkflowCtx {
    run_id: Uuid,
    bus: Arc<EventBus>,
    records: HashMap<(String, u32), StepOutcome>,
    ordinals: Mutex<HashMap<String, u32>>,
    cancel: CancelToken,
}

impl WorkflowCtx {
    /// Build a context by scanning the run's existing log for memoized
    /// step outcomes.
    pub(crate) fn load(run_id: Uuid, bus: Arc<EventBus>, cancel: CancelToken) -> Result<Self> {
        let mut records = HashMap::new();
        for event in bus.store().events_from(run_id, 0)? {
            match event.kind {
                EventKind::StepResult {
                    step_id,
                    call_ordinal,
                    value,
                    ..
                } => {
                    records.insert((step_id, call_ordinal), StepOutcome::Value(value));
                }
                EventKind::StepError {
                    step_id,
                    call_ordinal,
                    error_kind,
                    message,
                    retriable: false,
                } => {
                    records.insert(
                        (step_id, call_ordinal),
                        StepOutcome::Fatal {
                            error_kind,
                            message,
                        },
                    );
                }
                _ => {}
            }
        }
        Ok(Self {
            run_id,
            bus,
            records,
            ordinals: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn emitter(&self) -> Emitter {
        Emitter {
            run_id: self.run_id,
            bus: self.bus.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Execute a step.
    ///
    /// The zero-based call ordinal is the occurrence count of `step_id`
    /// within this execution. If the log already holds an outcome for
    /// `(step_id, ordinal)` the body is skipped and the memoized value
    /// (or replayed fatal error) is returned.
    pub async fn step<T, F, Fut>(&self, step_id: &str, policy: RetryPolicy, body: F) -> Result<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ordinal = {
            let mut ordinals = self.ordinals.lock();
            let counter = ordinals.entry(step_id.to_owned()).or_insert(0);
            let current = *counter;
            *counter += 1;
            current
        };

        if let Some(outcome) = self.records.get(&(step_id.to_owned(), ordinal)) {
            return match outcome {
                StepOutcome::Value(value) => Ok(serde_json::from_value(value.clone())?),
                StepOutcome::Fatal {
                    error_kind,
                    message,
                } => Err(replay_error(error_kind, message)),
            };
        }

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.bus.append(
            self.run_id,
            EventKind::StepStarted {
                step_id: step_id.to_owned(),
                call_ordinal: ordinal,
                args_digest: None,
            },
        )?;

        let mut attempt = 0u32;
        loop {
            match body().await {
                Ok(value) => {
                    let json = serde_json::to_value(&value)?;
                    let value_digest = digest_value(&json);
                    self.bus.append(
                        self.run_id,
                        EventKind::StepResult {
                            step_id: step_id.to_owned(),
                            call_ordinal: ordinal,
                            value: json,
                            value_digest,
                        },
                    )?;
                    return Ok(value);
                }
                Err(e) if e.is_retriable() && attempt < policy.max_retries => {
                    let delay = policy.delay(attempt);
                    tracing::warn!(
                        run_id = %self.run_id,
                        step_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    let retriable = e.is_retriable();
                    self.bus.append(
                        self.run_id,
                        EventKind::StepError {
                            step_id: step_id.to_owned(),
                            call_ordinal: ordinal,
                            error_kind: e.kind().to_owned(),
                            message: e.to_string(),
                            retriable,
                        },
                    )?;
                    return Err(e);
                }
            }
        }
    }
}
