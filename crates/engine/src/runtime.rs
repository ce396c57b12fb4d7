//! Workflow runtime: registration, start, streaming handles, cooperative
//! cancellation, and crash recovery.
//!
//! A workflow is a registered async function driven to completion on its
//! own task. Its event log is the replayable trace: on restart,
//! [`Engine::recover`] re-invokes every non-terminal run's function with
//! the original args, and the step executor's memoization makes execution
//! resume at the first unsatisfied step.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Instrument;
use uuid::Uuid;

use vs_domain::event::digest_value;
use vs_domain::stream::BoxStream;
use vs_domain::{Error, EventKind, Result, RunEvent, RunState};
use vs_store::Store;

use crate::cancel::CancelMap;
use crate::log::EventBus;
use crate::step::WorkflowCtx;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A named workflow. The return value becomes the terminal event's result
/// payload (the client-visible `complete` event).
#[async_trait::async_trait]
pub trait Workflow: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &WorkflowCtx, args: serde_json::Value)
        -> Result<serde_json::Value>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle returned by [`Engine::start`].
pub struct StartedRun {
    pub run_id: Uuid,
    /// Reader over the run's log from index 0.
    pub stream: BoxStream<'static, RunEvent>,
}

pub struct Engine {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    workflows: RwLock<HashMap<String, Arc<dyn Workflow>>>,
    cancels: CancelMap,
}

impl Engine {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(store.clone()));
        Arc::new(Self {
            store,
            bus,
            workflows: RwLock::new(HashMap::new()),
            cancels: CancelMap::new(),
        })
    }

    pub fn register(&self, workflow: Arc<dyn Workflow>) {
        self.workflows
            .write()
            .insert(workflow.name().to_owned(), workflow);
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Allocate a run, seed its log with the synthetic start event, and
    /// schedule the workflow. The returned stream reads from index 0.
    pub fn start(
        self: &Arc<Self>,
        workflow: &str,
        args: serde_json::Value,
    ) -> Result<StartedRun> {
        let handler = self
            .workflows
            .read()
            .get(workflow)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("unknown workflow {workflow}")))?;

        let run_id = Uuid::new_v4();
        let args_digest = digest_value(&args);
        self.store.insert_run(run_id, workflow, &args, &args_digest)?;
        self.bus.append(
            run_id,
            EventKind::StepStarted {
                step_id: "__start__".into(),
                call_ordinal: 0,
                args_digest: Some(args_digest),
            },
        )?;

        let stream = self.bus.read(run_id, 0, None);
        self.spawn_run(handler, run_id, args);
        Ok(StartedRun { run_id, stream })
    }

    /// Attach a reader to an existing run. Never restarts the workflow.
    pub fn stream(
        &self,
        run_id: Uuid,
        start_index: u64,
        namespace: Option<String>,
    ) -> BoxStream<'static, RunEvent> {
        self.bus.read(run_id, start_index, namespace)
    }

    pub fn run_state(&self, run_id: Uuid) -> Result<Option<RunState>> {
        Ok(self.store.run(run_id)?.map(|row| row.state))
    }

    /// Set the cooperative cancel flag. Returns false when the run is not
    /// live (already terminal or unknown).
    pub fn cancel(&self, run_id: Uuid) -> bool {
        self.cancels.cancel(run_id)
    }

    /// Re-invoke every non-terminal run's workflow. Called once at
    /// startup; previously-completed steps return instantly from the log.
    pub fn recover(self: &Arc<Self>) -> Result<usize> {
        let mut resumed = 0;
        for row in self.store.nonterminal_runs()? {
            let handler = self.workflows.read().get(&row.workflow).cloned();
            match handler {
                Some(handler) => {
                    tracing::info!(run_id = %row.run_id, workflow = %row.workflow, "recovering run");
                    self.spawn_run(handler, row.run_id, row.args);
                    resumed += 1;
                }
                None => {
                    tracing::warn!(
                        run_id = %row.run_id,
                        workflow = %row.workflow,
                        "no handler registered for persisted run; marking failed"
                    );
                    self.finish(
                        row.run_id,
                        Err(Error::Fatal(format!(
                            "workflow {} is not registered",
                            row.workflow
                        ))),
                    );
                }
            }
        }
        Ok(resumed)
    }

    // ── internals ────────────────────────────────────────────────────

    fn spawn_run(self: &Arc<Self>, handler: Arc<dyn Workflow>, run_id: Uuid, args: serde_json::Value) {
        let engine = self.clone();
        let cancel = self.cancels.register(run_id);
        let span = tracing::info_span!("run", %run_id, workflow = handler.name());

        tokio::spawn(
            async move {
                if let Err(e) = engine.store.set_run_state(run_id, RunState::Running) {
                    tracing::warn!(error = %e, "failed to mark run running");
                }

                let result = match WorkflowCtx::load(run_id, engine.bus.clone(), cancel) {
                    Ok(ctx) => handler.run(&ctx, args).await,
                    Err(e) => Err(e),
                };
                engine.finish(run_id, result);
            }
            .instrument(span),
        );
    }

    /// Seal the log with the terminal event and finalize the run row. The
    /// workflow never observes its own terminal event.
    fn finish(&self, run_id: Uuid, result: Result<serde_json::Value>) {
        let (state, terminal) = match result {
            Ok(value) => (
                RunState::Completed,
                EventKind::RunTerminal {
                    state: RunState::Completed,
                    result: Some(value),
                    message: None,
                },
            ),
            Err(Error::Cancelled) => (
                RunState::Cancelled,
                EventKind::RunTerminal {
                    state: RunState::Cancelled,
                    result: None,
                    message: Some("run cancelled".into()),
                },
            ),
            Err(e) => {
                tracing::warn!(%run_id, error = %e, "run failed");
                (
                    RunState::Failed,
                    EventKind::RunTerminal {
                        state: RunState::Failed,
                        result: None,
                        message: Some(e.to_string()),
                    },
                )
            }
        };

        if let Err(e) = self.bus.append(run_id, terminal) {
            tracing::warn!(%run_id, error = %e, "failed to append terminal event");
        }
        if let Err(e) = self.store.set_run_state(run_id, state) {
            tracing::warn!(%run_id, error = %e, "failed to finalize run state");
        }
        self.cancels.remove(run_id);
        self.bus.cleanup(run_id);
    }
}
