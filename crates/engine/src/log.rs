//! Event log & stream bus.
//!
//! Appends go through the store (atomic dense index assignment) and are
//! then fanned out on a per-run `tokio::sync::broadcast` channel. Readers
//! subscribe first, page history from the store, then switch to live
//! delivery — deduplicating by index across the boundary and refilling
//! from the store whenever the broadcast channel lags or closes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use vs_domain::stream::BoxStream;
use vs_domain::{EventKind, Result, RunEvent};
use vs_store::Store;

/// Per-run broadcast capacity; a lagging reader falls back to the store.
const CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    store: Arc<Store>,
    channels: RwLock<HashMap<Uuid, broadcast::Sender<RunEvent>>>,
}

impl EventBus {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Append one event to a run's log and notify live readers.
    ///
    /// The runtime guarantees a single logical writer per run; parallel
    /// step branches within that run serialize on the store's connection.
    pub fn append(&self, run_id: Uuid, kind: EventKind) -> Result<RunEvent> {
        let event = self.store.append_event(run_id, &kind)?;
        if let Some(tx) = self.channels.read().get(&run_id) {
            let _ = tx.send(event.clone());
        }
        Ok(event)
    }

    /// Subscribe to live events, creating the channel if needed.
    ///
    /// Must be called *before* paging history so no event can fall between
    /// the history read and the live tail.
    pub fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<RunEvent> {
        let mut channels = self.channels.write();
        channels
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop a finished run's channel. Attached readers observe the close
    /// and drain the remainder from the store.
    pub fn cleanup(&self, run_id: Uuid) {
        self.channels.write().remove(&run_id);
    }

    /// A replayable reader over one run's log.
    ///
    /// Yields historical events first (from `start`), then live ones,
    /// without duplicates or gaps. Ends after the terminal event, or after
    /// draining a sealed log. `namespace` filters `emit` events to the
    /// given label; control events are always delivered.
    pub fn read(
        &self,
        run_id: Uuid,
        start: u64,
        namespace: Option<String>,
    ) -> BoxStream<'static, RunEvent> {
        let store = self.store.clone();
        let mut rx = self.subscribe(run_id);

        Box::pin(async_stream::stream! {
            let wants = move |ev: &RunEvent| -> bool {
                match (&namespace, ev.kind.namespace()) {
                    (Some(ns), Some(label)) => ns == label,
                    (Some(_), None) => !ev.kind.is_emit(),
                    (None, _) => true,
                }
            };

            let mut next = start;

            // History.
            for ev in store.events_from(run_id, next).unwrap_or_default() {
                next = ev.index + 1;
                let terminal = ev.kind.is_terminal();
                if wants(&ev) {
                    yield ev;
                }
                if terminal {
                    return;
                }
            }

            // A sealed log has nothing more to produce, even when `start`
            // pointed past its head.
            if store
                .terminal_event(run_id)
                .ok()
                .flatten()
                .is_some_and(|t| t.index < next)
            {
                return;
            }

            // Live tail.
            loop {
                let batch = match rx.recv().await {
                    Ok(ev) if ev.index < next => continue,
                    Ok(ev) if ev.index == next => vec![ev],
                    // Gap (or lag): refill from the store.
                    Ok(_) => store.events_from(run_id, next).unwrap_or_default(),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        store.events_from(run_id, next).unwrap_or_default()
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Producer gone; drain whatever is persisted and end.
                        for ev in store.events_from(run_id, next).unwrap_or_default() {
                            if wants(&ev) {
                                yield ev;
                            }
                        }
                        return;
                    }
                };

                for ev in batch {
                    if ev.index < next {
                        continue;
                    }
                    next = ev.index + 1;
                    let terminal = ev.kind.is_terminal();
                    if wants(&ev) {
                        yield ev;
                    }
                    if terminal {
                        return;
                    }
                }
            }
        })
    }
}
