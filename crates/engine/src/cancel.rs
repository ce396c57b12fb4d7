//! Cooperative per-run cancellation.
//!
//! Each live run gets a `CancelToken` registered under its run id. The step
//! executor checks the token before every step body; steps already in
//! flight are never interrupted, so the terminal event becomes `cancelled`
//! once the current step returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

/// A cancellation flag checked between steps.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Tokens for all live runs, keyed by run id.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<Uuid, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a fresh token for a run.
    pub fn register(&self, run_id: Uuid) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(run_id, token.clone());
        token
    }

    /// Request cancellation. Returns false when the run is not live.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.tokens.lock().get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the token once a run reaches a terminal state.
    pub fn remove(&self, run_id: Uuid) {
        self.tokens.lock().remove(&run_id);
    }

    pub fn is_live(&self, run_id: Uuid) -> bool {
        self.tokens.lock().contains_key(&run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn map_register_cancel_remove() {
        let map = CancelMap::new();
        let run_id = Uuid::new_v4();

        let token = map.register(run_id);
        assert!(map.is_live(run_id));
        assert!(map.cancel(run_id));
        assert!(token.is_cancelled());

        map.remove(run_id);
        assert!(!map.is_live(run_id));
        assert!(!map.cancel(run_id));
    }

    #[test]
    fn cancel_unknown_run_is_false() {
        let map = CancelMap::new();
        assert!(!map.cancel(Uuid::new_v4()));
    }

    #[test]
    fn remove_is_idempotent() {
        let map = CancelMap::new();
        let run_id = Uuid::new_v4();
        map.register(run_id);
        map.remove(run_id);
        map.remove(run_id);
        assert!(!map.is_live(run_id));
    }
}
