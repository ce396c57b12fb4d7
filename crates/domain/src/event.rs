//! The engine's run/event model.
//!
//! Every run owns an append-only event log. Events are typed variants with
//! a dense per-run index; the log is the single source of truth for replay,
//! memoization, and client streaming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A typed event within one run's log.
///
/// Invariants (enforced by the log writer):
/// - every `StepResult` is preceded by a matching `StepStarted`;
/// - at most one `RunTerminal` exists and it is the last event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    StepStarted {
        step_id: String,
        call_ordinal: u32,
        /// Only present on the synthetic `__start__` event.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args_digest: Option<String>,
    },
    StepResult {
        step_id: String,
        call_ordinal: u32,
        value: serde_json::Value,
        value_digest: String,
    },
    StepError {
        step_id: String,
        call_ordinal: u32,
        error_kind: String,
        message: String,
        retriable: bool,
    },
    Emit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
        payload: serde_json::Value,
    },
    RunTerminal {
        state: RunState,
        /// The workflow's return value, on `completed`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        /// The failure message, on `failed` / `cancelled`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl EventKind {
    /// The serde tag, also stored in the events table's `kind` column.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::StepStarted { .. } => "step_started",
            Self::StepResult { .. } => "step_result",
            Self::StepError { .. } => "step_error",
            Self::Emit { .. } => "emit",
            Self::RunTerminal { .. } => "run_terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunTerminal { .. })
    }

    pub fn is_emit(&self) -> bool {
        matches!(self, Self::Emit { .. })
    }

    /// The namespace label on an `Emit` event, if any.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Emit { namespace, .. } => namespace.as_deref(),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One ordered record within a run's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub index: u64,
    #[serde(flatten)]
    pub kind: EventKind,
    pub ts: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Digests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// SHA-256 hex digest of a JSON value's serialized form.
///
/// Used for `args_digest` on run start and `value_digest` on step results.
pub fn digest_value(value: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}
