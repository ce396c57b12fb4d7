//! Resource-bound run records: user-visible versioned runs and the
//! slide-extraction lifecycle row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Versioned runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionedRunStatus {
    Streaming,
    Completed,
    Failed,
}

impl VersionedRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "streaming" => Some(Self::Streaming),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A user-visible attempt at producing a resource's artifact. Versions are
/// monotone per resource; at most one row per resource is `streaming`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedRun {
    pub resource_id: String,
    pub version: u32,
    pub status: VersionedRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_json: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Slide-extraction lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Idle,
    InProgress,
    Completed,
    Failed,
}

impl ExtractionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row per video tracking slide-extraction progress. The `run_id`
/// column doubles as the claim slot for the two-phase start (a placeholder
/// id is CAS-written before the engine run exists).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlideExtraction {
    pub video_id: String,
    pub status: ExtractionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_slides: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_status_round_trip() {
        for status in [
            VersionedRunStatus::Streaming,
            VersionedRunStatus::Completed,
            VersionedRunStatus::Failed,
        ] {
            assert_eq!(VersionedRunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(VersionedRunStatus::parse("nope"), None);
    }

    #[test]
    fn extraction_status_round_trip() {
        for status in [
            ExtractionStatus::Idle,
            ExtractionStatus::InProgress,
            ExtractionStatus::Completed,
            ExtractionStatus::Failed,
        ] {
            assert_eq!(ExtractionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExtractionStatus::parse(""), None);
    }
}
