//! User-visible versioned runs.
//!
//! Each dispatch for a resource gets `version = max(version) + 1`; the
//! partial unique index on `(resource_id) WHERE status='streaming'` is the
//! race arbiter — the losing starter gets [`ClaimOutcome::AlreadyStreaming`]
//! and attaches to the winner's engine run instead.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use vs_domain::resource::{VersionedRun, VersionedRunStatus};
use vs_domain::{Error, Result};

use crate::{db_err, is_unique_violation, parse_ts, Store};

/// Result of trying to open a new streaming version for a resource.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// This caller owns the new version and must start the engine run.
    Claimed(VersionedRun),
    /// Another version is already streaming; attach to its run.
    AlreadyStreaming(VersionedRun),
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionedRun> {
    let status: String = row.get(2)?;
    let run_id: Option<String> = row.get(3)?;
    let result_json: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(VersionedRun {
        resource_id: row.get(0)?,
        version: row.get::<_, i64>(1)? as u32,
        status: VersionedRunStatus::parse(&status).unwrap_or(VersionedRunStatus::Failed),
        workflow_run_id: run_id.and_then(|s| Uuid::parse_str(&s).ok()),
        additional_instructions: row.get(4)?,
        result_json: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

const VERSION_COLUMNS: &str = "resource_id, version, status, workflow_run_id, \
                               additional_instructions, result_json, created_at, updated_at";

impl Store {
    /// Open a new streaming version for `resource_id`, or report the one
    /// already streaming.
    pub fn claim_streaming_version(
        &self,
        resource_id: &str,
        additional_instructions: Option<&str>,
    ) -> Result<ClaimOutcome> {
        let now = Utc::now().to_rfc3339();
        let inserted = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!(
                    "INSERT INTO versioned_runs (resource_id, version, status, \
                     additional_instructions, created_at, updated_at) \
                     VALUES (?1, (SELECT COALESCE(MAX(version) + 1, 1) \
                     FROM versioned_runs WHERE resource_id = ?1), 'streaming', ?2, ?3, ?3) \
                     RETURNING {VERSION_COLUMNS}"
                ),
                params![resource_id, additional_instructions, now],
                row_to_version,
            )
        };

        match inserted {
            Ok(version) => Ok(ClaimOutcome::Claimed(version)),
            Err(e) if is_unique_violation(&e) => {
                let existing = self.streaming_version(resource_id)?.ok_or_else(|| {
                    Error::Store("streaming claim lost but no streaming row found".into())
                })?;
                Ok(ClaimOutcome::AlreadyStreaming(existing))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    pub fn set_version_run_id(
        &self,
        resource_id: &str,
        version: u32,
        run_id: Uuid,
    ) -> Result<()> {
        self.with(|c| {
            c.execute(
                "UPDATE versioned_runs SET workflow_run_id = ?3, updated_at = ?4 \
                 WHERE resource_id = ?1 AND version = ?2",
                params![
                    resource_id,
                    version as i64,
                    run_id.to_string(),
                    Utc::now().to_rfc3339()
                ],
            )
        })?;
        Ok(())
    }

    /// Store the result and mark the version completed — the two always
    /// move together (a streaming row with a result is a detectable
    /// anomaly, see [`Store::heal_streaming_with_result`]).
    pub fn complete_version(
        &self,
        resource_id: &str,
        version: u32,
        result: &serde_json::Value,
    ) -> Result<()> {
        self.with(|c| {
            c.execute(
                "UPDATE versioned_runs SET status = 'completed', result_json = ?3, \
                 updated_at = ?4 WHERE resource_id = ?1 AND version = ?2",
                params![
                    resource_id,
                    version as i64,
                    result.to_string(),
                    Utc::now().to_rfc3339()
                ],
            )
        })?;
        Ok(())
    }

    /// Mark a version failed. Completed rows are left alone, so a late
    /// failure signal cannot clobber a stored result.
    pub fn fail_version(&self, resource_id: &str, version: u32) -> Result<()> {
        self.with(|c| {
            c.execute(
                "UPDATE versioned_runs SET status = 'failed', updated_at = ?3 \
                 WHERE resource_id = ?1 AND version = ?2 AND status != 'completed'",
                params![resource_id, version as i64, Utc::now().to_rfc3339()],
            )
        })?;
        Ok(())
    }

    pub fn streaming_version(&self, resource_id: &str) -> Result<Option<VersionedRun>> {
        self.with(|c| {
            c.query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versioned_runs \
                     WHERE resource_id = ?1 AND status = 'streaming'"
                ),
                params![resource_id],
                row_to_version,
            )
            .optional()
        })
    }

    pub fn version(&self, resource_id: &str, version: u32) -> Result<Option<VersionedRun>> {
        self.with(|c| {
            c.query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versioned_runs \
                     WHERE resource_id = ?1 AND version = ?2"
                ),
                params![resource_id, version as i64],
                row_to_version,
            )
            .optional()
        })
    }

    /// The newest completed result for a resource, if any — the cached
    /// artifact served without starting a run.
    pub fn latest_completed_result(&self, resource_id: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = self.with(|c| {
            c.query_row(
                "SELECT result_json FROM versioned_runs \
                 WHERE resource_id = ?1 AND status = 'completed' \
                 AND result_json IS NOT NULL ORDER BY version DESC LIMIT 1",
                params![resource_id],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    /// All versions for a resource, newest first.
    pub fn versions(&self, resource_id: &str) -> Result<Vec<VersionedRun>> {
        self.with(|c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {VERSION_COLUMNS} FROM versioned_runs \
                 WHERE resource_id = ?1 ORDER BY version DESC"
            ))?;
            let rows = stmt.query_map(params![resource_id], row_to_version)?;
            rows.collect()
        })
    }

    /// Normalize the "streaming with result" anomaly: once a result is
    /// stored the row must be completed. Returns how many rows were healed.
    pub fn heal_streaming_with_result(&self, resource_id: &str) -> Result<usize> {
        self.with(|c| {
            c.execute(
                "UPDATE versioned_runs SET status = 'completed', updated_at = ?2 \
                 WHERE resource_id = ?1 AND status = 'streaming' \
                 AND result_json IS NOT NULL",
                params![resource_id, Utc::now().to_rfc3339()],
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claim(store: &Store, resource: &str) -> VersionedRun {
        match store.claim_streaming_version(resource, None).unwrap() {
            ClaimOutcome::Claimed(v) => v,
            ClaimOutcome::AlreadyStreaming(v) => panic!("unexpected streaming row {v:?}"),
        }
    }

    #[test]
    fn versions_start_at_one_and_increase_without_gaps() {
        let store = Store::open_in_memory().unwrap();

        for expected in 1..=3u32 {
            let v = claim(&store, "vid");
            assert_eq!(v.version, expected);
            assert_eq!(v.status, VersionedRunStatus::Streaming);
            store.fail_version("vid", v.version).unwrap();
        }

        let listed: Vec<u32> = store
            .versions("vid")
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(listed, vec![3, 2, 1], "newest first, dense");
    }

    #[test]
    fn only_one_streaming_version_per_resource() {
        let store = Store::open_in_memory().unwrap();
        let first = claim(&store, "vid");

        match store.claim_streaming_version("vid", None).unwrap() {
            ClaimOutcome::AlreadyStreaming(existing) => {
                assert_eq!(existing.version, first.version);
            }
            ClaimOutcome::Claimed(v) => panic!("second claim must not win, got {v:?}"),
        }

        // Other resources are unaffected.
        claim(&store, "other_video");
    }

    #[test]
    fn completing_stores_result_and_status_together() {
        let store = Store::open_in_memory().unwrap();
        let v = claim(&store, "vid");

        store
            .complete_version("vid", v.version, &json!({"tldr": "short"}))
            .unwrap();

        let row = store.version("vid", v.version).unwrap().unwrap();
        assert_eq!(row.status, VersionedRunStatus::Completed);
        assert_eq!(row.result_json.unwrap()["tldr"], "short");

        let cached = store.latest_completed_result("vid").unwrap().unwrap();
        assert_eq!(cached["tldr"], "short");
    }

    #[test]
    fn latest_completed_result_prefers_newest_version() {
        let store = Store::open_in_memory().unwrap();
        let v1 = claim(&store, "vid");
        store.complete_version("vid", v1.version, &json!({"v": 1})).unwrap();
        let v2 = claim(&store, "vid");
        store.complete_version("vid", v2.version, &json!({"v": 2})).unwrap();

        let cached = store.latest_completed_result("vid").unwrap().unwrap();
        assert_eq!(cached["v"], 2);
    }

    #[test]
    fn failed_versions_keep_their_number() {
        let store = Store::open_in_memory().unwrap();
        let v = claim(&store, "vid");
        store.fail_version("vid", v.version).unwrap();

        let listed = store.versions("vid").unwrap();
        assert_eq!(listed[0].version, v.version);
        assert_eq!(listed[0].status, VersionedRunStatus::Failed);
        assert!(store.latest_completed_result("vid").unwrap().is_none());
    }

    #[test]
    fn run_id_writeback() {
        let store = Store::open_in_memory().unwrap();
        let v = claim(&store, "vid");
        let run_id = Uuid::new_v4();

        store.set_version_run_id("vid", v.version, run_id).unwrap();
        let row = store.streaming_version("vid").unwrap().unwrap();
        assert_eq!(row.workflow_run_id, Some(run_id));
    }

    #[test]
    fn additional_instructions_are_kept() {
        let store = Store::open_in_memory().unwrap();
        let outcome = store
            .claim_streaming_version("vid", Some("focus on the demo"))
            .unwrap();
        let ClaimOutcome::Claimed(v) = outcome else {
            panic!("expected claim");
        };
        assert_eq!(v.additional_instructions.as_deref(), Some("focus on the demo"));
    }

    #[test]
    fn heals_streaming_with_result() {
        let store = Store::open_in_memory().unwrap();
        let v = claim(&store, "vid");

        // Force the anomalous state: result present but status untouched.
        store
            .with(|c| {
                c.execute(
                    "UPDATE versioned_runs SET result_json = ?1 \
                     WHERE resource_id = 'vid' AND version = ?2",
                    params![json!({"x": 1}).to_string(), v.version as i64],
                )
            })
            .unwrap();

        assert_eq!(store.heal_streaming_with_result("vid").unwrap(), 1);
        let row = store.version("vid", v.version).unwrap().unwrap();
        assert_eq!(row.status, VersionedRunStatus::Completed);

        // Healing is idempotent.
        assert_eq!(store.heal_streaming_with_result("vid").unwrap(), 0);
    }
}
