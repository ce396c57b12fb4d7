//! Engine runs and their append-only event logs.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use vs_domain::{Error, EventKind, Result, RunEvent, RunState};

use crate::{db_err, parse_ts, Store};

/// One row of the `runs` table.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: Uuid,
    pub workflow: String,
    pub args: serde_json::Value,
    pub args_digest: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    let run_id: String = row.get(0)?;
    let args_json: String = row.get(2)?;
    let state: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(RunRow {
        run_id: Uuid::parse_str(&run_id).unwrap_or_default(),
        workflow: row.get(1)?,
        args: serde_json::from_str(&args_json).unwrap_or(serde_json::Value::Null),
        args_digest: row.get(3)?,
        state: RunState::parse(&state).unwrap_or(RunState::Failed),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

impl Store {
    // ── runs ─────────────────────────────────────────────────────────

    pub fn insert_run(
        &self,
        run_id: Uuid,
        workflow: &str,
        args: &serde_json::Value,
        args_digest: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with(|c| {
            c.execute(
                "INSERT INTO runs (run_id, workflow, args_json, args_digest, state, \
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    run_id.to_string(),
                    workflow,
                    args.to_string(),
                    args_digest,
                    RunState::Pending.as_str(),
                    now,
                ],
            )
        })?;
        Ok(())
    }

    pub fn run(&self, run_id: Uuid) -> Result<Option<RunRow>> {
        self.with(|c| {
            c.query_row(
                "SELECT run_id, workflow, args_json, args_digest, state, created_at, \
                 updated_at FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                row_to_run,
            )
            .optional()
        })
    }

    /// Move a run to a new state. Terminal states are immutable: the update
    /// is silently refused (returns false) once the run has ended.
    pub fn set_run_state(&self, run_id: Uuid, state: RunState) -> Result<bool> {
        let changed = self.with(|c| {
            c.execute(
                "UPDATE runs SET state = ?2, updated_at = ?3 WHERE run_id = ?1 \
                 AND state NOT IN ('completed', 'failed', 'cancelled')",
                params![run_id.to_string(), state.as_str(), Utc::now().to_rfc3339()],
            )
        })?;
        Ok(changed == 1)
    }

    /// All runs not yet in a terminal state, oldest first — the crash
    /// recovery work list.
    pub fn nonterminal_runs(&self) -> Result<Vec<RunRow>> {
        self.with(|c| {
            let mut stmt = c.prepare(
                "SELECT run_id, workflow, args_json, args_digest, state, created_at, \
                 updated_at FROM runs \
                 WHERE state NOT IN ('completed', 'failed', 'cancelled') \
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], row_to_run)?;
            rows.collect()
        })
    }

    // ── events ───────────────────────────────────────────────────────

    /// Append one event, assigning the next dense index atomically.
    ///
    /// The index is computed inside the INSERT itself and guarded by the
    /// `(run_id, idx)` primary key, so a retried append after a mid-write
    /// crash cannot create gaps or duplicates. Appending to a sealed log
    /// (one that already holds a `run_terminal`) fails.
    pub fn append_event(&self, run_id: Uuid, kind: &EventKind) -> Result<RunEvent> {
        let ts = Utc::now();
        let payload = serde_json::to_string(kind)?;
        let id = run_id.to_string();

        let idx = {
            let conn = self.conn.lock();

            let state: Option<String> = conn
                .query_row(
                    "SELECT state FROM runs WHERE run_id = ?1",
                    params![&id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            if state.is_none() {
                return Err(Error::NotFound(format!("run {run_id} does not exist")));
            }

            let sealed: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM events \
                     WHERE run_id = ?1 AND kind = 'run_terminal')",
                    params![&id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            if sealed {
                return Err(Error::Store(format!("run {run_id} log is sealed")));
            }

            conn.query_row(
                "INSERT INTO events (run_id, idx, kind, payload, ts) \
                 VALUES (?1, (SELECT COALESCE(MAX(idx) + 1, 0) FROM events \
                 WHERE run_id = ?1), ?2, ?3, ?4) RETURNING idx",
                params![&id, kind.tag(), payload, ts.to_rfc3339()],
                |row| row.get::<_, i64>(0),
            )
            .map_err(db_err)?
        };

        Ok(RunEvent {
            run_id,
            index: idx as u64,
            kind: kind.clone(),
            ts,
        })
    }

    /// Read events with `index >= start`, in order.
    pub fn events_from(&self, run_id: Uuid, start: u64) -> Result<Vec<RunEvent>> {
        self.with(|c| {
            let mut stmt = c.prepare(
                "SELECT idx, payload, ts FROM events \
                 WHERE run_id = ?1 AND idx >= ?2 ORDER BY idx ASC",
            )?;
            let rows = stmt.query_map(params![run_id.to_string(), start as i64], |row| {
                let idx: i64 = row.get(0)?;
                let payload: String = row.get(1)?;
                let ts: String = row.get(2)?;
                Ok((idx, payload, ts))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (idx, payload, ts) = row?;
                if let Ok(kind) = serde_json::from_str::<EventKind>(&payload) {
                    events.push(RunEvent {
                        run_id,
                        index: idx as u64,
                        kind,
                        ts: parse_ts(&ts),
                    });
                } else {
                    tracing::warn!(%run_id, idx, "skipping malformed event payload");
                }
            }
            Ok(events)
        })
    }

    /// The highest index written so far, if any.
    pub fn head_index(&self, run_id: Uuid) -> Result<Option<u64>> {
        self.with(|c| {
            c.query_row(
                "SELECT MAX(idx) FROM events WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get::<_, Option<i64>>(0),
            )
        })
        .map(|v| v.map(|idx| idx as u64))
    }

    /// The sealed log's terminal event, if the run has ended.
    pub fn terminal_event(&self, run_id: Uuid) -> Result<Option<RunEvent>> {
        let events = self.with(|c| {
            c.query_row(
                "SELECT idx, payload, ts FROM events \
                 WHERE run_id = ?1 AND kind = 'run_terminal'",
                params![run_id.to_string()],
                |row| {
                    let idx: i64 = row.get(0)?;
                    let payload: String = row.get(1)?;
                    let ts: String = row.get(2)?;
                    Ok((idx, payload, ts))
                },
            )
            .optional()
        })?;

        Ok(events.and_then(|(idx, payload, ts)| {
            serde_json::from_str::<EventKind>(&payload)
                .ok()
                .map(|kind| RunEvent {
                    run_id,
                    index: idx as u64,
                    kind,
                    ts: parse_ts(&ts),
                })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_run(store: &Store) -> Uuid {
        let run_id = Uuid::new_v4();
        store
            .insert_run(run_id, "fetch_transcript", &json!({"video_id": "x"}), "digest")
            .unwrap();
        run_id
    }

    fn emit(payload: serde_json::Value) -> EventKind {
        EventKind::Emit {
            namespace: None,
            payload,
        }
    }

    #[test]
    fn insert_and_fetch_run() {
        let store = Store::open_in_memory().unwrap();
        let run_id = new_run(&store);

        let row = store.run(run_id).unwrap().unwrap();
        assert_eq!(row.workflow, "fetch_transcript");
        assert_eq!(row.state, RunState::Pending);
        assert_eq!(row.args["video_id"], "x");
        assert!(store.run(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn state_transitions_stop_at_terminal() {
        let store = Store::open_in_memory().unwrap();
        let run_id = new_run(&store);

        assert!(store.set_run_state(run_id, RunState::Running).unwrap());
        assert!(store.set_run_state(run_id, RunState::Completed).unwrap());
        // Terminal states are immutable.
        assert!(!store.set_run_state(run_id, RunState::Running).unwrap());
        assert_eq!(
            store.run(run_id).unwrap().unwrap().state,
            RunState::Completed
        );
    }

    #[test]
    fn indices_are_dense_from_zero() {
        let store = Store::open_in_memory().unwrap();
        let run_id = new_run(&store);

        for i in 0..5 {
            let ev = store.append_event(run_id, &emit(json!({"n": i}))).unwrap();
            assert_eq!(ev.index, i);
        }

        let events = store.events_from(run_id, 0).unwrap();
        let indices: Vec<u64> = events.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(store.head_index(run_id).unwrap(), Some(4));
    }

    #[test]
    fn events_from_offset() {
        let store = Store::open_in_memory().unwrap();
        let run_id = new_run(&store);
        for i in 0..4 {
            store.append_event(run_id, &emit(json!({"n": i}))).unwrap();
        }

        let tail = store.events_from(run_id, 2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].index, 2);
    }

    #[test]
    fn append_requires_existing_run() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .append_event(Uuid::new_v4(), &emit(json!({})))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn terminal_seals_the_log() {
        let store = Store::open_in_memory().unwrap();
        let run_id = new_run(&store);

        store.append_event(run_id, &emit(json!({"n": 0}))).unwrap();
        store
            .append_event(
                run_id,
                &EventKind::RunTerminal {
                    state: RunState::Completed,
                    result: Some(json!({"ok": true})),
                    message: None,
                },
            )
            .unwrap();

        // Further appends fail; the terminal event is the last one.
        assert!(store.append_event(run_id, &emit(json!({"n": 1}))).is_err());
        let terminal = store.terminal_event(run_id).unwrap().unwrap();
        assert_eq!(terminal.index, 1);
        assert!(terminal.kind.is_terminal());
        assert_eq!(store.head_index(run_id).unwrap(), Some(1));
    }

    #[test]
    fn terminal_event_absent_while_live() {
        let store = Store::open_in_memory().unwrap();
        let run_id = new_run(&store);
        store.append_event(run_id, &emit(json!({}))).unwrap();
        assert!(store.terminal_event(run_id).unwrap().is_none());
    }

    #[test]
    fn logs_are_isolated_per_run() {
        let store = Store::open_in_memory().unwrap();
        let a = new_run(&store);
        let b = new_run(&store);

        store.append_event(a, &emit(json!({"run": "a"}))).unwrap();
        let ev = store.append_event(b, &emit(json!({"run": "b"}))).unwrap();
        // Each run's indices start at 0 independently.
        assert_eq!(ev.index, 0);
        assert_eq!(store.events_from(a, 0).unwrap().len(), 1);
    }

    #[test]
    fn nonterminal_runs_lists_recovery_candidates() {
        let store = Store::open_in_memory().unwrap();
        let live = new_run(&store);
        let done = new_run(&store);
        store.set_run_state(done, RunState::Completed).unwrap();

        let pending: Vec<Uuid> = store
            .nonterminal_runs()
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert!(pending.contains(&live));
        assert!(!pending.contains(&done));
    }

    #[test]
    fn step_events_round_trip_through_storage() {
        let store = Store::open_in_memory().unwrap();
        let run_id = new_run(&store);

        store
            .append_event(
                run_id,
                &EventKind::StepStarted {
                    step_id: "persist".into(),
                    call_ordinal: 0,
                    args_digest: None,
                },
            )
            .unwrap();
        store
            .append_event(
                run_id,
                &EventKind::StepResult {
                    step_id: "persist".into(),
                    call_ordinal: 0,
                    value: json!({"rows": 2}),
                    value_digest: "d".into(),
                },
            )
            .unwrap();

        let events = store.events_from(run_id, 0).unwrap();
        match &events[1].kind {
            EventKind::StepResult { step_id, value, .. } => {
                assert_eq!(step_id, "persist");
                assert_eq!(value["rows"], 2);
            }
            other => panic!("expected step_result, got {other:?}"),
        }
    }
}
