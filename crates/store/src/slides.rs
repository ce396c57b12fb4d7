//! Slide-extraction lifecycle, slide rows, feedback, and analyses.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use vs_domain::resource::{ExtractionStatus, SlideExtraction};
use vs_domain::slides::{
    FramePosition, Slide, SlideAnalysisResult, SlideFeedback, SlideFrame,
};
use vs_domain::Result;

use crate::{parse_ts, Store};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Extraction lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn row_to_extraction(row: &rusqlite::Row<'_>) -> rusqlite::Result<SlideExtraction> {
    let status: String = row.get(1)?;
    let total: Option<i64> = row.get(3)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(SlideExtraction {
        video_id: row.get(0)?,
        status: ExtractionStatus::parse(&status).unwrap_or(ExtractionStatus::Failed),
        run_id: row.get(2)?,
        total_slides: total.map(|t| t as u32),
        error_message: row.get(4)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

impl Store {
    pub fn slide_extraction(&self, video_id: &str) -> Result<Option<SlideExtraction>> {
        self.with(|c| {
            c.query_row(
                "SELECT video_id, status, run_id, total_slides, error_message, \
                 created_at, updated_at FROM slide_extraction WHERE video_id = ?1",
                params![video_id],
                row_to_extraction,
            )
            .optional()
        })
    }

    /// Phase (a) of the extraction claim: move the row to `in_progress`
    /// with a cleared `run_id` slot, unless an extraction is already in
    /// flight or completed. Returns the row afterwards.
    pub fn begin_extraction(&self, video_id: &str) -> Result<SlideExtraction> {
        let now = Utc::now().to_rfc3339();
        self.with(|c| {
            c.execute(
                "INSERT INTO slide_extraction (video_id, status, run_id, created_at, \
                 updated_at) VALUES (?1, 'in_progress', NULL, ?2, ?2) \
                 ON CONFLICT (video_id) DO UPDATE SET status = 'in_progress', \
                 run_id = NULL, error_message = NULL, updated_at = ?2 \
                 WHERE slide_extraction.status IN ('idle', 'failed')",
                params![video_id, now],
            )
        })?;
        self.slide_extraction(video_id)?
            .ok_or_else(|| vs_domain::Error::Store("extraction row vanished after upsert".into()))
    }

    /// Phase (b) of the extraction claim: CAS `run_id` from NULL to the
    /// caller's placeholder. Exactly one concurrent starter wins.
    pub fn claim_extraction_run(&self, video_id: &str, placeholder: &str) -> Result<bool> {
        let changed = self.with(|c| {
            c.execute(
                "UPDATE slide_extraction SET run_id = ?2, updated_at = ?3 \
                 WHERE video_id = ?1 AND run_id IS NULL",
                params![video_id, placeholder, Utc::now().to_rfc3339()],
            )
        })?;
        Ok(changed == 1)
    }

    /// Swap the winner's placeholder for the real engine run id.
    pub fn replace_extraction_run_id(
        &self,
        video_id: &str,
        placeholder: &str,
        run_id: &str,
    ) -> Result<bool> {
        let changed = self.with(|c| {
            c.execute(
                "UPDATE slide_extraction SET run_id = ?3, updated_at = ?4 \
                 WHERE video_id = ?1 AND run_id = ?2",
                params![video_id, placeholder, run_id, Utc::now().to_rfc3339()],
            )
        })?;
        Ok(changed == 1)
    }

    pub fn set_extraction_completed(&self, video_id: &str, total_slides: u32) -> Result<()> {
        self.with(|c| {
            c.execute(
                "UPDATE slide_extraction SET status = 'completed', total_slides = ?2, \
                 error_message = NULL, updated_at = ?3 WHERE video_id = ?1",
                params![video_id, total_slides as i64, Utc::now().to_rfc3339()],
            )
        })?;
        Ok(())
    }

    pub fn set_extraction_failed(&self, video_id: &str, message: &str) -> Result<()> {
        self.with(|c| {
            c.execute(
                "UPDATE slide_extraction SET status = 'failed', error_message = ?2, \
                 updated_at = ?3 WHERE video_id = ?1",
                params![video_id, message, Utc::now().to_rfc3339()],
            )
        })?;
        Ok(())
    }

    /// Extractions sitting `in_progress` since before `cutoff` — candidates
    /// for the timeout anomaly repair.
    pub fn stale_extractions(&self, cutoff: DateTime<Utc>) -> Result<Vec<SlideExtraction>> {
        self.with(|c| {
            let mut stmt = c.prepare(
                "SELECT video_id, status, run_id, total_slides, error_message, \
                 created_at, updated_at FROM slide_extraction \
                 WHERE status = 'in_progress' AND updated_at < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff.to_rfc3339()], row_to_extraction)?;
            rows.collect()
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Slides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn row_to_slide(row: &rusqlite::Row<'_>) -> rusqlite::Result<Slide> {
    fn frame(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<SlideFrame> {
        let dup_of_slide: Option<i64> = row.get(base + 3)?;
        let dup_of_frame: Option<String> = row.get(base + 4)?;
        Ok(SlideFrame {
            image_url: row.get(base)?,
            source_uri: row.get(base + 1)?,
            has_text: row.get(base + 2)?,
            duplicate_of_slide: dup_of_slide.map(|n| n as u32),
            duplicate_of_frame: dup_of_frame.as_deref().and_then(FramePosition::parse),
            error: row.get(base + 5)?,
        })
    }

    Ok(Slide {
        video_id: row.get(0)?,
        slide_number: row.get::<_, i64>(1)? as u32,
        start_seconds: row.get(2)?,
        end_seconds: row.get(3)?,
        first: frame(row, 4)?,
        last: frame(row, 10)?,
    })
}

const SLIDE_COLUMNS: &str = "video_id, slide_number, start_seconds, end_seconds, \
    first_image_url, first_source_uri, first_has_text, first_dup_of_slide, \
    first_dup_of_frame, first_error, \
    last_image_url, last_source_uri, last_has_text, last_dup_of_slide, \
    last_dup_of_frame, last_error";

impl Store {
    /// Insert a slide row; an existing row wins (conflict is a no-op), so
    /// replayed `process_slides` steps are idempotent. Returns whether a
    /// row was actually written.
    pub fn insert_slide(&self, slide: &Slide) -> Result<bool> {
        slide.check_duplicate_refs()?;
        let changed = self.with(|c| {
            c.execute(
                "INSERT INTO slides (video_id, slide_number, start_seconds, end_seconds, \
                 first_image_url, first_source_uri, first_has_text, first_dup_of_slide, \
                 first_dup_of_frame, first_error, last_image_url, last_source_uri, \
                 last_has_text, last_dup_of_slide, last_dup_of_frame, last_error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
                 ?15, ?16) ON CONFLICT (video_id, slide_number) DO NOTHING",
                params![
                    slide.video_id,
                    slide.slide_number as i64,
                    slide.start_seconds,
                    slide.end_seconds,
                    slide.first.image_url,
                    slide.first.source_uri,
                    slide.first.has_text,
                    slide.first.duplicate_of_slide.map(|n| n as i64),
                    slide.first.duplicate_of_frame.map(|p| p.as_str()),
                    slide.first.error,
                    slide.last.image_url,
                    slide.last.source_uri,
                    slide.last.has_text,
                    slide.last.duplicate_of_slide.map(|n| n as i64),
                    slide.last.duplicate_of_frame.map(|p| p.as_str()),
                    slide.last.error,
                ],
            )
        })?;
        Ok(changed == 1)
    }

    pub fn slide(&self, video_id: &str, slide_number: u32) -> Result<Option<Slide>> {
        self.with(|c| {
            c.query_row(
                &format!(
                    "SELECT {SLIDE_COLUMNS} FROM slides \
                     WHERE video_id = ?1 AND slide_number = ?2"
                ),
                params![video_id, slide_number as i64],
                row_to_slide,
            )
            .optional()
        })
    }

    pub fn slides(&self, video_id: &str) -> Result<Vec<Slide>> {
        self.with(|c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {SLIDE_COLUMNS} FROM slides WHERE video_id = ?1 \
                 ORDER BY slide_number ASC"
            ))?;
            let rows = stmt.query_map(params![video_id], row_to_slide)?;
            rows.collect()
        })
    }

    pub fn slide_count(&self, video_id: &str) -> Result<u32> {
        let count: i64 = self.with(|c| {
            c.query_row(
                "SELECT COUNT(*) FROM slides WHERE video_id = ?1",
                params![video_id],
                |row| row.get(0),
            )
        })?;
        Ok(count as u32)
    }

    // ── feedback ─────────────────────────────────────────────────────

    pub fn set_slide_feedback(&self, video_id: &str, feedback: &SlideFeedback) -> Result<()> {
        self.with(|c| {
            c.execute(
                "INSERT INTO slide_feedback (video_id, slide_number, is_first_picked, \
                 is_last_picked) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (video_id, slide_number) DO UPDATE SET \
                 is_first_picked = ?3, is_last_picked = ?4",
                params![
                    video_id,
                    feedback.slide_number as i64,
                    feedback.is_first_frame_picked,
                    feedback.is_last_frame_picked,
                ],
            )
        })?;
        Ok(())
    }

    pub fn slide_feedback(&self, video_id: &str) -> Result<Vec<SlideFeedback>> {
        self.with(|c| {
            let mut stmt = c.prepare(
                "SELECT slide_number, is_first_picked, is_last_picked \
                 FROM slide_feedback WHERE video_id = ?1 ORDER BY slide_number ASC",
            )?;
            let rows = stmt.query_map(params![video_id], |row| {
                Ok(SlideFeedback {
                    slide_number: row.get::<_, i64>(0)? as u32,
                    is_first_frame_picked: row.get(1)?,
                    is_last_frame_picked: row.get(2)?,
                })
            })?;
            rows.collect()
        })
    }

    // ── per-slide analyses ───────────────────────────────────────────

    pub fn upsert_slide_analysis(
        &self,
        video_id: &str,
        slide_number: u32,
        position: FramePosition,
        markdown: &str,
    ) -> Result<()> {
        self.with(|c| {
            c.execute(
                "INSERT INTO slide_analysis_results (video_id, slide_number, \
                 frame_position, markdown, created_at) VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (video_id, slide_number, frame_position) \
                 DO UPDATE SET markdown = ?4",
                params![
                    video_id,
                    slide_number as i64,
                    position.as_str(),
                    markdown,
                    Utc::now().to_rfc3339(),
                ],
            )
        })?;
        Ok(())
    }

    pub fn slide_analysis(
        &self,
        video_id: &str,
        slide_number: u32,
        position: FramePosition,
    ) -> Result<Option<SlideAnalysisResult>> {
        self.with(|c| {
            c.query_row(
                "SELECT slide_number, frame_position, markdown, created_at \
                 FROM slide_analysis_results \
                 WHERE video_id = ?1 AND slide_number = ?2 AND frame_position = ?3",
                params![video_id, slide_number as i64, position.as_str()],
                row_to_analysis,
            )
            .optional()
        })
    }

    pub fn slide_analyses(&self, video_id: &str) -> Result<Vec<SlideAnalysisResult>> {
        self.with(|c| {
            let mut stmt = c.prepare(
                "SELECT slide_number, frame_position, markdown, created_at \
                 FROM slide_analysis_results WHERE video_id = ?1 \
                 ORDER BY slide_number ASC, frame_position ASC",
            )?;
            let rows = stmt.query_map(params![video_id], row_to_analysis)?;
            rows.collect()
        })
    }

    // ── super-analyses ───────────────────────────────────────────────

    pub fn set_super_analysis(&self, video_id: &str, markdown: &str) -> Result<()> {
        self.with(|c| {
            c.execute(
                "INSERT INTO super_analyses (video_id, markdown, created_at) \
                 VALUES (?1, ?2, ?3) ON CONFLICT (video_id) DO UPDATE SET markdown = ?2",
                params![video_id, markdown, Utc::now().to_rfc3339()],
            )
        })?;
        Ok(())
    }

    pub fn super_analysis(&self, video_id: &str) -> Result<Option<String>> {
        self.with(|c| {
            c.query_row(
                "SELECT markdown FROM super_analyses WHERE video_id = ?1",
                params![video_id],
                |row| row.get(0),
            )
            .optional()
        })
    }
}

fn row_to_analysis(row: &rusqlite::Row<'_>) -> rusqlite::Result<SlideAnalysisResult> {
    let position: String = row.get(1)?;
    let created_at: String = row.get(3)?;
    Ok(SlideAnalysisResult {
        slide_number: row.get::<_, i64>(0)? as u32,
        frame_position: FramePosition::parse(&position).unwrap_or(FramePosition::First),
        markdown: row.get(2)?,
        created_at: parse_ts(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slide(video_id: &str, n: u32) -> Slide {
        Slide {
            video_id: video_id.into(),
            slide_number: n,
            start_seconds: Some(n as f64 * 10.0),
            end_seconds: Some(n as f64 * 10.0 + 8.0),
            first: SlideFrame {
                image_url: Some(format!("https://blob.example/slides/{video_id}/{n}-first.webp")),
                source_uri: Some(format!("os://frames/{n}-first")),
                has_text: true,
                ..Default::default()
            },
            last: SlideFrame {
                image_url: Some(format!("https://blob.example/slides/{video_id}/{n}-last.webp")),
                source_uri: Some(format!("os://frames/{n}-last")),
                has_text: false,
                ..Default::default()
            },
        }
    }

    // ── extraction lifecycle ───────────────────────────────────────

    #[test]
    fn begin_extraction_creates_in_progress_row() {
        let store = Store::open_in_memory().unwrap();
        let row = store.begin_extraction("vid").unwrap();
        assert_eq!(row.status, ExtractionStatus::InProgress);
        assert!(row.run_id.is_none());
    }

    #[test]
    fn begin_extraction_restarts_failed_but_not_completed() {
        let store = Store::open_in_memory().unwrap();
        store.begin_extraction("vid").unwrap();
        store.set_extraction_failed("vid", "boom").unwrap();

        let row = store.begin_extraction("vid").unwrap();
        assert_eq!(row.status, ExtractionStatus::InProgress);
        assert!(row.error_message.is_none());

        store.set_extraction_completed("vid", 4).unwrap();
        let row = store.begin_extraction("vid").unwrap();
        assert_eq!(row.status, ExtractionStatus::Completed, "completed rows stay");
    }

    #[test]
    fn claim_is_first_writer_wins() {
        let store = Store::open_in_memory().unwrap();
        store.begin_extraction("vid").unwrap();

        assert!(store.claim_extraction_run("vid", "claim-a").unwrap());
        assert!(!store.claim_extraction_run("vid", "claim-b").unwrap());

        let row = store.slide_extraction("vid").unwrap().unwrap();
        assert_eq!(row.run_id.as_deref(), Some("claim-a"));
    }

    #[test]
    fn placeholder_swap_requires_matching_claim() {
        let store = Store::open_in_memory().unwrap();
        store.begin_extraction("vid").unwrap();
        store.claim_extraction_run("vid", "claim-a").unwrap();

        assert!(!store
            .replace_extraction_run_id("vid", "claim-b", "real-run")
            .unwrap());
        assert!(store
            .replace_extraction_run_id("vid", "claim-a", "real-run")
            .unwrap());

        let row = store.slide_extraction("vid").unwrap().unwrap();
        assert_eq!(row.run_id.as_deref(), Some("real-run"));
    }

    #[test]
    fn completion_clears_error_and_sets_total() {
        let store = Store::open_in_memory().unwrap();
        store.begin_extraction("vid").unwrap();
        store.set_extraction_failed("vid", "transient").unwrap();
        store.begin_extraction("vid").unwrap();
        store.set_extraction_completed("vid", 12).unwrap();

        let row = store.slide_extraction("vid").unwrap().unwrap();
        assert_eq!(row.status, ExtractionStatus::Completed);
        assert_eq!(row.total_slides, Some(12));
        assert!(row.error_message.is_none());
    }

    #[test]
    fn stale_extractions_filter_by_cutoff() {
        let store = Store::open_in_memory().unwrap();
        store.begin_extraction("vid").unwrap();

        // Everything is newer than a cutoff in the past.
        let past = Utc::now() - chrono::Duration::minutes(30);
        assert!(store.stale_extractions(past).unwrap().is_empty());

        // A future cutoff catches the in-progress row.
        let future = Utc::now() + chrono::Duration::minutes(1);
        let stale = store.stale_extractions(future).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].video_id, "vid");
    }

    // ── slides ─────────────────────────────────────────────────────

    #[test]
    fn insert_slide_conflict_is_noop() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.insert_slide(&slide("vid", 1)).unwrap());

        let mut replay = slide("vid", 1);
        replay.first.image_url = Some("https://other.example/x.webp".into());
        assert!(!store.insert_slide(&replay).unwrap());

        // The original row wins.
        let stored = store.slide("vid", 1).unwrap().unwrap();
        assert_eq!(
            stored.first.image_url.as_deref(),
            Some("https://blob.example/slides/vid/1-first.webp")
        );
    }

    #[test]
    fn insert_slide_rejects_forward_duplicate_refs() {
        let store = Store::open_in_memory().unwrap();
        let mut bad = slide("vid", 2);
        bad.first.duplicate_of_slide = Some(7);
        assert!(store.insert_slide(&bad).is_err());
    }

    #[test]
    fn slides_ordered_and_counted() {
        let store = Store::open_in_memory().unwrap();
        for n in [3, 1, 2] {
            store.insert_slide(&slide("vid", n)).unwrap();
        }
        let all = store.slides("vid").unwrap();
        let numbers: Vec<u32> = all.iter().map(|s| s.slide_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(store.slide_count("vid").unwrap(), 3);
        assert_eq!(store.slide_count("other").unwrap(), 0);
    }

    #[test]
    fn slide_round_trips_frame_metadata() {
        let store = Store::open_in_memory().unwrap();
        let mut s = slide("vid", 4);
        s.last.duplicate_of_slide = Some(2);
        s.last.duplicate_of_frame = Some(FramePosition::First);
        s.last.error = Some("upload failed: 503".into());
        store.insert_slide(&s).unwrap();

        let stored = store.slide("vid", 4).unwrap().unwrap();
        assert_eq!(stored.last.duplicate_of_slide, Some(2));
        assert_eq!(stored.last.duplicate_of_frame, Some(FramePosition::First));
        assert_eq!(stored.last.error.as_deref(), Some("upload failed: 503"));
        assert!(stored.first.has_text);
    }

    // ── feedback & analyses ────────────────────────────────────────

    #[test]
    fn feedback_upserts() {
        let store = Store::open_in_memory().unwrap();
        store
            .set_slide_feedback(
                "vid",
                &SlideFeedback {
                    slide_number: 1,
                    is_first_frame_picked: true,
                    is_last_frame_picked: false,
                },
            )
            .unwrap();
        store
            .set_slide_feedback(
                "vid",
                &SlideFeedback {
                    slide_number: 1,
                    is_first_frame_picked: false,
                    is_last_frame_picked: true,
                },
            )
            .unwrap();

        let feedback = store.slide_feedback("vid").unwrap();
        assert_eq!(feedback.len(), 1);
        assert!(!feedback[0].is_first_frame_picked);
        assert!(feedback[0].is_last_frame_picked);
    }

    #[test]
    fn slide_analysis_upsert_replaces_markdown() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_slide_analysis("vid", 2, FramePosition::First, "# v1")
            .unwrap();
        store
            .upsert_slide_analysis("vid", 2, FramePosition::First, "# v2")
            .unwrap();

        let result = store
            .slide_analysis("vid", 2, FramePosition::First)
            .unwrap()
            .unwrap();
        assert_eq!(result.markdown, "# v2");
        assert_eq!(store.slide_analyses("vid").unwrap().len(), 1);
    }

    #[test]
    fn slide_analysis_keys_are_per_frame() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_slide_analysis("vid", 2, FramePosition::First, "first frame")
            .unwrap();
        store
            .upsert_slide_analysis("vid", 2, FramePosition::Last, "last frame")
            .unwrap();
        assert_eq!(store.slide_analyses("vid").unwrap().len(), 2);
        assert!(store
            .slide_analysis("vid", 2, FramePosition::Last)
            .unwrap()
            .is_some());
    }

    #[test]
    fn super_analysis_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.super_analysis("vid").unwrap().is_none());
        store.set_super_analysis("vid", "# Report").unwrap();
        store.set_super_analysis("vid", "# Report v2").unwrap();
        assert_eq!(store.super_analysis("vid").unwrap().unwrap(), "# Report v2");
    }
}
