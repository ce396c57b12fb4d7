//! Transcript records and LLM-oriented formatting.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One timed segment of a transcript. `start`/`end` are seconds from the
/// beginning of the video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// A cached transcript for one video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub video_id: String,
    pub title: String,
    pub channel_name: String,
    #[serde(default)]
    pub description: String,
    pub segments: Vec<TranscriptSegment>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM formatting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Render seconds as `HH:MM:SS` (hours unbounded, zero-padded).
pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

/// Render segments as one `[HH:MM:SS] text` line each — the shape the
/// dynamic-analysis prompt consumes.
pub fn format_for_llm(segments: &[TranscriptSegment]) -> String {
    let mut out = String::new();
    for seg in segments {
        let text = seg.text.trim();
        if text.is_empty() {
            continue;
        }
        out.push('[');
        out.push_str(&format_timestamp(seg.start));
        out.push_str("] ");
        out.push_str(text);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            start,
            end: start + 2.0,
            text: text.into(),
        }
    }

    #[test]
    fn timestamp_zero() {
        assert_eq!(format_timestamp(0.0), "00:00:00");
    }

    #[test]
    fn timestamp_minutes_and_seconds() {
        assert_eq!(format_timestamp(65.4), "00:01:05");
        assert_eq!(format_timestamp(599.9), "00:09:59");
    }

    #[test]
    fn timestamp_hours() {
        assert_eq!(format_timestamp(3600.0), "01:00:00");
        assert_eq!(format_timestamp(7325.0), "02:02:05");
    }

    #[test]
    fn timestamp_negative_clamps_to_zero() {
        assert_eq!(format_timestamp(-5.0), "00:00:00");
    }

    #[test]
    fn llm_format_prefixes_each_line() {
        let text = format_for_llm(&[seg(0.0, "hello"), seg(61.0, "world")]);
        assert_eq!(text, "[00:00:00] hello\n[00:01:01] world\n");
    }

    #[test]
    fn llm_format_skips_blank_segments() {
        let text = format_for_llm(&[seg(0.0, "  "), seg(3.0, "kept")]);
        assert_eq!(text, "[00:00:03] kept\n");
    }

    #[test]
    fn llm_format_trims_segment_text() {
        let text = format_for_llm(&[seg(0.0, "  padded  ")]);
        assert_eq!(text, "[00:00:00] padded\n");
    }
}
