//! Slide, frame, feedback, and per-slide analysis records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frame position
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The two candidate frames sampled per static segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramePosition {
    First,
    Last,
}

impl FramePosition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Last => "last",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "first" => Some(Self::First),
            "last" => Some(Self::Last),
            _ => None,
        }
    }
}

impl std::fmt::Display for FramePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Slide records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One sampled frame of a slide.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlideFrame {
    /// Public URL after upload to blob storage; absent when the upload
    /// failed (see `error`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Source URI in the extractor's object storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    #[serde(default)]
    pub has_text: bool,
    /// When this frame duplicates an earlier one, the referenced slide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of_slide: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of_frame: Option<FramePosition>,
    /// Per-frame processing failure, recorded on the record, never fatal
    /// to the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One extracted slide (a static segment of the video) with its two frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slide {
    pub video_id: String,
    pub slide_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_seconds: Option<f64>,
    pub first: SlideFrame,
    pub last: SlideFrame,
}

impl Slide {
    pub fn frame(&self, position: FramePosition) -> &SlideFrame {
        match position {
            FramePosition::First => &self.first,
            FramePosition::Last => &self.last,
        }
    }

    pub fn frame_mut(&mut self, position: FramePosition) -> &mut SlideFrame {
        match position {
            FramePosition::First => &mut self.first,
            FramePosition::Last => &mut self.last,
        }
    }

    /// A frame marked duplicate must reference an *earlier* slide, which
    /// keeps the duplicate graph acyclic.
    pub fn check_duplicate_refs(&self) -> Result<()> {
        for position in [FramePosition::First, FramePosition::Last] {
            if let Some(target) = self.frame(position).duplicate_of_slide {
                if target >= self.slide_number {
                    return Err(Error::Validation(format!(
                        "slide {} frame {position} duplicates slide {target}, \
                         which is not earlier",
                        self.slide_number
                    )));
                }
            }
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Feedback & analysis
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A user's frame picks for one slide.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SlideFeedback {
    pub slide_number: u32,
    #[serde(default)]
    pub is_first_frame_picked: bool,
    #[serde(default)]
    pub is_last_frame_picked: bool,
}

/// A (slide, frame) pair selected for per-slide LLM analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlideTarget {
    pub slide_number: u32,
    pub frame_position: FramePosition,
}

impl SlideTarget {
    /// Namespace label for the target's sub-stream, `"{n}-{first|last}"`.
    pub fn namespace(&self) -> String {
        format!("{}-{}", self.slide_number, self.frame_position)
    }
}

/// Expand feedback rows into the list of picked targets, in slide order.
pub fn picked_targets(feedback: &[SlideFeedback]) -> Vec<SlideTarget> {
    let mut targets = Vec::new();
    for fb in feedback {
        if fb.is_first_frame_picked {
            targets.push(SlideTarget {
                slide_number: fb.slide_number,
                frame_position: FramePosition::First,
            });
        }
        if fb.is_last_frame_picked {
            targets.push(SlideTarget {
                slide_number: fb.slide_number,
                frame_position: FramePosition::Last,
            });
        }
    }
    targets
}

/// A stored markdown analysis of one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlideAnalysisResult {
    pub slide_number: u32,
    pub frame_position: FramePosition,
    pub markdown: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slide(n: u32) -> Slide {
        Slide {
            video_id: "dQw4w9WgXcQ".into(),
            slide_number: n,
            start_seconds: Some(10.0),
            end_seconds: Some(42.0),
            first: SlideFrame::default(),
            last: SlideFrame::default(),
        }
    }

    #[test]
    fn frame_position_round_trip() {
        assert_eq!(FramePosition::parse("first"), Some(FramePosition::First));
        assert_eq!(FramePosition::parse("last"), Some(FramePosition::Last));
        assert_eq!(FramePosition::parse("middle"), None);
        assert_eq!(FramePosition::First.to_string(), "first");
    }

    #[test]
    fn duplicate_ref_to_earlier_slide_is_ok() {
        let mut s = slide(5);
        s.first.duplicate_of_slide = Some(2);
        s.first.duplicate_of_frame = Some(FramePosition::Last);
        assert!(s.check_duplicate_refs().is_ok());
    }

    #[test]
    fn duplicate_ref_forward_or_self_is_rejected() {
        let mut s = slide(5);
        s.last.duplicate_of_slide = Some(5);
        assert!(s.check_duplicate_refs().is_err());
        s.last.duplicate_of_slide = Some(9);
        assert!(s.check_duplicate_refs().is_err());
    }

    #[test]
    fn target_namespace_label() {
        let t = SlideTarget {
            slide_number: 3,
            frame_position: FramePosition::First,
        };
        assert_eq!(t.namespace(), "3-first");
    }

    #[test]
    fn picked_targets_expands_both_frames() {
        let feedback = [
            SlideFeedback {
                slide_number: 1,
                is_first_frame_picked: true,
                is_last_frame_picked: true,
            },
            SlideFeedback {
                slide_number: 2,
                is_first_frame_picked: false,
                is_last_frame_picked: false,
            },
            SlideFeedback {
                slide_number: 3,
                is_first_frame_picked: false,
                is_last_frame_picked: true,
            },
        ];
        let targets = picked_targets(&feedback);
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].namespace(), "1-first");
        assert_eq!(targets[1].namespace(), "1-last");
        assert_eq!(targets[2].namespace(), "3-last");
    }

    #[test]
    fn frame_accessors() {
        let mut s = slide(1);
        s.frame_mut(FramePosition::Last).has_text = true;
        assert!(!s.frame(FramePosition::First).has_text);
        assert!(s.frame(FramePosition::Last).has_text);
    }
}
