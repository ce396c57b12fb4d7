//! Transcript cache.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use vs_domain::transcript::Transcript;
use vs_domain::Result;

use crate::Store;

impl Store {
    /// Insert or replace the cached transcript for a video.
    pub fn upsert_transcript(&self, transcript: &Transcript) -> Result<()> {
        let segments = serde_json::to_string(&transcript.segments)?;
        self.with(|c| {
            c.execute(
                "INSERT INTO transcripts (video_id, title, channel_name, description, \
                 segments_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT (video_id) DO UPDATE SET title = ?2, channel_name = ?3, \
                 description = ?4, segments_json = ?5",
                params![
                    transcript.video_id,
                    transcript.title,
                    transcript.channel_name,
                    transcript.description,
                    segments,
                    Utc::now().to_rfc3339(),
                ],
            )
        })?;
        Ok(())
    }

    pub fn transcript(&self, video_id: &str) -> Result<Option<Transcript>> {
        let row = self.with(|c| {
            c.query_row(
                "SELECT title, channel_name, description, segments_json \
                 FROM transcripts WHERE video_id = ?1",
                params![video_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
        })?;

        Ok(row.map(|(title, channel_name, description, segments_json)| Transcript {
            video_id: video_id.to_owned(),
            title,
            channel_name,
            description,
            segments: serde_json::from_str(&segments_json).unwrap_or_default(),
        }))
    }

    pub fn has_transcript(&self, video_id: &str) -> Result<bool> {
        self.with(|c| {
            c.query_row(
                "SELECT EXISTS(SELECT 1 FROM transcripts WHERE video_id = ?1)",
                params![video_id],
                |row| row.get(0),
            )
        })
    }
}
