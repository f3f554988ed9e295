use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::audio_store::EncodedAudio;
use crate::sqlite::configure_connection;

use super::models::{
    SegmentEvent, SegmentMetrics, SegmentSpan, SegmentStatus, SegmentTranscription, VideoRecord,
};
use super::{SegmentError, SegmentResult};

const SEGMENT_SCHEMA: &str = include_str!("../../../sql/segments.sql");

/// Validation applied to segment spans at registration time.
#[derive(Debug, Clone, Copy)]
pub struct SpanRules {
    pub gap_tolerance_s: f64,
    pub min_duration_s: f64,
}

impl Default for SpanRules {
    fn default() -> Self {
        Self {
            gap_tolerance_s: 0.5,
            min_duration_s: 5.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteSegmentStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteSegmentStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteSegmentStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> SegmentResult<SqliteSegmentStore> {
        let path = self.path.ok_or(SegmentError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteSegmentStore { path, flags })
    }
}

/// SQLite-backed record store for videos and their segment transcriptions.
/// Every status mutation goes through the pure transition table in
/// `SegmentStatus::apply`.
#[derive(Debug, Clone)]
pub struct SqliteSegmentStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteSegmentStore {
    pub fn builder() -> SqliteSegmentStoreBuilder {
        SqliteSegmentStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> SegmentResult<Self> {
        SqliteSegmentStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> SegmentResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            SegmentError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| SegmentError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> SegmentResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SEGMENT_SCHEMA)?;
        Ok(())
    }

    /// Creates the video row and one pending segment row per span. Spans
    /// must be indexed 0..n, ordered, non-overlapping and contiguous within
    /// the configured tolerance.
    pub fn register_video(
        &self,
        video: &VideoRecord,
        spans: &[SegmentSpan],
        rules: &SpanRules,
    ) -> SegmentResult<()> {
        validate_spans(video, spans, rules)?;

        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO videos (video_id, user_id, title, duration_s, total_segments, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
             ON CONFLICT(video_id) DO UPDATE SET
                user_id = excluded.user_id,
                title = excluded.title,
                duration_s = excluded.duration_s,
                total_segments = excluded.total_segments,
                updated_at = excluded.updated_at",
            params![
                &video.video_id,
                &video.user_id,
                &video.title,
                video.duration_s,
                video.total_segments,
            ],
        )?;
        for span in spans {
            tx.execute(
                "INSERT INTO segment_transcriptions (video_id, segment_index, start_s, end_s)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(video_id, segment_index) DO NOTHING",
                params![&video.video_id, span.index, span.start_s, span.end_s],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn fetch_video(&self, video_id: &str) -> SegmentResult<Option<VideoRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM videos WHERE video_id = ?1")?;
        let video = stmt
            .query_row([video_id], |row| VideoRecord::from_row(row))
            .optional()?;
        Ok(video)
    }

    pub fn fetch_segment(
        &self,
        video_id: &str,
        segment_index: i64,
    ) -> SegmentResult<Option<SegmentTranscription>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM segment_transcriptions WHERE video_id = ?1 AND segment_index = ?2",
        )?;
        let segment = stmt
            .query_row(params![video_id, segment_index], |row| {
                SegmentTranscription::from_row(row)
            })
            .optional()?;
        Ok(segment)
    }

    pub fn list_segments(&self, video_id: &str) -> SegmentResult<Vec<SegmentTranscription>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM segment_transcriptions
             WHERE video_id = ?1
             ORDER BY segment_index ASC",
        )?;
        let rows = stmt
            .query_map([video_id], |row| SegmentTranscription::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_by_status(
        &self,
        status: Option<SegmentStatus>,
        limit: usize,
    ) -> SegmentResult<Vec<SegmentTranscription>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM segment_transcriptions
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY video_id ASC, segment_index ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                (status.as_ref().map(SegmentStatus::as_str), limit as i64),
                |row| SegmentTranscription::from_row(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Moves the segment into `processing`, enforcing single-flight: a
    /// concurrent claim observes the in-flight status and is rejected. A
    /// completed segment is only reclaimed when `rerun` is set.
    pub fn claim_segment(
        &self,
        video_id: &str,
        segment_index: i64,
        rerun: bool,
    ) -> SegmentResult<SegmentTranscription> {
        let conn = self.open()?;
        conn.execute("BEGIN IMMEDIATE TRANSACTION", [])?;
        let status_raw: Option<String> = conn
            .query_row(
                "SELECT status FROM segment_transcriptions
                 WHERE video_id = ?1 AND segment_index = ?2",
                params![video_id, segment_index],
                |row| row.get(0),
            )
            .optional()?;
        let Some(status_raw) = status_raw else {
            conn.execute("ROLLBACK", [])?;
            return Err(SegmentError::NotFound {
                video_id: video_id.to_string(),
                segment_index,
            });
        };
        let status = status_raw
            .parse::<SegmentStatus>()
            .unwrap_or(SegmentStatus::Pending);

        let event = match status {
            SegmentStatus::Pending => SegmentEvent::Claim,
            SegmentStatus::Failed => SegmentEvent::Retry,
            SegmentStatus::Completed if rerun => SegmentEvent::Rerun,
            SegmentStatus::Completed => {
                conn.execute("ROLLBACK", [])?;
                return Err(SegmentError::AlreadyCompleted {
                    video_id: video_id.to_string(),
                    segment_index,
                });
            }
            SegmentStatus::Processing => {
                conn.execute("ROLLBACK", [])?;
                return Err(SegmentError::AlreadyProcessing {
                    video_id: video_id.to_string(),
                    segment_index,
                });
            }
        };
        let next = match status.apply(event) {
            Ok(next) => next,
            Err(rejected) => {
                conn.execute("ROLLBACK", [])?;
                return Err(SegmentError::InvalidTransition {
                    from: rejected.from.to_string(),
                    event: rejected.event.to_string(),
                });
            }
        };

        // A rerun starts a new processing cycle; the old transcription goes
        // with it so only completed segments ever carry text.
        if event == SegmentEvent::Rerun {
            conn.execute(
                "UPDATE segment_transcriptions
                 SET status = ?3, transcription = '', transcribed_at = NULL,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE video_id = ?1 AND segment_index = ?2",
                params![video_id, segment_index, next.as_str()],
            )?;
        } else {
            conn.execute(
                "UPDATE segment_transcriptions
                 SET status = ?3, updated_at = CURRENT_TIMESTAMP
                 WHERE video_id = ?1 AND segment_index = ?2",
                params![video_id, segment_index, next.as_str()],
            )?;
        }
        record_attempt(
            &conn,
            video_id,
            segment_index,
            Some(status),
            Some(next),
            &format!("claimed via {event}"),
        )?;
        conn.execute("COMMIT", [])?;

        self.fetch_segment(video_id, segment_index)?
            .ok_or_else(|| SegmentError::NotFound {
                video_id: video_id.to_string(),
                segment_index,
            })
    }

    /// Finalizes a processing segment. The transcription must be non-empty;
    /// the stored audio is replaced only when a fresh encoding is supplied.
    pub fn complete_segment(
        &self,
        video_id: &str,
        segment_index: i64,
        transcription: &str,
        encoded: Option<&EncodedAudio>,
    ) -> SegmentResult<()> {
        if transcription.trim().is_empty() {
            return Err(SegmentError::EmptyTranscription);
        }
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let status = current_status(&tx, video_id, segment_index)?;
        let next = status.apply(SegmentEvent::Complete).map_err(|rejected| {
            SegmentError::InvalidTransition {
                from: rejected.from.to_string(),
                event: rejected.event.to_string(),
            }
        })?;
        tx.execute(
            "UPDATE segment_transcriptions
             SET status = ?3,
                 transcription = ?4,
                 audio_data = COALESCE(?5, audio_data),
                 audio_sha256 = COALESCE(?6, audio_sha256),
                 transcribed_at = CURRENT_TIMESTAMP,
                 failure_count = 0,
                 updated_at = CURRENT_TIMESTAMP
             WHERE video_id = ?1 AND segment_index = ?2",
            params![
                video_id,
                segment_index,
                next.as_str(),
                transcription.trim(),
                encoded.map(|audio| audio.data.as_str()),
                encoded.map(|audio| audio.sha256.as_str()),
            ],
        )?;
        record_attempt(
            &tx,
            video_id,
            segment_index,
            Some(status),
            Some(next),
            "transcription stored",
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Marks a processing segment failed and records the failure note for
    /// later retries.
    pub fn fail_segment(
        &self,
        video_id: &str,
        segment_index: i64,
        note: impl AsRef<str>,
    ) -> SegmentResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let status = current_status(&tx, video_id, segment_index)?;
        let next = status.apply(SegmentEvent::Fail).map_err(|rejected| {
            SegmentError::InvalidTransition {
                from: rejected.from.to_string(),
                event: rejected.event.to_string(),
            }
        })?;
        tx.execute(
            "UPDATE segment_transcriptions
             SET status = ?3,
                 failure_count = failure_count + 1,
                 updated_at = CURRENT_TIMESTAMP
             WHERE video_id = ?1 AND segment_index = ?2",
            params![video_id, segment_index, next.as_str()],
        )?;
        record_attempt(
            &tx,
            video_id,
            segment_index,
            Some(status),
            Some(next),
            note.as_ref(),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Drops the stored audio of a completed segment to reclaim space. The
    /// transcription and digest stay behind.
    pub fn clear_audio(&self, video_id: &str, segment_index: i64) -> SegmentResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE segment_transcriptions
             SET audio_data = NULL, updated_at = CURRENT_TIMESTAMP
             WHERE video_id = ?1 AND segment_index = ?2",
            params![video_id, segment_index],
        )?;
        if affected == 0 {
            return Err(SegmentError::NotFound {
                video_id: video_id.to_string(),
                segment_index,
            });
        }
        Ok(())
    }

    /// Percentage of completed segments for a video.
    pub fn transcription_progress(&self, video_id: &str) -> SegmentResult<f64> {
        let video = self
            .fetch_video(video_id)?
            .ok_or_else(|| SegmentError::VideoNotFound {
                video_id: video_id.to_string(),
            })?;
        if video.total_segments == 0 {
            return Ok(0.0);
        }
        let conn = self.open()?;
        let completed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM segment_transcriptions
             WHERE video_id = ?1 AND status = 'completed'",
            [video_id],
            |row| row.get(0),
        )?;
        Ok(completed as f64 * 100.0 / video.total_segments as f64)
    }

    /// Completed segment texts joined in segment order.
    pub fn full_transcription(&self, video_id: &str) -> SegmentResult<String> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT transcription FROM segment_transcriptions
             WHERE video_id = ?1 AND status = 'completed'
             ORDER BY segment_index ASC",
        )?;
        let parts = stmt
            .query_map([video_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parts.join("\n"))
    }

    pub fn count_by_status(&self) -> SegmentResult<HashMap<String, usize>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM segment_transcriptions GROUP BY status")?;
        let mut map = HashMap::new();
        for row in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })? {
            let (status, count) = row?;
            map.insert(status, count as usize);
        }
        Ok(map)
    }

    pub fn compute_metrics(&self) -> SegmentResult<SegmentMetrics> {
        let by_status = self.count_by_status()?;
        let total = by_status.values().copied().sum();
        let conn = self.open()?;
        let videos: i64 = conn
            .query_row("SELECT COUNT(*) FROM videos", [], |row| row.get(0))
            .unwrap_or(0);
        Ok(SegmentMetrics {
            total,
            by_status,
            videos: videos as usize,
        })
    }

    /// Whole-video deletion. Segments are never deleted individually; they
    /// go away with their video.
    pub fn delete_video(&self, video_id: &str) -> SegmentResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM segment_transcriptions WHERE video_id = ?1",
            [video_id],
        )?;
        tx.execute(
            "DELETE FROM segment_attempts WHERE video_id = ?1",
            [video_id],
        )?;
        let affected = tx.execute("DELETE FROM videos WHERE video_id = ?1", [video_id])?;
        tx.commit()?;
        if affected == 0 {
            return Err(SegmentError::VideoNotFound {
                video_id: video_id.to_string(),
            });
        }
        Ok(())
    }
}

fn current_status(
    conn: &Connection,
    video_id: &str,
    segment_index: i64,
) -> SegmentResult<SegmentStatus> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM segment_transcriptions
             WHERE video_id = ?1 AND segment_index = ?2",
            params![video_id, segment_index],
            |row| row.get(0),
        )
        .optional()?;
    let raw = raw.ok_or_else(|| SegmentError::NotFound {
        video_id: video_id.to_string(),
        segment_index,
    })?;
    Ok(raw.parse().unwrap_or(SegmentStatus::Pending))
}

fn record_attempt(
    conn: &Connection,
    video_id: &str,
    segment_index: i64,
    from: Option<SegmentStatus>,
    to: Option<SegmentStatus>,
    note: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO segment_attempts(video_id, segment_index, status_from, status_to, note)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            video_id,
            segment_index,
            from.map(|status| status.as_str().to_string()),
            to.map(|status| status.as_str().to_string()),
            note,
        ],
    )?;
    Ok(())
}

fn validate_spans(
    video: &VideoRecord,
    spans: &[SegmentSpan],
    rules: &SpanRules,
) -> SegmentResult<()> {
    if spans.len() as i64 != video.total_segments {
        return Err(SegmentError::InvalidSpan {
            index: -1,
            reason: format!(
                "expected {} spans, got {}",
                video.total_segments,
                spans.len()
            ),
        });
    }
    let mut previous_end: Option<f64> = None;
    for (position, span) in spans.iter().enumerate() {
        if span.index != position as i64 {
            return Err(SegmentError::InvalidSpan {
                index: span.index,
                reason: format!("expected index {position}"),
            });
        }
        if span.start_s >= span.end_s {
            return Err(SegmentError::InvalidSpan {
                index: span.index,
                reason: "start must precede end".to_string(),
            });
        }
        if span.end_s - span.start_s < rules.min_duration_s {
            return Err(SegmentError::InvalidSpan {
                index: span.index,
                reason: format!("shorter than {:.1}s", rules.min_duration_s),
            });
        }
        if let Some(end) = previous_end {
            if (span.start_s - end).abs() > rules.gap_tolerance_s {
                return Err(SegmentError::InvalidSpan {
                    index: span.index,
                    reason: format!(
                        "not contiguous with previous segment (gap {:.2}s)",
                        span.start_s - end
                    ),
                });
            }
        }
        previous_end = Some(span.end_s);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(total: i64) -> VideoRecord {
        VideoRecord::new("vid", "user-1", 60.0, total)
    }

    fn span(index: i64, start_s: f64, end_s: f64) -> SegmentSpan {
        SegmentSpan {
            index,
            start_s,
            end_s,
        }
    }

    #[test]
    fn spans_must_be_contiguous_within_tolerance() {
        let rules = SpanRules::default();
        let good = [span(0, 0.0, 30.0), span(1, 30.2, 60.0)];
        validate_spans(&video(2), &good, &rules).unwrap();

        let gapped = [span(0, 0.0, 30.0), span(1, 31.0, 60.0)];
        let err = validate_spans(&video(2), &gapped, &rules).unwrap_err();
        assert!(matches!(err, SegmentError::InvalidSpan { index: 1, .. }));
    }

    #[test]
    fn spans_must_match_declared_count_and_ordering() {
        let rules = SpanRules::default();
        let err = validate_spans(&video(3), &[span(0, 0.0, 30.0)], &rules).unwrap_err();
        assert!(matches!(err, SegmentError::InvalidSpan { index: -1, .. }));

        let reversed = [span(1, 0.0, 30.0), span(0, 30.0, 60.0)];
        let err = validate_spans(&video(2), &reversed, &rules).unwrap_err();
        assert!(matches!(err, SegmentError::InvalidSpan { index: 1, .. }));

        let inverted = [span(0, 30.0, 30.0), span(1, 30.0, 60.0)];
        let err = validate_spans(&video(2), &inverted, &rules).unwrap_err();
        assert!(matches!(err, SegmentError::InvalidSpan { index: 0, .. }));
    }
}
