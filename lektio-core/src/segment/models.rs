use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Persisted lifecycle of one segment's transcription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentStatus::Pending => "pending",
            SegmentStatus::Processing => "processing",
            SegmentStatus::Completed => "completed",
            SegmentStatus::Failed => "failed",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(self, SegmentStatus::Completed | SegmentStatus::Failed)
    }

    /// Pure transition function. Every status mutation the store performs
    /// goes through here, so the legality table is testable without I/O.
    pub fn apply(self, event: SegmentEvent) -> Result<SegmentStatus, TransitionRejected> {
        match (self, event) {
            (SegmentStatus::Pending, SegmentEvent::Claim) => Ok(SegmentStatus::Processing),
            (SegmentStatus::Failed, SegmentEvent::Retry) => Ok(SegmentStatus::Processing),
            (SegmentStatus::Completed, SegmentEvent::Rerun) => Ok(SegmentStatus::Processing),
            (SegmentStatus::Processing, SegmentEvent::Complete) => Ok(SegmentStatus::Completed),
            (SegmentStatus::Processing, SegmentEvent::Fail) => Ok(SegmentStatus::Failed),
            (from, event) => Err(TransitionRejected { from, event }),
        }
    }
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SegmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SegmentStatus::Pending),
            "processing" => Ok(SegmentStatus::Processing),
            "completed" => Ok(SegmentStatus::Completed),
            "failed" => Ok(SegmentStatus::Failed),
            other => Err(format!("unknown segment status: {other}")),
        }
    }
}

/// Event driving a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEvent {
    Claim,
    Complete,
    Fail,
    Retry,
    Rerun,
}

impl fmt::Display for SegmentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SegmentEvent::Claim => "claim",
            SegmentEvent::Complete => "complete",
            SegmentEvent::Fail => "fail",
            SegmentEvent::Retry => "retry",
            SegmentEvent::Rerun => "rerun",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRejected {
    pub from: SegmentStatus,
    pub event: SegmentEvent,
}

impl fmt::Display for TransitionRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} a {} segment", self.event, self.from)
    }
}

/// Registered video whose segments this pipeline transcribes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoRecord {
    pub video_id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub duration_s: f64,
    pub total_segments: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl VideoRecord {
    pub fn new(
        video_id: impl Into<String>,
        user_id: impl Into<String>,
        duration_s: f64,
        total_segments: i64,
    ) -> Self {
        Self {
            video_id: video_id.into(),
            user_id: user_id.into(),
            title: None,
            duration_s,
            total_segments,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        let updated_at: Option<NaiveDateTime> = row.get("updated_at")?;
        Ok(Self {
            video_id: row.get("video_id")?,
            user_id: row.get("user_id")?,
            title: row.get("title")?,
            duration_s: row.get("duration_s")?,
            total_segments: row.get("total_segments")?,
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
            updated_at: updated_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }
}

/// Time bounds of one segment, supplied at registration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SegmentSpan {
    pub index: i64,
    pub start_s: f64,
    pub end_s: f64,
}

/// One persisted segment transcription row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentTranscription {
    pub video_id: String,
    pub segment_index: i64,
    pub start_s: f64,
    pub end_s: f64,
    pub status: SegmentStatus,
    pub transcription: String,
    pub audio_data: Option<String>,
    pub audio_sha256: Option<String>,
    pub transcribed_at: Option<DateTime<Utc>>,
    pub failure_count: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SegmentTranscription {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let transcribed_at: Option<NaiveDateTime> = row.get("transcribed_at")?;
        let updated_at: Option<NaiveDateTime> = row.get("updated_at")?;
        Ok(Self {
            video_id: row.get("video_id")?,
            segment_index: row.get("segment_index")?,
            start_s: row.get("start_s")?,
            end_s: row.get("end_s")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(SegmentStatus::Pending),
            transcription: row.get("transcription")?,
            audio_data: row.get("audio_data")?,
            audio_sha256: row.get("audio_sha256")?,
            transcribed_at: transcribed_at.map(|dt| Utc.from_utc_datetime(&dt)),
            failure_count: row.get::<_, Option<i64>>("failure_count")?.unwrap_or(0),
            updated_at: updated_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }

    pub fn has_stored_audio(&self) -> bool {
        self.audio_data
            .as_deref()
            .map(|data| !data.is_empty())
            .unwrap_or(false)
    }
}

/// Aggregate counters over a store, for status commands and dashboards.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SegmentMetrics {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub videos: usize,
}
