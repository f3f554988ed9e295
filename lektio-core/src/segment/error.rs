use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("video {video_id} not found")]
    VideoNotFound { video_id: String },
    #[error("segment {segment_index} of video {video_id} not found")]
    NotFound {
        video_id: String,
        segment_index: i64,
    },
    #[error("segment {segment_index} of video {video_id} is already being processed")]
    AlreadyProcessing {
        video_id: String,
        segment_index: i64,
    },
    #[error("segment {segment_index} of video {video_id} is already completed")]
    AlreadyCompleted {
        video_id: String,
        segment_index: i64,
    },
    #[error("illegal status transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },
    #[error("completed segment requires a non-empty transcription")]
    EmptyTranscription,
    #[error("invalid segment span at index {index}: {reason}")]
    InvalidSpan { index: i64, reason: String },
    #[error("segment store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

pub type SegmentResult<T> = std::result::Result<T, SegmentError>;
