use std::path::PathBuf;

use thiserror::Error;

use crate::acquire::AcquireError;
use crate::audio_store::AudioStoreError;
use crate::recognize::RecognizeError;
use crate::segment::SegmentError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("audio acquisition failed: {0}")]
    Acquire(#[from] AcquireError),
    #[error("speech recognition failed: {0}")]
    Recognize(#[from] RecognizeError),
    #[error("encoded audio error: {0}")]
    AudioStore(#[from] AudioStoreError),
    #[error("segment store error: {0}")]
    Segment(#[from] SegmentError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type PipelineResult<T> = Result<T, PipelineError>;
