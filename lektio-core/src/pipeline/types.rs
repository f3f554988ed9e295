use serde::Serialize;

use crate::audio_store::EncodedAudio;
use crate::config::StorageSection;
use crate::segment::SegmentStatus;

/// Result of a fresh run. The encoded copy is absent when encoding failed
/// and the policy tolerates that.
#[derive(Debug, Clone)]
pub struct FreshOutcome {
    pub transcription: String,
    pub encoded_audio: Option<EncodedAudio>,
}

/// Named storage policy for the fresh-run encode step and post-completion
/// audio retention.
#[derive(Debug, Clone, Copy)]
pub struct StoragePolicy {
    /// When set, an encode failure aborts the run before transcription.
    /// Otherwise the encoded copy is best-effort and transcription proceeds.
    pub require_encoded_audio: bool,
    /// When set, the stored audio of a segment is dropped right after its
    /// transcription is persisted.
    pub clear_audio_after_transcription: bool,
}

impl From<&StorageSection> for StoragePolicy {
    fn from(section: &StorageSection) -> Self {
        Self {
            require_encoded_audio: section.require_encoded_audio,
            clear_audio_after_transcription: section.clear_audio_after_transcription,
        }
    }
}

/// Summary of one store-backed segment run, for callers and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentRunReport {
    pub video_id: String,
    pub segment_index: i64,
    pub status: SegmentStatus,
    pub replayed: bool,
    pub words: usize,
    pub audio_persisted: bool,
}
