mod error;
mod types;

use std::path::PathBuf;

use tracing::{info, warn};

use crate::acquire::AudioFetcher;
use crate::audio_store::{self, EncodedAudio};
use crate::config::{LektioConfig, PipelineConfig};
use crate::recognize::{ModelTier, SpeechRecognizer};
use crate::segment::{SegmentStatus, SegmentTranscription, SqliteSegmentStore};
use crate::temp::{self, RunScratch, ScratchWorkspace};

pub use error::{PipelineError, PipelineResult};
pub use types::{FreshOutcome, SegmentRunReport, StoragePolicy};

/// Sequences acquisition, encoding, recognition and cleanup for one segment
/// at a time. Cleanup runs on every exit path; each invocation works inside
/// its own scratch subdirectory.
#[derive(Clone)]
pub struct TranscriptionPipeline {
    fetcher: AudioFetcher,
    recognizer: SpeechRecognizer,
    scratch: ScratchWorkspace,
    work_dir: PathBuf,
    audio_format: String,
    policy: StoragePolicy,
}

impl TranscriptionPipeline {
    pub fn new(pipeline: &PipelineConfig, lektio: &LektioConfig) -> PipelineResult<Self> {
        let scratch_dir = lektio.resolve_path(&lektio.paths.scratch_dir);
        let work_dir = lektio.resolve_path(&lektio.paths.work_dir);
        std::fs::create_dir_all(&work_dir).map_err(|source| PipelineError::Io {
            path: work_dir.clone(),
            source,
        })?;
        let scratch =
            ScratchWorkspace::new(&scratch_dir).map_err(|source| PipelineError::Io {
                path: scratch_dir.clone(),
                source,
            })?;
        Ok(Self {
            fetcher: AudioFetcher::from_config(&pipeline.download, &work_dir),
            recognizer: SpeechRecognizer::from_config(&pipeline.recognition),
            scratch,
            work_dir,
            audio_format: pipeline.download.audio_format.clone(),
            policy: StoragePolicy::from(&pipeline.storage),
        })
    }

    pub fn with_fetcher(mut self, fetcher: AudioFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_recognizer(mut self, recognizer: SpeechRecognizer) -> Self {
        self.recognizer = recognizer;
        self
    }

    pub fn with_policy(mut self, policy: StoragePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn scratch(&self) -> &ScratchWorkspace {
        &self.scratch
    }

    /// Fresh run: download, encode for persistence, transcribe. The encode
    /// step is best-effort unless the policy requires it; acquisition and
    /// recognition failures abort the run. The scratch directory and the
    /// download tool's cache residue are cleaned up no matter how the run
    /// ends.
    pub async fn run_fresh(
        &self,
        video_id: &str,
        tier: ModelTier,
    ) -> PipelineResult<FreshOutcome> {
        let run = self.begin_run(video_id)?;
        let result = self.fresh_steps(&run, video_id, tier).await;
        self.cleanup(&run);
        result
    }

    /// Replay run: restore audio from its stored encoding and transcribe,
    /// skipping the download entirely.
    pub async fn run_from_encoded(
        &self,
        encoded: &str,
        video_id: &str,
        tier: ModelTier,
    ) -> PipelineResult<String> {
        let run = self.begin_run(video_id)?;
        let result = self.replay_steps(&run, encoded, video_id, tier).await;
        self.cleanup(&run);
        result
    }

    /// Maintenance entry point: empty the scratch root and sweep the
    /// download tool's cache residue. Safe only while no run is in flight.
    pub fn sweep_all(&self) -> (usize, usize) {
        let scratch_removed = self.scratch.release_all();
        let caches_removed = temp::sweep_leftover_caches(&self.work_dir);
        info!(
            scratch_removed,
            caches_removed, "swept scratch directory and leftover caches"
        );
        (scratch_removed, caches_removed)
    }

    /// Store-backed run: claims the segment, replays from stored audio when
    /// present (otherwise runs fresh), then persists the outcome. The claim
    /// enforces single-flight per segment; a rejected claim leaves the
    /// scratch directory untouched.
    pub async fn transcribe_segment(
        &self,
        store: &SqliteSegmentStore,
        video_id: &str,
        segment_index: i64,
        tier: ModelTier,
        rerun: bool,
    ) -> PipelineResult<SegmentRunReport> {
        let segment = store.claim_segment(video_id, segment_index, rerun)?;
        let replayed = segment.has_stored_audio();

        match self.run_for_segment(&segment, tier).await {
            Ok((transcription, encoded)) => {
                store.complete_segment(
                    video_id,
                    segment_index,
                    &transcription,
                    encoded.as_ref(),
                )?;
                let audio_persisted = if self.policy.clear_audio_after_transcription {
                    store.clear_audio(video_id, segment_index)?;
                    false
                } else {
                    replayed || encoded.is_some()
                };
                Ok(SegmentRunReport {
                    video_id: video_id.to_string(),
                    segment_index,
                    status: SegmentStatus::Completed,
                    replayed,
                    words: transcription.split_whitespace().count(),
                    audio_persisted,
                })
            }
            Err(err) => {
                if let Err(store_err) =
                    store.fail_segment(video_id, segment_index, err.to_string())
                {
                    warn!(
                        video_id,
                        segment_index,
                        error = %store_err,
                        "failed to record segment failure"
                    );
                }
                Err(err)
            }
        }
    }

    async fn run_for_segment(
        &self,
        segment: &SegmentTranscription,
        tier: ModelTier,
    ) -> PipelineResult<(String, Option<EncodedAudio>)> {
        if let Some(encoded) = segment.audio_data.as_deref().filter(|data| !data.is_empty()) {
            if let Some(digest) = segment.audio_sha256.as_deref() {
                audio_store::verify_encoded(encoded, digest)?;
            }
            let transcription = self
                .run_from_encoded(encoded, &segment.video_id, tier)
                .await?;
            Ok((transcription, None))
        } else {
            let outcome = self.run_fresh(&segment.video_id, tier).await?;
            Ok((outcome.transcription, outcome.encoded_audio))
        }
    }

    async fn fresh_steps(
        &self,
        run: &RunScratch,
        video_id: &str,
        tier: ModelTier,
    ) -> PipelineResult<FreshOutcome> {
        let audio_path = self.fetcher.fetch(run, video_id).await?;

        let encoded_audio = match audio_store::encode_file(&audio_path) {
            Ok(encoded) => Some(encoded),
            Err(err) if self.policy.require_encoded_audio => return Err(err.into()),
            Err(err) => {
                warn!(video_id, error = %err, "audio encoding failed, continuing without stored copy");
                None
            }
        };

        let transcription = self.recognizer.transcribe(run, &audio_path, tier).await?;
        Ok(FreshOutcome {
            transcription,
            encoded_audio,
        })
    }

    async fn replay_steps(
        &self,
        run: &RunScratch,
        encoded: &str,
        video_id: &str,
        tier: ModelTier,
    ) -> PipelineResult<String> {
        let audio_path = run.allocate(format!("{video_id}.{}", self.audio_format));
        audio_store::decode_to_file(encoded, &audio_path)?;
        info!(video_id, "transcribing from stored audio");
        let transcription = self.recognizer.transcribe(run, &audio_path, tier).await?;
        Ok(transcription)
    }

    fn begin_run(&self, video_id: &str) -> PipelineResult<RunScratch> {
        self.scratch
            .begin_run(video_id)
            .map_err(|source| PipelineError::Io {
                path: self.scratch.root().to_path_buf(),
                source,
            })
    }

    fn cleanup(&self, run: &RunScratch) {
        run.release();
        let swept = temp::sweep_leftover_caches(&self.work_dir);
        if swept > 0 {
            info!(count = swept, "removed leftover download caches");
        }
    }
}
