use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use lektio_core::acquire::AudioFetcher;
use lektio_core::audio_store::EncodedAudio;
use lektio_core::config::{
    DownloadSection, LektioConfig, LimitsSection, PathsSection, PipelineConfig,
    RecognitionSection, StorageSection, SystemSection,
};
use lektio_core::pipeline::{PipelineError, StoragePolicy, TranscriptionPipeline};
use lektio_core::recognize::{ModelTier, SpeechRecognizer};
use lektio_core::tool::{ExternalTool, ToolOutput};
use lektio_core::{
    SegmentError, SegmentSpan, SegmentStatus, SpanRules, SqliteSegmentStore, VideoRecord,
};

#[derive(Clone, Copy)]
enum DownloadMode {
    WriteFile,
    WriteDirectory,
    SkipOutput,
    FailExit,
}

/// Stand-in for the download tool: honors the `-o <path>` argument the way
/// the real binary does, without touching the network.
struct FakeDownloader {
    mode: DownloadMode,
    payload: Vec<u8>,
    calls: AtomicUsize,
    output_paths: Mutex<Vec<PathBuf>>,
}

impl FakeDownloader {
    fn new(mode: DownloadMode, payload: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            mode,
            payload: payload.to_vec(),
            calls: AtomicUsize::new(0),
            output_paths: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExternalTool for FakeDownloader {
    async fn invoke(&self, args: &[String]) -> io::Result<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let output = arg_after(args, "-o").expect("download args carry -o");
        self.output_paths.lock().unwrap().push(output.clone());
        match self.mode {
            DownloadMode::WriteFile => {
                std::fs::write(&output, &self.payload)?;
                Ok(tool_ok("[download] 100% of 1.00MiB"))
            }
            DownloadMode::WriteDirectory => {
                std::fs::create_dir_all(&output)?;
                Ok(tool_ok(""))
            }
            DownloadMode::SkipOutput => Ok(tool_ok("")),
            DownloadMode::FailExit => Ok(ToolOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: "ERROR: unable to download video data".to_string(),
            }),
        }
    }

    fn describe(&self) -> String {
        "fake-downloader".to_string()
    }
}

#[derive(Clone, Copy)]
enum RecognizeMode {
    WriteTranscript,
    SkipArtifact,
    FailExit,
}

/// Stand-in for the recognition tool: writes `<stem>.txt` into the
/// `--output_dir` directory like the real binary.
struct FakeRecognizer {
    mode: RecognizeMode,
    text: String,
    calls: AtomicUsize,
}

impl FakeRecognizer {
    fn new(mode: RecognizeMode, text: &str) -> Arc<Self> {
        Arc::new(Self {
            mode,
            text: text.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExternalTool for FakeRecognizer {
    async fn invoke(&self, args: &[String]) -> io::Result<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            RecognizeMode::WriteTranscript => {
                let audio = PathBuf::from(&args[0]);
                let output_dir = arg_after(args, "--output_dir").expect("args carry output dir");
                let stem = audio.file_stem().unwrap().to_string_lossy().to_string();
                std::fs::write(output_dir.join(format!("{stem}.txt")), &self.text)?;
                Ok(tool_ok(""))
            }
            RecognizeMode::SkipArtifact => Ok(tool_ok("")),
            RecognizeMode::FailExit => Ok(ToolOutput {
                status: Some(2),
                stdout: String::new(),
                stderr: "RuntimeError: model load failed".to_string(),
            }),
        }
    }

    fn describe(&self) -> String {
        "fake-recognizer".to_string()
    }
}

fn arg_after(args: &[String], flag: &str) -> Option<PathBuf> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|index| args.get(index + 1))
        .map(PathBuf::from)
}

fn tool_ok(stdout: &str) -> ToolOutput {
    ToolOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

struct Harness {
    pipeline: TranscriptionPipeline,
    config: PipelineConfig,
    scratch_dir: PathBuf,
    work_dir: PathBuf,
    base: TempDir,
}

fn harness() -> Harness {
    let base = TempDir::new().unwrap();
    let base_dir = base.path().to_string_lossy().to_string();
    let lektio = LektioConfig {
        system: SystemSection {
            node_name: "lektio-test".to_string(),
            environment: "test".to_string(),
        },
        paths: PathsSection {
            base_dir: base_dir.clone(),
            data_dir: format!("{base_dir}/data"),
            scratch_dir: format!("{base_dir}/scratch"),
            work_dir: format!("{base_dir}/work"),
            logs_dir: format!("{base_dir}/logs"),
        },
        limits: LimitsSection {
            span_gap_tolerance_s: 0.5,
            min_segment_duration_s: 5.0,
        },
    };
    let config = PipelineConfig {
        download: DownloadSection {
            tool: "yt-dlp".to_string(),
            audio_format: "mp3".to_string(),
            audio_quality: "9".to_string(),
            source_host: "www.youtube.com".to_string(),
            timeout_seconds: 10,
        },
        recognition: RecognitionSection {
            tool: "whisper".to_string(),
            language: "en".to_string(),
            default_model: "tiny".to_string(),
            timeout_seconds: 10,
        },
        storage: StorageSection {
            require_encoded_audio: false,
            clear_audio_after_transcription: false,
        },
    };
    let pipeline = TranscriptionPipeline::new(&config, &lektio).unwrap();
    Harness {
        pipeline,
        config,
        scratch_dir: base.path().join("scratch"),
        work_dir: base.path().join("work"),
        base,
    }
}

impl Harness {
    fn with_tools(
        mut self,
        downloader: Arc<FakeDownloader>,
        recognizer: Arc<FakeRecognizer>,
    ) -> Self {
        self.pipeline = self
            .pipeline
            .with_fetcher(AudioFetcher::with_tool(downloader, &self.config.download))
            .with_recognizer(SpeechRecognizer::with_tool(
                recognizer,
                &self.config.recognition,
            ));
        self
    }

    fn plant_cache_residue(&self) -> PathBuf {
        let kept = self.work_dir.join("notes.txt");
        std::fs::write(self.work_dir.join("1745000000-player-ias.vflset.js"), b"x").unwrap();
        std::fs::write(&kept, b"keep me").unwrap();
        kept
    }

    fn scratch_entries(&self) -> usize {
        std::fs::read_dir(&self.scratch_dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    fn setup_store(&self) -> SqliteSegmentStore {
        let path = self.base.path().join("data/segments.sqlite");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let store = SqliteSegmentStore::new(&path).unwrap();
        store.initialize().unwrap();
        let video = VideoRecord::new("jNQXAC9IVRw", "user-1", 18.0, 1);
        let spans = [SegmentSpan {
            index: 0,
            start_s: 0.0,
            end_s: 18.0,
        }];
        store
            .register_video(
                &video,
                &spans,
                &SpanRules {
                    gap_tolerance_s: 0.5,
                    min_duration_s: 5.0,
                },
            )
            .unwrap();
        store
    }
}

const AUDIO_BYTES: &[u8] = b"ID3\x04\x00fake mpeg frames for testing";

#[tokio::test]
async fn fresh_run_yields_transcription_and_encoded_audio() {
    let downloader = FakeDownloader::new(DownloadMode::WriteFile, AUDIO_BYTES);
    let recognizer = FakeRecognizer::new(RecognizeMode::WriteTranscript, " All right, so here we are.  ");
    let h = harness().with_tools(downloader.clone(), recognizer.clone());
    let kept = h.plant_cache_residue();

    let outcome = h
        .pipeline
        .run_fresh("jNQXAC9IVRw", ModelTier::Tiny)
        .await
        .unwrap();

    assert_eq!(outcome.transcription, "All right, so here we are.");
    let encoded = outcome.encoded_audio.expect("encoded copy present");
    assert_eq!(encoded.byte_len, AUDIO_BYTES.len() as u64);
    assert_eq!(encoded, EncodedAudio::from_bytes(AUDIO_BYTES));

    assert_eq!(downloader.calls(), 1);
    assert_eq!(recognizer.calls(), 1);
    // Cleanup totality: no run artifacts survive, cache residue is swept,
    // unrelated files stay.
    assert_eq!(h.scratch_entries(), 0);
    assert!(!h.work_dir.join("1745000000-player-ias.vflset.js").exists());
    assert!(kept.exists());
}

#[tokio::test]
async fn failed_download_surfaces_acquire_error_and_skips_recognizer() {
    let downloader = FakeDownloader::new(DownloadMode::FailExit, &[]);
    let recognizer = FakeRecognizer::new(RecognizeMode::WriteTranscript, "unused");
    let h = harness().with_tools(downloader.clone(), recognizer.clone());
    h.plant_cache_residue();

    let err = h
        .pipeline
        .run_fresh("jNQXAC9IVRw", ModelTier::Tiny)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Acquire(_)));
    assert_eq!(recognizer.calls(), 0);
    // Cleanup runs on the failure path too.
    assert_eq!(h.scratch_entries(), 0);
    assert!(!h.work_dir.join("1745000000-player-ias.vflset.js").exists());
}

#[tokio::test]
async fn clean_exit_without_output_file_is_an_acquire_error() {
    let downloader = FakeDownloader::new(DownloadMode::SkipOutput, &[]);
    let recognizer = FakeRecognizer::new(RecognizeMode::WriteTranscript, "unused");
    let h = harness().with_tools(downloader, recognizer.clone());

    let err = h
        .pipeline
        .run_fresh("jNQXAC9IVRw", ModelTier::Tiny)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Acquire(_)));
    assert_eq!(recognizer.calls(), 0);
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn failed_recognizer_surfaces_recognition_error() {
    let downloader = FakeDownloader::new(DownloadMode::WriteFile, AUDIO_BYTES);
    let recognizer = FakeRecognizer::new(RecognizeMode::FailExit, "");
    let h = harness().with_tools(downloader.clone(), recognizer);

    let err = h
        .pipeline
        .run_fresh("jNQXAC9IVRw", ModelTier::Tiny)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Recognize(_)));
    // The download still happened; only the recognition step failed.
    assert_eq!(downloader.calls(), 1);
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn clean_recognizer_exit_without_artifact_is_a_recognition_error() {
    let downloader = FakeDownloader::new(DownloadMode::WriteFile, AUDIO_BYTES);
    let recognizer = FakeRecognizer::new(RecognizeMode::SkipArtifact, "");
    let h = harness().with_tools(downloader, recognizer);

    let err = h
        .pipeline
        .run_fresh("jNQXAC9IVRw", ModelTier::Tiny)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Recognize(_)));
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn encode_failure_is_tolerated_unless_policy_requires_it() {
    // A directory at the output path defeats the byte-level read the encoder
    // performs while still passing the downloader's own existence check.
    let downloader = FakeDownloader::new(DownloadMode::WriteDirectory, &[]);
    let recognizer = FakeRecognizer::new(RecognizeMode::WriteTranscript, "still transcribed");
    let h = harness().with_tools(downloader.clone(), recognizer.clone());

    let outcome = h
        .pipeline
        .run_fresh("jNQXAC9IVRw", ModelTier::Tiny)
        .await
        .unwrap();
    assert_eq!(outcome.transcription, "still transcribed");
    assert!(outcome.encoded_audio.is_none());

    let strict_harness = harness().with_tools(
        FakeDownloader::new(DownloadMode::WriteDirectory, &[]),
        FakeRecognizer::new(RecognizeMode::WriteTranscript, "unreached"),
    );
    let strict = strict_harness.pipeline.clone().with_policy(StoragePolicy {
        require_encoded_audio: true,
        clear_audio_after_transcription: false,
    });
    let err = strict
        .run_fresh("jNQXAC9IVRw", ModelTier::Tiny)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::AudioStore(_)));
}

#[tokio::test]
async fn replay_run_never_invokes_the_downloader() {
    let downloader = FakeDownloader::new(DownloadMode::FailExit, &[]);
    let recognizer = FakeRecognizer::new(RecognizeMode::WriteTranscript, "replayed text");
    let h = harness().with_tools(downloader.clone(), recognizer.clone());

    let encoded = EncodedAudio::from_bytes(AUDIO_BYTES);
    let transcription = h
        .pipeline
        .run_from_encoded(&encoded.data, "jNQXAC9IVRw", ModelTier::Tiny)
        .await
        .unwrap();

    assert_eq!(transcription, "replayed text");
    assert_eq!(downloader.calls(), 0);
    assert_eq!(recognizer.calls(), 1);
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn replay_with_invalid_encoding_fails_before_recognition() {
    let downloader = FakeDownloader::new(DownloadMode::FailExit, &[]);
    let recognizer = FakeRecognizer::new(RecognizeMode::WriteTranscript, "unused");
    let h = harness().with_tools(downloader, recognizer.clone());

    let err = h
        .pipeline
        .run_from_encoded("%%% not base64 %%%", "jNQXAC9IVRw", ModelTier::Tiny)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::AudioStore(_)));
    assert_eq!(recognizer.calls(), 0);
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn concurrent_fresh_runs_for_one_video_use_distinct_scratch_dirs() {
    let downloader = FakeDownloader::new(DownloadMode::WriteFile, AUDIO_BYTES);
    let recognizer = FakeRecognizer::new(RecognizeMode::WriteTranscript, "same video twice");
    let h = harness().with_tools(downloader.clone(), recognizer.clone());

    let (first, second) = tokio::join!(
        h.pipeline.run_fresh("jNQXAC9IVRw", ModelTier::Tiny),
        h.pipeline.run_fresh("jNQXAC9IVRw", ModelTier::Tiny),
    );
    first.unwrap();
    second.unwrap();

    let outputs = downloader.output_paths.lock().unwrap();
    assert_eq!(outputs.len(), 2);
    assert_ne!(outputs[0], outputs[1]);
    drop(outputs);
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn store_backed_run_persists_and_then_replays_offline() {
    let downloader = FakeDownloader::new(DownloadMode::WriteFile, AUDIO_BYTES);
    let recognizer = FakeRecognizer::new(RecognizeMode::WriteTranscript, "first pass text");
    let h = harness().with_tools(downloader.clone(), recognizer.clone());
    let store = h.setup_store();

    let report = h
        .pipeline
        .transcribe_segment(&store, "jNQXAC9IVRw", 0, ModelTier::Tiny, false)
        .await
        .unwrap();
    assert_eq!(report.status, SegmentStatus::Completed);
    assert!(!report.replayed);
    assert!(report.audio_persisted);
    assert_eq!(report.words, 3);

    let segment = store.fetch_segment("jNQXAC9IVRw", 0).unwrap().unwrap();
    assert_eq!(segment.transcription, "first pass text");
    assert!(segment.has_stored_audio());

    // Re-run with a dead network: the stored audio makes it a replay and the
    // downloader is never touched.
    let offline_downloader = FakeDownloader::new(DownloadMode::FailExit, &[]);
    let offline = harness().with_tools(
        offline_downloader.clone(),
        FakeRecognizer::new(RecognizeMode::WriteTranscript, "second pass text"),
    );
    let report = offline
        .pipeline
        .transcribe_segment(&store, "jNQXAC9IVRw", 0, ModelTier::Tiny, true)
        .await
        .unwrap();
    assert!(report.replayed);
    assert_eq!(offline_downloader.calls(), 0);
    let segment = store.fetch_segment("jNQXAC9IVRw", 0).unwrap().unwrap();
    assert_eq!(segment.transcription, "second pass text");
}

#[tokio::test]
async fn store_backed_failure_marks_the_segment_failed() {
    let downloader = FakeDownloader::new(DownloadMode::FailExit, &[]);
    let recognizer = FakeRecognizer::new(RecognizeMode::WriteTranscript, "unused");
    let h = harness().with_tools(downloader, recognizer);
    let store = h.setup_store();

    let err = h
        .pipeline
        .transcribe_segment(&store, "jNQXAC9IVRw", 0, ModelTier::Tiny, false)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Acquire(_)));

    let segment = store.fetch_segment("jNQXAC9IVRw", 0).unwrap().unwrap();
    assert_eq!(segment.status, SegmentStatus::Failed);
    assert_eq!(segment.failure_count, 1);

    // The persisted failure enables a retry claim.
    assert!(store.claim_segment("jNQXAC9IVRw", 0, false).is_ok());
}

#[tokio::test]
async fn in_flight_segment_rejects_a_second_run() {
    let downloader = FakeDownloader::new(DownloadMode::WriteFile, AUDIO_BYTES);
    let recognizer = FakeRecognizer::new(RecognizeMode::WriteTranscript, "unused");
    let h = harness().with_tools(downloader.clone(), recognizer);
    let store = h.setup_store();

    store.claim_segment("jNQXAC9IVRw", 0, false).unwrap();
    let err = h
        .pipeline
        .transcribe_segment(&store, "jNQXAC9IVRw", 0, ModelTier::Tiny, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Segment(SegmentError::AlreadyProcessing { .. })
    ));
    // The rejected run touched neither tool nor scratch space.
    assert_eq!(downloader.calls(), 0);
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn clear_audio_policy_drops_the_stored_copy() {
    let downloader = FakeDownloader::new(DownloadMode::WriteFile, AUDIO_BYTES);
    let recognizer = FakeRecognizer::new(RecognizeMode::WriteTranscript, "ephemeral audio");
    let h = harness().with_tools(downloader, recognizer);
    let store = h.setup_store();

    let pipeline = h.pipeline.clone().with_policy(StoragePolicy {
        require_encoded_audio: false,
        clear_audio_after_transcription: true,
    });
    let report = pipeline
        .transcribe_segment(&store, "jNQXAC9IVRw", 0, ModelTier::Tiny, false)
        .await
        .unwrap();
    assert!(!report.audio_persisted);

    let segment = store.fetch_segment("jNQXAC9IVRw", 0).unwrap().unwrap();
    assert!(!segment.has_stored_audio());
    assert_eq!(segment.transcription, "ephemeral audio");
}

#[tokio::test]
async fn sweep_all_empties_scratch_and_work_residue() {
    let h = harness();
    h.plant_cache_residue();
    // Orphaned run directory from a crashed process.
    let orphan = h.pipeline.scratch().begin_run("orphan").unwrap();
    std::fs::write(orphan.allocate("audio.mp3"), b"stale").unwrap();
    std::mem::forget(orphan);

    let (scratch_removed, caches_removed) = h.pipeline.sweep_all();
    assert_eq!(scratch_removed, 1);
    assert_eq!(caches_removed, 1);
    assert_eq!(h.scratch_entries(), 0);
    assert!(h.work_dir.join("notes.txt").exists());
}
