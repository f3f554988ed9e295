use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RecognitionSection;
use crate::temp::RunScratch;
use crate::tool::{ExternalTool, SystemTool};

pub type RecognizeResult<T> = Result<T, RecognizeError>;

#[derive(Debug, Error)]
pub enum RecognizeError {
    #[error("recognition tool failed with status {status:?}")]
    ToolFailed { status: Option<i32> },
    #[error("recognition tool exited cleanly but wrote no transcript at {path}")]
    ArtifactMissing { path: PathBuf },
    #[error("recognition produced an empty transcript for {path}")]
    EmptyTranscript { path: PathBuf },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to spawn recognition tool: {source}")]
    Spawn { source: std::io::Error },
}

/// Model size selector passed through to the recognition tool. Larger tiers
/// trade speed for accuracy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Tiny => "tiny",
            ModelTier::Base => "base",
            ModelTier::Small => "small",
            ModelTier::Medium => "medium",
            ModelTier::Large => "large",
        }
    }
}

impl Default for ModelTier {
    fn default() -> Self {
        ModelTier::Tiny
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tiny" => Ok(ModelTier::Tiny),
            "base" => Ok(ModelTier::Base),
            "small" => Ok(ModelTier::Small),
            "medium" => Ok(ModelTier::Medium),
            "large" => Ok(ModelTier::Large),
            other => Err(format!("unknown model tier: {other}")),
        }
    }
}

/// Produces plain text from a local audio file by driving the external
/// speech-recognition tool.
#[derive(Clone)]
pub struct SpeechRecognizer {
    tool: Arc<dyn ExternalTool>,
    language: String,
}

impl SpeechRecognizer {
    pub fn from_config(config: &RecognitionSection) -> Self {
        let tool = SystemTool::new(
            &config.tool,
            Duration::from_secs(config.timeout_seconds),
        );
        Self::with_tool(Arc::new(tool), config)
    }

    pub fn with_tool(tool: Arc<dyn ExternalTool>, config: &RecognitionSection) -> Self {
        Self {
            tool,
            language: config.language.clone(),
        }
    }

    /// Transcribes `audio_path`, writing the tool's transcript artifact into
    /// the run scratch directory. The artifact is read, trimmed and removed
    /// before returning; run-level cleanup never sees it.
    pub async fn transcribe(
        &self,
        run: &RunScratch,
        audio_path: &Path,
        tier: ModelTier,
    ) -> RecognizeResult<String> {
        info!(audio = %audio_path.display(), model = %tier, "starting transcription");
        let args = vec![
            audio_path.to_string_lossy().to_string(),
            "--model".to_string(),
            tier.as_str().to_string(),
            "--language".to_string(),
            self.language.clone(),
            "--output_format".to_string(),
            "txt".to_string(),
            "--output_dir".to_string(),
            run.dir().to_string_lossy().to_string(),
            "--verbose".to_string(),
            "False".to_string(),
        ];
        let output = self
            .tool
            .invoke(&args)
            .await
            .map_err(|source| RecognizeError::Spawn { source })?;
        if !output.success() {
            if !output.stderr.trim().is_empty() {
                warn!(tool = %self.tool.describe(), stderr = %output.stderr.trim(), "recognition tool reported errors");
            }
            return Err(RecognizeError::ToolFailed {
                status: output.status,
            });
        }

        let artifact = self.artifact_path(run, audio_path);
        if !artifact.exists() {
            return Err(RecognizeError::ArtifactMissing { path: artifact });
        }
        let raw = std::fs::read_to_string(&artifact).map_err(|source| RecognizeError::Io {
            path: artifact.clone(),
            source,
        })?;
        // The tool's own transient output is swept immediately, independent
        // of the run-level cleanup.
        if let Err(err) = std::fs::remove_file(&artifact) {
            warn!(path = %artifact.display(), error = %err, "failed to remove transcript artifact");
        }

        let transcription = raw.trim().to_string();
        if transcription.is_empty() {
            return Err(RecognizeError::EmptyTranscript {
                path: audio_path.to_path_buf(),
            });
        }
        debug!(
            words = transcription.split_whitespace().count(),
            characters = transcription.len(),
            "transcription complete"
        );
        Ok(transcription)
    }

    fn artifact_path(&self, run: &RunScratch, audio_path: &Path) -> PathBuf {
        let stem = audio_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        run.allocate(format!("{stem}.txt"))
    }
}
