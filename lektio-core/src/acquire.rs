use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DownloadSection;
use crate::temp::RunScratch;
use crate::tool::{ExternalTool, SystemTool};

pub type AcquireResult<T> = Result<T, AcquireError>;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("invalid video id {video_id:?}: {reason}")]
    InvalidVideoId { video_id: String, reason: String },
    #[error("download tool failed with status {status:?}")]
    ToolFailed { status: Option<i32> },
    #[error("download tool exited cleanly but produced no file at {path}")]
    OutputMissing { path: PathBuf },
    #[error("failed to spawn download tool: {source}")]
    Spawn { source: std::io::Error },
}

/// Fetches the audio track of a remote video into the run's scratch
/// directory by driving the external download tool.
#[derive(Clone)]
pub struct AudioFetcher {
    tool: Arc<dyn ExternalTool>,
    audio_format: String,
    audio_quality: String,
    source_host: String,
}

impl AudioFetcher {
    pub fn from_config(config: &DownloadSection, work_dir: impl Into<PathBuf>) -> Self {
        let tool = SystemTool::new(
            &config.tool,
            Duration::from_secs(config.timeout_seconds),
        )
        .with_work_dir(work_dir);
        Self::with_tool(Arc::new(tool), config)
    }

    pub fn with_tool(tool: Arc<dyn ExternalTool>, config: &DownloadSection) -> Self {
        Self {
            tool,
            audio_format: config.audio_format.clone(),
            audio_quality: config.audio_quality.clone(),
            source_host: config.source_host.clone(),
        }
    }

    /// Downloads audio-only media for `video_id`. The output path is derived
    /// from the video id inside the run scratch directory; the tool writes
    /// nothing useful anywhere else except its own cache residue, which the
    /// orchestrator sweeps separately.
    pub async fn fetch(&self, run: &RunScratch, video_id: &str) -> AcquireResult<PathBuf> {
        let output_path = run.allocate(format!("{video_id}.{}", self.audio_format));
        let watch_url = self.watch_url(video_id)?;

        info!(video_id, url = %watch_url, "downloading audio track");
        let args = vec![
            "-x".to_string(),
            "--audio-format".to_string(),
            self.audio_format.clone(),
            "--audio-quality".to_string(),
            self.audio_quality.clone(),
            "-o".to_string(),
            output_path.to_string_lossy().to_string(),
            watch_url.to_string(),
        ];
        let output = self
            .tool
            .invoke(&args)
            .await
            .map_err(|source| AcquireError::Spawn { source })?;

        if !output.stdout.trim().is_empty() {
            debug!(tool = %self.tool.describe(), stdout = %output.stdout.trim(), "download tool output");
        }
        if !output.success() {
            if !output.stderr.trim().is_empty() {
                warn!(tool = %self.tool.describe(), stderr = %output.stderr.trim(), "download tool reported errors");
            }
            return Err(AcquireError::ToolFailed {
                status: output.status,
            });
        }
        let metadata = match std::fs::metadata(&output_path) {
            Ok(metadata) => metadata,
            Err(_) => {
                return Err(AcquireError::OutputMissing { path: output_path });
            }
        };
        info!(
            video_id,
            size_mb = format!("{:.2}", metadata.len() as f64 / (1024.0 * 1024.0)),
            "audio downloaded"
        );
        Ok(output_path)
    }

    fn watch_url(&self, video_id: &str) -> AcquireResult<Url> {
        if video_id.is_empty()
            || !video_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AcquireError::InvalidVideoId {
                video_id: video_id.to_string(),
                reason: "expected an alphanumeric watch id".to_string(),
            });
        }
        let mut url = Url::parse(&format!("https://{}/watch", self.source_host)).map_err(|err| {
            AcquireError::InvalidVideoId {
                video_id: video_id.to_string(),
                reason: err.to_string(),
            }
        })?;
        url.query_pairs_mut().append_pair("v", video_id);
        Ok(url)
    }
}
