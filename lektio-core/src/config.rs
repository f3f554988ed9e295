use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LektioConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub limits: LimitsSection,
}

impl LektioConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub data_dir: String,
    pub scratch_dir: String,
    pub work_dir: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub span_gap_tolerance_s: f64,
    pub min_segment_duration_s: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub download: DownloadSection,
    pub recognition: RecognitionSection,
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSection {
    pub tool: String,
    pub audio_format: String,
    pub audio_quality: String,
    pub source_host: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionSection {
    pub tool: String,
    pub language: String,
    pub default_model: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub require_encoded_audio: bool,
    pub clear_audio_after_transcription: bool,
}

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub lektio: LektioConfig,
    pub pipeline: PipelineConfig,
}

impl ConfigBundle {
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let lektio = load_lektio_config(dir.join("lektio.toml"))?;
        let pipeline = load_pipeline_config(dir.join("pipeline.toml"))?;
        Ok(Self { lektio, pipeline })
    }
}

pub fn load_lektio_config<P: AsRef<Path>>(path: P) -> Result<LektioConfig> {
    load_toml(path)
}

pub fn load_pipeline_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_configs() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
        let bundle = ConfigBundle::from_directory(dir).expect("configs should parse");
        assert_eq!(bundle.lektio.system.node_name, "lektio-primary");
        assert_eq!(bundle.pipeline.download.tool, "yt-dlp");
        assert_eq!(bundle.pipeline.recognition.default_model, "tiny");
        assert!(!bundle.pipeline.storage.require_encoded_audio);
    }

    #[test]
    fn resolve_path_keeps_absolute_paths() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
        let config = load_lektio_config(dir.join("lektio.toml")).unwrap();
        assert_eq!(
            config.resolve_path("/tmp/audio.mp3"),
            PathBuf::from("/tmp/audio.mp3")
        );
        assert_eq!(
            config.resolve_path("scratch"),
            Path::new(&config.paths.base_dir).join("scratch")
        );
    }
}
