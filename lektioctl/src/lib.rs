use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;

use lektio_core::pipeline::{PipelineError, SegmentRunReport, TranscriptionPipeline};
use lektio_core::recognize::ModelTier;
use lektio_core::{
    load_lektio_config, load_pipeline_config, ConfigBundle, SegmentStatus, SqliteSegmentStore,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] lektio_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("segment store error: {0}")]
    Store(#[from] lektio_core::SegmentError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Lektio transcription pipeline control interface", long_about = None)]
pub struct Cli {
    /// Path to the main lektio.toml
    #[arg(long, default_value = "configs/lektio.toml")]
    pub config: PathBuf,
    /// Alternate path to pipeline.toml
    #[arg(long)]
    pub pipeline_config: Option<PathBuf>,
    /// Alternate path to segments.sqlite
    #[arg(long)]
    pub segments_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show store counters and scratch usage
    Status,
    /// Segment store queries
    #[command(subcommand)]
    Segment(SegmentCommands),
    /// Run the full pipeline for one segment and persist the result
    Transcribe(TranscribeArgs),
    /// Transcribe from stored audio without touching the network or the store
    Replay(ReplayArgs),
    /// Remove scratch artifacts and leftover download caches
    Sweep,
    /// Run integrity checks
    #[command(name = "health")]
    #[command(subcommand)]
    Health(HealthCommands),
}

#[derive(Subcommand, Debug)]
pub enum SegmentCommands {
    /// List segment transcriptions
    List(SegmentListArgs),
    /// Show one segment in full
    Show(SegmentShowArgs),
}

#[derive(Args, Debug)]
pub struct SegmentListArgs {
    /// Filter by status (pending, processing, completed, failed)
    #[arg(long)]
    pub status: Option<String>,
    /// Maximum rows returned
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct SegmentShowArgs {
    #[arg(long)]
    pub video_id: String,
    #[arg(long)]
    pub segment: i64,
}

#[derive(Args, Debug)]
pub struct TranscribeArgs {
    #[arg(long)]
    pub video_id: String,
    #[arg(long)]
    pub segment: i64,
    /// Model tier override (tiny, base, small, medium, large)
    #[arg(long)]
    pub model: Option<String>,
    /// Allow re-running a completed segment
    #[arg(long, default_value_t = false)]
    pub rerun: bool,
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    #[arg(long)]
    pub video_id: String,
    #[arg(long)]
    pub segment: i64,
    #[arg(long)]
    pub model: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum HealthCommands {
    /// Run basic checks
    Check,
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Status => {
            let status = context.gather_status()?;
            render(&status, cli.format)?;
        }
        Commands::Segment(SegmentCommands::List(args)) => {
            let list = context.segment_list(args)?;
            render(&list, cli.format)?;
        }
        Commands::Segment(SegmentCommands::Show(args)) => {
            let detail = context.segment_show(args)?;
            render(&detail, cli.format)?;
        }
        Commands::Transcribe(args) => {
            let report = context.transcribe(args).await?;
            render(&report, cli.format)?;
        }
        Commands::Replay(args) => {
            let report = context.replay(args).await?;
            render(&report, cli.format)?;
        }
        Commands::Sweep => {
            let report = context.sweep()?;
            render(&report, cli.format)?;
        }
        Commands::Health(HealthCommands::Check) => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    bundle: ConfigBundle,
    config_path: PathBuf,
    pipeline_path: PathBuf,
    segments_db: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let lektio = load_lektio_config(&config_path)?;

        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let pipeline_path = cli
            .pipeline_config
            .clone()
            .unwrap_or_else(|| config_dir.join("pipeline.toml"));
        let pipeline = load_pipeline_config(&pipeline_path)?;

        let segments_db = cli
            .segments_db
            .clone()
            .unwrap_or_else(|| PathBuf::from(&lektio.paths.data_dir).join("segments.sqlite"));

        Ok(Self {
            bundle: ConfigBundle { lektio, pipeline },
            config_path,
            pipeline_path,
            segments_db,
        })
    }

    fn pipeline(&self) -> Result<TranscriptionPipeline> {
        Ok(TranscriptionPipeline::new(
            &self.bundle.pipeline,
            &self.bundle.lektio,
        )?)
    }

    fn store(&self) -> Result<SqliteSegmentStore> {
        if let Some(parent) = self.segments_db.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = SqliteSegmentStore::new(&self.segments_db)?;
        store.initialize()?;
        Ok(store)
    }

    fn model_tier(&self, requested: Option<&str>) -> Result<ModelTier> {
        let label = requested.unwrap_or(&self.bundle.pipeline.recognition.default_model);
        label
            .parse::<ModelTier>()
            .map_err(AppError::InvalidArgument)
    }

    fn gather_status(&self) -> Result<StatusReport> {
        let segment_counts = self.segment_counts().unwrap_or_default();
        let videos = self.video_count().unwrap_or(0);
        let scratch_dir = self
            .bundle
            .lektio
            .resolve_path(&self.bundle.lektio.paths.scratch_dir);
        let scratch_entries = std::fs::read_dir(&scratch_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        Ok(StatusReport {
            node_name: self.bundle.lektio.system.node_name.clone(),
            environment: self.bundle.lektio.system.environment.clone(),
            videos,
            segment_counts,
            scratch_entries,
        })
    }

    fn segment_list(&self, args: &SegmentListArgs) -> Result<SegmentList> {
        let status = match args.status.as_deref() {
            Some(raw) => Some(
                raw.parse::<SegmentStatus>()
                    .map_err(AppError::InvalidArgument)?,
            ),
            None => None,
        };
        let store = self.store()?;
        let rows = store
            .list_by_status(status, args.limit)?
            .into_iter()
            .map(|segment| SegmentEntry {
                video_id: segment.video_id.clone(),
                segment_index: segment.segment_index,
                status: segment.status.to_string(),
                span: format!("{:.1}s..{:.1}s", segment.start_s, segment.end_s),
                failure_count: segment.failure_count,
                has_audio: segment.has_stored_audio(),
                transcribed_at: segment.transcribed_at.map(|ts| ts.to_rfc3339()),
            })
            .collect();
        Ok(SegmentList { rows })
    }

    fn segment_show(&self, args: &SegmentShowArgs) -> Result<SegmentDetail> {
        let store = self.store()?;
        let segment = store
            .fetch_segment(&args.video_id, args.segment)?
            .ok_or_else(|| {
                AppError::MissingResource(format!(
                    "segment {} of video {} not found",
                    args.segment, args.video_id
                ))
            })?;
        Ok(SegmentDetail {
            video_id: segment.video_id.clone(),
            segment_index: segment.segment_index,
            status: segment.status.to_string(),
            start_s: segment.start_s,
            end_s: segment.end_s,
            words: segment.transcription.split_whitespace().count(),
            failure_count: segment.failure_count,
            has_audio: segment.has_stored_audio(),
            audio_sha256: segment.audio_sha256.clone(),
            transcribed_at: segment.transcribed_at.map(|ts| ts.to_rfc3339()),
            transcription: segment.transcription,
        })
    }

    async fn transcribe(&self, args: &TranscribeArgs) -> Result<SegmentRunReport> {
        let tier = self.model_tier(args.model.as_deref())?;
        let store = self.store()?;
        let pipeline = self.pipeline()?;
        let report = pipeline
            .transcribe_segment(&store, &args.video_id, args.segment, tier, args.rerun)
            .await?;
        Ok(report)
    }

    async fn replay(&self, args: &ReplayArgs) -> Result<ReplayReport> {
        let tier = self.model_tier(args.model.as_deref())?;
        let store = self.store()?;
        let segment = store
            .fetch_segment(&args.video_id, args.segment)?
            .ok_or_else(|| {
                AppError::MissingResource(format!(
                    "segment {} of video {} not found",
                    args.segment, args.video_id
                ))
            })?;
        let encoded = segment.audio_data.as_deref().filter(|data| !data.is_empty());
        let Some(encoded) = encoded else {
            return Err(AppError::MissingResource(format!(
                "segment {} of video {} has no stored audio",
                args.segment, args.video_id
            )));
        };
        let pipeline = self.pipeline()?;
        let transcription = pipeline
            .run_from_encoded(encoded, &args.video_id, tier)
            .await?;
        Ok(ReplayReport {
            video_id: args.video_id.clone(),
            segment_index: args.segment,
            words: transcription.split_whitespace().count(),
            transcription,
        })
    }

    fn sweep(&self) -> Result<SweepReport> {
        let pipeline = self.pipeline()?;
        let (scratch_removed, caches_removed) = pipeline.sweep_all();
        Ok(SweepReport {
            scratch_removed,
            caches_removed,
        })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(check_path("lektio.toml", &self.config_path));
        results.push(check_path("pipeline.toml", &self.pipeline_path));
        results.push(check_database("segments.sqlite", &self.segments_db));

        let lektio = &self.bundle.lektio;
        results.push(check_directory(
            "scratch",
            &lektio.resolve_path(&lektio.paths.scratch_dir),
        ));
        results.push(check_directory(
            "work",
            &lektio.resolve_path(&lektio.paths.work_dir),
        ));
        results.push(check_binary(
            "download tool",
            &self.bundle.pipeline.download.tool,
        ));
        results.push(check_binary(
            "recognition tool",
            &self.bundle.pipeline.recognition.tool,
        ));
        results
    }

    fn segment_counts(&self) -> Option<HashMap<String, i64>> {
        let conn = open_read_only(&self.segments_db).ok()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM segment_transcriptions GROUP BY status")
            .ok()?;
        let mut map = HashMap::new();
        for row in stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .ok()?
        {
            if let Ok((status, count)) = row {
                map.insert(status, count);
            }
        }
        Some(map)
    }

    fn video_count(&self) -> Option<i64> {
        let conn = open_read_only(&self.segments_db).ok()?;
        conn.query_row("SELECT COUNT(*) FROM videos", [], |row| row.get(0))
            .ok()
    }
}

fn open_read_only(path: &Path) -> Result<Connection> {
    if !path.exists() {
        return Err(AppError::MissingResource(format!(
            "database missing: {}",
            path.display()
        )));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    Ok(conn)
}

fn check_path(name: &str, path: &Path) -> HealthEntry {
    if path.exists() {
        HealthEntry::ok(name, format!("{}", path.display()))
    } else {
        HealthEntry::error(name, format!("{} missing", path.display()))
    }
}

fn check_directory(name: &str, path: &Path) -> HealthEntry {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
        Ok(_) => HealthEntry::warn(name, format!("{} is not a directory", path.display())),
        Err(_) => HealthEntry::warn(name, format!("{} not found", path.display())),
    }
}

fn check_binary(name: &str, program: &str) -> HealthEntry {
    let candidate = Path::new(program);
    if candidate.is_absolute() {
        return if candidate.exists() {
            HealthEntry::ok(name, program.to_string())
        } else {
            HealthEntry::error(name, format!("{program} missing"))
        };
    }
    let found = std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
        })
        .unwrap_or(false);
    if found {
        HealthEntry::ok(name, format!("{program} found on PATH"))
    } else {
        HealthEntry::error(name, format!("{program} not found on PATH"))
    }
}

fn check_database(name: &str, path: &Path) -> HealthEntry {
    if !path.exists() {
        return HealthEntry::warn(name, format!("{} not found", path.display()));
    }
    match open_read_only(path) {
        Ok(conn) => {
            let pragma: rusqlite::Result<String> =
                conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
            match pragma {
                Ok(result) if result.to_lowercase() == "ok" => {
                    HealthEntry::ok(name, "integrity ok".to_string())
                }
                Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                Err(err) => HealthEntry::warn(name, format!("error: {err}")),
            }
        }
        Err(err) => HealthEntry::error(name, format!("failed to open: {err}")),
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub node_name: String,
    pub environment: String,
    pub videos: i64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub segment_counts: HashMap<String, i64>,
    pub scratch_entries: usize,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Node: {} (env: {})",
            self.node_name, self.environment
        )];
        lines.push(format!("Videos: {}", self.videos));
        if !self.segment_counts.is_empty() {
            lines.push("Segments:".to_string());
            for (status, count) in self.segment_counts.iter() {
                lines.push(format!("  - {status}: {count}"));
            }
        }
        lines.push(format!("Scratch entries: {}", self.scratch_entries));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SegmentList {
    pub rows: Vec<SegmentEntry>,
}

#[derive(Debug, Serialize)]
pub struct SegmentEntry {
    pub video_id: String,
    pub segment_index: i64,
    pub status: String,
    pub span: String,
    pub failure_count: i64,
    pub has_audio: bool,
    pub transcribed_at: Option<String>,
}

impl DisplayFallback for SegmentList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No segments found".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            lines.push(format!(
                "{}#{} | status={} | span={} | failures={} | audio={}",
                entry.video_id,
                entry.segment_index,
                entry.status,
                entry.span,
                entry.failure_count,
                if entry.has_audio { "stored" } else { "-" },
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SegmentDetail {
    pub video_id: String,
    pub segment_index: i64,
    pub status: String,
    pub start_s: f64,
    pub end_s: f64,
    pub words: usize,
    pub failure_count: i64,
    pub has_audio: bool,
    pub audio_sha256: Option<String>,
    pub transcribed_at: Option<String>,
    pub transcription: String,
}

impl DisplayFallback for SegmentDetail {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("{}#{}", self.video_id, self.segment_index),
            format!("status: {}", self.status),
            format!("span: {:.1}s..{:.1}s", self.start_s, self.end_s),
            format!("words: {}", self.words),
            format!("failures: {}", self.failure_count),
            format!(
                "audio: {}",
                if self.has_audio { "stored" } else { "absent" }
            ),
        ];
        if let Some(ts) = &self.transcribed_at {
            lines.push(format!("transcribed at: {ts}"));
        }
        if !self.transcription.is_empty() {
            lines.push(String::new());
            lines.push(self.transcription.clone());
        }
        lines.join("\n")
    }
}

impl DisplayFallback for SegmentRunReport {
    fn display(&self) -> String {
        format!(
            "{}#{} {} ({} words, {}, audio {})",
            self.video_id,
            self.segment_index,
            self.status,
            self.words,
            if self.replayed {
                "replayed from stored audio"
            } else {
                "fresh download"
            },
            if self.audio_persisted {
                "persisted"
            } else {
                "not persisted"
            },
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub video_id: String,
    pub segment_index: i64,
    pub words: usize,
    pub transcription: String,
}

impl DisplayFallback for ReplayReport {
    fn display(&self) -> String {
        format!(
            "{}#{} replayed ({} words)\n\n{}",
            self.video_id, self.segment_index, self.words, self.transcription
        )
    }
}

#[derive(Debug, Serialize)]
pub struct SweepReport {
    pub scratch_removed: usize,
    pub caches_removed: usize,
}

impl DisplayFallback for SweepReport {
    fn display(&self) -> String {
        format!(
            "Removed {} scratch entries and {} leftover cache files",
            self.scratch_removed, self.caches_removed
        )
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name} — {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}
