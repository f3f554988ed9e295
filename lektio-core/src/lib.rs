pub mod acquire;
pub mod audio_store;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod recognize;
pub mod segment;
pub mod sqlite;
pub mod temp;
pub mod tool;

pub use config::{
    load_lektio_config, load_pipeline_config, ConfigBundle, LektioConfig, PipelineConfig,
};
pub use error::{ConfigError, Result};
pub use segment::{
    SegmentError, SegmentMetrics, SegmentResult, SegmentSpan, SegmentStatus,
    SegmentTranscription, SpanRules, SqliteSegmentStore, SqliteSegmentStoreBuilder, VideoRecord,
};
