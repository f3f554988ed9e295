pub mod error;
pub mod models;
pub mod store;

pub use error::{SegmentError, SegmentResult};
pub use models::{
    SegmentEvent, SegmentMetrics, SegmentSpan, SegmentStatus, SegmentTranscription,
    TransitionRejected, VideoRecord,
};
pub use store::{SpanRules, SqliteSegmentStore, SqliteSegmentStoreBuilder};
