pub mod intervals;
pub mod pipeline;
pub mod policy;
pub mod staleness;
pub mod timestamps;

pub use intervals::{definition_for, IntervalDefinition, IntervalKind};
pub use pipeline::{BackupPipeline, RunRecord};
pub use policy::RetentionPolicy;
pub use staleness::{IntervalReport, StalenessEngine};
pub use timestamps::{Resolution, SourceMode, TimestampResolver};
