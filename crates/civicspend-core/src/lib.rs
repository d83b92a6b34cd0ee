pub mod config;
pub mod month;
pub mod schema;
pub mod stats;
pub mod types;
pub mod vendor_name;

pub use config::{
    EvidenceConfig, MlConfig, PipelineConfig, RobustConfig, ScoreSeverityBands,
    ZSeverityBreakpoints,
};
pub use month::{MonthParseError, YearMonth};
pub use schema::features;
pub use types::{
    Anomaly, DetectorKind, EvidenceItem, MonthlyAggregate, RawAward, Run, RunStatus, Severity,
    VendorContext, VendorEntity,
};
pub use vendor_name::{normalize_vendor_name, similarity_ratio};
