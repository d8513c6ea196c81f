/// Scan orchestration, confidence scoring and path reconstruction
pub mod confidence;
pub mod context;
pub mod directory;
pub mod engine;

pub use confidence::{calculate_confidence_score, ConfidenceTier, RecordIntegrity};
pub use context::{CancelFlag, ParserProgress, ScanContext, ScanOptions};
pub use directory::DirectoryTree;
pub use engine::{RecoveryEngine, ScanProgress, ScanReport, ScanStage};
