pub mod backup;
pub mod classifier;
pub mod clock;
pub mod retention;
pub mod transfer;

pub use backup::{BackupOrchestrator, BackupReport, CleanupReport, RotationReport, TierReport};
pub use clock::{Clock, FixedClock, SystemClock};
pub use transfer::TransferPipeline;
