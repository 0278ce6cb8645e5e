pub mod change_filter;
pub mod dedup;
pub mod scheduler;
pub mod shaping;

pub use change_filter::ChangeFilter;
pub use dedup::{partition, KnownRecordSet, Partition};
pub use scheduler::{CycleReport, IngestionScheduler, SchedulerState, Step, SymbolOutcome};
pub use shaping::{middle_window, shape_snapshot, ShapedSnapshot};
