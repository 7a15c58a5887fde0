pub mod dispatcher;
pub mod engine;
pub mod planner;
pub mod scheduler;
pub mod transfer;

pub use dispatcher::{
    work_fn, ProgressSink, TransferDispatcher, TransferJob, TransferStatus, WorkFn,
};
pub use engine::SyncEngine;
pub use planner::{
    normalize_remote_root, CompareConfig, ConflictMode, DiffPlanner, FileComparator,
    PlannedItem, SyncDecision,
};
pub use scheduler::{due_in, PassReport, SchedulerState, SyncScheduler};
