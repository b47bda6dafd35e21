mod prune_history;

pub use prune_history::{
    PruneHistoryContext, PruneHistoryJob, process_prune_history_job, prune_history_schedule,
};
