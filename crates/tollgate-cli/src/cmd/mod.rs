pub mod config;
pub mod merge_ready;
pub mod queue;
pub mod reconcile;
