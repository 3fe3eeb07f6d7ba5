pub mod execution;
pub mod fetch_task;
pub mod job;
pub mod metrics;

// Store collections.
pub const FETCH_TASKS: &str = "fetch_tasks";
pub const BATCH_EXECUTIONS: &str = "batch_executions";
pub const JOBS: &str = "jobs";
pub const FETCH_METRICS: &str = "fetch_metrics";
pub const ENRICHMENT_METRICS: &str = "enrichment_metrics";
