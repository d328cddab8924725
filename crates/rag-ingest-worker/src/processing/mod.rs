//! Message processing: dedup guard, per-message pipeline, retry policy and
//! the worker pool that drives them

mod consumer;
mod dedup;
mod pipeline;
mod retry;

pub use consumer::{ConsumptionLoop, LoopStats, StatsSnapshot};
pub use dedup::{Claim, ClaimOutcome, DedupGuard, ExistingClaim};
pub use pipeline::{
    Disposition, JobPipeline, Outcome, PipelineError, PipelineSettings, SkipReason,
};
pub use retry::{AttemptTracker, RetryPolicy};
