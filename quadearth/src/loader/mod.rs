//! Tile loading.
//!
//! - [`policy`]: retry and priority types
//! - [`queue`]: admission queue ordered by priority then node id
//! - [`scheduler`]: dedupe, bounded concurrency, retry, timeout and cancellation

mod policy;
mod queue;
mod scheduler;

pub use policy::{
    Priority, RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_DELAY,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
};
pub use queue::FetchQueue;
pub use scheduler::{
    CompletionOutcome, FetchCompletion, FetchError, FetchRequest, FetchScheduler, RequestState,
    SchedulerConfig, SubmitOutcome, DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_CONCURRENT,
};
