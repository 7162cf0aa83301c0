pub mod payout_processor;
pub mod retry_scheduler;

pub use payout_processor::{JobOutcome, PayoutProcessor, PayoutProcessorConfig};
pub use retry_scheduler::{RetryPolicy, RetryScheduler, RetrySchedulerConfig};
