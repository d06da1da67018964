//! Deadlock handling: wait-for-graph detection and retry of deadlocked work

pub mod detector;
pub mod retry;

pub use detector::{DeadlockCycle, DeadlockDetector, WaitForEdge};
pub use retry::{
    is_deadlock_error, is_deadlock_message, DeadlockAnalysis, DeadlockRetryConfig,
    DeadlockRetryPolicy,
};
