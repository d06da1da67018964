pub mod compensation;
pub mod config;
pub mod deadlock;
pub mod distributed;
pub mod error_handling;
pub mod escalation;
pub mod exception;
pub mod kv;
pub mod local;
pub mod metrics;
pub mod optimistic;
pub mod pessimistic;
pub mod relational;

pub use exception::*;

// Re-export the lock primitives
pub use compensation::{CompensableOperation, CompensatingTransaction, CompensationState, RollbackReport};
pub use config::{ConfigDefaults, WardenConfig};
pub use deadlock::{DeadlockAnalysis, DeadlockDetector, DeadlockRetryConfig, DeadlockRetryPolicy};
pub use distributed::{
    AcquireOptions, DistributedLockManager, DistributedMutex, DistributedSemaphore, RedlockCoordinator,
    RedlockLease,
};
pub use escalation::{EscalationConfig, EscalationRecommendation, LockEscalationMonitor};
pub use local::{LocalMutex, ReadWriteLock, RwPriority};
pub use optimistic::{OptimisticLockConfig, OptimisticUpdateOptions, VersionedRecordStore};
pub use pessimistic::{RowLockBatch, RowLockConfig, RowLockCoordinator, RowLockOptions};

// Re-export the store boundaries
pub use kv::{InMemoryKvStore, KvStore};
pub use relational::{
    InMemoryDatabase, LockWait, RelationalStore, RowFilter, RowLockMode, StoreTransaction, TableLockMode,
    VersionedRecord,
};
