//! Locks and permits coordinated through shared key-value stores

pub mod lock_manager;
pub mod mutex;
pub mod redlock;
pub mod semaphore;

pub use lock_manager::{AcquireOptions, DistributedLockManager, LockManagerConfig, LockRecord};
pub use mutex::{DistributedMutex, DistributedMutexConfig};
pub use redlock::{RedlockConfig, RedlockCoordinator, RedlockLease};
pub use semaphore::{DistributedSemaphore, Permit, SemaphoreConfig};
