//! In-process locking primitives built on FIFO queues of wait tickets

pub mod mutex;
pub mod rwlock;
mod ticket;

pub use mutex::{LocalMutex, LocalMutexGuard};
pub use rwlock::{ReadGuard, ReadWriteLock, RwLockStats, RwPriority, WriteGuard};
