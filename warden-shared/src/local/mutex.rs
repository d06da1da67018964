use super::ticket::{PendingTicket, TicketId, TicketKind, TicketOwner, TicketQueue};
use crate::exception::{WardenError, WardenResult};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct MutexState {
    locked: bool,
    queue: TicketQueue,
}

#[derive(Debug, Default)]
struct MutexInner {
    state: Mutex<MutexState>,
    next_ticket: AtomicU64,
}

impl MutexInner {
    fn lock_state(&self) -> MutexGuard<'_, MutexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the lock to the next waiter, or unlock when nobody waits
    fn release(&self) -> bool {
        let mut state = self.lock_state();
        if !state.locked {
            return false;
        }
        if !state.queue.grant_next() {
            state.locked = false;
        }
        true
    }
}

impl TicketOwner for MutexInner {
    fn withdraw(&self, _kind: TicketKind, id: TicketId) -> bool {
        self.lock_state().queue.remove(id)
    }

    fn forfeit(&self, _kind: TicketKind) {
        self.release();
    }
}

/// In-process exclusive lock with a FIFO queue of waiters.
///
/// `release` hands ownership straight to the oldest waiter, so the lock is
/// never observed free while someone is queued. Clones share the same lock.
#[derive(Debug, Clone, Default)]
pub struct LocalMutex {
    inner: Arc<MutexInner>,
}

impl LocalMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock; `false` when `timeout` elapses first
    pub async fn acquire(&self, timeout: Option<Duration>) -> bool {
        let ticket = {
            let mut state = self.inner.lock_state();
            if !state.locked {
                state.locked = true;
                return true;
            }
            let (sender, receiver) = oneshot::channel();
            let id = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
            state.queue.push(id, sender);
            debug!("Mutex busy, queued ticket {} ({} waiting)", id, state.queue.len());
            PendingTicket::new(self.inner.clone(), TicketKind::Exclusive, id, receiver)
        };
        ticket.wait(timeout).await
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.inner.lock_state();
        if state.locked {
            false
        } else {
            state.locked = true;
            true
        }
    }

    /// Release the lock; `false` if it was not held
    pub fn release(&self) -> bool {
        let released = self.inner.release();
        if !released {
            warn!("Release of an unlocked mutex ignored");
        }
        released
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock_state().locked
    }

    pub fn queue_length(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    /// Acquire and return a guard that releases on drop
    pub async fn lock(&self, timeout: Option<Duration>) -> Option<LocalMutexGuard> {
        self.acquire(timeout).await.then(|| LocalMutexGuard {
            mutex: self.clone(),
        })
    }

    /// Run `f` while holding the lock; released on every exit path
    pub async fn with_lock<T, F, Fut>(&self, timeout: Option<Duration>, f: F) -> WardenResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WardenResult<T>>,
    {
        let _guard = self
            .lock(timeout)
            .await
            .ok_or_else(|| WardenError::timeout("local mutex acquire"))?;
        f().await
    }
}

/// Holds a [`LocalMutex`] until dropped
#[derive(Debug)]
pub struct LocalMutexGuard {
    mutex: LocalMutex,
}

impl Drop for LocalMutexGuard {
    fn drop(&mut self) {
        self.mutex.inner.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uncontended_acquire_release() {
        let mutex = LocalMutex::new();
        assert!(mutex.acquire(None).await);
        assert!(mutex.is_locked());
        assert!(!mutex.try_acquire());
        assert!(mutex.release());
        assert!(!mutex.is_locked());
        assert!(!mutex.release());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_hand_off() {
        let mutex = LocalMutex::new();
        assert!(mutex.acquire(None).await);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for name in ["first", "second"] {
            let mutex = mutex.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                assert!(mutex.acquire(None).await);
                order.lock().unwrap().push(name);
                mutex.release();
            }));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(mutex.queue_length(), 2);

        mutex.release();
        // handed over, never observed free
        assert!(mutex.is_locked());
        assert!(!mutex.try_acquire());

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert!(!mutex.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_ticket() {
        let mutex = LocalMutex::new();
        assert!(mutex.acquire(None).await);

        assert!(!mutex.acquire(Some(Duration::from_millis(50))).await);
        assert_eq!(mutex.queue_length(), 0);

        mutex.release();
        assert!(!mutex.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_leaves_queue() {
        let mutex = LocalMutex::new();
        assert!(mutex.acquire(None).await);

        let waiter = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.acquire(None).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(mutex.queue_length(), 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(mutex.queue_length(), 0);
        mutex.release();
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let mutex = LocalMutex::new();
        let result: WardenResult<()> = mutex
            .with_lock(None, || async { Err(WardenError::internal("boom")) })
            .await;
        assert!(result.is_err());
        assert!(!mutex.is_locked());

        let value = mutex.with_lock(None, || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
