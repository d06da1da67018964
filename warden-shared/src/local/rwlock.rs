use super::ticket::{PendingTicket, TicketId, TicketKind, TicketOwner, TicketQueue};
use crate::exception::{WardenError, WardenResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Which side wins when both readers and writers are queued
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RwPriority {
    /// Readers are admitted while no writer holds the lock; writers can starve
    #[default]
    Reader,
    /// A queued writer blocks new readers; readers can starve
    Writer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RwLockStats {
    pub readers: usize,
    pub writer_active: bool,
    pub queued_readers: usize,
    pub queued_writers: usize,
    pub priority: RwPriority,
}

#[derive(Debug, Default)]
struct RwState {
    readers: usize,
    writer: bool,
    read_queue: TicketQueue,
    write_queue: TicketQueue,
}

impl RwState {
    fn wake_readers(&mut self) -> bool {
        let woken = self.read_queue.grant_all();
        self.readers += woken;
        woken > 0
    }

    fn wake_writer(&mut self) -> bool {
        self.writer = self.write_queue.grant_next();
        self.writer
    }
}

#[derive(Debug)]
struct RwInner {
    priority: RwPriority,
    state: Mutex<RwState>,
    next_ticket: AtomicU64,
}

impl RwInner {
    fn lock_state(&self) -> MutexGuard<'_, RwState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_read(&self) -> bool {
        let mut state = self.lock_state();
        if state.readers == 0 {
            return false;
        }
        state.readers -= 1;
        if state.readers == 0 && !state.wake_writer() {
            state.wake_readers();
        }
        true
    }

    fn release_write(&self) -> bool {
        let mut state = self.lock_state();
        if !state.writer {
            return false;
        }
        state.writer = false;
        match self.priority {
            RwPriority::Writer => {
                if !state.wake_writer() {
                    state.wake_readers();
                }
            }
            RwPriority::Reader => {
                // every queued reader at once, they do not exclude each other
                if !state.wake_readers() {
                    state.wake_writer();
                }
            }
        }
        true
    }
}

impl TicketOwner for RwInner {
    fn withdraw(&self, kind: TicketKind, id: TicketId) -> bool {
        let mut state = self.lock_state();
        match kind {
            TicketKind::Write => {
                if !state.write_queue.remove(id) {
                    return false;
                }
                // readers held back only by this writer may go now
                if self.priority == RwPriority::Writer
                    && state.write_queue.is_empty()
                    && !state.writer
                {
                    state.wake_readers();
                }
                true
            }
            TicketKind::Read | TicketKind::Exclusive => state.read_queue.remove(id),
        }
    }

    fn forfeit(&self, kind: TicketKind) {
        match kind {
            TicketKind::Write => self.release_write(),
            TicketKind::Read | TicketKind::Exclusive => self.release_read(),
        };
    }
}

/// In-process reader/writer lock with FIFO queues per side and a
/// configurable priority. Clones share the same lock.
#[derive(Debug, Clone)]
pub struct ReadWriteLock {
    inner: Arc<RwInner>,
}

impl Default for ReadWriteLock {
    fn default() -> Self {
        Self::new(RwPriority::default())
    }
}

impl ReadWriteLock {
    pub fn new(priority: RwPriority) -> Self {
        Self {
            inner: Arc::new(RwInner {
                priority,
                state: Mutex::new(RwState::default()),
                next_ticket: AtomicU64::new(0),
            }),
        }
    }

    pub fn priority(&self) -> RwPriority {
        self.inner.priority
    }

    pub async fn acquire_read(&self, timeout: Option<Duration>) -> bool {
        let ticket = {
            let mut state = self.inner.lock_state();
            let writer_waiting =
                self.inner.priority == RwPriority::Writer && !state.write_queue.is_empty();
            if !state.writer && !writer_waiting {
                state.readers += 1;
                return true;
            }
            let (sender, receiver) = oneshot::channel();
            let id = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
            state.read_queue.push(id, sender);
            PendingTicket::new(self.inner.clone(), TicketKind::Read, id, receiver)
        };
        ticket.wait(timeout).await
    }

    pub async fn acquire_write(&self, timeout: Option<Duration>) -> bool {
        let ticket = {
            let mut state = self.inner.lock_state();
            if !state.writer && state.readers == 0 {
                state.writer = true;
                return true;
            }
            let (sender, receiver) = oneshot::channel();
            let id = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
            state.write_queue.push(id, sender);
            debug!(
                "Writer queued behind {} readers (writer active: {})",
                state.readers, state.writer
            );
            PendingTicket::new(self.inner.clone(), TicketKind::Write, id, receiver)
        };
        ticket.wait(timeout).await
    }

    pub fn release_read(&self) -> bool {
        let released = self.inner.release_read();
        if !released {
            warn!("Read release without readers ignored");
        }
        released
    }

    pub fn release_write(&self) -> bool {
        let released = self.inner.release_write();
        if !released {
            warn!("Write release without an active writer ignored");
        }
        released
    }

    pub async fn read(&self, timeout: Option<Duration>) -> Option<ReadGuard> {
        self.acquire_read(timeout)
            .await
            .then(|| ReadGuard { lock: self.clone() })
    }

    pub async fn write(&self, timeout: Option<Duration>) -> Option<WriteGuard> {
        self.acquire_write(timeout)
            .await
            .then(|| WriteGuard { lock: self.clone() })
    }

    pub async fn with_read_lock<T, F, Fut>(&self, timeout: Option<Duration>, f: F) -> WardenResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WardenResult<T>>,
    {
        let _guard = self
            .read(timeout)
            .await
            .ok_or_else(|| WardenError::timeout("read lock acquire"))?;
        f().await
    }

    pub async fn with_write_lock<T, F, Fut>(&self, timeout: Option<Duration>, f: F) -> WardenResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WardenResult<T>>,
    {
        let _guard = self
            .write(timeout)
            .await
            .ok_or_else(|| WardenError::timeout("write lock acquire"))?;
        f().await
    }

    pub fn stats(&self) -> RwLockStats {
        let state = self.inner.lock_state();
        RwLockStats {
            readers: state.readers,
            writer_active: state.writer,
            queued_readers: state.read_queue.len(),
            queued_writers: state.write_queue.len(),
            priority: self.inner.priority,
        }
    }
}

#[derive(Debug)]
pub struct ReadGuard {
    lock: ReadWriteLock,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.lock.inner.release_read();
    }
}

#[derive(Debug)]
pub struct WriteGuard {
    lock: ReadWriteLock,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.lock.inner.release_write();
    }
}
