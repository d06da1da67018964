//! Cancellable FIFO wait tickets shared by the in-process primitives.
//!
//! A waiter parks on the receiving half of a oneshot channel. Granting a
//! ticket happens under the primitive's state lock, so a waiter that gives up
//! either removes its still-queued ticket or finds the grant already in its
//! channel and hands it back.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

pub(crate) type TicketId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TicketKind {
    Exclusive,
    Read,
    Write,
}

#[derive(Debug, Default)]
pub(crate) struct TicketQueue {
    waiters: VecDeque<(TicketId, oneshot::Sender<()>)>,
}

impl TicketQueue {
    pub(crate) fn push(&mut self, id: TicketId, sender: oneshot::Sender<()>) {
        self.waiters.push_back((id, sender));
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Grant the oldest ticket whose waiter is still listening
    pub(crate) fn grant_next(&mut self) -> bool {
        while let Some((_, sender)) = self.waiters.pop_front() {
            if sender.send(()).is_ok() {
                return true;
            }
        }
        false
    }

    /// Grant every queued ticket, returning how many were delivered
    pub(crate) fn grant_all(&mut self) -> usize {
        self.waiters
            .drain(..)
            .filter(|(_, sender)| !sender.is_closed())
            .map(|(_, sender)| sender.send(()))
            .filter(Result::is_ok)
            .count()
    }

    /// Remove a ticket that is still queued
    pub(crate) fn remove(&mut self, id: TicketId) -> bool {
        match self.waiters.iter().position(|(queued, _)| *queued == id) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }
}

/// The primitive a ticket was issued by
pub(crate) trait TicketOwner: Send + Sync {
    /// Remove a queued ticket; false once it has been granted
    fn withdraw(&self, kind: TicketKind, id: TicketId) -> bool;

    /// Give back a grant whose waiter has gone away
    fn forfeit(&self, kind: TicketKind);
}

pub(crate) struct PendingTicket {
    owner: Arc<dyn TicketOwner>,
    kind: TicketKind,
    id: TicketId,
    receiver: oneshot::Receiver<()>,
    settled: bool,
}

impl PendingTicket {
    pub(crate) fn new(
        owner: Arc<dyn TicketOwner>,
        kind: TicketKind,
        id: TicketId,
        receiver: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            owner,
            kind,
            id,
            receiver,
            settled: false,
        }
    }

    /// Wait for the grant. On timeout the ticket leaves the queue.
    pub(crate) async fn wait(mut self, timeout: Option<Duration>) -> bool {
        let granted = match timeout {
            None => (&mut self.receiver).await.is_ok(),
            Some(limit) => match tokio::time::timeout(limit, &mut self.receiver).await {
                Ok(result) => result.is_ok(),
                // granted between the deadline and the withdrawal
                Err(_) if !self.owner.withdraw(self.kind, self.id) => {
                    self.receiver.try_recv().is_ok()
                }
                Err(_) => false,
            },
        };
        self.settled = true;
        granted
    }
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        if self.settled || self.owner.withdraw(self.kind, self.id) {
            return;
        }
        if self.receiver.try_recv().is_ok() {
            self.owner.forfeit(self.kind);
        }
    }
}
