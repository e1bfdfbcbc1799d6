//! Admission gate in front of the single-capacity image backend.
//!
//! The gate bounds how many request pipelines hold a [`Ticket`] at once.
//! Arrival order is only reported back to callers ("N ahead of you"); the
//! underlying semaphore decides who runs next.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("queue is full ({depth} requests waiting or running, cap {cap})")]
    Saturated { depth: usize, cap: usize },
    #[error("admission gate is closed")]
    Closed,
}

#[derive(Debug)]
struct GateInner {
    permits: Option<Arc<Semaphore>>,
    max_concurrency: Option<usize>,
    held: AtomicUsize,
    depth: AtomicUsize,
    next_ticket: AtomicU64,
    closed: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

impl AdmissionGate {
    /// `max_concurrency <= 0` leaves the gate unbounded.
    pub fn new(max_concurrency: i64) -> Self {
        let max_concurrency = usize::try_from(max_concurrency)
            .ok()
            .filter(|max| *max > 0);
        Self {
            inner: Arc::new(GateInner {
                permits: max_concurrency.map(|max| Arc::new(Semaphore::new(max))),
                max_concurrency,
                held: AtomicUsize::new(0),
                depth: AtomicUsize::new(0),
                next_ticket: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        self.inner.max_concurrency
    }

    /// Number of tickets currently held.
    pub fn size(&self) -> usize {
        self.inner.held.load(Ordering::SeqCst)
    }

    /// Held tickets plus callers still waiting for one.
    pub fn queue_depth(&self) -> usize {
        self.inner.depth.load(Ordering::SeqCst)
    }

    /// Tickets handed out since the gate was created.
    pub fn tickets_issued(&self) -> u64 {
        self.inner.next_ticket.load(Ordering::SeqCst) - 1
    }

    /// Reserve a place in the queue, failing immediately when `hard_cap`
    /// (if positive) entries are already inside the gate.
    pub fn enter(&self, hard_cap: i64) -> Result<QueueEntry, GateError> {
        if self.is_closed() {
            return Err(GateError::Closed);
        }
        let cap = usize::try_from(hard_cap).ok().filter(|cap| *cap > 0);
        let ahead = self
            .inner
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| match cap {
                Some(cap) if depth >= cap => None,
                _ => Some(depth + 1),
            })
            .map_err(|depth| GateError::Saturated {
                depth,
                cap: cap.unwrap_or(usize::MAX),
            })?;
        Ok(QueueEntry {
            gate: self.inner.clone(),
            ahead,
            reserved: true,
        })
    }

    /// Wait for a ticket without a queue cap.
    pub async fn acquire(&self) -> Result<Ticket, GateError> {
        self.enter(0)?.acquire().await
    }

    /// Refuse new entries and wake every waiter with [`GateError::Closed`].
    /// Tickets already held stay valid until dropped.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(permits) = self.inner.permits.as_ref() {
            permits.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// A reserved place in the queue that has not been granted a ticket yet.
/// Dropping it (for example when the waiting task is cancelled) gives the
/// reservation back.
#[derive(Debug)]
pub struct QueueEntry {
    gate: Arc<GateInner>,
    ahead: usize,
    reserved: bool,
}

impl QueueEntry {
    /// Entries that were inside the gate when this one arrived.
    pub fn ahead(&self) -> usize {
        self.ahead
    }

    pub async fn acquire(mut self) -> Result<Ticket, GateError> {
        if self.gate.closed.load(Ordering::SeqCst) {
            return Err(GateError::Closed);
        }
        let permit = match self.gate.permits.clone() {
            Some(permits) => Some(
                permits
                    .acquire_owned()
                    .await
                    .map_err(|_| GateError::Closed)?,
            ),
            None => None,
        };
        self.gate.held.fetch_add(1, Ordering::SeqCst);
        let number = self.gate.next_ticket.fetch_add(1, Ordering::SeqCst);
        self.reserved = false;
        debug!(ticket = number, ahead = self.ahead, "admission ticket granted");
        Ok(Ticket {
            gate: self.gate.clone(),
            number,
            _permit: permit,
        })
    }
}

impl Drop for QueueEntry {
    fn drop(&mut self) {
        if self.reserved {
            self.gate.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// One unit of gate capacity. Released exactly once, on drop.
#[derive(Debug)]
pub struct Ticket {
    gate: Arc<GateInner>,
    number: u64,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Ticket {
    pub fn number(&self) -> u64 {
        self.number
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.gate.held.fetch_sub(1, Ordering::SeqCst);
        self.gate.depth.fetch_sub(1, Ordering::SeqCst);
        debug!(ticket = self.number, "admission ticket released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn never_grants_more_than_max_concurrency() {
        let gate = AdmissionGate::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..5 {
            let gate = gate.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let ticket = gate.acquire().await.expect("gate should be open");
                let _ = tx.send(ticket);
            });
        }
        drop(tx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut held = Vec::new();
        while let Ok(ticket) = rx.try_recv() {
            held.push(ticket);
        }
        assert_eq!(held.len(), 2);
        assert_eq!(gate.size(), 2);
        assert_eq!(gate.queue_depth(), 5);

        held.pop();
        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("a waiter should be admitted after a release")
            .expect("sender alive");
        held.push(next);
        assert_eq!(gate.size(), 2);
        assert_eq!(gate.queue_depth(), 4);
    }

    #[tokio::test]
    async fn ticket_is_released_when_protected_work_fails() {
        let gate = AdmissionGate::new(1);
        let before = gate.size();

        let result: Result<(), &str> = async {
            let _ticket = gate.acquire().await.map_err(|_| "closed")?;
            Err("backend exploded")
        }
        .await;

        assert!(result.is_err());
        assert_eq!(gate.size(), before);
        assert_eq!(gate.queue_depth(), 0);
    }

    #[tokio::test]
    async fn ticket_is_released_when_task_panics() {
        let gate = AdmissionGate::new(1);
        let worker = gate.clone();
        let joined = tokio::spawn(async move {
            let _ticket = worker.acquire().await.expect("gate should be open");
            panic!("pipeline panicked");
        })
        .await;

        assert!(joined.is_err());
        assert_eq!(gate.size(), 0);
        assert_eq!(gate.queue_depth(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_returns_its_reservation() {
        let gate = AdmissionGate::new(1);
        let _held = gate.acquire().await.expect("first ticket");

        let waited = tokio::time::timeout(Duration::from_millis(20), gate.acquire()).await;
        assert!(waited.is_err());
        assert_eq!(gate.size(), 1);
        assert_eq!(gate.queue_depth(), 1);
    }

    #[tokio::test]
    async fn hard_cap_rejects_without_queueing() {
        let gate = AdmissionGate::new(1);
        let first = gate.enter(2).expect("first entry");
        let second = gate.enter(2).expect("second entry");
        assert_eq!(first.ahead(), 0);
        assert_eq!(second.ahead(), 1);

        let err = gate.enter(2).expect_err("third entry should be rejected");
        assert_eq!(err, GateError::Saturated { depth: 2, cap: 2 });
        assert_eq!(gate.queue_depth(), 2);

        drop(second);
        assert_eq!(gate.queue_depth(), 1);
        let _ticket = first.acquire().await.expect("ticket");
        assert_eq!(gate.size(), 1);
    }

    #[tokio::test]
    async fn non_positive_max_is_unbounded() {
        let gate = AdmissionGate::new(0);
        assert_eq!(gate.max_concurrency(), None);
        let mut tickets = Vec::new();
        for _ in 0..16 {
            tickets.push(gate.acquire().await.expect("unbounded gate never blocks"));
        }
        assert_eq!(gate.size(), 16);
        tickets.clear();
        assert_eq!(gate.size(), 0);
    }

    #[tokio::test]
    async fn closing_wakes_waiters() {
        let gate = AdmissionGate::new(1);
        let held = gate.acquire().await.expect("first ticket");
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.close();

        let outcome = waiter.await.expect("waiter task should finish");
        assert_eq!(outcome, Err(GateError::Closed));
        assert!(matches!(gate.enter(0), Err(GateError::Closed)));
        drop(held);
        assert_eq!(gate.queue_depth(), 0);
    }

    #[tokio::test]
    async fn closing_an_unbounded_gate_refuses_entries() {
        let gate = AdmissionGate::new(0);
        let held = gate.acquire().await.expect("open gate");
        let reserved = gate.enter(0).expect("entry before close");
        gate.close();

        assert!(gate.is_closed());
        assert!(matches!(gate.enter(0), Err(GateError::Closed)));
        assert_eq!(reserved.acquire().await.map(|_| ()), Err(GateError::Closed));
        assert_eq!(gate.size(), 1);
        drop(held);
        assert_eq!(gate.size(), 0);
        assert_eq!(gate.queue_depth(), 0);
    }
}
