//! Waiter queue for blocked borrowers
//!
//! Each parked borrow holds a one-shot handoff slot. Returning tasks hand
//! objects directly into the head waiter's slot instead of the idle store,
//! preserving arrival order and avoiding a thundering herd; destroys send a
//! `Retry` wake so a waiter can claim the freed capacity.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::object::PooledObject;

/// What a parked borrower receives.
pub(crate) enum Handoff<T> {
    /// A live idle object, bypassing the idle store.
    Object(Arc<PooledObject<T>>),
    /// Capacity was freed by a destroy; re-run the borrow loop.
    Retry,
    /// The pool closed while the borrower was parked.
    Closed,
}

struct Waiter<T> {
    seq: u64,
    tx: oneshot::Sender<Handoff<T>>,
}

/// FIFO queue of parked borrows.
pub(crate) struct WaitQueue<T> {
    queue: VecDeque<Waiter<T>>,
    next_seq: u64,
}

impl<T> WaitQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Park a new waiter at the tail. Returns its ticket and handoff slot.
    pub(crate) fn enqueue(&mut self) -> (u64, oneshot::Receiver<Handoff<T>>) {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back(Waiter { seq, tx });
        (seq, rx)
    }

    /// Remove a waiter by ticket (timeout or cancellation). Idempotent.
    pub(crate) fn remove(&mut self, seq: u64) -> bool {
        let before = self.queue.len();
        self.queue.retain(|w| w.seq != seq);
        self.queue.len() != before
    }

    /// Hand an object to the head waiter. Dead slots (cancelled waiters that
    /// have not unregistered yet) are discarded along the way. Returns the
    /// object back if no live waiter accepted it.
    pub(crate) fn offer(&mut self, object: Arc<PooledObject<T>>) -> Option<Arc<PooledObject<T>>> {
        let mut object = object;
        while let Some(waiter) = self.queue.pop_front() {
            match waiter.tx.send(Handoff::Object(object)) {
                Ok(()) => return None,
                Err(Handoff::Object(back)) => object = back,
                Err(_) => unreachable!("send returns the value it was given"),
            }
        }
        Some(object)
    }

    /// Wake the head waiter with a retry signal. Returns whether a live
    /// waiter was woken.
    pub(crate) fn wake_retry(&mut self) -> bool {
        while let Some(waiter) = self.queue.pop_front() {
            if waiter.tx.send(Handoff::Retry).is_ok() {
                return true;
            }
        }
        false
    }

    /// Notify every waiter that the pool closed.
    pub(crate) fn close_all(&mut self) {
        for waiter in self.queue.drain(..) {
            let _ = waiter.tx.send(Handoff::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(id: u64) -> Arc<PooledObject<u32>> {
        Arc::new(PooledObject::new(id, 0, 0))
    }

    #[test]
    fn offer_serves_in_arrival_order() {
        let mut q: WaitQueue<u32> = WaitQueue::new();
        let (_, mut rx1) = q.enqueue();
        let (_, mut rx2) = q.enqueue();

        assert!(q.offer(obj(1)).is_none());
        assert!(q.offer(obj(2)).is_none());

        match rx1.try_recv().unwrap() {
            Handoff::Object(o) => assert_eq!(o.id(), 1),
            _ => panic!("expected object"),
        }
        match rx2.try_recv().unwrap() {
            Handoff::Object(o) => assert_eq!(o.id(), 2),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn offer_skips_dead_waiters() {
        let mut q: WaitQueue<u32> = WaitQueue::new();
        let (_, rx1) = q.enqueue();
        let (_, mut rx2) = q.enqueue();
        drop(rx1);

        assert!(q.offer(obj(7)).is_none());
        match rx2.try_recv().unwrap() {
            Handoff::Object(o) => assert_eq!(o.id(), 7),
            _ => panic!("expected object"),
        }
        assert!(q.is_empty());
    }

    #[test]
    fn offer_returns_object_when_no_waiters() {
        let mut q: WaitQueue<u32> = WaitQueue::new();
        let back = q.offer(obj(3)).expect("no waiters");
        assert_eq!(back.id(), 3);
    }

    #[test]
    fn remove_is_idempotent_and_preserves_order() {
        let mut q: WaitQueue<u32> = WaitQueue::new();
        let (s1, _rx1) = q.enqueue();
        let (_s2, mut rx2) = q.enqueue();
        assert!(q.remove(s1));
        assert!(!q.remove(s1));

        assert!(q.offer(obj(9)).is_none());
        assert!(matches!(rx2.try_recv().unwrap(), Handoff::Object(_)));
    }

    #[test]
    fn wake_retry_skips_dead_waiters() {
        let mut q: WaitQueue<u32> = WaitQueue::new();
        let (_, rx1) = q.enqueue();
        let (_, mut rx2) = q.enqueue();
        drop(rx1);

        assert!(q.wake_retry());
        assert!(matches!(rx2.try_recv().unwrap(), Handoff::Retry));
        assert!(!q.wake_retry());
    }

    #[test]
    fn close_all_notifies_everyone() {
        let mut q: WaitQueue<u32> = WaitQueue::new();
        let (_, mut rx1) = q.enqueue();
        let (_, mut rx2) = q.enqueue();
        q.close_all();
        assert!(matches!(rx1.try_recv().unwrap(), Handoff::Closed));
        assert!(matches!(rx2.try_recv().unwrap(), Handoff::Closed));
        assert!(q.is_empty());
    }
}
