/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The per-actor message queue.
//!
//! A mailbox pairs an unbounded lock-free queue with an atomic state
//! word used by schedulers to park idle actors:
//!
//! * `Active`: the owner is running or queued for execution.
//! * `Blocked`: the owner observed an empty queue and parked itself.
//!   Any producer that pushes into a blocked mailbox flips it back to
//!   `Active` and is then responsible for resubmitting the owner to
//!   the scheduler.
//! * `Closed`: terminal; set by the owner during exit.
//!
//! The producer side is multi-producer; `try_pop`, `try_block`, and
//! `close` are owner-only operations.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use crossbeam_queue::SegQueue;

use crate::message::Envelope;

const ACTIVE: u8 = 0;
const BLOCKED: u8 = 1;
const CLOSED: u8 = 2;

/// The outcome of an enqueue attempt.
#[derive(Debug)]
pub enum EnqueueResult {
    /// The envelope was queued.
    Enqueued,
    /// The envelope was queued into a blocked mailbox; the caller must
    /// resubmit the owning actor to the scheduler.
    Unblocked,
    /// The mailbox is closed; the envelope is handed back so the caller
    /// can apply the bounce policy.
    DroppedClosed(Envelope),
}

/// An unbounded MPSC queue with a parking sentinel.
pub struct Mailbox {
    queue: SegQueue<Envelope>,
    state: AtomicU8,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    /// Create an empty, active mailbox.
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            state: AtomicU8::new(ACTIVE),
        }
    }

    /// Append an envelope. May be called from any thread.
    pub fn enqueue(&self, env: Envelope) -> EnqueueResult {
        if self.state.load(Ordering::Acquire) == CLOSED {
            return EnqueueResult::DroppedClosed(env);
        }
        self.queue.push(env);
        match self
            .state
            .compare_exchange(BLOCKED, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => EnqueueResult::Unblocked,
            Err(CLOSED) => {
                // Lost the race against close(): the owner may already
                // have drained. Pull one envelope back out so nothing
                // is marooned; under concurrent producers this may be a
                // different envelope, which is equally in need of a
                // bounce.
                match self.queue.pop() {
                    Some(env) => EnqueueResult::DroppedClosed(env),
                    None => EnqueueResult::Enqueued,
                }
            }
            Err(_) => EnqueueResult::Enqueued,
        }
    }

    /// Pop the next envelope. Owner only.
    pub fn try_pop(&self) -> Option<Envelope> {
        self.queue.pop()
    }

    /// Attempt the `Active` to `Blocked` transition. Owner only, and
    /// only after observing an empty queue. Fails (returning `false`)
    /// when a producer slipped an envelope in between the emptiness
    /// check and the transition.
    pub fn try_block(&self) -> bool {
        if !self.queue.is_empty() {
            return false;
        }
        if self
            .state
            .compare_exchange(ACTIVE, BLOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self.queue.is_empty() {
            return true;
        }
        // A producer pushed between the emptiness check and the CAS.
        // Whoever wins the unblock CAS owns the wakeup; if the producer
        // won, it will resubmit us, so we still report success here and
        // park.
        self.state
            .compare_exchange(BLOCKED, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
    }

    /// Close the mailbox and drain it. Owner only; terminal. The
    /// drained envelopes are returned for the caller's bounce policy.
    pub fn close(&self) -> Vec<Envelope> {
        self.state.store(CLOSED, Ordering::Release);
        let mut drained = Vec::new();
        while let Some(env) = self.queue.pop() {
            drained.push(env);
        }
        drained
    }

    /// Tells whether the mailbox has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    /// Tells whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::message::Message;
    use crate::message::MessageId;
    use crate::reference::ActorAddress;

    fn env(tag: u64) -> Envelope {
        Envelope::new(
            ActorAddress::invalid(),
            ActorAddress::invalid(),
            MessageId::ASYNC,
            crate::msg![tag],
        )
    }

    fn tag(env: &Envelope) -> u64 {
        env.message.get::<u64>(0).unwrap()
    }

    #[test]
    fn test_fifo_single_producer() {
        let mbox = Mailbox::new();
        for i in 0..100u64 {
            assert!(matches!(mbox.enqueue(env(i)), EnqueueResult::Enqueued));
        }
        for i in 0..100u64 {
            assert_eq!(tag(&mbox.try_pop().unwrap()), i);
        }
        assert!(mbox.try_pop().is_none());
    }

    #[test]
    fn test_block_unblock() {
        let mbox = Mailbox::new();
        assert!(mbox.try_block());
        assert!(matches!(mbox.enqueue(env(1)), EnqueueResult::Unblocked));
        // Already unblocked; further enqueues are plain.
        assert!(matches!(mbox.enqueue(env(2)), EnqueueResult::Enqueued));
        assert_eq!(tag(&mbox.try_pop().unwrap()), 1);
    }

    #[test]
    fn test_block_fails_when_nonempty() {
        let mbox = Mailbox::new();
        mbox.enqueue(env(1));
        assert!(!mbox.try_block());
    }

    #[test]
    fn test_closed_rejects() {
        let mbox = Mailbox::new();
        mbox.enqueue(env(1));
        let drained = mbox.close();
        assert_eq!(drained.len(), 1);
        assert!(matches!(
            mbox.enqueue(env(2)),
            EnqueueResult::DroppedClosed(_)
        ));
        assert!(mbox.is_closed());
    }

    // Property 3 from the block/wake contract: under concurrent
    // enqueues and block attempts, every message is eventually
    // observed and each unblock is claimed by exactly one side.
    #[test]
    fn test_block_wake_race() {
        let mbox = Arc::new(Mailbox::new());
        let wakeups = Arc::new(AtomicUsize::new(0));
        let n = 10_000u64;

        let producer = {
            let mbox = Arc::clone(&mbox);
            let wakeups = Arc::clone(&wakeups);
            std::thread::spawn(move || {
                for i in 0..n {
                    if let EnqueueResult::Unblocked = mbox.enqueue(env(i)) {
                        wakeups.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        };

        let mut seen = 0u64;
        while seen < n {
            match mbox.try_pop() {
                Some(e) => {
                    assert_eq!(tag(&e), seen);
                    seen += 1;
                }
                None => {
                    if mbox.try_block() {
                        // Parked: spin until a producer wakes us. In
                        // the real scheduler the producer resubmits the
                        // actor; here we emulate by watching the state.
                        while mbox.state.load(Ordering::Acquire) == BLOCKED {
                            std::hint::spin_loop();
                        }
                    }
                }
            }
        }
        producer.join().unwrap();
        assert!(mbox.try_pop().is_none());
    }
}
