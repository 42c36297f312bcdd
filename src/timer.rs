/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The timer service.
//!
//! One long-lived thread owns a priority queue keyed by absolute
//! deadline. Its only input is "deliver this envelope after this
//! delay"; due entries re-enter the ordinary send path. There is no
//! cancellation: a request that expects a response bounds the wait with
//! a response-frame timeout instead, and a timeout whose frame is
//! already gone dispatches as an unmatched response, which the actor
//! drops.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use crossbeam_channel::unbounded;
use parking_lot::Mutex;

use crate::actor::deliver;
use crate::message::Envelope;

enum TimerMsg {
    Schedule { deadline: Instant, env: Envelope },
    Shutdown,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    env: Envelope,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the soonest deadline
        // (then lowest sequence number) surfaces first.
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

/// Handle to the timer thread.
pub struct Timer {
    tx: Sender<TimerMsg>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Timer {
    /// Start the timer thread.
    pub fn start() -> Self {
        let (tx, rx) = unbounded();
        let thread = thread::Builder::new()
            .name("spindle-timer".to_string())
            .spawn(move || run(rx))
            .expect("failed to spawn timer thread");
        Self {
            tx,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Deliver `env` after `delay`.
    pub fn schedule(&self, delay: Duration, env: Envelope) {
        let _ = self.tx.send(TimerMsg::Schedule {
            deadline: Instant::now() + delay,
            env,
        });
    }

    /// Stop the timer thread, dropping whatever has not yet come due.
    /// Idempotent.
    pub fn shutdown(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = self.tx.send(TimerMsg::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(rx: Receiver<TimerMsg>) {
    let mut heap: BinaryHeap<TimerEntry> = BinaryHeap::new();
    let mut seq = 0u64;
    loop {
        // Fire everything that is due before sleeping again.
        let now = Instant::now();
        while heap.peek().is_some_and(|e| e.deadline <= now) {
            let entry = heap.pop().unwrap();
            deliver(entry.env);
        }

        let msg = match heap.peek() {
            Some(next) => {
                let wait = next.deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match rx.recv() {
                Ok(msg) => msg,
                Err(_) => return,
            },
        };
        match msg {
            TimerMsg::Schedule { deadline, env } => {
                seq += 1;
                heap.push(TimerEntry { deadline, seq, env });
            }
            TimerMsg::Shutdown => return,
        }
    }
}
