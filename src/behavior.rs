/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Behaviors and the per-actor behavior stack.
//!
//! A behavior is one message-handling function. Each actor owns a stack
//! of `(behavior, expected_response_id)` frames: the topmost
//! asynchronous frame (no response id) handles incoming asynchronous
//! messages, while response frames are looked up by the response id
//! they await. Erased frames are parked in a side list until
//! [`BehaviorStack::cleanup`] so their captures are not dropped while
//! the stack is being walked.

use std::time::Duration;

use crate::actor::Context;
use crate::message::MessageId;

/// The outcome of one behavior invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handled {
    /// The message was consumed.
    Done,
    /// The behavior does not match this message; the dispatcher buffers
    /// it and replays it on the next behavior change.
    Skipped,
}

/// A message-handling function over actor state `S`.
pub struct Behavior<S> {
    f: Box<dyn FnMut(&mut S, &mut Context<'_, S>) -> anyhow::Result<Handled> + Send>,
}

impl<S> Behavior<S> {
    /// Wrap a handler function.
    pub fn new(
        f: impl FnMut(&mut S, &mut Context<'_, S>) -> anyhow::Result<Handled> + Send + 'static,
    ) -> Self {
        Self { f: Box::new(f) }
    }

    pub(crate) fn invoke(
        &mut self,
        state: &mut S,
        ctx: &mut Context<'_, S>,
    ) -> anyhow::Result<Handled> {
        (self.f)(state, ctx)
    }
}

/// Shorthand for [`Behavior::new`].
pub fn behavior<S>(
    f: impl FnMut(&mut S, &mut Context<'_, S>) -> anyhow::Result<Handled> + Send + 'static,
) -> Behavior<S> {
    Behavior::new(f)
}

pub(crate) struct Frame<S> {
    pub(crate) behavior: Behavior<S>,
    /// `None` for asynchronous frames; otherwise the response id this
    /// frame awaits, unique within one actor.
    pub(crate) response_id: Option<MessageId>,
    /// Response frames may carry a timeout registered with the timer
    /// service at installation time.
    pub(crate) timeout: Option<Duration>,
}

/// The ordered frame stack of one actor.
pub struct BehaviorStack<S> {
    frames: Vec<Frame<S>>,
    erased: Vec<Frame<S>>,
}

impl<S> Default for BehaviorStack<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> BehaviorStack<S> {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            erased: Vec::new(),
        }
    }

    /// Append a frame.
    pub fn push(
        &mut self,
        behavior: Behavior<S>,
        response_id: Option<MessageId>,
        timeout: Option<Duration>,
    ) {
        debug_assert!(
            response_id.is_none() || self.find_sync_handler(response_id.unwrap()).is_none(),
            "duplicate response frame"
        );
        self.frames.push(Frame {
            behavior,
            response_id,
            timeout,
        });
    }

    /// Remove the topmost asynchronous frame, if any.
    pub fn pop_async_back(&mut self) {
        if let Some(idx) = self.top_async() {
            let frame = self.frames.remove(idx);
            self.erased.push(frame);
        }
    }

    /// Remove the unique frame awaiting `response_id`. No-op if absent.
    pub fn erase(&mut self, response_id: MessageId) {
        if let Some(idx) = self.find_sync_handler(response_id) {
            let frame = self.frames.remove(idx);
            self.erased.push(frame);
        }
    }

    /// The index of the frame awaiting `response_id`, if any.
    pub fn find_sync_handler(&self, response_id: MessageId) -> Option<usize> {
        self.frames
            .iter()
            .position(|f| f.response_id == Some(response_id))
    }

    /// The index of the topmost asynchronous frame, if any.
    pub fn top_async(&self) -> Option<usize> {
        self.frames.iter().rposition(|f| f.response_id.is_none())
    }

    /// Tells whether the stack holds no frames at all.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drop erased frames. Called between dispatches, never while the
    /// stack is being walked.
    pub fn cleanup(&mut self) {
        self.erased.clear();
    }

    pub(crate) fn frame_mut(&mut self, idx: usize) -> &mut Frame<S> {
        &mut self.frames[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Behavior<()> {
        behavior(|_, _| Ok(Handled::Done))
    }

    #[test]
    fn test_push_and_find() {
        let mut stack: BehaviorStack<()> = BehaviorStack::new();
        assert!(stack.is_empty());
        stack.push(noop(), None, None);
        let rid = MessageId::make_request(9).response_id();
        stack.push(noop(), Some(rid), None);

        assert_eq!(stack.top_async(), Some(0));
        assert_eq!(stack.find_sync_handler(rid), Some(1));
        assert_eq!(
            stack.find_sync_handler(MessageId::make_request(8).response_id()),
            None
        );
    }

    #[test]
    fn test_top_async_skips_sync_frames() {
        let mut stack: BehaviorStack<()> = BehaviorStack::new();
        stack.push(noop(), None, None);
        let rid = MessageId::make_request(1).response_id();
        stack.push(noop(), Some(rid), None);
        // The sync frame sits on top, but async dispatch still finds
        // the frame below it.
        assert_eq!(stack.top_async(), Some(0));
        stack.pop_async_back();
        assert_eq!(stack.top_async(), None);
        assert!(!stack.is_empty());
    }

    #[test]
    fn test_erase_is_deferred() {
        let mut stack: BehaviorStack<()> = BehaviorStack::new();
        let rid = MessageId::make_request(3).response_id();
        stack.push(noop(), Some(rid), None);
        stack.erase(rid);
        assert!(stack.is_empty());
        assert_eq!(stack.erased.len(), 1);
        stack.cleanup();
        assert!(stack.erased.is_empty());
        // Erasing an absent id is a no-op.
        stack.erase(rid);
        assert!(stack.erased.is_empty());
    }
}
