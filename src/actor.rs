/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Actors: per-actor state, dispatch, and lifecycle.
//!
//! [`ActorCell`] is the object seam shared by local actors and remote
//! proxies; addresses resolve to cells, and everything that delivers a
//! message goes through one. [`LocalActor`] owns a mailbox and a
//! behavior stack and implements [`Resumable`], so the scheduler can
//! drive it: each resume slice drains the mailbox until it can park the
//! actor (blocking the mailbox) or the actor finishes.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;

use crate::behavior::Behavior;
use crate::behavior::BehaviorStack;
use crate::behavior::Handled;
use crate::message::DownMsg;
use crate::message::Envelope;
use crate::message::ExitMsg;
use crate::message::ExitReason;
use crate::message::LinkMsg;
use crate::message::Message;
use crate::message::MessageId;
use crate::message::SyncExitedMsg;
use crate::message::TimeoutMsg;
use crate::message::Value;
use crate::reference::ActorAddress;
use crate::reference::ActorId;
use crate::reference::NodeId;
use crate::runtime::RuntimeCore;
use crate::scheduler::Resumable;
use crate::scheduler::Resumption;
use crate::scheduler::Worker;

/// A callback run when an actor exits, receiving the exit reason.
pub type ExitFunctor = Box<dyn FnOnce(ExitReason) + Send>;

/// The object seam shared by local actors and remote proxies.
///
/// Cells are owned strongly by the registry (local actors) or the
/// broker's namespace (proxies); addresses hold them weakly.
pub trait ActorCell: Send + Sync {
    /// The node hosting the actor.
    fn node(&self) -> NodeId;

    /// The actor's id on its node.
    fn id(&self) -> ActorId;

    /// The actor's address.
    fn address(&self) -> ActorAddress;

    /// Deliver an envelope. A delivery into a closed mailbox applies
    /// the bounce policy; a delivery that unparks the actor resubmits
    /// it to its scheduler.
    fn enqueue(&self, env: Envelope);

    /// Record a link from `peer`. Linking to an exited actor delivers
    /// the exit message immediately.
    fn link(&self, peer: ActorAddress);

    /// Dissolve a link from `peer`.
    fn unlink(&self, peer: &ActorAddress);

    /// Record a monitor by `observer`. Monitoring an exited actor
    /// delivers the down message immediately.
    fn monitor(&self, observer: ActorAddress);

    /// Remove a monitor by `observer`.
    fn demonitor(&self, observer: &ActorAddress);

    /// Run `f(reason)` at exit time, or immediately when the actor has
    /// already exited.
    fn attach_functor(&self, f: ExitFunctor);

    /// The exit reason; [`ExitReason::NotExited`] while alive.
    fn exit_reason(&self) -> ExitReason;
}

/// Bounce policy: a request whose target is gone answers the requester
/// with a synthetic [`SyncExitedMsg`] under the request's response id.
/// Non-requests are dropped silently.
pub(crate) fn bounce_request(env: &Envelope, reason: ExitReason) {
    if !env.mid.is_request() {
        return;
    }
    let reason = match reason {
        ExitReason::NotExited => ExitReason::Normal,
        other => other,
    };
    if let Some(requester) = env.sender.upgrade() {
        requester.enqueue(Envelope::new(
            ActorAddress::invalid(),
            env.sender.clone(),
            env.mid.response_id(),
            Message::new(vec![Value::SyncExited(SyncExitedMsg {
                source: env.receiver.clone(),
                reason,
            })]),
        ));
    }
}

/// Deliver an envelope along the ordinary send path: resolve the
/// receiver and enqueue, or bounce when the receiver is gone.
pub(crate) fn deliver(env: Envelope) {
    match env.receiver.upgrade() {
        Some(cell) => cell.enqueue(env),
        None => bounce_request(&env, ExitReason::Normal),
    }
}

/// A cell standing in for nothing. [`Weak`] handles of this type back
/// unresolved addresses; the type itself is never instantiated.
pub(crate) struct DeadCell;

impl ActorCell for DeadCell {
    fn node(&self) -> NodeId {
        NodeId::INVALID
    }

    fn id(&self) -> ActorId {
        ActorId::INVALID
    }

    fn address(&self) -> ActorAddress {
        ActorAddress::invalid()
    }

    fn enqueue(&self, env: Envelope) {
        bounce_request(&env, ExitReason::Normal);
    }

    fn link(&self, _peer: ActorAddress) {}

    fn unlink(&self, _peer: &ActorAddress) {}

    fn monitor(&self, _observer: ActorAddress) {}

    fn demonitor(&self, _observer: &ActorAddress) {}

    fn attach_functor(&self, f: ExitFunctor) {
        f(ExitReason::Normal);
    }

    fn exit_reason(&self) -> ExitReason {
        ExitReason::Normal
    }
}

struct ExitState {
    reason: ExitReason,
    functors: Vec<ExitFunctor>,
}

/// The non-generic part of a local actor, shared with its contexts.
pub(crate) struct ActorShared {
    pub(crate) node: NodeId,
    pub(crate) id: ActorId,
    pub(crate) mailbox: crate::mailbox::Mailbox,
    links: Mutex<HashSet<ActorAddress>>,
    monitors: Mutex<HashSet<ActorAddress>>,
    exit: Mutex<ExitState>,
    trap_exit: AtomicBool,
    pub(crate) core: Arc<RuntimeCore>,
    pub(crate) self_cell: OnceLock<Weak<dyn ActorCell>>,
    pub(crate) self_job: OnceLock<Weak<dyn Resumable>>,
}

impl ActorShared {
    fn address(&self) -> ActorAddress {
        let cell = self
            .self_cell
            .get()
            .cloned()
            .unwrap_or_else(|| Weak::<DeadCell>::new() as Weak<dyn ActorCell>);
        ActorAddress::new(self.node, self.id, cell)
    }

    fn exit_reason(&self) -> ExitReason {
        self.exit.lock().reason
    }
}

type InitFn<S> = Box<dyn FnOnce(&mut S, &mut Context<'_, S>) -> Behavior<S> + Send>;

struct ActorBody<S> {
    state: S,
    stack: BehaviorStack<S>,
    /// Envelopes skipped by the current behavior, replayed in order on
    /// the next behavior change.
    cache: VecDeque<Envelope>,
    init: Option<InitFn<S>>,
}

/// A locally hosted actor over user state `S`.
pub struct LocalActor<S> {
    shared: ActorShared,
    body: Mutex<ActorBody<S>>,
}

/// Deferred behavior-stack mutations collected during one invocation
/// and applied when it returns. This keeps frame destructors from
/// running while the stack is being walked, and guarantees a request's
/// response frame is installed before control returns to the scheduler.
enum StackOp<S> {
    BecomeReplace(Behavior<S>),
    BecomePush(Behavior<S>),
    Unbecome,
    PushSync {
        rid: MessageId,
        behavior: Behavior<S>,
        timeout: Option<Duration>,
    },
    Quit(ExitReason),
}

/// The per-invocation context handed to behaviors.
pub struct Context<'a, S> {
    env: &'a Envelope,
    shared: &'a ActorShared,
    worker: Option<&'a Worker>,
    ops: &'a mut Vec<StackOp<S>>,
}

impl<'a, S: Send + 'static> Context<'a, S> {
    /// This actor's address.
    pub fn self_addr(&self) -> ActorAddress {
        self.shared.address()
    }

    /// The sender of the current message.
    pub fn sender(&self) -> &ActorAddress {
        &self.env.sender
    }

    /// The current message payload.
    pub fn message(&self) -> &Message {
        &self.env.message
    }

    /// The current message id.
    pub fn message_id(&self) -> MessageId {
        self.env.mid
    }

    /// The hosting node.
    pub fn node(&self) -> NodeId {
        self.shared.node
    }

    /// Send an asynchronous message.
    pub fn send(&self, target: &ActorAddress, message: Message) {
        self.shared.core.deliver(Envelope::new(
            self.self_addr(),
            target.clone(),
            MessageId::ASYNC,
            message,
        ));
    }

    /// Send a request and install a response frame for its answer. The
    /// frame is installed before control returns to the scheduler; a
    /// timeout, if given, delivers a [`TimeoutMsg`] under the awaited
    /// response id, which the handler must treat as the terminal
    /// response.
    pub fn request(
        &mut self,
        target: &ActorAddress,
        message: Message,
        timeout: Option<Duration>,
        handler: Behavior<S>,
    ) -> MessageId {
        let mid = MessageId::make_request(self.shared.core.next_correlation());
        self.shared.core.deliver(Envelope::new(
            self.self_addr(),
            target.clone(),
            mid,
            message,
        ));
        self.ops.push(StackOp::PushSync {
            rid: mid.response_id(),
            behavior: handler,
            timeout,
        });
        mid
    }

    /// Answer the current request. A no-op when the current message is
    /// not a request.
    pub fn reply(&self, message: Message) {
        if self.env.mid.is_request() {
            self.shared.core.deliver(Envelope::new(
                self.self_addr(),
                self.env.sender.clone(),
                self.env.mid.response_id(),
                message,
            ));
        }
    }

    /// Send `message` to `target` after `delay`.
    pub fn delayed_send(&self, target: &ActorAddress, delay: Duration, message: Message) {
        self.shared.core.timer.schedule(
            delay,
            Envelope::new(self.self_addr(), target.clone(), MessageId::ASYNC, message),
        );
    }

    /// Replace the topmost asynchronous behavior.
    pub fn become_(&mut self, behavior: Behavior<S>) {
        self.ops.push(StackOp::BecomeReplace(behavior));
    }

    /// Push a new asynchronous behavior, keeping the current one
    /// underneath.
    pub fn become_keep(&mut self, behavior: Behavior<S>) {
        self.ops.push(StackOp::BecomePush(behavior));
    }

    /// Remove the topmost asynchronous behavior. The actor finishes
    /// normally when the stack empties out.
    pub fn unbecome(&mut self) {
        self.ops.push(StackOp::Unbecome);
    }

    /// Terminate this actor with the given reason after the current
    /// invocation returns.
    pub fn quit(&mut self, reason: ExitReason) {
        self.ops.push(StackOp::Quit(reason));
    }

    /// Elect to receive non-normal exit messages as ordinary messages
    /// instead of dying with the propagated reason.
    pub fn trap_exit(&self, on: bool) {
        self.shared.trap_exit.store(on, Ordering::Release);
    }

    /// Spawn a new actor. The spawned actor is scheduled on the worker
    /// executing this one.
    pub fn spawn<T: Send + 'static>(
        &self,
        state: T,
        init: impl FnOnce(&mut T, &mut Context<'_, T>) -> Behavior<T> + Send + 'static,
    ) -> ActorAddress {
        RuntimeCore::spawn_actor(&self.shared.core, state, init, self.worker)
    }

    /// Spawn a new actor linked to this one. The link exists before
    /// the spawned actor runs, so even an immediate exit propagates.
    pub fn spawn_linked<T: Send + 'static>(
        &self,
        state: T,
        init: impl FnOnce(&mut T, &mut Context<'_, T>) -> Behavior<T> + Send + 'static,
    ) -> ActorAddress {
        let self_addr = self.self_addr();
        let addr =
            RuntimeCore::spawn_actor_watched(&self.shared.core, state, init, self.worker, |cell| {
                cell.link(self_addr);
            });
        self.shared.links.lock().insert(addr.clone());
        addr
    }

    /// Spawn a new actor monitored by this one.
    pub fn spawn_monitored<T: Send + 'static>(
        &self,
        state: T,
        init: impl FnOnce(&mut T, &mut Context<'_, T>) -> Behavior<T> + Send + 'static,
    ) -> ActorAddress {
        let self_addr = self.self_addr();
        RuntimeCore::spawn_actor_watched(&self.shared.core, state, init, self.worker, |cell| {
            cell.monitor(self_addr);
        })
    }

    /// Establish a bidirectional link with `peer`. If the peer has
    /// already exited, the exit message is delivered immediately.
    pub fn link_to(&self, peer: &ActorAddress) {
        self.shared.links.lock().insert(peer.clone());
        match peer.upgrade() {
            Some(cell) => cell.link(self.self_addr()),
            None => {
                let reason = self.shared.core.peer_exit_reason(peer);
                self.shared.core.deliver(Envelope::new(
                    ActorAddress::invalid(),
                    self.self_addr(),
                    MessageId::ASYNC,
                    Message::new(vec![Value::Exit(ExitMsg {
                        source: peer.clone(),
                        reason,
                    })]),
                ));
            }
        }
    }

    /// Dissolve a link with `peer`.
    pub fn unlink_from(&self, peer: &ActorAddress) {
        self.shared.links.lock().remove(peer);
        if let Some(cell) = peer.upgrade() {
            cell.unlink(&self.self_addr());
        }
    }

    /// Monitor `peer`: receive a [`DownMsg`] when it exits. If it has
    /// already exited, the down message is delivered immediately.
    pub fn monitor(&self, peer: &ActorAddress) {
        match peer.upgrade() {
            Some(cell) => cell.monitor(self.self_addr()),
            None => {
                let reason = self.shared.core.peer_exit_reason(peer);
                self.shared.core.deliver(Envelope::new(
                    ActorAddress::invalid(),
                    self.self_addr(),
                    MessageId::ASYNC,
                    Message::new(vec![Value::Down(DownMsg {
                        source: peer.clone(),
                        reason,
                    })]),
                ));
            }
        }
    }

    /// Stop monitoring `peer`.
    pub fn demonitor(&self, peer: &ActorAddress) {
        if let Some(cell) = peer.upgrade() {
            cell.demonitor(&self.self_addr());
        }
    }
}

impl<S: Send + 'static> LocalActor<S> {
    pub(crate) fn shared(&self) -> &ActorShared {
        &self.shared
    }

    pub(crate) fn create(
        core: Arc<RuntimeCore>,
        node: NodeId,
        id: ActorId,
        state: S,
        init: impl FnOnce(&mut S, &mut Context<'_, S>) -> Behavior<S> + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: ActorShared {
                node,
                id,
                mailbox: crate::mailbox::Mailbox::new(),
                links: Mutex::new(HashSet::new()),
                monitors: Mutex::new(HashSet::new()),
                exit: Mutex::new(ExitState {
                    reason: ExitReason::NotExited,
                    functors: Vec::new(),
                }),
                trap_exit: AtomicBool::new(false),
                core,
                self_cell: OnceLock::new(),
                self_job: OnceLock::new(),
            },
            body: Mutex::new(ActorBody {
                state,
                stack: BehaviorStack::new(),
                cache: VecDeque::new(),
                init: Some(Box::new(init)),
            }),
        })
    }

    /// Dispatch one envelope. Returns the exit reason when the actor
    /// should terminate.
    fn process(
        &self,
        body: &mut ActorBody<S>,
        env: Envelope,
        worker: &Worker,
    ) -> Option<ExitReason> {
        let mut pending = VecDeque::new();
        pending.push_back(env);

        while let Some(env) = pending.pop_front() {
            // Runtime-level interception ahead of user behaviors.
            if env.mid.is_async() && env.message.len() == 1 {
                match env.message.value(0) {
                    Some(Value::Exit(m)) => {
                        if !self.shared.trap_exit.load(Ordering::Acquire) {
                            self.shared.links.lock().remove(&m.source);
                            if m.reason != ExitReason::Normal {
                                return Some(m.reason);
                            }
                            continue;
                        }
                    }
                    Some(Value::Link(LinkMsg::Link(addr))) => {
                        self.shared.links.lock().insert(addr.clone());
                        continue;
                    }
                    Some(Value::Link(LinkMsg::Unlink(addr))) => {
                        self.shared.links.lock().remove(addr);
                        continue;
                    }
                    _ => {}
                }
            }

            let mut ops: Vec<StackOp<S>> = Vec::new();
            let outcome = if env.mid.is_response() {
                match body.stack.find_sync_handler(env.mid) {
                    None => {
                        tracing::debug!(mid = ?env.mid, actor = %self.shared.id,
                            "dropping unmatched response");
                        continue;
                    }
                    Some(idx) => {
                        let ActorBody { state, stack, .. } = &mut *body;
                        let mut ctx = Context {
                            env: &env,
                            shared: &self.shared,
                            worker: Some(worker),
                            ops: &mut ops,
                        };
                        let result = stack.frame_mut(idx).behavior.invoke(state, &mut ctx);
                        match result {
                            Ok(Handled::Done) => {
                                body.stack.erase(env.mid);
                                body.stack.cleanup();
                                Ok(())
                            }
                            Ok(Handled::Skipped) => {
                                // The awaited reply arrived but the
                                // frame cannot make sense of it.
                                return Some(ExitReason::UnhandledSyncFailure);
                            }
                            Err(err) => Err(err),
                        }
                    }
                }
            } else {
                match body.stack.top_async() {
                    None => {
                        if body.stack.is_empty() {
                            return Some(ExitReason::Normal);
                        }
                        // Only response frames remain; hold the message
                        // until the stack changes.
                        body.cache.push_back(env);
                        continue;
                    }
                    Some(idx) => {
                        let ActorBody { state, stack, .. } = &mut *body;
                        let mut ctx = Context {
                            env: &env,
                            shared: &self.shared,
                            worker: Some(worker),
                            ops: &mut ops,
                        };
                        let result = stack.frame_mut(idx).behavior.invoke(state, &mut ctx);
                        match result {
                            Ok(Handled::Done) => Ok(()),
                            Ok(Handled::Skipped) => {
                                body.cache.push_back(env);
                                Ok(())
                            }
                            Err(err) => Err(err),
                        }
                    }
                }
            };

            if let Err(err) = outcome {
                tracing::error!(actor = %self.shared.id, error = %err,
                    "behavior failed");
                return Some(ExitReason::UnhandledException);
            }

            let (changed, quit) = self.apply_ops(body, ops);
            if let Some(reason) = quit {
                return Some(reason);
            }
            if changed {
                body.stack.cleanup();
                if body.stack.is_empty() {
                    return Some(ExitReason::Normal);
                }
                for env in body.cache.drain(..).rev().collect::<Vec<_>>() {
                    pending.push_front(env);
                }
            }
        }
        None
    }

    fn apply_ops(
        &self,
        body: &mut ActorBody<S>,
        ops: Vec<StackOp<S>>,
    ) -> (bool, Option<ExitReason>) {
        let mut changed = false;
        let mut quit = None;
        for op in ops {
            match op {
                StackOp::BecomeReplace(b) => {
                    body.stack.pop_async_back();
                    body.stack.push(b, None, None);
                    changed = true;
                }
                StackOp::BecomePush(b) => {
                    body.stack.push(b, None, None);
                    changed = true;
                }
                StackOp::Unbecome => {
                    body.stack.pop_async_back();
                    changed = true;
                }
                StackOp::PushSync {
                    rid,
                    behavior,
                    timeout,
                } => {
                    body.stack.push(behavior, Some(rid), timeout);
                    if let Some(delay) = timeout {
                        self.shared.core.timer.schedule(
                            delay,
                            Envelope::new(
                                ActorAddress::invalid(),
                                self.shared.address(),
                                rid,
                                Message::new(vec![Value::Timeout(TimeoutMsg { id: rid })]),
                            ),
                        );
                    }
                }
                StackOp::Quit(reason) => {
                    quit = Some(reason);
                }
            }
        }
        (changed, quit)
    }

    fn terminate(&self, body: &mut ActorBody<S>, reason: ExitReason) {
        let functors = {
            let mut exit = self.shared.exit.lock();
            if exit.reason.is_exited() {
                return;
            }
            exit.reason = reason;
            std::mem::take(&mut exit.functors)
        };
        tracing::debug!(actor = %self.shared.id, %reason, "actor exiting");

        for env in self.shared.mailbox.close() {
            bounce_request(&env, reason);
        }
        self.shared.core.registry.erase(self.shared.id, reason);

        let self_addr = self.shared.address();
        let links: Vec<_> = self.shared.links.lock().drain().collect();
        for peer in links {
            if let Some(cell) = peer.upgrade() {
                cell.unlink(&self_addr);
                cell.enqueue(Envelope::new(
                    self_addr.clone(),
                    peer.clone(),
                    MessageId::ASYNC,
                    Message::new(vec![Value::Exit(ExitMsg {
                        source: self_addr.clone(),
                        reason,
                    })]),
                ));
            }
        }
        let monitors: Vec<_> = self.shared.monitors.lock().drain().collect();
        for observer in monitors {
            if let Some(cell) = observer.upgrade() {
                cell.enqueue(Envelope::new(
                    self_addr.clone(),
                    observer.clone(),
                    MessageId::ASYNC,
                    Message::new(vec![Value::Down(DownMsg {
                        source: self_addr.clone(),
                        reason,
                    })]),
                ));
            }
        }
        for f in functors {
            f(reason);
        }
        body.stack = BehaviorStack::new();
        body.cache.clear();
    }
}

impl<S: Send + 'static> ActorCell for LocalActor<S> {
    fn node(&self) -> NodeId {
        self.shared.node
    }

    fn id(&self) -> ActorId {
        self.shared.id
    }

    fn address(&self) -> ActorAddress {
        self.shared.address()
    }

    fn enqueue(&self, env: Envelope) {
        match self.shared.mailbox.enqueue(env) {
            crate::mailbox::EnqueueResult::Enqueued => {}
            crate::mailbox::EnqueueResult::Unblocked => {
                if let Some(job) = self.shared.self_job.get().and_then(Weak::upgrade) {
                    self.shared.core.scheduler.enqueue(job);
                }
            }
            crate::mailbox::EnqueueResult::DroppedClosed(env) => {
                bounce_request(&env, self.shared.exit_reason());
            }
        }
    }

    fn link(&self, peer: ActorAddress) {
        let reason = self.shared.exit_reason();
        if reason.is_exited() {
            if let Some(cell) = peer.upgrade() {
                cell.enqueue(Envelope::new(
                    self.shared.address(),
                    peer.clone(),
                    MessageId::ASYNC,
                    Message::new(vec![Value::Exit(ExitMsg {
                        source: self.shared.address(),
                        reason,
                    })]),
                ));
            }
            return;
        }
        self.shared.links.lock().insert(peer);
    }

    fn unlink(&self, peer: &ActorAddress) {
        self.shared.links.lock().remove(peer);
    }

    fn monitor(&self, observer: ActorAddress) {
        let reason = self.shared.exit_reason();
        if reason.is_exited() {
            if let Some(cell) = observer.upgrade() {
                cell.enqueue(Envelope::new(
                    self.shared.address(),
                    observer.clone(),
                    MessageId::ASYNC,
                    Message::new(vec![Value::Down(DownMsg {
                        source: self.shared.address(),
                        reason,
                    })]),
                ));
            }
            return;
        }
        self.shared.monitors.lock().insert(observer);
    }

    fn demonitor(&self, observer: &ActorAddress) {
        self.shared.monitors.lock().remove(observer);
    }

    fn attach_functor(&self, f: ExitFunctor) {
        let reason = {
            let mut exit = self.shared.exit.lock();
            if exit.reason.is_exited() {
                exit.reason
            } else {
                exit.functors.push(f);
                return;
            }
        };
        f(reason);
    }

    fn exit_reason(&self) -> ExitReason {
        self.shared.exit_reason()
    }
}

impl<S: Send + 'static> Resumable for LocalActor<S> {
    fn resume(&self, worker: &Worker) -> Resumption {
        let mut body = self.body.lock();
        if self.shared.exit_reason().is_exited() {
            return Resumption::Done;
        }

        if let Some(init) = body.init.take() {
            let env = Envelope::new(
                ActorAddress::invalid(),
                self.shared.address(),
                MessageId::ASYNC,
                Message::empty(),
            );
            let mut ops: Vec<StackOp<S>> = Vec::new();
            let initial = {
                let ActorBody { state, .. } = &mut *body;
                let mut ctx = Context {
                    env: &env,
                    shared: &self.shared,
                    worker: Some(worker),
                    ops: &mut ops,
                };
                init(state, &mut ctx)
            };
            body.stack.push(initial, None, None);
            let (_, quit) = self.apply_ops(&mut body, ops);
            if let Some(reason) = quit {
                self.terminate(&mut body, reason);
                return Resumption::Done;
            }
        }

        loop {
            match self.shared.mailbox.try_pop() {
                Some(env) => {
                    if let Some(reason) = self.process(&mut body, env, worker) {
                        self.terminate(&mut body, reason);
                        return Resumption::Done;
                    }
                }
                None => {
                    if self.shared.mailbox.try_block() {
                        return Resumption::ResumeLater;
                    }
                }
            }
        }
    }
}
