/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The process-level runtime.
//!
//! A [`Runtime`] is an explicit value owned by `main`: it derives the
//! process [`NodeId`], starts the scheduler and timer, and (once any
//! network operation is used) the peering broker. Components hold back
//! references to the shared core; teardown is ordered and idempotent.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crossbeam_channel::Receiver;
use crossbeam_channel::unbounded;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::actor::ActorCell;
use crate::actor::Context;
use crate::actor::LocalActor;
use crate::actor::bounce_request;
use crate::behavior::Behavior;
use crate::behavior::Handled;
use crate::behavior::behavior;
use crate::data::TypeRegistry;
use crate::hook::Hook;
use crate::hook::NoopHook;
use crate::message::Envelope;
use crate::message::ExitMsg;
use crate::message::ExitReason;
use crate::message::Message;
use crate::message::MessageId;
use crate::message::Value;
use crate::net::Multiplexer;
use crate::net::broker::Broker;
use crate::net::broker::BrokerError;
use crate::net::broker::BrokerHandle;
use crate::net::broker::NetStats;
use crate::reference::ActorAddress;
use crate::reference::ActorId;
use crate::reference::NodeId;
use crate::registry::ActorRegistry;
use crate::scheduler::Resumable;
use crate::scheduler::Scheduler;
use crate::scheduler::Worker;
use crate::timer::Timer;

/// Runtime construction parameters.
pub struct Config {
    /// Worker thread count; `None` uses the hardware concurrency.
    pub workers: Option<usize>,
    /// The observability hook surface.
    pub hook: Box<dyn Hook>,
    /// The transport multiplexer; network operations fail without one.
    pub multiplexer: Option<Arc<dyn Multiplexer>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: None,
            hook: Box::new(NoopHook),
            multiplexer: None,
        }
    }
}

impl Config {
    /// Set the worker count.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Set the hook surface.
    pub fn hook(mut self, hook: impl Hook + 'static) -> Self {
        self.hook = Box::new(hook);
        self
    }

    /// Set the transport multiplexer.
    pub fn multiplexer(mut self, mux: Arc<dyn Multiplexer>) -> Self {
        self.multiplexer = Some(mux);
        self
    }
}

/// Shared state every actor holds a back reference to.
pub(crate) struct RuntimeCore {
    pub(crate) node: NodeId,
    pub(crate) scheduler: Scheduler,
    pub(crate) timer: Timer,
    pub(crate) registry: ActorRegistry,
    pub(crate) types: TypeRegistry,
    pub(crate) hook: Box<dyn Hook>,
    next_actor_id: AtomicU32,
    next_correlation: AtomicU64,
}

impl RuntimeCore {
    pub(crate) fn next_correlation(&self) -> u64 {
        self.next_correlation.fetch_add(1, Ordering::Relaxed)
    }

    /// The ordinary send path: resolve and enqueue, or bounce with the
    /// most specific reason available.
    pub(crate) fn deliver(&self, env: Envelope) {
        match env.receiver.upgrade() {
            Some(cell) => cell.enqueue(env),
            None => {
                let receiver = &env.receiver;
                let reason = if receiver.node() == self.node {
                    let (_, reason) = self.registry.get_entry(receiver.id());
                    if reason.is_exited() {
                        reason
                    } else {
                        ExitReason::Normal
                    }
                } else if !receiver.node().is_invalid() {
                    ExitReason::RemoteLinkUnreachable
                } else {
                    ExitReason::Normal
                };
                bounce_request(&env, reason);
            }
        }
    }

    /// The recorded exit reason of a peer, for immediate link/monitor
    /// notifications against dead addresses.
    pub(crate) fn peer_exit_reason(&self, addr: &ActorAddress) -> ExitReason {
        if addr.node() == self.node {
            let (_, reason) = self.registry.get_entry(addr.id());
            if reason.is_exited() {
                return reason;
            }
        }
        ExitReason::Normal
    }

    pub(crate) fn spawn_actor<S: Send + 'static>(
        core: &Arc<Self>,
        state: S,
        init: impl FnOnce(&mut S, &mut Context<'_, S>) -> Behavior<S> + Send + 'static,
        worker: Option<&Worker>,
    ) -> ActorAddress {
        Self::spawn_actor_watched(core, state, init, worker, |_| {})
    }

    /// Spawn with a pre-schedule step: `before` runs against the new
    /// cell after registration but before the actor can execute, so
    /// links and monitors installed there cannot miss an early exit.
    pub(crate) fn spawn_actor_watched<S: Send + 'static>(
        core: &Arc<Self>,
        state: S,
        init: impl FnOnce(&mut S, &mut Context<'_, S>) -> Behavior<S> + Send + 'static,
        worker: Option<&Worker>,
        before: impl FnOnce(&Arc<dyn ActorCell>),
    ) -> ActorAddress {
        let id = ActorId(core.next_actor_id.fetch_add(1, Ordering::Relaxed));
        let actor = LocalActor::create(Arc::clone(core), core.node, id, state, init);
        let cell: Arc<dyn ActorCell> = actor.clone();
        let job: Arc<dyn Resumable> = actor.clone();
        let _ = actor.shared().self_cell.set(Arc::downgrade(&cell));
        let _ = actor.shared().self_job.set(Arc::downgrade(&job));
        core.registry.put(id, cell.clone());
        before(&cell);
        match worker {
            Some(worker) => worker.exec_later(job),
            None => core.scheduler.enqueue(job),
        }
        cell.address()
    }
}

/// The runtime value owned by `main`.
pub struct Runtime {
    core: Arc<RuntimeCore>,
    mux: Option<Arc<dyn Multiplexer>>,
    broker: OnceLock<BrokerHandle>,
    down: AtomicBool,
}

impl Runtime {
    /// Build and start a runtime.
    pub fn new(config: Config) -> Self {
        let node = NodeId::derive();
        tracing::debug!(node = %node, "runtime starting");
        let core = Arc::new(RuntimeCore {
            node,
            scheduler: Scheduler::start(config.workers),
            timer: Timer::start(),
            registry: ActorRegistry::new(),
            types: TypeRegistry::new(),
            hook: config.hook,
            next_actor_id: AtomicU32::new(1),
            next_correlation: AtomicU64::new(1),
        });
        Self {
            core,
            mux: config.multiplexer,
            broker: OnceLock::new(),
            down: AtomicBool::new(false),
        }
    }

    /// This process's node identity.
    pub fn node(&self) -> NodeId {
        self.core.node
    }

    /// The shared core. Used primarily for testing broker internals.
    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<RuntimeCore> {
        &self.core
    }

    /// Register a payload type for network transfer.
    pub fn register_type<T: Serialize + DeserializeOwned + Send + 'static>(&self, name: &str) {
        self.core.types.register::<T>(name);
    }

    /// Spawn an actor from its initial state and init function; the
    /// init function returns the actor's first behavior.
    pub fn spawn<S: Send + 'static>(
        &self,
        state: S,
        init: impl FnOnce(&mut S, &mut Context<'_, S>) -> Behavior<S> + Send + 'static,
    ) -> ActorAddress {
        RuntimeCore::spawn_actor(&self.core, state, init, None)
    }

    /// Spawn an actor that forwards every envelope it receives into a
    /// channel. Useful for code outside any actor that needs to
    /// observe messages.
    pub fn spawn_client(&self) -> (ActorAddress, Receiver<Envelope>) {
        let (tx, rx) = unbounded::<Envelope>();
        let addr = self.spawn((), move |_, _| {
            let tx = tx.clone();
            behavior(move |_, ctx| {
                let env = Envelope::new(
                    ctx.sender().clone(),
                    ctx.self_addr(),
                    ctx.message_id(),
                    ctx.message().clone(),
                );
                let _ = tx.send(env);
                Ok(Handled::Done)
            })
        });
        (addr, rx)
    }

    /// Send an asynchronous message from outside any actor.
    pub fn send(&self, target: &ActorAddress, message: Message) {
        self.core.deliver(Envelope::new(
            ActorAddress::invalid(),
            target.clone(),
            MessageId::ASYNC,
            message,
        ));
    }

    /// Ask an actor to exit. Actors that do not trap exits terminate
    /// with the given reason.
    pub fn send_exit(&self, target: &ActorAddress, reason: ExitReason) {
        self.send(
            target,
            Message::new(vec![Value::Exit(ExitMsg {
                source: ActorAddress::invalid(),
                reason,
            })]),
        );
    }

    fn broker(&self) -> Result<&BrokerHandle, BrokerError> {
        let mux = self.mux.as_ref().ok_or(BrokerError::NoTransport)?;
        Ok(self
            .broker
            .get_or_init(|| Broker::serve(Arc::clone(&self.core), Arc::clone(mux))))
    }

    /// Publish `addr` on `port` (0 picks a free port); returns the
    /// bound port.
    pub fn publish(&self, addr: &ActorAddress, port: u16) -> Result<u16, BrokerError> {
        self.broker()?.publish(addr.clone(), port)
    }

    /// Remove a publication; `port` 0 removes all of the actor's
    /// publications.
    pub fn unpublish(&self, addr: &ActorAddress, port: u16) -> Result<(), BrokerError> {
        self.broker()?.unpublish(addr.clone(), port)
    }

    /// Connect to a peer and resolve the actor it publishes there.
    pub fn remote_actor(&self, host: &str, port: u16) -> Result<ActorAddress, BrokerError> {
        self.broker()?
            .remote_actor(host, port, Default::default())
    }

    /// Like [`Runtime::remote_actor`], requiring the published actor to
    /// cover the given interface signatures.
    pub fn remote_actor_with(
        &self,
        host: &str,
        port: u16,
        expected_ifs: impl IntoIterator<Item = String>,
    ) -> Result<ActorAddress, BrokerError> {
        self.broker()?
            .remote_actor(host, port, expected_ifs.into_iter().collect())
    }

    /// Snapshot the broker tables. Starts the broker if necessary.
    pub fn net_stats(&self) -> Result<NetStats, BrokerError> {
        self.broker()?.stats()
    }

    /// Ordered teardown: broker, then timer, then scheduler.
    /// Idempotent; also run on drop.
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(node = %self.core.node, "runtime shutting down");
        if let Some(broker) = self.broker.get() {
            broker.shutdown();
        }
        self.core.timer.shutdown();
        self.core.scheduler.shutdown();
        self.core.registry.clear();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use std::time::Instant;

    use super::*;
    use crate::message::Atom;
    use crate::message::DownMsg;
    use crate::message::SyncExitedMsg;
    use crate::message::TimeoutMsg;
    use crate::message::atom;
    use crate::msg;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn runtime() -> Runtime {
        Runtime::new(Config::default().workers(2))
    }

    #[test]
    fn test_local_request_response() {
        let rt = runtime();
        let ponger = rt.spawn((), |_, _| {
            behavior(|_, ctx| {
                if ctx.message().get::<Atom>(0) == Some(atom("ping")) {
                    ctx.reply(msg![atom("pong")]);
                }
                Ok(Handled::Done)
            })
        });

        let (tx, rx) = unbounded();
        rt.spawn((), move |_, ctx| {
            ctx.request(
                &ponger,
                msg![atom("ping")],
                None,
                behavior(move |_, ctx| {
                    let _ = tx.send(ctx.message().get::<Atom>(0));
                    Ok(Handled::Done)
                }),
            );
            behavior(|_, _| Ok(Handled::Done))
        });

        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Some(atom("pong")));
        // Exactly once: the frame is erased after its response.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        rt.shutdown();
    }

    #[test]
    fn test_delayed_send() {
        let rt = runtime();
        let (client, inbox) = rt.spawn_client();
        let start = Instant::now();
        rt.spawn((), move |_, ctx| {
            ctx.delayed_send(&client, Duration::from_millis(50), msg![atom("tick")]);
            behavior(|_, _| Ok(Handled::Done))
        });
        let env = inbox.recv_timeout(RECV_TIMEOUT).unwrap();
        let elapsed = start.elapsed();
        assert_eq!(env.message.get::<Atom>(0), Some(atom("tick")));
        assert!(elapsed >= Duration::from_millis(45), "fired early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "fired late: {:?}", elapsed);
        rt.shutdown();
    }

    #[test]
    fn test_per_sender_fifo() {
        let rt = runtime();
        let (client, inbox) = rt.spawn_client();
        let n = 500u64;
        for sender in 0..2u64 {
            let client = client.clone();
            rt.spawn((), move |_, ctx| {
                for i in 0..n {
                    ctx.send(&client, msg![sender, i]);
                }
                behavior(|_, _| Ok(Handled::Done))
            });
        }
        let mut next = [0u64; 2];
        for _ in 0..2 * n {
            let env = inbox.recv_timeout(RECV_TIMEOUT).unwrap();
            let sender = env.message.get::<u64>(0).unwrap() as usize;
            let seq = env.message.get::<u64>(1).unwrap();
            assert_eq!(seq, next[sender], "out of order from sender {}", sender);
            next[sender] += 1;
        }
        rt.shutdown();
    }

    #[test]
    fn test_request_timeout() {
        let rt = runtime();
        // Never replies.
        let sink = rt.spawn((), |_, _| behavior(|_, _| Ok(Handled::Done)));
        let (tx, rx) = unbounded();
        rt.spawn((), move |_, ctx| {
            ctx.request(
                &sink,
                msg![atom("ask")],
                Some(Duration::from_millis(30)),
                behavior(move |_, ctx| {
                    let _ = tx.send(ctx.message().get::<TimeoutMsg>(0).is_some());
                    Ok(Handled::Done)
                }),
            );
            behavior(|_, _| Ok(Handled::Done))
        });
        assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap());
        rt.shutdown();
    }

    #[test]
    fn test_request_to_dead_actor_bounces() {
        let rt = runtime();
        let victim = rt.spawn((), |_, _| {
            behavior(|_, ctx| {
                ctx.quit(ExitReason::Normal);
                Ok(Handled::Done)
            })
        });
        rt.send(&victim, msg![atom("die")]);
        // Give the victim time to exit.
        std::thread::sleep(Duration::from_millis(100));

        let (tx, rx) = unbounded();
        rt.spawn((), move |_, ctx| {
            ctx.request(
                &victim,
                msg![atom("ask")],
                None,
                behavior(move |_, ctx| {
                    let reason = ctx
                        .message()
                        .get::<&SyncExitedMsg>(0)
                        .map(|m| m.reason);
                    let _ = tx.send(reason);
                    Ok(Handled::Done)
                }),
            );
            behavior(|_, _| Ok(Handled::Done))
        });
        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT).unwrap(),
            Some(ExitReason::Normal)
        );
        rt.shutdown();
    }

    #[test]
    fn test_link_propagates_exit() {
        let rt = runtime();
        let (client, inbox) = rt.spawn_client();

        let doomed = rt.spawn((), |_, _| {
            behavior(|_, ctx| {
                ctx.quit(ExitReason::UserShutdown);
                Ok(Handled::Done)
            })
        });
        // Trap exits and report what arrives.
        let doomed2 = doomed.clone();
        let watcher = rt.spawn((), move |_, ctx| {
            ctx.trap_exit(true);
            ctx.link_to(&doomed2);
            behavior(move |_, ctx| {
                if let Some(m) = ctx.message().get::<&ExitMsg>(0) {
                    ctx.send(&client, msg![m.reason.to_u32()]);
                }
                Ok(Handled::Done)
            })
        });
        std::thread::sleep(Duration::from_millis(50));
        rt.send(&doomed, msg![atom("go")]);

        let env = inbox.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(
            env.message.get::<u32>(0),
            Some(ExitReason::UserShutdown.to_u32())
        );
        let _ = watcher;
        rt.shutdown();
    }

    #[test]
    fn test_exit_kills_linked_actor_without_trap() {
        let rt = runtime();
        let (client, inbox) = rt.spawn_client();

        let doomed = rt.spawn((), |_, _| {
            behavior(|_, ctx| {
                ctx.quit(ExitReason::UserShutdown);
                Ok(Handled::Done)
            })
        });
        let doomed2 = doomed.clone();
        let casualty = rt.spawn((), move |_, ctx| {
            ctx.link_to(&doomed2);
            behavior(|_, _| Ok(Handled::Done))
        });
        // Monitor the casualty so we can observe its propagated death.
        let casualty2 = casualty.clone();
        rt.spawn((), move |_, ctx| {
            ctx.monitor(&casualty2);
            behavior(move |_, ctx| {
                if let Some(m) = ctx.message().get::<&DownMsg>(0) {
                    ctx.send(&client, msg![m.reason.to_u32()]);
                }
                Ok(Handled::Done)
            })
        });
        std::thread::sleep(Duration::from_millis(50));
        rt.send(&doomed, msg![atom("go")]);

        let env = inbox.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(
            env.message.get::<u32>(0),
            Some(ExitReason::UserShutdown.to_u32())
        );
        rt.shutdown();
    }

    #[test]
    fn test_skip_cache_replayed_on_become() {
        let rt = runtime();
        let (client, inbox) = rt.spawn_client();

        // Skips everything except "open"; after opening, consumes the
        // cached messages in order.
        let gate = rt.spawn(Vec::<u64>::new(), move |_, _| {
            behavior(move |_, ctx| {
                if ctx.message().get::<Atom>(0) == Some(atom("open")) {
                    let client = client.clone();
                    ctx.become_(behavior(move |seen: &mut Vec<u64>, ctx| {
                        if let Some(v) = ctx.message().get::<u64>(0) {
                            seen.push(v);
                            if seen.len() == 3 {
                                ctx.send(&client, Message::new(
                                    seen.iter().map(|v| Value::U64(*v)).collect(),
                                ));
                            }
                        }
                        Ok(Handled::Done)
                    }));
                    Ok(Handled::Done)
                } else {
                    Ok(Handled::Skipped)
                }
            })
        });

        let gate2 = gate.clone();
        rt.spawn((), move |_, ctx| {
            ctx.send(&gate2, msg![1u64]);
            ctx.send(&gate2, msg![2u64]);
            ctx.send(&gate2, msg![3u64]);
            ctx.send(&gate2, msg![atom("open")]);
            behavior(|_, _| Ok(Handled::Done))
        });

        let env = inbox.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(env.message.get::<u64>(0), Some(1));
        assert_eq!(env.message.get::<u64>(1), Some(2));
        assert_eq!(env.message.get::<u64>(2), Some(3));
        rt.shutdown();
    }

    #[test]
    fn test_unbecome_to_empty_finishes_normally() {
        let rt = runtime();
        let (client, inbox) = rt.spawn_client();
        let actor = rt.spawn((), |_, _| {
            behavior(|_, ctx| {
                ctx.unbecome();
                Ok(Handled::Done)
            })
        });
        let actor2 = actor.clone();
        rt.spawn((), move |_, ctx| {
            ctx.monitor(&actor2);
            behavior(move |_, ctx| {
                if let Some(m) = ctx.message().get::<&DownMsg>(0) {
                    ctx.send(&client, msg![m.reason.to_u32()]);
                }
                Ok(Handled::Done)
            })
        });
        std::thread::sleep(Duration::from_millis(50));
        rt.send(&actor, msg![atom("stop")]);
        let env = inbox.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(env.message.get::<u32>(0), Some(ExitReason::Normal.to_u32()));
        rt.shutdown();
    }

    // An immediately exiting child must not slip past a monitor
    // installed at spawn time.
    #[test]
    fn test_spawn_monitored_observes_immediate_exit() {
        let rt = runtime();
        let (client, inbox) = rt.spawn_client();
        rt.spawn((), move |_, ctx| {
            ctx.spawn_monitored((), |_, ctx| {
                ctx.quit(ExitReason::UserShutdown);
                behavior(|_, _| Ok(Handled::Done))
            });
            behavior(move |_, ctx| {
                if let Some(m) = ctx.message().get::<&DownMsg>(0) {
                    ctx.send(&client, msg![m.reason.to_u32()]);
                }
                Ok(Handled::Done)
            })
        });
        let env = inbox.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(
            env.message.get::<u32>(0),
            Some(ExitReason::UserShutdown.to_u32())
        );
        rt.shutdown();
    }

    #[test]
    fn test_spawn_linked_propagates_exit() {
        let rt = runtime();
        let (client, inbox) = rt.spawn_client();
        rt.spawn((), move |_, ctx| {
            ctx.trap_exit(true);
            ctx.spawn_linked((), |_, ctx| {
                ctx.quit(ExitReason::User(90_000));
                behavior(|_, _| Ok(Handled::Done))
            });
            behavior(move |_, ctx| {
                if let Some(m) = ctx.message().get::<&ExitMsg>(0) {
                    ctx.send(&client, msg![m.reason.to_u32()]);
                }
                Ok(Handled::Done)
            })
        });
        let env = inbox.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(env.message.get::<u32>(0), Some(90_000));
        rt.shutdown();
    }

    #[test]
    fn test_behavior_error_is_unhandled_exception() {
        let rt = runtime();
        let (client, inbox) = rt.spawn_client();
        let failing = rt.spawn((), |_, _| {
            behavior(|_, _| anyhow::bail!("boom"))
        });
        let failing2 = failing.clone();
        rt.spawn((), move |_, ctx| {
            ctx.monitor(&failing2);
            behavior(move |_, ctx| {
                if let Some(m) = ctx.message().get::<&DownMsg>(0) {
                    ctx.send(&client, msg![m.reason.to_u32()]);
                }
                Ok(Handled::Done)
            })
        });
        std::thread::sleep(Duration::from_millis(50));
        rt.send(&failing, msg![atom("go")]);
        let env = inbox.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(
            env.message.get::<u32>(0),
            Some(ExitReason::UnhandledException.to_u32())
        );
        rt.shutdown();
    }
}
