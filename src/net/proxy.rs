/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Remote actor proxies.
//!
//! A [`ForwardingProxy`] is the thin local stand-in for one remote
//! actor: every message enqueued into it re-enters the broker, which
//! serializes and transmits it. Links and monitors against a proxy are
//! recorded locally; when the remote actor exits (or its node becomes
//! unreachable) the broker kills the proxy, which then delivers the
//! exit and down messages to the local holders.
//!
//! The [`ProxyNamespace`] is the broker's per-remote-node proxy cache
//! and the strong owner of every proxy; killing or erasing a proxy
//! releases it.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::actor::ActorCell;
use crate::actor::ExitFunctor;
use crate::actor::bounce_request;
use crate::message::DownMsg;
use crate::message::Envelope;
use crate::message::ExitMsg;
use crate::message::ExitReason;
use crate::message::LinkMsg;
use crate::message::Message;
use crate::message::MessageId;
use crate::message::Value;
use crate::net::broker::BrokerMsg;
use crate::reference::ActorAddress;
use crate::reference::ActorId;
use crate::reference::NodeId;

struct ProxyExit {
    reason: ExitReason,
    functors: Vec<ExitFunctor>,
}

/// A local stand-in for one remote actor.
pub struct ForwardingProxy {
    node: NodeId,
    id: ActorId,
    broker: Sender<BrokerMsg>,
    links: Mutex<HashSet<ActorAddress>>,
    monitors: Mutex<HashSet<ActorAddress>>,
    exit: Mutex<ProxyExit>,
    self_cell: OnceLock<Weak<dyn ActorCell>>,
}

impl ForwardingProxy {
    pub(crate) fn new(node: NodeId, id: ActorId, broker: Sender<BrokerMsg>) -> Arc<Self> {
        let proxy = Arc::new(Self {
            node,
            id,
            broker,
            links: Mutex::new(HashSet::new()),
            monitors: Mutex::new(HashSet::new()),
            exit: Mutex::new(ProxyExit {
                reason: ExitReason::NotExited,
                functors: Vec::new(),
            }),
            self_cell: OnceLock::new(),
        });
        let cell: Arc<dyn ActorCell> = proxy.clone();
        let _ = proxy.self_cell.set(Arc::downgrade(&cell));
        proxy
    }

    /// Record a link locally, without signaling the remote node. Used
    /// by the broker when it applies an inbound link signal.
    pub(crate) fn local_link(&self, peer: ActorAddress) {
        self.links.lock().insert(peer);
    }

    /// Dissolve a locally recorded link, without signaling the remote
    /// node.
    pub(crate) fn local_unlink(&self, peer: &ActorAddress) {
        self.links.lock().remove(peer);
    }

    /// Send a self-addressed link signal to the shadowed actor's home
    /// node. The broker there applies it against its own proxy for the
    /// carried peer, so the link outlives this side of the connection.
    fn signal(&self, link: LinkMsg) {
        let addr = self.address();
        let _ = self.broker.send(BrokerMsg::Dispatch {
            sender: addr.clone(),
            receiver: addr,
            mid: MessageId::ASYNC,
            msg: Message::new(vec![Value::Link(link)]),
        });
    }

    /// Mark the shadowed remote actor as exited and deliver the exit
    /// and down messages to local link and monitor holders.
    pub(crate) fn kill(&self, reason: ExitReason) {
        let functors = {
            let mut exit = self.exit.lock();
            if exit.reason.is_exited() {
                return;
            }
            exit.reason = reason;
            std::mem::take(&mut exit.functors)
        };
        tracing::debug!(proxy = %self.address(), %reason, "killing proxy");
        let self_addr = self.address();
        let links: Vec<_> = self.links.lock().drain().collect();
        for peer in links {
            if let Some(cell) = peer.upgrade() {
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
        let monitors: Vec<_> = self.monitors.lock().drain().collect();
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
    }
}

impl ActorCell for ForwardingProxy {
    fn node(&self) -> NodeId {
        self.node
    }

    fn id(&self) -> ActorId {
        self.id
    }

    fn address(&self) -> ActorAddress {
        let cell = self
            .self_cell
            .get()
            .cloned()
            .unwrap_or_else(|| Weak::<crate::actor::DeadCell>::new() as Weak<dyn ActorCell>);
        ActorAddress::new(self.node, self.id, cell)
    }

    fn enqueue(&self, env: Envelope) {
        let reason = self.exit.lock().reason;
        if reason.is_exited() {
            bounce_request(&env, reason);
            return;
        }
        let Envelope {
            sender,
            receiver,
            mid,
            message,
        } = env;
        if self
            .broker
            .send(BrokerMsg::Dispatch {
                sender: sender.clone(),
                receiver: receiver.clone(),
                mid,
                msg: message.clone(),
            })
            .is_err()
        {
            bounce_request(
                &Envelope::new(sender, receiver, mid, message),
                ExitReason::RemoteLinkUnreachable,
            );
        }
    }

    fn link(&self, peer: ActorAddress) {
        let reason = self.exit.lock().reason;
        if reason.is_exited() {
            if let Some(cell) = peer.upgrade() {
                cell.enqueue(Envelope::new(
                    self.address(),
                    peer.clone(),
                    MessageId::ASYNC,
                    Message::new(vec![Value::Exit(ExitMsg {
                        source: self.address(),
                        reason,
                    })]),
                ));
            }
            return;
        }
        self.local_link(peer.clone());
        self.signal(LinkMsg::Link(peer));
    }

    fn unlink(&self, peer: &ActorAddress) {
        self.local_unlink(peer);
        if !self.exit.lock().reason.is_exited() {
            self.signal(LinkMsg::Unlink(peer.clone()));
        }
    }

    fn monitor(&self, observer: ActorAddress) {
        let reason = self.exit.lock().reason;
        if reason.is_exited() {
            if let Some(cell) = observer.upgrade() {
                cell.enqueue(Envelope::new(
                    self.address(),
                    observer.clone(),
                    MessageId::ASYNC,
                    Message::new(vec![Value::Down(DownMsg {
                        source: self.address(),
                        reason,
                    })]),
                ));
            }
            return;
        }
        self.monitors.lock().insert(observer);
    }

    fn demonitor(&self, observer: &ActorAddress) {
        self.monitors.lock().remove(observer);
    }

    fn attach_functor(&self, f: ExitFunctor) {
        let reason = {
            let mut exit = self.exit.lock();
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
        self.exit.lock().reason
    }
}

/// The broker's per-remote-node proxy cache. Confined to the broker
/// thread.
#[derive(Default)]
pub(crate) struct ProxyNamespace {
    map: HashMap<NodeId, HashMap<ActorId, Arc<ForwardingProxy>>>,
}

impl ProxyNamespace {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, node: NodeId, id: ActorId) -> Option<Arc<ForwardingProxy>> {
        self.map.get(&node).and_then(|m| m.get(&id)).cloned()
    }

    pub(crate) fn insert(&mut self, proxy: Arc<ForwardingProxy>) {
        self.map
            .entry(proxy.node())
            .or_default()
            .insert(proxy.id(), proxy);
    }

    pub(crate) fn erase(&mut self, node: NodeId, id: ActorId) -> Option<Arc<ForwardingProxy>> {
        let proxies = self.map.get_mut(&node)?;
        let removed = proxies.remove(&id);
        if proxies.is_empty() {
            self.map.remove(&node);
        }
        removed
    }

    /// Remove and return every proxy for `node`.
    pub(crate) fn erase_node(&mut self, node: NodeId) -> Vec<Arc<ForwardingProxy>> {
        self.map
            .remove(&node)
            .map(|m| m.into_values().collect())
            .unwrap_or_default()
    }

    /// Remove and return every proxy.
    pub(crate) fn clear(&mut self) -> Vec<Arc<ForwardingProxy>> {
        let mut all = Vec::new();
        for (_, proxies) in std::mem::take(&mut self.map) {
            all.extend(proxies.into_values());
        }
        all
    }

    pub(crate) fn count(&self) -> usize {
        self.map.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use crossbeam_channel::Receiver;
    use crossbeam_channel::unbounded;

    use super::*;
    use crate::reference::NODE_ID_LEN;

    fn nid(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; NODE_ID_LEN])
    }

    fn proxy(node: u8, id: u32) -> (Arc<ForwardingProxy>, Receiver<BrokerMsg>) {
        let (tx, rx) = unbounded();
        (ForwardingProxy::new(nid(node), ActorId(id), tx), rx)
    }

    #[test]
    fn test_link_emits_self_addressed_signal() {
        let (p, rx) = proxy(1, 10);
        let peer = ActorAddress::unresolved(nid(2), ActorId(5));

        p.link(peer.clone());
        match rx.try_recv().unwrap() {
            BrokerMsg::Dispatch {
                sender,
                receiver,
                mid,
                msg,
            } => {
                assert_eq!(sender, p.address());
                assert_eq!(receiver, p.address());
                assert!(mid.is_async());
                assert_eq!(msg.value(0), Some(&Value::Link(LinkMsg::Link(peer.clone()))));
            }
            _ => panic!("expected a dispatch"),
        }

        p.unlink(&peer);
        match rx.try_recv().unwrap() {
            BrokerMsg::Dispatch { msg, .. } => {
                assert_eq!(msg.value(0), Some(&Value::Link(LinkMsg::Unlink(peer))));
            }
            _ => panic!("expected a dispatch"),
        }
    }

    #[test]
    fn test_kill_drains_links_and_monitors_exactly_once() {
        let (p, _p_rx) = proxy(1, 10);
        let (linked, linked_rx) = proxy(2, 20);
        let (watcher, watcher_rx) = proxy(3, 30);
        p.local_link(linked.address());
        p.monitor(watcher.address());

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        p.attach_functor(Box::new(move |reason| {
            assert_eq!(reason, ExitReason::UserShutdown);
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        p.kill(ExitReason::UserShutdown);
        assert_eq!(p.exit_reason(), ExitReason::UserShutdown);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        match linked_rx.try_recv().unwrap() {
            BrokerMsg::Dispatch { msg, .. } => {
                let exit = msg.get::<&ExitMsg>(0).unwrap();
                assert_eq!(exit.source, p.address());
                assert_eq!(exit.reason, ExitReason::UserShutdown);
            }
            _ => panic!("expected an exit message"),
        }
        match watcher_rx.try_recv().unwrap() {
            BrokerMsg::Dispatch { msg, .. } => {
                let down = msg.get::<&DownMsg>(0).unwrap();
                assert_eq!(down.source, p.address());
                assert_eq!(down.reason, ExitReason::UserShutdown);
            }
            _ => panic!("expected a down message"),
        }

        // A second kill must be a no-op: the first reason sticks and
        // nothing is delivered again.
        p.kill(ExitReason::Normal);
        assert_eq!(p.exit_reason(), ExitReason::UserShutdown);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(linked_rx.try_recv().is_err());
        assert!(watcher_rx.try_recv().is_err());
    }

    #[test]
    fn test_link_after_kill_notifies_immediately() {
        let (p, p_rx) = proxy(1, 10);
        let (peer, peer_rx) = proxy(2, 20);
        p.kill(ExitReason::RemoteLinkUnreachable);

        p.link(peer.address());
        match peer_rx.try_recv().unwrap() {
            BrokerMsg::Dispatch { msg, .. } => {
                let exit = msg.get::<&ExitMsg>(0).unwrap();
                assert_eq!(exit.source, p.address());
                assert_eq!(exit.reason, ExitReason::RemoteLinkUnreachable);
            }
            _ => panic!("expected an exit message"),
        }
        // No link signal leaves a dead proxy.
        assert!(p_rx.try_recv().is_err());
    }

    #[test]
    fn test_enqueue_after_kill_bounces_requests() {
        let (p, p_rx) = proxy(1, 10);
        let (requester, requester_rx) = proxy(2, 20);
        p.kill(ExitReason::RemoteLinkUnreachable);

        let mid = crate::message::MessageId::make_request(7);
        p.enqueue(Envelope::new(
            requester.address(),
            p.address(),
            mid,
            Message::empty(),
        ));
        match requester_rx.try_recv().unwrap() {
            BrokerMsg::Dispatch { mid: got, msg, .. } => {
                assert_eq!(got, mid.response_id());
                let bounced = msg.get::<&crate::message::SyncExitedMsg>(0).unwrap();
                assert_eq!(bounced.source, p.address());
                assert_eq!(bounced.reason, ExitReason::RemoteLinkUnreachable);
            }
            _ => panic!("expected a bounced response"),
        }
        assert!(p_rx.try_recv().is_err());
    }
}
