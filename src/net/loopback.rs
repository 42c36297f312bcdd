/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An in-process transport.
//!
//! A [`LoopbackNet`] is one simulated network; each node takes an
//! endpoint from it and hands that to its runtime as the multiplexer.
//! Connections are paired byte pipes that honor the broker's read
//! policies, so the real framing and handshake state machines run
//! unmodified. Tests also use [`RawPeer`] to speak the wire protocol
//! by hand, and [`LoopbackNet::sever`] to cut live connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::unbounded;
use parking_lot::Mutex;

use crate::net::AcceptHandle;
use crate::net::ConnectionHandle;
use crate::net::Multiplexer;
use crate::net::NetError;
use crate::net::NetEvent;
use crate::net::ReceivePolicy;

struct Endpoint {
    name: String,
    events: Option<Sender<NetEvent>>,
}

struct Listener {
    owner: u64,
    hdl: AcceptHandle,
}

struct ConnSide {
    owner: u64,
    peer: ConnectionHandle,
    via_port: u16,
    inbound: Vec<u8>,
    policy: Option<ReceivePolicy>,
    armed: bool,
    wr: Vec<u8>,
}

#[derive(Default)]
struct NetState {
    endpoints: HashMap<u64, Endpoint>,
    listeners: HashMap<u16, Listener>,
    conns: HashMap<ConnectionHandle, ConnSide>,
}

struct NetInner {
    state: Mutex<NetState>,
    next_port: AtomicU64,
    next_conn: AtomicU64,
    next_accept: AtomicU64,
    next_endpoint: AtomicU64,
}

/// One simulated network shared by any number of in-process nodes.
#[derive(Clone)]
pub struct LoopbackNet {
    inner: Arc<NetInner>,
}

impl Default for LoopbackNet {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNet {
    /// Create an empty network.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetInner {
                state: Mutex::new(NetState::default()),
                next_port: AtomicU64::new(1024),
                next_conn: AtomicU64::new(1),
                next_accept: AtomicU64::new(1),
                next_endpoint: AtomicU64::new(1),
            }),
        }
    }

    /// Create a named endpoint to hand to a runtime as its
    /// multiplexer.
    pub fn endpoint(&self, name: &str) -> Arc<LoopbackEndpoint> {
        let id = self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed);
        self.inner.state.lock().endpoints.insert(
            id,
            Endpoint {
                name: name.to_string(),
                events: None,
            },
        );
        Arc::new(LoopbackEndpoint {
            inner: Arc::clone(&self.inner),
            id,
            name: name.to_string(),
        })
    }

    /// Create an endpoint driven directly by a test instead of a
    /// broker.
    pub fn raw_peer(&self, name: &str) -> RawPeer {
        let id = self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        self.inner.state.lock().endpoints.insert(
            id,
            Endpoint {
                name: name.to_string(),
                events: Some(tx),
            },
        );
        RawPeer {
            endpoint: LoopbackEndpoint {
                inner: Arc::clone(&self.inner),
                id,
                name: name.to_string(),
            },
            events: rx,
        }
    }

    /// Cut every live connection established through `port`,
    /// delivering close events to both sides.
    pub fn sever(&self, port: u16) {
        let mut doomed = Vec::new();
        {
            let state = self.inner.state.lock();
            for (hdl, side) in &state.conns {
                if side.via_port == port && *hdl < side.peer {
                    doomed.push(*hdl);
                }
            }
        }
        for hdl in doomed {
            NetInner::close_pair(&self.inner, hdl, true);
        }
    }
}

impl NetInner {
    /// Produce the next read chunk for `hdl` if it is armed and its
    /// policy is satisfiable. Disarms after one chunk; the consumer
    /// re-arms with its next `configure_read`.
    fn pump(state: &mut NetState, hdl: ConnectionHandle) -> Option<(Sender<NetEvent>, NetEvent)> {
        let side = state.conns.get_mut(&hdl)?;
        if !side.armed {
            return None;
        }
        let take = match side.policy? {
            ReceivePolicy::Exactly(n) => {
                if side.inbound.len() < n {
                    return None;
                }
                n
            }
            ReceivePolicy::AtMost(n) => {
                if side.inbound.is_empty() {
                    return None;
                }
                side.inbound.len().min(n)
            }
        };
        side.armed = false;
        let buf: Vec<u8> = side.inbound.drain(..take).collect();
        let owner = side.owner;
        let sender = state.endpoints.get(&owner)?.events.clone()?;
        Some((sender, NetEvent::NewData { hdl, buf }))
    }

    /// Remove a connection pair. `notify_both` also tells the side
    /// that initiated the close (used when the test harness severs a
    /// link out from under both brokers).
    fn close_pair(inner: &Arc<NetInner>, hdl: ConnectionHandle, notify_both: bool) {
        let mut events = Vec::new();
        {
            let mut state = inner.state.lock();
            let Some(side) = state.conns.remove(&hdl) else {
                return;
            };
            let peer_hdl = side.peer;
            if let Some(peer) = state.conns.remove(&peer_hdl) {
                if let Some(sender) = state
                    .endpoints
                    .get(&peer.owner)
                    .and_then(|e| e.events.clone())
                {
                    events.push((sender, NetEvent::ConnectionClosed { hdl: peer_hdl }));
                }
            }
            if notify_both {
                if let Some(sender) = state
                    .endpoints
                    .get(&side.owner)
                    .and_then(|e| e.events.clone())
                {
                    events.push((sender, NetEvent::ConnectionClosed { hdl }));
                }
            }
        }
        for (sender, event) in events {
            let _ = sender.send(event);
        }
    }
}

/// One node's view of a [`LoopbackNet`].
pub struct LoopbackEndpoint {
    inner: Arc<NetInner>,
    id: u64,
    name: String,
}

impl LoopbackEndpoint {
    fn send_events(events: Vec<(Sender<NetEvent>, NetEvent)>) {
        for (sender, event) in events {
            let _ = sender.send(event);
        }
    }
}

impl Multiplexer for LoopbackEndpoint {
    fn start(&self, events: Sender<NetEvent>) {
        if let Some(endpoint) = self.inner.state.lock().endpoints.get_mut(&self.id) {
            endpoint.events = Some(events);
        }
    }

    fn new_tcp_scribe(&self, host: &str, port: u16) -> Result<ConnectionHandle, NetError> {
        let mut pending = Vec::new();
        let result = {
            let mut state = self.inner.state.lock();
            let Some(listener) = state.listeners.get(&port) else {
                return Err(NetError::ConnectionRefused(host.to_string(), port));
            };
            let owner = listener.owner;
            let acceptor = listener.hdl;
            let listener_name = state
                .endpoints
                .get(&owner)
                .map(|e| e.name.clone())
                .unwrap_or_default();
            if host != "localhost" && host != listener_name {
                return Err(NetError::ConnectionRefused(host.to_string(), port));
            }
            let a = ConnectionHandle(self.inner.next_conn.fetch_add(1, Ordering::Relaxed));
            let b = ConnectionHandle(self.inner.next_conn.fetch_add(1, Ordering::Relaxed));
            state.conns.insert(
                a,
                ConnSide {
                    owner: self.id,
                    peer: b,
                    via_port: port,
                    inbound: Vec::new(),
                    policy: None,
                    armed: false,
                    wr: Vec::new(),
                },
            );
            state.conns.insert(
                b,
                ConnSide {
                    owner,
                    peer: a,
                    via_port: port,
                    inbound: Vec::new(),
                    policy: None,
                    armed: false,
                    wr: Vec::new(),
                },
            );
            if let Some(sender) = state.endpoints.get(&owner).and_then(|e| e.events.clone()) {
                pending.push((sender, NetEvent::NewConnection { acceptor, hdl: b }));
            }
            Ok(a)
        };
        Self::send_events(pending);
        result
    }

    fn new_tcp_doorman(&self, port: u16) -> Result<(AcceptHandle, u16), NetError> {
        let mut state = self.inner.state.lock();
        let port = if port == 0 {
            loop {
                let candidate = self.inner.next_port.fetch_add(1, Ordering::Relaxed) as u16;
                if !state.listeners.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            if state.listeners.contains_key(&port) {
                return Err(NetError::PortInUse(port));
            }
            port
        };
        let hdl = AcceptHandle(self.inner.next_accept.fetch_add(1, Ordering::Relaxed));
        state.listeners.insert(
            port,
            Listener {
                owner: self.id,
                hdl,
            },
        );
        Ok((hdl, port))
    }

    fn assign_tcp_scribe(&self, hdl: ConnectionHandle) -> Result<(), NetError> {
        let state = self.inner.state.lock();
        match state.conns.get(&hdl) {
            Some(side) if side.owner == self.id => Ok(()),
            _ => Err(NetError::InvalidHandle),
        }
    }

    fn assign_tcp_doorman(&self, hdl: AcceptHandle) -> Result<(), NetError> {
        let state = self.inner.state.lock();
        if state
            .listeners
            .values()
            .any(|l| l.hdl == hdl && l.owner == self.id)
        {
            Ok(())
        } else {
            Err(NetError::InvalidHandle)
        }
    }

    fn configure_read(&self, hdl: ConnectionHandle, policy: ReceivePolicy) {
        let mut pending = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if let Some(side) = state.conns.get_mut(&hdl) {
                side.policy = Some(policy);
                side.armed = true;
            }
            if let Some(event) = NetInner::pump(&mut state, hdl) {
                pending.push(event);
            }
        }
        Self::send_events(pending);
    }

    fn write(&self, hdl: ConnectionHandle, bytes: &[u8]) {
        let mut state = self.inner.state.lock();
        if let Some(side) = state.conns.get_mut(&hdl) {
            side.wr.extend_from_slice(bytes);
        }
    }

    fn flush(&self, hdl: ConnectionHandle) {
        let mut pending = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(side) = state.conns.get_mut(&hdl) else {
                return;
            };
            let bytes = std::mem::take(&mut side.wr);
            let peer = side.peer;
            if let Some(peer_side) = state.conns.get_mut(&peer) {
                peer_side.inbound.extend_from_slice(&bytes);
            }
            if let Some(event) = NetInner::pump(&mut state, peer) {
                pending.push(event);
            }
        }
        Self::send_events(pending);
    }

    fn close(&self, hdl: ConnectionHandle) {
        NetInner::close_pair(&self.inner, hdl, false);
    }

    fn close_doorman(&self, hdl: AcceptHandle) {
        let mut state = self.inner.state.lock();
        state.listeners.retain(|_, l| l.hdl != hdl);
    }

    fn local_endpoints(&self) -> Vec<(String, String)> {
        vec![("loopback".to_string(), self.name.clone())]
    }
}

/// A hand-driven endpoint for protocol-level tests: it exposes the
/// raw event stream and byte-level send, so tests can speak (or
/// deliberately misspeak) the wire protocol directly.
pub struct RawPeer {
    endpoint: LoopbackEndpoint,
    /// The raw event stream.
    pub events: Receiver<NetEvent>,
}

impl RawPeer {
    /// Open a listener.
    pub fn listen(&self, port: u16) -> Result<(AcceptHandle, u16), NetError> {
        self.endpoint.new_tcp_doorman(port)
    }

    /// Dial a listener.
    pub fn dial(&self, host: &str, port: u16) -> Result<ConnectionHandle, NetError> {
        self.endpoint.new_tcp_scribe(host, port)
    }

    /// Write and flush bytes.
    pub fn send(&self, hdl: ConnectionHandle, bytes: &[u8]) {
        self.endpoint.write(hdl, bytes);
        self.endpoint.flush(hdl);
    }

    /// Set the read policy.
    pub fn configure_read(&self, hdl: ConnectionHandle, policy: ReceivePolicy) {
        self.endpoint.configure_read(hdl, policy);
    }

    /// Close a connection.
    pub fn close(&self, hdl: ConnectionHandle) {
        self.endpoint.close(hdl);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_pipe_roundtrip_exactly() {
        let net = LoopbackNet::new();
        let a = net.raw_peer("a");
        let b = net.raw_peer("b");

        let (_, port) = b.listen(0).unwrap();
        let conn = a.dial("b", port).unwrap();
        let accepted = match b.events.recv_timeout(Duration::from_secs(1)).unwrap() {
            NetEvent::NewConnection { hdl, .. } => hdl,
            other => panic!("unexpected event: {:?}", other),
        };

        // Chunked delivery: exactly 4 bytes per read event.
        b.configure_read(accepted, ReceivePolicy::Exactly(4));
        a.send(conn, b"abcdefgh");
        match b.events.recv_timeout(Duration::from_secs(1)).unwrap() {
            NetEvent::NewData { buf, .. } => assert_eq!(buf, b"abcd"),
            other => panic!("unexpected event: {:?}", other),
        }
        // Nothing more until re-armed.
        assert!(b.events.recv_timeout(Duration::from_millis(50)).is_err());
        b.configure_read(accepted, ReceivePolicy::Exactly(4));
        match b.events.recv_timeout(Duration::from_secs(1)).unwrap() {
            NetEvent::NewData { buf, .. } => assert_eq!(buf, b"efgh"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_at_most_policy() {
        let net = LoopbackNet::new();
        let a = net.raw_peer("a");
        let b = net.raw_peer("b");
        let (_, port) = b.listen(0).unwrap();
        let conn = a.dial("localhost", port).unwrap();
        let accepted = match b.events.recv_timeout(Duration::from_secs(1)).unwrap() {
            NetEvent::NewConnection { hdl, .. } => hdl,
            other => panic!("unexpected event: {:?}", other),
        };
        a.send(conn, b"xyz");
        b.configure_read(accepted, ReceivePolicy::AtMost(100));
        match b.events.recv_timeout(Duration::from_secs(1)).unwrap() {
            NetEvent::NewData { buf, .. } => assert_eq!(buf, b"xyz"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_close_notifies_peer() {
        let net = LoopbackNet::new();
        let a = net.raw_peer("a");
        let b = net.raw_peer("b");
        let (_, port) = b.listen(0).unwrap();
        let conn = a.dial("b", port).unwrap();
        let accepted = match b.events.recv_timeout(Duration::from_secs(1)).unwrap() {
            NetEvent::NewConnection { hdl, .. } => hdl,
            other => panic!("unexpected event: {:?}", other),
        };
        a.close(conn);
        match b.events.recv_timeout(Duration::from_secs(1)).unwrap() {
            NetEvent::ConnectionClosed { hdl } => assert_eq!(hdl, accepted),
            other => panic!("unexpected event: {:?}", other),
        }
        // Closing is not echoed back to the initiator.
        assert!(a.events.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_dial_unknown_port_refused() {
        let net = LoopbackNet::new();
        let a = net.raw_peer("a");
        assert!(matches!(
            a.dial("b", 59999),
            Err(NetError::ConnectionRefused(_, _))
        ));
    }
}
