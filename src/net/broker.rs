/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The peering broker.
//!
//! The broker owns everything that ties local actor traffic to the
//! network: the per-connection handshake state machines, the routing
//! table, proxy lifecycles, and the request/response bookkeeping that
//! lets a lost peer bounce its pending requests. All of this state is
//! confined to one service thread; proxies, exit functors, and user
//! calls reach it by posting [`BrokerMsg`]s.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::actor::ActorCell;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::unbounded;
use parking_lot::Mutex;

use crate::actor::bounce_request;
use crate::data::BinaryDeserializer;
use crate::data::BinarySerializer;
use crate::data::CodecError;
use crate::data::Deserializer;
use crate::data::Serializer;
use crate::data::read_message;
use crate::data::resolve_addresses;
use crate::data::write_message;
use crate::message::Envelope;
use crate::message::ExitReason;
use crate::message::LinkMsg;
use crate::message::Message;
use crate::message::MessageId;
use crate::message::Value;
use crate::net::AcceptHandle;
use crate::net::ConnectionHandle;
use crate::net::Multiplexer;
use crate::net::NetError;
use crate::net::NetEvent;
use crate::net::ReceivePolicy;
use crate::net::proxy::ForwardingProxy;
use crate::net::proxy::ProxyNamespace;
use crate::net::wire::HEADER_SIZE;
use crate::net::wire::Header;
use crate::net::wire::Op;
use crate::net::wire::PROTOCOL_VERSION;
use crate::reference::ActorAddress;
use crate::reference::ActorId;
use crate::reference::NODE_ID_LEN;
use crate::reference::NodeId;
use crate::runtime::RuntimeCore;

/// Errors surfaced to users of the peering layer.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    /// A transport operation failed.
    #[error(transparent)]
    Net(#[from] NetError),

    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Our version.
        expected: u64,
        /// The peer's version.
        got: u64,
    },

    /// The published actor's interface does not cover what the caller
    /// expected.
    #[error("{0}")]
    TypeMismatch(String),

    /// The connection dropped before the handshake completed.
    #[error("disconnect during handshake")]
    Disconnected,

    /// The peer publishes no actor on the contacted port.
    #[error("no actor published at the remote endpoint")]
    NoPublishedActor,

    /// The actor to publish is no longer alive.
    #[error("actor is not alive")]
    InvalidActor,

    /// No publication matched the unpublish request.
    #[error("no matching published actor")]
    NotPublished,

    /// The broker has shut down.
    #[error("broker stopped")]
    Stopped,

    /// The runtime was built without a multiplexer.
    #[error("no multiplexer configured")]
    NoTransport,
}

/// A point-in-time view of the broker's tables, for diagnostics and
/// tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetStats {
    /// Live connection contexts.
    pub connections: usize,
    /// Nodes with at least one route.
    pub routes: usize,
    /// Live proxies.
    pub proxies: usize,
    /// Requests awaiting responses from remote nodes.
    pub pending_requests: usize,
    /// Open published ports.
    pub published_ports: usize,
}

/// Requests posted to the broker thread.
pub enum BrokerMsg {
    /// Forward a message from a proxy to its remote actor.
    Dispatch {
        /// Originating actor.
        sender: ActorAddress,
        /// The remote target.
        receiver: ActorAddress,
        /// The correlation tag.
        mid: MessageId,
        /// The payload.
        msg: Message,
    },
    /// Drop a namespace entry (posted by proxy exit functors).
    EraseProxy {
        /// The proxy's node.
        node: NodeId,
        /// The proxy's actor id.
        id: ActorId,
    },
    /// Tell a remote node that one of our actors exited (posted by
    /// exit functors installed at announce time).
    SendKillProxy {
        /// The node holding the proxy.
        node: NodeId,
        /// Our exited actor.
        id: ActorId,
        /// The wire form of the exit reason.
        reason: u32,
    },
    /// Publish an actor on a port.
    Publish {
        /// The actor to publish.
        addr: ActorAddress,
        /// Requested port; 0 picks one.
        port: u16,
        /// Completion.
        reply: Sender<Result<u16, BrokerError>>,
    },
    /// Remove a publication. `port` 0 removes all of the actor's
    /// publications.
    Unpublish {
        /// The published actor.
        addr: ActorAddress,
        /// The port to unbind, or 0 for all.
        port: u16,
        /// Completion; absent for exit-functor driven unpublish.
        reply: Option<Sender<Result<(), BrokerError>>>,
    },
    /// Connect to a remote node and resolve its published actor.
    Connect {
        /// Host to dial.
        host: String,
        /// Port to dial.
        port: u16,
        /// Interface names the published actor must cover.
        expected_ifs: BTreeSet<String>,
        /// Completion.
        reply: Sender<Result<ActorAddress, BrokerError>>,
    },
    /// Snapshot the broker tables.
    Stats {
        /// Completion.
        reply: Sender<NetStats>,
    },
    /// Tear the broker down.
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
    AwaitServerHandshake,
    AwaitClientHandshake,
    AwaitHeader,
    AwaitPayload,
    CloseConnection,
}

enum Handshake {
    /// We dialed on behalf of a `Connect` request.
    Client {
        expected_ifs: BTreeSet<String>,
        reply: Sender<Result<ActorAddress, BrokerError>>,
    },
    /// We dialed endpoints offered in a direct-connection request; on
    /// completion, acknowledge to `origin`.
    DirectUpgrade { origin: NodeId },
}

struct ConnectionContext {
    hdl: ConnectionHandle,
    state: ConnState,
    hdr: Option<Header>,
    remote_id: NodeId,
    handshake: Option<Handshake>,
}

impl ConnectionContext {
    fn new(hdl: ConnectionHandle, state: ConnState) -> Self {
        Self {
            hdl,
            state,
            hdr: None,
            remote_id: NodeId::INVALID,
            handshake: None,
        }
    }
}

/// A `(connection, next-hop)` pair used to reach some node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ConnectionInfo {
    hdl: ConnectionHandle,
    node: NodeId,
}

#[derive(Default)]
struct RouteEntry {
    default: Option<ConnectionInfo>,
    aux: BTreeSet<ConnectionInfo>,
}

struct PendingRequest {
    peer: NodeId,
    target: ActorAddress,
    sender: ActorAddress,
    mid: MessageId,
}

/// Handle to a running broker service thread.
pub struct BrokerHandle {
    tx: Sender<BrokerMsg>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

// How long user-facing round trips into the broker thread may take
// before the caller assumes it is gone.
const BROKER_CALL_TIMEOUT: Duration = Duration::from_secs(30);

impl BrokerHandle {
    fn call<T>(&self, msg: BrokerMsg, rx: Receiver<T>) -> Result<T, BrokerError> {
        self.tx.send(msg).map_err(|_| BrokerError::Stopped)?;
        rx.recv_timeout(BROKER_CALL_TIMEOUT)
            .map_err(|_| BrokerError::Stopped)
    }

    /// Publish `addr` on `port` (0 picks a free port); returns the
    /// bound port.
    pub fn publish(&self, addr: ActorAddress, port: u16) -> Result<u16, BrokerError> {
        let (reply, rx) = unbounded();
        self.call(BrokerMsg::Publish { addr, port, reply }, rx)?
    }

    /// Remove a publication.
    pub fn unpublish(&self, addr: ActorAddress, port: u16) -> Result<(), BrokerError> {
        let (reply, rx) = unbounded();
        self.call(
            BrokerMsg::Unpublish {
                addr,
                port,
                reply: Some(reply),
            },
            rx,
        )?
    }

    /// Connect to `host:port` and resolve the actor published there.
    pub fn remote_actor(
        &self,
        host: &str,
        port: u16,
        expected_ifs: BTreeSet<String>,
    ) -> Result<ActorAddress, BrokerError> {
        let (reply, rx) = unbounded();
        self.call(
            BrokerMsg::Connect {
                host: host.to_string(),
                port,
                expected_ifs,
                reply,
            },
            rx,
        )?
    }

    /// Snapshot the broker tables.
    pub fn stats(&self) -> Result<NetStats, BrokerError> {
        let (reply, rx) = unbounded();
        self.call(BrokerMsg::Stats { reply }, rx)
    }

    /// Stop the broker thread. Idempotent.
    pub fn shutdown(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = self.tx.send(BrokerMsg::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) struct Broker {
    core: Arc<RuntimeCore>,
    mux: Arc<dyn Multiplexer>,
    tx: Sender<BrokerMsg>,
    ctxs: HashMap<ConnectionHandle, ConnectionContext>,
    routes: HashMap<NodeId, RouteEntry>,
    blacklist: HashSet<(NodeId, ConnectionHandle)>,
    pending_requests: Vec<PendingRequest>,
    inflight_conn_reqs: HashSet<NodeId>,
    namespace: ProxyNamespace,
    acceptors: HashMap<AcceptHandle, (Option<ActorAddress>, u16)>,
    open_ports: HashMap<u16, AcceptHandle>,
    default_port: u16,
}

impl Broker {
    /// Start the broker service thread over the given transport.
    pub(crate) fn serve(core: Arc<RuntimeCore>, mux: Arc<dyn Multiplexer>) -> BrokerHandle {
        let (tx, ops) = unbounded::<BrokerMsg>();
        let (event_tx, events) = unbounded::<NetEvent>();
        mux.start(event_tx);

        let broker_tx = tx.clone();
        let thread = thread::Builder::new()
            .name("spindle-broker".to_string())
            .spawn(move || {
                let mut broker = Broker {
                    core,
                    mux,
                    tx: broker_tx,
                    ctxs: HashMap::new(),
                    routes: HashMap::new(),
                    blacklist: HashSet::new(),
                    pending_requests: Vec::new(),
                    inflight_conn_reqs: HashSet::new(),
                    namespace: ProxyNamespace::new(),
                    acceptors: HashMap::new(),
                    open_ports: HashMap::new(),
                    default_port: 0,
                };
                broker.open_default_port();
                broker.run(ops, events);
            })
            .expect("failed to spawn broker thread");
        BrokerHandle {
            tx,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// The default doorman accepts direct-connection upgrades even
    /// when nothing is published yet.
    fn open_default_port(&mut self) {
        match self.mux.new_tcp_doorman(0) {
            Ok((hdl, port)) => {
                self.acceptors.insert(hdl, (None, port));
                self.open_ports.insert(port, hdl);
                self.default_port = port;
                tracing::debug!(node = %self.core.node, port, "broker default port open");
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to open broker default port");
            }
        }
    }

    fn run(&mut self, ops: Receiver<BrokerMsg>, events: Receiver<NetEvent>) {
        loop {
            crossbeam_channel::select! {
                recv(ops) -> msg => match msg {
                    Ok(msg) => {
                        if !self.handle_msg(msg) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(events) -> event => match event {
                    Ok(event) => self.handle_event(event),
                    Err(_) => break,
                },
            }
        }
        self.on_exit();
    }

    fn on_exit(&mut self) {
        for proxy in self.namespace.clear() {
            proxy.kill(ExitReason::RemoteLinkUnreachable);
        }
        for (_, ctx) in self.ctxs.drain() {
            if let Some(Handshake::Client { reply, .. }) = ctx.handshake {
                let _ = reply.send(Err(BrokerError::Stopped));
            }
            self.mux.close(ctx.hdl);
        }
        for (hdl, _) in self.acceptors.drain() {
            self.mux.close_doorman(hdl);
        }
        self.open_ports.clear();
        self.routes.clear();
        self.blacklist.clear();
        self.pending_requests.clear();
        self.inflight_conn_reqs.clear();
    }

    fn handle_msg(&mut self, msg: BrokerMsg) -> bool {
        match msg {
            BrokerMsg::Dispatch {
                sender,
                receiver,
                mid,
                msg,
            } => {
                if self
                    .dispatch_message(&sender, &receiver, mid, &msg)
                    .is_none()
                    && mid.is_request()
                {
                    bounce_request(
                        &Envelope::new(sender, receiver, mid, msg),
                        ExitReason::RemoteLinkUnreachable,
                    );
                }
            }
            BrokerMsg::EraseProxy { node, id } => {
                self.namespace.erase(node, id);
            }
            BrokerMsg::SendKillProxy { node, id, reason } => {
                self.send_kill_proxy(node, id, reason);
            }
            BrokerMsg::Publish { addr, port, reply } => {
                let result = self.publish(addr, port);
                let _ = reply.send(result);
            }
            BrokerMsg::Unpublish { addr, port, reply } => {
                let result = self.unpublish(&addr, port);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            BrokerMsg::Connect {
                host,
                port,
                expected_ifs,
                reply,
            } => {
                self.connect(&host, port, expected_ifs, reply);
            }
            BrokerMsg::Stats { reply } => {
                let _ = reply.send(NetStats {
                    connections: self.ctxs.len(),
                    routes: self.routes.len(),
                    proxies: self.namespace.count(),
                    pending_requests: self.pending_requests.len(),
                    published_ports: self.open_ports.len(),
                });
            }
            BrokerMsg::Shutdown => return false,
        }
        true
    }

    fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::NewConnection { acceptor, hdl } => self.handle_new_connection(acceptor, hdl),
            NetEvent::NewData { hdl, buf } => self.handle_new_data(hdl, buf),
            NetEvent::ConnectionClosed { hdl } => self.handle_connection_closed(hdl),
            NetEvent::AcceptorClosed { hdl } => self.handle_acceptor_closed(hdl),
        }
    }

    // ---- connection lifecycle -------------------------------------

    fn handle_new_connection(&mut self, acceptor: AcceptHandle, hdl: ConnectionHandle) {
        if self.ctxs.contains_key(&hdl) {
            tracing::warn!(?hdl, "duplicate connection handle from multiplexer");
            return;
        }
        let published = self
            .acceptors
            .get(&acceptor)
            .and_then(|(addr, _)| addr.clone());
        let ctx = ConnectionContext::new(hdl, ConnState::AwaitClientHandshake);

        // Server handshake: published actor id (0 when the doorman has
        // none) and its interface signature set.
        let mut payload = BinarySerializer::new();
        let aid = published.as_ref().map_or(0, |a| a.id().0);
        payload.write_u32(aid);
        payload.begin_sequence(0);
        payload.end_sequence();
        let payload = payload.into_bytes();
        self.dispatch_frame(
            hdl,
            Header {
                source_node: self.core.node,
                dest_node: NodeId::INVALID,
                source_actor: ActorId(aid),
                dest_actor: ActorId::INVALID,
                payload_len: 0,
                operation: Op::ServerHandshake,
                operation_data: PROTOCOL_VERSION,
            },
            Some(&payload),
        );
        self.mux.configure_read(hdl, ReceivePolicy::Exactly(HEADER_SIZE));
        self.ctxs.insert(hdl, ctx);
    }

    fn handle_new_data(&mut self, hdl: ConnectionHandle, buf: Vec<u8>) {
        let Some(mut ctx) = self.ctxs.remove(&hdl) else {
            return;
        };
        let next = if ctx.state == ConnState::AwaitPayload {
            let hdr = ctx.hdr.expect("awaiting payload without a header");
            self.handle_frame(&mut ctx, hdr, Some(&buf))
        } else {
            match Header::decode(&buf) {
                Ok(hdr) if hdr.valid() => {
                    ctx.hdr = Some(hdr);
                    self.handle_frame(&mut ctx, hdr, None)
                }
                Ok(hdr) => {
                    tracing::info!(?hdr, "invalid header received");
                    ConnState::CloseConnection
                }
                Err(err) => {
                    tracing::info!(error = %err, "malformed header received");
                    ConnState::CloseConnection
                }
            }
        };
        tracing::trace!(?hdl, from = ?ctx.state, to = ?next, "connection transition");
        if next == ConnState::CloseConnection {
            self.close_connection(ctx);
            return;
        }
        ctx.state = next;
        let policy = match next {
            ConnState::AwaitPayload => {
                ReceivePolicy::Exactly(ctx.hdr.map_or(0, |h| h.payload_len as usize))
            }
            _ => ReceivePolicy::Exactly(HEADER_SIZE),
        };
        self.mux.configure_read(hdl, policy);
        self.ctxs.insert(hdl, ctx);
    }

    fn handle_connection_closed(&mut self, hdl: ConnectionHandle) {
        if let Some(ctx) = self.ctxs.remove(&hdl) {
            if let Some(Handshake::Client { reply, .. }) = ctx.handshake {
                let _ = reply.send(Err(BrokerError::Disconnected));
            }
        }
        self.purge_routes(hdl);
    }

    fn handle_acceptor_closed(&mut self, hdl: AcceptHandle) {
        if let Some((_, port)) = self.acceptors.remove(&hdl) {
            self.open_ports.remove(&port);
        }
    }

    /// Close a connection we decided to drop: fail any pending
    /// handshake, close the transport, and tear down routes that ran
    /// over it.
    fn close_connection(&mut self, mut ctx: ConnectionContext) {
        if let Some(Handshake::Client { reply, .. }) = ctx.handshake.take() {
            let _ = reply.send(Err(BrokerError::Disconnected));
        }
        self.mux.close(ctx.hdl);
        self.purge_routes(ctx.hdl);
    }

    /// Drop every route member using `hdl`. A node whose entry becomes
    /// empty loses its pending requests and proxies.
    fn purge_routes(&mut self, hdl: ConnectionHandle) {
        let mut lost = Vec::new();
        for (node, entry) in self.routes.iter_mut() {
            if entry.default.is_some_and(|info| info.hdl == hdl) {
                tracing::debug!(node = %node, "lost direct connection");
                entry.default = None;
            }
            entry.aux.retain(|info| info.hdl != hdl);
            if entry.default.is_none() && entry.aux.is_empty() {
                lost.push(*node);
            }
        }
        for node in lost {
            tracing::debug!(node = %node, "no more route");
            self.fail_pending_requests(node, ExitReason::RemoteLinkUnreachable);
            self.routes.remove(&node);
            self.inflight_conn_reqs.remove(&node);
            for proxy in self.namespace.erase_node(node) {
                proxy.kill(ExitReason::RemoteLinkUnreachable);
            }
        }
    }

    // ---- routing ---------------------------------------------------

    fn get_route(&self, dest: NodeId) -> Option<ConnectionInfo> {
        let entry = self.routes.get(&dest)?;
        entry.default.or_else(|| entry.aux.iter().next().copied())
    }

    /// Install the default route for `node` iff it has none yet.
    fn try_set_default_route(&mut self, node: NodeId, hdl: ConnectionHandle) -> bool {
        let entry = self.routes.entry(node).or_default();
        if entry.default.is_some() {
            return false;
        }
        tracing::debug!(node = %node, ?hdl, "new default route");
        entry.default = Some(ConnectionInfo { hdl, node });
        true
    }

    /// Learn an auxiliary route: `node` is reachable via the peer on
    /// `hdl`. Blacklisted pairs are not recorded.
    fn add_route(&mut self, node: NodeId, hdl: ConnectionHandle, via: NodeId) {
        if self.blacklist.contains(&(node, hdl)) {
            return;
        }
        self.core.hook.new_route_added(via, node);
        self.routes
            .entry(node)
            .or_default()
            .aux
            .insert(ConnectionInfo { hdl, node: via });
        tracing::debug!(node = %node, via = %via, "added auxiliary route");
    }

    fn fail_pending_requests(&mut self, node: NodeId, reason: ExitReason) {
        let (bounced, kept) = std::mem::take(&mut self.pending_requests)
            .into_iter()
            .partition::<Vec<_>, _>(|req| req.peer == node);
        self.pending_requests = kept;
        for req in bounced {
            bounce_request(
                &Envelope::new(req.sender, req.target, req.mid, Message::empty()),
                reason,
            );
        }
    }

    // ---- outbound dispatch ----------------------------------------

    fn dispatch_frame(&self, hdl: ConnectionHandle, mut hdr: Header, payload: Option<&[u8]>) {
        hdr.payload_len = payload.map_or(0, |p| p.len() as u32);
        self.mux.write(hdl, &hdr.encode());
        if let Some(payload) = payload {
            self.mux.write(hdl, payload);
        }
        self.mux.flush(hdl);
    }

    /// Route a frame toward `dst_node`, negotiating a direct
    /// connection first when the route is indirect. Returns the next
    /// hop actually used.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_routed(
        &mut self,
        op: Op,
        src_node: NodeId,
        src_actor: ActorId,
        dst_node: NodeId,
        dst_actor: ActorId,
        op_data: u64,
        payload: Option<&[u8]>,
    ) -> Option<NodeId> {
        let route = self.get_route(dst_node)?;
        if route.node != dst_node && !self.inflight_conn_reqs.contains(&dst_node) {
            tracing::debug!(node = %dst_node, via = %route.node,
                "indirect route, requesting direct connection");
            self.inflight_conn_reqs.insert(dst_node);
            let offer = self.encode_endpoint_offer(self.core.node, dst_node);
            self.dispatch_frame(
                route.hdl,
                Header {
                    source_node: self.core.node,
                    dest_node: dst_node,
                    source_actor: ActorId::INVALID,
                    dest_actor: ActorId::INVALID,
                    payload_len: 0,
                    operation: Op::DirectConnRequest,
                    operation_data: 1,
                },
                Some(&offer),
            );
        }
        self.dispatch_frame(
            route.hdl,
            Header {
                source_node: src_node,
                dest_node: dst_node,
                source_actor: src_actor,
                dest_actor: dst_actor,
                payload_len: 0,
                operation: op,
                operation_data: op_data,
            },
            payload,
        );
        Some(route.node)
    }

    /// Send a user message toward a remote actor, with pending-request
    /// bookkeeping. Returns the next hop used, or `None` when no route
    /// exists.
    fn dispatch_message(
        &mut self,
        from: &ActorAddress,
        to: &ActorAddress,
        mid: MessageId,
        msg: &Message,
    ) -> Option<NodeId> {
        if to.is_invalid() {
            return None;
        }
        if !from.is_invalid() && from.node() == self.core.node {
            // Register the sender so inbound responses can resolve it.
            if let Some(cell) = from.upgrade() {
                self.core.registry.put(from.id(), cell);
            }
        }
        let mut sink = BinarySerializer::new();
        write_message(&mut sink, msg);
        let payload = sink.into_bytes();
        let src_node = if from.is_invalid() {
            self.core.node
        } else {
            from.node()
        };
        let route = self.dispatch_routed(
            Op::DispatchMessage,
            src_node,
            from.id(),
            to.node(),
            to.id(),
            mid.raw(),
            Some(&payload),
        );
        match route {
            None => {
                self.core.hook.message_sending_failed(from, to, mid, msg);
                None
            }
            Some(node) => {
                if mid.is_request() {
                    self.pending_requests.push(PendingRequest {
                        peer: to.node(),
                        target: to.clone(),
                        sender: from.clone(),
                        mid,
                    });
                }
                self.core.hook.message_sent(from, node, to, mid, msg);
                Some(node)
            }
        }
    }

    fn send_kill_proxy(&mut self, node: NodeId, id: ActorId, reason: u32) {
        if self
            .dispatch_routed(
                Op::KillProxyInstance,
                self.core.node,
                id,
                node,
                ActorId::INVALID,
                u64::from(reason),
                None,
            )
            .is_none()
        {
            tracing::info!(node = %node, "kill proxy dropped, no route");
        }
    }

    fn dispatch_direct_conn_response(&mut self, dest: NodeId, ok: bool) {
        self.dispatch_routed(
            Op::DirectConnResponse,
            self.core.node,
            ActorId::INVALID,
            dest,
            ActorId::INVALID,
            ok as u64,
            None,
        );
    }

    /// The op-5 offer payload: whose endpoints these are, who should
    /// dial them, and where to dial.
    fn encode_endpoint_offer(&self, origin: NodeId, target: NodeId) -> Vec<u8> {
        let endpoints = self.mux.local_endpoints();
        let mut sink = BinarySerializer::new();
        sink.write_raw(origin.as_bytes());
        sink.write_raw(target.as_bytes());
        sink.write_u16(self.default_port);
        sink.write_u32(endpoints.len() as u32);
        for (family, address) in &endpoints {
            sink.write_str(family);
            sink.write_str(address);
        }
        sink.into_bytes()
    }

    // ---- inbound frames -------------------------------------------

    fn handle_frame(
        &mut self,
        ctx: &mut ConnectionContext,
        hdr: Header,
        payload: Option<&[u8]>,
    ) -> ConnState {
        if payload.is_none() && hdr.payload_len > 0 {
            return ConnState::AwaitPayload;
        }

        // Forward frames not addressed to us; an invalid dest marks a
        // server handshake, which is always for us.
        if !hdr.dest_node.is_invalid() && hdr.dest_node != self.core.node {
            let plen = payload.map_or(0, <[u8]>::len);
            match self.get_route(hdr.dest_node) {
                None => {
                    tracing::info!(dest = %hdr.dest_node, "cannot forward, no route");
                    self.core
                        .hook
                        .message_forwarding_failed(hdr.source_node, hdr.dest_node, plen);
                }
                Some(route) => {
                    self.mux.write(route.hdl, &hdr.encode());
                    if let Some(payload) = payload {
                        self.mux.write(route.hdl, payload);
                    }
                    self.mux.flush(route.hdl);
                    self.core
                        .hook
                        .message_forwarded(hdr.source_node, hdr.dest_node, plen);
                }
            }
            return ConnState::AwaitHeader;
        }

        match hdr.operation {
            Op::DispatchMessage => self.handle_dispatch(ctx, hdr, payload),
            Op::AnnounceProxyInstance => {
                self.handle_announce(hdr);
                ConnState::AwaitHeader
            }
            Op::KillProxyInstance => {
                self.handle_kill_proxy(hdr);
                ConnState::AwaitHeader
            }
            Op::ClientHandshake => self.handle_client_handshake(ctx, hdr),
            Op::ServerHandshake => self.handle_server_handshake(ctx, hdr, payload),
            Op::DirectConnRequest => self.handle_direct_conn_request(hdr, payload),
            Op::DirectConnResponse => {
                self.inflight_conn_reqs.remove(&hdr.source_node);
                if hdr.operation_data == 0 {
                    tracing::debug!(node = %hdr.source_node,
                        "peer could not establish a direct connection");
                }
                ConnState::AwaitHeader
            }
        }
    }

    fn handle_dispatch(
        &mut self,
        ctx: &mut ConnectionContext,
        hdr: Header,
        payload: Option<&[u8]>,
    ) -> ConnState {
        let Some(payload) = payload else {
            return ConnState::CloseConnection;
        };
        let mut src = BinaryDeserializer::new(payload);
        let msg = match read_message(&mut src, &self.core.types) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(error = %err, "failed to decode payload");
                return ConnState::CloseConnection;
            }
        };
        let cur = (ctx.hdl, ctx.remote_id);
        let msg = resolve_addresses(msg, |addr| self.resolve_addr(addr, cur));
        self.local_dispatch(&hdr, msg, cur);
        ConnState::AwaitHeader
    }

    /// Hand an inbound user message to its local target.
    fn local_dispatch(&mut self, hdr: &Header, msg: Message, cur: (ConnectionHandle, NodeId)) {
        let mid = MessageId::from_raw(hdr.operation_data);
        let src = if hdr.source_node.is_invalid() || hdr.source_actor.is_invalid() {
            ActorAddress::invalid()
        } else if hdr.source_node != self.core.node {
            self.get_or_put(hdr.source_node, hdr.source_actor, cur)
                .unwrap_or_else(|| ActorAddress::unresolved(hdr.source_node, hdr.source_actor))
        } else {
            match self.core.registry.get(hdr.source_actor) {
                Some(cell) => cell.address(),
                None => ActorAddress::unresolved(self.core.node, hdr.source_actor),
            }
        };
        let Some(dest) = self.core.registry.get(hdr.dest_actor) else {
            tracing::debug!(dest = %hdr.dest_actor, "message for unknown local actor");
            self.core.hook.invalid_message_received(
                hdr.source_node,
                &src,
                hdr.dest_actor.0,
                mid,
                &msg,
            );
            return;
        };
        let dest_addr = dest.address();

        // Self-addressed link signaling: a proxy on the sending node
        // tells us to track the link against our own proxy for the
        // carried peer. Only a message whose sender equals its
        // destination carries this meaning.
        if src == dest_addr && msg.len() == 1 {
            if let Some(Value::Link(link)) = msg.value(0) {
                let (peer, is_unlink) = match link {
                    LinkMsg::Link(addr) => (addr, false),
                    LinkMsg::Unlink(addr) => (addr, true),
                };
                if let Some(proxy) = self.namespace.get(peer.node(), peer.id()) {
                    if is_unlink {
                        proxy.local_unlink(&dest_addr);
                    } else {
                        proxy.local_link(dest_addr.clone());
                    }
                    return;
                }
                // No proxy for the peer here; deliver the message and
                // let the actor record the link itself.
            }
        }

        if mid.is_response() {
            let rid = mid.request_id();
            if let Some(pos) = self.pending_requests.iter().position(|req| {
                req.peer == hdr.source_node && req.sender == dest_addr && req.mid == rid
            }) {
                self.pending_requests.swap_remove(pos);
            }
        }
        self.core
            .hook
            .message_received(hdr.source_node, &src, &dest_addr, mid, &msg);
        dest.enqueue(Envelope::new(src, dest_addr, mid, msg));
    }

    fn handle_announce(&mut self, hdr: Header) {
        let nid = hdr.source_node;
        let aid = hdr.dest_actor;
        let (cell, reason) = self.core.registry.get_entry(aid);
        match cell {
            None => {
                let reason = if reason.is_exited() {
                    reason
                } else {
                    ExitReason::Normal
                };
                self.send_kill_proxy(nid, aid, reason.to_u32());
            }
            Some(cell) => {
                let tx = self.tx.clone();
                cell.attach_functor(Box::new(move |reason| {
                    let _ = tx.send(BrokerMsg::SendKillProxy {
                        node: nid,
                        id: aid,
                        reason: reason.to_u32(),
                    });
                }));
            }
        }
    }

    fn handle_kill_proxy(&mut self, hdr: Header) {
        match self.namespace.erase(hdr.source_node, hdr.source_actor) {
            Some(proxy) => proxy.kill(ExitReason::from_u32(hdr.operation_data as u32)),
            None => {
                tracing::debug!(node = %hdr.source_node, actor = %hdr.source_actor,
                    "kill for unknown proxy");
            }
        }
    }

    fn handle_client_handshake(&mut self, ctx: &mut ConnectionContext, hdr: Header) -> ConnState {
        if !ctx.remote_id.is_invalid() {
            tracing::info!("unexpected client handshake");
            return ConnState::CloseConnection;
        }
        ctx.remote_id = hdr.source_node;
        self.inflight_conn_reqs.remove(&ctx.remote_id);
        if ctx.remote_id == self.core.node {
            tracing::info!("dropping connection from self");
            return ConnState::CloseConnection;
        }
        if !self.try_set_default_route(ctx.remote_id, ctx.hdl) {
            tracing::info!(node = %ctx.remote_id,
                "duplicate incoming connection, dropping");
            return ConnState::CloseConnection;
        }
        self.core.hook.new_connection_established(ctx.remote_id);
        ConnState::AwaitHeader
    }

    fn handle_server_handshake(
        &mut self,
        ctx: &mut ConnectionContext,
        hdr: Header,
        payload: Option<&[u8]>,
    ) -> ConnState {
        let Some(handshake) = ctx.handshake.take() else {
            tracing::info!("unexpected server handshake");
            return ConnState::CloseConnection;
        };
        if hdr.operation_data != PROTOCOL_VERSION {
            tracing::info!(got = hdr.operation_data, "peer speaks a different version");
            if let Handshake::Client { reply, .. } = handshake {
                let _ = reply.send(Err(BrokerError::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    got: hdr.operation_data,
                }));
            }
            return ConnState::CloseConnection;
        }
        let parsed = payload.ok_or(CodecError::UnexpectedEof).and_then(|p| {
            let mut src = BinaryDeserializer::new(p);
            let aid = src.read_u32()?;
            let num_ifs = src.begin_sequence()?;
            let mut ifs = BTreeSet::new();
            for _ in 0..num_ifs {
                ifs.insert(src.read_str()?);
            }
            src.end_sequence()?;
            Ok((aid, ifs))
        });
        let (remote_aid, remote_ifs) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::info!(error = %err, "malformed server handshake");
                if let Handshake::Client { reply, .. } = handshake {
                    let _ = reply.send(Err(BrokerError::Disconnected));
                }
                return ConnState::CloseConnection;
            }
        };
        let nid = hdr.source_node;
        ctx.remote_id = nid;

        match handshake {
            Handshake::Client {
                expected_ifs,
                reply,
            } => {
                if !expected_ifs.is_subset(&remote_ifs) {
                    let _ = reply.send(Err(BrokerError::TypeMismatch(describe_type_mismatch(
                        &expected_ifs,
                        &remote_ifs,
                    ))));
                    return ConnState::CloseConnection;
                }
                if nid == self.core.node {
                    tracing::info!("connected to self, dropping connection");
                    let result = self
                        .core
                        .registry
                        .get(ActorId(remote_aid))
                        .map(|cell| cell.address())
                        .ok_or(BrokerError::NoPublishedActor);
                    let _ = reply.send(result);
                    return ConnState::CloseConnection;
                }
                if !self.try_set_default_route(nid, ctx.hdl) {
                    // A connection to this node already exists; resolve
                    // through it and drop this one.
                    tracing::info!(node = %nid, "reusing existing connection");
                    let result = if remote_aid == 0 {
                        Err(BrokerError::NoPublishedActor)
                    } else {
                        self.get_or_put(nid, ActorId(remote_aid), (ctx.hdl, nid))
                            .ok_or(BrokerError::NoPublishedActor)
                    };
                    let _ = reply.send(result);
                    return ConnState::CloseConnection;
                }
                self.finish_handshake(ctx.hdl, nid);
                let result = if remote_aid == 0 {
                    Err(BrokerError::NoPublishedActor)
                } else {
                    self.get_or_put(nid, ActorId(remote_aid), (ctx.hdl, nid))
                        .ok_or(BrokerError::NoPublishedActor)
                };
                let _ = reply.send(result);
                self.core.hook.new_connection_established(nid);
                ConnState::AwaitHeader
            }
            Handshake::DirectUpgrade { origin } => {
                if nid == self.core.node {
                    return ConnState::CloseConnection;
                }
                if !self.try_set_default_route(nid, ctx.hdl) {
                    // Already connected some other way; acknowledge and
                    // drop the extra connection.
                    self.dispatch_direct_conn_response(origin, true);
                    return ConnState::CloseConnection;
                }
                self.finish_handshake(ctx.hdl, nid);
                self.dispatch_direct_conn_response(origin, true);
                self.core.hook.new_connection_established(nid);
                ConnState::AwaitHeader
            }
        }
    }

    fn finish_handshake(&mut self, hdl: ConnectionHandle, nid: NodeId) {
        self.dispatch_frame(
            hdl,
            Header {
                source_node: self.core.node,
                dest_node: nid,
                source_actor: ActorId::INVALID,
                dest_actor: ActorId::INVALID,
                payload_len: 0,
                operation: Op::ClientHandshake,
                operation_data: 0,
            },
            None,
        );
    }

    fn handle_direct_conn_request(&mut self, hdr: Header, payload: Option<&[u8]>) -> ConnState {
        let Some(payload) = payload else {
            return ConnState::CloseConnection;
        };
        let parsed = (|| -> Result<_, CodecError> {
            let mut src = BinaryDeserializer::new(payload);
            let origin = read_node(&mut src)?;
            let target = read_node(&mut src)?;
            let mut port = 0u16;
            let mut endpoints = Vec::new();
            if hdr.operation_data == 1 {
                port = src.read_u16()?;
                let n = src.read_u32()?;
                for _ in 0..n {
                    let family = src.read_str()?;
                    let address = src.read_str()?;
                    endpoints.push((family, address));
                }
            }
            Ok((origin, target, port, endpoints))
        })();
        let (origin, target, port, endpoints) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::info!(error = %err, "malformed direct connection request");
                return ConnState::CloseConnection;
            }
        };

        if hdr.operation_data == 0 {
            // "Please offer your listening endpoints": advertise
            // ourselves to the carried target.
            let offer = self.encode_endpoint_offer(self.core.node, target);
            self.dispatch_routed(
                Op::DirectConnRequest,
                self.core.node,
                ActorId::INVALID,
                target,
                ActorId::INVALID,
                1,
                Some(&offer),
            );
        } else if target != self.core.node {
            tracing::error!(target = %target, "wrong target in direct connection request");
        } else if self
            .get_route(origin)
            .is_some_and(|route| route.node == origin)
        {
            // Already directly connected; nothing to upgrade.
            self.dispatch_direct_conn_response(origin, true);
        } else {
            let mut connected = false;
            for (family, address) in &endpoints {
                match self.mux.new_tcp_scribe(address, port) {
                    Ok(hdl) => {
                        let _ = self.mux.assign_tcp_scribe(hdl);
                        let mut new_ctx =
                            ConnectionContext::new(hdl, ConnState::AwaitServerHandshake);
                        new_ctx.handshake = Some(Handshake::DirectUpgrade { origin });
                        self.mux
                            .configure_read(hdl, ReceivePolicy::Exactly(HEADER_SIZE));
                        self.ctxs.insert(hdl, new_ctx);
                        connected = true;
                        break;
                    }
                    Err(err) => {
                        tracing::debug!(family, address, error = %err,
                            "direct connection attempt failed");
                    }
                }
            }
            if !connected {
                self.dispatch_direct_conn_response(origin, false);
            }
        }
        ConnState::AwaitHeader
    }

    // ---- proxies ---------------------------------------------------

    /// Resolve a deserialized address against the registry or the
    /// proxy namespace.
    fn resolve_addr(
        &mut self,
        addr: &ActorAddress,
        cur: (ConnectionHandle, NodeId),
    ) -> ActorAddress {
        if addr.is_invalid() || addr.id().is_invalid() {
            return addr.clone();
        }
        if addr.node() == self.core.node {
            return match self.core.registry.get(addr.id()) {
                Some(cell) => cell.address(),
                None => addr.clone(),
            };
        }
        self.get_or_put(addr.node(), addr.id(), cur)
            .unwrap_or_else(|| addr.clone())
    }

    fn get_or_put(
        &mut self,
        nid: NodeId,
        aid: ActorId,
        cur: (ConnectionHandle, NodeId),
    ) -> Option<ActorAddress> {
        if let Some(proxy) = self.namespace.get(nid, aid) {
            return Some(proxy.address());
        }
        self.make_proxy(nid, aid, cur)
    }

    /// Create a proxy for `(nid, aid)` and announce it to the hosting
    /// node. A handle received from a peer that is not the hosting
    /// node implies the peer has a route there, which we learn as an
    /// auxiliary route first.
    fn make_proxy(
        &mut self,
        nid: NodeId,
        aid: ActorId,
        cur: (ConnectionHandle, NodeId),
    ) -> Option<ActorAddress> {
        debug_assert!(nid != self.core.node);
        debug_assert!(!aid.is_invalid());
        if nid != cur.1 && !cur.1.is_invalid() {
            self.add_route(nid, cur.0, cur.1);
        }
        let Some(route) = self.get_route(nid) else {
            tracing::info!(node = %nid,
                "cannot create proxy for an unroutable node");
            return None;
        };
        let proxy = ForwardingProxy::new(nid, aid, self.tx.clone());
        let tx = self.tx.clone();
        proxy.attach_functor(Box::new(move |_| {
            let _ = tx.send(BrokerMsg::EraseProxy { node: nid, id: aid });
        }));
        self.dispatch_frame(
            route.hdl,
            Header {
                source_node: self.core.node,
                dest_node: nid,
                source_actor: ActorId::INVALID,
                dest_actor: aid,
                payload_len: 0,
                operation: Op::AnnounceProxyInstance,
                operation_data: 0,
            },
            None,
        );
        let addr = proxy.address();
        self.core.hook.new_remote_actor(&addr);
        self.namespace.insert(proxy);
        Some(addr)
    }

    // ---- publication ----------------------------------------------

    fn publish(&mut self, addr: ActorAddress, port: u16) -> Result<u16, BrokerError> {
        let cell = addr.upgrade().ok_or(BrokerError::InvalidActor)?;
        let (accept, actual) = self.mux.new_tcp_doorman(port)?;
        let _ = self.mux.assign_tcp_doorman(accept);
        self.acceptors.insert(accept, (Some(addr.clone()), actual));
        self.open_ports.insert(actual, accept);
        if addr.node() == self.core.node {
            self.core.registry.put(addr.id(), cell.clone());
        }
        let tx = self.tx.clone();
        let published = addr.clone();
        cell.attach_functor(Box::new(move |_| {
            let _ = tx.send(BrokerMsg::Unpublish {
                addr: published,
                port: actual,
                reply: None,
            });
        }));
        self.core.hook.actor_published(&addr, actual);
        tracing::debug!(actor = %addr, port = actual, "actor published");
        Ok(actual)
    }

    fn unpublish(&mut self, addr: &ActorAddress, port: u16) -> Result<(), BrokerError> {
        if port != 0 {
            let accept = *self.open_ports.get(&port).ok_or(BrokerError::NotPublished)?;
            match self.acceptors.get(&accept) {
                Some((Some(published), _)) if published == addr => {}
                _ => return Err(BrokerError::NotPublished),
            }
            self.mux.close_doorman(accept);
            self.acceptors.remove(&accept);
            self.open_ports.remove(&port);
            return Ok(());
        }
        let matching: Vec<_> = self
            .acceptors
            .iter()
            .filter(|(_, (published, _))| published.as_ref() == Some(addr))
            .map(|(accept, (_, port))| (*accept, *port))
            .collect();
        if matching.is_empty() {
            return Err(BrokerError::NotPublished);
        }
        for (accept, port) in matching {
            self.mux.close_doorman(accept);
            self.acceptors.remove(&accept);
            self.open_ports.remove(&port);
        }
        Ok(())
    }

    fn connect(
        &mut self,
        host: &str,
        port: u16,
        expected_ifs: BTreeSet<String>,
        reply: Sender<Result<ActorAddress, BrokerError>>,
    ) {
        match self.mux.new_tcp_scribe(host, port) {
            Err(err) => {
                let _ = reply.send(Err(err.into()));
            }
            Ok(hdl) => {
                let _ = self.mux.assign_tcp_scribe(hdl);
                let mut ctx = ConnectionContext::new(hdl, ConnState::AwaitServerHandshake);
                ctx.handshake = Some(Handshake::Client {
                    expected_ifs,
                    reply,
                });
                self.mux
                    .configure_read(hdl, ReceivePolicy::Exactly(HEADER_SIZE));
                self.ctxs.insert(hdl, ctx);
            }
        }
    }
}

fn read_node<D: Deserializer + ?Sized>(src: &mut D) -> Result<NodeId, CodecError> {
    let bytes = src.read_raw(NODE_ID_LEN)?;
    let mut raw = [0u8; NODE_ID_LEN];
    raw.copy_from_slice(&bytes);
    Ok(NodeId::from_bytes(raw))
}

fn describe_ifs(ifs: &BTreeSet<String>) -> String {
    if ifs.is_empty() {
        "actor".to_string()
    } else {
        let mut out = String::from("typed_actor<");
        for (i, name) in ifs.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(name);
        }
        out.push('>');
        out
    }
}

fn describe_type_mismatch(expected: &BTreeSet<String>, remote: &BTreeSet<String>) -> String {
    if expected.is_empty() {
        format!(
            "expected remote actor to be a dynamically typed actor \
             but found a strongly typed actor of type {}",
            describe_ifs(remote)
        )
    } else if remote.is_empty() {
        format!(
            "expected remote actor to be a strongly typed actor of type {} \
             but found a dynamically typed actor",
            describe_ifs(expected)
        )
    } else {
        format!(
            "expected remote actor to be a strongly typed actor of type {} \
             but found a strongly typed actor of type {}",
            describe_ifs(expected),
            describe_ifs(remote)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SyncExitedMsg;
    use crate::net::loopback::LoopbackNet;
    use crate::runtime::Config;
    use crate::runtime::Runtime;

    fn nid(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; NODE_ID_LEN])
    }

    /// A broker with its tables empty, driven directly instead of
    /// through its service thread. The runtime keeps the shared core
    /// alive.
    fn test_broker() -> (Runtime, Broker, Receiver<BrokerMsg>) {
        let rt = Runtime::new(Config::default().workers(1));
        let net = LoopbackNet::new();
        let (tx, ops) = unbounded();
        let broker = Broker {
            core: Arc::clone(rt.core()),
            mux: net.endpoint("test"),
            tx,
            ctxs: HashMap::new(),
            routes: HashMap::new(),
            blacklist: HashSet::new(),
            pending_requests: Vec::new(),
            inflight_conn_reqs: HashSet::new(),
            namespace: ProxyNamespace::new(),
            acceptors: HashMap::new(),
            open_ports: HashMap::new(),
            default_port: 0,
        };
        (rt, broker, ops)
    }

    #[test]
    fn test_blacklist_blocks_aux_route_insertion() {
        let (_rt, mut broker, _ops) = test_broker();
        let node = nid(1);
        let via = nid(2);
        let banned = ConnectionHandle(7);

        broker.blacklist.insert((node, banned));
        broker.add_route(node, banned, via);
        assert!(broker.get_route(node).is_none());

        // Advisory only: the same node through another handle is fine.
        let other = ConnectionHandle(8);
        broker.add_route(node, other, via);
        let route = broker.get_route(node).unwrap();
        assert_eq!(route.hdl, other);
        assert_eq!(route.node, via);
    }

    #[test]
    fn test_default_route_election() {
        let (_rt, mut broker, _ops) = test_broker();
        let node = nid(1);
        let first = ConnectionHandle(1);
        let second = ConnectionHandle(2);

        assert!(broker.try_set_default_route(node, first));
        // Subsequent peers for the same node are not elected.
        assert!(!broker.try_set_default_route(node, second));
        assert_eq!(broker.get_route(node).unwrap().hdl, first);
    }

    #[test]
    fn test_route_falls_back_to_aux_and_entry_dies_when_empty() {
        let (_rt, mut broker, _ops) = test_broker();
        let node = nid(1);
        let via = nid(2);
        let direct = ConnectionHandle(1);
        let relay = ConnectionHandle(2);

        assert!(broker.try_set_default_route(node, direct));
        broker.add_route(node, relay, via);
        assert_eq!(broker.get_route(node).unwrap().hdl, direct);

        // Losing the direct connection leaves the relay route.
        broker.purge_routes(direct);
        let route = broker.get_route(node).unwrap();
        assert_eq!(route.hdl, relay);
        assert_eq!(route.node, via);

        // Losing the relay too deletes the entry outright.
        broker.purge_routes(relay);
        assert!(broker.get_route(node).is_none());
        assert!(broker.routes.is_empty());
    }

    #[test]
    fn test_purge_kills_proxies_and_bounces_pending_requests() {
        let (_rt, mut broker, _ops) = test_broker();
        let lost_node = nid(1);
        let hdl = ConnectionHandle(1);
        assert!(broker.try_set_default_route(lost_node, hdl));

        // A proxy for an actor on the lost node.
        let proxy = ForwardingProxy::new(lost_node, ActorId(4), broker.tx.clone());
        broker.namespace.insert(Arc::clone(&proxy));

        // A pending request from a requester shadowed by a proxy on a
        // third node, so its bounce is observable as broker traffic.
        let (requester_tx, requester_rx) = unbounded();
        let requester = ForwardingProxy::new(nid(9), ActorId(5), requester_tx);
        let target = ActorAddress::unresolved(lost_node, ActorId(4));
        let mid = MessageId::make_request(3);
        broker.pending_requests.push(PendingRequest {
            peer: lost_node,
            target: target.clone(),
            sender: requester.address(),
            mid,
        });

        broker.purge_routes(hdl);

        assert!(broker.routes.is_empty());
        assert_eq!(broker.namespace.count(), 0);
        assert_eq!(proxy.exit_reason(), ExitReason::RemoteLinkUnreachable);
        assert!(broker.pending_requests.is_empty());

        match requester_rx.try_recv().unwrap() {
            BrokerMsg::Dispatch { receiver, mid: got, msg, .. } => {
                assert_eq!(receiver, requester.address());
                assert_eq!(got, mid.response_id());
                let bounced = msg.get::<&SyncExitedMsg>(0).unwrap();
                assert_eq!(bounced.source, target);
                assert_eq!(bounced.reason, ExitReason::RemoteLinkUnreachable);
            }
            _ => panic!("expected a bounced response"),
        }
    }

    #[test]
    fn test_purge_of_unrelated_handle_keeps_state() {
        let (_rt, mut broker, _ops) = test_broker();
        let node = nid(1);
        assert!(broker.try_set_default_route(node, ConnectionHandle(1)));
        let proxy = ForwardingProxy::new(node, ActorId(4), broker.tx.clone());
        broker.namespace.insert(proxy);

        broker.purge_routes(ConnectionHandle(99));
        assert!(broker.get_route(node).is_some());
        assert_eq!(broker.namespace.count(), 1);
    }
}
